use bytes::BufMut;
use crate::bridge::signal::{PayloadSize, Signal};
use crate::error::ProtocolViolation;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Writes the header of a length-prefixed frame, picking the smallest length prefix that fits
///  `body_len`. The caller is responsible for `body_len` not exceeding `u16::MAX`.
pub fn put_sized_header(buf: &mut impl BufMut, byte_signal: Signal, short_signal: Signal, body_len: usize) {
    if body_len <= u8::MAX as usize {
        buf.put_u8(byte_signal.into());
        buf.put_u8(body_len.prechecked_cast());
    }
    else {
        buf.put_u8(short_signal.into());
        buf.put_u16(body_len.prechecked_cast());
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ReadState {
    AwaitSignal,
    AwaitSize { signal: u8, prefix_len: usize, filled: usize },
    AwaitPayload { signal: u8, size: usize, filled: usize },
    Dispatch { signal: u8, size: usize },
}

/// Incremental frame decoder. It hands out the buffer region the next read should go to and
///  keeps track of partially received prefixes and payloads, so a read that times out part way
///  through a frame loses nothing.
pub struct FrameReader {
    state: ReadState,
    signal_buf: [u8; 1],
    prefix_buf: [u8; 2],
    payload_buf: Vec<u8>,
}

impl FrameReader {
    pub fn new(max_packet_size: usize) -> FrameReader {
        FrameReader {
            state: ReadState::AwaitSignal,
            signal_buf: [0],
            prefix_buf: [0; 2],
            payload_buf: vec![0; max_packet_size],
        }
    }

    /// The region to read into next, or `None` if a complete frame is waiting for dispatch
    pub fn read_target(&mut self) -> Option<&mut [u8]> {
        match self.state {
            ReadState::AwaitSignal => Some(&mut self.signal_buf),
            ReadState::AwaitSize { prefix_len, filled, .. } => Some(&mut self.prefix_buf[filled..prefix_len]),
            ReadState::AwaitPayload { size, filled, .. } => Some(&mut self.payload_buf[filled..size]),
            ReadState::Dispatch { .. } => None,
        }
    }

    /// Records that `n` bytes were read into the most recent `read_target`. `payload_size` is
    ///  consulted for signals that are not handled by the looper itself.
    pub fn on_bytes_read(&mut self, n: usize, payload_size: impl FnOnce(u8) -> PayloadSize) -> Result<(), ProtocolViolation> {
        match self.state {
            ReadState::AwaitSignal => {
                if n > 0 {
                    self.on_signal(self.signal_buf[0], payload_size)?;
                }
            }
            ReadState::AwaitSize { signal, prefix_len, filled } => {
                let filled = filled + n;
                if filled < prefix_len {
                    self.state = ReadState::AwaitSize { signal, prefix_len, filled };
                }
                else {
                    let size: usize = if prefix_len == 1 {
                        self.prefix_buf[0].into()
                    }
                    else {
                        u16::from_be_bytes(self.prefix_buf).safe_cast()
                    };
                    self.expect_payload(signal, size)?;
                }
            }
            ReadState::AwaitPayload { signal, size, filled } => {
                let filled = filled + n;
                self.state = if filled < size {
                    ReadState::AwaitPayload { signal, size, filled }
                }
                else {
                    ReadState::Dispatch { signal, size }
                };
            }
            ReadState::Dispatch { .. } => {}
        }
        Ok(())
    }

    fn on_signal(&mut self, signal: u8, payload_size: impl FnOnce(u8) -> PayloadSize) -> Result<(), ProtocolViolation> {
        match Signal::try_from(signal) {
            Ok(Signal::Beat) | Ok(Signal::Stop) => {
                self.state = ReadState::Dispatch { signal, size: 0 };
                return Ok(());
            }
            Ok(Signal::Start) => return Err(ProtocolViolation("start signal on a running bridge".to_string())),
            _ => {}
        }

        match payload_size(signal) {
            PayloadSize::Fixed(size) => self.expect_payload(signal, size),
            PayloadSize::BytePrefixed => {
                self.state = ReadState::AwaitSize { signal, prefix_len: 1, filled: 0 };
                Ok(())
            }
            PayloadSize::ShortPrefixed => {
                self.state = ReadState::AwaitSize { signal, prefix_len: 2, filled: 0 };
                Ok(())
            }
            PayloadSize::Invalid => Err(ProtocolViolation(format!("unintended signal {}", signal))),
        }
    }

    fn expect_payload(&mut self, signal: u8, size: usize) -> Result<(), ProtocolViolation> {
        if size > self.payload_buf.len() {
            return Err(ProtocolViolation(format!("signal {} announces {} bytes, more than the maximum packet size of {}", signal, size, self.payload_buf.len())));
        }
        self.state = if size == 0 {
            ReadState::Dispatch { signal, size }
        }
        else {
            ReadState::AwaitPayload { signal, size, filled: 0 }
        };
        Ok(())
    }

    /// signal and payload of a completely received frame
    pub fn complete_frame(&self) -> Option<(u8, &[u8])> {
        match self.state {
            ReadState::Dispatch { signal, size } => Some((signal, &self.payload_buf[..size])),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.state = ReadState::AwaitSignal;
    }
}
