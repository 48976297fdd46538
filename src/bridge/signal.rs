use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The first byte of every frame. Extension handlers may claim codes that are not listed here.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Signal {
    Start = 0,
    Beat = 1,
    RequestByte = 2,
    RequestShort = 3,
    ResponseByte = 4,
    ResponseShort = 5,
    MakeStream = 6,
    Stop = 0xFF,
}

impl Signal {
    /// signals without payload that are handled by the looper itself
    pub fn is_control(&self) -> bool {
        matches!(self, Signal::Start | Signal::Beat | Signal::Stop)
    }
}

/// An extension handler's answer to 'how many payload bytes follow this signal?'
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PayloadSize {
    Fixed(usize),
    /// a single length byte follows the signal
    BytePrefixed,
    /// a big-endian u16 length follows the signal
    ShortPrefixed,
    /// the handler does not understand the signal
    Invalid,
}
