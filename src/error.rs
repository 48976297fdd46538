use num_enum::IntoPrimitive;
use thiserror::Error;

/// Errors returned by request and stream operations. The numeric codes (see `i8::from`) are
///  stable and match what peers and logs have historically used.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive)]
#[repr(i8)]
pub enum BridgeError {
    #[error("bridge is not alive")]
    NotAlive = -1,
    #[error("timed out establishing a connection")]
    ConnectionTimeout = -3,
    #[error("id is out of range")]
    InvalidId = -6,
    #[error("limit reached")]
    LimitReached = -7,
    #[error("data size exceeds the maximum packet size")]
    DataSizeExceeded = -8,
    #[error("failed to create an auxiliary stream")]
    CreationFailed = -9,
    #[error("auxiliary stream handshake failed")]
    ConnectionFailed = -10,
    #[error("stream is unavailable")]
    StreamUnavailable = -11,
    #[error("no such id")]
    NotFound = -12,
    #[error("data has not arrived yet")]
    NotArrived = -13,
    #[error("stream closed")]
    StreamClosed = -31,
}

/// Terminal result of a bridge looper.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive)]
#[repr(i8)]
pub enum StopReason {
    StoppedBySelf = 0,
    StoppedByPeer = 1,
    AlreadyAlive = -2,
    NetworkTimeout = -4,
    UnintendedSignal = -5,
    UnreliableConnection = -14,
    StreamClosed = -31,
    UnexpectedException = -32,
}

impl StopReason {
    pub fn is_error(&self) -> bool {
        !matches!(self, StopReason::StoppedBySelf | StopReason::StoppedByPeer)
    }

    /// Maps an error that escaped the looper (or one of its signal handlers) to a stop reason
    pub(crate) fn classify(e: &anyhow::Error) -> StopReason {
        if e.downcast_ref::<ProtocolViolation>().is_some() {
            StopReason::UnintendedSignal
        }
        else if e.downcast_ref::<std::io::Error>().is_some() {
            StopReason::StreamClosed
        }
        else {
            StopReason::UnexpectedException
        }
    }
}

/// Raised by signal handlers for frames that are well-formed on the framing level but
///  malformed for the handler, e.g. a request frame too short to hold its response id.
#[derive(Error, Debug)]
#[error("protocol violation: {0}")]
pub struct ProtocolViolation(pub String);
