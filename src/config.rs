use std::time::Duration;
use anyhow::bail;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Time budget within which some traffic (a heartbeat or a real frame) must arrive from the
    ///  peer. The looper sends its own heartbeats whenever it has not sent anything for a quarter
    ///  of this interval, and reads with a quarter-interval timeout so it can do that promptly.
    pub heartbeat_interval: Duration,

    /// Upper bound for the payload of a single frame, including a trailing response id. Frames
    ///  announcing a bigger payload are treated as protocol corruption.
    pub max_packet_size: usize,

    /// Response ids are `1..=response_id_limit`, `0` meaning 'no reply wanted'. Limits up to 255
    ///  are encoded as a single byte on the wire, bigger limits as two bytes, so both peers must
    ///  be configured with a limit from the same class.
    pub response_id_limit: u16,
    /// Request ids are `0..request_id_limit`. They are local to the receiving peer and never
    ///  go on the wire.
    pub request_id_limit: u32,

    pub stream_limit: usize,

    /// Bounds the creation of an auxiliary connection, and on the receiving side also the wait
    ///  for the peer's handshake token. Defaults to an eighth of the heartbeat interval.
    pub make_stream_timeout: Option<Duration>,
    /// Bounds the initiator's wait for the peer's handshake token on a new auxiliary connection.
    ///  Defaults to a fifth of the make-stream timeout.
    pub connect_stream_timeout: Option<Duration>,

    pub handshake_timeout: Duration,
}

impl BridgeConfig {
    pub fn new() -> BridgeConfig {
        BridgeConfig {
            heartbeat_interval: Duration::from_millis(1000),
            max_packet_size: u16::MAX as usize,
            response_id_limit: 255,
            request_id_limit: 1024,
            stream_limit: 1024,
            make_stream_timeout: None,
            connect_stream_timeout: None,
            handshake_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> BridgeConfig {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must not be zero");
        }
        if self.heartbeat_interval.as_millis() > u16::MAX as u128 {
            bail!("heartbeat interval must fit into 16 bits of milliseconds for the session handshake");
        }
        if self.max_packet_size <= self.response_id_len() || self.max_packet_size > u16::MAX as usize {
            bail!("max packet size must be between {} and {}", self.response_id_len() + 1, u16::MAX);
        }
        if self.response_id_limit == 0 {
            bail!("response id limit must be at least 1");
        }
        if self.request_id_limit == 0 || self.request_id_limit > u16::MAX as u32 + 1 {
            bail!("request id limit must be between 1 and {}", u16::MAX as u32 + 1);
        }
        if self.stream_limit == 0 {
            bail!("stream limit must be at least 1");
        }
        if u32::try_from(self.stream_limit - 1).is_err() {
            bail!("stream indices must fit into the 4 byte stream handshake token");
        }
        // peer-initiated stream creation runs on the looper, which neither reads nor sends heartbeats meanwhile
        if 2 * self.make_stream_timeout() >= self.heartbeat_interval - self.read_timeout() {
            bail!("twice the make-stream timeout ({:?}) must be shorter than the heartbeat interval minus the read timeout ({:?})",
                self.make_stream_timeout(), self.heartbeat_interval - self.read_timeout());
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        self.heartbeat_interval / 4
    }

    pub fn make_stream_timeout(&self) -> Duration {
        self.make_stream_timeout
            .unwrap_or(self.heartbeat_interval / 8)
    }

    pub fn connect_stream_timeout(&self) -> Duration {
        self.connect_stream_timeout
            .unwrap_or(self.make_stream_timeout() / 5)
    }

    /// number of bytes of the trailing response id in request and response frames
    pub fn response_id_len(&self) -> usize {
        if self.response_id_limit <= u8::MAX as u16 { 1 } else { 2 }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig::new()
    }
}
