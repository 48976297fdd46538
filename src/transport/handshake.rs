use std::time::{Duration, SystemTime, UNIX_EPOCH};
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;
use crate::config::BridgeConfig;
use crate::transport::duplex::Duplex;

/// first byte of both handshake messages
pub const IDENTIFICATION: u8 = 45;

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Role {
    Initiator = 0,
    Acceptor = 1,
}

/// sent by the initiator right after connecting
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Hello {
    pub heartbeat_interval_millis: u16,
    pub timestamp_millis: u64,
}
impl Hello {
    pub const SERIALIZED_LEN: usize = 12;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(IDENTIFICATION);
        buf.put_u8(Role::Initiator.into());
        buf.put_u16(self.heartbeat_interval_millis);
        buf.put_u64(self.timestamp_millis);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("handshake message too short: {} bytes", buf.remaining());
        }
        check_header(buf, Role::Initiator)?;
        Ok(Hello {
            heartbeat_interval_millis: buf.get_u16(),
            timestamp_millis: buf.get_u64(),
        })
    }
}

/// the acceptor's answer to a `Hello`
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HelloReply {
    pub timestamp_millis: u64,
}
impl HelloReply {
    pub const SERIALIZED_LEN: usize = 10;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(IDENTIFICATION);
        buf.put_u8(Role::Acceptor.into());
        buf.put_u64(self.timestamp_millis);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("handshake reply too short: {} bytes", buf.remaining());
        }
        check_header(buf, Role::Acceptor)?;
        Ok(HelloReply {
            timestamp_millis: buf.get_u64(),
        })
    }
}

fn check_header(buf: &mut impl Buf, expected_role: Role) -> anyhow::Result<()> {
    let identification = buf.get_u8();
    if identification != IDENTIFICATION {
        bail!("unexpected identification byte {}", identification);
    }
    let role = Role::try_from(buf.get_u8())?;
    if role != expected_role {
        bail!("expected handshake from {:?}, got {:?}", expected_role, role);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HandshakeOutcome {
    /// the initiator's heartbeat interval, which both sides use for the session
    pub heartbeat_interval: Duration,
    /// the peer's clock is this many milliseconds behind ours, plus network latency
    pub clock_skew_millis: i64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn clock_skew(peer_timestamp_millis: u64) -> i64 {
    now_millis() as i64 - peer_timestamp_millis as i64
}

/// Runs the initiator's side of session establishment on a fresh connection
#[tracing::instrument(skip(connection, config))]
pub async fn initiate(connection: &mut Duplex, config: &BridgeConfig) -> anyhow::Result<HandshakeOutcome> {
    let hello = Hello {
        heartbeat_interval_millis: config.heartbeat_interval.as_millis().try_into()?,
        timestamp_millis: now_millis(),
    };

    let reply = timeout(config.handshake_timeout, async {
        let mut buf = BytesMut::with_capacity(Hello::SERIALIZED_LEN);
        hello.ser(&mut buf);
        connection.writer.write_all(&buf).await?;
        connection.writer.flush().await?;

        let mut reply_buf = [0u8; HelloReply::SERIALIZED_LEN];
        connection.reader.read_exact(&mut reply_buf).await?;
        HelloReply::deser(&mut &reply_buf[..])
    }).await??;

    let outcome = HandshakeOutcome {
        heartbeat_interval: config.heartbeat_interval,
        clock_skew_millis: clock_skew(reply.timestamp_millis),
    };
    debug!("handshake complete: {:?}", outcome);
    Ok(outcome)
}

/// Runs the acceptor's side of session establishment, adopting the initiator's heartbeat interval
#[tracing::instrument(skip(connection, config))]
pub async fn accept(connection: &mut Duplex, config: &BridgeConfig) -> anyhow::Result<HandshakeOutcome> {
    let hello = timeout(config.handshake_timeout, async {
        let mut hello_buf = [0u8; Hello::SERIALIZED_LEN];
        connection.reader.read_exact(&mut hello_buf).await?;
        let hello = Hello::deser(&mut &hello_buf[..])?;

        let mut buf = BytesMut::with_capacity(HelloReply::SERIALIZED_LEN);
        HelloReply { timestamp_millis: now_millis() }.ser(&mut buf);
        connection.writer.write_all(&buf).await?;
        connection.writer.flush().await?;
        Ok::<_, anyhow::Error>(hello)
    }).await??;

    if hello.heartbeat_interval_millis == 0 {
        bail!("peer proposed a heartbeat interval of 0");
    }

    let outcome = HandshakeOutcome {
        heartbeat_interval: Duration::from_millis(hello.heartbeat_interval_millis.into()),
        clock_skew_millis: clock_skew(hello.timestamp_millis),
    };
    debug!("handshake complete: {:?}", outcome);
    Ok(outcome)
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::test_util::bridge::duplex_pair;
    use super::*;

    #[test]
    fn test_hello_wire_format() {
        let mut buf = BytesMut::new();
        Hello { heartbeat_interval_millis: 1000, timestamp_millis: 0x0102030405060708 }.ser(&mut buf);
        assert_eq!(&buf[..], &[45, 0, 0x03, 0xE8, 1, 2, 3, 4, 5, 6, 7, 8]);

        let mut buf = BytesMut::new();
        HelloReply { timestamp_millis: 7 }.ser(&mut buf);
        assert_eq!(&buf[..], &[45, 1, 0, 0, 0, 0, 0, 0, 0, 7]);
    }

    #[rstest]
    #[case::wrong_identification(vec![44, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0])]
    #[case::wrong_role(vec![45, 1, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0])]
    #[case::unknown_role(vec![45, 7, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0])]
    #[case::too_short(vec![45, 0, 0, 1])]
    fn test_hello_deser_rejects(#[case] bytes: Vec<u8>) {
        assert!(Hello::deser(&mut &bytes[..]).is_err());
    }

    #[tokio::test]
    async fn test_handshake() {
        let (mut a, mut b) = duplex_pair();
        let config_a = BridgeConfig::new().with_heartbeat_interval(Duration::from_millis(1500));
        let config_b = BridgeConfig::new();

        let initiator = tokio::spawn(async move { initiate(&mut a, &config_a).await });
        let accepted = accept(&mut b, &config_b).await.unwrap();
        let initiated = initiator.await.unwrap().unwrap();

        assert_eq!(accepted.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(initiated.heartbeat_interval, Duration::from_millis(1500));
        assert!(accepted.clock_skew_millis.abs() < 1000);
        assert!(initiated.clock_skew_millis.abs() < 1000);
    }

    #[tokio::test]
    async fn test_handshake_with_initiator_on_both_sides() {
        let (mut a, mut b) = duplex_pair();
        let config = BridgeConfig::new();

        let other = tokio::spawn(async move { initiate(&mut b, &BridgeConfig::new()).await });
        assert!(initiate(&mut a, &config).await.is_err());
        assert!(other.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let (mut a, _b) = duplex_pair();
        let start = tokio::time::Instant::now();
        assert!(initiate(&mut a, &BridgeConfig::new()).await.is_err());
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }
}
