use std::sync::Arc;
use tokio::io::DuplexStream;
use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::transport::duplex::Duplex;

pub const PIPE_CAPACITY: usize = 256*1024;

pub fn duplex_pair() -> (Duplex, Duplex) {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    (Duplex::from_io(a), Duplex::from_io(b))
}

/// two bridges talking to each other, loopers not started
pub fn bridge_pair(config: BridgeConfig) -> (Arc<Bridge>, Arc<Bridge>) {
    let config = Arc::new(config);
    let (a, b) = duplex_pair();
    (Bridge::new(config.clone(), a).unwrap(), Bridge::new(config, b).unwrap())
}

/// a bridge whose peer is scripted by the test on the level of raw bytes
pub fn bridge_with_raw_peer(config: BridgeConfig) -> (Arc<Bridge>, DuplexStream) {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    (Bridge::new(Arc::new(config), Duplex::from_io(a)).unwrap(), b)
}
