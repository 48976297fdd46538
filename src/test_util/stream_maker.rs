use std::sync::Arc;
use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use crate::test_util::bridge::duplex_pair;
use crate::transport::duplex::{Duplex, StreamMaker};

/// The 'connecting' side: creates an in-memory pipe and hands the far end to the accepting side
pub struct ConnectingStreamMaker {
    tx: mpsc::UnboundedSender<Duplex>,
}

#[async_trait]
impl StreamMaker for ConnectingStreamMaker {
    async fn make_stream(&self) -> anyhow::Result<Duplex> {
        let (near, far) = duplex_pair();
        self.tx.send(far)
            .map_err(|_| anyhow!("accepting side is gone"))?;
        Ok(near)
    }
}

pub struct AcceptingStreamMaker {
    rx: Mutex<mpsc::UnboundedReceiver<Duplex>>,
}

#[async_trait]
impl StreamMaker for AcceptingStreamMaker {
    async fn make_stream(&self) -> anyhow::Result<Duplex> {
        self.rx.lock().await
            .recv().await
            .ok_or_else(|| anyhow!("connecting side is gone"))
    }
}

pub fn stream_maker_pair() -> (Arc<ConnectingStreamMaker>, Arc<AcceptingStreamMaker>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ConnectingStreamMaker { tx }), Arc::new(AcceptingStreamMaker { rx: Mutex::new(rx) }))
}
