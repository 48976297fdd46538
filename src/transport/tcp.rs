use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;
use crate::transport::duplex::{Duplex, StreamMaker};

/// Opens auxiliary streams by connecting to the peer's listening address
pub struct TcpConnector {
    peer_addr: SocketAddr,
}

impl TcpConnector {
    pub fn new(peer_addr: SocketAddr) -> TcpConnector {
        TcpConnector { peer_addr }
    }
}

#[async_trait]
impl StreamMaker for TcpConnector {
    async fn make_stream(&self) -> anyhow::Result<Duplex> {
        let stream = TcpStream::connect(self.peer_addr).await?;
        stream.set_nodelay(true)?;
        debug!("connected auxiliary stream to {:?}", self.peer_addr);
        Ok(Duplex::from_tcp(stream))
    }
}

/// Obtains auxiliary streams by accepting them on the listener the session was accepted on
pub struct TcpAcceptor {
    listener: Arc<TcpListener>,
}

impl TcpAcceptor {
    pub fn new(listener: Arc<TcpListener>) -> TcpAcceptor {
        TcpAcceptor { listener }
    }
}

#[async_trait]
impl StreamMaker for TcpAcceptor {
    async fn make_stream(&self) -> anyhow::Result<Duplex> {
        let (stream, from) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!("accepted auxiliary stream from {:?}", from);
        Ok(Duplex::from_tcp(stream))
    }
}


#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use super::*;

    #[tokio::test]
    async fn test_connector_reaches_acceptor() {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let connector = TcpConnector::new(listener.local_addr().unwrap());
        let acceptor = TcpAcceptor::new(listener);

        let (connected, accepted) = tokio::join!(connector.make_stream(), acceptor.make_stream());
        let mut connected = connected.unwrap();
        let mut accepted = accepted.unwrap();

        connected.writer.write_all(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 3];
        accepted.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }
}
