use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The two directions of a byte stream connection, owned separately so they can be used (and
///  lent out) independently.
pub struct Duplex {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl Duplex {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, writer: impl AsyncWrite + Send + Unpin + 'static) -> Duplex {
        Duplex {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    pub fn from_tcp(stream: TcpStream) -> Duplex {
        let (reader, writer) = stream.into_split();
        Duplex::new(reader, writer)
    }

    pub fn from_io<T: AsyncRead + AsyncWrite + Send + 'static>(io: T) -> Duplex {
        let (reader, writer) = tokio::io::split(io);
        Duplex::new(reader, writer)
    }
}

/// Materializes new physical connections to the peer for auxiliary streams. Which side of a
///  session connects and which side accepts is a property of the transport, not of the side
///  that initiates a stream: peer-initiated creation calls `make_stream` as well.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamMaker: Send + Sync + 'static {
    async fn make_stream(&self) -> anyhow::Result<Duplex>;
}
