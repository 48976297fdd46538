use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use crate::transport::duplex::{BoxedReader, BoxedWriter, Duplex};
use crate::util::monitor::Monitor;

/// An auxiliary connection whose two directions are lent out independently. A direction is
///  available while its half is present. Cancelling `closed` shuts down lent-out halves as well.
pub struct RentableStream {
    reader: Option<BoxedReader>,
    writer: Option<BoxedWriter>,
    closed: CancellationToken,
}

impl RentableStream {
    pub fn new(duplex: Duplex) -> RentableStream {
        RentableStream {
            reader: Some(duplex.reader),
            writer: Some(duplex.writer),
            closed: CancellationToken::new(),
        }
    }

    pub fn is_in_available(&self) -> bool {
        self.reader.is_some()
    }

    pub fn is_out_available(&self) -> bool {
        self.writer.is_some()
    }
}

/// The auxiliary streams of one bridge. `epoch` changes whenever the pool is cleared, so halves
///  that come back from a previous bridge lifetime are dropped instead of being put back.
#[derive(Default)]
pub struct StreamPool {
    pub epoch: u64,
    pub streams: Vec<RentableStream>,
}

impl StreamPool {
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Closes all streams, including directions that are currently lent out
    pub fn clear(&mut self) {
        for stream in &self.streams {
            stream.closed.cancel();
        }
        self.streams.clear();
        self.epoch += 1;
    }

    pub fn take_reader(&mut self, index: usize) -> Option<(BoxedReader, CancellationToken)> {
        let stream = self.streams.get_mut(index)?;
        let reader = stream.reader.take()?;
        Some((reader, stream.closed.clone()))
    }

    pub fn take_writer(&mut self, index: usize) -> Option<(BoxedWriter, CancellationToken)> {
        let stream = self.streams.get_mut(index)?;
        let writer = stream.writer.take()?;
        Some((writer, stream.closed.clone()))
    }

    /// index of the first stream with an available input direction
    pub fn first_in_available(&self) -> Option<usize> {
        self.streams.iter().position(RentableStream::is_in_available)
    }

    pub fn first_out_available(&self) -> Option<usize> {
        self.streams.iter().position(RentableStream::is_out_available)
    }

    fn return_reader(&mut self, index: usize, epoch: u64, reader: BoxedReader) {
        if epoch == self.epoch {
            if let Some(stream) = self.streams.get_mut(index) {
                stream.reader = Some(reader);
            }
        }
    }

    fn return_writer(&mut self, index: usize, epoch: u64, writer: BoxedWriter) {
        if epoch == self.epoch {
            if let Some(stream) = self.streams.get_mut(index) {
                stream.writer = Some(writer);
            }
        }
    }
}

/// The borrowed input direction of a pooled stream. Dropping it returns the direction to the
///  pool and wakes all tasks waiting for a stream. Once the pool is closed, reads fail with
///  `NotConnected`.
pub struct InStream {
    index: usize,
    epoch: u64,
    reader: Option<BoxedReader>,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
    pool: Arc<Monitor<StreamPool>>,
}

impl InStream {
    pub(crate) fn new(index: usize, epoch: u64, reader: BoxedReader, closed: CancellationToken, pool: Arc<Monitor<StreamPool>>) -> InStream {
        InStream { index, epoch, reader: Some(reader), closed: Box::pin(closed.cancelled_owned()), pool }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for InStream {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.pool.update(|pool| pool.return_reader(self.index, self.epoch, reader));
        }
    }
}

impl AsyncRead for InStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed.as_mut().poll(cx).is_ready() {
            this.reader = None;
        }
        match this.reader.as_mut() {
            Some(reader) => Pin::new(reader).poll_read(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }
}

/// The borrowed output direction of a pooled stream, returned to the pool on drop.
pub struct OutStream {
    index: usize,
    epoch: u64,
    writer: Option<BoxedWriter>,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
    pool: Arc<Monitor<StreamPool>>,
}

impl OutStream {
    pub(crate) fn new(index: usize, epoch: u64, writer: BoxedWriter, closed: CancellationToken, pool: Arc<Monitor<StreamPool>>) -> OutStream {
        OutStream { index, epoch, writer: Some(writer), closed: Box::pin(closed.cancelled_owned()), pool }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn writer(self: Pin<&mut Self>, cx: &mut Context<'_>) -> io::Result<Pin<&mut BoxedWriter>> {
        let this = self.get_mut();
        if this.closed.as_mut().poll(cx).is_ready() {
            this.writer = None;
        }
        this.writer.as_mut()
            .map(Pin::new)
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }
}

impl Drop for OutStream {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            self.pool.update(|pool| pool.return_writer(self.index, self.epoch, writer));
        }
    }
}

impl AsyncWrite for OutStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.writer(cx) {
            Ok(writer) => writer.poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.writer(cx) {
            Ok(writer) => writer.poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.writer(cx) {
            Ok(writer) => writer.poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
