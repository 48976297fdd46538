pub mod rentable_stream;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use crate::bridge::{Bridge, SignalHandler};
use crate::bridge::signal::{PayloadSize, Signal};
use crate::error::{BridgeError, ProtocolViolation};
use crate::stream::rentable_stream::{InStream, OutStream, RentableStream, StreamPool};
use crate::transport::duplex::{Duplex, StreamMaker};
use crate::util::monitor::{Monitor, WaitError, WaitPolicy};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Options for borrowing a direction of a pooled stream
#[derive(Debug, Clone, Copy)]
pub struct StreamRequest {
    /// a specific stream, or `None` for any stream with the direction available
    pub index: Option<usize>,
    /// create a new stream if no existing one is available (only for `index: None`)
    pub can_create: bool,
    /// wait for a specific stream that does not exist yet to be created
    pub wait_to_create: bool,
    pub wait: WaitPolicy,
}

impl StreamRequest {
    pub fn any() -> StreamRequest {
        StreamRequest {
            index: None,
            can_create: true,
            wait_to_create: false,
            wait: WaitPolicy::Indefinitely,
        }
    }

    pub fn at(index: usize) -> StreamRequest {
        StreamRequest {
            index: Some(index),
            can_create: false,
            wait_to_create: true,
            wait: WaitPolicy::Indefinitely,
        }
    }

    pub fn with_wait(self, wait: WaitPolicy) -> StreamRequest {
        StreamRequest { wait, ..self }
    }
}

enum Step<H> {
    Acquired(usize, u64, H),
    Create,
    Failed(BridgeError),
}

/// Auxiliary connections on top of a bridge.
///
/// Streams are numbered in creation order. Creating a stream announces the next index on the
///  bridge, and both peers exchange that index as a 4-byte token over the new connection, so
///  stream `k` on one side is always connected to stream `k` on the other side.
pub struct StreamBridge {
    bridge: Arc<Bridge>,
    maker: Arc<dyn StreamMaker>,
    /// held while a stream is being created, by either side
    creation: tokio::sync::Mutex<()>,
    pool: Arc<Monitor<StreamPool>>,
}

impl StreamBridge {
    /// The returned value is the bridge's `SignalHandler`, to be passed to `Bridge::run_looper`.
    pub fn new(bridge: Arc<Bridge>, maker: Arc<dyn StreamMaker>) -> Arc<StreamBridge> {
        Arc::new(StreamBridge {
            bridge,
            maker,
            creation: Default::default(),
            pool: Arc::new(Monitor::new(StreamPool::default())),
        })
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn stream_count(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn is_in_stream_available(&self, index: usize) -> bool {
        self.pool.lock().streams.get(index)
            .map(RentableStream::is_in_available)
            .unwrap_or(false)
    }

    pub fn is_out_stream_available(&self, index: usize) -> bool {
        self.pool.lock().streams.get(index)
            .map(RentableStream::is_out_available)
            .unwrap_or(false)
    }

    /// Creates a new auxiliary stream together with the peer, returning its index. `wait`
    ///  applies while the pool is at its limit.
    pub async fn make_and_connect_stream(&self, notify_on_success: bool, wait: WaitPolicy) -> Result<usize, BridgeError> {
        let limit = self.bridge.config().stream_limit;

        loop {
            if !self.bridge.is_alive() {
                return Err(BridgeError::NotAlive);
            }

            let creation = self.creation.lock().await;
            let (index, epoch) = {
                let pool = self.pool.lock();
                (pool.len(), pool.epoch)
            };

            if index >= limit {
                drop(creation);
                match self.pool.wait_for(wait, || self.bridge.is_alive(), |pool| (pool.len() < limit).then_some(())).await {
                    Ok(()) => continue,
                    Err(WaitError::TimedOut) => return Err(BridgeError::LimitReached),
                    Err(WaitError::NotAlive) => return Err(BridgeError::NotAlive),
                }
            }

            let token: u32 = index.prechecked_cast();
            let token = token.to_be_bytes();

            let mut frame = [0u8; 5];
            frame[0] = Signal::MakeStream.into();
            frame[1..].copy_from_slice(&token);
            if let Err(e) = self.bridge.send_frame(&frame).await {
                debug!("failed to announce stream #{}: {}", index, e);
                return Err(BridgeError::StreamClosed);
            }

            let config = self.bridge.config();
            let duplex = self.exchange_token(token, config.make_stream_timeout(), config.connect_stream_timeout()).await?;
            let added = self.add_stream(epoch, duplex, notify_on_success);
            drop(creation);

            return if added {
                info!("created stream #{}", index);
                Ok(index)
            }
            else {
                Err(BridgeError::NotAlive)
            };
        }
    }

    /// Materializes a new connection and exchanges the handshake token with the peer over it
    async fn exchange_token(&self, token: [u8; 4], make_timeout: Duration, token_timeout: Duration) -> Result<Duplex, BridgeError> {
        let mut duplex = match timeout(make_timeout, self.maker.make_stream()).await {
            Ok(Ok(duplex)) => duplex,
            Ok(Err(e)) => {
                debug!("failed to create stream: {}", e);
                return Err(BridgeError::CreationFailed);
            }
            Err(_) => {
                debug!("timeout creating stream");
                return Err(BridgeError::ConnectionTimeout);
            }
        };

        if let Err(e) = write_token(&mut duplex, &token).await {
            debug!("failed to send stream handshake: {}", e);
            return Err(BridgeError::StreamClosed);
        }

        let mut peer_token = [0u8; 4];
        match timeout(token_timeout, duplex.reader.read_exact(&mut peer_token)).await {
            Ok(Ok(_)) if peer_token == token => Ok(duplex),
            Ok(Ok(_)) => {
                warn!("stream handshake mismatch: expected {:?}, received {:?}", token, peer_token);
                Err(BridgeError::ConnectionFailed)
            }
            Ok(Err(e)) => {
                debug!("failed to receive stream handshake: {}", e);
                Err(BridgeError::StreamClosed)
            }
            Err(_) => {
                debug!("timeout waiting for stream handshake");
                Err(BridgeError::ConnectionTimeout)
            }
        }
    }

    fn add_stream(&self, epoch: u64, duplex: Duplex, notify: bool) -> bool {
        let added = {
            let mut pool = self.pool.lock();
            if pool.epoch == epoch && self.bridge.is_alive() {
                pool.streams.push(RentableStream::new(duplex));
                true
            }
            else {
                false
            }
        };
        if notify {
            self.pool.notify_all();
        }
        added
    }

    /// peer-initiated creation, running on the looper task
    async fn on_make_stream(&self, token: [u8; 4]) {
        let _creation = self.creation.lock().await;
        let (expected, epoch) = {
            let pool = self.pool.lock();
            (pool.len(), pool.epoch)
        };

        let index: usize = u32::from_be_bytes(token).safe_cast();
        if index != expected {
            warn!("peer announced stream #{}, but the next stream is #{} - ignoring", index, expected);
            return;
        }
        if index >= self.bridge.config().stream_limit {
            warn!("peer announced stream #{} beyond the stream limit - ignoring", index);
            return;
        }

        let make_timeout = self.bridge.config().make_stream_timeout();
        match self.exchange_token(token, make_timeout, make_timeout).await {
            Ok(duplex) => {
                if self.add_stream(epoch, duplex, true) {
                    info!("peer created stream #{}", index);
                }
            }
            Err(e) => warn!("failed to create stream #{} on the peer's request: {}", index, e),
        }
    }

    pub async fn acquire_in_stream(&self, request: StreamRequest) -> Result<InStream, BridgeError> {
        let (index, epoch, (reader, closed)) = self.acquire(&request, StreamPool::first_in_available, StreamPool::take_reader).await?;
        Ok(InStream::new(index, epoch, reader, closed, self.pool.clone()))
    }

    pub async fn acquire_out_stream(&self, request: StreamRequest) -> Result<OutStream, BridgeError> {
        let (index, epoch, (writer, closed)) = self.acquire(&request, StreamPool::first_out_available, StreamPool::take_writer).await?;
        Ok(OutStream::new(index, epoch, writer, closed, self.pool.clone()))
    }

    pub fn release_in_stream(&self, stream: InStream) {
        drop(stream);
    }

    pub fn release_out_stream(&self, stream: OutStream) {
        drop(stream);
    }

    async fn acquire<H>(&self,
                        request: &StreamRequest,
                        first_available: fn(&StreamPool) -> Option<usize>,
                        take: fn(&mut StreamPool, usize) -> Option<H>,
    ) -> Result<(usize, u64, H), BridgeError> {
        let limit = self.bridge.config().stream_limit;

        loop {
            let step = self.pool.wait_for(request.wait, || self.bridge.is_alive(), |pool| {
                match request.index {
                    None => {
                        if let Some(index) = first_available(pool) {
                            let epoch = pool.epoch;
                            return take(pool, index).map(|half| Step::Acquired(index, epoch, half));
                        }
                        (request.can_create && pool.len() < limit).then_some(Step::Create)
                    }
                    Some(index) if index >= limit => Some(Step::Failed(BridgeError::InvalidId)),
                    Some(index) if index < pool.len() => {
                        let epoch = pool.epoch;
                        take(pool, index).map(|half| Step::Acquired(index, epoch, half))
                    }
                    Some(_) => {
                        if request.wait_to_create {
                            None
                        }
                        else {
                            Some(Step::Failed(BridgeError::StreamUnavailable))
                        }
                    }
                }
            }).await;

            match step {
                Ok(Step::Acquired(index, epoch, half)) => return Ok((index, epoch, half)),
                Ok(Step::Create) => {
                    self.make_and_connect_stream(false, request.wait).await?;
                }
                Ok(Step::Failed(e)) => return Err(e),
                Err(WaitError::TimedOut) => return Err(BridgeError::StreamUnavailable),
                Err(WaitError::NotAlive) => return Err(BridgeError::NotAlive),
            }
        }
    }

    /// Borrows an input direction for the duration of `f`, releasing it on every exit path
    pub async fn with_in_stream<T, F>(&self, request: StreamRequest, f: F) -> Result<T, BridgeError>
    where F: for<'a> FnOnce(&'a mut InStream) -> Pin<Box<dyn Future<Output = T> + Send + 'a>>
    {
        let mut stream = self.acquire_in_stream(request).await?;
        Ok(f(&mut stream).await)
    }

    pub async fn with_out_stream<T, F>(&self, request: StreamRequest, f: F) -> Result<T, BridgeError>
    where F: for<'a> FnOnce(&'a mut OutStream) -> Pin<Box<dyn Future<Output = T> + Send + 'a>>
    {
        let mut stream = self.acquire_out_stream(request).await?;
        Ok(f(&mut stream).await)
    }
}

async fn write_token(duplex: &mut Duplex, token: &[u8; 4]) -> std::io::Result<()> {
    duplex.writer.write_all(token).await?;
    duplex.writer.flush().await
}

#[async_trait]
impl SignalHandler for StreamBridge {
    fn payload_size(&self, signal: u8) -> PayloadSize {
        match Signal::try_from(signal) {
            Ok(Signal::MakeStream) => PayloadSize::Fixed(4),
            _ => PayloadSize::Invalid,
        }
    }

    async fn handle_signal(&self, signal: u8, payload: &[u8]) -> anyhow::Result<()> {
        let Ok(token) = <[u8; 4]>::try_from(payload) else {
            return Err(ProtocolViolation(format!("signal {} with {} bytes of payload", signal, payload.len())).into());
        };
        self.on_make_stream(token).await;
        Ok(())
    }

    async fn on_stopped(&self) {
        let num_streams = self.pool.update(|pool| {
            let num_streams = pool.len();
            pool.clear();
            num_streams
        });
        debug!("closed {} streams", num_streams);
    }
}


#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;
    use tokio::time::sleep;
    use crate::bridge::signal::PayloadSize;
    use crate::bridge::MockSignalHandler;
    use crate::config::BridgeConfig;
    use crate::error::StopReason;
    use crate::test_util::bridge::bridge_pair;
    use crate::test_util::stream_maker::stream_maker_pair;
    use crate::transport::duplex::MockStreamMaker;
    use super::*;

    struct Peer {
        streams: Arc<StreamBridge>,
        looper: JoinHandle<StopReason>,
    }

    fn start(bridge: Arc<Bridge>, maker: Arc<dyn StreamMaker>) -> Peer {
        let streams = StreamBridge::new(bridge.clone(), maker);
        let handler = streams.clone();
        let looper = tokio::spawn(async move { bridge.run_looper(handler).await });
        Peer { streams, looper }
    }

    async fn connected_pair(config: BridgeConfig) -> (Peer, Peer) {
        let (bridge_a, bridge_b) = bridge_pair(config);
        let (connecting, accepting) = stream_maker_pair();
        let a = start(bridge_a, connecting);
        let b = start(bridge_b, accepting);
        sleep(Duration::from_millis(10)).await;
        (a, b)
    }

    async fn assert_connected(writer: &mut OutStream, reader: &mut InStream, msg: &[u8]) {
        writer.write_all(msg).await.unwrap();
        writer.flush().await.unwrap();
        let mut buf = vec![0u8; msg.len()];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, msg);
    }

    #[tokio::test(start_paused = true)]
    async fn test_indices_line_up() {
        let (a, b) = connected_pair(BridgeConfig::new()).await;

        for expected in 0..2 {
            assert_eq!(a.streams.make_and_connect_stream(true, WaitPolicy::NoWait).await, Ok(expected));
        }
        // creation initiated by the accepting side
        assert_eq!(b.streams.make_and_connect_stream(true, WaitPolicy::NoWait).await, Ok(2));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(a.streams.stream_count(), 3);
        assert_eq!(b.streams.stream_count(), 3);

        for k in [2, 0, 1] {
            let mut out_a = a.streams.acquire_out_stream(StreamRequest::at(k)).await.unwrap();
            let mut in_b = b.streams.acquire_in_stream(StreamRequest::at(k)).await.unwrap();
            assert_connected(&mut out_a, &mut in_b, format!("stream {}", k).as_bytes()).await;

            let mut out_b = b.streams.acquire_out_stream(StreamRequest::at(k)).await.unwrap();
            let mut in_a = a.streams.acquire_in_stream(StreamRequest::at(k)).await.unwrap();
            assert_connected(&mut out_b, &mut in_a, format!("back {}", k).as_bytes()).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_limit() {
        let mut config = BridgeConfig::new();
        config.stream_limit = 2;
        let (a, b) = connected_pair(config).await;

        let results = futures::future::join_all((0..3)
            .map(|_| a.streams.make_and_connect_stream(true, WaitPolicy::NoWait)))
            .await;

        let mut indices = results.iter()
            .filter_map(|r| r.ok())
            .collect::<Vec<_>>();
        indices.sort();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(results.iter().filter(|&&r| r == Err(BridgeError::LimitReached)).count(), 1);

        sleep(Duration::from_millis(10)).await;
        assert_eq!(b.streams.stream_count(), 2);

        let start = tokio::time::Instant::now();
        assert_eq!(a.streams.make_and_connect_stream(true, WaitPolicy::timeout(Duration::from_millis(100))).await, Err(BridgeError::LimitReached));
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_any_creates_on_demand() {
        let (a, b) = connected_pair(BridgeConfig::new()).await;

        let out_a = a.streams.acquire_out_stream(StreamRequest::any()).await.unwrap();
        assert_eq!(out_a.index(), 0);
        assert_eq!(a.streams.stream_count(), 1);

        // the input direction of the same stream is still free
        let in_a = a.streams.acquire_in_stream(StreamRequest::any()).await.unwrap();
        assert_eq!(in_a.index(), 0);

        let second_out = a.streams.acquire_out_stream(StreamRequest::any()).await.unwrap();
        assert_eq!(second_out.index(), 1);

        sleep(Duration::from_millis(10)).await;
        assert_eq!(b.streams.stream_count(), 2);

        a.streams.release_out_stream(out_a);
        assert!(a.streams.is_out_stream_available(0));
        assert!(!a.streams.is_in_stream_available(0));
        let again = a.streams.acquire_out_stream(StreamRequest::any()).await.unwrap();
        assert_eq!(again.index(), 0);
        assert_eq!(a.streams.stream_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_specific_index() {
        let mut config = BridgeConfig::new();
        config.stream_limit = 4;
        let (a, b) = connected_pair(config).await;

        assert_eq!(a.streams.acquire_in_stream(StreamRequest::at(4)).await.map(|s| s.index()), Err(BridgeError::InvalidId));
        let not_yet = StreamRequest { wait_to_create: false, ..StreamRequest::at(0) };
        assert_eq!(a.streams.acquire_in_stream(not_yet).await.map(|s| s.index()), Err(BridgeError::StreamUnavailable));

        // waits for the peer to create the stream
        let streams = a.streams.clone();
        let waiter = tokio::spawn(async move { streams.acquire_in_stream(StreamRequest::at(0)).await.map(|s| s.index()) });
        sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        b.streams.make_and_connect_stream(true, WaitPolicy::NoWait).await.unwrap();
        assert_eq!(waiter.await.unwrap(), Ok(0));

        let held = a.streams.acquire_in_stream(StreamRequest::at(0)).await.unwrap();
        let start = tokio::time::Instant::now();
        let busy = StreamRequest::at(0).with_wait(WaitPolicy::timeout(Duration::from_millis(50)));
        assert_eq!(a.streams.acquire_in_stream(busy).await.map(|s| s.index()), Err(BridgeError::StreamUnavailable));
        assert_eq!(start.elapsed(), Duration::from_millis(50));

        let streams = a.streams.clone();
        let waiter = tokio::spawn(async move { streams.acquire_in_stream(StreamRequest::at(0)).await.map(|s| s.index()) });
        sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        a.streams.release_in_stream(held);
        assert_eq!(waiter.await.unwrap(), Ok(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_create_waits_for_release() {
        let (a, _b) = connected_pair(BridgeConfig::new()).await;
        a.streams.make_and_connect_stream(true, WaitPolicy::NoWait).await.unwrap();

        let no_create = StreamRequest { can_create: false, ..StreamRequest::any() };
        let held = a.streams.acquire_out_stream(no_create).await.unwrap();
        assert_eq!(a.streams.acquire_out_stream(no_create.with_wait(WaitPolicy::NoWait)).await.map(|s| s.index()), Err(BridgeError::StreamUnavailable));

        let streams = a.streams.clone();
        let waiter = tokio::spawn(async move { streams.acquire_out_stream(no_create).await.map(|s| s.index()) });
        sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        drop(held);
        assert_eq!(waiter.await.unwrap(), Ok(0));
        assert_eq!(a.streams.stream_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_stream_releases() {
        let (a, b) = connected_pair(BridgeConfig::new()).await;

        let n = a.streams.with_out_stream(StreamRequest::any(), |out| Box::pin(async move {
            out.write_all(b"scoped").await.map(|_| out.index())
        })).await.unwrap().unwrap();
        assert_eq!(n, 0);
        assert!(a.streams.is_out_stream_available(0));

        let received = b.streams.with_in_stream(StreamRequest::at(0), |input| Box::pin(async move {
            let mut buf = [0u8; 6];
            input.read_exact(&mut buf).await.map(|_| buf)
        })).await.unwrap().unwrap();
        assert_eq!(&received, b"scoped");
        assert!(b.streams.is_in_stream_available(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_token() {
        let (bridge_a, bridge_b) = bridge_pair(BridgeConfig::new());
        let (connecting, accepting) = stream_maker_pair();
        let a = start(bridge_a, connecting);

        // the peer answers the handshake with a wrong index
        let mut peer_handler = MockSignalHandler::new();
        peer_handler.expect_payload_size()
            .return_const(PayloadSize::Fixed(4));
        peer_handler.expect_handle_signal()
            .returning(|_, _| Ok(()));
        peer_handler.expect_on_stopped()
            .return_const(());
        let peer_looper = tokio::spawn(async move { bridge_b.run_looper(Arc::new(peer_handler)).await });
        let bad_peer = tokio::spawn(async move {
            let mut duplex = accepting.make_stream().await.unwrap();
            duplex.writer.write_all(&[0, 0, 0, 9]).await.unwrap();
            duplex
        });
        sleep(Duration::from_millis(10)).await;

        assert_eq!(a.streams.make_and_connect_stream(true, WaitPolicy::NoWait).await, Err(BridgeError::ConnectionFailed));
        assert_eq!(a.streams.stream_count(), 0);
        assert!(a.streams.bridge().is_alive());
        let _ = bad_peer.await.unwrap();

        sleep(Duration::from_millis(3000)).await;
        assert!(a.streams.bridge().is_alive());
        assert!(!a.looper.is_finished());
        assert!(!peer_looper.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_creation_failures() {
        let (bridge_a, bridge_b) = bridge_pair(BridgeConfig::new());

        let mut maker = MockStreamMaker::new();
        let mut seq = mockall::Sequence::new();
        maker.expect_make_stream()
            .once()
            .in_sequence(&mut seq)
            .returning(|| Err(anyhow::anyhow!("refused")));
        maker.expect_make_stream()
            .once()
            .in_sequence(&mut seq)
            .returning(|| {
                // a connection nobody answers on
                let (near, far) = crate::test_util::bridge::duplex_pair();
                std::mem::forget(far);
                Ok(near)
            });
        let a = start(bridge_a, Arc::new(maker));

        let mut peer_handler = MockSignalHandler::new();
        peer_handler.expect_payload_size()
            .return_const(PayloadSize::Fixed(4));
        peer_handler.expect_handle_signal()
            .returning(|_, _| Ok(()));
        peer_handler.expect_on_stopped()
            .return_const(());
        tokio::spawn(async move { bridge_b.run_looper(Arc::new(peer_handler)).await });
        sleep(Duration::from_millis(10)).await;

        assert_eq!(a.streams.make_and_connect_stream(true, WaitPolicy::NoWait).await, Err(BridgeError::CreationFailed));
        assert_eq!(a.streams.make_and_connect_stream(true, WaitPolicy::NoWait).await, Err(BridgeError::ConnectionTimeout));
        assert_eq!(a.streams.stream_count(), 0);
        assert!(a.streams.bridge().is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_pool() {
        let (a, b) = connected_pair(BridgeConfig::new()).await;
        a.streams.make_and_connect_stream(true, WaitPolicy::NoWait).await.unwrap();
        let held = a.streams.acquire_out_stream(StreamRequest::at(0)).await.unwrap();

        let streams = a.streams.clone();
        let waiter = tokio::spawn(async move { streams.acquire_out_stream(StreamRequest::at(0)).await.map(|s| s.index()) });
        sleep(Duration::from_millis(10)).await;

        a.streams.bridge().stop_looper().await;
        assert_eq!(a.looper.await.unwrap(), StopReason::StoppedBySelf);
        assert_eq!(b.looper.await.unwrap(), StopReason::StoppedByPeer);

        assert_eq!(waiter.await.unwrap(), Err(BridgeError::NotAlive));
        assert_eq!(a.streams.stream_count(), 0);
        assert_eq!(b.streams.stream_count(), 0);
        assert_eq!(a.streams.acquire_in_stream(StreamRequest::any()).await.map(|s| s.index()), Err(BridgeError::NotAlive));
        assert_eq!(a.streams.make_and_connect_stream(true, WaitPolicy::NoWait).await, Err(BridgeError::NotAlive));

        drop(held);
        assert_eq!(a.streams.stream_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_borrowed_directions() {
        let (a, b) = connected_pair(BridgeConfig::new()).await;
        a.streams.make_and_connect_stream(true, WaitPolicy::NoWait).await.unwrap();

        let mut out_a = a.streams.acquire_out_stream(StreamRequest::at(0)).await.unwrap();
        let mut in_b = b.streams.acquire_in_stream(StreamRequest::at(0)).await.unwrap();
        assert_connected(&mut out_a, &mut in_b, b"before stop").await;

        a.streams.bridge().stop_looper().await;
        assert_eq!(a.looper.await.unwrap(), StopReason::StoppedBySelf);
        assert_eq!(b.looper.await.unwrap(), StopReason::StoppedByPeer);

        assert_eq!(out_a.write_all(b"after stop").await.map_err(|e| e.kind()), Err(std::io::ErrorKind::NotConnected));
        let mut buf = [0u8; 10];
        assert_eq!(in_b.read_exact(&mut buf).await.map_err(|e| e.kind()), Err(std::io::ErrorKind::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_creation_from_both_sides() {
        let (a, b) = connected_pair(BridgeConfig::new()).await;

        for expected in 0..3 {
            let (created_a, created_b) = tokio::join!(
                a.streams.make_and_connect_stream(true, WaitPolicy::NoWait),
                b.streams.make_and_connect_stream(true, WaitPolicy::NoWait),
            );
            assert_eq!(created_a, Ok(expected));
            assert_eq!(created_b, Ok(expected));
            // lets both loopers process the peer's now redundant announcement
            sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(a.streams.stream_count(), 3);
        assert_eq!(b.streams.stream_count(), 3);
        assert!(a.streams.bridge().is_alive());
        assert!(b.streams.bridge().is_alive());

        for k in 0..3 {
            let mut out_a = a.streams.acquire_out_stream(StreamRequest::at(k)).await.unwrap();
            let mut in_b = b.streams.acquire_in_stream(StreamRequest::at(k)).await.unwrap();
            assert_connected(&mut out_a, &mut in_b, &[k as u8]).await;

            let mut out_b = b.streams.acquire_out_stream(StreamRequest::at(k)).await.unwrap();
            let mut in_a = a.streams.acquire_in_stream(StreamRequest::at(k)).await.unwrap();
            assert_connected(&mut out_b, &mut in_a, &[k as u8 + 10]).await;
        }
    }
}
