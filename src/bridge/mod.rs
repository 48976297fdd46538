pub mod frame;
pub mod signal;

use std::io::ErrorKind;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use futures::FutureExt;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, trace, warn};
use crate::bridge::frame::FrameReader;
use crate::bridge::signal::{PayloadSize, Signal};
use crate::config::BridgeConfig;
use crate::error::StopReason;
use crate::transport::duplex::{BoxedReader, BoxedWriter, Duplex};

/// Extension point of the bridge looper: everything except the control signals is delegated to
///  the handler.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SignalHandler: Send + Sync + 'static {
    fn payload_size(&self, signal: u8) -> PayloadSize;

    /// Called on the looper task for every complete frame. No other frame is read while this
    ///  runs, so long-running work should be handed off. Returning an error stops the bridge.
    async fn handle_signal(&self, signal: u8, payload: &[u8]) -> anyhow::Result<()>;

    /// Called exactly once when the looper terminates, after the bridge stopped being alive
    async fn on_stopped(&self);
}

/// Runs two handlers on one bridge, each signal going to the first handler that understands it
pub struct Layered<A, B>(pub Arc<A>, pub Arc<B>);

#[async_trait]
impl<A: SignalHandler, B: SignalHandler> SignalHandler for Layered<A, B> {
    fn payload_size(&self, signal: u8) -> PayloadSize {
        match self.0.payload_size(signal) {
            PayloadSize::Invalid => self.1.payload_size(signal),
            size => size,
        }
    }

    async fn handle_signal(&self, signal: u8, payload: &[u8]) -> anyhow::Result<()> {
        if self.0.payload_size(signal) != PayloadSize::Invalid {
            self.0.handle_signal(signal, payload).await
        }
        else {
            self.1.handle_signal(signal, payload).await
        }
    }

    async fn on_stopped(&self) {
        self.0.on_stopped().await;
        self.1.on_stopped().await;
    }
}

/// A session over one duplex connection: the looper reads and dispatches frames and watches the
///  peer's liveness through heartbeats, while any task may send frames concurrently.
pub struct Bridge {
    config: Arc<BridgeConfig>,
    alive: AtomicBool,
    reader: tokio::sync::Mutex<BoxedReader>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    next_send_at: Mutex<Instant>,
}

impl Bridge {
    pub fn new(config: Arc<BridgeConfig>, connection: Duplex) -> anyhow::Result<Arc<Bridge>> {
        config.validate()?;

        Ok(Arc::new(Bridge {
            config,
            alive: AtomicBool::new(false),
            reader: tokio::sync::Mutex::new(connection.reader),
            writer: tokio::sync::Mutex::new(connection.writer),
            next_send_at: Mutex::new(Instant::now()),
        }))
    }

    pub fn config(&self) -> &Arc<BridgeConfig> {
        &self.config
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Runs the bridge until it is stopped by either side, the peer goes silent for a heartbeat
    ///  interval, or the connection fails. The bridge is no longer alive when this returns.
    pub async fn run_looper(&self, handler: Arc<dyn SignalHandler>) -> StopReason {
        let Ok(mut reader) = self.reader.try_lock() else {
            warn!("bridge looper is already running");
            return StopReason::AlreadyAlive;
        };
        if self.alive.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            warn!("bridge is already alive");
            return StopReason::AlreadyAlive;
        }
        info!("starting bridge looper");

        let reason = match AssertUnwindSafe(self.do_run_looper(&mut reader, handler.as_ref())).catch_unwind().await {
            Ok(Ok(reason)) => reason,
            Ok(Err(e)) => {
                let reason = StopReason::classify(&e);
                debug!("bridge looper failed with {:?}: {}", reason, e);
                reason
            }
            Err(_) => {
                error!("panic in bridge looper");
                StopReason::UnexpectedException
            }
        };

        self.alive.store(false, Ordering::Release);
        handler.on_stopped().await;
        info!("bridge looper stopped: {:?}", reason);
        reason
    }

    async fn do_run_looper(&self, reader: &mut BoxedReader, handler: &dyn SignalHandler) -> anyhow::Result<StopReason> {
        let interval = self.config.heartbeat_interval;

        self.send_signal(Signal::Start).await?;
        if !self.await_start(reader).await? {
            return Ok(StopReason::UnreliableConnection);
        }
        debug!("peer bridge started");

        let mut frames = FrameReader::new(self.config.max_packet_size);
        let mut next_receive_at = Instant::now() + interval;

        while self.is_alive() {
            if let Some(target) = frames.read_target() {
                match timeout(self.config.read_timeout(), reader.read(target)).await {
                    Ok(Ok(0)) => return Err(std::io::Error::from(ErrorKind::UnexpectedEof).into()),
                    Ok(Ok(n)) => {
                        next_receive_at = Instant::now() + interval;
                        if let Err(e) = frames.on_bytes_read(n, |signal| handler.payload_size(signal)) {
                            warn!("{}", e);
                            return Ok(StopReason::UnintendedSignal);
                        }
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => {}
                }
            }

            let now = Instant::now();
            if now >= next_receive_at {
                warn!("no traffic from peer for {:?}", interval);
                return Ok(StopReason::NetworkTimeout);
            }
            if now >= self.next_send_at() {
                self.send_signal(Signal::Beat).await?;
            }

            if let Some((signal, payload)) = frames.complete_frame() {
                match Signal::try_from(signal) {
                    Ok(Signal::Beat) => trace!("heartbeat"),
                    Ok(Signal::Stop) => {
                        info!("bridge stopped by peer");
                        return Ok(StopReason::StoppedByPeer);
                    }
                    _ => {
                        trace!("received signal {} with {} bytes of payload", signal, payload.len());
                        handler.handle_signal(signal, payload).await?;
                    }
                }
                frames.reset();
            }
        }

        Ok(StopReason::StoppedBySelf)
    }

    async fn await_start(&self, reader: &mut BoxedReader) -> anyhow::Result<bool> {
        let mut signal = [0u8; 1];
        match timeout(self.config.heartbeat_interval, reader.read_exact(&mut signal)).await {
            Err(_) => {
                warn!("no start signal from peer within {:?}", self.config.heartbeat_interval);
                Ok(false)
            }
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(_)) => {
                if signal[0] == u8::from(Signal::Start) {
                    Ok(true)
                }
                else {
                    warn!("expected start signal from peer, got {}", signal[0]);
                    Ok(false)
                }
            }
        }
    }

    /// Asks the looper to terminate. The looper notices at its next iteration, i.e. within a
    ///  quarter heartbeat interval. Does nothing if the bridge is not alive.
    pub async fn stop_looper(&self) {
        if !self.is_alive() {
            return;
        }
        if let Err(e) = self.send_signal(Signal::Stop).await {
            debug!("failed to send stop signal: {}", e);
        }
        self.alive.store(false, Ordering::Release);
    }

    /// Writes a complete frame. Frames sent concurrently are never interleaved.
    pub async fn send_frame(&self, frame: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        *self.next_send_at.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now() + self.config.read_timeout();
        Ok(())
    }

    pub async fn send_signal(&self, signal: Signal) -> std::io::Result<()> {
        self.send_frame(&[signal.into()]).await
    }

    fn next_send_at(&self) -> Instant {
        *self.next_send_at.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
