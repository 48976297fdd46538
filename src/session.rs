use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use anyhow::bail;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};
use crate::bridge::{Bridge, SignalHandler};
use crate::config::BridgeConfig;
use crate::error::StopReason;
use crate::transport::duplex::{Duplex, StreamMaker};
use crate::transport::handshake::{self, HandshakeOutcome};
use crate::transport::tcp::{TcpAcceptor, TcpConnector};

#[derive(Clone)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected(Arc<Bridge>),
    Disconnecting,
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::NotConnected => write!(f, "NotConnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected(_) => write!(f, "Connected"),
            ConnectionState::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// A running bridge as returned by `Session::connect` and `Session::accept`
pub struct Connection<H> {
    pub bridge: Arc<Bridge>,
    pub handler: Arc<H>,
    pub handshake: HandshakeOutcome,
    /// completes with the stop reason when the bridge terminates
    pub looper: JoinHandle<StopReason>,
}

/// Establishes bridges over TCP and tracks the state of the current one. A session holds at most
///  one bridge at a time, and goes back to `NotConnected` when that bridge's looper terminates.
///
/// The handler factory receives the new bridge and a `StreamMaker` for auxiliary connections:
///  the connecting side connects to the peer's address again, the accepting side accepts on the
///  same listener.
pub struct Session {
    config: BridgeConfig,
    state: Arc<Mutex<ConnectionState>>,
}

impl Session {
    pub fn new(config: BridgeConfig) -> anyhow::Result<Session> {
        config.validate()?;
        Ok(Session {
            config,
            state: Arc::new(Mutex::new(ConnectionState::NotConnected)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_connecting(&self) -> anyhow::Result<()> {
        let mut state = self.lock_state();
        if !matches!(*state, ConnectionState::NotConnected) {
            bail!("session is {:?}", *state);
        }
        *state = ConnectionState::Connecting;
        Ok(())
    }

    #[tracing::instrument(skip(self, make_handler))]
    pub async fn connect<H: SignalHandler>(
        &self,
        peer_addr: SocketAddr,
        make_handler: impl FnOnce(Arc<Bridge>, Arc<dyn StreamMaker>) -> Arc<H>,
    ) -> anyhow::Result<Connection<H>> {
        self.begin_connecting()?;

        let established = async {
            let stream = timeout(self.config.handshake_timeout, TcpStream::connect(peer_addr)).await??;
            stream.set_nodelay(true)?;
            let mut connection = Duplex::from_tcp(stream);
            let outcome = handshake::initiate(&mut connection, &self.config).await?;
            let bridge = Bridge::new(Arc::new(self.config.clone()), connection)?;
            Ok::<_, anyhow::Error>((bridge, outcome))
        }.await;

        match established {
            Ok((bridge, outcome)) => {
                let handler = make_handler(bridge.clone(), Arc::new(TcpConnector::new(peer_addr)));
                Ok(self.start(bridge, handler, outcome))
            }
            Err(e) => {
                *self.lock_state() = ConnectionState::NotConnected;
                Err(e)
            }
        }
    }

    /// Waits up to the handshake timeout for a peer to connect on `listener`, adopting the peer's
    ///  heartbeat interval.
    #[tracing::instrument(skip(self, listener, make_handler))]
    pub async fn accept<H: SignalHandler>(
        &self,
        listener: Arc<TcpListener>,
        make_handler: impl FnOnce(Arc<Bridge>, Arc<dyn StreamMaker>) -> Arc<H>,
    ) -> anyhow::Result<Connection<H>> {
        self.begin_connecting()?;

        let established = async {
            let (stream, from) = timeout(self.config.handshake_timeout, listener.accept()).await??;
            debug!("accepted connection from {:?}", from);
            stream.set_nodelay(true)?;
            let mut connection = Duplex::from_tcp(stream);
            let outcome = handshake::accept(&mut connection, &self.config).await?;
            let config = self.config.clone().with_heartbeat_interval(outcome.heartbeat_interval);
            let bridge = Bridge::new(Arc::new(config), connection)?;
            Ok::<_, anyhow::Error>((bridge, outcome))
        }.await;

        match established {
            Ok((bridge, outcome)) => {
                let handler = make_handler(bridge.clone(), Arc::new(TcpAcceptor::new(listener)));
                Ok(self.start(bridge, handler, outcome))
            }
            Err(e) => {
                *self.lock_state() = ConnectionState::NotConnected;
                Err(e)
            }
        }
    }

    fn start<H: SignalHandler>(&self, bridge: Arc<Bridge>, handler: Arc<H>, handshake: HandshakeOutcome) -> Connection<H> {
        *self.lock_state() = ConnectionState::Connected(bridge.clone());
        info!("session established, clock skew {} ms", handshake.clock_skew_millis);

        let state = self.state.clone();
        let looper_bridge = bridge.clone();
        let looper_handler: Arc<dyn SignalHandler> = handler.clone();
        let looper = tokio::spawn(async move {
            let reason = looper_bridge.run_looper(looper_handler).await;

            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            let is_current = match &*state {
                ConnectionState::Connected(current) => Arc::ptr_eq(current, &looper_bridge),
                ConnectionState::Disconnecting => true,
                _ => false,
            };
            if is_current {
                *state = ConnectionState::NotConnected;
            }
            reason
        });

        Connection { bridge, handler, handshake, looper }
    }

    /// Stops the current bridge. The session is `NotConnected` again once its looper terminated.
    pub async fn disconnect(&self) {
        let bridge = {
            let mut state = self.lock_state();
            let ConnectionState::Connected(bridge) = &*state else {
                return;
            };
            let bridge = bridge.clone();
            *state = ConnectionState::Disconnecting;
            bridge
        };
        bridge.stop_looper().await;
    }
}
