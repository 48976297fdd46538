pub mod slot_pool;

use std::sync::{Arc, Weak};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tracing::{debug, trace, warn};
use crate::bridge::{Bridge, SignalHandler};
use crate::bridge::frame::put_sized_header;
use crate::bridge::signal::{PayloadSize, Signal};
use crate::error::{BridgeError, ProtocolViolation};
use crate::request::slot_pool::{Lookup, SlotPool};
use crate::util::monitor::{Monitor, WaitError, WaitPolicy};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Allocated by the sender of a request that expects a reply, `1..=response_id_limit`. `0`
///  means that no reply is expected.
pub type ResponseId = u16;
/// Allocated locally by the receiver of a request that is cached for later retrieval
pub type RequestId = u16;

/// Application callbacks for incoming requests and responses. They run on the looper task.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Returns `true` to cache the request's data for `retrieve_request(request_id)`, `false` to
    ///  discard it. `request_id` is `None` if all request ids are in use, in which case the
    ///  request can not be cached.
    async fn on_request(&self, bridge: &Arc<RequestBridge>, response_id: ResponseId, request_id: Option<RequestId>, data: &[u8]) -> bool;

    /// Returns `true` to store the response for `retrieve_response(response_id)`, `false` to
    ///  discard it and free the response id.
    async fn on_response(&self, bridge: &Arc<RequestBridge>, response_id: ResponseId, data: &[u8]) -> bool;
}

/// Request / response correlation on top of a bridge.
///
/// Every request frame carries a trailing response id. A request that expects a reply gets a
///  fresh id from a bounded pool, and the peer tags its response with that same id, so the
///  response ends up in the matching mailbox where `retrieve_response` picks it up exactly once.
pub struct RequestBridge {
    bridge: Arc<Bridge>,
    handler: Arc<dyn RequestHandler>,
    responses: Monitor<SlotPool>,
    requests: Monitor<SlotPool>,
    myself: Weak<RequestBridge>,
}

impl RequestBridge {
    /// The returned value is the bridge's `SignalHandler`, to be passed to `Bridge::run_looper`.
    pub fn new(bridge: Arc<Bridge>, handler: Arc<dyn RequestHandler>) -> Arc<RequestBridge> {
        let response_pool = SlotPool::new(1, bridge.config().response_id_limit.safe_cast());
        let request_pool = SlotPool::new(0, bridge.config().request_id_limit.safe_cast());

        Arc::new_cyclic(|myself| RequestBridge {
            bridge,
            handler,
            responses: Monitor::new(response_pool),
            requests: Monitor::new(request_pool),
            myself: myself.clone(),
        })
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub async fn acquire_response_id(&self, wait: WaitPolicy) -> Result<ResponseId, BridgeError> {
        self.responses.wait_for(wait, || self.bridge.is_alive(), SlotPool::try_acquire).await
            .map(|id| id.prechecked_cast())
            .map_err(limit_error)
    }

    /// Frees a response id, returning the response if it had arrived
    pub fn release_response_id(&self, response_id: ResponseId) -> Option<Bytes> {
        self.responses.update(|pool| pool.release(response_id.into()))
    }

    pub async fn acquire_request_id(&self, wait: WaitPolicy) -> Result<RequestId, BridgeError> {
        self.requests.wait_for(wait, || self.bridge.is_alive(), SlotPool::try_acquire).await
            .map(|id| id.prechecked_cast())
            .map_err(limit_error)
    }

    pub fn release_request_id(&self, request_id: RequestId) -> Option<Bytes> {
        self.requests.update(|pool| pool.release(request_id.into()))
    }

    /// Sends a request, returning the response id the reply will carry, or `0` if no reply is
    ///  expected. `wait` applies to acquiring the response id.
    pub async fn send_request(&self, payload: &[u8], expect_reply: bool, wait: WaitPolicy) -> Result<ResponseId, BridgeError> {
        if !self.bridge.is_alive() {
            return Err(BridgeError::NotAlive);
        }
        self.check_size(payload)?;

        let response_id = if expect_reply {
            self.acquire_response_id(wait).await?
        }
        else {
            0
        };

        let frame = self.encode(Signal::RequestByte, Signal::RequestShort, payload, response_id);
        if let Err(e) = self.bridge.send_frame(&frame).await {
            debug!("failed to send request: {}", e);
            if expect_reply {
                self.release_response_id(response_id);
            }
            return Err(BridgeError::StreamClosed);
        }

        trace!("sent request with {} bytes, response id {}", payload.len(), response_id);
        Ok(response_id)
    }

    pub async fn send_response(&self, response_id: ResponseId, payload: &[u8]) -> Result<(), BridgeError> {
        if !self.bridge.is_alive() {
            return Err(BridgeError::NotAlive);
        }
        if response_id == 0 || response_id > self.bridge.config().response_id_limit {
            return Err(BridgeError::InvalidId);
        }
        self.check_size(payload)?;

        let frame = self.encode(Signal::ResponseByte, Signal::ResponseShort, payload, response_id);
        if let Err(e) = self.bridge.send_frame(&frame).await {
            debug!("failed to send response: {}", e);
            self.release_response_id(response_id);
            return Err(BridgeError::StreamClosed);
        }

        trace!("sent response with {} bytes for response id {}", payload.len(), response_id);
        Ok(())
    }

    /// Takes a cached request out of its mailbox, waiting for it if the id is allocated but
    ///  the request is not cached yet. On timeout the id stays allocated.
    pub async fn retrieve_request(&self, request_id: RequestId, wait: WaitPolicy) -> Result<Bytes, BridgeError> {
        self.retrieve(&self.requests, request_id.into(), wait).await
    }

    /// Takes a response out of its mailbox, waiting for it to arrive. Each response can be
    ///  retrieved once, after that the id is free for reuse. On timeout the id stays allocated.
    pub async fn retrieve_response(&self, response_id: ResponseId, wait: WaitPolicy) -> Result<Bytes, BridgeError> {
        self.retrieve(&self.responses, response_id.into(), wait).await
    }

    async fn retrieve(&self, pool: &Monitor<SlotPool>, id: u32, wait: WaitPolicy) -> Result<Bytes, BridgeError> {
        if !pool.lock().contains_id(id) {
            return Err(BridgeError::InvalidId);
        }

        let result = pool.wait_for(wait, || self.bridge.is_alive(), |slots| match slots.take(id) {
            Lookup::Unknown => Some(Err(BridgeError::NotFound)),
            Lookup::Pending => None,
            Lookup::Taken(data) => Some(Ok(data)),
        }).await;

        match result {
            Ok(Ok(data)) => {
                // the id is free again
                pool.notify_all();
                Ok(data)
            }
            Ok(Err(e)) => Err(e),
            Err(WaitError::TimedOut) => Err(BridgeError::NotArrived),
            Err(WaitError::NotAlive) => Err(BridgeError::NotAlive),
        }
    }

    /// Waits until no response ids are allocated any more
    pub async fn join_responses(&self) -> Result<(), BridgeError> {
        self.responses.wait_for(WaitPolicy::Indefinitely, || self.bridge.is_alive(), |pool| pool.is_empty().then_some(())).await
            .map_err(|_| BridgeError::NotAlive)
    }

    fn check_size(&self, payload: &[u8]) -> Result<(), BridgeError> {
        let config = self.bridge.config();
        if payload.len() + config.response_id_len() > config.max_packet_size {
            return Err(BridgeError::DataSizeExceeded);
        }
        Ok(())
    }

    fn encode(&self, byte_signal: Signal, short_signal: Signal, payload: &[u8], response_id: ResponseId) -> BytesMut {
        let id_len = self.bridge.config().response_id_len();

        let mut buf = BytesMut::with_capacity(3 + payload.len() + id_len);
        put_sized_header(&mut buf, byte_signal, short_signal, payload.len() + id_len);
        buf.put_slice(payload);
        if id_len == 1 {
            buf.put_u8(response_id.prechecked_cast());
        }
        else {
            buf.put_u16(response_id);
        }
        buf
    }

    async fn on_request(&self, myself: &Arc<RequestBridge>, response_id: ResponseId, data: &[u8]) {
        let request_id: Option<RequestId> = self.requests.lock()
            .try_acquire()
            .map(|id| id.prechecked_cast());

        if self.handler.on_request(myself, response_id, request_id, data).await {
            match request_id {
                Some(request_id) => {
                    self.requests.update(|pool| pool.fill(request_id.into(), Bytes::copy_from_slice(data)));
                }
                None => warn!("all request ids are in use - discarding request instead of caching it"),
            }
        }
        else if let Some(request_id) = request_id {
            self.release_request_id(request_id);
        }
    }

    async fn on_response(&self, myself: &Arc<RequestBridge>, response_id: ResponseId, data: &[u8]) {
        if self.handler.on_response(myself, response_id, data).await {
            let stored = self.responses.update(|pool| pool.fill(response_id.into(), Bytes::copy_from_slice(data)));
            if !stored {
                debug!("discarding response for response id {} which is not waiting for one", response_id);
            }
        }
        else {
            self.release_response_id(response_id);
        }
    }
}

fn limit_error(e: WaitError) -> BridgeError {
    match e {
        WaitError::TimedOut => BridgeError::LimitReached,
        WaitError::NotAlive => BridgeError::NotAlive,
    }
}

#[async_trait]
impl SignalHandler for RequestBridge {
    fn payload_size(&self, signal: u8) -> PayloadSize {
        match Signal::try_from(signal) {
            Ok(Signal::RequestByte) | Ok(Signal::ResponseByte) => PayloadSize::BytePrefixed,
            Ok(Signal::RequestShort) | Ok(Signal::ResponseShort) => PayloadSize::ShortPrefixed,
            _ => PayloadSize::Invalid,
        }
    }

    async fn handle_signal(&self, signal: u8, payload: &[u8]) -> anyhow::Result<()> {
        let Some(myself) = self.myself.upgrade() else {
            return Ok(());
        };

        let id_len = self.bridge.config().response_id_len();
        if payload.len() < id_len {
            return Err(ProtocolViolation(format!("frame with signal {} is too short for a response id", signal)).into());
        }
        let (data, id_bytes) = payload.split_at(payload.len() - id_len);
        let response_id = if id_len == 1 {
            id_bytes[0].into()
        }
        else {
            u16::from_be_bytes([id_bytes[0], id_bytes[1]])
        };

        match Signal::try_from(signal) {
            Ok(Signal::RequestByte) | Ok(Signal::RequestShort) => self.on_request(&myself, response_id, data).await,
            Ok(Signal::ResponseByte) | Ok(Signal::ResponseShort) => self.on_response(&myself, response_id, data).await,
            _ => return Err(ProtocolViolation(format!("signal {} is not a request or response", signal)).into()),
        }
        Ok(())
    }

    async fn on_stopped(&self) {
        self.responses.update(SlotPool::clear);
        self.requests.update(SlotPool::clear);
    }
}
