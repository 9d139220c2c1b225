//! Links that carry provisioning frames to and from a device
//!
//! A transport moves opaque frame bytes: requests go out with
//! [`ProvisioningTransport::send`], responses arrive on a broadcast stream
//! that any number of listeners can [`subscribe`](ProvisioningTransport::subscribe)
//! to. [`exchange`] pairs the two into a request/response call.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sensorlink_proto::Frame;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::model::TransportKind;

pub mod ble;
pub mod softap;

pub use ble::BleTransport;
pub use softap::SoftApTransport;

/// Frames buffered per subscriber before the oldest are dropped
pub const RESPONSE_BUFFER: usize = 32;

/// Capability set shared by every transport
pub trait ProvisioningTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Open the link and locate the session and config channels. On failure
    /// any partially opened link is torn down before returning.
    fn connect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close the link. Idempotent; failures are logged, not returned, and the
    /// transport is always left disconnected.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    /// Write one frame to the config channel, waiting for the link-level
    /// acknowledgement
    fn send(&self, frame: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Live stream of inbound frames from the session channel. A subscriber
    /// only sees frames that arrive after it subscribed.
    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>>;

    fn is_connected(&self) -> bool;

    /// Disconnect and release everything the transport holds. Safe to call
    /// more than once.
    fn dispose(&mut self) -> impl Future<Output = ()> + Send;
}

/// Fan-out of inbound frames to every subscriber
///
/// Each subscriber gets its own ordered queue of [`RESPONSE_BUFFER`] frames;
/// a subscriber that falls behind loses the oldest frames, never the order.
#[derive(Clone)]
pub struct ResponseBroadcast {
    tx: Arc<Mutex<Option<broadcast::Sender<Vec<u8>>>>>,
}

impl ResponseBroadcast {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(RESPONSE_BUFFER);
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    fn sender(&self) -> Option<broadcast::Sender<Vec<u8>>> {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        match self.sender() {
            Some(tx) => tx.subscribe(),
            // closed: hand out a receiver that reports Closed straight away
            None => broadcast::channel(1).1,
        }
    }

    /// Deliver a frame to current subscribers; dropped if there are none
    pub fn publish(&self, frame: Vec<u8>) {
        if let Some(tx) = self.sender() {
            let _ = tx.send(frame);
        }
    }

    /// End the stream for every subscriber
    pub fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

impl Default for ResponseBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

static NEXT_SEQ: AtomicU32 = AtomicU32::new(1);

/// Sequence number for the next request; never zero
fn next_seq() -> u32 {
    loop {
        let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
        if seq != 0 {
            return seq;
        }
    }
}

/// Send `payload` to `endpoint` and wait for the device's response frame
///
/// Each request carries a fresh sequence number and only a frame echoing it
/// is accepted, so a late reply to an earlier, timed-out attempt is skipped
/// rather than taken as the answer to this one. The whole exchange,
/// including the write, is bounded by `timeout`.
pub async fn exchange<T: ProvisioningTransport>(
    transport: &T,
    endpoint: &str,
    payload: Vec<u8>,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    if !transport.is_connected() {
        return Err(TransportError::NotConnected);
    }
    // subscribe before writing so the response cannot be missed
    let mut responses = transport.subscribe();
    let seq = next_seq();
    let request = Frame::new(endpoint, payload).with_seq(seq).to_bytes();

    let round_trip = async {
        transport.send(&request).await?;
        loop {
            match responses.recv().await {
                Ok(bytes) => match Frame::from_bytes(&bytes) {
                    Ok(frame) if frame.endpoint == endpoint && frame.seq == seq => {
                        return Ok(frame.payload);
                    }
                    Ok(frame) => debug!(
                        expected = %endpoint,
                        seq,
                        got = %frame.endpoint,
                        got_seq = frame.seq,
                        "skipping stale or foreign frame"
                    ),
                    Err(e) => warn!(error = %e, "skipping undecodable frame"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "response stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(TransportError::NotConnected);
                }
            }
        }
    };

    tokio::time::timeout(timeout, round_trip)
        .await
        .map_err(|_| TransportError::timeout(endpoint, timeout))?
}

/// The transports this crate provides
pub enum Transport {
    Ble(BleTransport),
    SoftAp(SoftApTransport),
}

impl ProvisioningTransport for Transport {
    fn kind(&self) -> TransportKind {
        match self {
            Transport::Ble(t) => t.kind(),
            Transport::SoftAp(t) => t.kind(),
        }
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        match self {
            Transport::Ble(t) => t.connect().await,
            Transport::SoftAp(t) => t.connect().await,
        }
    }

    async fn disconnect(&mut self) {
        match self {
            Transport::Ble(t) => t.disconnect().await,
            Transport::SoftAp(t) => t.disconnect().await,
        }
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        match self {
            Transport::Ble(t) => t.send(frame).await,
            Transport::SoftAp(t) => t.send(frame).await,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        match self {
            Transport::Ble(t) => t.subscribe(),
            Transport::SoftAp(t) => t.subscribe(),
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Transport::Ble(t) => t.is_connected(),
            Transport::SoftAp(t) => t.is_connected(),
        }
    }

    async fn dispose(&mut self) {
        match self {
            Transport::Ble(t) => t.dispose().await,
            Transport::SoftAp(t) => t.dispose().await,
        }
    }
}
