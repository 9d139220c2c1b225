//! HTTP transport over the device's own access point
//!
//! The client must already be joined to the device's provisioning network.
//! Each endpoint is a `POST /<endpoint>` whose response body is the
//! device's reply; replies are re-framed and published on the response
//! broadcast so callers see the same stream as on BLE.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use sensorlink_proto::Frame;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{ProvisioningTransport, ResponseBroadcast};
use crate::config::SoftApConfig;
use crate::error::TransportError;
use crate::model::TransportKind;

pub struct SoftApTransport {
    config: SoftApConfig,
    connection_timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
    /// Session cookie set by the device, replayed as `name=value`
    cookie: Mutex<Option<String>>,
    responses: ResponseBroadcast,
    connected: AtomicBool,
}

impl SoftApTransport {
    pub fn new(config: SoftApConfig, connection_timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            config,
            connection_timeout,
            client,
            cookie: Mutex::new(None),
            responses: ResponseBroadcast::new(),
            connected: AtomicBool::new(false),
        }
    }

    fn uri(&self, endpoint: &str) -> String {
        format!("http://{}:{}/{endpoint}", self.config.host, self.config.port)
    }

    fn stored_cookie(&self) -> Option<String> {
        self.cookie
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn remember_cookies(&self, headers: &hyper::HeaderMap) {
        for value in headers.get_all(hyper::header::SET_COOKIE) {
            let Ok(value) = value.to_str() else { continue };
            if let Ok(cookie) = cookie::Cookie::parse(value) {
                debug!(name = cookie.name(), "device set session cookie");
                *self
                    .cookie
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) =
                    Some(format!("{}={}", cookie.name(), cookie.value()));
            }
        }
    }

    async fn post(&self, endpoint: &str, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let mut request = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(self.uri(endpoint))
            .header(hyper::header::CONTENT_TYPE, "application/octet-stream")
            .header(hyper::header::ACCEPT, "text/plain");
        if let Some(cookie) = self.stored_cookie() {
            request = request.header(hyper::header::COOKIE, cookie);
        }
        let request = request
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| TransportError::InvalidFrame(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status();
        self.remember_cookies(response.headers());
        if !status.is_success() {
            return Err(TransportError::Http(format!("{endpoint} returned {status}")));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?
            .to_bytes();
        Ok(body.to_vec())
    }
}

impl ProvisioningTransport for SoftApTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::SoftAp
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let address = (self.config.host.as_str(), self.config.port);
        let timeout = self.connection_timeout;
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(address)).await {
            Ok(Ok(_probe)) => {
                info!(host = %self.config.host, port = self.config.port, "access point reachable");
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::Link(format!(
                "{}:{} unreachable: {e}",
                self.config.host, self.config.port
            ))),
            Err(_) => Err(TransportError::timeout("access point connect", timeout)),
        }
    }

    async fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        *self
            .cookie
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let frame = Frame::from_bytes(frame).map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
        let reply = self.post(&frame.endpoint, frame.payload).await?;
        // the HTTP response answers this request, so it takes its sequence
        self.responses
            .publish(Frame::new(frame.endpoint, reply).with_seq(frame.seq).to_bytes());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.responses.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn dispose(&mut self) {
        self.disconnect().await;
        self.responses.close();
    }
}
