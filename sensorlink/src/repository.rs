//! Device operations the provisioner is built on
//!
//! [`ProvisioningRepository`] is the boundary between the state machine and
//! the wire. [`LinkRepository`] implements it over a [`Discovery`] source:
//! it owns the open transport and the session, frames every request, and
//! encrypts everything after the handshake with the session key.

use std::marker::PhantomData;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use sensorlink_crypto::{EncryptedMessage, KeyAgreement, Spake2Agreement, decrypt, encrypt};
use sensorlink_proto::scan::{ScanCommand, ScanResultResponse, ScanStatusResponse};
use sensorlink_proto::version::{CAP_CUSTOM_DATA, CAP_WIFI_SCAN, VersionInfo};
use sensorlink_proto::{STATUS_SUCCESS, config, parse_status};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::config::ProvisioningConfig;
use crate::discovery::{Discovery, ScanSession};
use crate::error::{ProvisionError, TransportError};
use crate::model::{
    ProvisioningDevice, ProvisioningSession, WiFiCredentials, WiFiNetwork, WifiStatusReport,
};
use crate::session::establish_secure_session;
use crate::transport::{ProvisioningTransport, exchange};

/// Access points requested per scan result page
const SCAN_PAGE_SIZE: u8 = 4;

/// Dwell time per channel asked of the device's Wi-Fi scan
const SCAN_PERIOD_MS: u16 = 120;

/// Operations against one device at a time
pub trait ProvisioningRepository: Send {
    /// Start looking for devices
    fn discover(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<ScanSession, TransportError>> + Send;

    /// Open a link to `device`, replacing any current one
    fn connect(
        &mut self,
        device: &ProvisioningDevice,
    ) -> impl Future<Output = Result<(), ProvisionError>> + Send;

    /// Ask the device for its protocol version and capabilities
    fn query_version(&mut self) -> impl Future<Output = Result<VersionInfo, ProvisionError>> + Send;

    /// Run the handshake; on success the session holds the key
    fn establish_session(
        &mut self,
        pop: &SecretString,
    ) -> impl Future<Output = Result<(), ProvisionError>> + Send;

    /// Access points the device can see, strongest first
    fn scan_wifi(&mut self) -> impl Future<Output = Result<Vec<WiFiNetwork>, ProvisionError>> + Send;

    fn send_wifi_config(
        &mut self,
        credentials: &WiFiCredentials,
    ) -> impl Future<Output = Result<(), ProvisionError>> + Send;

    fn apply_wifi_config(&mut self) -> impl Future<Output = Result<(), ProvisionError>> + Send;

    fn wifi_status(&mut self)
    -> impl Future<Output = Result<WifiStatusReport, ProvisionError>> + Send;

    fn send_custom_data(
        &mut self,
        data: &[u8],
    ) -> impl Future<Output = Result<Vec<u8>, ProvisionError>> + Send;

    /// Release the link and wipe the session. Idempotent.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    fn is_connected(&self) -> bool;

    fn session(&self) -> Option<&ProvisioningSession>;
}

fn expect_success(endpoint: &str, reply: &[u8]) -> Result<(), ProvisionError> {
    let status = parse_status(reply).map_err(|e| ProvisionError::protocol(endpoint, e.to_string()))?;
    if status != STATUS_SUCCESS {
        return Err(ProvisionError::DeviceRejected {
            endpoint: endpoint.to_string(),
            status,
        });
    }
    Ok(())
}

/// [`ProvisioningRepository`] over real (or simulated) links
pub struct LinkRepository<D: Discovery, K = Spake2Agreement> {
    discovery: D,
    config: ProvisioningConfig,
    transport: Option<D::Transport>,
    session: Option<ProvisioningSession>,
    agreement: PhantomData<fn() -> K>,
}

impl<D: Discovery> LinkRepository<D> {
    pub fn new(discovery: D, config: ProvisioningConfig) -> Self {
        Self::with_agreement(discovery, config)
    }
}

impl<D: Discovery, K: KeyAgreement + Default> LinkRepository<D, K> {
    /// Repository whose handshakes use `K`
    pub fn with_agreement(discovery: D, config: ProvisioningConfig) -> Self {
        Self {
            discovery,
            config,
            transport: None,
            session: None,
            agreement: PhantomData,
        }
    }

    fn transport(&self) -> Result<&D::Transport, ProvisionError> {
        self.transport
            .as_ref()
            .ok_or(ProvisionError::Transport(TransportError::NotConnected))
    }

    fn connected_session(&self) -> Result<&ProvisioningSession, ProvisionError> {
        self.session
            .as_ref()
            .ok_or(ProvisionError::Transport(TransportError::NotConnected))
    }

    /// Encrypt `plaintext`, exchange it on `endpoint` and authenticate the reply
    async fn secure_exchange(
        &self,
        endpoint: &str,
        plaintext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, ProvisionError> {
        let transport = self.transport()?;
        let key = self
            .connected_session()?
            .session_key()
            .ok_or(ProvisionError::NotSecure)?;

        let request = encrypt(key, plaintext).to_bytes();
        let reply = exchange(
            transport,
            endpoint,
            request,
            self.config.timeouts.operation_timeout,
        )
        .await?;

        let message = EncryptedMessage::from_bytes(&reply)
            .ok_or_else(|| ProvisionError::protocol(endpoint, "response is not an encrypted message"))?;
        decrypt(key, &message)
            .into_valid()
            .map(Zeroizing::new)
            .ok_or_else(|| ProvisionError::protocol(endpoint, "response failed authentication"))
    }

    fn require(&self, capability: &str, feature: &'static str) -> Result<(), ProvisionError> {
        if self.connected_session()?.supports(capability) {
            Ok(())
        } else {
            Err(ProvisionError::Unsupported(feature))
        }
    }

    async fn scan_command(&self, command: ScanCommand) -> Result<Zeroizing<Vec<u8>>, ProvisionError> {
        self.secure_exchange(&self.config.endpoints.scan, &command.to_bytes())
            .await
    }

    async fn wait_for_scan(&self) -> Result<u16, ProvisionError> {
        let endpoint = &self.config.endpoints.scan;
        let deadline = tokio::time::Instant::now() + self.config.timeouts.scan_timeout;
        loop {
            let reply = self.scan_command(ScanCommand::Status).await?;
            let status = ScanStatusResponse::from_bytes(&reply)
                .map_err(|e| ProvisionError::protocol(endpoint, e.to_string()))?;
            if status.status != STATUS_SUCCESS {
                return Err(ProvisionError::DeviceRejected {
                    endpoint: endpoint.clone(),
                    status: status.status,
                });
            }
            if status.finished {
                return Ok(status.count);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::timeout("wifi scan", self.config.timeouts.scan_timeout).into());
            }
            tokio::time::sleep(self.config.timeouts.status_poll_interval).await;
        }
    }
}

impl<D, K> ProvisioningRepository for LinkRepository<D, K>
where
    D: Discovery,
    K: KeyAgreement + Default,
{
    async fn discover(&self, timeout: Duration) -> Result<ScanSession, TransportError> {
        self.discovery.scan(timeout).await
    }

    async fn connect(&mut self, device: &ProvisioningDevice) -> Result<(), ProvisionError> {
        self.disconnect().await;

        let mut transport = self.discovery.open(device).await?;
        transport.connect().await?;
        info!(device = %device.name, transport = %transport.kind(), "connected");

        self.transport = Some(transport);
        self.session = Some(ProvisioningSession::new(device.clone()));
        Ok(())
    }

    async fn query_version(&mut self) -> Result<VersionInfo, ProvisionError> {
        let endpoint = &self.config.endpoints.version;
        let reply = exchange(
            self.transport()?,
            endpoint,
            Vec::new(),
            self.config.timeouts.operation_timeout,
        )
        .await?;
        let info = VersionInfo::from_bytes(&reply)
            .map_err(|e| ProvisionError::protocol(endpoint, e.to_string()))?;
        debug!(version = %info.prov.ver, capabilities = ?info.prov.cap, "device version");

        if let Some(session) = self.session.as_mut() {
            session.set_version(info.clone());
        }
        Ok(info)
    }

    async fn establish_session(&mut self, pop: &SecretString) -> Result<(), ProvisionError> {
        // every handshake starts from a keyless session
        self.session = self.session.take().map(ProvisioningSession::renew);

        let mut agreement = K::default();
        let key = establish_secure_session(
            self.transport()?,
            &mut agreement,
            pop,
            &self.config.endpoints.session,
            self.config.timeouts.operation_timeout,
        )
        .await?;

        self.session
            .as_mut()
            .ok_or(ProvisionError::Transport(TransportError::NotConnected))?
            .set_session_key(key);
        Ok(())
    }

    async fn scan_wifi(&mut self) -> Result<Vec<WiFiNetwork>, ProvisionError> {
        self.require(CAP_WIFI_SCAN, "wifi scan")?;
        let endpoint = &self.config.endpoints.scan;

        let start = ScanCommand::Start {
            blocking: true,
            period_ms: SCAN_PERIOD_MS,
        };
        expect_success(endpoint, &self.scan_command(start).await?)?;
        let count = self.wait_for_scan().await?;
        debug!(count, "device finished wifi scan");

        let mut networks = Vec::with_capacity(count as usize);
        while networks.len() < count as usize {
            let remaining = count as usize - networks.len();
            let page = ScanCommand::Result {
                start: networks.len() as u16,
                count: remaining.min(SCAN_PAGE_SIZE as usize) as u8,
            };
            let reply = self.scan_command(page).await?;
            let page = ScanResultResponse::from_bytes(&reply)
                .map_err(|e| ProvisionError::protocol(endpoint, e.to_string()))?;
            if page.status != STATUS_SUCCESS {
                return Err(ProvisionError::DeviceRejected {
                    endpoint: endpoint.clone(),
                    status: page.status,
                });
            }
            if page.entries.is_empty() {
                return Err(ProvisionError::protocol(endpoint, "scan result page is empty"));
            }
            networks.extend(page.entries.into_iter().map(|entry| WiFiNetwork {
                ssid: entry.ssid,
                rssi: entry.rssi,
                auth_mode: entry.auth_mode,
                channel: entry.channel,
                bssid: entry.bssid,
            }));
        }

        networks.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        Ok(networks)
    }

    async fn send_wifi_config(&mut self, credentials: &WiFiCredentials) -> Result<(), ProvisionError> {
        credentials.validate()?;
        let endpoint = &self.config.endpoints.config;
        let request = Zeroizing::new(
            config::set_config(
                &credentials.ssid,
                credentials.password.expose_secret().as_bytes(),
            )
            .map_err(|e| ProvisionError::InvalidCredentials(e.to_string()))?,
        );
        let reply = self.secure_exchange(endpoint, &request).await?;
        expect_success(endpoint, &reply)?;
        info!(ssid = %credentials.ssid, "device accepted credentials");
        Ok(())
    }

    async fn apply_wifi_config(&mut self) -> Result<(), ProvisionError> {
        let endpoint = &self.config.endpoints.apply;
        let reply = self.secure_exchange(endpoint, &config::apply()).await?;
        expect_success(endpoint, &reply)?;
        info!("device applying credentials");
        Ok(())
    }

    async fn wifi_status(&mut self) -> Result<WifiStatusReport, ProvisionError> {
        let endpoint = &self.config.endpoints.config;
        let reply = self.secure_exchange(endpoint, &config::get_status()).await?;
        let response = config::StatusResponse::from_bytes(&reply)
            .map_err(|e| ProvisionError::protocol(endpoint, e.to_string()))?;
        if response.status != STATUS_SUCCESS {
            return Err(ProvisionError::DeviceRejected {
                endpoint: endpoint.clone(),
                status: response.status,
            });
        }
        Ok(WifiStatusReport {
            state: response.state,
            fail_reason: response.fail_reason,
        })
    }

    async fn send_custom_data(&mut self, data: &[u8]) -> Result<Vec<u8>, ProvisionError> {
        self.require(CAP_CUSTOM_DATA, "custom data")?;
        let reply = self
            .secure_exchange(&self.config.endpoints.custom_data, data)
            .await?;
        Ok(reply.to_vec())
    }

    async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.dispose().await;
            debug!("transport released");
        }
        self.session = None;
    }

    fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    fn session(&self) -> Option<&ProvisioningSession> {
        self.session.as_ref()
    }
}
