//! Provisioning state machine
//!
//! ```text
//! Idle -> Connected -> ConfigReceived -> ConfigApplied -> Success
//!                                                      \-> Failed
//! ```
//!
//! The provisioner is the only place that decides between retrying,
//! giving up, and marking the attempt `Failed`. Calls are sequential: one
//! device, one operation at a time.

use std::time::Duration;

use secrecy::SecretString;
use sensorlink_proto::config::WifiStationState;
use sensorlink_proto::version::VersionInfo;
use tracing::{debug, error, info, warn};

use crate::config::ProvisioningConfig;
use crate::discovery::ScanSession;
use crate::error::ProvisionError;
use crate::model::{
    ProvisioningDevice, ProvisioningSession, ProvisioningStatus, WiFiCredentials, WiFiNetwork,
    WifiStatusReport,
};
use crate::repository::ProvisioningRepository;

/// Run `$call` until it succeeds, fails with an error that is not
/// retryable, or `max_retries` retries have been spent
macro_rules! with_retries {
    ($self:ident, $operation:literal, $call:expr) => {{
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            info!(operation = $operation, attempt, "attempt");
            match $call.await {
                Ok(value) => break Ok(value),
                Err(e) if e.is_retryable() && attempt <= $self.config.max_retries => {
                    warn!(operation = $operation, attempt, error = %e, "retrying");
                    tokio::time::sleep($self.config.timeouts.retry_backoff).await;
                }
                Err(e) if e.is_retryable() => {
                    break Err(ProvisionError::RetriesExhausted {
                        operation: $operation,
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => break Err(e),
            }
        }
    }};
}

/// Errors raised before anything crossed the link
fn is_precondition(e: &ProvisionError) -> bool {
    matches!(
        e,
        ProvisionError::InvalidState { .. }
            | ProvisionError::NotSecure
            | ProvisionError::Unsupported(_)
            | ProvisionError::InvalidCredentials(_)
    )
}

pub struct Provisioner<R> {
    repository: R,
    config: ProvisioningConfig,
    status: ProvisioningStatus,
    last_error: Option<String>,
}

impl<R: ProvisioningRepository> Provisioner<R> {
    pub fn new(repository: R, config: ProvisioningConfig) -> Self {
        Self {
            repository,
            config,
            status: ProvisioningStatus::Idle,
            last_error: None,
        }
    }

    pub fn status(&self) -> ProvisioningStatus {
        self.status
    }

    /// Session with the connected device, if any
    pub fn session(&self) -> Option<&ProvisioningSession> {
        self.repository.session()
    }

    /// Display text of the error that last changed the state
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    fn transition(&mut self, to: ProvisioningStatus) {
        if self.status != to {
            info!(from = %self.status, to = %to, "provisioning state");
            self.status = to;
        }
    }

    /// Record a failed step; link failures end the attempt
    fn fail(&mut self, operation: &'static str, e: ProvisionError) -> ProvisionError {
        if is_precondition(&e) {
            warn!(operation, error = %e, "refused");
            return e;
        }
        error!(operation, error = %e, "failed");
        self.last_error = Some(e.to_string());
        self.transition(ProvisioningStatus::Failed);
        e
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: &[ProvisioningStatus],
    ) -> Result<(), ProvisionError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(ProvisionError::InvalidState {
                operation,
                state: self.status,
            })
        }
    }

    /// States in which a connected device may be talked to
    fn require_active(&self, operation: &'static str) -> Result<(), ProvisionError> {
        self.require(
            operation,
            &[
                ProvisioningStatus::Connected,
                ProvisioningStatus::ConfigReceived,
                ProvisioningStatus::ConfigApplied,
            ],
        )
    }

    fn require_secure(&self) -> Result<(), ProvisionError> {
        if self.session().is_some_and(ProvisioningSession::is_secure) {
            Ok(())
        } else {
            Err(ProvisionError::NotSecure)
        }
    }

    /// Look for devices; `None` uses the configured scan timeout
    pub async fn scan(&self, timeout: Option<Duration>) -> Result<ScanSession, ProvisionError> {
        let timeout = timeout.unwrap_or(self.config.timeouts.scan_timeout);
        info!(?timeout, "scanning for devices");
        Ok(self.repository.discover(timeout).await?)
    }

    /// Connect to `device`. Allowed from `Idle` and from the terminal
    /// states, which are left behind by a fresh connection.
    pub async fn connect(&mut self, device: &ProvisioningDevice) -> Result<(), ProvisionError> {
        self.require(
            "connect",
            &[
                ProvisioningStatus::Idle,
                ProvisioningStatus::Success,
                ProvisioningStatus::Failed,
            ],
        )?;
        if self.status.is_terminal() {
            self.disconnect().await;
        }

        info!(device = %device.name, transport = %device.transport, "connecting");
        match with_retries!(self, "connect", self.repository.connect(device)) {
            Ok(()) => {
                self.last_error = None;
                self.transition(ProvisioningStatus::Connected);
                Ok(())
            }
            Err(e) => {
                error!(device = %device.name, error = %e, "connect failed");
                self.repository.disconnect().await;
                self.last_error = Some(e.to_string());
                self.transition(ProvisioningStatus::Idle);
                Err(e)
            }
        }
    }

    /// Protocol version and capabilities; does not change state
    pub async fn query_version(&mut self) -> Result<VersionInfo, ProvisionError> {
        self.require_active("query version")?;
        self.repository.query_version().await.inspect_err(|e| {
            warn!(error = %e, "version query failed");
        })
    }

    /// Authenticate with the device's proof of possession. A rejected proof
    /// is final for this attempt.
    pub async fn establish_secure_session(
        &mut self,
        pop: &SecretString,
    ) -> Result<(), ProvisionError> {
        self.require("establish secure session", &[ProvisioningStatus::Connected])?;

        match with_retries!(self, "establish secure session", self.repository.establish_session(pop)) {
            Ok(()) => {
                info!("session secured");
                Ok(())
            }
            Err(e) => Err(self.fail("establish secure session", e)),
        }
    }

    /// Networks visible to the device; does not change state
    pub async fn scan_wifi(&mut self) -> Result<Vec<WiFiNetwork>, ProvisionError> {
        self.require_active("scan wifi")?;
        self.require_secure()?;
        let networks = self.repository.scan_wifi().await.inspect_err(|e| {
            warn!(error = %e, "wifi scan failed");
        })?;
        info!(count = networks.len(), "wifi scan complete");
        Ok(networks)
    }

    /// Send credentials, then tell the device to join
    ///
    /// The credentials are consumed; the password is wiped once the
    /// encrypted request has been built.
    pub async fn provision_wifi(
        &mut self,
        credentials: WiFiCredentials,
    ) -> Result<(), ProvisionError> {
        self.require_active("provision wifi")?;
        self.require_secure()?;
        credentials.validate()?;

        if let Err(e) = with_retries!(
            self,
            "send wifi config",
            self.repository.send_wifi_config(&credentials)
        ) {
            return Err(self.fail("send wifi config", e));
        }
        drop(credentials);
        self.transition(ProvisioningStatus::ConfigReceived);

        if let Err(e) = with_retries!(self, "apply wifi config", self.repository.apply_wifi_config())
        {
            return Err(self.fail("apply wifi config", e));
        }
        self.transition(ProvisioningStatus::ConfigApplied);
        Ok(())
    }

    /// Poll the device's station state once
    ///
    /// Only after credentials were applied in this session does the report
    /// move the state: `Connected` to `Success` and a failed join to
    /// `Failed`. Anything else, or a report in an earlier state, leaves the
    /// state as it is.
    pub async fn get_status(&mut self) -> Result<ProvisioningStatus, ProvisionError> {
        self.require_active("get status")?;
        self.require_secure()?;

        let report = match with_retries!(self, "get status", self.repository.wifi_status()) {
            Ok(report) => report,
            Err(e) => return Err(self.fail("get status", e)),
        };

        if self.status != ProvisioningStatus::ConfigApplied {
            debug!(state = ?report.state, status = %self.status, "station state before apply");
            return Ok(self.status);
        }
        match report.state {
            WifiStationState::Connected => {
                info!("device joined the network");
                self.transition(ProvisioningStatus::Success);
            }
            WifiStationState::ConnectionFailed => {
                error!(reason = ?report.fail_reason, "device could not join the network");
                self.last_error = Some(format!("device failed to join: {:?}", report.fail_reason));
                self.transition(ProvisioningStatus::Failed);
            }
            WifiStationState::Connecting | WifiStationState::Disconnected => {}
        }
        Ok(self.status)
    }

    /// The device's station state as it reports it, e.g. for a device
    /// provisioned in an earlier session. Does not change state.
    pub async fn station_status(&mut self) -> Result<WifiStatusReport, ProvisionError> {
        self.require_active("station status")?;
        self.require_secure()?;
        with_retries!(self, "station status", self.repository.wifi_status()).inspect_err(|e| {
            warn!(error = %e, "station status query failed");
        })
    }

    /// Poll until the device reaches a terminal state
    ///
    /// Gives up with [`ProvisionError::Timeout`] and `Failed` after the
    /// configured completion timeout.
    pub async fn wait_for_completion(&mut self) -> Result<ProvisioningStatus, ProvisionError> {
        if self.status.is_terminal() {
            return Ok(self.status);
        }
        let limit = self.config.timeouts.completion_timeout;
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let status = self.get_status().await?;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(self.fail("wait for completion", ProvisionError::Timeout(limit)));
            }
            tokio::time::sleep(self.config.timeouts.status_poll_interval).await;
        }
    }

    /// Opaque application payload; does not change state
    pub async fn send_custom_data(&mut self, data: &[u8]) -> Result<Vec<u8>, ProvisionError> {
        self.require_active("send custom data")?;
        self.require_secure()?;
        self.repository.send_custom_data(data).await.inspect_err(|e| {
            warn!(error = %e, "custom data exchange failed");
        })
    }

    /// Release the link and the session key. Allowed from any state.
    pub async fn disconnect(&mut self) {
        self.repository.disconnect().await;
        self.transition(ProvisioningStatus::Idle);
    }

    /// Connect, authenticate, send credentials and wait for the outcome
    ///
    /// The link is released afterwards whatever the result; the returned
    /// status is the state reached before disconnecting.
    pub async fn provision(
        &mut self,
        device: &ProvisioningDevice,
        pop: &SecretString,
        credentials: WiFiCredentials,
    ) -> Result<ProvisioningStatus, ProvisionError> {
        let result = self.run(device, pop, credentials).await;
        let reached = self.status;
        self.disconnect().await;
        result.map(|_| reached)
    }

    async fn run(
        &mut self,
        device: &ProvisioningDevice,
        pop: &SecretString,
        credentials: WiFiCredentials,
    ) -> Result<ProvisioningStatus, ProvisionError> {
        self.connect(device).await?;
        if let Err(e) = self.query_version().await {
            warn!(error = %e, "continuing without version information");
        }
        self.establish_secure_session(pop).await?;
        self.provision_wifi(credentials).await?;
        self.wait_for_completion().await
    }
}
