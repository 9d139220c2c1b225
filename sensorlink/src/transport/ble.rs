//! BLE GATT transport
//!
//! Requests are written with response to the config characteristic; the
//! device answers with notifications on the session characteristic, which a
//! background task forwards to the response broadcast. A notification holds
//! at most ATT_MTU - 3 bytes, so the task reassembles longer frames from
//! consecutive notifications before publishing them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use btleplug::api::{CharPropFlags, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::StreamExt;
use sensorlink_proto::FrameAssembler;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ProvisioningTransport, ResponseBroadcast};
use crate::config::BleConfig;
use crate::error::TransportError;
use crate::model::TransportKind;

struct Link {
    session: Characteristic,
    config: Characteristic,
    pump: JoinHandle<()>,
    alive: Arc<AtomicBool>,
}

pub struct BleTransport {
    peripheral: Peripheral,
    config: BleConfig,
    connection_timeout: Duration,
    responses: ResponseBroadcast,
    link: Option<Link>,
}

impl BleTransport {
    pub fn new(peripheral: Peripheral, config: BleConfig, connection_timeout: Duration) -> Self {
        Self {
            peripheral,
            config,
            connection_timeout,
            responses: ResponseBroadcast::new(),
            link: None,
        }
    }

    async fn open_link(&self) -> Result<Link, TransportError> {
        self.peripheral.connect().await?;
        self.peripheral.discover_services().await?;

        let services = self.peripheral.services();
        let service = services
            .iter()
            .find(|s| s.uuid == self.config.service_uuid)
            .ok_or(TransportError::ServiceNotFound(self.config.service_uuid))?;

        let find = |uuid: Uuid| {
            service
                .characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or(TransportError::CharacteristicNotFound(uuid))
        };
        let session = find(self.config.session_uuid)?;
        let config = find(self.config.config_uuid)?;

        if !session
            .properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
        {
            return Err(TransportError::NotifyUnsupported(session.uuid));
        }

        let mut notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&session).await?;

        let alive = Arc::new(AtomicBool::new(true));
        let pump = {
            let alive = alive.clone();
            let responses = self.responses.clone();
            let session_uuid = session.uuid;
            tokio::spawn(async move {
                let mut assembler = FrameAssembler::new();
                while let Some(notification) = notifications.next().await {
                    if notification.uuid != session_uuid {
                        continue;
                    }
                    match assembler.push(&notification.value) {
                        Ok(frames) => frames.into_iter().for_each(|f| responses.publish(f)),
                        Err(e) => warn!(error = %e, "dropping unframed notification data"),
                    }
                }
                debug!("notification stream ended");
                alive.store(false, Ordering::SeqCst);
            })
        };

        Ok(Link {
            session,
            config,
            pump,
            alive,
        })
    }

    async fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.pump.abort();
            if let Err(e) = self.peripheral.unsubscribe(&link.session).await {
                debug!(error = %e, "unsubscribe failed");
            }
        }
        match self.peripheral.is_connected().await {
            Ok(false) => {}
            _ => {
                if let Err(e) = self.peripheral.disconnect().await {
                    warn!(error = %e, "bluetooth disconnect failed");
                }
            }
        }
    }
}

impl ProvisioningTransport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        // a dead link left over from an earlier drop
        self.close_link().await;

        let timeout = self.connection_timeout;
        let result = match tokio::time::timeout(timeout, self.open_link()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout("bluetooth connect", timeout)),
        };

        match result {
            Ok(link) => {
                info!(address = %self.peripheral.address(), "bluetooth link up");
                self.link = Some(link);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "bluetooth connect failed, tearing down");
                self.close_link().await;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.close_link().await;
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let link = self
            .link
            .as_ref()
            .filter(|link| link.alive.load(Ordering::SeqCst))
            .ok_or(TransportError::NotConnected)?;

        self.peripheral
            .write(&link.config, frame, WriteType::WithResponse)
            .await
            .map_err(|e| match TransportError::from(e) {
                TransportError::Link(reason) => TransportError::WriteRejected(reason),
                other => other,
            })
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.responses.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.alive.load(Ordering::SeqCst))
    }

    async fn dispose(&mut self) {
        self.close_link().await;
        self.responses.close();
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Some(link) = &self.link {
            link.pump.abort();
        }
    }
}
