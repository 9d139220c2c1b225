//! Finding provisionable devices
//!
//! A scan is a lazy stream of sightings that ends when the scan timeout
//! elapses or the caller stops it. Stopping (or dropping) the session
//! releases the radio.

use std::collections::HashSet;
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ProvisioningConfig;
use crate::error::TransportError;
use crate::model::{ProvisioningDevice, TransportKind};
use crate::transport::{BleTransport, ProvisioningTransport, SoftApTransport, Transport};

/// Source of devices and of transports to reach them
pub trait Discovery: Send + Sync {
    type Transport: ProvisioningTransport;

    /// Start scanning; sightings are yielded until `timeout` elapses
    fn scan(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<ScanSession, TransportError>> + Send;

    /// Build an unconnected transport for a device
    fn open(
        &self,
        device: &ProvisioningDevice,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

/// Sightings of one running scan
pub struct ScanSession {
    rx: mpsc::Receiver<ProvisioningDevice>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ScanSession {
    fn running(
        rx: mpsc::Receiver<ProvisioningDevice>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            rx,
            stop: Some(stop),
            task: Some(task),
        }
    }

    /// A finished scan over known devices
    pub fn from_devices(devices: Vec<ProvisioningDevice>) -> Self {
        let (tx, rx) = mpsc::channel(devices.len().max(1));
        for device in devices {
            let _ = tx.try_send(device);
        }
        Self {
            rx,
            stop: None,
            task: None,
        }
    }

    /// Next sighting, or `None` once the scan has ended
    pub async fn next(&mut self) -> Option<ProvisioningDevice> {
        self.rx.recv().await
    }

    /// Drain the scan until it ends
    pub async fn collect(mut self) -> Vec<ProvisioningDevice> {
        let mut devices = Vec::new();
        while let Some(device) = self.next().await {
            devices.push(device);
        }
        devices
    }

    /// End the scan early and wait for the radio to be released
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        // the scan task stops the radio on its way out
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Turn advertised properties into a sighting, if the peripheral looks like
/// a provisionable device
fn sighting(
    config: &ProvisioningConfig,
    peripheral: &Peripheral,
    props: PeripheralProperties,
) -> Option<ProvisioningDevice> {
    let name = props.local_name.unwrap_or_default();
    let advertises_service = props.services.contains(&config.ble.service_uuid);
    let prefixed = !config.ble.name_prefix.is_empty() && name.starts_with(&config.ble.name_prefix);
    if !advertises_service && !prefixed {
        return None;
    }

    let pop_hint = props.manufacturer_data.values().find_map(|data| {
        std::str::from_utf8(data)
            .ok()
            .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_graphic()))
            .map(str::to_string)
    });

    Some(ProvisioningDevice {
        id: peripheral.address().to_string(),
        name,
        rssi: props.rssi,
        transport: TransportKind::Ble,
        service_uuid: advertises_service.then_some(config.ble.service_uuid),
        pop_hint,
    })
}

/// BLE discovery on the first adapter
pub struct BleDiscovery {
    adapter: Adapter,
    config: ProvisioningConfig,
}

impl BleDiscovery {
    pub async fn new(config: ProvisioningConfig) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;
        Ok(Self { adapter, config })
    }

    async fn find_peripheral(
        &self,
        device: &ProvisioningDevice,
    ) -> Result<Option<Peripheral>, TransportError> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address().to_string() == device.id {
                return Ok(Some(peripheral));
            }
            if let Some(props) = peripheral.properties().await? {
                if props.local_name.as_deref() == Some(device.name.as_str()) {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }
}

impl Discovery for BleDiscovery {
    type Transport = BleTransport;

    async fn scan(&self, timeout: Duration) -> Result<ScanSession, TransportError> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!(?timeout, "bluetooth scan started");

        let (tx, rx) = mpsc::channel(16);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let adapter = self.adapter.clone();
        let config = self.config.clone();

        let task = tokio::spawn(async move {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            let mut seen = HashSet::new();

            loop {
                let id = tokio::select! {
                    _ = &mut deadline => break,
                    _ = &mut stop_rx => break,
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDiscovered(id))
                        | Some(CentralEvent::DeviceUpdated(id)) => id,
                        Some(_) => continue,
                        None => break,
                    },
                };
                if seen.contains(&id) {
                    continue;
                }
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                if let Some(device) = sighting(&config, &peripheral, props) {
                    debug!(device = %device.name, rssi = ?device.rssi, "sighting");
                    seen.insert(id);
                    if tx.send(device).await.is_err() {
                        break;
                    }
                }
            }

            if let Err(e) = adapter.stop_scan().await {
                warn!(error = %e, "failed to stop bluetooth scan");
            }
            debug!("bluetooth scan stopped");
        });

        Ok(ScanSession::running(rx, stop_tx, task))
    }

    async fn open(&self, device: &ProvisioningDevice) -> Result<BleTransport, TransportError> {
        let mut peripheral = self.find_peripheral(device).await?;

        if peripheral.is_none() {
            // not seen yet, e.g. a device named by a QR code
            let mut scan = self.scan(self.config.timeouts.scan_timeout).await?;
            while let Some(seen) = scan.next().await {
                if seen.id == device.id || seen.name == device.name {
                    break;
                }
            }
            scan.stop().await;
            peripheral = self.find_peripheral(device).await?;
        }

        let peripheral =
            peripheral.ok_or_else(|| TransportError::DeviceNotFound(device.name.clone()))?;
        Ok(BleTransport::new(
            peripheral,
            self.config.ble.clone(),
            self.config.timeouts.connection_timeout,
        ))
    }
}

/// Discovery of a device's access point at the configured address
///
/// Joining the device's network is left to the operating system; the scan
/// yields one sighting if the provisioning endpoint answers.
pub struct SoftApDiscovery {
    config: ProvisioningConfig,
}

impl SoftApDiscovery {
    pub fn new(config: ProvisioningConfig) -> Self {
        Self { config }
    }
}

impl Discovery for SoftApDiscovery {
    type Transport = SoftApTransport;

    async fn scan(&self, timeout: Duration) -> Result<ScanSession, TransportError> {
        let softap = &self.config.softap;
        let address = (softap.host.as_str(), softap.port);
        let reachable = matches!(
            tokio::time::timeout(timeout, tokio::net::TcpStream::connect(address)).await,
            Ok(Ok(_))
        );

        let devices = if reachable {
            vec![ProvisioningDevice {
                id: format!("{}:{}", softap.host, softap.port),
                name: softap.host.clone(),
                rssi: None,
                transport: TransportKind::SoftAp,
                service_uuid: None,
                pop_hint: None,
            }]
        } else {
            debug!(host = %softap.host, "access point not reachable");
            Vec::new()
        };
        Ok(ScanSession::from_devices(devices))
    }

    async fn open(&self, _device: &ProvisioningDevice) -> Result<SoftApTransport, TransportError> {
        Ok(SoftApTransport::new(
            self.config.softap.clone(),
            self.config.timeouts.connection_timeout,
        ))
    }
}

/// Either discovery, producing the matching [`Transport`] variant
pub enum AnyDiscovery {
    Ble(BleDiscovery),
    SoftAp(SoftApDiscovery),
}

impl AnyDiscovery {
    /// Discovery for `kind`; BLE needs an adapter
    pub async fn for_kind(
        kind: TransportKind,
        config: ProvisioningConfig,
    ) -> Result<Self, TransportError> {
        Ok(match kind {
            TransportKind::Ble => AnyDiscovery::Ble(BleDiscovery::new(config).await?),
            TransportKind::SoftAp => AnyDiscovery::SoftAp(SoftApDiscovery::new(config)),
        })
    }
}

impl Discovery for AnyDiscovery {
    type Transport = Transport;

    async fn scan(&self, timeout: Duration) -> Result<ScanSession, TransportError> {
        match self {
            AnyDiscovery::Ble(d) => d.scan(timeout).await,
            AnyDiscovery::SoftAp(d) => d.scan(timeout).await,
        }
    }

    async fn open(&self, device: &ProvisioningDevice) -> Result<Transport, TransportError> {
        match (self, device.transport) {
            (AnyDiscovery::Ble(d), TransportKind::Ble) => d.open(device).await.map(Transport::Ble),
            (AnyDiscovery::SoftAp(d), TransportKind::SoftAp) => {
                d.open(device).await.map(Transport::SoftAp)
            }
            _ => Err(TransportError::DeviceNotFound(format!(
                "{} is not reachable over this transport",
                device.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str) -> ProvisioningDevice {
        ProvisioningDevice {
            id: name.to_lowercase(),
            name: name.to_string(),
            rssi: Some(-60),
            transport: TransportKind::Ble,
            service_uuid: None,
            pop_hint: None,
        }
    }

    #[tokio::test]
    async fn finished_scan_yields_then_ends() {
        let mut scan = ScanSession::from_devices(vec![device("PROV_A"), device("PROV_B")]);
        assert_eq!(scan.next().await.unwrap().name, "PROV_A");
        assert_eq!(scan.next().await.unwrap().name, "PROV_B");
        assert!(scan.next().await.is_none());
    }

    #[tokio::test]
    async fn stop_waits_for_the_scan_task() {
        let (tx, rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (released_tx, released_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let _tx = tx;
            let _ = stop_rx.await;
            let _ = released_tx.send(());
        });

        ScanSession::running(rx, stop_tx, task).stop().await;
        assert!(released_rx.await.is_ok());
    }

    #[tokio::test]
    async fn softap_scan_finds_reachable_access_point() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = ProvisioningConfig::default();
        config.softap.host = "127.0.0.1".to_string();
        config.softap.port = listener.local_addr().unwrap().port();

        let devices = SoftApDiscovery::new(config)
            .scan(Duration::from_secs(1))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].transport, TransportKind::SoftAp);
    }
}
