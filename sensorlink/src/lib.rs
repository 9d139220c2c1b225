//! Client for provisioning SensorLink devices onto a Wi-Fi network
//!
//! A device is found over BLE (or its own access point), authenticated with
//! the proof of possession printed on it, and handed network credentials
//! over an encrypted session:
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use sensorlink::{
//!     AnyDiscovery, LinkRepository, Provisioner, ProvisioningConfig, ProvisioningDevice,
//!     WiFiCredentials, qr,
//! };
//!
//! let config = ProvisioningConfig::default();
//! let data = qr::parse("name:PROV_ABC,pop:secret123,transport:ble")?;
//! let discovery = AnyDiscovery::for_kind(data.transport, config.clone()).await?;
//! let mut provisioner = Provisioner::new(LinkRepository::new(discovery, config.clone()), config);
//!
//! let status = provisioner
//!     .provision(
//!         &ProvisioningDevice::from_qr(&data),
//!         &data.pop(),
//!         WiFiCredentials::new("HomeNet", "hunter22"),
//!     )
//!     .await?;
//! println!("{status}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod model;
mod provisioner;
pub mod qr;
pub mod repository;
pub mod session;
pub mod transport;

pub use config::ProvisioningConfig;
pub use discovery::{AnyDiscovery, BleDiscovery, Discovery, ScanSession, SoftApDiscovery};
pub use error::{HandshakeError, ProvisionError, TransportError};
pub use model::{
    ProvisioningDevice, ProvisioningSession, ProvisioningStatus, TransportKind, WiFiCredentials,
    WiFiNetwork, WifiStatusReport,
};
pub use provisioner::Provisioner;
pub use qr::{QrError, QrProvisioningData};
pub use repository::{LinkRepository, ProvisioningRepository};
pub use sensorlink_proto::config::{FailReason, WifiStationState};
pub use transport::{ProvisioningTransport, Transport};
