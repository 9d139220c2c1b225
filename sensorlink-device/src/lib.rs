//! SensorLink device side
//!
//! Traits and protocol handling for devices that are provisioned by the
//! SensorLink client:
//! - [`Wifi`]: station operations a firmware crate implements
//! - [`DeviceResponder`]: answers provisioning frames for all endpoints
//!
//! [`SimulatedWifi`] stands in for a radio in tests and demos.

pub mod responder;
pub mod wifi;

pub use responder::{CustomDataHandler, DeviceResponder, PROTOCOL_VERSION};
pub use wifi::{ScanResult, SimulatedWifi, SimulatedWifiError, Wifi, WifiStatus};
