//! BLE GATT Service Protocol Constants for SensorLink Device Provisioning
//!
//! Defaults for the provisioning service and its two characteristics. Every
//! value here can be overridden through client configuration.

/// BLE Service UUID: 021a9004-0382-4aea-bff4-6b3f1c5adfb4
pub const SERVICE_UUID: &str = "021a9004-0382-4aea-bff4-6b3f1c5adfb4";

/// Session Characteristic UUID (notify)
///
/// Every response frame from the device is delivered as a notification here.
pub const SESSION_UUID: &str = "021aff51-0382-4aea-bff4-6b3f1c5adfb4";

/// Config Characteristic UUID (write with response)
pub const CONFIG_UUID: &str = "021aff52-0382-4aea-bff4-6b3f1c5adfb4";

/// Advertised name prefix of unprovisioned devices
pub const NAME_PREFIX: &str = "PROV_";
