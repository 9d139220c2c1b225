//! Client configuration
//!
//! Loaded from a JSON file; every field is optional and falls back to the
//! protocol defaults. Durations are written in milliseconds.
//!
//! ```json
//! {
//!   "ble": { "name_prefix": "SENSOR_" },
//!   "timeouts": { "operation_timeout": 8000 },
//!   "max_retries": 5
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sensorlink_proto::{ble, endpoints};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const fn const_uuid(s: &str) -> Uuid {
    match Uuid::try_parse(s) {
        Ok(uuid) => uuid,
        Err(_) => panic!("invalid UUID constant"),
    }
}

pub const DEFAULT_SERVICE_UUID: Uuid = const_uuid(ble::SERVICE_UUID);
pub const DEFAULT_SESSION_UUID: Uuid = const_uuid(ble::SESSION_UUID);
pub const DEFAULT_CONFIG_UUID: Uuid = const_uuid(ble::CONFIG_UUID);

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub ble: BleConfig,
    pub softap: SoftApConfig,
    pub endpoints: EndpointConfig,
    pub timeouts: TimeoutConfig,
    /// Retries after the first attempt of a transition-causing operation
    pub max_retries: u32,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            ble: BleConfig::default(),
            softap: SoftApConfig::default(),
            endpoints: EndpointConfig::default(),
            timeouts: TimeoutConfig::default(),
            max_retries: 3,
        }
    }
}

/// GATT identifiers of the provisioning service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    pub service_uuid: Uuid,
    /// Notify characteristic carrying device responses
    pub session_uuid: Uuid,
    /// Write characteristic carrying client requests
    pub config_uuid: Uuid,
    /// Advertised name prefix used to recognise devices during discovery
    pub name_prefix: String,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            service_uuid: DEFAULT_SERVICE_UUID,
            session_uuid: DEFAULT_SESSION_UUID,
            config_uuid: DEFAULT_CONFIG_UUID,
            name_prefix: ble::NAME_PREFIX.to_string(),
        }
    }
}

/// Address of a device's provisioning access point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftApConfig {
    pub host: String,
    pub port: u16,
}

impl Default for SoftApConfig {
    fn default() -> Self {
        Self {
            host: "192.168.4.1".to_string(),
            port: 80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub version: String,
    pub session: String,
    pub scan: String,
    pub config: String,
    pub apply: String,
    pub custom_data: String,
}

impl EndpointConfig {
    pub fn all(&self) -> [&str; 6] {
        [
            &self.version,
            &self.session,
            &self.scan,
            &self.config,
            &self.apply,
            &self.custom_data,
        ]
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            version: endpoints::VERSION.to_string(),
            session: endpoints::SESSION.to_string(),
            scan: endpoints::SCAN.to_string(),
            config: endpoints::CONFIG.to_string(),
            apply: endpoints::APPLY.to_string(),
            custom_data: endpoints::CUSTOM_DATA.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound on establishing the link
    #[serde(with = "millis")]
    pub connection_timeout: Duration,
    /// Bound on each request/response exchange
    #[serde(with = "millis")]
    pub operation_timeout: Duration,
    /// How long device discovery runs
    #[serde(with = "millis")]
    pub scan_timeout: Duration,
    #[serde(with = "millis")]
    pub status_poll_interval: Duration,
    /// Overall bound on waiting for the device to join the network
    #[serde(with = "millis")]
    pub completion_timeout: Duration,
    /// Pause between retries
    #[serde(with = "millis")]
    pub retry_backoff: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
            scan_timeout: Duration::from_secs(10),
            status_poll_interval: Duration::from_secs(1),
            completion_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Serialize Duration as integer milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

impl ProvisioningConfig {
    /// Read a (possibly partial) JSON config file and validate it
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/sensorlink/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sensorlink").join("config.json"))
    }

    /// Load `path` if given, else the default file if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("connection_timeout", self.timeouts.connection_timeout),
            ("operation_timeout", self.timeouts.operation_timeout),
            ("scan_timeout", self.timeouts.scan_timeout),
            ("status_poll_interval", self.timeouts.status_poll_interval),
            ("completion_timeout", self.timeouts.completion_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }

        let mut seen = HashSet::new();
        for name in self.endpoints.all() {
            if name.is_empty() || name.len() > u8::MAX as usize {
                return Err(ConfigError::Invalid(format!(
                    "endpoint name {name:?} must be 1 to 255 bytes"
                )));
            }
            if !seen.insert(name) {
                return Err(ConfigError::Invalid(format!(
                    "endpoint name {name:?} is used twice"
                )));
            }
        }

        if self.ble.session_uuid == self.ble.config_uuid {
            return Err(ConfigError::Invalid(
                "session and config characteristics must differ".to_string(),
            ));
        }
        Ok(())
    }
}
