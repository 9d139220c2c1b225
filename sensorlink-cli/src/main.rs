use std::path::{Path, PathBuf};
use std::time::Duration;

use data_encoding::HEXLOWER;
use secrecy::SecretString;
use sensorlink::{
    AnyDiscovery, LinkRepository, Provisioner, ProvisioningConfig, ProvisioningDevice,
    TransportKind, WiFiCredentials, WifiStationState, qr,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

#[derive(clap::Parser)]
#[command(name = "sensorlink")]
#[command(about = "Provision SensorLink devices onto a Wi-Fi network")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, env = "SENSORLINK_CONFIG")]
    config: Option<PathBuf>,

    /// More log output; repeat for trace
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// List nearby devices waiting to be provisioned
    Scan {
        /// Seconds to scan for; defaults to the configured scan timeout
        #[arg(long)]
        duration: Option<u64>,
        #[arg(long, default_value = "ble")]
        transport: TransportKind,
    },
    /// Decode the text of a device QR code
    ParseQr { text: String },
    /// Send Wi-Fi credentials to a device and wait for it to join
    Provision {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        credentials: CredentialArgs,
    },
    /// List the networks a device can see
    WifiScan {
        #[command(flatten)]
        target: Target,
    },
    /// Report whether a device has joined its network
    Status {
        #[command(flatten)]
        target: Target,
    },
    /// Exchange an application payload with a device
    CustomData {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        data: String,
    },
    /// Show a device's protocol version and capabilities
    Version {
        #[command(flatten)]
        target: Target,
    },
}

/// Which device to talk to: a QR code, or a name and proof of possession
#[derive(clap::Args)]
struct Target {
    /// Text decoded from the device's QR code
    #[arg(long, conflicts_with = "name")]
    qr: Option<String>,
    /// Advertised device name
    #[arg(long)]
    name: Option<String>,
    /// Proof of possession printed on the device
    #[arg(long, env = "SENSORLINK_POP", hide_env_values = true)]
    pop: Option<String>,
    #[arg(long, default_value = "ble")]
    transport: TransportKind,
}

#[derive(clap::Args)]
struct CredentialArgs {
    #[arg(long, requires = "password_file", conflicts_with = "credentials")]
    ssid: Option<String>,
    /// File whose first line is the network password
    #[arg(long)]
    password_file: Option<PathBuf>,
    /// File with the SSID on the first line and the password on the second
    #[arg(long)]
    credentials: Option<PathBuf>,
}

struct ResolvedTarget {
    device: ProvisioningDevice,
    pop: Option<SecretString>,
}

impl Target {
    fn resolve(&self) -> CliResult<ResolvedTarget> {
        if let Some(text) = &self.qr {
            let data = qr::parse(text)?;
            return Ok(ResolvedTarget {
                device: ProvisioningDevice::from_qr(&data),
                pop: Some(data.pop()),
            });
        }
        let name = self.name.clone().ok_or("either --qr or --name is required")?;
        Ok(ResolvedTarget {
            device: ProvisioningDevice {
                id: name.clone(),
                name,
                rssi: None,
                transport: self.transport,
                service_uuid: None,
                pop_hint: None,
            },
            pop: self.pop.clone().map(SecretString::from),
        })
    }
}

impl ResolvedTarget {
    fn pop(&self) -> CliResult<&SecretString> {
        Ok(self
            .pop
            .as_ref()
            .ok_or("a proof of possession is required (--pop or --qr)")?)
    }
}

fn read_secret_file(path: &Path) -> CliResult<Zeroizing<String>> {
    std::fs::read_to_string(path)
        .map(Zeroizing::new)
        .map_err(|e| format!("failed to read {}: {e}", path.display()).into())
}

/// SSID on the first line, password (possibly absent for open networks) on
/// the second
fn parse_credentials(text: &str) -> CliResult<WiFiCredentials> {
    let mut lines = text.lines();
    let ssid = lines
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or("credentials file has no SSID")?;
    let password = lines.next().unwrap_or_default();
    Ok(WiFiCredentials::new(ssid, password))
}

impl CredentialArgs {
    fn load(&self) -> CliResult<WiFiCredentials> {
        let credentials = match (&self.credentials, &self.ssid, &self.password_file) {
            (Some(path), _, _) => parse_credentials(&read_secret_file(path)?)?,
            (None, Some(ssid), Some(path)) => {
                let text = read_secret_file(path)?;
                WiFiCredentials::new(ssid.as_str(), text.lines().next().unwrap_or_default())
            }
            _ => return Err("pass --credentials, or --ssid with --password-file".into()),
        };
        credentials.validate()?;
        Ok(credentials)
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

type CliProvisioner = Provisioner<LinkRepository<AnyDiscovery>>;

async fn provisioner(config: &ProvisioningConfig, kind: TransportKind) -> CliResult<CliProvisioner> {
    let discovery = AnyDiscovery::for_kind(kind, config.clone()).await?;
    Ok(Provisioner::new(
        LinkRepository::new(discovery, config.clone()),
        config.clone(),
    ))
}

/// Connect to the target and, when `secure`, authenticate
async fn open(
    config: &ProvisioningConfig,
    target: &Target,
    secure: bool,
) -> CliResult<CliProvisioner> {
    let target = target.resolve()?;
    let mut provisioner = provisioner(config, target.device.transport).await?;
    provisioner.connect(&target.device).await?;
    if let Err(e) = provisioner.query_version().await {
        warn!(error = %e, "continuing without version information");
    }
    if secure {
        if let Err(e) = provisioner.establish_secure_session(target.pop()?).await {
            provisioner.disconnect().await;
            return Err(e.into());
        }
    }
    Ok(provisioner)
}

async fn scan(config: &ProvisioningConfig, kind: TransportKind, duration: Option<u64>) -> CliResult {
    let provisioner = provisioner(config, kind).await?;
    let mut sightings = provisioner
        .scan(duration.map(Duration::from_secs))
        .await?;
    let mut found = 0;
    while let Some(device) = sightings.next().await {
        found += 1;
        let rssi = device
            .rssi
            .map_or_else(|| "-".to_string(), |rssi| format!("{rssi} dBm"));
        let hint = if device.pop_hint.is_some() { " (pop hint)" } else { "" };
        println!("{:<24} {:<20} {rssi}{hint}", device.name, device.id);
    }
    info!(found, "scan finished");
    Ok(())
}

fn parse_qr(text: &str) -> CliResult {
    let data = qr::parse(text)?;
    println!("version:    {}", data.version);
    println!("transport:  {}", data.transport);
    println!("name:       {}", data.service_name);
    println!("pop:        <hidden>");
    if data.has_ap_password() {
        println!("ap password: <hidden>");
    }
    Ok(())
}

async fn provision(
    config: &ProvisioningConfig,
    target: &Target,
    credentials: &CredentialArgs,
) -> CliResult {
    let credentials = credentials.load()?;
    let mut provisioner = open(config, target, true).await?;

    let result = match provisioner.provision_wifi(credentials).await {
        Ok(()) => provisioner.wait_for_completion().await.map(|_| ()),
        Err(e) => Err(e),
    };
    let status = provisioner.status();
    provisioner.disconnect().await;

    println!("status: {status}");
    result.map_err(|e| e.into())
}

async fn wifi_scan(config: &ProvisioningConfig, target: &Target) -> CliResult {
    let mut provisioner = open(config, target, true).await?;
    let networks = provisioner.scan_wifi().await;
    provisioner.disconnect().await;

    for network in networks? {
        println!(
            "{:<32} {:>4} dBm  ch {:<3} {:<14} {}",
            network.ssid,
            network.rssi,
            network.channel,
            format!("{:?}", network.auth_mode),
            network.bssid_string()
        );
    }
    Ok(())
}

async fn status(config: &ProvisioningConfig, target: &Target) -> CliResult {
    let mut provisioner = open(config, target, true).await?;
    let report = provisioner.station_status().await;
    provisioner.disconnect().await;

    let report = report?;
    match report.state {
        WifiStationState::Connected => println!("status: joined"),
        WifiStationState::ConnectionFailed => {
            println!("status: failed ({:?})", report.fail_reason)
        }
        WifiStationState::Connecting => println!("status: joining"),
        WifiStationState::Disconnected => println!("status: not joined"),
    }
    Ok(())
}

async fn custom_data(config: &ProvisioningConfig, target: &Target, data: &str) -> CliResult {
    let mut provisioner = open(config, target, true).await?;
    let reply = provisioner.send_custom_data(data.as_bytes()).await;
    provisioner.disconnect().await;

    let reply = reply?;
    match std::str::from_utf8(&reply) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{}", HEXLOWER.encode(&reply)),
    }
    Ok(())
}

async fn version(config: &ProvisioningConfig, target: &Target) -> CliResult {
    let mut provisioner = open(config, target, false).await?;
    let version = provisioner.query_version().await;
    provisioner.disconnect().await;

    let version = version?;
    println!("version:      {}", version.prov.ver);
    println!("capabilities: {}", version.prov.cap.join(", "));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli: Cli = clap::Parser::parse();
    init_logging(cli.verbose);

    let config = ProvisioningConfig::load_or_default(cli.config.as_deref())?;
    config.validate()?;

    match &cli.command {
        Commands::Scan {
            duration,
            transport,
        } => scan(&config, *transport, *duration).await,
        Commands::ParseQr { text } => parse_qr(text),
        Commands::Provision {
            target,
            credentials,
        } => provision(&config, target, credentials).await,
        Commands::WifiScan { target } => wifi_scan(&config, target).await,
        Commands::Status { target } => status(&config, target).await,
        Commands::CustomData { target, data } => custom_data(&config, target, data).await,
        Commands::Version { target } => version(&config, target).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn credentials_file_lines() {
        let credentials = parse_credentials("HomeNet\nhunter22\n").unwrap();
        assert_eq!(credentials.ssid, "HomeNet");
        assert_eq!(credentials.password.expose_secret(), "hunter22");

        let open = parse_credentials("CoffeeShop\n").unwrap();
        assert_eq!(open.password.expose_secret(), "");

        assert!(parse_credentials("\nhunter22").is_err());
    }

    #[test]
    fn target_from_qr_carries_pop() {
        let target = Target {
            qr: Some("name:PROV_ABC,pop:secret123,transport:ble".to_string()),
            name: None,
            pop: None,
            transport: TransportKind::SoftAp,
        };
        let resolved = target.resolve().unwrap();
        assert_eq!(resolved.device.name, "PROV_ABC");
        assert_eq!(resolved.device.transport, TransportKind::Ble);
        assert_eq!(resolved.pop().unwrap().expose_secret(), "secret123");
    }

    #[test]
    fn target_needs_a_device() {
        let target = Target {
            qr: None,
            name: None,
            pop: Some("p".to_string()),
            transport: TransportKind::Ble,
        };
        assert!(target.resolve().is_err());
    }
}
