//! In-memory link between the client and a simulated device

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sensorlink::transport::ResponseBroadcast;
use sensorlink::{
    Discovery, ProvisioningConfig, ProvisioningDevice, ProvisioningTransport, ScanSession,
    TransportError, TransportKind,
};
use sensorlink_device::{DeviceResponder, ScanResult, SimulatedWifi};
use sensorlink_proto::Frame;
use sensorlink_proto::scan::WifiAuthMode;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

pub const POP: &str = "abcd1234";
pub const DEVICE_NAME: &str = "PROV_ABC";

pub type SharedDevice = Arc<Mutex<DeviceResponder<SimulatedWifi>>>;

pub fn network(ssid: &str, rssi: i8) -> ScanResult {
    ScanResult {
        ssid: ssid.to_string(),
        channel: 6,
        rssi,
        auth_mode: WifiAuthMode::Wpa2Psk,
        bssid: [0x24, 0x0a, 0xc4, 0x00, 0x00, rssi as u8],
    }
}

pub fn device_with(wifi: SimulatedWifi) -> SharedDevice {
    Arc::new(Mutex::new(DeviceResponder::new(POP.as_bytes(), wifi)))
}

pub fn device() -> SharedDevice {
    device_with(
        SimulatedWifi::new()
            .with_network(network("Cafe", -70), b"latte")
            .with_network(network("HomeNet", -40), b"hunter22")
            .with_network(network("Garage", -85), b"")
            .with_network(network("Office", -55), b"spreadsheet")
            .with_network(network("Attic", -90), b"dusty")
            .with_connect_polls(2),
    )
}

pub fn descriptor() -> ProvisioningDevice {
    ProvisioningDevice {
        id: "24:0a:c4:00:00:01".to_string(),
        name: DEVICE_NAME.to_string(),
        rssi: Some(-48),
        transport: TransportKind::Ble,
        service_uuid: None,
        pop_hint: None,
    }
}

/// Fast timings so retries and polling do not slow the tests down
pub fn config() -> ProvisioningConfig {
    let mut config = ProvisioningConfig::default();
    config.timeouts.operation_timeout = Duration::from_millis(500);
    config.timeouts.retry_backoff = Duration::from_millis(1);
    config.timeouts.status_poll_interval = Duration::from_millis(1);
    config.timeouts.completion_timeout = Duration::from_millis(500);
    config
}

/// What happens to the device's reply to one request
#[derive(Clone, Copy, Debug)]
pub enum ReplyFault {
    /// Delivered this much later; replies sent after it wait behind it
    Late(Duration),
    /// Never delivered, although the device acted on the request
    Lost,
}

/// Knobs shared between a test and the transports it hands out
#[derive(Clone, Default)]
pub struct Faults {
    /// One-shot faults for the next reply on an endpoint, oldest first
    pub reply_faults: Arc<Mutex<Vec<(&'static str, ReplyFault)>>>,
    /// Number of upcoming sends that fail with a recoverable error
    pub failing_sends: Arc<AtomicU32>,
    /// Refuse to connect at all
    pub unreachable: Arc<AtomicBool>,
    /// Flip the last byte of every reply
    pub corrupt_replies: Arc<AtomicBool>,
    /// Total sends attempted, failed or not
    pub sends: Arc<AtomicU32>,
}

impl Faults {
    pub fn fail_next_sends(&self, n: u32) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    pub fn sends(&self) -> u32 {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn fault_next_reply(&self, endpoint: &'static str, fault: ReplyFault) {
        self.reply_faults.lock().unwrap().push((endpoint, fault));
    }

    fn take_reply_fault(&self, endpoint: &str) -> Option<ReplyFault> {
        let mut faults = self.reply_faults.lock().unwrap();
        let at = faults.iter().position(|(e, _)| *e == endpoint)?;
        Some(faults.remove(at).1)
    }
}

/// Loopback link to an in-process device. Replies reach subscribers in the
/// order the device produced them, like notifications on a real link.
pub struct LoopbackTransport {
    device: SharedDevice,
    faults: Faults,
    responses: ResponseBroadcast,
    outbox: mpsc::UnboundedSender<(Instant, Vec<u8>)>,
    last_release: Mutex<Instant>,
    connected: bool,
}

impl LoopbackTransport {
    fn new(device: SharedDevice, faults: Faults) -> Self {
        let responses = ResponseBroadcast::new();
        let (outbox, mut queued) = mpsc::unbounded_channel::<(Instant, Vec<u8>)>();
        let delivery = responses.clone();
        tokio::spawn(async move {
            while let Some((at, reply)) = queued.recv().await {
                tokio::time::sleep_until(at).await;
                delivery.publish(reply);
            }
        });
        Self {
            device,
            faults,
            responses,
            outbox,
            last_release: Mutex::new(Instant::now()),
            connected: false,
        }
    }

    fn deliver(&self, reply: Vec<u8>, delay: Duration) {
        let mut last = self.last_release.lock().unwrap();
        let at = (Instant::now() + delay).max(*last);
        *last = at;
        let _ = self.outbox.send((at, reply));
    }
}

impl ProvisioningTransport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.faults.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::ServiceNotFound(
                sensorlink::config::DEFAULT_SERVICE_UUID,
            ));
        }
        // a new link means a new session on the device too
        self.device.lock().unwrap().reset_session();
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.faults.sends.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .faults
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::WriteRejected("gatt busy".to_string()));
        }

        let reply = self.device.lock().unwrap().handle_frame(frame);
        let Some(mut reply) = reply else {
            return Ok(());
        };
        if self.faults.corrupt_replies.load(Ordering::SeqCst) {
            if let Some(last) = reply.last_mut() {
                *last ^= 0x01;
            }
        }
        let endpoint = Frame::from_bytes(frame).unwrap().endpoint;
        match self.faults.take_reply_fault(&endpoint) {
            Some(ReplyFault::Lost) => {}
            Some(ReplyFault::Late(delay)) => self.deliver(reply, delay),
            None => self.deliver(reply, Duration::ZERO),
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.responses.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn dispose(&mut self) {
        self.connected = false;
        self.responses.close();
    }
}

pub struct LoopbackDiscovery {
    pub device: SharedDevice,
    pub faults: Faults,
}

impl LoopbackDiscovery {
    pub fn new(device: SharedDevice) -> Self {
        Self {
            device,
            faults: Faults::default(),
        }
    }
}

impl Discovery for LoopbackDiscovery {
    type Transport = LoopbackTransport;

    async fn scan(&self, _timeout: Duration) -> Result<ScanSession, TransportError> {
        Ok(ScanSession::from_devices(vec![descriptor()]))
    }

    async fn open(&self, device: &ProvisioningDevice) -> Result<LoopbackTransport, TransportError> {
        if device.name != DEVICE_NAME {
            return Err(TransportError::DeviceNotFound(device.name.clone()));
        }
        Ok(LoopbackTransport::new(
            self.device.clone(),
            self.faults.clone(),
        ))
    }
}
