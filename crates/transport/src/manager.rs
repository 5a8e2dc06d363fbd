//! Device manager: discovers security keys over USB (CCID readers and
//! FIDO HID interfaces) and NFC, keeps a registry of managed tokens and
//! watches NFC tags for field loss.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hidapi_rusb::HidApi;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ccid::UsbBulkPipe;
use crate::errors::TransportError;
use crate::transports::ccid::{CcidReaderProfile, CcidTransport, FEATURE_SHORT_APDU};
use crate::transports::nfc::{NfcIsoDepTransport, NfcTag};
use crate::transports::u2fhid::U2fHidTransport;
use crate::transports::SecurityKeyTransport;

/// HID usage page FIDO authenticators enumerate under.
const FIDO_USAGE_PAGE: u16 = 0xF1D0;
/// USB interface class of CCID smartcard readers.
const CCID_INTERFACE_CLASS: u8 = 0x0B;

const MONITOR_INTERVAL: Duration = Duration::from_millis(250);
const PASSIVE_LOSS_MS: u64 = 1500;
const ACTIVE_PING_MS: u64 = 750;

/// The HID API instance, shared across enumeration passes.
static HIDAPI: Lazy<Mutex<HidApi>> =
    Lazy::new(|| Mutex::new(HidApi::new().expect("Failed to initialize HID API")));

/// Wall-clock source, injectable for tests and platforms with their own
/// notion of time.
pub trait Clock: Send + Sync {
    /// Milliseconds from an arbitrary fixed epoch.
    fn now_ms(&self) -> u64;
}

/// [`Clock`] backed by the system clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Caller-supplied executor for listener callbacks. The manager never
/// invokes listeners while holding its own locks.
pub trait Executor: Send + Sync {
    /// Run `task`, now or later, on the executor's thread.
    fn post(&self, task: Box<dyn FnOnce() + Send>);
}

/// [`Executor`] that runs tasks on the calling thread.
#[derive(Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn post(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// Events delivered to registered listeners.
pub trait SecurityKeyListener: Send + Sync {
    /// A new token was attached and its transport connected.
    fn security_key_discovered(&self, key: ManagedSecurityKey);
    /// A managed token went away; its transport is already released.
    fn security_key_lost(&self, id: &DeviceId);
}

/// Identity of a managed token; duplicate discoveries of the same
/// identity are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceId {
    /// A USB device, keyed by vendor, product and serial.
    Usb {
        /// USB vendor id.
        vid: u16,
        /// USB product id.
        pid: u16,
        /// Serial number string, when the device reports one.
        serial: Option<String>,
    },
    /// An NFC tag, keyed by its UID.
    Nfc {
        /// Tag UID bytes.
        uid: Vec<u8>,
    },
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Usb { vid, pid, serial } => write!(
                f,
                "{vid:04x}:{pid:04x}:{}",
                serial.as_deref().unwrap_or("-")
            ),
            DeviceId::Nfc { uid } => write!(f, "nfc:{}", hex::encode(uid)),
        }
    }
}

/// A discovered token: identity plus its connected transport.
#[derive(Clone)]
pub struct ManagedSecurityKey {
    /// Device identity.
    pub id: DeviceId,
    /// The connected transport.
    pub transport: Arc<dyn SecurityKeyTransport>,
}

/// How an NFC tag's liveness is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NfcMonitorMode {
    /// Declare loss after 1.5 s without received frames.
    Passive,
    /// After 750 ms without frames, probe with `ping()`.
    Active,
}

type MonitorStop = Arc<(Mutex<bool>, Condvar)>;

struct Entry {
    key: ManagedSecurityKey,
    monitor: Option<MonitorStop>,
}

type Registry = Arc<Mutex<HashMap<DeviceId, Entry>>>;
type Listeners = Arc<Mutex<Vec<Arc<dyn SecurityKeyListener>>>>;

/// Registry of managed security keys with USB polling and NFC attach.
pub struct SecurityKeyManager {
    registry: Registry,
    listeners: Listeners,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
}

impl SecurityKeyManager {
    /// Build a manager delivering callbacks on `executor`.
    pub fn new(executor: Arc<dyn Executor>, clock: Arc<dyn Clock>) -> Self {
        SecurityKeyManager {
            registry: Arc::new(Mutex::new(HashMap::new())),
            listeners: Arc::new(Mutex::new(Vec::new())),
            executor,
            clock,
        }
    }

    /// Register a listener for discovery and loss events.
    pub fn register_listener(&self, listener: Arc<dyn SecurityKeyListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// The identities currently managed.
    pub fn managed_ids(&self) -> Vec<DeviceId> {
        self.registry.lock().unwrap().keys().cloned().collect()
    }

    /// Snapshot of the managed tokens.
    pub fn managed_keys(&self) -> Vec<ManagedSecurityKey> {
        self.registry
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// One USB enumeration pass: FIDO HID interfaces and CCID readers.
    /// Call periodically from a worker thread.
    pub fn poll_usb_once(&self) {
        self.poll_fido_hid();
        self.poll_ccid();
    }

    fn poll_fido_hid(&self) {
        let mut api = HIDAPI.lock().unwrap();
        if let Err(e) = api.refresh_devices() {
            warn!(err = %e, "HID enumeration failed");
            return;
        }
        let candidates: Vec<_> = api
            .device_list()
            .filter(|dev| dev.usage_page() == FIDO_USAGE_PAGE)
            .cloned()
            .collect();

        for dev in candidates {
            let id = DeviceId::Usb {
                vid: dev.vendor_id(),
                pid: dev.product_id(),
                serial: dev.serial_number().map(String::from),
            };
            if self.is_managed(&id) {
                continue;
            }
            let device = match dev.open_device(&api) {
                Ok(device) => device,
                Err(e) => {
                    warn!(%id, err = %e, "could not open FIDO HID device");
                    continue;
                }
            };
            match U2fHidTransport::connect(Box::new(device)) {
                Ok(transport) => self.attach(id, Arc::new(transport), None),
                Err(e) => warn!(%id, err = %e, "U2F HID channel setup failed"),
            }
        }
    }

    fn poll_ccid(&self) {
        let devices = match rusb::devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!(err = %e, "USB enumeration failed");
                return;
            }
        };
        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            let config = match device.active_config_descriptor() {
                Ok(config) => config,
                Err(_) => continue,
            };
            for interface in config.interfaces() {
                for ifdesc in interface.descriptors() {
                    if ifdesc.class_code() != CCID_INTERFACE_CLASS {
                        continue;
                    }
                    self.try_attach_ccid(&device, &desc, &ifdesc);
                }
            }
        }
    }

    fn try_attach_ccid(
        &self,
        device: &rusb::Device<rusb::GlobalContext>,
        desc: &rusb::DeviceDescriptor,
        ifdesc: &rusb::InterfaceDescriptor<'_>,
    ) {
        let profile = CcidReaderProfile::parse_class_descriptor(ifdesc.extra()).unwrap_or(
            CcidReaderProfile {
                features: FEATURE_SHORT_APDU,
                max_message_len: 271,
            },
        );

        let mut bulk_in = None;
        let mut bulk_out = None;
        for ep in ifdesc.endpoint_descriptors() {
            if ep.transfer_type() == rusb::TransferType::Bulk {
                match ep.direction() {
                    rusb::Direction::In => bulk_in = Some(ep.address()),
                    rusb::Direction::Out => bulk_out = Some(ep.address()),
                }
            }
        }
        let (Some(ep_in), Some(ep_out)) = (bulk_in, bulk_out) else {
            return;
        };

        let handle = match device.open() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(err = %e, "could not open CCID reader");
                return;
            }
        };
        let id = DeviceId::Usb {
            vid: desc.vendor_id(),
            pid: desc.product_id(),
            serial: handle.read_serial_number_string_ascii(desc).ok(),
        };
        if self.is_managed(&id) {
            return;
        }
        if let Err(e) = handle.claim_interface(ifdesc.interface_number()) {
            warn!(%id, err = %e, "could not claim CCID interface");
            return;
        }

        let pipe = RusbBulkPipe {
            handle,
            ep_in,
            ep_out,
        };
        match CcidTransport::open(Box::new(pipe), profile) {
            Ok(transport) => self.attach(id, Arc::new(transport), None),
            Err(e) => warn!(%id, err = %e, "CCID transport setup failed"),
        }
    }

    /// Attach a discovered NFC tag and start its liveness monitor.
    pub fn attach_nfc_tag(
        &self,
        uid: Vec<u8>,
        tag: Arc<dyn NfcTag>,
        mode: NfcMonitorMode,
    ) -> Result<(), TransportError> {
        let id = DeviceId::Nfc { uid };
        if self.is_managed(&id) {
            debug!(%id, "duplicate NFC discovery ignored");
            return Ok(());
        }
        let transport = Arc::new(NfcIsoDepTransport::new(tag, Arc::clone(&self.clock)));
        let stop = self.spawn_monitor(id.clone(), Arc::clone(&transport), mode);
        self.attach(id, transport, Some(stop));
        Ok(())
    }

    /// Release one managed token without emitting a loss event.
    pub fn release(&self, id: &DeviceId) {
        let entry = self.registry.lock().unwrap().remove(id);
        if let Some(entry) = entry {
            stop_monitor(&entry);
            entry.key.transport.release();
        }
    }

    /// Release every managed token.
    pub fn release_all(&self) {
        let entries: Vec<Entry> = {
            let mut registry = self.registry.lock().unwrap();
            registry.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            stop_monitor(&entry);
            entry.key.transport.release();
        }
    }

    fn is_managed(&self, id: &DeviceId) -> bool {
        self.registry.lock().unwrap().contains_key(id)
    }

    fn attach(
        &self,
        id: DeviceId,
        transport: Arc<dyn SecurityKeyTransport>,
        monitor: Option<MonitorStop>,
    ) {
        let key = ManagedSecurityKey {
            id: id.clone(),
            transport,
        };
        {
            let mut registry = self.registry.lock().unwrap();
            if registry.contains_key(&id) {
                debug!(%id, "duplicate discovery ignored");
                return;
            }
            registry.insert(
                id.clone(),
                Entry {
                    key: key.clone(),
                    monitor,
                },
            );
        }
        debug!(%id, "security key attached");

        let listeners: Vec<_> = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            let key = key.clone();
            self.executor
                .post(Box::new(move || listener.security_key_discovered(key)));
        }
    }

    fn spawn_monitor(
        &self,
        id: DeviceId,
        transport: Arc<NfcIsoDepTransport>,
        mode: NfcMonitorMode,
    ) -> MonitorStop {
        let stop: MonitorStop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);
        let registry = Arc::clone(&self.registry);
        let listeners = Arc::clone(&self.listeners);
        let executor = Arc::clone(&self.executor);

        std::thread::Builder::new()
            .name(format!("nfc-monitor-{id}"))
            .spawn(move || {
                let (lock, cvar) = &*thread_stop;
                let mut stopped = lock.lock().unwrap();
                loop {
                    let (guard, _) = cvar.wait_timeout(stopped, MONITOR_INTERVAL).unwrap();
                    stopped = guard;
                    if *stopped {
                        return;
                    }
                    let quiet_ms = transport.millis_since_last_rx();
                    let lost = match mode {
                        NfcMonitorMode::Passive => quiet_ms >= PASSIVE_LOSS_MS,
                        NfcMonitorMode::Active => {
                            quiet_ms >= ACTIVE_PING_MS && !transport.ping()
                        }
                    };
                    if lost {
                        drop(stopped);
                        debug!(%id, quiet_ms, "NFC tag lost");
                        announce_loss(&registry, &listeners, &executor, id);
                        return;
                    }
                }
            })
            .expect("failed to spawn NFC monitor thread");
        stop
    }
}

fn stop_monitor(entry: &Entry) {
    if let Some(stop) = &entry.monitor {
        let (lock, cvar) = &**stop;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }
}

fn announce_loss(registry: &Registry, listeners: &Listeners, executor: &Arc<dyn Executor>, id: DeviceId) {
    let entry = registry.lock().unwrap().remove(&id);
    if let Some(entry) = entry {
        entry.key.transport.release();
    }
    let listeners: Vec<_> = listeners.lock().unwrap().clone();
    for listener in listeners {
        let id = id.clone();
        executor.post(Box::new(move || listener.security_key_lost(&id)));
    }
}

struct RusbBulkPipe {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    ep_in: u8,
    ep_out: u8,
}

impl UsbBulkPipe for RusbBulkPipe {
    fn bulk_out(&mut self, data: &[u8], deadline: Duration) -> Result<usize, TransportError> {
        Ok(self.handle.write_bulk(self.ep_out, data, deadline)?)
    }

    fn bulk_in(&mut self, buf: &mut [u8], deadline: Duration) -> Result<usize, TransportError> {
        Ok(self.handle.read_bulk(self.ep_in, buf, deadline)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apdu::{CommandApdu, ResponseApdu};
    use crate::transports::TransportKind;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct ManualClock(AtomicU64);

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct DummyTransport {
        released: AtomicBool,
    }

    impl SecurityKeyTransport for DummyTransport {
        fn transceive(&self, _cmd: &CommandApdu) -> Result<ResponseApdu, TransportError> {
            Ok(ResponseApdu::new(vec![], 0x9000))
        }
        fn is_extended_length_supported(&self) -> bool {
            false
        }
        fn ping(&self) -> bool {
            !self.released.load(Ordering::SeqCst)
        }
        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
        fn kind(&self) -> TransportKind {
            TransportKind::CcidShort
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        discovered: Mutex<Vec<DeviceId>>,
        lost: Mutex<Vec<DeviceId>>,
    }

    impl SecurityKeyListener for RecordingListener {
        fn security_key_discovered(&self, key: ManagedSecurityKey) {
            self.discovered.lock().unwrap().push(key.id);
        }
        fn security_key_lost(&self, id: &DeviceId) {
            self.lost.lock().unwrap().push(id.clone());
        }
    }

    fn manager(clock: Arc<dyn Clock>) -> (SecurityKeyManager, Arc<RecordingListener>) {
        let manager = SecurityKeyManager::new(Arc::new(InlineExecutor), clock);
        let listener = Arc::new(RecordingListener::default());
        manager.register_listener(Arc::clone(&listener) as Arc<dyn SecurityKeyListener>);
        (manager, listener)
    }

    #[test]
    fn duplicate_discoveries_ignored() {
        let (manager, listener) = manager(Arc::new(SystemClock));
        let id = DeviceId::Usb {
            vid: 0x1050,
            pid: 0x0407,
            serial: Some("123".into()),
        };
        manager.attach(
            id.clone(),
            Arc::new(DummyTransport {
                released: AtomicBool::new(false),
            }),
            None,
        );
        manager.attach(
            id.clone(),
            Arc::new(DummyTransport {
                released: AtomicBool::new(false),
            }),
            None,
        );
        assert_eq!(listener.discovered.lock().unwrap().len(), 1);
        assert_eq!(manager.managed_ids(), vec![id]);
    }

    #[test]
    fn release_does_not_emit_loss() {
        let (manager, listener) = manager(Arc::new(SystemClock));
        let transport = Arc::new(DummyTransport {
            released: AtomicBool::new(false),
        });
        let id = DeviceId::Usb {
            vid: 1,
            pid: 2,
            serial: None,
        };
        manager.attach(id.clone(), Arc::clone(&transport) as Arc<dyn SecurityKeyTransport>, None);
        manager.release(&id);
        assert!(transport.released.load(Ordering::SeqCst));
        assert!(listener.lost.lock().unwrap().is_empty());
        assert!(manager.managed_ids().is_empty());
    }

    struct QuietTag;

    impl NfcTag for QuietTag {
        fn transceive(&self, _data: &[u8]) -> Result<Vec<u8>, TransportError> {
            Ok(vec![0x90, 0x00])
        }
        fn is_connected(&self) -> bool {
            false
        }
    }

    #[test]
    fn passive_monitor_declares_loss() {
        let clock = Arc::new(ManualClock(AtomicU64::new(0)));
        let (manager, listener) = manager(Arc::clone(&clock) as Arc<dyn Clock>);
        manager
            .attach_nfc_tag(vec![0xDE, 0xAD], Arc::new(QuietTag), NfcMonitorMode::Passive)
            .unwrap();
        assert_eq!(listener.discovered.lock().unwrap().len(), 1);

        // Nothing received for longer than the passive threshold.
        clock.0.store(2_000, Ordering::SeqCst);
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while listener.lost.lock().unwrap().is_empty() {
            assert!(std::time::Instant::now() < deadline, "monitor never fired");
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(
            listener.lost.lock().unwrap()[0],
            DeviceId::Nfc {
                uid: vec![0xDE, 0xAD]
            }
        );
        assert!(manager.managed_ids().is_empty());
    }

    #[test]
    fn monitor_stops_on_release() {
        let clock = Arc::new(ManualClock(AtomicU64::new(0)));
        let (manager, listener) = manager(Arc::clone(&clock) as Arc<dyn Clock>);
        manager
            .attach_nfc_tag(vec![0x01], Arc::new(QuietTag), NfcMonitorMode::Passive)
            .unwrap();
        manager.release(&DeviceId::Nfc { uid: vec![0x01] });

        // Even after the loss threshold passes, a released token emits
        // no loss event.
        clock.0.store(5_000, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(600));
        assert!(listener.lost.lock().unwrap().is_empty());
    }

    #[test]
    fn device_id_display() {
        let id = DeviceId::Usb {
            vid: 0x1050,
            pid: 0x0407,
            serial: Some("A1B2".into()),
        };
        assert_eq!(id.to_string(), "1050:0407:A1B2");
        let id = DeviceId::Nfc {
            uid: vec![0xDE, 0xAD],
        };
        assert_eq!(id.to_string(), "nfc:dead");
    }
}
