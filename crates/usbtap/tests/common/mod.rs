//! Mock ports for driving the proxy engine without hardware.
//!
//! Both mocks honor their timeouts and the shutdown broadcast, so every
//! blocking call unblocks promptly; that is the contract the cancellation
//! properties are stated against.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use usbtap::descriptor::{EndpointDescriptor, RawDescriptors};
use usbtap::device::{ControlOutcome, DevicePort};
use usbtap::error::{DeviceError, GadgetError};
use usbtap::gadget::{EpHandle, GadgetEvent, GadgetPort};
use usbtap::shutdown::Shutdown;
use usbtap::usb::{EndpointKind, IoStatus, SetupPacket, USB_DIR_IN};

pub fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// Gadget mock.

pub struct MockGadget {
    shutdown: Shutdown,
    events: Mutex<VecDeque<GadgetEvent>>,
    events_cond: Condvar,
    closed: AtomicBool,
    next_handle: AtomicU16,

    /// Data-stage payloads the "host" sends for control-OUT transfers.
    pub ep0_out: Mutex<VecDeque<Vec<u8>>>,
    /// Every EP0 data stage written towards the host.
    pub ep0_writes: Mutex<Vec<Vec<u8>>>,
    /// Zero-length ep0_read calls, i.e. OUT acknowledgements.
    pub acks: AtomicUsize,
    pub stalls: AtomicUsize,
    pub configured: AtomicBool,

    /// handle -> endpoint address for live endpoints.
    pub enabled: Mutex<HashMap<u16, u8>>,
    /// Host OUT traffic waiting on a gadget endpoint, by address.
    pub host_out: Mutex<HashMap<u8, VecDeque<Vec<u8>>>>,
    /// Everything forwarded to the host, by endpoint address.
    pub host_received: Mutex<HashMap<u8, Vec<Vec<u8>>>>,
}

impl MockGadget {
    pub fn new(shutdown: Shutdown) -> Arc<Self> {
        Arc::new(Self {
            shutdown,
            events: Mutex::new(VecDeque::new()),
            events_cond: Condvar::new(),
            closed: AtomicBool::new(false),
            next_handle: AtomicU16::new(1),
            ep0_out: Mutex::new(VecDeque::new()),
            ep0_writes: Mutex::new(Vec::new()),
            acks: AtomicUsize::new(0),
            stalls: AtomicUsize::new(0),
            configured: AtomicBool::new(false),
            enabled: Mutex::new(HashMap::new()),
            host_out: Mutex::new(HashMap::new()),
            host_received: Mutex::new(HashMap::new()),
        })
    }

    pub fn push_event(&self, event: GadgetEvent) {
        self.events.lock().unwrap().push_back(event);
        self.events_cond.notify_all();
    }

    pub fn push_setup(&self, request_type: u8, request: u8, value: u16, index: u16, length: u16) {
        self.push_event(GadgetEvent::ControlSetup(SetupPacket {
            request_type,
            request,
            value,
            index,
            length,
        }));
    }

    /// End the event stream; the engine sees a clean unwind.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.events_cond.notify_all();
    }

    /// Queue host OUT data for an endpoint address.
    pub fn host_sends(&self, ep_address: u8, data: Vec<u8>) {
        self.host_out
            .lock()
            .unwrap()
            .entry(ep_address)
            .or_default()
            .push_back(data);
    }

    pub fn received_by_host(&self, ep_address: u8) -> Vec<Vec<u8>> {
        self.host_received
            .lock()
            .unwrap()
            .get(&ep_address)
            .cloned()
            .unwrap_or_default()
    }

    pub fn enabled_addresses(&self) -> Vec<u8> {
        let mut addrs: Vec<u8> = self.enabled.lock().unwrap().values().copied().collect();
        addrs.sort_unstable();
        addrs
    }

    fn gone(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.shutdown.is_triggered()
    }

    fn address_of(&self, handle: EpHandle) -> Option<u8> {
        self.enabled.lock().unwrap().get(&handle.0).copied()
    }
}

impl GadgetPort for MockGadget {
    fn event_fetch(&self) -> Result<GadgetEvent, GadgetError> {
        let mut events = self.events.lock().unwrap();
        loop {
            if self.gone() {
                return Err(GadgetError::Shutdown { op: "event_fetch" });
            }
            if let Some(event) = events.pop_front() {
                return Ok(event);
            }
            let (next, _) = self
                .events_cond
                .wait_timeout(events, Duration::from_millis(10))
                .unwrap();
            events = next;
        }
    }

    fn ep0_read(&self, max_len: usize) -> Result<Vec<u8>, GadgetError> {
        if max_len == 0 {
            self.acks.fetch_add(1, Ordering::AcqRel);
            return Ok(Vec::new());
        }
        let mut payload = self
            .ep0_out
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        payload.truncate(max_len);
        Ok(payload)
    }

    fn ep0_write(&self, data: &[u8]) -> Result<usize, GadgetError> {
        self.ep0_writes.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn ep0_stall(&self) -> Result<(), GadgetError> {
        self.stalls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn ep_enable(&self, descriptor: &EndpointDescriptor) -> Result<EpHandle, GadgetError> {
        let handle = self.next_handle.fetch_add(1, Ordering::AcqRel);
        self.enabled
            .lock()
            .unwrap()
            .insert(handle, descriptor.address);
        Ok(EpHandle(handle))
    }

    fn ep_disable(&self, handle: EpHandle) -> Result<(), GadgetError> {
        self.enabled.lock().unwrap().remove(&handle.0);
        Ok(())
    }

    fn ep_read(&self, handle: EpHandle, max_len: usize)
        -> Result<IoStatus<Vec<u8>>, GadgetError> {
        if self.gone() {
            return Ok(IoStatus::Shutdown);
        }
        let Some(address) = self.address_of(handle) else {
            return Ok(IoStatus::Shutdown);
        };
        if let Some(mut data) = self
            .host_out
            .lock()
            .unwrap()
            .get_mut(&address)
            .and_then(VecDeque::pop_front)
        {
            data.truncate(max_len);
            return Ok(IoStatus::Ok(data));
        }
        std::thread::sleep(Duration::from_millis(5));
        Ok(IoStatus::TimedOut)
    }

    fn ep_write(&self, handle: EpHandle, data: &[u8]) -> Result<IoStatus<usize>, GadgetError> {
        if self.gone() {
            return Ok(IoStatus::Shutdown);
        }
        let Some(address) = self.address_of(handle) else {
            return Ok(IoStatus::Shutdown);
        };
        self.host_received
            .lock()
            .unwrap()
            .entry(address)
            .or_default()
            .push(data.to_vec());
        Ok(IoStatus::Ok(data.len()))
    }

    fn ep_clear_halt(&self, _handle: EpHandle) -> Result<(), GadgetError> {
        Ok(())
    }

    fn configure(&self) -> Result<(), GadgetError> {
        self.configured.store(true, Ordering::Release);
        Ok(())
    }

    fn vbus_draw(&self, _power: u32) -> Result<(), GadgetError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Device mock.

pub fn sample_device_bytes(mps0: u8) -> Vec<u8> {
    vec![
        0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, mps0, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 0x00,
        0x00, 0x00, 0x01,
    ]
}

/// Config 1: interface 0, alt 0 = EP 0x81 (interrupt, mps 64);
/// alt 1 = EP 0x82 + EP 0x02 (bulk, mps 512).
pub fn sample_config_bytes() -> Vec<u8> {
    let mut cfg = vec![
        0x09, 0x02, 0x00, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, // config header
        0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x00, 0x00, 0x00, // iface 0 alt 0
        0x07, 0x05, 0x81, 0x03, 0x40, 0x00, 0x0a, // EP 0x81 interrupt
        0x09, 0x04, 0x00, 0x01, 0x02, 0xff, 0x00, 0x00, 0x00, // iface 0 alt 1
        0x07, 0x05, 0x82, 0x02, 0x00, 0x02, 0x00, // EP 0x82 bulk in
        0x07, 0x05, 0x02, 0x02, 0x00, 0x02, 0x00, // EP 0x02 bulk out
    ];
    let total = (cfg.len() as u16).to_le_bytes();
    cfg[2] = total[0];
    cfg[3] = total[1];
    cfg
}

pub fn sample_raw_descriptors(mps0: u8) -> RawDescriptors {
    RawDescriptors {
        device: sample_device_bytes(mps0),
        configs: vec![sample_config_bytes()],
        strings: HashMap::new(),
    }
}

type GoneCallback = Box<dyn FnOnce() + Send>;

pub struct MockDevice {
    raw: RawDescriptors,
    gone: AtomicBool,
    on_gone: Mutex<Option<GoneCallback>>,

    pub control_log: Mutex<Vec<SetupPacket>>,
    pub control_payloads: Mutex<Vec<Vec<u8>>>,
    /// Canned reply for forwarded control-IN transfers.
    pub control_reply: Mutex<Vec<u8>>,
    pub configs_set: Mutex<Vec<u8>>,
    pub alts_set: Mutex<Vec<(u8, u8)>>,
    pub claimed: Mutex<Vec<u8>>,
    pub released: Mutex<Vec<u8>>,
    pub resets: AtomicUsize,
    /// Force the next set_alt_setting to fail.
    pub fail_next_alt: AtomicBool,

    /// Device IN traffic waiting to be read, by endpoint address.
    pub device_in: Mutex<HashMap<u8, VecDeque<Vec<u8>>>>,
    /// OUT traffic delivered to the device, by endpoint address.
    pub device_received: Mutex<HashMap<u8, Vec<Vec<u8>>>>,
}

impl MockDevice {
    pub fn new(raw: RawDescriptors) -> Arc<Self> {
        Arc::new(Self {
            raw,
            gone: AtomicBool::new(false),
            on_gone: Mutex::new(None),
            control_log: Mutex::new(Vec::new()),
            control_payloads: Mutex::new(Vec::new()),
            control_reply: Mutex::new(Vec::new()),
            configs_set: Mutex::new(Vec::new()),
            alts_set: Mutex::new(Vec::new()),
            claimed: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
            fail_next_alt: AtomicBool::new(false),
            device_in: Mutex::new(HashMap::new()),
            device_received: Mutex::new(HashMap::new()),
        })
    }

    /// Queue device IN data for an endpoint address.
    pub fn device_sends(&self, ep_address: u8, data: Vec<u8>) {
        self.device_in
            .lock()
            .unwrap()
            .entry(ep_address)
            .or_default()
            .push_back(data);
    }

    pub fn received_by_device(&self, ep_address: u8) -> Vec<Vec<u8>> {
        self.device_received
            .lock()
            .unwrap()
            .get(&ep_address)
            .cloned()
            .unwrap_or_default()
    }

    /// Yank the cable: subsequent I/O fails and the hotplug callback fires.
    pub fn disconnect(&self) {
        let callback = self.on_gone.lock().unwrap().take();
        if let Some(callback) = callback {
            callback();
        }
        self.gone.store(true, Ordering::Release);
    }

    fn check_gone(&self) -> Result<(), DeviceError> {
        if self.gone.load(Ordering::Acquire) {
            Err(DeviceError::Gone)
        } else {
            Ok(())
        }
    }
}

impl DevicePort for MockDevice {
    fn fetch_descriptors(&self, _timeout: Duration) -> Result<RawDescriptors, DeviceError> {
        self.check_gone()?;
        Ok(self.raw.clone())
    }

    fn set_configuration(&self, value: u8) -> Result<(), DeviceError> {
        self.check_gone()?;
        self.configs_set.lock().unwrap().push(value);
        Ok(())
    }

    fn claim_interface(&self, interface: u8) -> Result<(), DeviceError> {
        self.check_gone()?;
        self.claimed.lock().unwrap().push(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), DeviceError> {
        self.released.lock().unwrap().push(interface);
        Ok(())
    }

    fn set_alt_setting(&self, interface: u8, alt: u8) -> Result<(), DeviceError> {
        self.check_gone()?;
        if self.fail_next_alt.swap(false, Ordering::AcqRel) {
            return Err(DeviceError::Usb {
                op: "set_alt_setting",
                source: rusb::Error::Pipe,
            });
        }
        self.alts_set.lock().unwrap().push((interface, alt));
        Ok(())
    }

    fn reset(&self) -> Result<(), DeviceError> {
        self.check_gone()?;
        self.resets.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn control(
        &self,
        setup: SetupPacket,
        data: Option<&[u8]>,
        _timeout: Duration,
    ) -> Result<ControlOutcome, DeviceError> {
        self.check_gone()?;
        self.control_log.lock().unwrap().push(setup);
        if let Some(data) = data {
            self.control_payloads.lock().unwrap().push(data.to_vec());
        }
        if setup.request_type & USB_DIR_IN != 0 {
            let mut reply = self.control_reply.lock().unwrap().clone();
            reply.truncate(setup.length as usize);
            Ok(ControlOutcome::Data(reply))
        } else {
            Ok(ControlOutcome::Written(data.map_or(0, <[u8]>::len)))
        }
    }

    fn transfer_in(
        &self,
        ep_address: u8,
        _kind: EndpointKind,
        max_len: usize,
        timeout: Duration,
    ) -> Result<IoStatus<Vec<u8>>, DeviceError> {
        self.check_gone()?;
        if let Some(mut data) = self
            .device_in
            .lock()
            .unwrap()
            .get_mut(&ep_address)
            .and_then(VecDeque::pop_front)
        {
            data.truncate(max_len);
            return Ok(IoStatus::Ok(data));
        }
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(IoStatus::TimedOut)
    }

    fn transfer_out(
        &self,
        ep_address: u8,
        _kind: EndpointKind,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<IoStatus<usize>, DeviceError> {
        self.check_gone()?;
        self.device_received
            .lock()
            .unwrap()
            .entry(ep_address)
            .or_default()
            .push(data.to_vec());
        Ok(IoStatus::Ok(data.len()))
    }

    fn clear_halt(&self, _ep_address: u8) -> Result<(), DeviceError> {
        self.check_gone()
    }

    fn watch_disconnect(&self, on_gone: GoneCallback) -> Result<(), DeviceError> {
        *self.on_gone.lock().unwrap() = Some(on_gone);
        Ok(())
    }
}
