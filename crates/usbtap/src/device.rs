//! Device-facing port: the seam between the engine and the real peripheral,
//! implemented over libusb via `rusb`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rusb::{Context, UsbContext};

use crate::descriptor::RawDescriptors;
use crate::error::DeviceError;
use crate::usb::{EndpointKind, IoStatus, SetupPacket, USB_DIR_IN};

/// Result of a forwarded control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// IN transfer completed; payload as returned by the device.
    Data(Vec<u8>),
    /// OUT transfer completed; bytes accepted by the device.
    Written(usize),
    /// The device stalled the request; mirrored to the host as an EP0 stall.
    Stalled,
    TimedOut,
}

/// Peripheral surface used by the engine and the pipelines.
pub trait DevicePort: Send + Sync {
    fn fetch_descriptors(&self, timeout: Duration) -> Result<RawDescriptors, DeviceError>;

    fn set_configuration(&self, value: u8) -> Result<(), DeviceError>;

    fn claim_interface(&self, interface: u8) -> Result<(), DeviceError>;

    fn release_interface(&self, interface: u8) -> Result<(), DeviceError>;

    fn set_alt_setting(&self, interface: u8, alt: u8) -> Result<(), DeviceError>;

    fn reset(&self) -> Result<(), DeviceError>;

    fn control(
        &self,
        setup: SetupPacket,
        data: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<ControlOutcome, DeviceError>;

    /// IN transfer from a data endpoint. Bulk retries on halt/timeout with a
    /// clear-halt between attempts; interrupt never retries here.
    fn transfer_in(
        &self,
        ep_address: u8,
        kind: EndpointKind,
        max_len: usize,
        timeout: Duration,
    ) -> Result<IoStatus<Vec<u8>>, DeviceError>;

    fn transfer_out(
        &self,
        ep_address: u8,
        kind: EndpointKind,
        data: &[u8],
        timeout: Duration,
    ) -> Result<IoStatus<usize>, DeviceError>;

    fn clear_halt(&self, ep_address: u8) -> Result<(), DeviceError>;

    /// Invoke `on_gone` exactly once when the peripheral vanishes.
    fn watch_disconnect(&self, on_gone: Box<dyn FnOnce() + Send>) -> Result<(), DeviceError>;
}

/// rusb-backed implementation.
pub struct UsbDevicePort {
    ctx: Context,
    handle: rusb::DeviceHandle<Context>,
    vendor_id: u16,
    product_id: u16,
    bulk_retries: usize,
}

impl UsbDevicePort {
    /// Scan for the peripheral, backing off exponentially until `deadline`.
    ///
    /// On success the kernel driver is set to auto-detach, the device is
    /// reset to a clean state and probed for responsiveness.
    pub fn open(
        vendor_id: u16,
        product_id: u16,
        deadline: Duration,
        bulk_retries: usize,
    ) -> Result<Self, DeviceError> {
        let ctx = Context::new().map_err(|e| DeviceError::usb("context", e))?;
        let start = Instant::now();
        let mut backoff = Duration::from_millis(50);
        let mut handle = loop {
            if let Some(handle) = Self::scan(&ctx, vendor_id, product_id)? {
                break handle;
            }
            if start.elapsed() + backoff >= deadline {
                return Err(DeviceError::NotFound {
                    vendor_id,
                    product_id,
                });
            }
            tracing::debug!(?backoff, "device not present yet, retrying");
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_secs(1));
        };

        // Let libusb take interfaces away from kernel drivers on claim and
        // hand them back on release.
        match handle.set_auto_detach_kernel_driver(true) {
            Ok(()) | Err(rusb::Error::NotSupported) => {}
            Err(e) => return Err(DeviceError::usb("auto_detach", e)),
        }

        // Start from a clean slate; an already-bound device can be mid
        // transfer when we arrive.
        if let Err(e) = handle.reset() {
            tracing::warn!(error = %e, "device reset failed, continuing");
        }

        let port = Self {
            ctx,
            handle,
            vendor_id,
            product_id,
            bulk_retries,
        };
        port.probe()?;
        tracing::info!(
            vendor_id = format_args!("{vendor_id:04x}"),
            product_id = format_args!("{product_id:04x}"),
            "peripheral opened"
        );
        Ok(port)
    }

    fn scan(
        ctx: &Context,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Option<rusb::DeviceHandle<Context>>, DeviceError> {
        let devices = ctx.devices().map_err(|e| DeviceError::usb("devices", e))?;
        for device in devices.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() != vendor_id || desc.product_id() != product_id {
                continue;
            }
            match device.open() {
                Ok(handle) => return Ok(Some(handle)),
                Err(e) => return Err(DeviceError::usb("open", e)),
            }
        }
        Ok(None)
    }

    /// Read string descriptor 0 (language IDs); a device that cannot answer
    /// this is not worth proxying.
    fn probe(&self) -> Result<(), DeviceError> {
        let mut buf = [0u8; 4];
        match self.handle.read_control(
            0x80,
            0x06,
            0x0300,
            0x0409,
            &mut buf,
            Duration::from_secs(1),
        ) {
            Ok(_) => Ok(()),
            Err(e) => Err(DeviceError::Unresponsive(e)),
        }
    }

    fn raw(&self) -> *mut rusb::ffi::libusb_device_handle {
        self.handle.as_raw()
    }

    /// rusb gates a few libusb calls behind `&mut self`; the underlying
    /// library is thread-safe, so those go through the FFI layer here.
    fn ffi(&self, op: &'static str, rc: i32) -> Result<(), DeviceError> {
        if rc == 0 {
            Ok(())
        } else {
            Err(DeviceError::usb(op, ffi_error(rc)))
        }
    }
}

/// libusb return code to rusb error (codes from libusb.h).
fn ffi_error(rc: i32) -> rusb::Error {
    match rc {
        -1 => rusb::Error::Io,
        -2 => rusb::Error::InvalidParam,
        -3 => rusb::Error::Access,
        -4 => rusb::Error::NoDevice,
        -5 => rusb::Error::NotFound,
        -6 => rusb::Error::Busy,
        -7 => rusb::Error::Timeout,
        -8 => rusb::Error::Overflow,
        -9 => rusb::Error::Pipe,
        -10 => rusb::Error::Interrupted,
        -11 => rusb::Error::NoMem,
        -12 => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

fn in_status(err: rusb::Error, op: &'static str) -> Result<IoStatus<Vec<u8>>, DeviceError> {
    match err {
        rusb::Error::Pipe => Ok(IoStatus::Halted),
        rusb::Error::Timeout => Ok(IoStatus::TimedOut),
        rusb::Error::Interrupted => Ok(IoStatus::Shutdown),
        rusb::Error::NoDevice => Err(DeviceError::Gone),
        other => Err(DeviceError::Usb { op, source: other }),
    }
}

fn out_status(err: rusb::Error, op: &'static str) -> Result<IoStatus<usize>, DeviceError> {
    match err {
        rusb::Error::Pipe => Ok(IoStatus::Halted),
        rusb::Error::Timeout => Ok(IoStatus::TimedOut),
        rusb::Error::Interrupted => Ok(IoStatus::Shutdown),
        rusb::Error::NoDevice => Err(DeviceError::Gone),
        other => Err(DeviceError::Usb { op, source: other }),
    }
}

impl DevicePort for UsbDevicePort {
    fn fetch_descriptors(&self, timeout: Duration) -> Result<RawDescriptors, DeviceError> {
        let mut raw = RawDescriptors::default();

        let mut device = [0u8; 18];
        let n = self
            .handle
            .read_control(0x80, 0x06, 0x0100, 0, &mut device, timeout)
            .map_err(|e| DeviceError::usb("get device descriptor", e))?;
        raw.device = device[..n].to_vec();

        let num_configs = raw.device.get(17).copied().unwrap_or(0);
        for index in 0..num_configs as u16 {
            let mut header = [0u8; 9];
            let n = self
                .handle
                .read_control(0x80, 0x06, 0x0200 | index, 0, &mut header, timeout)
                .map_err(|e| DeviceError::usb("get config header", e))?;
            if n < 9 {
                return Err(DeviceError::usb("get config header", rusb::Error::Other));
            }
            let total = u16::from_le_bytes([header[2], header[3]]) as usize;
            let mut full = vec![0u8; total];
            let n = self
                .handle
                .read_control(0x80, 0x06, 0x0200 | index, 0, &mut full, timeout)
                .map_err(|e| DeviceError::usb("get config descriptor", e))?;
            full.truncate(n);
            raw.configs.push(full);
        }

        // String snapshot is best effort; devices with broken string
        // descriptors still proxy fine.
        if raw.device.len() >= 18 {
            for string_index in [raw.device[14], raw.device[15], raw.device[16]] {
                if string_index == 0 {
                    continue;
                }
                let mut buf = [0u8; 255];
                if let Ok(n) = self.handle.read_control(
                    0x80,
                    0x06,
                    0x0300 | string_index as u16,
                    0x0409,
                    &mut buf,
                    timeout,
                ) {
                    raw.strings.insert(string_index, buf[..n].to_vec());
                }
            }
        }

        Ok(raw)
    }

    fn set_configuration(&self, value: u8) -> Result<(), DeviceError> {
        let rc = unsafe { rusb::ffi::libusb_set_configuration(self.raw(), value as i32) };
        self.ffi("set_configuration", rc)
    }

    fn claim_interface(&self, interface: u8) -> Result<(), DeviceError> {
        let rc = unsafe { rusb::ffi::libusb_claim_interface(self.raw(), interface as i32) };
        self.ffi("claim_interface", rc)
    }

    fn release_interface(&self, interface: u8) -> Result<(), DeviceError> {
        let rc = unsafe { rusb::ffi::libusb_release_interface(self.raw(), interface as i32) };
        self.ffi("release_interface", rc)
    }

    fn set_alt_setting(&self, interface: u8, alt: u8) -> Result<(), DeviceError> {
        let rc = unsafe {
            rusb::ffi::libusb_set_interface_alt_setting(self.raw(), interface as i32, alt as i32)
        };
        self.ffi("set_alt_setting", rc)
    }

    fn reset(&self) -> Result<(), DeviceError> {
        let rc = unsafe { rusb::ffi::libusb_reset_device(self.raw()) };
        self.ffi("reset", rc)
    }

    fn control(
        &self,
        setup: SetupPacket,
        data: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<ControlOutcome, DeviceError> {
        if setup.request_type & USB_DIR_IN != 0 {
            let mut buf = vec![0u8; setup.length as usize];
            match self.handle.read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                &mut buf,
                timeout,
            ) {
                Ok(n) => {
                    buf.truncate(n);
                    Ok(ControlOutcome::Data(buf))
                }
                Err(rusb::Error::Pipe) => Ok(ControlOutcome::Stalled),
                Err(rusb::Error::Timeout) => Ok(ControlOutcome::TimedOut),
                Err(e) => Err(DeviceError::usb("control in", e)),
            }
        } else {
            match self.handle.write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data.unwrap_or(&[]),
                timeout,
            ) {
                Ok(n) => Ok(ControlOutcome::Written(n)),
                Err(rusb::Error::Pipe) => Ok(ControlOutcome::Stalled),
                Err(rusb::Error::Timeout) => Ok(ControlOutcome::TimedOut),
                Err(e) => Err(DeviceError::usb("control out", e)),
            }
        }
    }

    fn transfer_in(
        &self,
        ep_address: u8,
        kind: EndpointKind,
        max_len: usize,
        timeout: Duration,
    ) -> Result<IoStatus<Vec<u8>>, DeviceError> {
        let mut buf = vec![0u8; max_len];
        match kind {
            EndpointKind::Bulk => {
                let mut last = IoStatus::TimedOut;
                for attempt in 0..=self.bulk_retries {
                    match self.handle.read_bulk(ep_address, &mut buf, timeout) {
                        Ok(n) => {
                            buf.truncate(n);
                            return Ok(IoStatus::Ok(buf));
                        }
                        Err(e) => match in_status(e, "bulk in")? {
                            IoStatus::Halted => {
                                tracing::debug!(
                                    ep = format_args!("{ep_address:#04x}"),
                                    attempt,
                                    "bulk in halted, clearing"
                                );
                                self.clear_halt(ep_address)?;
                                last = IoStatus::Halted;
                            }
                            IoStatus::TimedOut => last = IoStatus::TimedOut,
                            other => return Ok(other),
                        },
                    }
                }
                Ok(last)
            }
            EndpointKind::Interrupt => match self.handle.read_interrupt(ep_address, &mut buf, timeout)
            {
                Ok(n) => {
                    buf.truncate(n);
                    Ok(IoStatus::Ok(buf))
                }
                Err(e) => in_status(e, "interrupt in"),
            },
            EndpointKind::Isochronous | EndpointKind::Control => {
                Err(DeviceError::Unsupported("synchronous iso/control endpoint read"))
            }
        }
    }

    fn transfer_out(
        &self,
        ep_address: u8,
        kind: EndpointKind,
        data: &[u8],
        timeout: Duration,
    ) -> Result<IoStatus<usize>, DeviceError> {
        match kind {
            EndpointKind::Bulk => {
                let mut last = IoStatus::TimedOut;
                for attempt in 0..=self.bulk_retries {
                    match self.handle.write_bulk(ep_address, data, timeout) {
                        Ok(n) => return Ok(IoStatus::Ok(n)),
                        Err(e) => match out_status(e, "bulk out")? {
                            IoStatus::Halted => {
                                tracing::debug!(
                                    ep = format_args!("{ep_address:#04x}"),
                                    attempt,
                                    "bulk out halted, clearing"
                                );
                                self.clear_halt(ep_address)?;
                                last = IoStatus::Halted;
                            }
                            IoStatus::TimedOut => last = IoStatus::TimedOut,
                            other => return Ok(other),
                        },
                    }
                }
                Ok(last)
            }
            EndpointKind::Interrupt => match self.handle.write_interrupt(ep_address, data, timeout) {
                Ok(n) => Ok(IoStatus::Ok(n)),
                Err(e) => out_status(e, "interrupt out"),
            },
            EndpointKind::Isochronous | EndpointKind::Control => {
                Err(DeviceError::Unsupported("synchronous iso/control endpoint write"))
            }
        }
    }

    fn clear_halt(&self, ep_address: u8) -> Result<(), DeviceError> {
        let rc = unsafe { rusb::ffi::libusb_clear_halt(self.raw(), ep_address) };
        self.ffi("clear_halt", rc)
    }

    fn watch_disconnect(&self, on_gone: Box<dyn FnOnce() + Send>) -> Result<(), DeviceError> {
        if !rusb::has_hotplug() {
            tracing::warn!("libusb hotplug unsupported here; disconnects detected via I/O errors");
            return Ok(());
        }

        let fired = Arc::new(AtomicBool::new(false));
        let watcher = DisconnectWatcher {
            on_gone: Mutex::new(Some(on_gone)),
            fired: Arc::clone(&fired),
        };
        let registration = rusb::HotplugBuilder::new()
            .vendor_id(self.vendor_id)
            .product_id(self.product_id)
            .register(self.ctx.clone(), Box::new(watcher))
            .map_err(|e| DeviceError::usb("hotplug register", e))?;

        let ctx = self.ctx.clone();
        std::thread::Builder::new()
            .name("usb-hotplug".into())
            .spawn(move || {
                // The registration must stay alive while we pump events.
                let _registration = registration;
                while !fired.load(Ordering::Acquire) {
                    if let Err(e) = ctx.handle_events(Some(Duration::from_millis(200))) {
                        tracing::warn!(error = %e, "hotplug event loop error");
                        break;
                    }
                }
            })
            .expect("spawn hotplug thread");
        Ok(())
    }
}

impl Drop for UsbDevicePort {
    fn drop(&mut self) {
        // Best effort: give interfaces back to the kernel driver.
        if let Err(e) = self.handle.reset() {
            tracing::debug!(error = %e, "device reset on drop failed");
        }
    }
}

struct DisconnectWatcher {
    on_gone: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    fired: Arc<AtomicBool>,
}

impl rusb::Hotplug<Context> for DisconnectWatcher {
    fn device_arrived(&mut self, _device: rusb::Device<Context>) {}

    fn device_left(&mut self, _device: rusb::Device<Context>) {
        if let Some(cb) = self.on_gone.lock().unwrap().take() {
            tracing::warn!("peripheral disconnected");
            self.fired.store(true, Ordering::Release);
            cb();
        }
    }
}
