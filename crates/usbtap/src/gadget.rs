//! Host-facing gadget port: the seam between the engine and the raw-gadget
//! character device.
//!
//! [`GadgetPort`] is the narrow interface the EP0 state machine and the
//! pipelines program against; [`RawGadget`] implements it over
//! `/dev/raw-gadget` ioctls. Tests drive the engine through a mock
//! implementation instead.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::descriptor::EndpointDescriptor;
use crate::error::GadgetError;
use crate::usb::{IoStatus, SetupPacket, MAX_TRANSFER};

pub const RAW_GADGET_PATH: &str = "/dev/raw-gadget";

/// Handle for an enabled gadget endpoint, as returned by ep_enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpHandle(pub u16);

/// Bus speed the gadget advertises to the UDC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GadgetSpeed {
    Full = 2,
    High = 3,
}

/// One event from the host side of the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GadgetEvent {
    Connect,
    ControlSetup(SetupPacket),
    Suspend,
    Resume,
    Reset,
    Disconnect,
    /// Event types this proxy does not interpret; logged and skipped.
    Unknown(u32),
}

/// Host gadget port surface. All methods block; transient endpoint
/// conditions come back as [`IoStatus`], fatal transport failures as `Err`.
pub trait GadgetPort: Send + Sync {
    /// Block for the next bus event.
    fn event_fetch(&self) -> Result<GadgetEvent, GadgetError>;

    /// Read the data stage of a control-OUT transfer (also acknowledges it).
    fn ep0_read(&self, max_len: usize) -> Result<Vec<u8>, GadgetError>;

    /// Write the data stage of a control-IN transfer (zero bytes is a valid
    /// stage and must still be written).
    fn ep0_write(&self, data: &[u8]) -> Result<usize, GadgetError>;

    fn ep0_stall(&self) -> Result<(), GadgetError>;

    fn ep_enable(&self, descriptor: &EndpointDescriptor) -> Result<EpHandle, GadgetError>;

    fn ep_disable(&self, handle: EpHandle) -> Result<(), GadgetError>;

    fn ep_read(&self, handle: EpHandle, max_len: usize)
        -> Result<IoStatus<Vec<u8>>, GadgetError>;

    fn ep_write(&self, handle: EpHandle, data: &[u8]) -> Result<IoStatus<usize>, GadgetError>;

    fn ep_clear_halt(&self, handle: EpHandle) -> Result<(), GadgetError>;

    /// Commit the configured state after SET_CONFIGURATION.
    fn configure(&self) -> Result<(), GadgetError>;

    /// Report bus power draw (2 mA units) to the UDC.
    fn vbus_draw(&self, power: u32) -> Result<(), GadgetError>;
}

// ---------------------------------------------------------------------------
// Kernel implementation.

const UDC_NAME_LENGTH_MAX: usize = 128;

const fn ioc(dir: u32, nr: u32, size: u32) -> libc::c_ulong {
    ((dir << 30) | ((b'U' as u32) << 8) | nr | (size << 16)) as libc::c_ulong
}
const fn io(nr: u32) -> libc::c_ulong {
    ioc(0, nr, 0)
}
const fn iow(nr: u32, size: u32) -> libc::c_ulong {
    ioc(1, nr, size)
}
const fn ior(nr: u32, size: u32) -> libc::c_ulong {
    ioc(2, nr, size)
}
const fn iowr(nr: u32, size: u32) -> libc::c_ulong {
    ioc(3, nr, size)
}

const USB_RAW_IOCTL_INIT: libc::c_ulong = iow(0, (2 * UDC_NAME_LENGTH_MAX + 1) as u32);
const USB_RAW_IOCTL_RUN: libc::c_ulong = io(1);
const USB_RAW_IOCTL_EVENT_FETCH: libc::c_ulong = ior(2, 8);
const USB_RAW_IOCTL_EP0_WRITE: libc::c_ulong = iow(3, 8);
const USB_RAW_IOCTL_EP0_READ: libc::c_ulong = iowr(4, 8);
const USB_RAW_IOCTL_EP_ENABLE: libc::c_ulong = iow(5, 9);
const USB_RAW_IOCTL_EP_DISABLE: libc::c_ulong = iow(6, 4);
const USB_RAW_IOCTL_EP_WRITE: libc::c_ulong = iow(7, 8);
const USB_RAW_IOCTL_EP_READ: libc::c_ulong = iowr(8, 8);
const USB_RAW_IOCTL_CONFIGURE: libc::c_ulong = io(9);
const USB_RAW_IOCTL_VBUS_DRAW: libc::c_ulong = iow(10, 4);
const USB_RAW_IOCTL_EP0_STALL: libc::c_ulong = io(12);
const USB_RAW_IOCTL_EP_CLEAR_HALT: libc::c_ulong = iow(14, 4);

const USB_RAW_EVENT_CONNECT: u32 = 1;
const USB_RAW_EVENT_CONTROL: u32 = 2;
const USB_RAW_EVENT_SUSPEND: u32 = 3;
const USB_RAW_EVENT_RESUME: u32 = 4;
const USB_RAW_EVENT_RESET: u32 = 5;
const USB_RAW_EVENT_DISCONNECT: u32 = 6;

#[repr(C)]
struct UsbRawInit {
    driver_name: [u8; UDC_NAME_LENGTH_MAX],
    device_name: [u8; UDC_NAME_LENGTH_MAX],
    speed: u8,
}

#[repr(C)]
struct UsbRawEvent {
    kind: u32,
    length: u32,
    data: [u8; MAX_TRANSFER],
}

#[repr(C)]
struct UsbRawEpIo {
    ep: u16,
    flags: u16,
    length: u32,
    data: [u8; MAX_TRANSFER],
}

impl UsbRawEpIo {
    fn for_read(ep: u16, max_len: usize) -> Self {
        Self {
            ep,
            flags: 0,
            length: max_len.min(MAX_TRANSFER) as u32,
            data: [0; MAX_TRANSFER],
        }
    }

    fn for_write(ep: u16, payload: &[u8]) -> Self {
        let mut io = Self {
            ep,
            flags: 0,
            length: payload.len().min(MAX_TRANSFER) as u32,
            data: [0; MAX_TRANSFER],
        };
        io.data[..io.length as usize].copy_from_slice(&payload[..io.length as usize]);
        io
    }
}

/// `/dev/raw-gadget` implementation of [`GadgetPort`].
///
/// The fd is plain int state; raw-gadget serializes per-endpoint internally,
/// and our callers keep EP0 on one thread and each data endpoint on its own
/// reader/writer pair.
pub struct RawGadget {
    file: File,
}

impl RawGadget {
    pub fn open(path: &Path) -> Result<Self, GadgetError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| GadgetError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self { file })
    }

    /// Bind to a UDC and make the gadget visible to the host.
    pub fn init(
        &self,
        driver_name: &str,
        device_name: &str,
        speed: GadgetSpeed,
    ) -> Result<(), GadgetError> {
        let mut init = UsbRawInit {
            driver_name: [0; UDC_NAME_LENGTH_MAX],
            device_name: [0; UDC_NAME_LENGTH_MAX],
            speed: speed as u8,
        };
        copy_name(&mut init.driver_name, driver_name);
        copy_name(&mut init.device_name, device_name);
        self.ioctl(USB_RAW_IOCTL_INIT, &mut init as *mut _ as *mut libc::c_void, "init")?;
        self.ioctl(USB_RAW_IOCTL_RUN, std::ptr::null_mut(), "run")?;
        tracing::info!(driver_name, device_name, "gadget bound and running");
        Ok(())
    }

    fn ioctl(
        &self,
        request: libc::c_ulong,
        arg: *mut libc::c_void,
        op: &'static str,
    ) -> Result<i32, GadgetError> {
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request, arg) };
        if rc < 0 {
            return Err(GadgetError::from_os(op, std::io::Error::last_os_error()));
        }
        Ok(rc)
    }

    /// The subset of errno values that mean "endpoint halted right now", not
    /// "the transport is broken".
    fn ep_io(&self, request: libc::c_ulong, io: &mut UsbRawEpIo, op: &'static str)
        -> Result<IoStatus<usize>, GadgetError> {
        match self.ioctl(request, io as *mut _ as *mut libc::c_void, op) {
            Ok(rc) => Ok(IoStatus::Ok(rc as usize)),
            Err(GadgetError::Shutdown { .. }) => Ok(IoStatus::Shutdown),
            Err(GadgetError::Ioctl { source, .. })
                if source.raw_os_error() == Some(libc::EPIPE) =>
            {
                Ok(IoStatus::Halted)
            }
            Err(GadgetError::Ioctl { source, .. })
                if source.raw_os_error() == Some(libc::ETIMEDOUT) =>
            {
                Ok(IoStatus::TimedOut)
            }
            Err(err) => Err(err),
        }
    }
}

fn copy_name(dst: &mut [u8; UDC_NAME_LENGTH_MAX], name: &str) {
    // NUL-terminated; over-long names are truncated rather than rejected.
    let bytes = name.as_bytes();
    let len = bytes.len().min(UDC_NAME_LENGTH_MAX - 1);
    dst[..len].copy_from_slice(&bytes[..len]);
}

impl GadgetPort for RawGadget {
    fn event_fetch(&self) -> Result<GadgetEvent, GadgetError> {
        let mut event = UsbRawEvent {
            kind: 0,
            length: 0,
            data: [0; MAX_TRANSFER],
        };
        self.ioctl(
            USB_RAW_IOCTL_EVENT_FETCH,
            &mut event as *mut _ as *mut libc::c_void,
            "event_fetch",
        )?;
        let data_len = (event.length as usize).min(MAX_TRANSFER);
        Ok(match event.kind {
            USB_RAW_EVENT_CONNECT => GadgetEvent::Connect,
            USB_RAW_EVENT_CONTROL => {
                if data_len < 8 {
                    return Err(GadgetError::ShortEvent { len: data_len });
                }
                let mut setup = [0u8; 8];
                setup.copy_from_slice(&event.data[..8]);
                GadgetEvent::ControlSetup(SetupPacket::parse(setup))
            }
            USB_RAW_EVENT_SUSPEND => GadgetEvent::Suspend,
            USB_RAW_EVENT_RESUME => GadgetEvent::Resume,
            USB_RAW_EVENT_RESET => GadgetEvent::Reset,
            USB_RAW_EVENT_DISCONNECT => GadgetEvent::Disconnect,
            other => GadgetEvent::Unknown(other),
        })
    }

    fn ep0_read(&self, max_len: usize) -> Result<Vec<u8>, GadgetError> {
        let mut io = UsbRawEpIo::for_read(0, max_len);
        let rc = self.ioctl(
            USB_RAW_IOCTL_EP0_READ,
            &mut io as *mut _ as *mut libc::c_void,
            "ep0_read",
        )?;
        let len = (rc as usize).min(MAX_TRANSFER);
        Ok(io.data[..len].to_vec())
    }

    fn ep0_write(&self, data: &[u8]) -> Result<usize, GadgetError> {
        let mut io = UsbRawEpIo::for_write(0, data);
        let rc = self.ioctl(
            USB_RAW_IOCTL_EP0_WRITE,
            &mut io as *mut _ as *mut libc::c_void,
            "ep0_write",
        )?;
        Ok(rc as usize)
    }

    fn ep0_stall(&self) -> Result<(), GadgetError> {
        self.ioctl(USB_RAW_IOCTL_EP0_STALL, std::ptr::null_mut(), "ep0_stall")?;
        Ok(())
    }

    fn ep_enable(&self, descriptor: &EndpointDescriptor) -> Result<EpHandle, GadgetError> {
        let mut bytes = descriptor.to_gadget_bytes();
        let rc = self.ioctl(
            USB_RAW_IOCTL_EP_ENABLE,
            bytes.as_mut_ptr() as *mut libc::c_void,
            "ep_enable",
        )?;
        tracing::debug!(
            address = format_args!("{:#04x}", descriptor.address),
            handle = rc,
            "endpoint enabled"
        );
        Ok(EpHandle(rc as u16))
    }

    fn ep_disable(&self, handle: EpHandle) -> Result<(), GadgetError> {
        let mut ep: u32 = handle.0 as u32;
        self.ioctl(
            USB_RAW_IOCTL_EP_DISABLE,
            &mut ep as *mut _ as *mut libc::c_void,
            "ep_disable",
        )?;
        Ok(())
    }

    fn ep_read(&self, handle: EpHandle, max_len: usize)
        -> Result<IoStatus<Vec<u8>>, GadgetError> {
        let mut io = UsbRawEpIo::for_read(handle.0, max_len);
        match self.ep_io(USB_RAW_IOCTL_EP_READ, &mut io, "ep_read")? {
            IoStatus::Ok(len) => {
                let len = len.min(MAX_TRANSFER);
                Ok(IoStatus::Ok(io.data[..len].to_vec()))
            }
            IoStatus::Halted => Ok(IoStatus::Halted),
            IoStatus::TimedOut => Ok(IoStatus::TimedOut),
            IoStatus::Shutdown => Ok(IoStatus::Shutdown),
        }
    }

    fn ep_write(&self, handle: EpHandle, data: &[u8]) -> Result<IoStatus<usize>, GadgetError> {
        let mut io = UsbRawEpIo::for_write(handle.0, data);
        self.ep_io(USB_RAW_IOCTL_EP_WRITE, &mut io, "ep_write")
    }

    fn ep_clear_halt(&self, handle: EpHandle) -> Result<(), GadgetError> {
        let mut ep: u32 = handle.0 as u32;
        self.ioctl(
            USB_RAW_IOCTL_EP_CLEAR_HALT,
            &mut ep as *mut _ as *mut libc::c_void,
            "ep_clear_halt",
        )?;
        Ok(())
    }

    fn configure(&self) -> Result<(), GadgetError> {
        self.ioctl(USB_RAW_IOCTL_CONFIGURE, std::ptr::null_mut(), "configure")?;
        Ok(())
    }

    fn vbus_draw(&self, power: u32) -> Result<(), GadgetError> {
        let mut power = power;
        self.ioctl(
            USB_RAW_IOCTL_VBUS_DRAW,
            &mut power as *mut _ as *mut libc::c_void,
            "vbus_draw",
        )?;
        Ok(())
    }
}
