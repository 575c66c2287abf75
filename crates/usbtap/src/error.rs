use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Fatal failures of the host-facing raw-gadget transport.
///
/// Transient endpoint conditions (halt, timeout, clean shutdown) are carried
/// by [`crate::usb::IoStatus`] instead; anything surfacing here either aborts
/// setup or tears the proxy down.
#[derive(Debug, Error)]
pub enum GadgetError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("gadget {op} failed: {source}")]
    Ioctl {
        op: &'static str,
        source: std::io::Error,
    },

    #[error("gadget shut down during {op}")]
    Shutdown { op: &'static str },

    #[error("event payload too short ({len} bytes)")]
    ShortEvent { len: usize },
}

impl GadgetError {
    /// Classify an ioctl failure: ESHUTDOWN/ENODEV/EINTR unwind cleanly,
    /// everything else is fatal.
    pub(crate) fn from_os(op: &'static str, source: std::io::Error) -> Self {
        match source.raw_os_error() {
            Some(libc::ESHUTDOWN) | Some(libc::ENODEV) | Some(libc::EINTR) => {
                GadgetError::Shutdown { op }
            }
            _ => GadgetError::Ioctl { op, source },
        }
    }
}

/// Failures of the device-facing libusb transport.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {vendor_id:04x}:{product_id:04x} not found within deadline")]
    NotFound { vendor_id: u16, product_id: u16 },

    #[error("device is unresponsive: {0}")]
    Unresponsive(rusb::Error),

    #[error("device disconnected")]
    Gone,

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("libusb {op} failed: {source}")]
    Usb {
        op: &'static str,
        source: rusb::Error,
    },
}

impl DeviceError {
    pub(crate) fn usb(op: &'static str, source: rusb::Error) -> Self {
        match source {
            rusb::Error::NoDevice => DeviceError::Gone,
            _ => DeviceError::Usb { op, source },
        }
    }
}

/// Descriptor snapshot construction failures.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("device descriptor truncated ({len} bytes)")]
    TruncatedDevice { len: usize },

    #[error("configuration descriptor {index} malformed: {reason}")]
    MalformedConfig { index: usize, reason: &'static str },

    #[error("duplicate endpoint {address:#04x} in interface {interface} alt {alt}")]
    DuplicateEndpoint { address: u8, interface: u8, alt: u8 },
}

/// Injection rule-file compilation failures.
///
/// Everything unparseable is rejected here, at compile time, never at match
/// time.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("field {field}: value {value:?} is not a base-10 or 0x-prefixed integer")]
    NumberSyntax { field: &'static str, value: String },

    #[error("field {field}: value {value} out of range (max {max})")]
    NumberRange {
        field: &'static str,
        value: u64,
        max: u64,
    },

    #[error("bad byte escape in {field}: {reason}")]
    BadEscape {
        field: &'static str,
        reason: &'static str,
    },

    #[error("rule {index}: empty content pattern")]
    EmptyPattern { index: usize },

    #[error("rule {index}: pattern or replacement exceeds {} bytes", crate::usb::MAX_TRANSFER)]
    OversizedPattern { index: usize },
}

/// Top-level error surfaced by [`crate::run`] and the engine.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("gadget: {0}")]
    Gadget(#[from] GadgetError),

    #[error("device: {0}")]
    Device(#[from] DeviceError),

    #[error("descriptors: {0}")]
    Descriptors(#[from] DescriptorError),

    #[error("rules: {0}")]
    Rules(#[from] RuleError),

    #[error("fatal transport failure in {subsystem}: {detail}")]
    Fatal { subsystem: &'static str, detail: String },
}
