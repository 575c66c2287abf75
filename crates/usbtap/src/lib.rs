//! Transparent USB man-in-the-middle proxy.
//!
//! The proxy sits between a real USB host and a real peripheral: the host
//! side is emulated through the Linux raw-gadget interface, the device side
//! is driven over libusb, and a declarative rule set may inspect, drop,
//! stall, or rewrite traffic in between.
//!
//! The crate exposes the engine pieces individually (ports, descriptor
//! mirror, injection engine, pipelines) plus [`run`], which wires the real
//! transports together and services the bus until shutdown.

pub mod config;
pub mod descriptor;
pub mod device;
pub mod engine;
pub mod error;
pub mod gadget;
pub mod inject;
pub mod pipeline;
pub mod queue;
pub mod shutdown;
pub mod usb;

use std::path::Path;
use std::sync::Arc;

use crate::config::ProxyConfig;
use crate::descriptor::DescriptorMirror;
use crate::device::{DevicePort, UsbDevicePort};
use crate::engine::Engine;
use crate::error::ProxyError;
use crate::gadget::{GadgetSpeed, RawGadget, RAW_GADGET_PATH};
use crate::inject::RuleSet;
use crate::shutdown::{Shutdown, ShutdownCause};

/// Everything [`run`] needs to stand the proxy up.
pub struct ProxyOptions {
    pub vendor_id: u16,
    pub product_id: u16,
    /// UDC driver name, e.g. `dummy_udc` or `fe980000.usb`.
    pub driver: String,
    /// UDC device name, e.g. `dummy_udc.0`.
    pub device: String,
    pub speed: GadgetSpeed,
    pub rules: RuleSet,
    pub config: ProxyConfig,
}

/// Run the proxy until the host side shuts down, the peripheral disconnects,
/// or a fatal transport error occurs.
///
/// Returns `Ok(())` for every normal end of life, including a peripheral
/// disconnect; the caller maps errors to a non-zero exit status.
pub fn run(options: ProxyOptions) -> Result<(), ProxyError> {
    let shutdown = Shutdown::new();

    let device = UsbDevicePort::open(
        options.vendor_id,
        options.product_id,
        options.config.open_deadline,
        options.config.bulk_retries,
    )?;
    let device: Arc<dyn DevicePort> = Arc::new(device);

    let raw = device.fetch_descriptors(options.config.control_timeout)?;
    let mirror = Arc::new(DescriptorMirror::build(raw, options.config.mps0_floor)?);
    tracing::info!(
        vendor_id = format_args!("{:04x}", mirror.vendor_id()),
        product_id = format_args!("{:04x}", mirror.product_id()),
        configs = mirror.config_count(),
        "descriptor snapshot taken"
    );

    let gadget = RawGadget::open(Path::new(RAW_GADGET_PATH))?;
    gadget.init(&options.driver, &options.device, options.speed)?;
    let gadget: Arc<dyn gadget::GadgetPort> = Arc::new(gadget);

    {
        let shutdown = shutdown.clone();
        device.watch_disconnect(Box::new(move || {
            shutdown.trigger(ShutdownCause::Disconnect);
        }))?;
    }

    let mut engine = Engine::new(
        gadget,
        device,
        mirror,
        Arc::new(options.rules),
        options.config,
        shutdown.clone(),
    );
    let result = engine.run();

    match shutdown.cause() {
        Some(ShutdownCause::Disconnect) => tracing::info!("proxy stopped: device disconnected"),
        Some(ShutdownCause::Requested) => tracing::info!("proxy stopped on request"),
        _ => {}
    }
    result
}
