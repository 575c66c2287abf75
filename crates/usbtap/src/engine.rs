//! EP0 state machine and pipeline lifecycle: the main control loop of the
//! proxy.
//!
//! One thread (the caller of [`Engine::run`]) services gadget events,
//! mirrors enumeration out of the descriptor snapshot, forwards everything
//! else to the peripheral subject to the injection rules, and brings data
//! pipelines up and down on SET_CONFIGURATION / SET_INTERFACE.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ProxyConfig;
use crate::descriptor::{DescriptorMirror, EndpointDescriptor};
use crate::device::{ControlOutcome, DevicePort};
use crate::error::{DeviceError, GadgetError, ProxyError};
use crate::gadget::{EpHandle, GadgetEvent, GadgetPort};
use crate::inject::{ControlAction, ControlVerdict, RuleSet};
use crate::pipeline::{DeviceSink, DeviceSource, GadgetSink, GadgetSource, Pipeline};
use crate::shutdown::{Shutdown, ShutdownCause};
use crate::usb::{
    Direction, EndpointKind, SetupPacket, MAX_TRANSFER, USB_REQ_GET_CONFIGURATION,
    USB_REQ_GET_DESCRIPTOR, USB_REQ_GET_INTERFACE, USB_REQ_GET_STATUS, USB_REQ_SET_ADDRESS,
    USB_REQ_SET_CONFIGURATION, USB_REQ_SET_INTERFACE, USB_DT_CONFIG, USB_DT_DEVICE, USB_DT_STRING,
};

/// A live pipeline plus the gadget endpoint it owns.
struct EndpointRun {
    pipeline: Pipeline,
    handle: EpHandle,
}

pub struct Engine {
    gadget: Arc<dyn GadgetPort>,
    device: Arc<dyn DevicePort>,
    mirror: Arc<DescriptorMirror>,
    rules: Arc<RuleSet>,
    config: ProxyConfig,
    shutdown: Shutdown,

    /// Endpoint address -> running pipeline. Mutated only by this engine.
    pipelines: HashMap<u8, EndpointRun>,
    /// Interfaces currently claimed on the device side.
    claimed_interfaces: Vec<u8>,
    /// 0 = unconfigured.
    current_config: u8,
    /// Alternate setting per interface of the current configuration.
    current_alt: HashMap<u8, u8>,
    /// Whether the gadget-side configure/vbus handshake already ran.
    gadget_configured: bool,
}

impl Engine {
    pub fn new(
        gadget: Arc<dyn GadgetPort>,
        device: Arc<dyn DevicePort>,
        mirror: Arc<DescriptorMirror>,
        rules: Arc<RuleSet>,
        config: ProxyConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            gadget,
            device,
            mirror,
            rules,
            config,
            shutdown,
            pipelines: HashMap::new(),
            claimed_interfaces: Vec::new(),
            current_config: 0,
            current_alt: HashMap::new(),
            gadget_configured: false,
        }
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Service bus events until shutdown. Returns `Err` only for fatal
    /// transport failures; a device disconnect is a normal exit.
    pub fn run(&mut self) -> Result<(), ProxyError> {
        let loop_result = self.event_loop();
        self.teardown_all_pipelines();
        self.release_claimed_interfaces();
        loop_result?;
        match self.shutdown.cause() {
            Some(ShutdownCause::Fatal { subsystem, detail }) => {
                Err(ProxyError::Fatal { subsystem, detail })
            }
            _ => Ok(()),
        }
    }

    fn event_loop(&mut self) -> Result<(), ProxyError> {
        loop {
            if self.shutdown.is_triggered() {
                return Ok(());
            }
            let event = match self.gadget.event_fetch() {
                Ok(event) => event,
                Err(GadgetError::Shutdown { .. }) => {
                    tracing::debug!("gadget unwound, leaving event loop");
                    return Ok(());
                }
                Err(e) => {
                    self.shutdown.trigger(ShutdownCause::Fatal {
                        subsystem: "gadget",
                        detail: e.to_string(),
                    });
                    return Err(ProxyError::Gadget(e));
                }
            };
            if self.shutdown.is_triggered() {
                return Ok(());
            }

            match event {
                GadgetEvent::Connect => {
                    tracing::info!("host connected");
                    // A fresh connect while configured means the host came
                    // back without a visible reset; drop the stale session.
                    if !self.pipelines.is_empty() || self.current_config != 0 {
                        self.handle_bus_reset(false);
                    }
                }
                GadgetEvent::Reset => self.handle_bus_reset(false),
                GadgetEvent::Disconnect => self.handle_bus_reset(true),
                GadgetEvent::Suspend => tracing::debug!("host suspended the bus"),
                GadgetEvent::Resume => tracing::debug!("host resumed the bus"),
                GadgetEvent::Unknown(kind) => tracing::warn!(kind, "unknown gadget event"),
                GadgetEvent::ControlSetup(setup) => self.handle_control(setup)?,
            }
        }
    }

    /// Reset and disconnect are handled alike (several UDCs report one as
    /// the other): tear everything down and wait for re-enumeration.
    fn handle_bus_reset(&mut self, disconnect: bool) {
        tracing::warn!(disconnect, "host bus reset; tearing down pipelines");
        self.teardown_all_pipelines();
        self.release_claimed_interfaces();
        self.current_config = 0;
        self.current_alt.clear();
        match self.device.reset() {
            Ok(()) => {}
            Err(DeviceError::Gone) => self.shutdown.trigger(ShutdownCause::Disconnect),
            Err(e) => tracing::warn!(error = %e, "device reset after host reset failed"),
        }
    }

    // -- EP0 ----------------------------------------------------------------

    fn handle_control(&mut self, setup: SetupPacket) -> Result<(), ProxyError> {
        tracing::debug!(?setup, "control request");

        // Rules preempt everything, including locally-served requests: a
        // stall or ignore rule must fire before any transfer reaches the
        // device or the mirror answers. Modify rules wait for the payload
        // stage.
        #[derive(Clone, Copy)]
        enum Gate {
            Stall,
            Ignore,
            Pass,
        }
        let gate = match self.rules.match_control(&setup).map(|r| &r.action) {
            Some(ControlAction::Stall) => Gate::Stall,
            Some(ControlAction::Ignore) => Gate::Ignore,
            Some(ControlAction::Modify(_)) | None => Gate::Pass,
        };
        match gate {
            Gate::Stall => {
                tracing::info!(?setup, "rule: stalling EP0");
                return self.stall();
            }
            Gate::Ignore => {
                tracing::info!(?setup, "rule: dropping transfer");
                if setup.is_device_to_host() {
                    self.ep0_write(&[])?;
                } else {
                    // Acknowledge the host, swallow the payload.
                    self.ep0_read(setup.length as usize)?;
                }
                return Ok(());
            }
            Gate::Pass => {}
        }

        if setup.is_standard() {
            match setup.request {
                USB_REQ_SET_ADDRESS if !setup.is_device_to_host() => {
                    // The UDC assigns the address; never forwarded.
                    tracing::debug!(address = setup.value, "SET_ADDRESS acknowledged locally");
                    return self.ack();
                }
                USB_REQ_GET_STATUS if setup.is_device_to_host() => {
                    // Bus-powered, no remote wakeup; answered locally so the
                    // host gets a reply even mid device reset.
                    return self.reply_filtered(setup, &[0x00, 0x00]);
                }
                USB_REQ_GET_DESCRIPTOR if setup.is_device_to_host() => {
                    return self.handle_get_descriptor(setup);
                }
                USB_REQ_GET_CONFIGURATION if setup.is_device_to_host() => {
                    let config = self.current_config;
                    return self.reply_filtered(setup, &[config]);
                }
                USB_REQ_GET_INTERFACE if setup.is_device_to_host() => {
                    let alt = self
                        .current_alt
                        .get(&(setup.index as u8))
                        .copied()
                        .unwrap_or(0);
                    return self.reply_filtered(setup, &[alt]);
                }
                USB_REQ_SET_CONFIGURATION if !setup.is_device_to_host() => {
                    return self.handle_set_configuration((setup.value & 0xff) as u8);
                }
                USB_REQ_SET_INTERFACE if !setup.is_device_to_host() => {
                    return self.handle_set_interface(setup.index as u8, (setup.value & 0xff) as u8);
                }
                _ => {}
            }
        }

        self.proxy_control(setup)
    }

    fn handle_get_descriptor(&mut self, setup: SetupPacket) -> Result<(), ProxyError> {
        let (dtype, dindex) = setup.descriptor_type_index();
        match dtype {
            USB_DT_DEVICE => {
                let bytes = self.mirror.device_descriptor_bytes().to_vec();
                self.reply_filtered(setup, &bytes)
            }
            USB_DT_CONFIG => match self.mirror.config_descriptor_bytes(dindex as usize) {
                Some(bytes) => {
                    let bytes = bytes.to_vec();
                    self.reply_filtered(setup, &bytes)
                }
                None => {
                    tracing::warn!(index = dindex, "host asked for unknown configuration");
                    self.stall()
                }
            },
            USB_DT_STRING if self.mirror.string_descriptor(dindex).is_some() => {
                let bytes = self
                    .mirror
                    .string_descriptor(dindex)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default();
                self.reply_filtered(setup, &bytes)
            }
            // Strings outside the snapshot and class descriptors (HID report
            // descriptors and friends) come from the device live.
            _ => self.proxy_control(setup),
        }
    }

    /// Forward a control transfer transparently, subject to the rules.
    fn proxy_control(&mut self, setup: SetupPacket) -> Result<(), ProxyError> {
        if setup.is_device_to_host() {
            match self
                .device
                .control(setup, None, self.config.control_timeout)
            {
                Ok(ControlOutcome::Data(payload)) => {
                    match self.rules.apply_control(&setup, &payload) {
                        ControlVerdict::Forward(payload) => self.reply(setup, &payload),
                        ControlVerdict::Drop => self.ep0_write(&[]),
                        ControlVerdict::Stall => self.stall(),
                    }
                }
                Ok(ControlOutcome::Stalled) => {
                    tracing::debug!(?setup, "device stalled, mirroring to host");
                    self.stall()
                }
                Ok(ControlOutcome::TimedOut) => {
                    tracing::warn!(?setup, "device control timeout");
                    self.stall()
                }
                Ok(ControlOutcome::Written(_)) => self.stall(),
                Err(e) => self.device_failed(e),
            }
        } else {
            // Reading the data stage also acknowledges it for wLength > 0;
            // zero-length requests are acknowledged only after the device
            // accepted them.
            let payload = if setup.length > 0 {
                self.ep0_read(setup.length as usize)?
            } else {
                Vec::new()
            };
            let payload = match self.rules.apply_control(&setup, &payload) {
                ControlVerdict::Forward(payload) => payload,
                ControlVerdict::Drop => {
                    if setup.length == 0 {
                        return self.ack();
                    }
                    return Ok(());
                }
                ControlVerdict::Stall => return self.stall(),
            };
            match self
                .device
                .control(setup, Some(&payload), self.config.control_timeout)
            {
                Ok(ControlOutcome::Written(_)) => {
                    if setup.length == 0 {
                        self.ack()
                    } else {
                        Ok(())
                    }
                }
                Ok(ControlOutcome::Stalled) | Ok(ControlOutcome::TimedOut) => self.stall(),
                Ok(ControlOutcome::Data(_)) => self.stall(),
                Err(e) => self.device_failed(e),
            }
        }
    }

    // -- Configuration lifecycle --------------------------------------------

    fn handle_set_configuration(&mut self, value: u8) -> Result<(), ProxyError> {
        tracing::info!(value, "SET_CONFIGURATION");
        self.teardown_all_pipelines();
        self.release_claimed_interfaces();
        self.current_config = 0;
        self.current_alt.clear();

        if let Err(e) = self.device.set_configuration(value) {
            tracing::warn!(error = %e, "device rejected configuration");
            return match e {
                DeviceError::Gone => self.device_failed(e),
                _ => self.stall(),
            };
        }

        if value == 0 {
            return self.ack();
        }

        let Some(config) = self.mirror.config_by_value(value) else {
            tracing::warn!(value, "host selected a configuration the device never advertised");
            return self.stall();
        };
        let interfaces = config.interface_numbers();

        for &interface in &interfaces {
            match self.device.claim_interface(interface) {
                Ok(()) => self.claimed_interfaces.push(interface),
                // Claim failures are common right after a reset; forwarding
                // still works for interfaces we did get.
                Err(e) => tracing::warn!(interface, error = %e, "claim_interface failed"),
            }
        }

        if !self.gadget_configured {
            if let Err(e) = self.gadget.vbus_draw(0x32) {
                tracing::debug!(error = %e, "vbus_draw failed");
            }
            if let Err(e) = self.gadget.configure() {
                tracing::debug!(error = %e, "gadget configure failed");
            }
            self.gadget_configured = true;
        }

        for &interface in &interfaces {
            self.bring_up_alt(value, interface, 0)?;
        }
        self.current_config = value;
        self.current_alt = interfaces.iter().map(|&i| (i, 0)).collect();

        let ack = self.ack();
        tracing::info!(value, pipelines = self.pipelines.len(), "configured");
        ack
    }

    fn handle_set_interface(&mut self, interface: u8, alt: u8) -> Result<(), ProxyError> {
        tracing::info!(interface, alt, "SET_INTERFACE");
        if self.current_config == 0 {
            return self.stall();
        }
        let old_alt = self.current_alt.get(&interface).copied().unwrap_or(0);
        self.teardown_alt_pipelines(self.current_config, interface, old_alt);

        match self.device.set_alt_setting(interface, alt) {
            Ok(()) => {
                self.bring_up_alt(self.current_config, interface, alt)?;
                self.current_alt.insert(interface, alt);
                self.ack()
            }
            Err(DeviceError::Gone) => self.device_failed(DeviceError::Gone),
            Err(e) => {
                tracing::warn!(interface, alt, error = %e, "SET_INTERFACE failed, restoring");
                // Best effort: put the previous alt's pipelines back and
                // leave the alt map untouched.
                self.bring_up_alt(self.current_config, interface, old_alt)?;
                self.stall()
            }
        }
    }

    fn bring_up_alt(&mut self, config_value: u8, interface: u8, alt: u8) -> Result<(), ProxyError> {
        let endpoints: Vec<EndpointDescriptor> = self
            .mirror
            .endpoints(config_value, interface, alt)
            .map(<[EndpointDescriptor]>::to_vec)
            .unwrap_or_default();

        for ep in endpoints {
            let kind = ep.kind();
            match kind {
                EndpointKind::Bulk | EndpointKind::Interrupt => {}
                EndpointKind::Control => continue,
                EndpointKind::Isochronous => {
                    tracing::warn!(
                        address = format_args!("{:#04x}", ep.address),
                        "isochronous endpoint not forwarded"
                    );
                    continue;
                }
            }

            let handle = self.gadget.ep_enable(&ep)?;
            let direction = ep.direction();
            let read_len = match kind {
                EndpointKind::Bulk => MAX_TRANSFER,
                _ => (ep.max_packet_size as usize).clamp(1, MAX_TRANSFER),
            };
            let device_timeout = match kind {
                EndpointKind::Bulk => self.config.bulk_timeout,
                _ => self.config.interrupt_timeout,
            };

            let pipeline = match direction {
                Direction::In => Pipeline::spawn(
                    ep.address,
                    kind,
                    direction,
                    Box::new(DeviceSource {
                        device: Arc::clone(&self.device),
                        ep_address: ep.address,
                        kind,
                        timeout: device_timeout,
                    }),
                    Box::new(GadgetSink {
                        gadget: Arc::clone(&self.gadget),
                        handle,
                    }),
                    Arc::clone(&self.rules),
                    self.shutdown.clone(),
                    self.config.queue_capacity,
                    read_len,
                ),
                Direction::Out => Pipeline::spawn(
                    ep.address,
                    kind,
                    direction,
                    Box::new(GadgetSource {
                        gadget: Arc::clone(&self.gadget),
                        handle,
                        max_len: read_len,
                    }),
                    Box::new(DeviceSink {
                        device: Arc::clone(&self.device),
                        ep_address: ep.address,
                        kind,
                        timeout: self.config.bulk_timeout,
                    }),
                    Arc::clone(&self.rules),
                    self.shutdown.clone(),
                    self.config.queue_capacity,
                    read_len,
                ),
            };
            tracing::info!(
                address = format_args!("{:#04x}", ep.address),
                %kind,
                ?direction,
                "pipeline started"
            );
            self.pipelines.insert(ep.address, EndpointRun { pipeline, handle });
        }
        Ok(())
    }

    /// Give claimed interfaces back before the configuration changes; a
    /// repeated set_configuration can fail with EBUSY while the previous
    /// interfaces are still held.
    fn release_claimed_interfaces(&mut self) {
        for interface in std::mem::take(&mut self.claimed_interfaces) {
            if let Err(e) = self.device.release_interface(interface) {
                tracing::debug!(interface, error = %e, "release_interface failed");
            }
        }
    }

    fn teardown_all_pipelines(&mut self) {
        if self.pipelines.is_empty() {
            return;
        }
        let runs = std::mem::take(&mut self.pipelines);
        self.teardown_runs(runs.into_values().collect());
    }

    fn teardown_alt_pipelines(&mut self, config_value: u8, interface: u8, alt: u8) {
        let Some(endpoints) = self.mirror.endpoints(config_value, interface, alt) else {
            return;
        };
        let addresses: Vec<u8> = endpoints.iter().map(|e| e.address).collect();
        let runs: Vec<EndpointRun> = addresses
            .iter()
            .filter_map(|addr| self.pipelines.remove(addr))
            .collect();
        self.teardown_runs(runs);
    }

    /// Stop everything first, then join against one shared deadline, then
    /// disable the gadget endpoints.
    fn teardown_runs(&self, runs: Vec<EndpointRun>) {
        if runs.is_empty() {
            return;
        }
        tracing::debug!(count = runs.len(), "tearing down pipelines");
        for run in &runs {
            run.pipeline.stop();
        }
        let deadline = Instant::now() + self.config.shutdown_grace;
        for run in runs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            run.pipeline.join(remaining.max(Duration::from_millis(1)));
            if let Err(e) = self.gadget.ep_disable(run.handle) {
                tracing::debug!(error = %e, "ep_disable failed during teardown");
            }
        }
    }

    // -- EP0 primitives -----------------------------------------------------

    /// Write a control-IN reply, truncated to wLength, never padded.
    fn reply(&mut self, setup: SetupPacket, bytes: &[u8]) -> Result<(), ProxyError> {
        let len = bytes.len().min(setup.length as usize);
        self.ep0_write(&bytes[..len])
    }

    /// Like [`Engine::reply`], but run locally-served payloads through the
    /// injection engine first so modify rules see every control-IN response.
    fn reply_filtered(&mut self, setup: SetupPacket, bytes: &[u8]) -> Result<(), ProxyError> {
        match self.rules.apply_control(&setup, bytes) {
            ControlVerdict::Forward(payload) => self.reply(setup, &payload),
            ControlVerdict::Drop => self.ep0_write(&[]),
            ControlVerdict::Stall => self.stall(),
        }
    }

    /// Acknowledge a zero-length control-OUT transfer.
    fn ack(&mut self) -> Result<(), ProxyError> {
        self.ep0_read(0).map(drop)
    }

    fn ep0_read(&mut self, len: usize) -> Result<Vec<u8>, ProxyError> {
        match self.gadget.ep0_read(len.min(MAX_TRANSFER)) {
            Ok(data) => Ok(data),
            Err(GadgetError::Shutdown { .. }) => Ok(Vec::new()),
            Err(e) => {
                // The host may have abandoned the transfer; a wedged data
                // stage is not fatal to the proxy.
                tracing::warn!(error = %e, "ep0_read failed");
                Ok(Vec::new())
            }
        }
    }

    fn ep0_write(&mut self, data: &[u8]) -> Result<(), ProxyError> {
        match self.gadget.ep0_write(data) {
            Ok(_) => Ok(()),
            Err(GadgetError::Shutdown { .. }) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "ep0_write failed");
                Ok(())
            }
        }
    }

    fn stall(&mut self) -> Result<(), ProxyError> {
        if let Err(e) = self.gadget.ep0_stall() {
            tracing::warn!(error = %e, "ep0_stall failed");
        }
        Ok(())
    }

    /// A failed device operation mid-transfer: surface a stall to the host,
    /// then classify. Disconnects end the proxy cleanly; anything else is
    /// fatal.
    fn device_failed(&mut self, error: DeviceError) -> Result<(), ProxyError> {
        let _ = self.stall();
        match error {
            DeviceError::Gone => {
                self.shutdown.trigger(ShutdownCause::Disconnect);
                Ok(())
            }
            other => {
                self.shutdown.trigger(ShutdownCause::Fatal {
                    subsystem: "device",
                    detail: other.to_string(),
                });
                Err(ProxyError::Device(other))
            }
        }
    }
}
