//! Per-endpoint forwarding pipeline: a reader and a writer thread joined by a
//! bounded queue, forwarding one direction of traffic.
//!
//! For IN endpoints the source is the device port and the sink the gadget
//! port; OUT endpoints reverse the roles. The writer applies the injection
//! engine before handing the payload to the sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{DeviceError, ProxyError};
use crate::gadget::{EpHandle, GadgetPort};
use crate::inject::RuleSet;
use crate::queue::{Transfer, TransferQueue};
use crate::shutdown::{Shutdown, ShutdownCause};
use crate::usb::{Direction, EndpointKind, IoStatus, MAX_TRANSFER};

/// One side an endpoint pipeline reads from.
pub trait EndpointSource: Send {
    fn read(&self, max_len: usize) -> Result<IoStatus<Vec<u8>>, ProxyError>;
    /// Recover a halted source; errors are logged by the caller.
    fn clear_halt(&self) -> Result<(), ProxyError>;
}

/// One side an endpoint pipeline writes to.
pub trait EndpointSink: Send {
    fn write(&self, data: &[u8]) -> Result<IoStatus<usize>, ProxyError>;
    fn clear_halt(&self) -> Result<(), ProxyError>;
}

// ---------------------------------------------------------------------------
// Gadget- and device-backed halves.

pub struct GadgetSource {
    pub gadget: Arc<dyn GadgetPort>,
    pub handle: EpHandle,
    pub max_len: usize,
}

impl EndpointSource for GadgetSource {
    fn read(&self, max_len: usize) -> Result<IoStatus<Vec<u8>>, ProxyError> {
        Ok(self.gadget.ep_read(self.handle, max_len)?)
    }

    fn clear_halt(&self) -> Result<(), ProxyError> {
        Ok(self.gadget.ep_clear_halt(self.handle)?)
    }
}

pub struct GadgetSink {
    pub gadget: Arc<dyn GadgetPort>,
    pub handle: EpHandle,
}

impl EndpointSink for GadgetSink {
    fn write(&self, data: &[u8]) -> Result<IoStatus<usize>, ProxyError> {
        Ok(self.gadget.ep_write(self.handle, data)?)
    }

    fn clear_halt(&self) -> Result<(), ProxyError> {
        Ok(self.gadget.ep_clear_halt(self.handle)?)
    }
}

pub struct DeviceSource {
    pub device: Arc<dyn crate::device::DevicePort>,
    pub ep_address: u8,
    pub kind: EndpointKind,
    pub timeout: Duration,
}

impl EndpointSource for DeviceSource {
    fn read(&self, max_len: usize) -> Result<IoStatus<Vec<u8>>, ProxyError> {
        Ok(self
            .device
            .transfer_in(self.ep_address, self.kind, max_len, self.timeout)?)
    }

    fn clear_halt(&self) -> Result<(), ProxyError> {
        Ok(self.device.clear_halt(self.ep_address)?)
    }
}

pub struct DeviceSink {
    pub device: Arc<dyn crate::device::DevicePort>,
    pub ep_address: u8,
    pub kind: EndpointKind,
    pub timeout: Duration,
}

impl EndpointSink for DeviceSink {
    fn write(&self, data: &[u8]) -> Result<IoStatus<usize>, ProxyError> {
        Ok(self
            .device
            .transfer_out(self.ep_address, self.kind, data, self.timeout)?)
    }

    fn clear_halt(&self) -> Result<(), ProxyError> {
        Ok(self.device.clear_halt(self.ep_address)?)
    }
}

// ---------------------------------------------------------------------------

/// A live reader/writer pair bound to one endpoint address.
pub struct Pipeline {
    pub ep_address: u8,
    stop: Arc<AtomicBool>,
    queue: Arc<TransferQueue>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Start both activities. `read_len` bounds each source read
    /// (class-dependent: full transfers for bulk, one packet for interrupt).
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        ep_address: u8,
        kind: EndpointKind,
        direction: Direction,
        source: Box<dyn EndpointSource>,
        sink: Box<dyn EndpointSink>,
        rules: Arc<RuleSet>,
        shutdown: Shutdown,
        capacity: usize,
        read_len: usize,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let queue = Arc::new(TransferQueue::with_capacity(capacity));
        let read_len = read_len.min(MAX_TRANSFER);

        let reader = {
            let stop = Arc::clone(&stop);
            let queue = Arc::clone(&queue);
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name(format!("ep{ep_address:02x}-read"))
                .spawn(move || {
                    reader_loop(ep_address, direction, source, &queue, &stop, &shutdown, read_len)
                })
                .expect("spawn pipeline reader")
        };

        let writer = {
            let stop = Arc::clone(&stop);
            let queue = Arc::clone(&queue);
            std::thread::Builder::new()
                .name(format!("ep{ep_address:02x}-write"))
                .spawn(move || writer_loop(ep_address, kind, sink, &queue, &stop, &shutdown, &rules))
                .expect("spawn pipeline writer")
        };

        Self {
            ep_address,
            stop,
            queue,
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Ask both activities to stop; does not wait.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.queue.close();
    }

    /// Wait for both activities, up to `grace`. Returns false when a thread
    /// outlived the window (it is detached, not killed).
    pub fn join(mut self, grace: Duration) -> bool {
        self.stop();
        let deadline = Instant::now() + grace;
        let mut clean = true;
        for handle in [self.reader.take(), self.writer.take()].into_iter().flatten() {
            if !join_by(handle, deadline) {
                tracing::warn!(
                    ep = format_args!("{:#04x}", self.ep_address),
                    "pipeline thread did not stop within the grace window"
                );
                clean = false;
            }
        }
        clean
    }
}

/// A vanished peripheral ends the proxy cleanly; everything else is fatal.
fn transport_cause(error: &ProxyError) -> ShutdownCause {
    match error {
        ProxyError::Device(DeviceError::Gone) => ShutdownCause::Disconnect,
        other => ShutdownCause::Fatal {
            subsystem: "pipeline",
            detail: other.to_string(),
        },
    }
}

fn join_by(handle: JoinHandle<()>, deadline: Instant) -> bool {
    while Instant::now() < deadline {
        if handle.is_finished() {
            let _ = handle.join();
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn reader_loop(
    ep_address: u8,
    direction: Direction,
    source: Box<dyn EndpointSource>,
    queue: &TransferQueue,
    stop: &AtomicBool,
    shutdown: &Shutdown,
    read_len: usize,
) {
    let mut seq = 0u64;
    while !stop.load(Ordering::Acquire) && !shutdown.is_triggered() {
        match source.read(read_len) {
            Ok(IoStatus::Ok(data)) => {
                tracing::trace!(
                    ep = format_args!("{ep_address:#04x}"),
                    len = data.len(),
                    seq,
                    "read"
                );
                // Zero-length packets ride the queue like any other record.
                if queue.push(Transfer::new(data, direction, seq)).is_err() {
                    break;
                }
                seq += 1;
            }
            Ok(IoStatus::TimedOut) => continue,
            Ok(IoStatus::Halted) => {
                if let Err(e) = source.clear_halt() {
                    tracing::warn!(
                        ep = format_args!("{ep_address:#04x}"),
                        error = %e,
                        "clear halt on source failed"
                    );
                }
            }
            Ok(IoStatus::Shutdown) => break,
            Err(e) => {
                if !stop.load(Ordering::Acquire) && !shutdown.is_triggered() {
                    tracing::error!(
                        ep = format_args!("{ep_address:#04x}"),
                        error = %e,
                        "pipeline reader failed"
                    );
                    shutdown.trigger(transport_cause(&e));
                }
                break;
            }
        }
    }
    tracing::debug!(ep = format_args!("{ep_address:#04x}"), "reader exiting");
}

fn writer_loop(
    ep_address: u8,
    kind: EndpointKind,
    sink: Box<dyn EndpointSink>,
    queue: &TransferQueue,
    stop: &AtomicBool,
    shutdown: &Shutdown,
    rules: &RuleSet,
) {
    // Sink-side halt policy: bulk retries generously, interrupt/iso once.
    let max_attempts = match kind {
        EndpointKind::Bulk => 5,
        _ => 2,
    };

    while !stop.load(Ordering::Acquire) && !shutdown.is_triggered() {
        let Some(mut transfer) = queue.pop() else {
            break;
        };
        if let Some(rewritten) = rules.apply_data(ep_address, &transfer.data) {
            tracing::debug!(
                ep = format_args!("{ep_address:#04x}"),
                seq = transfer.seq,
                from = transfer.data.len(),
                to = rewritten.len(),
                "payload rewritten"
            );
            transfer.data = rewritten;
            transfer.transformed = true;
        }

        let mut delivered = false;
        'attempts: for attempt in 0..max_attempts {
            match sink.write(&transfer.data) {
                Ok(IoStatus::Ok(written)) => {
                    tracing::trace!(
                        ep = format_args!("{ep_address:#04x}"),
                        seq = transfer.seq,
                        written,
                        "forwarded"
                    );
                    delivered = true;
                    break 'attempts;
                }
                Ok(IoStatus::Halted) | Ok(IoStatus::TimedOut) => {
                    if let Err(e) = sink.clear_halt() {
                        tracing::warn!(
                            ep = format_args!("{ep_address:#04x}"),
                            error = %e,
                            "clear halt on sink failed"
                        );
                    }
                    if stop.load(Ordering::Acquire) || shutdown.is_triggered() {
                        return;
                    }
                    tracing::debug!(
                        ep = format_args!("{ep_address:#04x}"),
                        seq = transfer.seq,
                        attempt,
                        "sink busy, retrying"
                    );
                }
                Ok(IoStatus::Shutdown) => return,
                Err(e) => {
                    if !stop.load(Ordering::Acquire) && !shutdown.is_triggered() {
                        tracing::error!(
                            ep = format_args!("{ep_address:#04x}"),
                            error = %e,
                            "pipeline writer failed"
                        );
                        shutdown.trigger(transport_cause(&e));
                    }
                    return;
                }
            }
        }
        if !delivered {
            tracing::warn!(
                ep = format_args!("{ep_address:#04x}"),
                seq = transfer.seq,
                "transfer dropped after repeated halts"
            );
        }
    }
    tracing::debug!(ep = format_args!("{ep_address:#04x}"), "writer exiting");
}
