use std::time::Duration;

/// Every tunable of the proxy engine, owned by the caller and passed down by
/// reference. Defaults match the values the protocol machinery was sized for;
/// override selectively.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Floor applied to the mirrored bMaxPacketSize0. Some UDCs refuse EP0
    /// packets smaller than 64 bytes.
    pub mps0_floor: u8,

    /// Per-endpoint bounded queue capacity, in transfer records.
    pub queue_capacity: usize,

    /// Per-call timeout for interrupt reads on the device side.
    pub interrupt_timeout: Duration,

    /// Per-call timeout for bulk reads/writes on the device side.
    pub bulk_timeout: Duration,

    /// Per-call timeout for control transfers forwarded to the device.
    pub control_timeout: Duration,

    /// Bulk transfers retry this many times on halt/timeout, clearing the
    /// halt between attempts. Interrupt transfers never retry device-side.
    pub bulk_retries: usize,

    /// How long `open` keeps scanning for the peripheral before giving up.
    pub open_deadline: Duration,

    /// Grace window within which every pipeline activity must exit after the
    /// shutdown broadcast.
    pub shutdown_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mps0_floor: 64,
            queue_capacity: 32,
            interrupt_timeout: Duration::from_millis(100),
            bulk_timeout: Duration::from_secs(1),
            control_timeout: Duration::from_secs(5),
            bulk_retries: 5,
            open_deadline: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(500),
        }
    }
}
