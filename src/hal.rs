use crate::arch;

/// The clock services the underlying host must provide to the tick engine.
///
/// Like the rest of the host interfaces, all functions are associated
/// functions: the host is a type, not a value.
pub trait AxTimeHal {
    /// Reads the raw host counter.
    ///
    /// # Returns
    ///
    /// * `u64` - The current host counter value.
    fn host_counter() -> u64 {
        arch::read_host_counter()
    }

    /// Calibrated frequency of the host counter.
    ///
    /// # Returns
    ///
    /// * `Option<u64>` - The frequency in Hz, or `None` if calibration is not
    ///   available.
    fn host_counter_hz() -> Option<u64> {
        arch::host_counter_hz()
    }

    /// Reads the virtual-sync clock, in units of [`VIRTUAL_CLOCK_HZ`](crate::VIRTUAL_CLOCK_HZ).
    ///
    /// # Parameters
    ///
    /// * `check_timers` - Whether the read may run expired timers as a side
    ///   effect. Hot read-only paths pass `false` to avoid re-entrant timer
    ///   callbacks.
    fn virtual_sync_now(check_timers: bool) -> u64;
}
