//! Guest timestamp counter virtualization.
//!
//! Every vCPU owns an [`AxVCpuTimeState`]; the VM-wide flags the clock
//! subsystem maintains live in [`AxVmTimeState`]. The guest counter is either
//! the raw host counter, the host counter shifted by a per-vCPU offset, or
//! the virtual-sync clock scaled to the configured frequency and shifted by
//! the offset.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::config::AxVmTimeConfig;
use crate::hal::AxTimeHal;

/// Frequency of the virtual-sync clock (nanoseconds).
pub const VIRTUAL_CLOCK_HZ: u64 = 1_000_000_000;

/// Computes `value * mul / div` with a 96-bit intermediate product.
///
/// # Panics
///
/// Panics if `div` is zero.
#[inline]
pub const fn mul_u64_u32_div_u32(value: u64, mul: u32, div: u32) -> u64 {
    ((value as u128 * mul as u128) / div as u128) as u64
}

/// Computes `value * mul / div` for full-width multipliers and divisors.
///
/// # Panics
///
/// Panics if `div` is zero.
#[inline]
pub const fn mul_u64_u64_div_u64(value: u64, mul: u64, div: u64) -> u64 {
    ((value as u128 * mul as u128) / div as u128) as u64
}

/// Scales a virtual-sync clock reading to a counter running at `ticks_per_second`.
pub fn scale_virtual_time(now: u64, ticks_per_second: u64) -> u64 {
    if ticks_per_second == VIRTUAL_CLOCK_HZ {
        return now;
    }
    match u32::try_from(ticks_per_second) {
        Ok(tps) => mul_u64_u32_div_u32(now, tps, VIRTUAL_CLOCK_HZ as u32),
        Err(_) => mul_u64_u64_div_u64(now, ticks_per_second, VIRTUAL_CLOCK_HZ),
    }
}

/// Counts of refused counter passthrough requests, by reason.
#[derive(Debug, Default)]
pub struct PassthroughStats {
    not_fixed: AtomicU64,
    not_ticking: AtomicU64,
    catch_up_le_10: AtomicU64,
    catch_up_le_25: AtomicU64,
    catch_up_le_100: AtomicU64,
    catch_up_other: AtomicU64,
    sync_not_ticking: AtomicU64,
    warp: AtomicU64,
}

/// A point-in-time copy of [`PassthroughStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassthroughStatsSnapshot {
    /// The host counter is not known to run at a fixed rate.
    pub not_fixed: u64,
    /// The vCPU's counter was paused.
    pub not_ticking: u64,
    /// Catch-up at no more than 10 percent.
    pub catch_up_le_10: u64,
    /// Catch-up at more than 10 and no more than 25 percent.
    pub catch_up_le_25: u64,
    /// Catch-up at more than 25 and no more than 100 percent.
    pub catch_up_le_100: u64,
    /// Catch-up at more than 100 percent.
    pub catch_up_other: u64,
    /// The virtual-sync clock was halted.
    pub sync_not_ticking: u64,
    /// Warp drive was active.
    pub warp: u64,
}

impl PassthroughStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot of the counters.
    pub fn snapshot(&self) -> PassthroughStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PassthroughStatsSnapshot {
            not_fixed: load(&self.not_fixed),
            not_ticking: load(&self.not_ticking),
            catch_up_le_10: load(&self.catch_up_le_10),
            catch_up_le_25: load(&self.catch_up_le_25),
            catch_up_le_100: load(&self.catch_up_le_100),
            catch_up_other: load(&self.catch_up_other),
            sync_not_ticking: load(&self.sync_not_ticking),
            warp: load(&self.warp),
        }
    }
}

/// VM-wide time state.
///
/// The flags are written by the clock subsystem and read by every vCPU, so
/// they are atomics; writers are serialized by their owner.
pub struct AxVmTimeState<H: AxTimeHal> {
    tsc_virtualized: AtomicBool,
    use_real_host_counter: AtomicBool,
    ticks_per_second: AtomicU64,
    catch_up_active: AtomicBool,
    catch_up_percent: AtomicU32,
    virtual_sync_ticking: AtomicBool,
    warp_drive_active: AtomicBool,
    maybe_use_offsetted_host_counter: AtomicBool,
    stats: PassthroughStats,
    _hal: PhantomData<fn() -> H>,
}

impl<H: AxTimeHal> AxVmTimeState<H> {
    /// Creates the time state from a validated configuration.
    pub fn new(config: &AxVmTimeConfig) -> Self {
        Self {
            tsc_virtualized: AtomicBool::new(config.tsc_virtualized),
            use_real_host_counter: AtomicBool::new(config.use_real_host_counter),
            ticks_per_second: AtomicU64::new(config.ticks_per_second),
            catch_up_active: AtomicBool::new(false),
            catch_up_percent: AtomicU32::new(0),
            virtual_sync_ticking: AtomicBool::new(true),
            warp_drive_active: AtomicBool::new(false),
            maybe_use_offsetted_host_counter: AtomicBool::new(config.host_counter_fixed),
            stats: PassthroughStats::default(),
            _hal: PhantomData,
        }
    }

    /// Whether the guest counter is derived rather than the raw host counter.
    pub fn tsc_virtualized(&self) -> bool {
        self.tsc_virtualized.load(Ordering::Acquire)
    }

    /// Whether the host counter is the raw source.
    pub fn uses_real_host_counter(&self) -> bool {
        self.use_real_host_counter.load(Ordering::Acquire)
    }

    /// The configured nominal frequency.
    pub fn ticks_per_second(&self) -> u64 {
        self.ticks_per_second.load(Ordering::Acquire)
    }

    /// Enters (`Some(percent)`) or leaves (`None`) virtual-sync catch-up.
    pub fn set_catch_up(&self, percent: Option<u32>) {
        self.catch_up_percent
            .store(percent.unwrap_or(0), Ordering::Release);
        self.catch_up_active
            .store(percent.is_some(), Ordering::Release);
    }

    /// Current catch-up percentage, if catch-up is active.
    pub fn catch_up(&self) -> Option<u32> {
        self.catch_up_active
            .load(Ordering::Acquire)
            .then(|| self.catch_up_percent.load(Ordering::Acquire))
    }

    /// Marks the virtual-sync clock as ticking or halted.
    pub fn set_virtual_sync_ticking(&self, ticking: bool) {
        self.virtual_sync_ticking.store(ticking, Ordering::Release);
    }

    /// Whether the virtual-sync clock is ticking.
    pub fn virtual_sync_ticking(&self) -> bool {
        self.virtual_sync_ticking.load(Ordering::Acquire)
    }

    /// Turns warp drive on or off.
    pub fn set_warp_drive(&self, active: bool) {
        self.warp_drive_active.store(active, Ordering::Release);
    }

    /// Whether warp drive is active.
    pub fn warp_drive_active(&self) -> bool {
        self.warp_drive_active.load(Ordering::Acquire)
    }

    /// Updates the cached hint telling whether an offsetted host counter
    /// may be handed to the guest at all.
    pub fn set_maybe_use_offsetted_host_counter(&self, maybe: bool) {
        self.maybe_use_offsetted_host_counter
            .store(maybe, Ordering::Release);
    }

    /// See [`AxVmTimeState::set_maybe_use_offsetted_host_counter`].
    pub fn maybe_use_offsetted_host_counter(&self) -> bool {
        self.maybe_use_offsetted_host_counter.load(Ordering::Acquire)
    }

    /// Passthrough refusal statistics.
    pub fn passthrough_stats(&self) -> PassthroughStatsSnapshot {
        self.stats.snapshot()
    }

    /// The guest counter frequency in Hz.
    ///
    /// This is the host counter's calibrated frequency when the host counter
    /// is the source and its calibration is known, the nominal frequency
    /// otherwise.
    pub fn frequency_hz(&self) -> u64 {
        if self.uses_real_host_counter() {
            if let Some(hz) = H::host_counter_hz() {
                return hz;
            }
        }
        self.ticks_per_second()
    }

    /// The virtual-sync clock scaled to the guest counter frequency.
    fn raw_virtual(&self, check_timers: bool) -> u64 {
        scale_virtual_time(H::virtual_sync_now(check_timers), self.ticks_per_second())
    }

    /// Reading of the configured raw source.
    fn raw_source(&self, check_timers: bool) -> u64 {
        if self.uses_real_host_counter() {
            H::host_counter()
        } else {
            self.raw_virtual(check_timers)
        }
    }

    fn record_refusal(&self, vcpu: &AxVCpuTimeState) {
        let stats = &self.stats;
        if !self.maybe_use_offsetted_host_counter() {
            PassthroughStats::bump(&stats.not_fixed);
        } else if !vcpu.ticking {
            PassthroughStats::bump(&stats.not_ticking);
        } else if !self.uses_real_host_counter() {
            if let Some(percent) = self.catch_up() {
                PassthroughStats::bump(match percent {
                    0..=10 => &stats.catch_up_le_10,
                    11..=25 => &stats.catch_up_le_25,
                    26..=100 => &stats.catch_up_le_100,
                    _ => &stats.catch_up_other,
                });
            } else if !self.virtual_sync_ticking() {
                PassthroughStats::bump(&stats.sync_not_ticking);
            } else if self.warp_drive_active() {
                PassthroughStats::bump(&stats.warp);
            }
        }
    }
}

impl<H: AxTimeHal> core::fmt::Debug for AxVmTimeState<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AxVmTimeState")
            .field("tsc_virtualized", &self.tsc_virtualized())
            .field("use_real_host_counter", &self.uses_real_host_counter())
            .field("ticks_per_second", &self.ticks_per_second())
            .field("catch_up", &self.catch_up())
            .field("virtual_sync_ticking", &self.virtual_sync_ticking())
            .field("warp_drive_active", &self.warp_drive_active())
            .finish()
    }
}

/// Per-vCPU counter state.
///
/// Owned by the vCPU; every method takes the VM state it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AxVCpuTimeState {
    ticking: bool,
    saved: u64,
    raw_offset: u64,
}

impl AxVCpuTimeState {
    /// Creates a paused counter reading zero.
    pub const fn new() -> Self {
        Self {
            ticking: false,
            saved: 0,
            raw_offset: 0,
        }
    }

    /// Whether the counter is ticking.
    pub const fn is_ticking(&self) -> bool {
        self.ticking
    }

    /// The offset subtracted from the raw source while ticking.
    pub const fn raw_offset(&self) -> u64 {
        self.raw_offset
    }

    /// Starts the counter from the value it was paused at.
    ///
    /// # Panics
    ///
    /// Panics if the counter is already ticking.
    pub fn resume<H: AxTimeHal>(&mut self, vm: &AxVmTimeState<H>) {
        assert!(!self.ticking, "resuming a counter that is already ticking");
        if vm.tsc_virtualized() {
            self.raw_offset = vm.raw_source(false).wrapping_sub(self.saved);
        }
        self.ticking = true;
        trace!("counter resumed at {:#x}, offset {:#x}", self.saved, self.raw_offset);
    }

    /// Stops the counter, latching its current value.
    ///
    /// # Panics
    ///
    /// Panics if the counter is not ticking.
    pub fn pause<H: AxTimeHal>(&mut self, vm: &AxVmTimeState<H>) {
        assert!(self.ticking, "pausing a counter that is not ticking");
        self.saved = self.current(vm, false);
        self.ticking = false;
        trace!("counter paused at {:#x}", self.saved);
    }

    /// Reads the guest-visible counter.
    ///
    /// `check_timers` is forwarded to the virtual-sync clock read; see
    /// [`AxTimeHal::virtual_sync_now`].
    pub fn current<H: AxTimeHal>(&self, vm: &AxVmTimeState<H>, check_timers: bool) -> u64 {
        if !self.ticking {
            return self.saved;
        }
        if !vm.tsc_virtualized() {
            return H::host_counter();
        }
        vm.raw_source(check_timers).wrapping_sub(self.raw_offset)
    }

    /// Overwrites the counter, keeping its ticking state.
    pub fn set<H: AxTimeHal>(&mut self, vm: &AxVmTimeState<H>, value: u64) {
        let was_ticking = self.ticking;
        if was_ticking {
            self.pause(vm);
        }
        self.saved = value;
        if was_ticking {
            self.resume(vm);
        }
    }

    /// Checks whether the host counter can be handed to the guest directly,
    /// returning the offset hardware must add to it.
    ///
    /// The offset of a virtual-sync sourced counter drifts with the host
    /// counter, so it is valid for the current quantum only.
    pub fn passthrough_offset<H: AxTimeHal>(&self, vm: &AxVmTimeState<H>) -> Option<u64> {
        let use_real = vm.uses_real_host_counter();
        let allowed = vm.maybe_use_offsetted_host_counter()
            && self.ticking
            && (use_real
                || (vm.catch_up().is_none()
                    && vm.virtual_sync_ticking()
                    && !vm.warp_drive_active()));
        if !allowed {
            vm.record_refusal(self);
            return None;
        }
        Some(if use_real {
            if vm.tsc_virtualized() {
                self.raw_offset
            } else {
                0
            }
        } else {
            let now = vm.raw_virtual(false).wrapping_sub(self.raw_offset);
            now.wrapping_sub(H::host_counter())
        })
    }
}
