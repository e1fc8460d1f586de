use axerrno::{ax_err, AxResult};

use crate::transfer::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

/// Time-source configuration of a VM, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxVmTimeConfig {
    /// Whether the guest counter is derived (offset or synthesized) rather
    /// than the raw host counter.
    pub tsc_virtualized: bool,
    /// Whether the host counter is the raw source of the guest counter. If
    /// `false`, the virtual-sync clock scaled to `ticks_per_second` is used.
    pub use_real_host_counter: bool,
    /// Nominal frequency of the guest counter.
    pub ticks_per_second: u64,
    /// Whether the host counter runs at a fixed rate, a precondition for
    /// passing it through to the guest.
    pub host_counter_fixed: bool,
}

impl Default for AxVmTimeConfig {
    fn default() -> Self {
        Self {
            tsc_virtualized: true,
            use_real_host_counter: false,
            ticks_per_second: 2_000_000_000,
            host_counter_fixed: true,
        }
    }
}

impl AxVmTimeConfig {
    /// Checks the configuration for combinations the tick engine cannot honor.
    pub fn validate(&self) -> AxResult {
        if self.ticks_per_second == 0 {
            return ax_err!(InvalidInput, "ticks_per_second must not be zero");
        }
        if !self.tsc_virtualized && !self.use_real_host_counter {
            return ax_err!(
                InvalidInput,
                "a non-virtualized counter must come from the host counter"
            );
        }
        Ok(())
    }
}

/// Configuration of a VM as far as the vCPU core is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxVmConfig {
    /// Number of vCPUs, each served by its own host thread.
    pub vcpu_count: usize,
    /// Time source configuration.
    pub time: AxVmTimeConfig,
    /// Size of the private stack each vCPU's continuation buffer runs
    /// privileged workers on.
    pub transfer_stack_size: usize,
}

impl Default for AxVmConfig {
    fn default() -> Self {
        Self {
            vcpu_count: 1,
            time: AxVmTimeConfig::default(),
            transfer_stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl AxVmConfig {
    /// Creates a configuration for `vcpu_count` vCPUs with default settings.
    pub fn with_vcpus(vcpu_count: usize) -> Self {
        Self {
            vcpu_count,
            ..Default::default()
        }
    }

    /// Checks the configuration.
    pub fn validate(&self) -> AxResult {
        if self.vcpu_count == 0 {
            return ax_err!(InvalidInput, "a VM needs at least one vCPU");
        }
        if self.vcpu_count >= u32::MAX as usize {
            return ax_err!(InvalidInput, "too many vCPUs");
        }
        if self.transfer_stack_size < MIN_STACK_SIZE {
            return ax_err!(InvalidInput, "transfer stack is too small");
        }
        self.time.validate()
    }
}
