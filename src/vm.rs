use std::sync::Arc;

use axerrno::AxResult;

use crate::config::AxVmConfig;
use crate::hal::AxTimeHal;
use crate::rendezvous::{Rendezvous, RendezvousFlags, RendezvousKind};
use crate::time::AxVmTimeState;
use crate::VCpuId;

/// The VM-wide part of the vCPU core, shared by all vCPU threads.
pub struct AxVm<H: AxTimeHal> {
    config: AxVmConfig,
    time: AxVmTimeState<H>,
    rendezvous: Rendezvous,
}

impl<H: AxTimeHal> AxVm<H> {
    /// Creates the VM state from `config`.
    pub fn new(config: AxVmConfig) -> AxResult<Arc<Self>> {
        config.validate()?;
        debug!(
            "creating VM with {} vCPUs, time config {:?}",
            config.vcpu_count, config.time
        );
        Ok(Arc::new(Self {
            time: AxVmTimeState::new(&config.time),
            rendezvous: Rendezvous::new(config.vcpu_count),
            config,
        }))
    }

    /// The configuration the VM was created with.
    pub fn config(&self) -> &AxVmConfig {
        &self.config
    }

    /// Number of vCPUs.
    pub fn vcpu_count(&self) -> usize {
        self.config.vcpu_count
    }

    /// VM-wide time state.
    pub fn time(&self) -> &AxVmTimeState<H> {
        &self.time
    }

    /// The rendezvous coordinator.
    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }

    /// Frequency of the guest counter in Hz.
    pub fn cpu_ticks_per_second(&self) -> u64 {
        self.time.frequency_hz()
    }

    /// Requests a rendezvous from a thread that is not a vCPU.
    ///
    /// See [`Rendezvous::request`].
    pub fn request_rendezvous<F>(
        &self,
        kind: RendezvousKind,
        flags: RendezvousFlags,
        callback: F,
    ) -> AxResult
    where
        F: Fn(VCpuId) -> AxResult + Send + Sync + 'static,
    {
        self.rendezvous.request(None, kind, flags, callback)
    }
}

impl<H: AxTimeHal> core::fmt::Debug for AxVm<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AxVm")
            .field("config", &self.config)
            .field("time", &self.time)
            .field("rendezvous", &self.rendezvous)
            .finish()
    }
}
