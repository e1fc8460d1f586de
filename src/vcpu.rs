use core::any::TypeId;
use core::cell::{Cell, RefCell};
use std::sync::Arc;

use axerrno::{ax_err, AxResult};

use crate::hal::AxTimeHal;
use crate::rendezvous::{RendezvousFlags, RendezvousKind};
use crate::time::AxVCpuTimeState;
use crate::transfer::{ContinuationBuffer, StackUsage, TransferCtx, TransferOutcome};
use crate::vm::AxVm;
use crate::VCpuId;

/// A virtual CPU as seen by the execution and time core.
///
/// Each vCPU is driven by exactly one host thread, which creates it and
/// binds itself to it with [`AxVCpu::with_current_cpu_set`].
///
/// Note that:
/// - This struct handles internal mutability itself, almost all the methods are `&self`.
/// - This struct is not `Send`: the suspended privileged worker lives on
///   the creating thread's continuation buffer.
pub struct AxVCpu<H: AxTimeHal + 'static> {
    /// The id of the vcpu.
    id: VCpuId,
    /// The VM this vcpu belongs to.
    vm: Arc<AxVm<H>>,
    /// Guest counter state, only touched by the owning thread.
    time: RefCell<AxVCpuTimeState>,
    /// Continuation of privileged calls.
    transfer: RefCell<ContinuationBuffer>,
}

impl<H: AxTimeHal + 'static> AxVCpu<H> {
    /// Create a new [`AxVCpu`] with index `id` in `vm`.
    pub fn new(vm: Arc<AxVm<H>>, id: VCpuId) -> AxResult<Self> {
        if id >= vm.vcpu_count() {
            return ax_err!(
                InvalidInput,
                format!("vCPU {id} out of range, the VM has {}", vm.vcpu_count())
            );
        }
        let transfer = ContinuationBuffer::with_stack_size(vm.config().transfer_stack_size)?;
        Ok(Self {
            id,
            vm,
            time: RefCell::new(AxVCpuTimeState::new()),
            transfer: RefCell::new(transfer),
        })
    }

    /// Get the id of the vcpu.
    pub const fn id(&self) -> VCpuId {
        self.id
    }

    /// Get whether the vcpu is the BSP. We always assume the first vcpu (vcpu with id #0) is the BSP.
    pub const fn is_bsp(&self) -> bool {
        self.id == 0
    }

    /// The VM this vcpu belongs to.
    pub fn vm(&self) -> &Arc<AxVm<H>> {
        &self.vm
    }

    /// Whether the calling thread is bound to this vcpu.
    pub fn is_current(&self) -> bool {
        CURRENT_VCPU.with(|current| current.get() == Some(self.binding()))
    }

    fn binding(&self) -> Binding {
        Binding {
            vcpu: self as *const Self as usize,
            ty: TypeId::of::<Self>(),
            id: self.id,
        }
    }

    /// Execute a block with the current vcpu set to `&self`.
    pub fn with_current_cpu_set<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        if CURRENT_VCPU.with(Cell::get).is_some() {
            panic!("Nested vcpu operation is not allowed!");
        }
        let _guard = BindGuard::bind(self.binding());
        f()
    }

    /// Starts the guest counter.
    ///
    /// # Panics
    ///
    /// Panics if the counter is already ticking.
    pub fn resume_cpu_tick(&self) {
        self.time.borrow_mut().resume(self.vm.time());
    }

    /// Stops the guest counter.
    ///
    /// # Panics
    ///
    /// Panics if the counter is not ticking.
    pub fn pause_cpu_tick(&self) {
        self.time.borrow_mut().pause(self.vm.time());
    }

    /// Whether the guest counter is ticking.
    pub fn is_cpu_ticking(&self) -> bool {
        self.time.borrow().is_ticking()
    }

    /// Reads the guest counter, letting the virtual-sync clock run expired timers.
    pub fn cpu_tick(&self) -> u64 {
        self.time.borrow().current(self.vm.time(), true)
    }

    /// Reads the guest counter without side effects on timers.
    pub fn cpu_tick_no_check(&self) -> u64 {
        self.time.borrow().current(self.vm.time(), false)
    }

    /// Sets the guest counter.
    ///
    /// # Panics
    ///
    /// Panics unless the calling thread is bound to this vcpu.
    pub fn set_cpu_tick(&self, value: u64) {
        assert!(
            self.is_current(),
            "vCPU {} counter set from a foreign thread",
            self.id
        );
        self.time.borrow_mut().set(self.vm.time(), value);
    }

    /// The offset to program for direct host counter access, or `None` if
    /// guest counter reads must be intercepted for now.
    pub fn can_use_real_counter(&self) -> Option<u64> {
        self.time.borrow().passthrough_offset(self.vm.time())
    }

    /// Frequency of the guest counter in Hz.
    pub fn cpu_ticks_per_second(&self) -> u64 {
        self.vm.cpu_ticks_per_second()
    }

    /// Runs `worker` in the privileged context.
    ///
    /// See [`ContinuationBuffer::capture_and_call`].
    pub fn call_privileged<F>(&self, worker: F) -> TransferOutcome<AxResult>
    where
        F: FnOnce(&mut TransferCtx<'_>) -> AxResult + 'static,
    {
        self.transfer.borrow_mut().capture_and_call(worker)
    }

    /// Resumes the privileged worker with the host's `reply`.
    ///
    /// See [`ContinuationBuffer::resume_transferred`].
    pub fn resume_privileged(&self, reply: AxResult<u64>) -> TransferOutcome<AxResult> {
        self.transfer.borrow_mut().resume_transferred(reply)
    }

    /// Whether a privileged worker waits for the host.
    pub fn in_transferred_call(&self) -> bool {
        self.transfer.borrow().in_transferred_call()
    }

    /// Stack usage of the privileged worker.
    pub fn transfer_stack_usage(&self) -> StackUsage {
        self.transfer.borrow().stack_usage()
    }

    /// Requests a rendezvous from this vcpu's thread.
    ///
    /// See [`Rendezvous::request`](crate::Rendezvous::request).
    pub fn request_rendezvous<F>(
        &self,
        kind: RendezvousKind,
        flags: RendezvousFlags,
        callback: F,
    ) -> AxResult
    where
        F: Fn(VCpuId) -> AxResult + Send + Sync + 'static,
    {
        self.vm
            .rendezvous()
            .request(Some(self.id), kind, flags, callback)
    }

    /// Joins a posted rendezvous, if any. Returns whether one was joined.
    pub fn poll_rendezvous(&self) -> bool {
        self.vm.rendezvous().participate(self.id)
    }
}

impl<H: AxTimeHal + 'static> core::fmt::Debug for AxVCpu<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AxVCpu")
            .field("id", &self.id)
            .field("time", &self.time)
            .field("transfer", &self.transfer)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    vcpu: usize,
    ty: TypeId,
    id: VCpuId,
}

std::thread_local! {
    static CURRENT_VCPU: Cell<Option<Binding>> = const { Cell::new(None) };
}

/// Clears the binding even if the bound block unwinds.
struct BindGuard;

impl BindGuard {
    fn bind(binding: Binding) -> Self {
        CURRENT_VCPU.with(|current| current.set(Some(binding)));
        BindGuard
    }
}

impl Drop for BindGuard {
    fn drop(&mut self) {
        CURRENT_VCPU.with(|current| current.set(None));
    }
}

/// Get the id of the vcpu bound to the calling thread.
pub fn current_vcpu_id() -> Option<VCpuId> {
    CURRENT_VCPU.with(|current| current.get().map(|binding| binding.id))
}

/// Run `f` on the vcpu bound to the calling thread.
///
/// Returns `None` if no vcpu is bound, or the bound vcpu has a different
/// host type than `H`.
pub fn with_current_vcpu<H, T>(f: impl FnOnce(&AxVCpu<H>) -> T) -> Option<T>
where
    H: AxTimeHal + 'static,
{
    let binding = CURRENT_VCPU.with(Cell::get)?;
    if binding.ty != TypeId::of::<AxVCpu<H>>() {
        return None;
    }
    // SAFETY: the binding is only set while `with_current_cpu_set` borrows
    // the vcpu on this thread, and the type matches.
    let vcpu = unsafe { &*(binding.vcpu as *const AxVCpu<H>) };
    Some(f(vcpu))
}
