//! Transferring a privileged worker out to the host and back.
//!
//! A worker started with [`ContinuationBuffer::capture_and_call`] runs on a
//! stack owned by the buffer. When it calls [`TransferCtx::transfer_out`],
//! its registers are saved in the buffer and control returns to whichever
//! host frame last entered the worker, which sees
//! [`TransferOutcome::Transferred`]. The worker's frames stay intact on the
//! private stack until [`ContinuationBuffer::resume_transferred`] switches
//! back into them, at which point `transfer_out` returns the host's reply.
//!
//! The private stack is an anonymous mapping with an inaccessible guard
//! region below it. A worker that runs off the bottom of its stack faults
//! on the guard and the process dies.

use core::any::Any;
use core::ffi::c_void;
use core::marker::PhantomData;
use core::num::NonZeroUsize;
use core::ptr::{self, NonNull};
use std::panic::{self, AssertUnwindSafe};

use axerrno::{ax_err, AxError, AxResult};
use memory_addr::{align_down, align_up, VirtAddr};
use nix::errno::Errno;
use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};

use crate::arch::{self, Registers};
use crate::exit::AxHostCall;

/// Default size of the private stack.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;
/// Smallest accepted private stack.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Size of the inaccessible region mapped below every private stack.
pub const STACK_GUARD_SIZE: usize = 64 * 1024;

const STACK_ALIGN: usize = 16;
const STACK_GRANULE: usize = 4096;
const STACK_CANARY: u64 = 0x5a17_c0de_dead_beef;

type ErasedEntry = Box<dyn FnOnce(&mut TransferCtx<'_>) -> Box<dyn Any>>;
type Notification = Box<dyn FnMut(&AxHostCall) -> AxResult>;

/// How a call into the worker came back.
#[derive(Debug, PartialEq, Eq)]
pub enum TransferOutcome<R> {
    /// The worker returned.
    Completed(R),
    /// The worker transferred out and waits for
    /// [`ContinuationBuffer::resume_transferred`].
    Transferred(AxHostCall),
}

impl<R> TransferOutcome<R> {
    /// Returns the worker's result if it completed.
    pub fn completed(self) -> Option<R> {
        match self {
            Self::Completed(r) => Some(r),
            Self::Transferred(_) => None,
        }
    }

    /// Returns the pending host call if the worker transferred out.
    pub fn transferred(&self) -> Option<AxHostCall> {
        match self {
            Self::Completed(_) => None,
            Self::Transferred(call) => Some(*call),
        }
    }
}

/// Private stack usage observed at transfers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StackUsage {
    /// Bytes in use at the last transfer.
    pub saved: usize,
    /// Largest number of bytes in use at any transfer.
    pub max: usize,
    /// Average number of bytes in use per transfer.
    pub avg: usize,
    /// Sum of bytes in use over all transfers.
    pub total: u64,
    /// Number of transfers.
    pub count: u64,
}

impl StackUsage {
    fn record(&mut self, bytes: usize) {
        self.saved = bytes;
        self.max = self.max.max(bytes);
        self.total += bytes as u64;
        self.count += 1;
        self.avg = (self.total / self.count) as usize;
    }
}

/// A private stack: `size` writable bytes above a [`STACK_GUARD_SIZE`]
/// region mapped without any access.
struct GuardedStack {
    base: NonNull<c_void>,
    len: NonZeroUsize,
}

impl GuardedStack {
    fn map(size: usize) -> nix::Result<Self> {
        let len = size
            .checked_add(STACK_GUARD_SIZE)
            .and_then(NonZeroUsize::new)
            .ok_or(Errno::ENOMEM)?;
        // SAFETY: a fresh anonymous mapping aliases no existing memory.
        let base = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )?
        };
        let stack = Self { base, len };
        // SAFETY: the range is the part of the new mapping above the guard.
        unsafe {
            mprotect(
                stack.base.byte_add(STACK_GUARD_SIZE),
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            )?
        };
        Ok(stack)
    }

    /// Lowest writable address.
    fn bottom(&self) -> usize {
        self.base.as_ptr() as usize + STACK_GUARD_SIZE
    }

    /// One past the highest writable address.
    fn top(&self) -> usize {
        self.base.as_ptr() as usize + self.len.get()
    }

    fn size(&self) -> usize {
        self.len.get() - STACK_GUARD_SIZE
    }

    fn canary(&self) -> *mut u64 {
        // SAFETY: `bottom` is page aligned and inside the writable range.
        unsafe { self.base.byte_add(STACK_GUARD_SIZE).cast::<u64>().as_ptr() }
    }
}

impl Drop for GuardedStack {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned by `self` and no frame lives on it anymore.
        if let Err(err) = unsafe { munmap(self.base, self.len.get()) } {
            warn!("failed to unmap transfer stack at {:p}: {err}", self.base);
        }
    }
}

/// State shared between the host side and the worker side.
///
/// Lives at a fixed heap address, since the worker's frames point into it.
struct JmpCore {
    host: Registers,
    worker: Registers,
    stack_bottom: VirtAddr,
    stack_top: VirtAddr,
    /// The worker has transferred out and not been resumed yet.
    in_transferred_call: bool,
    /// The worker has been started and has not finished yet.
    running: bool,
    /// Worker stack pointer recorded at the last transfer. Only reported,
    /// the stack is a fixed mapping and cannot move.
    sp_check: Option<VirtAddr>,
    usage: StackUsage,
    pending: Option<AxHostCall>,
    reply: Option<AxResult<u64>>,
    transfers_disabled: u32,
    notification: Option<Notification>,
    entry: Option<ErasedEntry>,
    outcome: Option<std::thread::Result<Box<dyn Any>>>,
}

/// A reusable continuation for running a privileged worker that may
/// transfer out to the host and be resumed later.
///
/// The buffer is tied to the thread that created it: the worker's frames
/// reference that thread's state.
pub struct ContinuationBuffer<R: 'static = AxResult> {
    core: NonNull<JmpCore>,
    stack: GuardedStack,
    _result: PhantomData<fn() -> R>,
}

impl<R: 'static> ContinuationBuffer<R> {
    /// Creates a buffer with a [`DEFAULT_STACK_SIZE`] private stack.
    ///
    /// # Panics
    ///
    /// Panics if the stack cannot be mapped.
    pub fn new() -> Self {
        match Self::build(DEFAULT_STACK_SIZE) {
            Ok(buf) => buf,
            Err(err) => panic!("cannot map a {DEFAULT_STACK_SIZE} byte transfer stack: {err}"),
        }
    }

    /// Creates a buffer with a private stack of `size` bytes.
    pub fn with_stack_size(size: usize) -> AxResult<Self> {
        if size < MIN_STACK_SIZE {
            return ax_err!(InvalidInput, "transfer stack is too small");
        }
        Self::build(align_up(size, STACK_GRANULE)).or_else(|err| {
            warn!("cannot map a {size} byte transfer stack: {err}");
            ax_err!(NoMemory)
        })
    }

    fn build(size: usize) -> nix::Result<Self> {
        let stack = GuardedStack::map(size)?;
        let stack_bottom = VirtAddr::from_usize(align_up(stack.bottom(), STACK_ALIGN));
        let stack_top = VirtAddr::from_usize(align_down(stack.top(), STACK_ALIGN));
        let core = Box::new(JmpCore {
            host: Registers::default(),
            worker: Registers::default(),
            stack_bottom,
            stack_top,
            in_transferred_call: false,
            running: false,
            sp_check: None,
            usage: StackUsage::default(),
            pending: None,
            reply: None,
            transfers_disabled: 0,
            notification: None,
            entry: None,
            outcome: None,
        });
        Ok(Self {
            core: NonNull::from(Box::leak(core)),
            stack,
            _result: PhantomData,
        })
    }

    fn core(&self) -> &JmpCore {
        // SAFETY: the core is owned by `self` and the worker is not running
        // while the host side holds `&self`.
        unsafe { self.core.as_ref() }
    }

    fn core_mut(&mut self) -> &mut JmpCore {
        // SAFETY: as in `core`.
        unsafe { self.core.as_mut() }
    }

    /// Whether a worker has transferred out and awaits resumption.
    pub fn in_transferred_call(&self) -> bool {
        self.core().in_transferred_call
    }

    /// The host call the suspended worker is waiting on.
    pub fn pending_call(&self) -> Option<AxHostCall> {
        self.core().pending
    }

    /// Stack usage statistics.
    pub fn stack_usage(&self) -> StackUsage {
        self.core().usage
    }

    /// Size of the private stack, excluding the guard region.
    pub fn stack_size(&self) -> usize {
        self.stack.size()
    }

    /// The worker stack pointer recorded when the suspended worker
    /// transferred out.
    pub fn saved_sp(&self) -> Option<VirtAddr> {
        self.core().sp_check
    }

    /// Runs `worker` on the private stack.
    ///
    /// Returns [`TransferOutcome::Completed`] if it returns without
    /// transferring out, [`TransferOutcome::Transferred`] as soon as it
    /// transfers out. A panic in the worker is propagated to the caller.
    ///
    /// # Panics
    ///
    /// Panics if the buffer already holds a started worker.
    pub fn capture_and_call<F>(&mut self, worker: F) -> TransferOutcome<R>
    where
        F: FnOnce(&mut TransferCtx<'_>) -> R + 'static,
    {
        let core_ptr = self.core.as_ptr() as usize;
        let core = self.core_mut();
        assert!(
            !core.in_transferred_call && !core.running,
            "continuation buffer is already armed"
        );
        let entry: ErasedEntry =
            Box::new(move |ctx: &mut TransferCtx<'_>| Box::new(worker(ctx)) as Box<dyn Any>);
        core.entry = Some(entry);
        core.outcome = None;
        core.pending = None;
        core.reply = None;
        core.transfers_disabled = 0;
        core.worker = Registers::new_worker(core.stack_top, worker_start, core_ptr);
        self.write_canary();
        self.core_mut().running = true;
        trace!("entering worker on stack {:#x}", self.core().stack_top.as_usize());
        self.enter()
    }

    /// Resumes a worker that transferred out, making its `transfer_out`
    /// return `reply`.
    ///
    /// # Panics
    ///
    /// Panics if no worker is waiting, if the saved worker context points
    /// outside the private stack, if the stack canary was overwritten, or if
    /// called from the worker's own stack.
    pub fn resume_transferred(&mut self, reply: AxResult<u64>) -> TransferOutcome<R> {
        let core = self.core();
        assert!(
            core.in_transferred_call,
            "no transferred call to resume"
        );
        let sp = core.worker.sp();
        assert!(
            sp >= core.stack_bottom && sp <= core.stack_top,
            "saved worker stack pointer {:#x} is outside {:#x}..{:#x}",
            sp.as_usize(),
            core.stack_bottom.as_usize(),
            core.stack_top.as_usize()
        );
        let here = arch::current_sp();
        assert!(
            here < core.stack_bottom || here > core.stack_top,
            "resuming a transferred call from its own stack"
        );
        self.check_canary();
        let core = self.core_mut();
        core.reply = Some(reply);
        core.pending = None;
        core.sp_check = None;
        core.in_transferred_call = false;
        trace!("resuming worker at sp {:#x}", sp.as_usize());
        self.enter()
    }

    /// Switches into the worker and interprets why it came back.
    fn enter(&mut self) -> TransferOutcome<R> {
        let core = self.core.as_ptr();
        // SAFETY: `worker` holds a context prepared by `capture_and_call` or
        // saved by `transfer_out`, and `core` outlives the switch.
        unsafe {
            arch::switch_context(ptr::addr_of_mut!((*core).host), ptr::addr_of!((*core).worker))
        };
        self.check_canary();

        let core = self.core_mut();
        if let Some(outcome) = core.outcome.take() {
            core.running = false;
            core.in_transferred_call = false;
            core.sp_check = None;
            return match outcome {
                Ok(result) => match result.downcast::<R>() {
                    Ok(result) => TransferOutcome::Completed(*result),
                    Err(_) => panic!("worker returned an unexpected type"),
                },
                Err(payload) => panic::resume_unwind(payload),
            };
        }

        let saved = core.stack_top.as_usize() - core.worker.sp().as_usize();
        core.sp_check = Some(core.worker.sp());
        core.usage.record(saved);
        core.in_transferred_call = true;
        match core.pending {
            Some(call) => {
                trace!("worker transferred out with {call:?}, {saved} bytes in use");
                TransferOutcome::Transferred(call)
            }
            None => panic!("worker switched out without a host call"),
        }
    }

    fn write_canary(&mut self) {
        // SAFETY: the canary slot is the lowest writable word of the stack.
        unsafe { self.stack.canary().write(STACK_CANARY) };
    }

    /// Catches overflows that skipped over the guard region.
    fn check_canary(&self) {
        // SAFETY: as in `write_canary`.
        let canary = unsafe { self.stack.canary().read() };
        if canary != STACK_CANARY {
            panic!("privileged worker overflowed its {} byte stack", self.stack.size());
        }
    }
}

impl<R: 'static> Default for ContinuationBuffer<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: 'static> Drop for ContinuationBuffer<R> {
    fn drop(&mut self) {
        if self.core().running {
            warn!("dropping a continuation buffer with a suspended worker, its frames are abandoned");
        }
        // SAFETY: `core` came from `Box::leak` in `build` and nothing runs on
        // the private stack anymore.
        drop(unsafe { Box::from_raw(self.core.as_ptr()) });
    }
}

impl<R: 'static> core::fmt::Debug for ContinuationBuffer<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let core = self.core();
        f.debug_struct("ContinuationBuffer")
            .field("in_transferred_call", &core.in_transferred_call)
            .field("running", &core.running)
            .field("pending", &core.pending)
            .field("stack_size", &self.stack.size())
            .field("sp_check", &core.sp_check)
            .field("usage", &core.usage)
            .finish()
    }
}

/// The worker's handle on its continuation buffer.
pub struct TransferCtx<'a> {
    core: NonNull<JmpCore>,
    _worker: PhantomData<&'a mut JmpCore>,
}

impl TransferCtx<'_> {
    fn core(&self) -> &JmpCore {
        // SAFETY: the host side does not touch the core while the worker runs.
        unsafe { self.core.as_ref() }
    }

    fn core_mut(&mut self) -> &mut JmpCore {
        // SAFETY: the host side does not touch the core while the worker runs.
        unsafe { self.core.as_mut() }
    }

    /// Suspends the worker and hands `call` to the host.
    ///
    /// Returns the host's reply once the buffer is resumed. If the
    /// notification callback vetoes the transfer, its error is returned
    /// immediately and the worker keeps running.
    ///
    /// # Panics
    ///
    /// Panics if transfers are disabled.
    pub fn transfer_out(&mut self, call: AxHostCall) -> AxResult<u64> {
        let core = self.core_mut();
        assert!(
            core.transfers_disabled == 0,
            "transfer out of a worker with transfers disabled"
        );
        if let Some(notify) = core.notification.as_mut() {
            notify(&call)?;
        }
        core.pending = Some(call);

        let core = self.core.as_ptr();
        // SAFETY: `host` was saved by the switch that entered this worker.
        unsafe {
            arch::switch_context(ptr::addr_of_mut!((*core).worker), ptr::addr_of!((*core).host))
        };

        self.core_mut()
            .reply
            .take()
            .unwrap_or(Err(AxError::BadState))
    }

    /// Forbids transfers until the matching [`TransferCtx::enable_transfers`].
    /// Calls nest.
    pub fn disable_transfers(&mut self) {
        self.core_mut().transfers_disabled += 1;
    }

    /// Undoes one [`TransferCtx::disable_transfers`].
    ///
    /// # Panics
    ///
    /// Panics if transfers are not disabled.
    pub fn enable_transfers(&mut self) {
        let core = self.core_mut();
        assert!(core.transfers_disabled > 0, "transfers are not disabled");
        core.transfers_disabled -= 1;
    }

    /// Whether [`TransferCtx::transfer_out`] is currently allowed.
    pub fn transfers_enabled(&self) -> bool {
        self.core().transfers_disabled == 0
    }

    /// Installs a callback run before every transfer out. Returning an error
    /// vetoes the transfer.
    pub fn set_notification<N>(&mut self, notification: N)
    where
        N: FnMut(&AxHostCall) -> AxResult + 'static,
    {
        self.core_mut().notification = Some(Box::new(notification));
    }

    /// Removes the notification callback.
    pub fn clear_notification(&mut self) {
        self.core_mut().notification = None;
    }
}

/// First frame on the private stack.
extern "C" fn worker_start(core: usize) -> ! {
    let core = core as *mut JmpCore;
    // SAFETY: `capture_and_call` passes its live core and waits on the switch.
    let entry = unsafe { (*core).entry.take() };
    let outcome = match entry {
        Some(entry) => panic::catch_unwind(AssertUnwindSafe(|| {
            let mut ctx = TransferCtx {
                // SAFETY: `core` is non-null, it was derived from a `NonNull`.
                core: unsafe { NonNull::new_unchecked(core) },
                _worker: PhantomData,
            };
            entry(&mut ctx)
        })),
        None => Err(Box::new("worker started without an entry") as Box<dyn Any + Send>),
    };
    // SAFETY: as above; the host side resumes at its last switch.
    unsafe {
        (*core).outcome = Some(outcome);
        arch::switch_context(ptr::addr_of_mut!((*core).worker), ptr::addr_of!((*core).host));
    }
    std::process::abort()
}
