use core::arch::{asm, naked_asm};

use memory_addr::VirtAddr;

use super::WorkerEntry;

/// Default MXCSR: all exceptions masked, round to nearest.
const DEFAULT_MXCSR: u32 = 0x1f80;
/// Default x87 control word: all exceptions masked, 64-bit precision.
const DEFAULT_FPUCW: u16 = 0x037f;

/// Callee-saved state of the System V x86_64 ABI.
///
/// Fields are only read by [`switch_context`].
#[allow(dead_code)]
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Registers {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    mxcsr: u32,
    fpucw: u16,
    _pad: u16,
}

impl Registers {
    /// Builds a context that starts `entry(arg)` on the stack ending at `top`.
    ///
    /// `top` must be 16-byte aligned and at least 32 bytes above the stack bottom.
    pub fn new_worker(top: VirtAddr, entry: WorkerEntry, arg: usize) -> Self {
        let top = top.as_usize() as *mut u64;
        // SAFETY: the caller hands us the top of a live, writable stack.
        let rsp = unsafe {
            top.sub(1).write(0);
            top.sub(2).write(0);
            top.sub(3).write(worker_trampoline as usize as u64);
            top.sub(3)
        };
        Self {
            rsp: rsp as u64,
            rbp: 0,
            rbx: arg as u64,
            r12: entry as usize as u64,
            mxcsr: DEFAULT_MXCSR,
            fpucw: DEFAULT_FPUCW,
            ..Default::default()
        }
    }

    /// The stack pointer this context resumes with.
    pub fn sp(&self) -> VirtAddr {
        VirtAddr::from_usize(self.rsp as usize)
    }
}

/// Lands here through the `ret` of [`switch_context`] on a fresh stack.
/// `call` leaves the stack 16-byte aligned minus the return address, as the
/// ABI expects on function entry.
#[unsafe(naked)]
unsafe extern "C" fn worker_trampoline() -> ! {
    naked_asm!("mov rdi, rbx", "call r12", "ud2")
}

/// Saves the current context into `from` and resumes `to`.
///
/// Returns when some other context switches back into `from`.
///
/// # Safety
///
/// Both pointers must be valid; `to` must have been produced by
/// [`Registers::new_worker`] or by an earlier switch away from it.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut Registers, _to: *const Registers) {
    naked_asm!(
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "stmxcsr dword ptr [rdi + 0x38]",
        "fnstcw word ptr [rdi + 0x3c]",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ldmxcsr dword ptr [rsi + 0x38]",
        "fldcw word ptr [rsi + 0x3c]",
        "ret",
    )
}

/// Reads the stack pointer of the caller.
#[inline(always)]
pub fn current_sp() -> VirtAddr {
    let sp: usize;
    // SAFETY: reading rsp has no side effects.
    unsafe { asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags)) };
    VirtAddr::from_usize(sp)
}

/// Reads the host timestamp counter.
#[inline]
pub fn read_host_counter() -> u64 {
    // SAFETY: rdtsc is available on every x86_64 processor.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// The TSC frequency is not architecturally discoverable; the host must
/// calibrate it.
pub fn host_counter_hz() -> Option<u64> {
    None
}
