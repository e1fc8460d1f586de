use core::arch::{asm, naked_asm};

use memory_addr::VirtAddr;

use super::WorkerEntry;

/// Callee-saved state of the AAPCS64 ABI.
///
/// Fields are only read by [`switch_context`].
#[allow(dead_code)]
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Registers {
    sp: u64,
    /// x19 ..= x28
    x: [u64; 10],
    fp: u64,
    lr: u64,
    /// Low halves of v8 ..= v15
    d: [u64; 8],
}

impl Registers {
    /// Builds a context that starts `entry(arg)` on the stack ending at `top`.
    ///
    /// `top` must be 16-byte aligned.
    pub fn new_worker(top: VirtAddr, entry: WorkerEntry, arg: usize) -> Self {
        let mut x = [0; 10];
        x[0] = arg as u64;
        x[1] = entry as usize as u64;
        Self {
            sp: top.as_usize() as u64,
            x,
            fp: 0,
            lr: worker_trampoline as usize as u64,
            d: [0; 8],
        }
    }

    /// The stack pointer this context resumes with.
    pub fn sp(&self) -> VirtAddr {
        VirtAddr::from_usize(self.sp as usize)
    }
}

#[unsafe(naked)]
unsafe extern "C" fn worker_trampoline() -> ! {
    naked_asm!("mov x0, x19", "blr x20", "brk #1")
}

/// Saves the current context into `from` and resumes `to`.
///
/// # Safety
///
/// Both pointers must be valid; `to` must have been produced by
/// [`Registers::new_worker`] or by an earlier switch away from it.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut Registers, _to: *const Registers) {
    naked_asm!(
        "mov x9, sp",
        "str x9, [x0, #0]",
        "stp x19, x20, [x0, #8]",
        "stp x21, x22, [x0, #24]",
        "stp x23, x24, [x0, #40]",
        "stp x25, x26, [x0, #56]",
        "stp x27, x28, [x0, #72]",
        "stp x29, x30, [x0, #88]",
        "stp d8, d9, [x0, #104]",
        "stp d10, d11, [x0, #120]",
        "stp d12, d13, [x0, #136]",
        "stp d14, d15, [x0, #152]",
        "ldr x9, [x1, #0]",
        "mov sp, x9",
        "ldp x19, x20, [x1, #8]",
        "ldp x21, x22, [x1, #24]",
        "ldp x23, x24, [x1, #40]",
        "ldp x25, x26, [x1, #56]",
        "ldp x27, x28, [x1, #72]",
        "ldp x29, x30, [x1, #88]",
        "ldp d8, d9, [x1, #104]",
        "ldp d10, d11, [x1, #120]",
        "ldp d12, d13, [x1, #136]",
        "ldp d14, d15, [x1, #152]",
        "ret",
    )
}

/// Reads the stack pointer of the caller.
#[inline(always)]
pub fn current_sp() -> VirtAddr {
    let sp: usize;
    // SAFETY: reading sp has no side effects.
    unsafe { asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags)) };
    VirtAddr::from_usize(sp)
}

/// Reads the virtual counter.
#[inline]
pub fn read_host_counter() -> u64 {
    let cnt: u64;
    // SAFETY: CNTVCT_EL0 is readable from EL0 on every supported host.
    unsafe { asm!("isb", "mrs {}, cntvct_el0", out(reg) cnt, options(nomem, nostack)) };
    cnt
}

/// The counter frequency as programmed by firmware.
pub fn host_counter_hz() -> Option<u64> {
    let freq: u64;
    // SAFETY: CNTFRQ_EL0 is readable from EL0.
    unsafe { asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nomem, nostack)) };
    (freq != 0).then_some(freq)
}
