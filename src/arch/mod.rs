//! Architecture-specific register sets and context switching.
//!
//! Each backend provides:
//!
//! - [`Registers`]: the callee-saved register set of the host ABI, plus the
//!   floating point control state that must survive a switch.
//! - [`switch_context`]: saves the running context into `from` and resumes `to`.
//! - [`current_sp`], [`read_host_counter`] and [`host_counter_hz`].

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", not(windows)))] {
        mod x86_64;
        pub use self::x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::*;
    } else {
        compile_error!("axvcpu-core supports x86_64 (SysV) and aarch64 hosts only");
    }
}

/// The entry point a fresh worker context jumps to, with the pointer it was
/// prepared with as its only argument. It must never return.
pub type WorkerEntry = extern "C" fn(usize) -> !;
