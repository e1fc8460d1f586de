// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxVCpu core - vCPU execution and time coordination for hosted hypervisors.
//!
//! This crate provides the pieces a hypervisor runtime needs to run one host
//! thread per virtual CPU and keep those threads consistent with each other:
//!
//! # Features
//!
//! - Guest timestamp counter virtualization, with pause/resume offsets and
//!   hardware passthrough feasibility checks
//! - Privileged workers that can transfer out to the host and be resumed
//!   exactly where they left off
//! - VM-wide rendezvous under several execution disciplines, including
//!   rendezvous requested from within a rendezvous callback
//! - Hardware abstraction layer for host clock services

#[macro_use]
extern crate log;

// Core modules
mod arch; // Architecture-specific context switching
mod config; // VM configuration
mod exit; // Host call reasons of privileged workers
mod hal; // Hardware abstraction layer interfaces
mod rendezvous; // VM-wide rendezvous coordinator
mod sync; // Blocking gates
mod time; // Guest counter virtualization
mod transfer; // Privileged context transfer
mod vcpu; // Per-vCPU wrapper and thread binding
mod vm; // Shared VM state

/// Index of a vCPU within its VM.
pub type VCpuId = usize;

// Public API exports
pub use config::{AxVmConfig, AxVmTimeConfig};
pub use exit::AxHostCall;
pub use hal::AxTimeHal;
pub use rendezvous::{
    Rendezvous, RendezvousCallback, RendezvousFlags, RendezvousKind, RendezvousSnapshot,
};
pub use time::{
    mul_u64_u32_div_u32, mul_u64_u64_div_u64, scale_virtual_time, AxVCpuTimeState,
    AxVmTimeState, PassthroughStats, PassthroughStatsSnapshot, VIRTUAL_CLOCK_HZ,
};
pub use transfer::{
    ContinuationBuffer, StackUsage, TransferCtx, TransferOutcome, DEFAULT_STACK_SIZE,
    MIN_STACK_SIZE, STACK_GUARD_SIZE,
};
pub use vcpu::*;
pub use vm::AxVm;
