//! mimic execution engine
//!
//! Runs unmodified x86-64 guest code on AArch64 or RISC-V-64 hosts by
//! translating guest basic blocks into host machine code on demand. The
//! engine core is the tightly coupled set in this crate:
//!
//! - [`lookup`]: guest-RIP → host-entry cache (direct-mapped L1, paged L2,
//!   reverse block links with undo closures)
//! - [`jit`]: per-host-ISA backends translating front-end IR into code
//!   buffers, with link records for direct block chaining
//! - [`dispatch`]: the per-thread trampoline set driving the
//!   translate-execute-return loop
//! - [`signals`]: host-signal interception, guest signal-frame
//!   construction, and the context-backup LIFO
//! - [`arch::unaligned`]: SIGBUS emulation for unaligned guest atomics
//!
//! The front-end decoder, syscall layer, and CPUID emulation are
//! collaborators behind the [`frontend::BlockSource`], [`hooks::SyscallHandler`],
//! and [`hooks::CpuidHandler`] interfaces.

pub mod arch;
pub mod codebuf;
pub mod config;
pub mod dispatch;
pub mod fallbacks;
pub mod frontend;
pub mod guest_uctx;
pub mod hooks;
pub mod ir;
pub mod jit;
pub mod lookup;
pub mod ra;
pub mod signals;
pub mod state;
pub mod telemetry;
pub mod thread;

pub use arch::HostIsa;
pub use config::EngineConfig;
pub use state::{CpuState, CpuStateFrame, Reg, SignalEvent};
pub use thread::{Engine, ThreadState};
