//! JIT backend
//!
//! Translates one IR block into host machine code in the current code
//! buffer. There is one backend per host ISA behind the `JitBackend` sum
//! type; both share the handler-table structure: a fixed-size array of
//! function pointers indexed by opcode, populated at construction.

pub mod aarch64;
pub mod linker;
pub mod riscv;

use crate::arch::HostIsa;
use crate::codebuf::CodeBuffer;
use crate::ir::IrBlock;
use crate::ra::RegAllocData;

/// Per-compile inputs beyond the IR itself
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Guest RIP of the block
    pub entry: u64,
    /// Address of the generated exit-linker thunk; seeded into every link
    /// record so unlinked exits resolve through the linker
    pub exit_linker_address: u64,
    /// Emit the single-step pause check in the prologue
    pub single_step_check: bool,
    /// Static register allocation is active
    pub sra: bool,
    /// Use one-sided barriers instead of acquire/release accesses for TSO
    pub half_barrier_tso: bool,
}

/// A linkable exit emitted at the end of a block
#[derive(Debug, Clone, Copy)]
pub struct ExitSite {
    /// Address of the patchable call site
    pub site: u64,
    /// Address of the 16-byte link record that follows it
    pub record: u64,
    /// Guest RIP the exit wants to reach
    pub guest_target: u64,
}

/// Result of compiling one block
#[derive(Debug)]
pub struct CompiledBlock {
    pub host_entry: u64,
    pub host_code_size: u64,
    /// Linkable exits, for diagnostics and tests; the runtime linking flow
    /// discovers records through the link register instead
    pub exit_sites: Vec<ExitSite>,
    /// `(host_start, byte_len)` per IR basic block, for diagnostics
    pub subblocks: Vec<(u64, u32)>,
}

/// Bytes of code-buffer headroom demanded per SSA node before compiling
pub const BUFFER_BYTES_PER_SSA: usize = 16;

/// Conservative buffer demand of one block, used for the cache-clear check.
pub fn buffer_demand(ir: &IrBlock) -> usize {
    // Prologue + per-node worst case + exit sequence slack
    1024 + ir.ssa_count as usize * BUFFER_BYTES_PER_SSA
}

/// Host-ISA-selected backend
pub enum JitBackend {
    Aarch64(aarch64::A64Backend),
    Riscv64(riscv::Rv64Backend),
}

impl JitBackend {
    pub fn new(isa: HostIsa) -> Self {
        match isa {
            HostIsa::Aarch64 => JitBackend::Aarch64(aarch64::A64Backend::new()),
            HostIsa::Riscv64 => JitBackend::Riscv64(riscv::Rv64Backend::new()),
        }
    }

    pub fn isa(&self) -> HostIsa {
        match self {
            JitBackend::Aarch64(_) => HostIsa::Aarch64,
            JitBackend::Riscv64(_) => HostIsa::Riscv64,
        }
    }

    /// Compile one IR block into `buf` and return its host entry.
    pub fn compile_block(
        &self,
        buf: &mut CodeBuffer,
        ir: &IrBlock,
        ra: &RegAllocData,
        opts: &CompileOptions,
    ) -> CompiledBlock {
        match self {
            JitBackend::Aarch64(backend) => backend.compile_block(buf, ir, ra, opts),
            JitBackend::Riscv64(backend) => backend.compile_block(buf, ir, ra, opts),
        }
    }
}
