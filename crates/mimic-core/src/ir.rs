//! IR blocks consumed from the front-end
//!
//! The decoder/optimizer/register-allocator pipeline lives outside the core;
//! this module defines the block shape the JIT backend compiles. Values are
//! SSA nodes produced by at most one instruction; basic blocks carry explicit
//! branch terminators. `InlineConstant` and `InlineEntrypointOffset` are
//! no-op carrier nodes: they emit nothing themselves and backends fold their
//! payloads into consuming instructions.

use rustc_hash::FxHashMap;

/// SSA value produced by an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Node(pub u32);

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ssa{}", self.0)
    }
}

/// Basic block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// Memory access widths in bytes
pub type OpSize = u8;

/// Fence scopes for the `Fence` instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    Loads,
    Stores,
    LoadsStores,
}

/// Calling convention of a helper implementing an opcode the backend does
/// not lower inline. 80-bit floats are packed as (low 64 bits, high 16 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackAbi {
    Unknown,
    VoidU16,
    F80F32,
    F80F64,
    F80I16,
    F80I32,
    F32F80,
    F64F80,
    F64F64,
    F64F64F64,
    I16F80,
    I32F80,
    I64F80,
    I64F80F80,
    F80F80,
    F80F80F80,
}

/// Index of a helper in `PointerTable::fallback_handlers`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum FallbackIndex {
    LoadFcw = 0,
    F80CvtFromF32 = 1,
    F80CvtFromF64 = 2,
    F80CvtFromI16 = 3,
    F80CvtFromI32 = 4,
    F80CvtToF32 = 5,
    F80CvtToF64 = 6,
    F80CvtToI16 = 7,
    F80CvtToI32 = 8,
    F80CvtToI64 = 9,
    F80Cmp = 10,
    F80Add = 11,
    F80Sub = 12,
    F80Mul = 13,
    F80Div = 14,
    F80Round = 15,
    F80Sqrt = 16,
    F64Sin = 17,
    F64Cos = 18,
    F64Atan = 19,
}

/// Fallback descriptor resolved for an unhandled opcode
#[derive(Debug, Clone, Copy)]
pub struct FallbackInfo {
    pub abi: FallbackAbi,
    pub index: FallbackIndex,
}

/// One IR instruction
#[derive(Debug, Clone)]
pub enum IrInst {
    // ===== Constants and carriers =====
    Constant { dest: Node, value: u64 },
    /// No-op carrier: consumers fold the payload into their encoding
    InlineConstant { dest: Node, value: u64 },
    EntrypointOffset { dest: Node, offset: i64, size: OpSize },
    /// No-op carrier form of `EntrypointOffset`
    InlineEntrypointOffset { dest: Node, offset: i64, size: OpSize },

    // ===== ALU =====
    Add { dest: Node, size: OpSize, a: Node, b: Node },
    Sub { dest: Node, size: OpSize, a: Node, b: Node },
    Neg { dest: Node, size: OpSize, a: Node },
    Mul { dest: Node, size: OpSize, a: Node, b: Node },
    UMulH { dest: Node, a: Node, b: Node },
    Div { dest: Node, size: OpSize, a: Node, b: Node },
    UDiv { dest: Node, size: OpSize, a: Node, b: Node },
    Rem { dest: Node, size: OpSize, a: Node, b: Node },
    URem { dest: Node, size: OpSize, a: Node, b: Node },
    And { dest: Node, a: Node, b: Node },
    Or { dest: Node, a: Node, b: Node },
    Xor { dest: Node, a: Node, b: Node },
    Not { dest: Node, a: Node },
    Lshl { dest: Node, size: OpSize, a: Node, shift: Node },
    Lshr { dest: Node, size: OpSize, a: Node, shift: Node },
    Ashr { dest: Node, size: OpSize, a: Node, shift: Node },
    Select { dest: Node, cond: Cond, a: Node, b: Node, true_val: Node, false_val: Node },

    // ===== 128/64 long division (helper calls) =====
    LDiv { dest: Node, high: Node, low: Node, divisor: Node },
    LUDiv { dest: Node, high: Node, low: Node, divisor: Node },
    LRem { dest: Node, high: Node, low: Node, divisor: Node },
    LURem { dest: Node, high: Node, low: Node, divisor: Node },

    // ===== Context / register file =====
    LoadRegister { dest: Node, reg: u8 },
    StoreRegister { value: Node, reg: u8 },
    LoadContext { dest: Node, offset: i32, size: OpSize },
    StoreContext { value: Node, offset: i32, size: OpSize },
    LoadFlag { dest: Node, flag: u8 },
    StoreFlag { value: Node, flag: u8 },

    // ===== Guest memory =====
    LoadMem { dest: Node, addr: Node, size: OpSize, tso: bool },
    StoreMem { value: Node, addr: Node, size: OpSize, tso: bool },

    // ===== Atomics =====
    Cas { dest: Node, expected: Node, desired: Node, addr: Node, size: OpSize },
    AtomicFetchAdd { dest: Node, addr: Node, value: Node, size: OpSize },
    AtomicSwap { dest: Node, addr: Node, value: Node, size: OpSize },

    // ===== Vector =====
    VectorZero { dest: Node },
    VMov { dest: Node, src: Node },
    VAdd { dest: Node, elem_size: OpSize, a: Node, b: Node },
    VXor { dest: Node, a: Node, b: Node },

    // ===== x87 / f80 (no inline lowering; fallback ABI) =====
    LoadFcw { value: Node },
    F80CvtFromF32 { dest: Node, src: Node },
    F80CvtFromF64 { dest: Node, src: Node },
    F80CvtToF64 { dest: Node, src: Node },
    F80CvtToI64 { dest: Node, src: Node },
    F80Cmp { dest: Node, a: Node, b: Node },
    F80Add { dest: Node, a: Node, b: Node },
    F80Mul { dest: Node, a: Node, b: Node },

    // ===== Control flow (terminators) =====
    Jump { target: BlockId },
    CondJump { value: Node, target_true: BlockId, target_false: BlockId },
    /// Leave the translated block with a new guest RIP. A carrier operand
    /// makes this a linkable exit; anything else goes back through the
    /// dispatcher loop.
    ExitFunction { new_rip: Node },

    // ===== Services =====
    /// Invoke the syscall layer; results land in the guest state frame
    Syscall,
    /// Invoke CPUID emulation; eax..edx land in the guest state frame
    Cpuid { leaf: Node, subleaf: Node },
    Fence { kind: FenceKind },
    /// Return from a guest signal handler into the host sigreturn sequence
    SignalReturn,
    /// Raise a guest fault (SIGILL-class) at the current entry
    Break,
}

/// Condition codes for `Select`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    ULt,
    ULe,
    SLt,
    SLe,
}

/// Dense opcode indices; backends dispatch through a fixed-size table of
/// function pointers indexed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Op {
    Constant,
    InlineConstant,
    EntrypointOffset,
    InlineEntrypointOffset,
    Add,
    Sub,
    Neg,
    Mul,
    UMulH,
    Div,
    UDiv,
    Rem,
    URem,
    And,
    Or,
    Xor,
    Not,
    Lshl,
    Lshr,
    Ashr,
    Select,
    LDiv,
    LUDiv,
    LRem,
    LURem,
    LoadRegister,
    StoreRegister,
    LoadContext,
    StoreContext,
    LoadFlag,
    StoreFlag,
    LoadMem,
    StoreMem,
    Cas,
    AtomicFetchAdd,
    AtomicSwap,
    VectorZero,
    VMov,
    VAdd,
    VXor,
    LoadFcw,
    F80CvtFromF32,
    F80CvtFromF64,
    F80CvtToF64,
    F80CvtToI64,
    F80Cmp,
    F80Add,
    F80Mul,
    Jump,
    CondJump,
    ExitFunction,
    Syscall,
    Cpuid,
    Fence,
    SignalReturn,
    Break,
    Count,
}

/// Number of opcodes (table size for backend handler arrays)
pub const OP_COUNT: usize = Op::Count as usize;

impl IrInst {
    /// Short opcode name for diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            IrInst::Constant { .. } => "constant",
            IrInst::InlineConstant { .. } => "inline_constant",
            IrInst::EntrypointOffset { .. } => "entrypoint_offset",
            IrInst::InlineEntrypointOffset { .. } => "inline_entrypoint_offset",
            IrInst::Add { .. } => "add",
            IrInst::Sub { .. } => "sub",
            IrInst::Neg { .. } => "neg",
            IrInst::Mul { .. } => "mul",
            IrInst::UMulH { .. } => "umulh",
            IrInst::Div { .. } => "div",
            IrInst::UDiv { .. } => "udiv",
            IrInst::Rem { .. } => "rem",
            IrInst::URem { .. } => "urem",
            IrInst::And { .. } => "and",
            IrInst::Or { .. } => "or",
            IrInst::Xor { .. } => "xor",
            IrInst::Not { .. } => "not",
            IrInst::Lshl { .. } => "lshl",
            IrInst::Lshr { .. } => "lshr",
            IrInst::Ashr { .. } => "ashr",
            IrInst::Select { .. } => "select",
            IrInst::LDiv { .. } => "ldiv",
            IrInst::LUDiv { .. } => "ludiv",
            IrInst::LRem { .. } => "lrem",
            IrInst::LURem { .. } => "lurem",
            IrInst::LoadRegister { .. } => "load_register",
            IrInst::StoreRegister { .. } => "store_register",
            IrInst::LoadContext { .. } => "load_context",
            IrInst::StoreContext { .. } => "store_context",
            IrInst::LoadFlag { .. } => "load_flag",
            IrInst::StoreFlag { .. } => "store_flag",
            IrInst::LoadMem { .. } => "load_mem",
            IrInst::StoreMem { .. } => "store_mem",
            IrInst::Cas { .. } => "cas",
            IrInst::AtomicFetchAdd { .. } => "atomic_fetch_add",
            IrInst::AtomicSwap { .. } => "atomic_swap",
            IrInst::VectorZero { .. } => "vector_zero",
            IrInst::VMov { .. } => "vmov",
            IrInst::VAdd { .. } => "vadd",
            IrInst::VXor { .. } => "vxor",
            IrInst::LoadFcw { .. } => "load_fcw",
            IrInst::F80CvtFromF32 { .. } => "f80_cvt_from_f32",
            IrInst::F80CvtFromF64 { .. } => "f80_cvt_from_f64",
            IrInst::F80CvtToF64 { .. } => "f80_cvt_to_f64",
            IrInst::F80CvtToI64 { .. } => "f80_cvt_to_i64",
            IrInst::F80Cmp { .. } => "f80_cmp",
            IrInst::F80Add { .. } => "f80_add",
            IrInst::F80Mul { .. } => "f80_mul",
            IrInst::Jump { .. } => "jump",
            IrInst::CondJump { .. } => "cond_jump",
            IrInst::ExitFunction { .. } => "exit_function",
            IrInst::Syscall => "syscall",
            IrInst::Cpuid { .. } => "cpuid",
            IrInst::Fence { .. } => "fence",
            IrInst::SignalReturn => "signal_return",
            IrInst::Break => "break",
        }
    }

    /// Opcode index for the backend handler tables
    pub fn op(&self) -> Op {
        match self {
            IrInst::Constant { .. } => Op::Constant,
            IrInst::InlineConstant { .. } => Op::InlineConstant,
            IrInst::EntrypointOffset { .. } => Op::EntrypointOffset,
            IrInst::InlineEntrypointOffset { .. } => Op::InlineEntrypointOffset,
            IrInst::Add { .. } => Op::Add,
            IrInst::Sub { .. } => Op::Sub,
            IrInst::Neg { .. } => Op::Neg,
            IrInst::Mul { .. } => Op::Mul,
            IrInst::UMulH { .. } => Op::UMulH,
            IrInst::Div { .. } => Op::Div,
            IrInst::UDiv { .. } => Op::UDiv,
            IrInst::Rem { .. } => Op::Rem,
            IrInst::URem { .. } => Op::URem,
            IrInst::And { .. } => Op::And,
            IrInst::Or { .. } => Op::Or,
            IrInst::Xor { .. } => Op::Xor,
            IrInst::Not { .. } => Op::Not,
            IrInst::Lshl { .. } => Op::Lshl,
            IrInst::Lshr { .. } => Op::Lshr,
            IrInst::Ashr { .. } => Op::Ashr,
            IrInst::Select { .. } => Op::Select,
            IrInst::LDiv { .. } => Op::LDiv,
            IrInst::LUDiv { .. } => Op::LUDiv,
            IrInst::LRem { .. } => Op::LRem,
            IrInst::LURem { .. } => Op::LURem,
            IrInst::LoadRegister { .. } => Op::LoadRegister,
            IrInst::StoreRegister { .. } => Op::StoreRegister,
            IrInst::LoadContext { .. } => Op::LoadContext,
            IrInst::StoreContext { .. } => Op::StoreContext,
            IrInst::LoadFlag { .. } => Op::LoadFlag,
            IrInst::StoreFlag { .. } => Op::StoreFlag,
            IrInst::LoadMem { .. } => Op::LoadMem,
            IrInst::StoreMem { .. } => Op::StoreMem,
            IrInst::Cas { .. } => Op::Cas,
            IrInst::AtomicFetchAdd { .. } => Op::AtomicFetchAdd,
            IrInst::AtomicSwap { .. } => Op::AtomicSwap,
            IrInst::VectorZero { .. } => Op::VectorZero,
            IrInst::VMov { .. } => Op::VMov,
            IrInst::VAdd { .. } => Op::VAdd,
            IrInst::VXor { .. } => Op::VXor,
            IrInst::LoadFcw { .. } => Op::LoadFcw,
            IrInst::F80CvtFromF32 { .. } => Op::F80CvtFromF32,
            IrInst::F80CvtFromF64 { .. } => Op::F80CvtFromF64,
            IrInst::F80CvtToF64 { .. } => Op::F80CvtToF64,
            IrInst::F80CvtToI64 { .. } => Op::F80CvtToI64,
            IrInst::F80Cmp { .. } => Op::F80Cmp,
            IrInst::F80Add { .. } => Op::F80Add,
            IrInst::F80Mul { .. } => Op::F80Mul,
            IrInst::Jump { .. } => Op::Jump,
            IrInst::CondJump { .. } => Op::CondJump,
            IrInst::ExitFunction { .. } => Op::ExitFunction,
            IrInst::Syscall => Op::Syscall,
            IrInst::Cpuid { .. } => Op::Cpuid,
            IrInst::Fence { .. } => Op::Fence,
            IrInst::SignalReturn => Op::SignalReturn,
            IrInst::Break => Op::Break,
        }
    }

    /// Fallback descriptor for ops without an inline lowering.
    pub fn fallback_info(&self) -> Option<FallbackInfo> {
        let (abi, index) = match self {
            IrInst::LoadFcw { .. } => (FallbackAbi::VoidU16, FallbackIndex::LoadFcw),
            IrInst::F80CvtFromF32 { .. } => (FallbackAbi::F80F32, FallbackIndex::F80CvtFromF32),
            IrInst::F80CvtFromF64 { .. } => (FallbackAbi::F80F64, FallbackIndex::F80CvtFromF64),
            IrInst::F80CvtToF64 { .. } => (FallbackAbi::F64F80, FallbackIndex::F80CvtToF64),
            IrInst::F80CvtToI64 { .. } => (FallbackAbi::I64F80, FallbackIndex::F80CvtToI64),
            IrInst::F80Cmp { .. } => (FallbackAbi::I64F80F80, FallbackIndex::F80Cmp),
            IrInst::F80Add { .. } => (FallbackAbi::F80F80F80, FallbackIndex::F80Add),
            IrInst::F80Mul { .. } => (FallbackAbi::F80F80F80, FallbackIndex::F80Mul),
            _ => return None,
        };
        Some(FallbackInfo { abi, index })
    }
}

/// Inline payload carried by the no-op carrier nodes
#[derive(Debug, Clone, Copy)]
pub enum InlinePayload {
    Constant(u64),
    EntrypointOffset { offset: i64, size: OpSize },
}

/// One basic block of IR
#[derive(Debug, Clone)]
pub struct IrBasicBlock {
    pub id: BlockId,
    pub insts: Vec<IrInst>,
}

/// One translated unit: the IR form of a single guest basic block (possibly
/// split into multiple host-side basic blocks by the front-end).
#[derive(Debug, Clone)]
pub struct IrBlock {
    /// Guest RIP this block was decoded from
    pub entry: u64,
    pub blocks: Vec<IrBasicBlock>,
    /// Number of SSA values allocated; sizes backend buffers
    pub ssa_count: u32,
    inline_payloads: FxHashMap<Node, InlinePayload>,
}

impl IrBlock {
    pub fn inline_payload(&self, node: Node) -> Option<InlinePayload> {
        self.inline_payloads.get(&node).copied()
    }
}

/// Builder used by front-ends (and tests) to assemble an `IrBlock`
pub struct IrBlockBuilder {
    entry: u64,
    blocks: Vec<IrBasicBlock>,
    next_node: u32,
    next_block: u32,
    inline_payloads: FxHashMap<Node, InlinePayload>,
}

impl IrBlockBuilder {
    pub fn new(entry: u64) -> Self {
        IrBlockBuilder {
            entry,
            blocks: Vec::new(),
            next_node: 0,
            next_block: 0,
            inline_payloads: FxHashMap::default(),
        }
    }

    /// Open a new basic block; subsequent `push` calls append to it.
    pub fn begin_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        self.blocks.push(IrBasicBlock { id, insts: Vec::new() });
        id
    }

    pub fn alloc_node(&mut self) -> Node {
        let node = Node(self.next_node);
        self.next_node += 1;
        node
    }

    pub fn push(&mut self, inst: IrInst) {
        match &inst {
            IrInst::InlineConstant { dest, value } => {
                self.inline_payloads.insert(*dest, InlinePayload::Constant(*value));
            }
            IrInst::InlineEntrypointOffset { dest, offset, size } => {
                self.inline_payloads.insert(
                    *dest,
                    InlinePayload::EntrypointOffset { offset: *offset, size: *size },
                );
            }
            _ => {}
        }
        self.blocks
            .last_mut()
            .expect("push before begin_block")
            .insts
            .push(inst);
    }

    /// Convenience: emit an inline-constant carrier and return its node.
    pub fn inline_constant(&mut self, value: u64) -> Node {
        let dest = self.alloc_node();
        self.push(IrInst::InlineConstant { dest, value });
        dest
    }

    pub fn finish(self) -> IrBlock {
        IrBlock {
            entry: self.entry,
            blocks: self.blocks,
            ssa_count: self.next_node,
            inline_payloads: self.inline_payloads,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_assigns_ids() {
        let mut b = IrBlockBuilder::new(0x40_0000);
        let bb = b.begin_block();
        assert_eq!(bb, BlockId(0));
        let n0 = b.alloc_node();
        let n1 = b.alloc_node();
        assert_ne!(n0, n1);
        b.push(IrInst::Constant { dest: n0, value: 3 });
        b.push(IrInst::StoreRegister { value: n0, reg: 0 });
        let block = b.finish();
        assert_eq!(block.entry, 0x40_0000);
        assert_eq!(block.blocks.len(), 1);
        assert_eq!(block.ssa_count, 2);
    }

    #[test]
    fn test_inline_payload_tracking() {
        let mut b = IrBlockBuilder::new(0);
        b.begin_block();
        let c = b.inline_constant(0xdead);
        let plain = b.alloc_node();
        b.push(IrInst::Constant { dest: plain, value: 1 });
        let block = b.finish();
        assert!(matches!(
            block.inline_payload(c),
            Some(InlinePayload::Constant(0xdead))
        ));
        assert!(block.inline_payload(plain).is_none());
    }

    #[test]
    fn test_fallback_info() {
        let info = IrInst::F80Add {
            dest: Node(0),
            a: Node(1),
            b: Node(2),
        }
        .fallback_info()
        .unwrap();
        assert_eq!(info.abi, FallbackAbi::F80F80F80);
        assert_eq!(info.index, FallbackIndex::F80Add);

        assert!(IrInst::Break.fallback_info().is_none());
    }
}
