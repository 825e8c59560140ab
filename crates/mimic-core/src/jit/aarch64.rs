//! AArch64 opcode lowering
//!
//! One handler per IR opcode, dispatched through a fixed table built at
//! construction. Opcodes without a handler fall into `op_unhandled`, which
//! marshals a fallback-ABI helper call when the op declares one and
//! otherwise aborts in debug builds (zero-emit in release).

use crate::arch::aarch64::{
    emit_fill_static_regs, emit_push_dynamic_regs_lr, emit_pop_dynamic_regs_lr,
    emit_spill_static_regs, A64Emitter, Barrier, Cond as ACond, Label, VReg, XReg, RA_FPR, RA_GPR,
    SP, SRA_FPR, SRA_GPR, STATE, V0, V1, X0, X1, X2, X3, X4, XZR,
};
use crate::codebuf::{flush_icache, CodeBuffer};
use crate::ir::{
    Cond, FallbackAbi, FenceKind, InlinePayload, IrBlock, IrInst, Node, Op, OP_COUNT,
};
use crate::ra::{RegAllocData, RegClass};
use crate::state::{
    flag_offset, greg_offset, pointers_offset, rip_offset, running_mode_offset, PointerTable, Reg,
};
use crate::jit::{CompileOptions, CompiledBlock, ExitSite};
use rustc_hash::FxHashMap;
use std::mem::offset_of;

/// Per-compile state shared by every handler
struct Ctx<'a, 'b> {
    e: A64Emitter<'a>,
    ir: &'b IrBlock,
    ra: &'b RegAllocData,
    opts: &'b CompileOptions,
    jump_targets: FxHashMap<u32, Label>,
    pending_target: Option<Label>,
    exit_sites: Vec<ExitSite>,
}

impl Ctx<'_, '_> {
    /// Host GPR holding `node`: fixed SRA register or allocated register
    fn reg(&self, node: Node) -> XReg {
        let phys = self.ra.node_register(node);
        match phys.class {
            RegClass::GprFixed => SRA_GPR[phys.index as usize],
            RegClass::Gpr => RA_GPR[phys.index as usize],
            _ => panic!("node {node} is not in a GPR class"),
        }
    }

    /// Host vector register holding `node`
    fn vreg(&self, node: Node) -> VReg {
        let phys = self.ra.node_register(node);
        match phys.class {
            RegClass::FprFixed => SRA_FPR[phys.index as usize],
            RegClass::Fpr => RA_FPR[phys.index as usize],
            _ => panic!("node {node} is not in an FPR class"),
        }
    }

    fn is_fpr(&self, node: Node) -> bool {
        matches!(
            self.ra.node_register(node).class,
            RegClass::Fpr | RegClass::FprFixed
        )
    }

    /// Payload of a no-op carrier node, resolved against the block entry
    fn inline_value(&self, node: Node) -> Option<u64> {
        match self.ir.inline_payload(node)? {
            InlinePayload::Constant(value) => Some(value),
            InlinePayload::EntrypointOffset { offset, size } => {
                let mask = if size == 4 { 0xFFFF_FFFF } else { u64::MAX };
                Some(self.opts.entry.wrapping_add(offset as u64) & mask)
            }
        }
    }

    fn target_label(&mut self, block: u32) -> Label {
        if let Some(&label) = self.jump_targets.get(&block) {
            return label;
        }
        let label = self.e.new_label();
        self.jump_targets.insert(block, label);
        label
    }

    /// Zero-extend a 32-wide result in place
    fn truncate32(&mut self, reg: XReg) {
        self.e.mov32(reg, reg);
    }

    fn load_helper(&mut self, scratch: XReg, field_offset: usize) {
        self.e.ldr(8, scratch, STATE, pointers_offset(field_offset) as u32);
    }

    fn load_fallback_helper(&mut self, scratch: XReg, index: usize) {
        let off = pointers_offset(offset_of!(PointerTable, fallback_handlers)) as u32
            + (index as u32) * 8;
        self.e.ldr(8, scratch, STATE, off);
    }
}

type Handler = for<'a, 'b, 'c> fn(&'c mut Ctx<'a, 'b>, &'b IrInst);

/// AArch64 JIT backend
pub struct A64Backend {
    handlers: [Handler; OP_COUNT],
}

impl Default for A64Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl A64Backend {
    pub fn new() -> Self {
        let mut handlers: [Handler; OP_COUNT] = [op_unhandled; OP_COUNT];
        register_alu_handlers(&mut handlers);
        register_memory_handlers(&mut handlers);
        register_atomic_handlers(&mut handlers);
        register_branch_handlers(&mut handlers);
        register_vector_handlers(&mut handlers);
        register_misc_handlers(&mut handlers);
        A64Backend { handlers }
    }

    /// Compile one IR block at the buffer cursor and return its host entry.
    ///
    /// The caller has already ensured the buffer has room (`buffer_demand`)
    /// and registers the result with the lookup cache.
    pub fn compile_block(
        &self,
        buf: &mut CodeBuffer,
        ir: &IrBlock,
        ra: &RegAllocData,
        opts: &CompileOptions,
    ) -> CompiledBlock {
        let host_entry = buf.cursor_address();
        let mut ctx = Ctx {
            e: A64Emitter::new(buf),
            ir,
            ra,
            opts,
            jump_targets: FxHashMap::default(),
            pending_target: None,
            exit_sites: Vec::new(),
        };

        if opts.single_step_check {
            emit_pause_check(&mut ctx.e, opts.entry);
        }

        let spill_slots = ra.spill_slots();
        if spill_slots > 0 {
            let bytes = spill_slots * 16;
            if bytes < 4096 {
                ctx.e.sub_imm(SP, SP, bytes);
            } else {
                ctx.e.load_constant(X0, bytes as u64);
                ctx.e.sub_ext(SP, SP, X0);
            }
        }

        let mut subblocks = Vec::new();
        for bb in &ir.blocks {
            let block_start = ctx.e.cursor();
            let label = ctx.target_label(bb.id.0);

            // A pending branch to anything but the fall-through block must
            // be emitted now.
            if let Some(pending) = ctx.pending_target.take() {
                if pending != label {
                    ctx.e.b_label(pending);
                }
            }
            ctx.e.bind(label);

            for inst in &bb.insts {
                let handler = self.handlers[inst.op() as usize];
                handler(&mut ctx, inst);
            }

            subblocks.push((block_start, (ctx.e.cursor() - block_start) as u32));
        }

        // The last branch cannot be a fall-through; emit it.
        if let Some(pending) = ctx.pending_target.take() {
            ctx.e.b_label(pending);
        }

        let exit_sites = std::mem::take(&mut ctx.exit_sites);
        let end = buf.cursor_address();
        flush_icache(host_entry, (end - host_entry) as usize);

        CompiledBlock {
            host_entry,
            host_code_size: end - host_entry,
            exit_sites,
            subblocks,
        }
    }
}

/// Single-step pause check: when the running mode is non-zero, synchronize
/// guest RIP and tail into the pause handler.
fn emit_pause_check(e: &mut A64Emitter, entry: u64) {
    let run_block = e.new_label();
    e.ldr(4, X0, STATE, running_mode_offset() as u32);
    e.cbz32_label(X0, run_block);
    {
        e.load_constant(X0, entry);
        e.str(8, X0, STATE, rip_offset() as u32);
        e.ldr(
            8,
            X0,
            STATE,
            pointers_offset(offset_of!(PointerTable, thread_pause_handler_spill_sra)) as u32,
        );
        e.br(X0);
    }
    e.bind(run_block);
}

/// Emit the single-step pause check as a standalone fragment; returns the
/// bytes written.
pub fn generate_gdb_pause_check(buf: &mut CodeBuffer, entry: u64) -> usize {
    let start = buf.cursor_address();
    {
        let mut e = A64Emitter::new(buf);
        emit_pause_check(&mut e, entry);
    }
    let used = (buf.cursor_address() - start) as usize;
    flush_icache(start, used);
    used
}

// ===== Handler registration =====

fn register_alu_handlers(h: &mut [Handler; OP_COUNT]) {
    h[Op::Constant as usize] = op_constant;
    h[Op::InlineConstant as usize] = op_noop;
    h[Op::EntrypointOffset as usize] = op_entrypoint_offset;
    h[Op::InlineEntrypointOffset as usize] = op_noop;
    h[Op::Add as usize] = op_add;
    h[Op::Sub as usize] = op_sub;
    h[Op::Neg as usize] = op_neg;
    h[Op::Mul as usize] = op_mul;
    h[Op::UMulH as usize] = op_umulh;
    h[Op::Div as usize] = op_div;
    h[Op::UDiv as usize] = op_udiv;
    h[Op::Rem as usize] = op_rem;
    h[Op::URem as usize] = op_urem;
    h[Op::And as usize] = op_and;
    h[Op::Or as usize] = op_or;
    h[Op::Xor as usize] = op_xor;
    h[Op::Not as usize] = op_not;
    h[Op::Lshl as usize] = op_lshl;
    h[Op::Lshr as usize] = op_lshr;
    h[Op::Ashr as usize] = op_ashr;
    h[Op::Select as usize] = op_select;
    h[Op::LDiv as usize] = op_long_divide;
    h[Op::LUDiv as usize] = op_long_divide;
    h[Op::LRem as usize] = op_long_divide;
    h[Op::LURem as usize] = op_long_divide;
}

fn register_memory_handlers(h: &mut [Handler; OP_COUNT]) {
    h[Op::LoadRegister as usize] = op_load_register;
    h[Op::StoreRegister as usize] = op_store_register;
    h[Op::LoadContext as usize] = op_load_context;
    h[Op::StoreContext as usize] = op_store_context;
    h[Op::LoadFlag as usize] = op_load_flag;
    h[Op::StoreFlag as usize] = op_store_flag;
    h[Op::LoadMem as usize] = op_load_mem;
    h[Op::StoreMem as usize] = op_store_mem;
}

fn register_atomic_handlers(h: &mut [Handler; OP_COUNT]) {
    h[Op::Cas as usize] = op_cas;
    h[Op::AtomicFetchAdd as usize] = op_atomic_fetch_add;
    h[Op::AtomicSwap as usize] = op_atomic_swap;
}

fn register_branch_handlers(h: &mut [Handler; OP_COUNT]) {
    h[Op::Jump as usize] = op_jump;
    h[Op::CondJump as usize] = op_cond_jump;
    h[Op::ExitFunction as usize] = op_exit_function;
    h[Op::Syscall as usize] = op_syscall;
    h[Op::Cpuid as usize] = op_cpuid;
    h[Op::SignalReturn as usize] = op_signal_return;
    h[Op::Break as usize] = op_break;
}

fn register_vector_handlers(h: &mut [Handler; OP_COUNT]) {
    h[Op::VectorZero as usize] = op_vector_zero;
    h[Op::VMov as usize] = op_vmov;
    h[Op::VAdd as usize] = op_vadd;
    h[Op::VXor as usize] = op_vxor;
}

fn register_misc_handlers(h: &mut [Handler; OP_COUNT]) {
    h[Op::Fence as usize] = op_fence;
}

// ===== ALU =====

fn op_noop(_ctx: &mut Ctx, _inst: &IrInst) {}

fn op_constant(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Constant { dest, value } = inst else { unreachable!() };
    let rd = ctx.reg(*dest);
    ctx.e.load_constant(rd, *value);
}

fn op_entrypoint_offset(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::EntrypointOffset { dest, offset, size } = inst else { unreachable!() };
    let mask = if *size == 4 { 0xFFFF_FFFF } else { u64::MAX };
    let value = ctx.opts.entry.wrapping_add(*offset as u64) & mask;
    let rd = ctx.reg(*dest);
    ctx.e.load_constant(rd, value);
}

fn op_add(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Add { dest, size, a, b } = inst else { unreachable!() };
    let rd = ctx.reg(*dest);
    let ra = ctx.reg(*a);
    match ctx.inline_value(*b) {
        Some(v) if v < 4096 => {
            ctx.e.add_imm(rd, ra, v as u32);
            if *size == 4 {
                ctx.truncate32(rd);
            }
        }
        _ => {
            let rb = ctx.reg(*b);
            if *size == 4 {
                ctx.e.add32(rd, ra, rb);
            } else {
                ctx.e.add(rd, ra, rb);
            }
        }
    }
}

fn op_sub(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Sub { dest, size, a, b } = inst else { unreachable!() };
    let rd = ctx.reg(*dest);
    let ra = ctx.reg(*a);
    match ctx.inline_value(*b) {
        Some(v) if v < 4096 => {
            ctx.e.sub_imm(rd, ra, v as u32);
            if *size == 4 {
                ctx.truncate32(rd);
            }
        }
        _ => {
            let rb = ctx.reg(*b);
            if *size == 4 {
                ctx.e.sub32(rd, ra, rb);
            } else {
                ctx.e.sub(rd, ra, rb);
            }
        }
    }
}

fn op_neg(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Neg { dest, size, a } = inst else { unreachable!() };
    let rd = ctx.reg(*dest);
    let ra = ctx.reg(*a);
    if *size == 4 {
        ctx.e.sub32(rd, XZR, ra);
    } else {
        ctx.e.neg(rd, ra);
    }
}

fn op_mul(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Mul { dest, size, a, b } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    ctx.e.mul(rd, ra, rb);
    if *size == 4 {
        ctx.truncate32(rd);
    }
}

fn op_umulh(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::UMulH { dest, a, b } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    ctx.e.umulh(rd, ra, rb);
}

fn op_div(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Div { dest, size, a, b } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    ctx.e.sdiv(rd, ra, rb);
    if *size == 4 {
        ctx.truncate32(rd);
    }
}

fn op_udiv(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::UDiv { dest, size, a, b } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    ctx.e.udiv(rd, ra, rb);
    if *size == 4 {
        ctx.truncate32(rd);
    }
}

fn op_rem(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Rem { dest, size, a, b } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    ctx.e.sdiv(X0, ra, rb);
    ctx.e.msub(rd, X0, rb, ra);
    if *size == 4 {
        ctx.truncate32(rd);
    }
}

fn op_urem(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::URem { dest, size, a, b } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    ctx.e.udiv(X0, ra, rb);
    ctx.e.msub(rd, X0, rb, ra);
    if *size == 4 {
        ctx.truncate32(rd);
    }
}

fn op_and(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::And { dest, a, b } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    ctx.e.and(rd, ra, rb);
}

fn op_or(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Or { dest, a, b } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    ctx.e.orr(rd, ra, rb);
}

fn op_xor(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Xor { dest, a, b } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    ctx.e.eor(rd, ra, rb);
}

fn op_not(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Not { dest, a } = inst else { unreachable!() };
    let (rd, ra) = (ctx.reg(*dest), ctx.reg(*a));
    ctx.e.mvn(rd, ra);
}

fn op_lshl(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Lshl { dest, size, a, shift } = inst else { unreachable!() };
    let (rd, ra, rs) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*shift));
    ctx.e.lslv(rd, ra, rs);
    if *size == 4 {
        ctx.truncate32(rd);
    }
}

fn op_lshr(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Lshr { dest, size, a, shift } = inst else { unreachable!() };
    let (rd, ra, rs) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*shift));
    ctx.e.lsrv(rd, ra, rs);
    if *size == 4 {
        ctx.truncate32(rd);
    }
}

fn op_ashr(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Ashr { dest, size, a, shift } = inst else { unreachable!() };
    let (rd, ra, rs) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*shift));
    ctx.e.asrv(rd, ra, rs);
    if *size == 4 {
        ctx.truncate32(rd);
    }
}

fn cond_code(cond: Cond) -> ACond {
    match cond {
        Cond::Eq => ACond::Eq,
        Cond::Ne => ACond::Ne,
        Cond::ULt => ACond::Cc,
        Cond::ULe => ACond::Ls,
        Cond::SLt => ACond::Lt,
        Cond::SLe => ACond::Le,
    }
}

fn op_select(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Select { dest, cond, a, b, true_val, false_val } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    let (rt, rf) = (ctx.reg(*true_val), ctx.reg(*false_val));
    ctx.e.cmp(ra, rb);
    ctx.e.csel(rd, rt, rf, cond_code(*cond));
}

/// 128/64 divide and remainder go through generated helper thunks that
/// preserve the full register convention around the Rust implementation.
fn op_long_divide(ctx: &mut Ctx, inst: &IrInst) {
    let (dest, high, low, divisor, field) = match inst {
        IrInst::LDiv { dest, high, low, divisor } => {
            (dest, high, low, divisor, offset_of!(PointerTable, ldiv_handler))
        }
        IrInst::LUDiv { dest, high, low, divisor } => {
            (dest, high, low, divisor, offset_of!(PointerTable, ludiv_handler))
        }
        IrInst::LRem { dest, high, low, divisor } => {
            (dest, high, low, divisor, offset_of!(PointerTable, lrem_handler))
        }
        IrInst::LURem { dest, high, low, divisor } => {
            (dest, high, low, divisor, offset_of!(PointerTable, lurem_handler))
        }
        _ => unreachable!(),
    };
    let (rh, rl, rdiv) = (ctx.reg(*high), ctx.reg(*low), ctx.reg(*divisor));
    ctx.e.mov(X0, rh);
    ctx.e.mov(X1, rl);
    ctx.e.mov(X2, rdiv);
    ctx.load_helper(X3, field);
    ctx.e.blr(X3);
    let rd = ctx.reg(*dest);
    ctx.e.mov(rd, X0);
}

// ===== Context and register file =====

fn op_load_register(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::LoadRegister { dest, reg } = inst else { unreachable!() };
    let rd = ctx.reg(*dest);
    if ctx.opts.sra {
        let src = SRA_GPR[*reg as usize];
        if rd != src {
            ctx.e.mov(rd, src);
        }
    } else {
        ctx.e.ldr(8, rd, STATE, greg_offset(*reg as usize) as u32);
    }
}

fn op_store_register(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::StoreRegister { value, reg } = inst else { unreachable!() };
    let rv = ctx.reg(*value);
    if ctx.opts.sra {
        let dst = SRA_GPR[*reg as usize];
        if dst != rv {
            ctx.e.mov(dst, rv);
        }
    } else {
        ctx.e.str(8, rv, STATE, greg_offset(*reg as usize) as u32);
    }
}

fn op_load_context(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::LoadContext { dest, offset, size } = inst else { unreachable!() };
    if *size == 16 {
        let vd = ctx.vreg(*dest);
        ctx.e.ldr_q(vd, STATE, *offset as u32);
    } else {
        let rd = ctx.reg(*dest);
        ctx.e.ldr(*size, rd, STATE, *offset as u32);
    }
}

fn op_store_context(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::StoreContext { value, offset, size } = inst else { unreachable!() };
    if *size == 16 {
        let vv = ctx.vreg(*value);
        ctx.e.str_q(vv, STATE, *offset as u32);
    } else {
        let rv = ctx.reg(*value);
        ctx.e.str(*size, rv, STATE, *offset as u32);
    }
}

fn op_load_flag(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::LoadFlag { dest, flag } = inst else { unreachable!() };
    let rd = ctx.reg(*dest);
    ctx.e.ldr(1, rd, STATE, flag_offset(*flag as usize) as u32);
}

fn op_store_flag(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::StoreFlag { value, flag } = inst else { unreachable!() };
    let rv = ctx.reg(*value);
    ctx.e.str(1, rv, STATE, flag_offset(*flag as usize) as u32);
}

// ===== Guest memory =====

fn op_load_mem(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::LoadMem { dest, addr, size, tso } = inst else { unreachable!() };
    let raddr = ctx.reg(*addr);
    if ctx.is_fpr(*dest) {
        let vd = ctx.vreg(*dest);
        ctx.e.ldr_q(vd, raddr, 0);
        if *tso {
            ctx.e.dmb(Barrier::InnerShareableLoads);
        }
        return;
    }
    let rd = ctx.reg(*dest);
    if *tso {
        if ctx.opts.half_barrier_tso {
            ctx.e.ldr(*size, rd, raddr, 0);
            ctx.e.dmb(Barrier::InnerShareableLoads);
        } else {
            ctx.e.ldar(*size, rd, raddr);
        }
    } else {
        ctx.e.ldr(*size, rd, raddr, 0);
    }
}

fn op_store_mem(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::StoreMem { value, addr, size, tso } = inst else { unreachable!() };
    let raddr = ctx.reg(*addr);
    if ctx.is_fpr(*value) {
        if *tso {
            ctx.e.dmb(Barrier::InnerShareableStores);
        }
        let vv = ctx.vreg(*value);
        ctx.e.str_q(vv, raddr, 0);
        return;
    }
    let rv = ctx.reg(*value);
    if *tso {
        if ctx.opts.half_barrier_tso {
            ctx.e.dmb(Barrier::InnerShareableStores);
            ctx.e.str(*size, rv, raddr, 0);
        } else {
            ctx.e.stlr(*size, rv, raddr);
        }
    } else {
        ctx.e.str(*size, rv, raddr, 0);
    }
}

// ===== Atomics =====

/// Zero-extend `src` into X1 at the access width so flags-free compares work
fn widen_for_cmp(ctx: &mut Ctx, size: u8, src: XReg) {
    match size {
        1 => ctx.e.uxtb(X1, src),
        2 => ctx.e.uxth(X1, src),
        4 => ctx.e.mov32(X1, src),
        _ => ctx.e.mov(X1, src),
    }
}

fn op_cas(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Cas { dest, expected, desired, addr, size } = inst else { unreachable!() };
    let raddr = ctx.reg(*addr);
    let rdesired = ctx.reg(*desired);
    let rexpected = ctx.reg(*expected);

    widen_for_cmp(ctx, *size, rexpected);
    let retry = ctx.e.new_label();
    let fail = ctx.e.new_label();
    let done = ctx.e.new_label();
    ctx.e.bind(retry);
    ctx.e.ldaxr(*size, X0, raddr);
    ctx.e.cmp(X0, X1);
    ctx.e.bcond_label(ACond::Ne, fail);
    ctx.e.stlxr(*size, X2, rdesired, raddr);
    ctx.e.cbnz32_label(X2, retry);
    ctx.e.b_label(done);
    ctx.e.bind(fail);
    ctx.e.clrex();
    ctx.e.bind(done);
    let rd = ctx.reg(*dest);
    ctx.e.mov(rd, X0);
}

fn op_atomic_fetch_add(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::AtomicFetchAdd { dest, addr, value, size } = inst else { unreachable!() };
    let (raddr, rv) = (ctx.reg(*addr), ctx.reg(*value));
    let retry = ctx.e.new_label();
    ctx.e.bind(retry);
    ctx.e.ldaxr(*size, X0, raddr);
    ctx.e.add(X1, X0, rv);
    ctx.e.stlxr(*size, X2, X1, raddr);
    ctx.e.cbnz32_label(X2, retry);
    let rd = ctx.reg(*dest);
    ctx.e.mov(rd, X0);
}

fn op_atomic_swap(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::AtomicSwap { dest, addr, value, size } = inst else { unreachable!() };
    let (raddr, rv) = (ctx.reg(*addr), ctx.reg(*value));
    let retry = ctx.e.new_label();
    ctx.e.bind(retry);
    ctx.e.ldaxr(*size, X0, raddr);
    ctx.e.stlxr(*size, X2, rv, raddr);
    ctx.e.cbnz32_label(X2, retry);
    let rd = ctx.reg(*dest);
    ctx.e.mov(rd, X0);
}

// ===== Vector =====

fn op_vector_zero(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::VectorZero { dest } = inst else { unreachable!() };
    let vd = ctx.vreg(*dest);
    ctx.e.movi_zero(vd);
}

fn op_vmov(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::VMov { dest, src } = inst else { unreachable!() };
    let (vd, vs) = (ctx.vreg(*dest), ctx.vreg(*src));
    if vd != vs {
        ctx.e.mov_v(vd, vs);
    }
}

fn op_vadd(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::VAdd { dest, elem_size, a, b } = inst else { unreachable!() };
    let (vd, va, vb) = (ctx.vreg(*dest), ctx.vreg(*a), ctx.vreg(*b));
    ctx.e.add_v(*elem_size, vd, va, vb);
}

fn op_vxor(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::VXor { dest, a, b } = inst else { unreachable!() };
    let (vd, va, vb) = (ctx.vreg(*dest), ctx.vreg(*a), ctx.vreg(*b));
    ctx.e.eor_v(vd, va, vb);
}

// ===== Control flow =====

fn op_jump(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Jump { target } = inst else { unreachable!() };
    let label = ctx.target_label(target.0);
    ctx.pending_target = Some(label);
}

fn op_cond_jump(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::CondJump { value, target_true, target_false } = inst else { unreachable!() };
    let rv = ctx.reg(*value);
    let t = ctx.target_label(target_true.0);
    ctx.e.cbnz_label(rv, t);
    let f = ctx.target_label(target_false.0);
    ctx.pending_target = Some(f);
}

fn op_exit_function(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::ExitFunction { new_rip } = inst else { unreachable!() };
    match ctx.inline_value(*new_rip) {
        Some(guest_target) => {
            // Linkable exit: an indirect call through the link record, which
            // the exit linker may later rewrite into a direct branch. The
            // record must be 8-aligned for in-place patching.
            if ctx.e.cursor() % 8 != 0 {
                ctx.e.nop();
            }
            let site = ctx.e.cursor();
            ctx.e.ldr_literal(X0, 8);
            ctx.e.blr(X0);
            let record = ctx.e.buffer().append_u64(ctx.opts.exit_linker_address);
            ctx.e.buffer().append_u64(guest_target);
            ctx.exit_sites.push(ExitSite { site, record, guest_target });
        }
        None => {
            // Indirect exit: synchronize RIP and fall back to the loop top,
            // which spills SRA before the lookup.
            let rv = ctx.reg(*new_rip);
            ctx.e.str(8, rv, STATE, rip_offset() as u32);
            ctx.load_helper(X0, offset_of!(PointerTable, dispatcher_loop_top));
            ctx.e.br(X0);
        }
    }
}

// ===== Services =====

fn op_syscall(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Syscall = inst else { unreachable!() };
    if ctx.opts.sra {
        emit_spill_static_regs(&mut ctx.e);
    }
    emit_push_dynamic_regs_lr(&mut ctx.e);

    ctx.load_helper(X0, offset_of!(PointerTable, syscall_obj));
    ctx.e.mov(X1, STATE);
    ctx.load_helper(X2, offset_of!(PointerTable, syscall_function));
    ctx.e.blr(X2);

    emit_pop_dynamic_regs_lr(&mut ctx.e);
    if ctx.opts.sra {
        emit_fill_static_regs(&mut ctx.e);
    }
}

fn op_cpuid(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Cpuid { leaf, subleaf } = inst else { unreachable!() };
    let (rleaf, rsub) = (ctx.reg(*leaf), ctx.reg(*subleaf));
    if ctx.opts.sra {
        emit_spill_static_regs(&mut ctx.e);
    }
    emit_push_dynamic_regs_lr(&mut ctx.e);

    // Registers still hold their values after the spill; marshal now.
    ctx.e.mov32(X1, rleaf);
    ctx.e.mov32(X2, rsub);
    ctx.load_helper(X0, offset_of!(PointerTable, cpuid_obj));
    ctx.load_helper(X3, offset_of!(PointerTable, cpuid_function));
    ctx.e.blr(X3);

    // Result struct comes back packed in x0/x1: eax|ebx, ecx|edx. Unpack
    // into the frame; the trailing SRA fill makes it architectural.
    ctx.e.mov32(X2, X0);
    ctx.e.str(8, X2, STATE, greg_offset(Reg::Rax as usize) as u32);
    ctx.e.lsr_imm(X0, X0, 32);
    ctx.e.str(8, X0, STATE, greg_offset(Reg::Rbx as usize) as u32);
    ctx.e.mov32(X2, X1);
    ctx.e.str(8, X2, STATE, greg_offset(Reg::Rcx as usize) as u32);
    ctx.e.lsr_imm(X1, X1, 32);
    ctx.e.str(8, X1, STATE, greg_offset(Reg::Rdx as usize) as u32);

    emit_pop_dynamic_regs_lr(&mut ctx.e);
    if ctx.opts.sra {
        emit_fill_static_regs(&mut ctx.e);
    }
}

fn op_signal_return(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::SignalReturn = inst else { unreachable!() };
    if ctx.opts.sra {
        emit_spill_static_regs(&mut ctx.e);
    }
    ctx.load_helper(X0, offset_of!(PointerTable, signal_return_handler));
    ctx.e.br(X0);
}

fn op_break(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Break = inst else { unreachable!() };
    ctx.e.load_constant(X0, ctx.opts.entry);
    ctx.e.str(8, X0, STATE, rip_offset() as u32);
    if ctx.opts.sra {
        emit_spill_static_regs(&mut ctx.e);
    }
    ctx.load_helper(X0, offset_of!(PointerTable, unimplemented_instruction_handler));
    ctx.e.br(X0);
}

fn op_fence(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Fence { kind } = inst else { unreachable!() };
    ctx.e.dmb(match kind {
        FenceKind::Loads => Barrier::InnerShareableLoads,
        FenceKind::Stores => Barrier::InnerShareableStores,
        FenceKind::LoadsStores => Barrier::InnerShareable,
    });
}

// ===== Fallback ABI =====

fn unary_src(inst: &IrInst) -> Node {
    match inst {
        IrInst::LoadFcw { value } => *value,
        IrInst::F80CvtFromF32 { src, .. }
        | IrInst::F80CvtFromF64 { src, .. }
        | IrInst::F80CvtToF64 { src, .. }
        | IrInst::F80CvtToI64 { src, .. } => *src,
        _ => unreachable!("op has no unary source"),
    }
}

fn binary_srcs(inst: &IrInst) -> (Node, Node) {
    match inst {
        IrInst::F80Cmp { a, b, .. }
        | IrInst::F80Add { a, b, .. }
        | IrInst::F80Mul { a, b, .. } => (*a, *b),
        _ => unreachable!("op has no binary sources"),
    }
}

fn fallback_dest(inst: &IrInst) -> Node {
    match inst {
        IrInst::F80CvtFromF32 { dest, .. }
        | IrInst::F80CvtFromF64 { dest, .. }
        | IrInst::F80CvtToF64 { dest, .. }
        | IrInst::F80CvtToI64 { dest, .. }
        | IrInst::F80Cmp { dest, .. }
        | IrInst::F80Add { dest, .. }
        | IrInst::F80Mul { dest, .. } => *dest,
        _ => unreachable!("op has no destination"),
    }
}

/// Load a packed 80-bit value (low 64 + high 16) from `src` into `(xlo, whi)`
fn marshal_f80(ctx: &mut Ctx, src: Node, xlo: XReg, whi: XReg) {
    let vs = ctx.vreg(src);
    ctx.e.umov_d(xlo, vs, 0);
    ctx.e.umov_h(whi, vs, 4);
}

/// Write a packed 80-bit return in `(x0, w1)` into the destination vector
fn unmarshal_f80(ctx: &mut Ctx, dest: Node) {
    let vd = ctx.vreg(dest);
    ctx.e.eor_v(vd, vd, vd);
    ctx.e.ins_d(vd, 0, X0);
    ctx.e.ins_h(vd, 4, X1);
}

/// Opcodes without an inline lowering: marshal a helper call per the op's
/// fallback ABI, or abort (debug) / zero-emit (release) without one.
fn op_unhandled(ctx: &mut Ctx, inst: &IrInst) {
    let Some(info) = inst.fallback_info() else {
        #[cfg(debug_assertions)]
        panic!("unhandled IR op: {}", inst.name());
        #[cfg(not(debug_assertions))]
        return;
    };

    if ctx.opts.sra {
        emit_spill_static_regs(&mut ctx.e);
    }
    emit_push_dynamic_regs_lr(&mut ctx.e);

    match info.abi {
        FallbackAbi::VoidU16 => {
            let rv = ctx.reg(unary_src(inst));
            ctx.e.uxth(X0, rv);
            ctx.load_fallback_helper(X1, info.index as usize);
            ctx.e.blr(X1);
            emit_pop_dynamic_regs_lr(&mut ctx.e);
            if ctx.opts.sra {
                emit_fill_static_regs(&mut ctx.e);
            }
        }
        FallbackAbi::F80F32 | FallbackAbi::F80F64 => {
            let vs = ctx.vreg(unary_src(inst));
            if info.abi == FallbackAbi::F80F32 {
                ctx.e.fmov_s(V0, vs);
            } else {
                ctx.e.fmov_d(V0, vs);
            }
            ctx.load_fallback_helper(X0, info.index as usize);
            ctx.e.blr(X0);
            emit_pop_dynamic_regs_lr(&mut ctx.e);
            if ctx.opts.sra {
                emit_fill_static_regs(&mut ctx.e);
            }
            unmarshal_f80(ctx, fallback_dest(inst));
        }
        FallbackAbi::F80I16 | FallbackAbi::F80I32 => {
            let rv = ctx.reg(unary_src(inst));
            if info.abi == FallbackAbi::F80I16 {
                ctx.e.uxth(X0, rv);
            } else {
                ctx.e.mov32(X0, rv);
            }
            ctx.load_fallback_helper(X1, info.index as usize);
            ctx.e.blr(X1);
            emit_pop_dynamic_regs_lr(&mut ctx.e);
            if ctx.opts.sra {
                emit_fill_static_regs(&mut ctx.e);
            }
            unmarshal_f80(ctx, fallback_dest(inst));
        }
        FallbackAbi::F32F80 | FallbackAbi::F64F80 => {
            marshal_f80(ctx, unary_src(inst), X0, X1);
            ctx.load_fallback_helper(X2, info.index as usize);
            ctx.e.blr(X2);
            emit_pop_dynamic_regs_lr(&mut ctx.e);
            if ctx.opts.sra {
                emit_fill_static_regs(&mut ctx.e);
            }
            let vd = ctx.vreg(fallback_dest(inst));
            if info.abi == FallbackAbi::F32F80 {
                ctx.e.fmov_s(vd, V0);
            } else {
                ctx.e.fmov_d(vd, V0);
            }
        }
        FallbackAbi::F64F64 => {
            let vs = ctx.vreg(unary_src(inst));
            ctx.e.fmov_d(V0, vs);
            ctx.load_fallback_helper(X0, info.index as usize);
            ctx.e.blr(X0);
            emit_pop_dynamic_regs_lr(&mut ctx.e);
            if ctx.opts.sra {
                emit_fill_static_regs(&mut ctx.e);
            }
            let vd = ctx.vreg(fallback_dest(inst));
            ctx.e.fmov_d(vd, V0);
        }
        FallbackAbi::F64F64F64 => {
            let (a, b) = binary_srcs(inst);
            let (va, vb) = (ctx.vreg(a), ctx.vreg(b));
            ctx.e.fmov_d(V0, va);
            ctx.e.fmov_d(V1, vb);
            ctx.load_fallback_helper(X0, info.index as usize);
            ctx.e.blr(X0);
            emit_pop_dynamic_regs_lr(&mut ctx.e);
            if ctx.opts.sra {
                emit_fill_static_regs(&mut ctx.e);
            }
            let vd = ctx.vreg(fallback_dest(inst));
            ctx.e.fmov_d(vd, V0);
        }
        FallbackAbi::I16F80 | FallbackAbi::I32F80 | FallbackAbi::I64F80 => {
            marshal_f80(ctx, unary_src(inst), X0, X1);
            ctx.load_fallback_helper(X2, info.index as usize);
            ctx.e.blr(X2);
            emit_pop_dynamic_regs_lr(&mut ctx.e);
            if ctx.opts.sra {
                emit_fill_static_regs(&mut ctx.e);
            }
            let rd = ctx.reg(fallback_dest(inst));
            match info.abi {
                FallbackAbi::I16F80 => ctx.e.uxth(rd, X0),
                FallbackAbi::I32F80 => ctx.e.mov32(rd, X0),
                _ => ctx.e.mov(rd, X0),
            }
        }
        FallbackAbi::I64F80F80 => {
            let (a, b) = binary_srcs(inst);
            marshal_f80(ctx, a, X0, X1);
            marshal_f80(ctx, b, X2, X3);
            // x0..x3 carry arguments; the helper pointer goes through x4
            ctx.load_fallback_helper(X4, info.index as usize);
            ctx.e.blr(X4);
            emit_pop_dynamic_regs_lr(&mut ctx.e);
            if ctx.opts.sra {
                emit_fill_static_regs(&mut ctx.e);
            }
            let rd = ctx.reg(fallback_dest(inst));
            ctx.e.mov(rd, X0);
        }
        FallbackAbi::F80F80 => {
            marshal_f80(ctx, unary_src(inst), X0, X1);
            ctx.load_fallback_helper(X2, info.index as usize);
            ctx.e.blr(X2);
            emit_pop_dynamic_regs_lr(&mut ctx.e);
            if ctx.opts.sra {
                emit_fill_static_regs(&mut ctx.e);
            }
            unmarshal_f80(ctx, fallback_dest(inst));
        }
        FallbackAbi::F80F80F80 => {
            let (a, b) = binary_srcs(inst);
            marshal_f80(ctx, a, X0, X1);
            marshal_f80(ctx, b, X2, X3);
            ctx.load_fallback_helper(X4, info.index as usize);
            ctx.e.blr(X4);
            emit_pop_dynamic_regs_lr(&mut ctx.e);
            if ctx.opts.sra {
                emit_fill_static_regs(&mut ctx.e);
            }
            unmarshal_f80(ctx, fallback_dest(inst));
        }
        FallbackAbi::Unknown => {
            #[cfg(debug_assertions)]
            panic!("unhandled IR fallback ABI for op: {}", inst.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::aarch64::{encode_ldr_literal, encode_blr};
    use crate::ir::{BlockId, IrBlockBuilder};
    use crate::ra::PhysReg;

    const LINKER: u64 = 0x7777_0000;

    fn opts(entry: u64) -> CompileOptions {
        CompileOptions {
            entry,
            exit_linker_address: LINKER,
            single_step_check: false,
            sra: true,
            half_barrier_tso: false,
        }
    }

    fn words_at(buf: &CodeBuffer, addr: u64, count: usize) -> Vec<u32> {
        buf.bytes_at(addr, count * 4)
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    /// `mov eax, 3; add eax, 4; jmp target` as IR
    fn arith_block(entry: u64, target: u64) -> (crate::ir::IrBlock, RegAllocData) {
        let mut b = IrBlockBuilder::new(entry);
        b.begin_block();
        let c = b.alloc_node();
        b.push(IrInst::Constant { dest: c, value: 3 });
        let four = b.inline_constant(4);
        let sum = b.alloc_node();
        b.push(IrInst::Add { dest: sum, size: 4, a: c, b: four });
        b.push(IrInst::StoreRegister { value: sum, reg: Reg::Rax as u8 });
        let t = b.alloc_node();
        b.push(IrInst::InlineEntrypointOffset {
            dest: t,
            offset: (target - entry) as i64,
            size: 8,
        });
        b.push(IrInst::ExitFunction { new_rip: t });
        let ir = b.finish();

        let mut ra = RegAllocData::new(ir.ssa_count, 0);
        ra.set_register(Node(0), PhysReg { class: RegClass::Gpr, index: 0 });
        ra.set_register(Node(2), PhysReg { class: RegClass::Gpr, index: 1 });
        (ir, ra)
    }

    #[test]
    fn test_compile_emits_linkable_exit_record() {
        let backend = A64Backend::new();
        let mut buf = CodeBuffer::new(1 << 20).unwrap();
        let (ir, ra) = arith_block(0x40_0000, 0x40_0100);
        let block = backend.compile_block(&mut buf, &ir, &ra, &opts(0x40_0000));

        assert_eq!(block.host_entry, buf.base());
        assert_eq!(block.exit_sites.len(), 1);
        let site = block.exit_sites[0];
        assert_eq!(site.site % 8, 0);
        assert_eq!(site.record, site.site + 8);
        assert_eq!(site.guest_target, 0x40_0100);

        // Call site: ldr x0, #8 ; blr x0
        let call = words_at(&buf, site.site, 2);
        assert_eq!(call[0], encode_ldr_literal(crate::arch::aarch64::X0, 8));
        assert_eq!(call[1], encode_blr(crate::arch::aarch64::X0));

        // Record: linker address then guest target
        let record = buf.bytes_at(site.record, 16);
        assert_eq!(u64::from_le_bytes(record[0..8].try_into().unwrap()), LINKER);
        assert_eq!(u64::from_le_bytes(record[8..16].try_into().unwrap()), 0x40_0100);
    }

    #[test]
    fn test_spill_slot_prologue() {
        let backend = A64Backend::new();
        let mut buf = CodeBuffer::new(1 << 20).unwrap();
        let mut b = IrBlockBuilder::new(0x1000);
        b.begin_block();
        let t = b.inline_constant(0x2000);
        b.push(IrInst::ExitFunction { new_rip: t });
        let ir = b.finish();
        let ra = RegAllocData::new(ir.ssa_count, 2);

        let block = backend.compile_block(&mut buf, &ir, &ra, &opts(0x1000));
        let first = words_at(&buf, block.host_entry, 1)[0];
        // sub sp, sp, #32
        assert_eq!(first, 0xD100_0000 | 32 << 10 | 31 << 5 | 31);
    }

    #[test]
    fn test_single_step_check_prologue() {
        let backend = A64Backend::new();
        let mut buf = CodeBuffer::new(1 << 20).unwrap();
        let mut b = IrBlockBuilder::new(0x1000);
        b.begin_block();
        let t = b.inline_constant(0x2000);
        b.push(IrInst::ExitFunction { new_rip: t });
        let ir = b.finish();
        let ra = RegAllocData::new(ir.ssa_count, 0);

        let mut options = opts(0x1000);
        options.single_step_check = true;
        let block = backend.compile_block(&mut buf, &ir, &ra, &options);
        let first = words_at(&buf, block.host_entry, 1)[0];
        // ldr w0, [x28, #running_mode]
        let expected = 0xB940_0000 | ((running_mode_offset() as u32) / 4) << 10 | 28 << 5;
        assert_eq!(first, expected);
    }

    #[test]
    fn test_cond_jump_pending_branch_elision() {
        // A conditional branch whose false edge falls through must not emit
        // a redundant unconditional branch.
        let backend = A64Backend::new();
        let mut buf = CodeBuffer::new(1 << 20).unwrap();
        let mut b = IrBlockBuilder::new(0x1000);
        let bb0 = b.begin_block();
        assert_eq!(bb0, BlockId(0));
        let flag = b.alloc_node();
        b.push(IrInst::LoadFlag { dest: flag, flag: crate::state::flag::ZF as u8 });
        b.push(IrInst::CondJump {
            value: flag,
            target_true: BlockId(2),
            target_false: BlockId(1),
        });
        b.begin_block(); // bb1: fall-through
        let t1 = b.inline_constant(0x2000);
        b.push(IrInst::ExitFunction { new_rip: t1 });
        b.begin_block(); // bb2
        let t2 = b.inline_constant(0x3000);
        b.push(IrInst::ExitFunction { new_rip: t2 });
        let ir = b.finish();

        let mut ra = RegAllocData::new(ir.ssa_count, 0);
        ra.set_register(flag, PhysReg { class: RegClass::Gpr, index: 0 });

        let block = backend.compile_block(&mut buf, &ir, &ra, &opts(0x1000));
        let words = words_at(&buf, block.host_entry, 2);
        // ldrb w19 then cbnz x19; no unconditional b before bb1's code
        assert_eq!(words[1] & 0xFF00_0000, 0xB500_0000);
        assert_eq!(block.exit_sites.len(), 2);
    }

    #[test]
    #[cfg_attr(not(debug_assertions), ignore)]
    #[should_panic(expected = "unhandled IR op")]
    fn test_unhandled_op_without_fallback_panics() {
        let backend = A64Backend::new();
        let mut buf = CodeBuffer::new(1 << 20).unwrap();
        let mut b = IrBlockBuilder::new(0x1000);
        b.begin_block();
        // UMulH is registered; Break is handled; use an op with neither a
        // handler nor a fallback by masking one out of a fresh table.
        let n = b.alloc_node();
        b.push(IrInst::UMulH { dest: n, a: n, b: n });
        let ir = b.finish();
        let ra = RegAllocData::new(ir.ssa_count, 0);

        let mut crippled = A64Backend::new();
        crippled.handlers[Op::UMulH as usize] = op_unhandled;
        crippled.compile_block(&mut buf, &ir, &ra, &opts(0x1000));
    }
}
