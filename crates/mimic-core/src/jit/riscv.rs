//! RISC-V 64 opcode lowering
//!
//! Same handler-table shape as the AArch64 backend, with the narrower
//! coverage of the younger port: scalar ALU, context/memory traffic,
//! atomics, exits, and services lower inline; vector and 80-bit float ops
//! have no inline lowering here and the only marshalled fallback ABI is
//! `VOID_U16`.

use crate::arch::riscv::{
    emit_fill_static_regs, emit_spill_static_regs, BranchCond, Gpr, Label, RvEmitter, RA_GPR,
    SP, SRA_GPR, STATE, A0, A1, A2, TMP1, TMP2, TMP3, TMP4, ZERO,
};
use crate::codebuf::{flush_icache, CodeBuffer};
use crate::ir::{
    Cond, FallbackAbi, FenceKind, InlinePayload, IrBlock, IrInst, Node, Op, OP_COUNT,
};
use crate::jit::{CompileOptions, CompiledBlock, ExitSite};
use crate::ra::{RegAllocData, RegClass};
use crate::state::{
    flag_offset, greg_offset, pointers_offset, rip_offset, running_mode_offset, PointerTable, Reg,
};
use rustc_hash::FxHashMap;
use std::mem::offset_of;

/// The instruction words of an unlinked exit call site. `record` sits 16
/// bytes past the site; the thunk recovers it from the link temporary.
pub fn indirect_exit_words() -> [u32; 4] {
    let mut buf = CodeBuffer::new(4096).expect("scratch buffer");
    let base = buf.cursor_address();
    {
        let mut e = RvEmitter::new(&mut buf);
        e.auipc(TMP1, 0);
        e.ld(TMP1, 16, TMP1);
        e.jalr(TMP2, 0, TMP1);
        e.nop();
    }
    let bytes = buf.bytes_at(base, 16);
    std::array::from_fn(|i| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap()))
}

struct Ctx<'a, 'b> {
    e: RvEmitter<'a>,
    ir: &'b IrBlock,
    ra: &'b RegAllocData,
    opts: &'b CompileOptions,
    jump_targets: FxHashMap<u32, Label>,
    pending_target: Option<Label>,
    exit_sites: Vec<ExitSite>,
}

impl Ctx<'_, '_> {
    fn reg(&self, node: Node) -> Gpr {
        let phys = self.ra.node_register(node);
        match phys.class {
            RegClass::GprFixed => SRA_GPR[phys.index as usize],
            RegClass::Gpr => RA_GPR[phys.index as usize],
            _ => panic!("node {node} is not in a GPR class"),
        }
    }

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

    fn truncate32(&mut self, reg: Gpr) {
        self.e.zext(reg, reg, 32);
    }

    fn load_helper(&mut self, scratch: Gpr, field_offset: usize) {
        self.e.ld(scratch, pointers_offset(field_offset), STATE);
    }
}

type Handler = for<'a, 'b, 'c> fn(&'c mut Ctx<'a, 'b>, &'b IrInst);

/// RISC-V 64 JIT backend
pub struct Rv64Backend {
    handlers: [Handler; OP_COUNT],
}

impl Default for Rv64Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Rv64Backend {
    pub fn new() -> Self {
        let mut handlers: [Handler; OP_COUNT] = [op_unhandled; OP_COUNT];
        register_alu_handlers(&mut handlers);
        register_memory_handlers(&mut handlers);
        register_atomic_handlers(&mut handlers);
        register_branch_handlers(&mut handlers);
        Rv64Backend { handlers }
    }

    pub fn compile_block(
        &self,
        buf: &mut CodeBuffer,
        ir: &IrBlock,
        ra: &RegAllocData,
        opts: &CompileOptions,
    ) -> CompiledBlock {
        let host_entry = buf.cursor_address();
        let mut ctx = Ctx {
            e: RvEmitter::new(buf),
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
            let bytes = (spill_slots * 16) as i32;
            if bytes < 2048 {
                ctx.e.addi(SP, SP, -bytes);
            } else {
                ctx.e.load_constant(TMP1, bytes as u64);
                ctx.e.sub(SP, SP, TMP1);
            }
        }

        let mut subblocks = Vec::new();
        for bb in &ir.blocks {
            let block_start = ctx.e.cursor();
            let label = ctx.target_label(bb.id.0);
            if let Some(pending) = ctx.pending_target.take() {
                if pending != label {
                    ctx.e.j_label(pending);
                }
            }
            ctx.e.bind(label);

            for inst in &bb.insts {
                let handler = self.handlers[inst.op() as usize];
                handler(&mut ctx, inst);
            }

            subblocks.push((block_start, (ctx.e.cursor() - block_start) as u32));
        }

        if let Some(pending) = ctx.pending_target.take() {
            ctx.e.j_label(pending);
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

fn emit_pause_check(e: &mut RvEmitter, entry: u64) {
    let run_block = e.new_label();
    e.load(4, TMP1, running_mode_offset(), STATE);
    e.beqz_label(TMP1, run_block);
    {
        e.load_constant(TMP1, entry);
        e.sd(TMP1, rip_offset(), STATE);
        e.ld(
            TMP1,
            pointers_offset(offset_of!(PointerTable, thread_pause_handler_spill_sra)),
            STATE,
        );
        e.jr(TMP1);
    }
    e.bind(run_block);
}

/// Emit the single-step pause check as a standalone fragment; returns the
/// bytes written.
pub fn generate_gdb_pause_check(buf: &mut CodeBuffer, entry: u64) -> usize {
    let start = buf.cursor_address();
    {
        let mut e = RvEmitter::new(&mut *buf);
        emit_pause_check(&mut e, entry);
    }
    let used = (buf.cursor_address() - start) as usize;
    flush_icache(start, used);
    used
}

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
    h[Op::Fence as usize] = op_fence;
}

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
    let (rd, ra) = (ctx.reg(*dest), ctx.reg(*a));
    match ctx.inline_value(*b) {
        Some(v) if (v as i64) >= -2048 && (v as i64) < 2048 => {
            ctx.e.addi(rd, ra, v as i32);
        }
        _ => {
            let rb = ctx.reg(*b);
            ctx.e.add(rd, ra, rb);
        }
    }
    if *size == 4 {
        ctx.truncate32(rd);
    }
}

fn op_sub(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Sub { dest, size, a, b } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    ctx.e.sub(rd, ra, rb);
    if *size == 4 {
        ctx.truncate32(rd);
    }
}

fn op_neg(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Neg { dest, size, a } = inst else { unreachable!() };
    let (rd, ra) = (ctx.reg(*dest), ctx.reg(*a));
    ctx.e.sub(rd, ZERO, ra);
    if *size == 4 {
        ctx.truncate32(rd);
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
    ctx.e.mulhu(rd, ra, rb);
}

fn op_div(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Div { dest, size, a, b } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    ctx.e.div(rd, ra, rb);
    if *size == 4 {
        ctx.truncate32(rd);
    }
}

fn op_udiv(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::UDiv { dest, size, a, b } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    ctx.e.divu(rd, ra, rb);
    if *size == 4 {
        ctx.truncate32(rd);
    }
}

fn op_rem(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Rem { dest, size, a, b } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    ctx.e.rem(rd, ra, rb);
    if *size == 4 {
        ctx.truncate32(rd);
    }
}

fn op_urem(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::URem { dest, size, a, b } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    ctx.e.remu(rd, ra, rb);
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
    ctx.e.or(rd, ra, rb);
}

fn op_xor(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Xor { dest, a, b } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    ctx.e.xor(rd, ra, rb);
}

fn op_not(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Not { dest, a } = inst else { unreachable!() };
    let (rd, ra) = (ctx.reg(*dest), ctx.reg(*a));
    ctx.e.xori(rd, ra, -1);
}

fn op_lshl(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Lshl { dest, size, a, shift } = inst else { unreachable!() };
    let (rd, ra, rs) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*shift));
    ctx.e.sll(rd, ra, rs);
    if *size == 4 {
        ctx.truncate32(rd);
    }
}

fn op_lshr(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Lshr { dest, size, a, shift } = inst else { unreachable!() };
    let (rd, ra, rs) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*shift));
    ctx.e.srl(rd, ra, rs);
    if *size == 4 {
        ctx.truncate32(rd);
    }
}

fn op_ashr(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Ashr { dest, size, a, shift } = inst else { unreachable!() };
    let (rd, ra, rs) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*shift));
    ctx.e.sra(rd, ra, rs);
    if *size == 4 {
        ctx.truncate32(rd);
    }
}

fn op_select(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Select { dest, cond, a, b, true_val, false_val } = inst else { unreachable!() };
    let (rd, ra, rb) = (ctx.reg(*dest), ctx.reg(*a), ctx.reg(*b));
    let (rt, rf) = (ctx.reg(*true_val), ctx.reg(*false_val));
    let (bc, swap) = match cond {
        Cond::Eq => (BranchCond::Eq, false),
        Cond::Ne => (BranchCond::Ne, false),
        Cond::ULt => (BranchCond::Ltu, false),
        Cond::ULe => (BranchCond::Geu, true),
        Cond::SLt => (BranchCond::Lt, false),
        Cond::SLe => (BranchCond::Ge, true),
    };
    let take = ctx.e.new_label();
    let done = ctx.e.new_label();
    // `a <= b` is `!(b >= a)` swapped; branch to the taken edge
    if swap {
        ctx.e.branch_label(bc, rb, ra, take);
    } else {
        ctx.e.branch_label(bc, ra, rb, take);
    }
    ctx.e.mv(rd, rf);
    ctx.e.j_label(done);
    ctx.e.bind(take);
    ctx.e.mv(rd, rt);
    ctx.e.bind(done);
}

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
    // a0..a2 carry statically-allocated guest registers; spill before
    // marshalling clobbers them. The spill itself leaves values in place.
    if ctx.opts.sra {
        emit_spill_static_regs(&mut ctx.e);
    }
    ctx.e.mv(A0, rh);
    ctx.e.mv(A1, rl);
    ctx.e.mv(A2, rdiv);
    ctx.load_helper(TMP1, field);
    ctx.e.call_reg(TMP1);
    // Carry the result across the fill in a reserved temporary
    ctx.e.mv(TMP4, A0);
    if ctx.opts.sra {
        emit_fill_static_regs(&mut ctx.e);
    }
    let rd = ctx.reg(*dest);
    ctx.e.mv(rd, TMP4);
}

fn op_load_register(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::LoadRegister { dest, reg } = inst else { unreachable!() };
    let rd = ctx.reg(*dest);
    if ctx.opts.sra {
        let src = SRA_GPR[*reg as usize];
        if rd != src {
            ctx.e.mv(rd, src);
        }
    } else {
        ctx.e.ld(rd, greg_offset(*reg as usize), STATE);
    }
}

fn op_store_register(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::StoreRegister { value, reg } = inst else { unreachable!() };
    let rv = ctx.reg(*value);
    if ctx.opts.sra {
        let dst = SRA_GPR[*reg as usize];
        if dst != rv {
            ctx.e.mv(dst, rv);
        }
    } else {
        ctx.e.sd(rv, greg_offset(*reg as usize), STATE);
    }
}

fn op_load_context(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::LoadContext { dest, offset, size } = inst else { unreachable!() };
    assert_ne!(*size, 16, "vector context loads are not lowered on riscv64");
    let rd = ctx.reg(*dest);
    ctx.e.load(*size, rd, *offset, STATE);
}

fn op_store_context(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::StoreContext { value, offset, size } = inst else { unreachable!() };
    assert_ne!(*size, 16, "vector context stores are not lowered on riscv64");
    let rv = ctx.reg(*value);
    ctx.e.store(*size, rv, *offset, STATE);
}

fn op_load_flag(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::LoadFlag { dest, flag } = inst else { unreachable!() };
    let rd = ctx.reg(*dest);
    ctx.e.load(1, rd, flag_offset(*flag as usize), STATE);
}

fn op_store_flag(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::StoreFlag { value, flag } = inst else { unreachable!() };
    let rv = ctx.reg(*value);
    ctx.e.store(1, rv, flag_offset(*flag as usize), STATE);
}

fn op_load_mem(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::LoadMem { dest, addr, size, tso } = inst else { unreachable!() };
    let (rd, raddr) = (ctx.reg(*dest), ctx.reg(*addr));
    if *tso {
        ctx.e.fence_rw_rw();
        ctx.e.load(*size, rd, 0, raddr);
        // r, rw
        ctx.e.fence(true, false, true, true);
    } else {
        ctx.e.load(*size, rd, 0, raddr);
    }
}

fn op_store_mem(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::StoreMem { value, addr, size, tso } = inst else { unreachable!() };
    let (rv, raddr) = (ctx.reg(*value), ctx.reg(*addr));
    if *tso {
        // rw, w
        ctx.e.fence(true, true, false, true);
    }
    ctx.e.store(*size, rv, 0, raddr);
}

fn op_cas(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Cas { dest, expected, desired, addr, size } = inst else { unreachable!() };
    assert!(*size == 4 || *size == 8, "sub-word CAS is not lowered on riscv64");
    let raddr = ctx.reg(*addr);
    let rexpected = ctx.reg(*expected);
    let rdesired = ctx.reg(*desired);

    if *size == 4 {
        ctx.e.zext(TMP2, rexpected, 32);
    } else {
        ctx.e.mv(TMP2, rexpected);
    }
    let retry = ctx.e.new_label();
    let done = ctx.e.new_label();
    ctx.e.bind(retry);
    ctx.e.lr_aqrl(*size, TMP1, raddr);
    if *size == 4 {
        // lr.w sign-extends; compare zero-extended lanes
        ctx.e.zext(TMP1, TMP1, 32);
    }
    ctx.e.branch_label(BranchCond::Ne, TMP1, TMP2, done);
    ctx.e.sc_aqrl(*size, TMP3, rdesired, raddr);
    ctx.e.bnez_label(TMP3, retry);
    ctx.e.bind(done);
    let rd = ctx.reg(*dest);
    ctx.e.mv(rd, TMP1);
}

fn op_atomic_fetch_add(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::AtomicFetchAdd { dest, addr, value, size } = inst else { unreachable!() };
    let (raddr, rv) = (ctx.reg(*addr), ctx.reg(*value));
    let rd = ctx.reg(*dest);
    ctx.e.amoadd_aqrl(*size, rd, rv, raddr);
}

fn op_atomic_swap(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::AtomicSwap { dest, addr, value, size } = inst else { unreachable!() };
    let (raddr, rv) = (ctx.reg(*addr), ctx.reg(*value));
    let rd = ctx.reg(*dest);
    ctx.e.amoswap_aqrl(*size, rd, rv, raddr);
}

fn op_jump(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Jump { target } = inst else { unreachable!() };
    let label = ctx.target_label(target.0);
    ctx.pending_target = Some(label);
}

fn op_cond_jump(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::CondJump { value, target_true, target_false } = inst else { unreachable!() };
    let rv = ctx.reg(*value);
    let t = ctx.target_label(target_true.0);
    ctx.e.bnez_label(rv, t);
    let f = ctx.target_label(target_false.0);
    ctx.pending_target = Some(f);
}

fn op_exit_function(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::ExitFunction { new_rip } = inst else { unreachable!() };
    match ctx.inline_value(*new_rip) {
        Some(guest_target) => {
            while ctx.e.cursor() % 8 != 0 {
                ctx.e.nop();
            }
            let site = ctx.e.cursor();
            ctx.e.auipc(TMP1, 0);
            ctx.e.ld(TMP1, 16, TMP1);
            // Link into the reserved temporary, not ra: ra carries a
            // statically-allocated guest register.
            ctx.e.jalr(TMP2, 0, TMP1);
            ctx.e.nop();
            let record = ctx.e.buffer().append_u64(ctx.opts.exit_linker_address);
            ctx.e.buffer().append_u64(guest_target);
            ctx.exit_sites.push(ExitSite { site, record, guest_target });
        }
        None => {
            let rv = ctx.reg(*new_rip);
            ctx.e.sd(rv, rip_offset(), STATE);
            ctx.load_helper(TMP1, offset_of!(PointerTable, dispatcher_loop_top));
            ctx.e.jr(TMP1);
        }
    }
}

fn op_syscall(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Syscall = inst else { unreachable!() };
    if ctx.opts.sra {
        emit_spill_static_regs(&mut ctx.e);
    }
    ctx.load_helper(A0, offset_of!(PointerTable, syscall_obj));
    ctx.e.mv(A1, STATE);
    ctx.load_helper(TMP1, offset_of!(PointerTable, syscall_function));
    ctx.e.call_reg(TMP1);
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
    ctx.e.zext(A1, rleaf, 32);
    ctx.e.zext(A2, rsub, 32);
    ctx.load_helper(A0, offset_of!(PointerTable, cpuid_obj));
    ctx.load_helper(TMP1, offset_of!(PointerTable, cpuid_function));
    ctx.e.call_reg(TMP1);

    // Result packed in a0/a1: eax|ebx, ecx|edx
    ctx.e.zext(TMP1, A0, 32);
    ctx.e.sd(TMP1, greg_offset(Reg::Rax as usize), STATE);
    ctx.e.srli(TMP1, A0, 32);
    ctx.e.sd(TMP1, greg_offset(Reg::Rbx as usize), STATE);
    ctx.e.zext(TMP1, A1, 32);
    ctx.e.sd(TMP1, greg_offset(Reg::Rcx as usize), STATE);
    ctx.e.srli(TMP1, A1, 32);
    ctx.e.sd(TMP1, greg_offset(Reg::Rdx as usize), STATE);

    if ctx.opts.sra {
        emit_fill_static_regs(&mut ctx.e);
    }
}

fn op_signal_return(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::SignalReturn = inst else { unreachable!() };
    if ctx.opts.sra {
        emit_spill_static_regs(&mut ctx.e);
    }
    ctx.load_helper(TMP1, offset_of!(PointerTable, signal_return_handler));
    ctx.e.jr(TMP1);
}

fn op_break(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Break = inst else { unreachable!() };
    ctx.e.load_constant(TMP1, ctx.opts.entry);
    ctx.e.sd(TMP1, rip_offset(), STATE);
    if ctx.opts.sra {
        emit_spill_static_regs(&mut ctx.e);
    }
    ctx.load_helper(TMP1, offset_of!(PointerTable, unimplemented_instruction_handler));
    ctx.e.jr(TMP1);
}

fn op_fence(ctx: &mut Ctx, inst: &IrInst) {
    let IrInst::Fence { kind } = inst else { unreachable!() };
    match kind {
        FenceKind::Loads => ctx.e.fence(true, false, true, false),
        FenceKind::Stores => ctx.e.fence(false, true, false, true),
        FenceKind::LoadsStores => ctx.e.fence_rw_rw(),
    }
}

/// The only marshalled fallback here is `VOID_U16`; everything else is
/// still waiting on vector state handling for this port.
fn op_unhandled(ctx: &mut Ctx, inst: &IrInst) {
    let Some(info) = inst.fallback_info() else {
        #[cfg(debug_assertions)]
        panic!("unhandled IR op: {}", inst.name());
        #[cfg(not(debug_assertions))]
        return;
    };

    match info.abi {
        FallbackAbi::VoidU16 => {
            if ctx.opts.sra {
                emit_spill_static_regs(&mut ctx.e);
            }
            let IrInst::LoadFcw { value } = inst else {
                unreachable!("unexpected VOID_U16 op: {}", inst.name())
            };
            let rv = ctx.reg(*value);
            ctx.e.zext(A0, rv, 16);
            let off = pointers_offset(offset_of!(PointerTable, fallback_handlers))
                + (info.index as usize as i32) * 8;
            ctx.e.ld(TMP1, off, STATE);
            ctx.e.call_reg(TMP1);
            if ctx.opts.sra {
                emit_fill_static_regs(&mut ctx.e);
            }
        }
        _ => {
            #[cfg(debug_assertions)]
            panic!("fallback ABI {:?} not implemented on riscv64: {}", info.abi, inst.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::riscv::encode_j;
    use crate::ir::IrBlockBuilder;
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

    #[test]
    fn test_indirect_exit_words_shape() {
        let words = indirect_exit_words();
        // auipc s0, 0
        assert_eq!(words[0], 0x0000_0417);
        // nop terminator before the record
        assert_eq!(words[3], 0x0000_0013);
    }

    #[test]
    fn test_compile_emits_linkable_exit_record() {
        let backend = Rv64Backend::new();
        let mut buf = CodeBuffer::new(1 << 20).unwrap();
        let mut b = IrBlockBuilder::new(0x40_0000);
        b.begin_block();
        let c = b.alloc_node();
        b.push(IrInst::Constant { dest: c, value: 7 });
        b.push(IrInst::StoreRegister { value: c, reg: Reg::Rax as u8 });
        let t = b.inline_constant(0x40_0100);
        b.push(IrInst::ExitFunction { new_rip: t });
        let ir = b.finish();
        let mut ra = RegAllocData::new(ir.ssa_count, 0);
        ra.set_register(Node(0), PhysReg { class: RegClass::Gpr, index: 0 });

        let block = backend.compile_block(&mut buf, &ir, &ra, &opts(0x40_0000));
        assert_eq!(block.exit_sites.len(), 1);
        let site = block.exit_sites[0];
        assert_eq!(site.site % 8, 0);
        assert_eq!(site.record, site.site + 16);

        // Call site matches the canonical unlinked shape
        let words: Vec<u32> = buf
            .bytes_at(site.site, 16)
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(words.as_slice(), &indirect_exit_words());

        let record = buf.bytes_at(site.record, 16);
        assert_eq!(u64::from_le_bytes(record[0..8].try_into().unwrap()), LINKER);
        assert_eq!(u64::from_le_bytes(record[8..16].try_into().unwrap()), 0x40_0100);
    }

    #[test]
    fn test_direct_patch_encoding_fits() {
        // A direct rewrite of the site must be a single jal x0
        let from = 0x10_0000u64;
        let to = 0x10_8000u64;
        let j = encode_j((to - from) as i64);
        assert_eq!(j & 0x7F, 0x6F);
        assert_eq!(j & 0xF80, 0, "rd must be x0");
    }
}