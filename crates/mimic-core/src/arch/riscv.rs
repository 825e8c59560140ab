//! RISC-V 64 instruction emitter
//!
//! Mirrors the AArch64 emitter for the RV64GC host: one method per
//! instruction, labels for block-local branches, and the register
//! conventions generated code relies on.
//!
//! Register convention:
//! - `x27` is the state pointer, callee-saved, never clobbered.
//! - `x8/x9/x18/x19` are backend temporaries.
//! - Statically-allocated guest GPRs are all caller-saved (`SRA_GPR`), so
//!   every helper call spills them first.

use crate::codebuf::CodeBuffer;

/// Integer register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gpr(pub u8);

pub const ZERO: Gpr = Gpr(0);
pub const RA: Gpr = Gpr(1);
pub const SP: Gpr = Gpr(2);
pub const GP: Gpr = Gpr(3);
pub const TP: Gpr = Gpr(4);
pub const T0: Gpr = Gpr(5);
pub const T1: Gpr = Gpr(6);
pub const T2: Gpr = Gpr(7);
pub const S0: Gpr = Gpr(8);
pub const S1: Gpr = Gpr(9);
pub const A0: Gpr = Gpr(10);
pub const A1: Gpr = Gpr(11);
pub const A2: Gpr = Gpr(12);
pub const A3: Gpr = Gpr(13);
pub const A4: Gpr = Gpr(14);
pub const A5: Gpr = Gpr(15);
pub const A6: Gpr = Gpr(16);
pub const A7: Gpr = Gpr(17);
pub const S2: Gpr = Gpr(18);
pub const S3: Gpr = Gpr(19);
pub const S4: Gpr = Gpr(20);
pub const S5: Gpr = Gpr(21);
pub const S6: Gpr = Gpr(22);
pub const S7: Gpr = Gpr(23);
pub const S8: Gpr = Gpr(24);
pub const S9: Gpr = Gpr(25);
pub const S10: Gpr = Gpr(26);
pub const S11: Gpr = Gpr(27);
pub const T3: Gpr = Gpr(28);
pub const T4: Gpr = Gpr(29);
pub const T5: Gpr = Gpr(30);
pub const T6: Gpr = Gpr(31);

/// The state pointer
pub const STATE: Gpr = S11;

/// Backend temporaries
pub const TMP1: Gpr = S0;
pub const TMP2: Gpr = S1;
pub const TMP3: Gpr = S2;
pub const TMP4: Gpr = S3;

/// Statically-allocated guest GPRs, indexed by guest register number.
/// All caller-saved.
pub const SRA_GPR: [Gpr; 16] = [
    RA, T0, T1, T2, A0, A1, A2, A3, A4, A5, A6, A7, T3, T4, T5, T6,
];

/// Dynamically allocatable GPRs (callee-saved)
pub const RA_GPR: [Gpr; 7] = [S4, S5, S6, S7, S8, S9, S10];

/// Instruction mask and value identifying `lr.w/.d` with aq|rl set
pub const AMO_OP_MASK: u32 = 0xFE00_007F;
pub const AMO_OP_LR_AQRL: u32 = 0x1600_002F;
/// Same for `sc.w/.d` with aq|rl set
pub const AMO_OP_SC_AQRL: u32 = 0x1E00_002F;

/// Branch condition for the `b*` family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCond {
    Eq,
    Ne,
    Lt,
    Ge,
    Ltu,
    Geu,
}

impl BranchCond {
    fn funct3(self) -> u32 {
        match self {
            BranchCond::Eq => 0b000,
            BranchCond::Ne => 0b001,
            BranchCond::Lt => 0b100,
            BranchCond::Ge => 0b101,
            BranchCond::Ltu => 0b110,
            BranchCond::Geu => 0b111,
        }
    }
}

/// Whether a byte displacement fits the `jal` 21-bit immediate
pub fn jump_offset_fits(from: u64, to: u64) -> bool {
    let off = to as i64 - from as i64;
    (-(1 << 20)..(1 << 20)).contains(&off)
}

/// Encode `jal x0, offset` (direct jump)
pub fn encode_j(offset: i64) -> u32 {
    debug_assert!((-(1 << 20)..(1 << 20)).contains(&offset));
    debug_assert_eq!(offset & 1, 0);
    let imm = offset as u32;
    let imm20 = (imm >> 20) & 1;
    let imm10_1 = (imm >> 1) & 0x3FF;
    let imm11 = (imm >> 11) & 1;
    let imm19_12 = (imm >> 12) & 0xFF;
    (imm20 << 31) | (imm10_1 << 21) | (imm11 << 20) | (imm19_12 << 12) | 0x6F
}

#[derive(Clone, Copy)]
enum FixupKind {
    /// B-type conditional branch, 13-bit immediate
    Branch13,
    /// J-type jump, 21-bit immediate
    Jump21,
}

struct LabelState {
    target: Option<u64>,
    fixups: Vec<(u64, FixupKind)>,
}

/// Forward/backward branch target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

pub struct RvEmitter<'a> {
    buf: &'a mut CodeBuffer,
    labels: Vec<LabelState>,
}

fn encode_branch_imm(insn: u32, offset: i64) -> u32 {
    debug_assert!((-(1 << 12)..(1 << 12)).contains(&offset));
    debug_assert_eq!(offset & 1, 0);
    let imm = offset as u32;
    let imm12 = (imm >> 12) & 1;
    let imm10_5 = (imm >> 5) & 0x3F;
    let imm4_1 = (imm >> 1) & 0xF;
    let imm11 = (imm >> 11) & 1;
    insn | (imm12 << 31) | (imm10_5 << 25) | (imm4_1 << 8) | (imm11 << 7)
}

impl<'a> RvEmitter<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        RvEmitter { buf, labels: Vec::new() }
    }

    pub fn cursor(&self) -> u64 {
        self.buf.cursor_address()
    }

    pub fn buffer(&mut self) -> &mut CodeBuffer {
        self.buf
    }

    fn emit(&mut self, word: u32) {
        self.buf.append_u32(word);
    }

    fn emit_r(&mut self, funct7: u32, rs2: Gpr, rs1: Gpr, funct3: u32, rd: Gpr, opcode: u32) {
        self.emit(
            funct7 << 25
                | (rs2.0 as u32) << 20
                | (rs1.0 as u32) << 15
                | funct3 << 12
                | (rd.0 as u32) << 7
                | opcode,
        );
    }

    fn emit_i(&mut self, imm: i32, rs1: Gpr, funct3: u32, rd: Gpr, opcode: u32) {
        debug_assert!((-2048..2048).contains(&imm));
        self.emit(
            ((imm as u32) & 0xFFF) << 20
                | (rs1.0 as u32) << 15
                | funct3 << 12
                | (rd.0 as u32) << 7
                | opcode,
        );
    }

    fn emit_s(&mut self, imm: i32, rs2: Gpr, rs1: Gpr, funct3: u32, opcode: u32) {
        debug_assert!((-2048..2048).contains(&imm));
        let imm = imm as u32;
        self.emit(
            ((imm >> 5) & 0x7F) << 25
                | (rs2.0 as u32) << 20
                | (rs1.0 as u32) << 15
                | funct3 << 12
                | (imm & 0x1F) << 7
                | opcode,
        );
    }

    // ===== Labels =====

    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelState { target: None, fixups: Vec::new() });
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        let at = self.cursor();
        let state = &mut self.labels[label.0];
        debug_assert!(state.target.is_none(), "label bound twice");
        state.target = Some(at);
        let fixups = std::mem::take(&mut state.fixups);
        for (site, kind) in fixups {
            // Safety: `site` is an instruction we emitted into our own buffer.
            unsafe {
                let p = site as *mut u32;
                let insn = p.read();
                let off = at as i64 - site as i64;
                let patched = match kind {
                    FixupKind::Branch13 => encode_branch_imm(insn, off),
                    FixupKind::Jump21 => insn | encode_j(off),
                };
                p.write(patched);
            }
        }
    }

    fn branch_to(&mut self, label: Label, template: u32, kind: FixupKind) {
        let site = self.cursor();
        match self.labels[label.0].target {
            Some(target) => {
                let off = target as i64 - site as i64;
                let word = match kind {
                    FixupKind::Branch13 => encode_branch_imm(template, off),
                    FixupKind::Jump21 => template | encode_j(off),
                };
                self.emit(word);
            }
            None => {
                self.labels[label.0].fixups.push((site, kind));
                self.emit(template);
            }
        }
    }

    // ===== Constants and moves =====

    pub fn lui(&mut self, rd: Gpr, imm20: i32) {
        self.emit(((imm20 as u32) & 0xF_FFFF) << 12 | (rd.0 as u32) << 7 | 0x37);
    }

    pub fn addi(&mut self, rd: Gpr, rs1: Gpr, imm: i32) {
        self.emit_i(imm, rs1, 0b000, rd, 0x13);
    }

    pub fn addiw(&mut self, rd: Gpr, rs1: Gpr, imm: i32) {
        self.emit_i(imm, rs1, 0b000, rd, 0x1B);
    }

    pub fn mv(&mut self, rd: Gpr, rs: Gpr) {
        self.addi(rd, rs, 0);
    }

    pub fn nop(&mut self) {
        self.addi(ZERO, ZERO, 0);
    }

    /// Materialize an arbitrary 64-bit constant
    pub fn load_constant(&mut self, rd: Gpr, value: u64) {
        let v = value as i64;
        if (-2048..2048).contains(&v) {
            self.addi(rd, ZERO, v as i32);
            return;
        }
        if v == (v as i32) as i64 {
            let lo = ((v << 52) >> 52) as i32; // sign-extended low 12
            let hi = ((v - lo as i64) >> 12) as i32;
            self.lui(rd, hi);
            if lo != 0 {
                self.addiw(rd, rd, lo);
            }
            return;
        }
        // Build the upper bits recursively, then shift in the low 12.
        let lo = ((v << 52) >> 52) as i32;
        let upper = (v - lo as i64) >> 12;
        self.load_constant(rd, upper as u64);
        self.slli(rd, rd, 12);
        if lo != 0 {
            self.addi(rd, rd, lo);
        }
    }

    // ===== ALU =====

    pub fn add(&mut self, rd: Gpr, rs1: Gpr, rs2: Gpr) {
        self.emit_r(0, rs2, rs1, 0b000, rd, 0x33);
    }

    pub fn sub(&mut self, rd: Gpr, rs1: Gpr, rs2: Gpr) {
        self.emit_r(0b010_0000, rs2, rs1, 0b000, rd, 0x33);
    }

    pub fn and(&mut self, rd: Gpr, rs1: Gpr, rs2: Gpr) {
        self.emit_r(0, rs2, rs1, 0b111, rd, 0x33);
    }

    pub fn or(&mut self, rd: Gpr, rs1: Gpr, rs2: Gpr) {
        self.emit_r(0, rs2, rs1, 0b110, rd, 0x33);
    }

    pub fn xor(&mut self, rd: Gpr, rs1: Gpr, rs2: Gpr) {
        self.emit_r(0, rs2, rs1, 0b100, rd, 0x33);
    }

    pub fn andi(&mut self, rd: Gpr, rs1: Gpr, imm: i32) {
        self.emit_i(imm, rs1, 0b111, rd, 0x13);
    }

    pub fn xori(&mut self, rd: Gpr, rs1: Gpr, imm: i32) {
        self.emit_i(imm, rs1, 0b100, rd, 0x13);
    }

    pub fn slli(&mut self, rd: Gpr, rs1: Gpr, shamt: u32) {
        debug_assert!(shamt < 64);
        self.emit(shamt << 20 | (rs1.0 as u32) << 15 | 0b001 << 12 | (rd.0 as u32) << 7 | 0x13);
    }

    pub fn srli(&mut self, rd: Gpr, rs1: Gpr, shamt: u32) {
        debug_assert!(shamt < 64);
        self.emit(shamt << 20 | (rs1.0 as u32) << 15 | 0b101 << 12 | (rd.0 as u32) << 7 | 0x13);
    }

    pub fn srai(&mut self, rd: Gpr, rs1: Gpr, shamt: u32) {
        debug_assert!(shamt < 64);
        self.emit(
            0x4000_0000 | shamt << 20 | (rs1.0 as u32) << 15 | 0b101 << 12 | (rd.0 as u32) << 7
                | 0x13,
        );
    }

    pub fn sll(&mut self, rd: Gpr, rs1: Gpr, rs2: Gpr) {
        self.emit_r(0, rs2, rs1, 0b001, rd, 0x33);
    }

    pub fn srl(&mut self, rd: Gpr, rs1: Gpr, rs2: Gpr) {
        self.emit_r(0, rs2, rs1, 0b101, rd, 0x33);
    }

    pub fn sra(&mut self, rd: Gpr, rs1: Gpr, rs2: Gpr) {
        self.emit_r(0b010_0000, rs2, rs1, 0b101, rd, 0x33);
    }

    pub fn mul(&mut self, rd: Gpr, rs1: Gpr, rs2: Gpr) {
        self.emit_r(1, rs2, rs1, 0b000, rd, 0x33);
    }

    pub fn mulhu(&mut self, rd: Gpr, rs1: Gpr, rs2: Gpr) {
        self.emit_r(1, rs2, rs1, 0b011, rd, 0x33);
    }

    pub fn div(&mut self, rd: Gpr, rs1: Gpr, rs2: Gpr) {
        self.emit_r(1, rs2, rs1, 0b100, rd, 0x33);
    }

    pub fn divu(&mut self, rd: Gpr, rs1: Gpr, rs2: Gpr) {
        self.emit_r(1, rs2, rs1, 0b101, rd, 0x33);
    }

    pub fn rem(&mut self, rd: Gpr, rs1: Gpr, rs2: Gpr) {
        self.emit_r(1, rs2, rs1, 0b110, rd, 0x33);
    }

    pub fn remu(&mut self, rd: Gpr, rs1: Gpr, rs2: Gpr) {
        self.emit_r(1, rs2, rs1, 0b111, rd, 0x33);
    }

    pub fn sltu(&mut self, rd: Gpr, rs1: Gpr, rs2: Gpr) {
        self.emit_r(0, rs2, rs1, 0b011, rd, 0x33);
    }

    pub fn slt(&mut self, rd: Gpr, rs1: Gpr, rs2: Gpr) {
        self.emit_r(0, rs2, rs1, 0b010, rd, 0x33);
    }

    /// `seqz rd, rs`
    pub fn seqz(&mut self, rd: Gpr, rs: Gpr) {
        self.emit_i(1, rs, 0b011, rd, 0x13); // sltiu rd, rs, 1
    }

    /// `snez rd, rs`
    pub fn snez(&mut self, rd: Gpr, rs: Gpr) {
        self.sltu(rd, ZERO, rs);
    }

    /// Zero-extend the low `bits` of `rs` into `rd`
    pub fn zext(&mut self, rd: Gpr, rs: Gpr, bits: u32) {
        self.slli(rd, rs, 64 - bits);
        self.srli(rd, rd, 64 - bits);
    }

    // ===== Loads and stores =====

    /// Zero-extending load of `size` bytes
    pub fn load(&mut self, size: u8, rd: Gpr, offset: i32, base: Gpr) {
        let funct3 = match size {
            1 => 0b100, // lbu
            2 => 0b101, // lhu
            4 => 0b110, // lwu
            8 => 0b011, // ld
            _ => unreachable!("bad load size"),
        };
        self.emit_i(offset, base, funct3, rd, 0x03);
    }

    pub fn store(&mut self, size: u8, rs: Gpr, offset: i32, base: Gpr) {
        let funct3 = match size {
            1 => 0b000,
            2 => 0b001,
            4 => 0b010,
            8 => 0b011,
            _ => unreachable!("bad store size"),
        };
        self.emit_s(offset, rs, base, funct3, 0x23);
    }

    pub fn ld(&mut self, rd: Gpr, offset: i32, base: Gpr) {
        self.load(8, rd, offset, base);
    }

    pub fn sd(&mut self, rs: Gpr, offset: i32, base: Gpr) {
        self.store(8, rs, offset, base);
    }

    // ===== Branches =====

    pub fn branch_label(&mut self, cond: BranchCond, rs1: Gpr, rs2: Gpr, label: Label) {
        let template =
            (rs2.0 as u32) << 20 | (rs1.0 as u32) << 15 | cond.funct3() << 12 | 0x63;
        self.branch_to(label, template, FixupKind::Branch13);
    }

    pub fn beqz_label(&mut self, rs: Gpr, label: Label) {
        self.branch_label(BranchCond::Eq, rs, ZERO, label);
    }

    pub fn bnez_label(&mut self, rs: Gpr, label: Label) {
        self.branch_label(BranchCond::Ne, rs, ZERO, label);
    }

    pub fn j_label(&mut self, label: Label) {
        self.branch_to(label, 0x6F, FixupKind::Jump21);
    }

    pub fn j_offset(&mut self, offset: i64) {
        self.emit(encode_j(offset));
    }

    pub fn jalr(&mut self, rd: Gpr, offset: i32, base: Gpr) {
        self.emit_i(offset, base, 0b000, rd, 0x67);
    }

    /// Indirect jump, no link
    pub fn jr(&mut self, rs: Gpr) {
        self.jalr(ZERO, 0, rs);
    }

    /// Call through a register, linking `ra`
    pub fn call_reg(&mut self, rs: Gpr) {
        self.jalr(RA, 0, rs);
    }

    pub fn ret(&mut self) {
        self.jalr(ZERO, 0, RA);
    }

    pub fn auipc(&mut self, rd: Gpr, imm20: i32) {
        self.emit(((imm20 as u32) & 0xF_FFFF) << 12 | (rd.0 as u32) << 7 | 0x17);
    }

    // ===== Fences and atomics =====

    /// `fence pred, succ` with r/w bits: (r, w) per side
    pub fn fence(&mut self, pred_r: bool, pred_w: bool, succ_r: bool, succ_w: bool) {
        let pred = (pred_r as u32) << 1 | pred_w as u32;
        let succ = (succ_r as u32) << 1 | succ_w as u32;
        self.emit(pred << 24 | succ << 20 | 0x0F);
    }

    pub fn fence_rw_rw(&mut self) {
        self.fence(true, true, true, true);
    }

    fn amo_width(size: u8) -> u32 {
        match size {
            4 => 0b010,
            8 => 0b011,
            _ => unreachable!("bad AMO size"),
        }
    }

    /// `lr.w/.d rd, (rs1)` with aq|rl
    pub fn lr_aqrl(&mut self, size: u8, rd: Gpr, rs1: Gpr) {
        self.emit(
            0b00010 << 27
                | 1 << 26
                | 1 << 25
                | (rs1.0 as u32) << 15
                | Self::amo_width(size) << 12
                | (rd.0 as u32) << 7
                | 0x2F,
        );
    }

    /// `sc.w/.d rd, rs2, (rs1)` with aq|rl
    pub fn sc_aqrl(&mut self, size: u8, rd: Gpr, rs2: Gpr, rs1: Gpr) {
        self.emit(
            0b00011 << 27
                | 1 << 26
                | 1 << 25
                | (rs2.0 as u32) << 20
                | (rs1.0 as u32) << 15
                | Self::amo_width(size) << 12
                | (rd.0 as u32) << 7
                | 0x2F,
        );
    }

    /// `amoadd.w/.d` with aq|rl
    pub fn amoadd_aqrl(&mut self, size: u8, rd: Gpr, rs2: Gpr, rs1: Gpr) {
        self.emit(
            1 << 26
                | 1 << 25
                | (rs2.0 as u32) << 20
                | (rs1.0 as u32) << 15
                | Self::amo_width(size) << 12
                | (rd.0 as u32) << 7
                | 0x2F,
        );
    }

    /// `amoswap.w/.d` with aq|rl
    pub fn amoswap_aqrl(&mut self, size: u8, rd: Gpr, rs2: Gpr, rs1: Gpr) {
        self.emit(
            0b00001 << 27
                | 1 << 26
                | 1 << 25
                | (rs2.0 as u32) << 20
                | (rs1.0 as u32) << 15
                | Self::amo_width(size) << 12
                | (rd.0 as u32) << 7
                | 0x2F,
        );
    }

    pub fn ebreak(&mut self) {
        self.emit(0x0010_0073);
    }
}

// ===== Register-convention fragments =====

use crate::state::greg_offset;

/// Store every statically-allocated guest register to the state frame.
/// RISC-V keeps guest vector state in memory, so only GPRs spill.
pub fn emit_spill_static_regs(e: &mut RvEmitter) {
    for (i, reg) in SRA_GPR.iter().enumerate() {
        e.sd(*reg, greg_offset(i), STATE);
    }
}

/// Reload every statically-allocated guest register from the state frame.
pub fn emit_fill_static_regs(e: &mut RvEmitter) {
    for (i, reg) in SRA_GPR.iter().enumerate() {
        e.ld(*reg, greg_offset(i), STATE);
    }
}

/// Stack bytes used by `emit_push_callee_saved`
pub const CALLEE_SAVED_BYTES: i32 = 112;

/// Push the callee-saved registers a generated entry stub must preserve.
pub fn emit_push_callee_saved(e: &mut RvEmitter) {
    e.addi(SP, SP, -CALLEE_SAVED_BYTES);
    let regs = [RA, S0, S1, S2, S3, S4, S5, S6, S7, S8, S9, S10, S11];
    for (i, reg) in regs.iter().enumerate() {
        e.sd(*reg, (i as i32) * 8, SP);
    }
}

/// Undo `emit_push_callee_saved`.
pub fn emit_pop_callee_saved(e: &mut RvEmitter) {
    let regs = [RA, S0, S1, S2, S3, S4, S5, S6, S7, S8, S9, S10, S11];
    for (i, reg) in regs.iter().enumerate() {
        e.ld(*reg, (i as i32) * 8, SP);
    }
    e.addi(SP, SP, CALLEE_SAVED_BYTES);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(f: impl FnOnce(&mut RvEmitter)) -> Vec<u32> {
        let mut buf = CodeBuffer::new(4096).unwrap();
        let base = buf.cursor_address();
        {
            let mut e = RvEmitter::new(&mut buf);
            f(&mut e);
        }
        let len = buf.cursor_offset();
        buf.bytes_at(base, len)
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_basic_encodings() {
        let words = emitted(|e| {
            e.addi(A0, ZERO, 42);
            e.add(A0, A1, A2);
            e.ld(T0, 8, STATE);
            e.sd(T0, 8, STATE);
            e.ret();
            e.ebreak();
        });
        assert_eq!(words[0], 0x02A0_0513);
        assert_eq!(words[1], 0x00C5_8533);
        assert_eq!(words[2], 0x008D_B283); // ld t0, 8(s11)
        assert_eq!(words[3], 0x005D_B423); // sd t0, 8(s11)
        assert_eq!(words[4], 0x0000_8067);
        assert_eq!(words[5], 0x0010_0073);
    }

    #[test]
    fn test_lr_sc_match_fault_masks() {
        let words = emitted(|e| {
            e.lr_aqrl(4, T0, A0);
            e.lr_aqrl(8, T0, A0);
            e.sc_aqrl(4, T0, T1, A0);
        });
        for w in &words[0..2] {
            assert_eq!(w & AMO_OP_MASK, AMO_OP_LR_AQRL);
        }
        assert_eq!(words[2] & AMO_OP_MASK, AMO_OP_SC_AQRL);
        // Width field distinguishes .w from .d
        assert_eq!((words[0] >> 12) & 0b111, 0b010);
        assert_eq!((words[1] >> 12) & 0b111, 0b011);
    }

    #[test]
    fn test_load_constant_small_and_large() {
        let words = emitted(|e| e.load_constant(A0, 42));
        assert_eq!(words, vec![0x02A0_0513]); // addi a0, zero, 42

        let words = emitted(|e| e.load_constant(A0, 0x1234_5678));
        assert_eq!(words.len(), 2); // lui + addiw

        // A full 64-bit constant takes the recursive path
        let words = emitted(|e| e.load_constant(A0, 0xDEAD_BEEF_CAFE_F00D));
        assert!(words.len() > 2);
    }

    #[test]
    fn test_forward_branch_label() {
        let words = emitted(|e| {
            let skip = e.new_label();
            e.beqz_label(A0, skip);
            e.nop();
            e.nop();
            e.bind(skip);
            e.ret();
        });
        // beqz a0, +12
        assert_eq!(words[0], encode_branch_imm((10u32) << 15 | 0x63, 12));
    }

    #[test]
    fn test_jump_label_backward() {
        let words = emitted(|e| {
            let top = e.new_label();
            e.bind(top);
            e.nop();
            e.j_label(top);
        });
        assert_eq!(words[1], encode_j(-4));
    }

    #[test]
    fn test_fence_bits() {
        let words = emitted(|e| {
            e.fence_rw_rw();
            e.fence(false, true, true, true); // fence w, rw
        });
        assert_eq!(words[0], 0x0330_000F);
        assert_eq!(words[1], 0x0130_000F);
    }

    #[test]
    fn test_state_register_is_reserved() {
        for r in SRA_GPR.iter().chain(RA_GPR.iter()) {
            assert_ne!(r.0, STATE.0);
        }
        for t in [TMP1, TMP2, TMP3, TMP4] {
            assert!(!SRA_GPR.contains(&t));
        }
    }
}
