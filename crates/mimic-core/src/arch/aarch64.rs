//! AArch64 instruction emitter
//!
//! A thin assembler over a `CodeBuffer`: each method encodes one A64
//! instruction at the cursor. Labels support the forward branches the
//! backend needs for block-local control flow. Encodings cover exactly the
//! subset the JIT backend and the dispatcher stubs emit.
//!
//! Register convention (invariant for all generated code):
//! - `x28` is the state pointer: callee-saved, never clobbered across calls.
//! - `x0..x3` are scratch.
//! - Statically-allocated guest GPRs live in `SRA_GPR`, guest vector
//!   registers in `SRA_FPR`; both are spilled to the frame at every boundary
//!   into Rust and refilled on re-entry.

use crate::codebuf::CodeBuffer;

/// General-purpose register (31 = SP or XZR depending on instruction)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XReg(pub u8);

/// Vector register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VReg(pub u8);

pub const X0: XReg = XReg(0);
pub const X1: XReg = XReg(1);
pub const X2: XReg = XReg(2);
pub const X3: XReg = XReg(3);
pub const X4: XReg = XReg(4);
pub const X5: XReg = XReg(5);
pub const X6: XReg = XReg(6);
pub const X7: XReg = XReg(7);
pub const X8: XReg = XReg(8);
pub const X9: XReg = XReg(9);
pub const X10: XReg = XReg(10);
pub const X11: XReg = XReg(11);
pub const X12: XReg = XReg(12);
pub const X13: XReg = XReg(13);
pub const X14: XReg = XReg(14);
pub const X15: XReg = XReg(15);
pub const X16: XReg = XReg(16);
pub const X17: XReg = XReg(17);
pub const X18: XReg = XReg(18);
pub const X19: XReg = XReg(19);
pub const X20: XReg = XReg(20);
pub const X21: XReg = XReg(21);
pub const X22: XReg = XReg(22);
pub const X23: XReg = XReg(23);
pub const X24: XReg = XReg(24);
pub const X25: XReg = XReg(25);
pub const X26: XReg = XReg(26);
pub const X27: XReg = XReg(27);
pub const X28: XReg = XReg(28);
pub const X29: XReg = XReg(29);
pub const LR: XReg = XReg(30);
pub const XZR: XReg = XReg(31);
pub const SP: XReg = XReg(31);

pub const V0: VReg = VReg(0);
pub const V1: VReg = VReg(1);

/// The state pointer
pub const STATE: XReg = X28;

/// Statically-allocated guest GPRs, indexed by guest register number
pub const SRA_GPR: [XReg; 16] = [
    X4, X5, X6, X7, X8, X9, X10, X11, X12, X18, X17, X16, X15, X14, X13, X29,
];

/// Statically-allocated guest vector registers (v16..v31)
pub const SRA_FPR: [VReg; 16] = [
    VReg(16), VReg(17), VReg(18), VReg(19), VReg(20), VReg(21), VReg(22), VReg(23),
    VReg(24), VReg(25), VReg(26), VReg(27), VReg(28), VReg(29), VReg(30), VReg(31),
];

/// Dynamically allocatable GPRs (callee-saved, so C helpers preserve them)
pub const RA_GPR: [XReg; 9] = [X19, X20, X21, X22, X23, X24, X25, X26, X27];

/// Dynamically allocatable vector registers (caller-saved: pushed around
/// helper calls)
pub const RA_FPR: [VReg; 12] = [
    VReg(4), VReg(5), VReg(6), VReg(7), VReg(8), VReg(9), VReg(10), VReg(11),
    VReg(12), VReg(13), VReg(14), VReg(15),
];

/// Condition codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    Cs = 2,
    Cc = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Al = 14,
}

impl Cond {
    pub fn invert(self) -> Cond {
        // Conditions pair up by flipping the low bit
        match self {
            Cond::Al => Cond::Al,
            _ => unsafe { std::mem::transmute((self as u32) ^ 1) },
        }
    }
}

/// Barrier options for `dmb`
#[derive(Debug, Clone, Copy)]
pub enum Barrier {
    InnerShareable,
    InnerShareableLoads,
    InnerShareableStores,
}

/// Whether a byte displacement fits a 26-bit signed word offset (`b`/`bl`)
pub fn branch_offset_fits(from: u64, to: u64) -> bool {
    let words = (to as i64 - from as i64) / 4;
    (-(1 << 25)..(1 << 25)).contains(&words)
}

/// Encode an unconditional `b` with a byte displacement
pub fn encode_b(offset_bytes: i64) -> u32 {
    let words = offset_bytes / 4;
    debug_assert!((-(1 << 25)..(1 << 25)).contains(&words));
    0x1400_0000 | ((words as u32) & 0x03FF_FFFF)
}

/// Encode `ldr xT, pc+offset` (literal form)
pub fn encode_ldr_literal(rt: XReg, offset_bytes: i64) -> u32 {
    let words = offset_bytes / 4;
    debug_assert!((-(1 << 18)..(1 << 18)).contains(&words));
    0x5800_0000 | (((words as u32) & 0x7_FFFF) << 5) | rt.0 as u32
}

/// Encode `blr xN`
pub fn encode_blr(rn: XReg) -> u32 {
    0xD63F_0000 | (rn.0 as u32) << 5
}

#[derive(Clone, Copy)]
enum FixupKind {
    /// b/bl: imm26 word offset at bits 0..26
    Branch26,
    /// b.cond / cbz / cbnz: imm19 word offset at bits 5..24
    Branch19,
}

struct LabelState {
    target: Option<u64>,
    fixups: Vec<(u64, FixupKind)>,
}

/// Forward/backward branch target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

pub struct A64Emitter<'a> {
    buf: &'a mut CodeBuffer,
    labels: Vec<LabelState>,
}

impl<'a> A64Emitter<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        A64Emitter { buf, labels: Vec::new() }
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
            Self::patch(site, at, kind);
        }
    }

    fn patch(site: u64, target: u64, kind: FixupKind) {
        let words = ((target as i64 - site as i64) / 4) as u32;
        // Safety: `site` is an instruction we emitted into our own buffer.
        unsafe {
            let p = site as *mut u32;
            let insn = p.read();
            let patched = match kind {
                FixupKind::Branch26 => insn | (words & 0x03FF_FFFF),
                FixupKind::Branch19 => insn | ((words & 0x7_FFFF) << 5),
            };
            p.write(patched);
        }
    }

    fn branch_to(&mut self, label: Label, template: u32, kind: FixupKind) {
        let site = self.cursor();
        match self.labels[label.0].target {
            Some(target) => {
                let words = ((target as i64 - site as i64) / 4) as u32;
                let word = match kind {
                    FixupKind::Branch26 => template | (words & 0x03FF_FFFF),
                    FixupKind::Branch19 => template | ((words & 0x7_FFFF) << 5),
                };
                self.emit(word);
            }
            None => {
                self.labels[label.0].fixups.push((site, kind));
                self.emit(template);
            }
        }
    }

    // ===== Moves and constants =====

    pub fn movz(&mut self, rd: XReg, imm16: u16, shift: u32) {
        self.emit(0xD280_0000 | (shift / 16) << 21 | (imm16 as u32) << 5 | rd.0 as u32);
    }

    pub fn movk(&mut self, rd: XReg, imm16: u16, shift: u32) {
        self.emit(0xF280_0000 | (shift / 16) << 21 | (imm16 as u32) << 5 | rd.0 as u32);
    }

    pub fn movn(&mut self, rd: XReg, imm16: u16, shift: u32) {
        self.emit(0x9280_0000 | (shift / 16) << 21 | (imm16 as u32) << 5 | rd.0 as u32);
    }

    /// Materialize an arbitrary 64-bit constant with movz/movk
    pub fn load_constant(&mut self, rd: XReg, value: u64) {
        if value == 0 {
            self.movz(rd, 0, 0);
            return;
        }
        let mut first = true;
        for part in 0..4 {
            let quad = ((value >> (part * 16)) & 0xFFFF) as u16;
            if quad != 0 {
                if first {
                    self.movz(rd, quad, part * 16);
                    first = false;
                } else {
                    self.movk(rd, quad, part * 16);
                }
            }
        }
    }

    /// `mov xd, xm` (register move; not valid for SP)
    pub fn mov(&mut self, rd: XReg, rm: XReg) {
        self.orr(rd, XZR, rm);
    }

    /// `mov wd, wm`: 32-bit move, zeroing the upper half
    pub fn mov32(&mut self, rd: XReg, rm: XReg) {
        self.emit(0x2A00_03E0 | (rm.0 as u32) << 16 | rd.0 as u32);
    }

    /// `mov xd, sp` / `mov sp, xn` via `add #0`
    pub fn mov_sp(&mut self, rd: XReg, rn: XReg) {
        self.add_imm(rd, rn, 0);
    }

    // ===== Integer ALU =====

    pub fn add(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0x8B00_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn add32(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0x0B00_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn sub(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0xCB00_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn sub32(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0x4B00_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn subs(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0xEB00_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn cmp(&mut self, rn: XReg, rm: XReg) {
        self.subs(XZR, rn, rm);
    }

    pub fn add_imm(&mut self, rd: XReg, rn: XReg, imm12: u32) {
        debug_assert!(imm12 < 4096);
        self.emit(0x9100_0000 | imm12 << 10 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn sub_imm(&mut self, rd: XReg, rn: XReg, imm12: u32) {
        debug_assert!(imm12 < 4096);
        self.emit(0xD100_0000 | imm12 << 10 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `add xd, xn, xm, uxtx` — the form that accepts SP
    pub fn add_ext(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0x8B20_6000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `sub xd, xn, xm, uxtx` — the form that accepts SP
    pub fn sub_ext(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0xCB20_6000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn cmp_imm(&mut self, rn: XReg, imm12: u32) {
        debug_assert!(imm12 < 4096);
        self.emit(0xF100_0000 | imm12 << 10 | (rn.0 as u32) << 5 | 31);
    }

    pub fn and(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0x8A00_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn orr(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0xAA00_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn eor(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0xCA00_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn orn(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0xAA20_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `mvn xd, xm`
    pub fn mvn(&mut self, rd: XReg, rm: XReg) {
        self.orn(rd, XZR, rm);
    }

    pub fn neg(&mut self, rd: XReg, rm: XReg) {
        self.sub(rd, XZR, rm);
    }

    pub fn lslv(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0x9AC0_2000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn lsrv(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0x9AC0_2400 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn asrv(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0x9AC0_2800 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `lsl xd, xn, #shift`
    pub fn lsl_imm(&mut self, rd: XReg, rn: XReg, shift: u32) {
        debug_assert!(shift < 64);
        let immr = (64 - shift) & 63;
        let imms = 63 - shift;
        self.emit(0xD340_0000 | immr << 16 | imms << 10 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `lsr xd, xn, #shift`
    pub fn lsr_imm(&mut self, rd: XReg, rn: XReg, shift: u32) {
        debug_assert!(shift < 64);
        self.emit(0xD340_0000 | shift << 16 | 63 << 10 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn udiv(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0x9AC0_0800 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn sdiv(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0x9AC0_0C00 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn madd(&mut self, rd: XReg, rn: XReg, rm: XReg, ra: XReg) {
        self.emit(
            0x9B00_0000
                | (rm.0 as u32) << 16
                | (ra.0 as u32) << 10
                | (rn.0 as u32) << 5
                | rd.0 as u32,
        );
    }

    pub fn msub(&mut self, rd: XReg, rn: XReg, rm: XReg, ra: XReg) {
        self.emit(
            0x9B00_8000
                | (rm.0 as u32) << 16
                | (ra.0 as u32) << 10
                | (rn.0 as u32) << 5
                | rd.0 as u32,
        );
    }

    pub fn mul(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.madd(rd, rn, rm, XZR);
    }

    pub fn umulh(&mut self, rd: XReg, rn: XReg, rm: XReg) {
        self.emit(0x9BC0_7C00 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn csel(&mut self, rd: XReg, rn: XReg, rm: XReg, cond: Cond) {
        self.emit(
            0x9A80_0000
                | (rm.0 as u32) << 16
                | (cond as u32) << 12
                | (rn.0 as u32) << 5
                | rd.0 as u32,
        );
    }

    pub fn cset(&mut self, rd: XReg, cond: Cond) {
        self.emit(0x9A9F_07E0 | (cond.invert() as u32) << 12 | rd.0 as u32);
    }

    pub fn uxtb(&mut self, rd: XReg, rn: XReg) {
        self.emit(0x5300_1C00 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn uxth(&mut self, rd: XReg, rn: XReg) {
        self.emit(0x5300_3C00 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    pub fn sxtw(&mut self, rd: XReg, rn: XReg) {
        self.emit(0x9340_7C00 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    // ===== Loads and stores =====

    /// `ldr`-class load of `size` bytes with an unsigned scaled offset
    pub fn ldr(&mut self, size: u8, rt: XReg, rn: XReg, offset: u32) {
        let (base, scale): (u32, u32) = match size {
            1 => (0x3940_0000, 0),
            2 => (0x7940_0000, 1),
            4 => (0xB940_0000, 2),
            8 => (0xF940_0000, 3),
            _ => unreachable!("bad load size"),
        };
        debug_assert_eq!(offset & ((1 << scale) - 1), 0);
        let imm12 = offset >> scale;
        debug_assert!(imm12 < 4096);
        self.emit(base | imm12 << 10 | (rn.0 as u32) << 5 | rt.0 as u32);
    }

    /// `str`-class store of `size` bytes with an unsigned scaled offset
    pub fn str(&mut self, size: u8, rt: XReg, rn: XReg, offset: u32) {
        let (base, scale): (u32, u32) = match size {
            1 => (0x3900_0000, 0),
            2 => (0x7900_0000, 1),
            4 => (0xB900_0000, 2),
            8 => (0xF900_0000, 3),
            _ => unreachable!("bad store size"),
        };
        debug_assert_eq!(offset & ((1 << scale) - 1), 0);
        let imm12 = offset >> scale;
        debug_assert!(imm12 < 4096);
        self.emit(base | imm12 << 10 | (rn.0 as u32) << 5 | rt.0 as u32);
    }

    pub fn ldr_q(&mut self, vt: VReg, rn: XReg, offset: u32) {
        debug_assert_eq!(offset % 16, 0);
        self.emit(0x3DC0_0000 | (offset / 16) << 10 | (rn.0 as u32) << 5 | vt.0 as u32);
    }

    pub fn str_q(&mut self, vt: VReg, rn: XReg, offset: u32) {
        debug_assert_eq!(offset % 16, 0);
        self.emit(0x3D80_0000 | (offset / 16) << 10 | (rn.0 as u32) << 5 | vt.0 as u32);
    }

    pub fn stp(&mut self, rt: XReg, rt2: XReg, rn: XReg, offset: i32) {
        debug_assert_eq!(offset % 8, 0);
        let imm7 = ((offset / 8) as u32) & 0x7F;
        self.emit(
            0xA900_0000 | imm7 << 15 | (rt2.0 as u32) << 10 | (rn.0 as u32) << 5 | rt.0 as u32,
        );
    }

    pub fn ldp(&mut self, rt: XReg, rt2: XReg, rn: XReg, offset: i32) {
        debug_assert_eq!(offset % 8, 0);
        let imm7 = ((offset / 8) as u32) & 0x7F;
        self.emit(
            0xA940_0000 | imm7 << 15 | (rt2.0 as u32) << 10 | (rn.0 as u32) << 5 | rt.0 as u32,
        );
    }

    /// `stp dt, dt2, [rn, #offset]` (64-bit FP pair)
    pub fn stp_d(&mut self, vt: VReg, vt2: VReg, rn: XReg, offset: i32) {
        debug_assert_eq!(offset % 8, 0);
        let imm7 = ((offset / 8) as u32) & 0x7F;
        self.emit(
            0x6D00_0000 | imm7 << 15 | (vt2.0 as u32) << 10 | (rn.0 as u32) << 5 | vt.0 as u32,
        );
    }

    /// `ldp dt, dt2, [rn, #offset]` (64-bit FP pair)
    pub fn ldp_d(&mut self, vt: VReg, vt2: VReg, rn: XReg, offset: i32) {
        debug_assert_eq!(offset % 8, 0);
        let imm7 = ((offset / 8) as u32) & 0x7F;
        self.emit(
            0x6D40_0000 | imm7 << 15 | (vt2.0 as u32) << 10 | (rn.0 as u32) << 5 | vt.0 as u32,
        );
    }

    pub fn stp_q(&mut self, vt: VReg, vt2: VReg, rn: XReg, offset: i32) {
        debug_assert_eq!(offset % 16, 0);
        let imm7 = ((offset / 16) as u32) & 0x7F;
        self.emit(
            0xAD00_0000 | imm7 << 15 | (vt2.0 as u32) << 10 | (rn.0 as u32) << 5 | vt.0 as u32,
        );
    }

    pub fn ldp_q(&mut self, vt: VReg, vt2: VReg, rn: XReg, offset: i32) {
        debug_assert_eq!(offset % 16, 0);
        let imm7 = ((offset / 16) as u32) & 0x7F;
        self.emit(
            0xAD40_0000 | imm7 << 15 | (vt2.0 as u32) << 10 | (rn.0 as u32) << 5 | vt.0 as u32,
        );
    }

    /// `ldr xt, [pc + offset]` at emission time via label-free displacement
    pub fn ldr_literal(&mut self, rt: XReg, offset_bytes: i64) {
        self.emit(encode_ldr_literal(rt, offset_bytes));
    }

    // ===== Acquire/release and exclusives =====

    pub fn ldar(&mut self, size: u8, rt: XReg, rn: XReg) {
        let base: u32 = match size {
            1 => 0x08DF_FC00,
            2 => 0x48DF_FC00,
            4 => 0x88DF_FC00,
            8 => 0xC8DF_FC00,
            _ => unreachable!("bad ldar size"),
        };
        self.emit(base | (rn.0 as u32) << 5 | rt.0 as u32);
    }

    pub fn stlr(&mut self, size: u8, rt: XReg, rn: XReg) {
        let base: u32 = match size {
            1 => 0x089F_FC00,
            2 => 0x489F_FC00,
            4 => 0x889F_FC00,
            8 => 0xC89F_FC00,
            _ => unreachable!("bad stlr size"),
        };
        self.emit(base | (rn.0 as u32) << 5 | rt.0 as u32);
    }

    pub fn ldaxr(&mut self, size: u8, rt: XReg, rn: XReg) {
        let base: u32 = match size {
            1 => 0x085F_FC00,
            2 => 0x485F_FC00,
            4 => 0x885F_FC00,
            8 => 0xC85F_FC00,
            _ => unreachable!("bad ldaxr size"),
        };
        self.emit(base | (rn.0 as u32) << 5 | rt.0 as u32);
    }

    pub fn stlxr(&mut self, size: u8, rs: XReg, rt: XReg, rn: XReg) {
        let base: u32 = match size {
            1 => 0x0800_FC00,
            2 => 0x4800_FC00,
            4 => 0x8800_FC00,
            8 => 0xC800_FC00,
            _ => unreachable!("bad stlxr size"),
        };
        self.emit(base | (rs.0 as u32) << 16 | (rn.0 as u32) << 5 | rt.0 as u32);
    }

    pub fn clrex(&mut self) {
        self.emit(0xD503_3F5F);
    }

    pub fn dmb(&mut self, barrier: Barrier) {
        self.emit(match barrier {
            Barrier::InnerShareable => 0xD503_3BBF,
            Barrier::InnerShareableLoads => 0xD503_39BF,
            Barrier::InnerShareableStores => 0xD503_3ABF,
        });
    }

    // ===== Branches =====

    pub fn b_label(&mut self, label: Label) {
        self.branch_to(label, 0x1400_0000, FixupKind::Branch26);
    }

    pub fn b_offset(&mut self, offset_bytes: i64) {
        self.emit(encode_b(offset_bytes));
    }

    pub fn cbz_label(&mut self, rt: XReg, label: Label) {
        self.branch_to(label, 0xB400_0000 | rt.0 as u32, FixupKind::Branch19);
    }

    pub fn cbnz_label(&mut self, rt: XReg, label: Label) {
        self.branch_to(label, 0xB500_0000 | rt.0 as u32, FixupKind::Branch19);
    }

    pub fn cbz32_label(&mut self, rt: XReg, label: Label) {
        self.branch_to(label, 0x3400_0000 | rt.0 as u32, FixupKind::Branch19);
    }

    pub fn cbnz32_label(&mut self, rt: XReg, label: Label) {
        self.branch_to(label, 0x3500_0000 | rt.0 as u32, FixupKind::Branch19);
    }

    pub fn bcond_label(&mut self, cond: Cond, label: Label) {
        self.branch_to(label, 0x5400_0000 | cond as u32, FixupKind::Branch19);
    }

    pub fn br(&mut self, rn: XReg) {
        self.emit(0xD61F_0000 | (rn.0 as u32) << 5);
    }

    pub fn blr(&mut self, rn: XReg) {
        self.emit(encode_blr(rn));
    }

    pub fn bl_offset(&mut self, offset_bytes: i64) {
        let words = offset_bytes / 4;
        debug_assert!((-(1 << 25)..(1 << 25)).contains(&words));
        self.emit(0x9400_0000 | ((words as u32) & 0x03FF_FFFF));
    }

    pub fn ret(&mut self) {
        self.emit(0xD65F_03C0);
    }

    // ===== Vector =====

    /// `movi vd.2d, #0`
    pub fn movi_zero(&mut self, vd: VReg) {
        self.emit(0x6F00_E400 | vd.0 as u32);
    }

    /// `mov vd.16b, vn.16b`
    pub fn mov_v(&mut self, vd: VReg, vn: VReg) {
        self.emit(0x4EA0_1C00 | (vn.0 as u32) << 16 | (vn.0 as u32) << 5 | vd.0 as u32);
    }

    pub fn eor_v(&mut self, vd: VReg, vn: VReg, vm: VReg) {
        self.emit(0x6E20_1C00 | (vm.0 as u32) << 16 | (vn.0 as u32) << 5 | vd.0 as u32);
    }

    /// Element-wise integer add; `elem_size` in bytes (1/2/4/8)
    pub fn add_v(&mut self, elem_size: u8, vd: VReg, vn: VReg, vm: VReg) {
        let size: u32 = match elem_size {
            1 => 0,
            2 => 1,
            4 => 2,
            8 => 3,
            _ => unreachable!("bad vector element size"),
        };
        self.emit(
            0x4E20_8400 | size << 22 | (vm.0 as u32) << 16 | (vn.0 as u32) << 5 | vd.0 as u32,
        );
    }

    /// `umov xd, vn.d[index]`
    pub fn umov_d(&mut self, rd: XReg, vn: VReg, index: u8) {
        let imm5 = 0b01000u32 | ((index as u32) << 4);
        self.emit(0x4E00_3C00 | imm5 << 16 | (vn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `umov wd, vn.h[index]`
    pub fn umov_h(&mut self, rd: XReg, vn: VReg, index: u8) {
        let imm5 = 0b00010u32 | ((index as u32) << 2);
        self.emit(0x0E00_3C00 | imm5 << 16 | (vn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `ins vd.d[index], xn`
    pub fn ins_d(&mut self, vd: VReg, index: u8, rn: XReg) {
        let imm5 = 0b01000u32 | ((index as u32) << 4);
        self.emit(0x4E00_1C00 | imm5 << 16 | (rn.0 as u32) << 5 | vd.0 as u32);
    }

    /// `ins vd.h[index], wn`
    pub fn ins_h(&mut self, vd: VReg, index: u8, rn: XReg) {
        let imm5 = 0b00010u32 | ((index as u32) << 2);
        self.emit(0x4E00_1C00 | imm5 << 16 | (rn.0 as u32) << 5 | vd.0 as u32);
    }

    /// `fmov sd, sn`
    pub fn fmov_s(&mut self, vd: VReg, vn: VReg) {
        self.emit(0x1E20_4020 | (vn.0 as u32) << 5 | vd.0 as u32);
    }

    /// `fmov dd, dn`
    pub fn fmov_d(&mut self, vd: VReg, vn: VReg) {
        self.emit(0x1E60_4020 | (vn.0 as u32) << 5 | vd.0 as u32);
    }

    /// `fmov dd, xn`
    pub fn fmov_d_from_x(&mut self, vd: VReg, rn: XReg) {
        self.emit(0x9E67_0000 | (rn.0 as u32) << 5 | vd.0 as u32);
    }

    /// `fmov xd, dn`
    pub fn fmov_x_from_d(&mut self, rd: XReg, vn: VReg) {
        self.emit(0x9E66_0000 | (vn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `fmov sd, wn`
    pub fn fmov_s_from_w(&mut self, vd: VReg, rn: XReg) {
        self.emit(0x1E27_0000 | (rn.0 as u32) << 5 | vd.0 as u32);
    }

    /// `fmov wd, sn`
    pub fn fmov_w_from_s(&mut self, rd: XReg, vn: VReg) {
        self.emit(0x1E26_0000 | (vn.0 as u32) << 5 | rd.0 as u32);
    }

    // ===== System =====

    pub fn nop(&mut self) {
        self.emit(0xD503_201F);
    }

    pub fn hlt(&mut self, imm16: u16) {
        self.emit(0xD440_0000 | (imm16 as u32) << 5);
    }

    pub fn brk(&mut self, imm16: u16) {
        self.emit(0xD420_0000 | (imm16 as u32) << 5);
    }
}

// ===== Register-convention fragments =====
//
// These replace the original hand-written spill/fill trampolines: every stub
// that needs them emits the same sequences through the emitter.

use crate::state::{greg_offset, xmm_offset};

/// Store every statically-allocated guest register to the state frame.
pub fn emit_spill_static_regs(e: &mut A64Emitter) {
    for i in (0..16).step_by(2) {
        e.stp(SRA_GPR[i], SRA_GPR[i + 1], STATE, greg_offset(i));
    }
    for i in (0..16).step_by(2) {
        e.stp_q(SRA_FPR[i], SRA_FPR[i + 1], STATE, xmm_offset(i));
    }
}

/// Reload every statically-allocated guest register from the state frame.
pub fn emit_fill_static_regs(e: &mut A64Emitter) {
    for i in (0..16).step_by(2) {
        e.ldp(SRA_GPR[i], SRA_GPR[i + 1], STATE, greg_offset(i));
    }
    for i in (0..16).step_by(2) {
        e.ldp_q(SRA_FPR[i], SRA_FPR[i + 1], STATE, xmm_offset(i));
    }
}

/// Stack bytes used by `emit_push_dynamic_regs_lr`
pub const DYNAMIC_SPILL_BYTES: u32 = 208;

/// Push the caller-saved dynamic vector registers and the link register.
/// The dynamic GPR set is callee-saved, so helpers preserve it on their own.
pub fn emit_push_dynamic_regs_lr(e: &mut A64Emitter) {
    e.sub_imm(SP, SP, DYNAMIC_SPILL_BYTES);
    for i in (0..RA_FPR.len()).step_by(2) {
        e.stp_q(RA_FPR[i], RA_FPR[i + 1], SP, (i as i32) * 16);
    }
    e.str(8, LR, SP, 192);
}

/// Undo `emit_push_dynamic_regs_lr`.
pub fn emit_pop_dynamic_regs_lr(e: &mut A64Emitter) {
    e.ldr(8, LR, SP, 192);
    for i in (0..RA_FPR.len()).step_by(2) {
        e.ldp_q(RA_FPR[i], RA_FPR[i + 1], SP, (i as i32) * 16);
    }
    e.add_imm(SP, SP, DYNAMIC_SPILL_BYTES);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(f: impl FnOnce(&mut A64Emitter)) -> Vec<u32> {
        let mut buf = CodeBuffer::new(4096).unwrap();
        let base = buf.cursor_address();
        {
            let mut e = A64Emitter::new(&mut buf);
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
            e.movz(X0, 0x1234, 0);
            e.add(X1, X2, X3);
            e.ldr(8, X0, STATE, 8);
            e.str(8, X0, STATE, 8);
            e.ret();
            e.nop();
        });
        assert_eq!(words[0], 0xD282_4680);
        assert_eq!(words[1], 0x8B03_0041);
        assert_eq!(words[2], 0xF940_0780); // ldr x0, [x28, #8]
        assert_eq!(words[3], 0xF900_0780); // str x0, [x28, #8]
        assert_eq!(words[4], 0xD65F_03C0);
        assert_eq!(words[5], 0xD503_201F);
    }

    #[test]
    fn test_load_constant_is_minimal() {
        let words = emitted(|e| e.load_constant(X0, 0x7));
        assert_eq!(words, vec![0xD280_00E0]); // movz x0, #7

        let words = emitted(|e| e.load_constant(X1, 0x1_0000));
        assert_eq!(words, vec![0xD2A0_0021]); // movz x1, #1, lsl #16

        let words = emitted(|e| e.load_constant(X2, 0xDEAD_BEEF));
        assert_eq!(words.len(), 2); // movz + movk
    }

    #[test]
    fn test_forward_label_branch() {
        let words = emitted(|e| {
            let skip = e.new_label();
            e.cbz_label(X0, skip);
            e.nop();
            e.nop();
            e.bind(skip);
            e.ret();
        });
        // cbz x0, +12 bytes = 3 words
        assert_eq!(words[0], 0xB400_0000 | (3 << 5));
    }

    #[test]
    fn test_backward_label_branch() {
        let words = emitted(|e| {
            let top = e.new_label();
            e.bind(top);
            e.nop();
            e.b_label(top);
        });
        // b -4 bytes = -1 word
        assert_eq!(words[1], 0x1400_0000 | 0x03FF_FFFF);
    }

    #[test]
    fn test_branch26_encoding_round_trip() {
        assert_eq!(encode_b(0x100), 0x1400_0000 | 0x40);
        assert_eq!(encode_b(-4), 0x17FF_FFFF);
        assert!(branch_offset_fits(0x1000, 0x1000 + (1 << 27) - 4));
        assert!(!branch_offset_fits(0x1000, 0x1000 + (1 << 28)));
    }

    #[test]
    fn test_exclusive_encodings() {
        let words = emitted(|e| {
            e.ldaxr(8, X0, X1);
            e.stlxr(4, X2, X3, X1);
            e.clrex();
            e.dmb(Barrier::InnerShareable);
        });
        assert_eq!(words[0], 0xC85F_FC20);
        assert_eq!(words[1], 0x8802_FC23);
        assert_eq!(words[2], 0xD503_3F5F);
        assert_eq!(words[3], 0xD503_3BBF);
    }

    #[test]
    fn test_vector_encodings() {
        let words = emitted(|e| {
            e.movi_zero(VReg(16));
            e.umov_d(X0, VReg(16), 0);
            e.umov_h(X1, VReg(16), 4);
            e.ins_d(VReg(17), 0, X0);
            e.add_v(8, VReg(2), VReg(3), VReg(4));
        });
        assert_eq!(words[0], 0x6F00_E410);
        assert_eq!(words[1], 0x4E08_3E00);
        assert_eq!(words[2], 0x0E12_3E01);
        assert_eq!(words[3], 0x4E08_1C11);
        assert_eq!(words[4], 0x4EE4_8462);
    }

    #[test]
    fn test_cond_invert() {
        assert_eq!(Cond::Eq.invert(), Cond::Ne);
        assert_eq!(Cond::Lt.invert(), Cond::Ge);
        assert_eq!(Cond::Al.invert(), Cond::Al);
    }

    #[test]
    fn test_spill_fill_are_symmetric() {
        let spill = emitted(emit_spill_static_regs);
        let fill = emitted(emit_fill_static_regs);
        assert_eq!(spill.len(), 16); // 8 GPR pairs + 8 vector pairs
        assert_eq!(fill.len(), 16);
        // A fill is the spill with the load bit set
        for (s, f) in spill.iter().zip(fill.iter()) {
            assert_eq!(s | 1 << 22, *f);
        }
    }

    #[test]
    fn test_push_pop_dynamic_balance() {
        let push = emitted(emit_push_dynamic_regs_lr);
        let pop = emitted(emit_pop_dynamic_regs_lr);
        assert_eq!(push.len(), pop.len());
        // First push insn adjusts SP down, last pop insn adjusts it back up
        assert_eq!(push[0], 0xD100_0000 | DYNAMIC_SPILL_BYTES << 10 | 31 << 5 | 31);
        assert_eq!(*pop.last().unwrap(), 0x9100_0000 | DYNAMIC_SPILL_BYTES << 10 | 31 << 5 | 31);
    }

    #[test]
    fn test_sra_convention_reserves_state_and_temps() {
        // The state pointer and the x0..x3 scratch set must never appear in
        // any allocatable or statically-assigned set.
        for r in SRA_GPR.iter().chain(RA_GPR.iter()) {
            assert_ne!(r.0, STATE.0);
            assert!(r.0 > 3, "x0..x3 are scratch");
        }
        assert_eq!(SRA_GPR.len(), 16);
    }
}
