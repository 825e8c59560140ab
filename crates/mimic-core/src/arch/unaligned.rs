//! Unaligned-atomic fault emulation
//!
//! RISC-V hosts raise SIGBUS (`BUS_ADRALN`) when a `lr`/`sc` with
//! acquire-release semantics touches an unaligned address, which x86 guests
//! produce freely. The handler decodes the faulting instruction, emulates
//! the access with the strongest fencing the address pattern requires, and
//! resumes past it. Store-conditionals always claim success so the guest's
//! LR/SC loop makes forward progress.
//!
//! AArch64 hosts classify the equivalent faults through the ESR register
//! (see `mcontext::protect_flags_from_esr`); alignment fixups there are
//! handled by hardware.

use crate::telemetry::{self, Counter};
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// How an unaligned access of a given width must be emulated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessClass {
    /// Fits an 8-byte line: one 64-bit atomic at the aligned base covers it
    Aligned64,
    /// Crosses an 8-byte boundary but stays inside a 16-byte window; needs a
    /// 128-bit primitive, emulated with fences until one exists
    Split16,
    /// Crosses the 16-byte window: a split lock, fenced non-atomic
    SplitLock,
}

/// Classify a 4-byte access at `addr`.
pub fn classify32(addr: u64) -> AccessClass {
    if addr & 0b1111 > 12 {
        AccessClass::SplitLock
    } else if addr & 0b111 >= 5 {
        AccessClass::Split16
    } else {
        AccessClass::Aligned64
    }
}

/// Classify an 8-byte access at `addr`.
pub fn classify64(addr: u64) -> AccessClass {
    if addr & 0b1111 > 8 {
        AccessClass::SplitLock
    } else {
        AccessClass::Split16
    }
}

/// Kind of faulting AMO instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmoKind {
    LoadReserved,
    StoreConditional,
}

/// Decoded fields of a faulting `lr`/`sc` instruction
#[derive(Debug, Clone, Copy)]
pub struct AmoOp {
    pub kind: AmoKind,
    /// Access width in bytes (4 or 8)
    pub size: u32,
    pub addr_reg: u32,
    pub dest_reg: u32,
    pub data_reg: u32,
}

use super::riscv::{AMO_OP_LR_AQRL, AMO_OP_MASK, AMO_OP_SC_AQRL};

/// Decode a faulting instruction word if it is an aq/rl LR or SC.
pub fn decode_amo(instr: u32) -> Option<AmoOp> {
    let kind = match instr & AMO_OP_MASK {
        AMO_OP_LR_AQRL => AmoKind::LoadReserved,
        AMO_OP_SC_AQRL => AmoKind::StoreConditional,
        _ => return None,
    };
    Some(AmoOp {
        kind,
        size: 1 << ((instr & 0x7000) >> 12),
        addr_reg: (instr >> 15) & 0x1F,
        dest_reg: (instr >> 7) & 0x1F,
        data_reg: (instr >> 20) & 0x1F,
    })
}

/// Outcome of the unfinished forward scan over an LR/SC sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOperation {
    None,
    FetchAdd,
}

/// Scan forward from the instruction after a faulting LR for the matching
/// SC, bounded to ten instructions.
///
/// TODO: infer the ALU operation between the LR and the SC so wide
/// emulation can replay it as a single fetch-op; only the terminating-SC
/// scan is implemented.
pub fn find_atomic_operation(window: &[u32]) -> AtomicOperation {
    for &instr in window.iter().take(10) {
        if instr & AMO_OP_MASK == AMO_OP_SC_AQRL {
            return AtomicOperation::None;
        }
    }
    AtomicOperation::None
}

fn pre_fence(paranoid: bool) {
    // rw,rw on the way in regardless; paranoid keeps the same strength
    let _ = paranoid;
    fence(Ordering::SeqCst);
}

fn post_load_fence(paranoid: bool) {
    if paranoid {
        fence(Ordering::SeqCst);
    } else {
        // r,rw
        fence(Ordering::Acquire);
    }
}

/// Fenced non-atomic 4-byte load
///
/// # Safety
/// `addr` must be readable for 4 bytes.
pub unsafe fn load_fence_32(addr: u64, paranoid: bool) -> u32 {
    pre_fence(paranoid);
    let value = (addr as *const u32).read_volatile();
    post_load_fence(paranoid);
    value
}

/// Fenced non-atomic 8-byte load
///
/// # Safety
/// `addr` must be readable for 8 bytes.
pub unsafe fn load_fence_64(addr: u64, paranoid: bool) -> u64 {
    pre_fence(paranoid);
    let value = (addr as *const u64).read_volatile();
    post_load_fence(paranoid);
    value
}

/// Fenced non-atomic 4-byte store
///
/// # Safety
/// `addr` must be writable for 4 bytes.
pub unsafe fn store_fence_32(value: u32, addr: u64, paranoid: bool) {
    if paranoid {
        fence(Ordering::SeqCst);
    } else {
        // rw,w
        fence(Ordering::Release);
    }
    (addr as *mut u32).write_volatile(value);
    if paranoid {
        fence(Ordering::SeqCst);
    }
}

/// Fenced non-atomic 8-byte store
///
/// # Safety
/// `addr` must be writable for 8 bytes.
pub unsafe fn store_fence_64(value: u64, addr: u64, paranoid: bool) {
    if paranoid {
        fence(Ordering::SeqCst);
    } else {
        fence(Ordering::Release);
    }
    (addr as *mut u64).write_volatile(value);
    if paranoid {
        fence(Ordering::SeqCst);
    }
}

/// Emulate an unaligned 4-byte atomic load.
///
/// # Safety
/// The containing 8- or 16-byte window at `addr` must be mapped readable.
pub unsafe fn emulate_load_32(addr: u64, paranoid: bool) -> u32 {
    match classify32(addr) {
        AccessClass::SplitLock => {
            telemetry::global().increment(Counter::SplitLocks);
            load_fence_32(addr, paranoid)
        }
        AccessClass::Split16 => {
            // Needs a 128-bit load; fenced until one is available
            telemetry::global().increment(Counter::SplitLock16B);
            load_fence_32(addr, paranoid)
        }
        AccessClass::Aligned64 => {
            // Fits an 8-byte line: one 64-bit atomic load, shift the lane out
            let alignment = addr & 0b111;
            let base = addr & !0b111;
            let wide = (*(base as *const AtomicU64)).load(Ordering::SeqCst);
            (wide >> (alignment * 8)) as u32
        }
    }
}

/// Emulate an unaligned 8-byte atomic load.
///
/// # Safety
/// The containing 16-byte window at `addr` must be mapped readable.
pub unsafe fn emulate_load_64(addr: u64, paranoid: bool) -> u64 {
    match classify64(addr) {
        AccessClass::SplitLock => {
            telemetry::global().increment(Counter::SplitLocks);
            load_fence_64(addr, paranoid)
        }
        _ => {
            // Fits a 16-byte window; still no 128-bit primitive, so fenced
            telemetry::global().increment(Counter::SplitLock16B);
            load_fence_64(addr, paranoid)
        }
    }
}

/// Emulate an unaligned 4-byte store-conditional. Returns the SC status
/// value: always 0 (success) to guarantee forward progress.
///
/// # Safety
/// The containing window at `addr` must be mapped writable.
pub unsafe fn emulate_store_32(value: u32, addr: u64, paranoid: bool) -> u32 {
    match classify32(addr) {
        AccessClass::SplitLock => {
            telemetry::global().increment(Counter::SplitLocks);
        }
        AccessClass::Split16 => {
            telemetry::global().increment(Counter::SplitLock16B);
        }
        AccessClass::Aligned64 => {}
    }
    store_fence_32(value, addr, paranoid);
    0
}

/// Emulate an unaligned 8-byte store-conditional. Always succeeds.
///
/// # Safety
/// The containing window at `addr` must be mapped writable.
pub unsafe fn emulate_store_64(value: u64, addr: u64, paranoid: bool) -> u32 {
    match classify64(addr) {
        AccessClass::SplitLock => {
            telemetry::global().increment(Counter::SplitLocks);
        }
        _ => {
            telemetry::global().increment(Counter::SplitLock16B);
        }
    }
    store_fence_64(value, addr, paranoid);
    0
}

/// Handle a SIGBUS raised inside JIT code on a RISC-V host.
///
/// Returns true when the fault was an alignment fault on an aq/rl LR/SC and
/// was fully emulated; the interrupted PC has then been advanced past the
/// faulting instruction.
///
/// # Safety
/// Must be called from a signal handler with the live `siginfo_t` and
/// `ucontext_t` for a fault whose PC is inside JIT code.
#[cfg(all(unix, target_arch = "riscv64"))]
pub unsafe fn handle_sigbus(
    paranoid_tso: bool,
    info: *const libc::siginfo_t,
    ucontext: *mut libc::c_void,
) -> bool {
    use super::mcontext;

    const BUS_ADRALN: i32 = 1;
    if (*info).si_code != BUS_ADRALN {
        // Only alignment problems are recoverable here
        return false;
    }

    let pc = mcontext::get_pc(ucontext);
    let instr = (pc as *const u32).read();
    let Some(op) = decode_amo(instr) else {
        return false;
    };

    let addr = mcontext::get_host_gpr(ucontext, op.addr_reg);

    match (op.kind, op.size) {
        (AmoKind::LoadReserved, 4) => {
            let _ = find_atomic_operation(std::slice::from_raw_parts((pc + 4) as *const u32, 10));
            let value = emulate_load_32(addr, paranoid_tso);
            mcontext::set_host_gpr(ucontext, op.dest_reg, value as u64);
        }
        (AmoKind::LoadReserved, 8) => {
            let value = emulate_load_64(addr, paranoid_tso);
            mcontext::set_host_gpr(ucontext, op.dest_reg, value);
        }
        (AmoKind::StoreConditional, 4) => {
            let data = mcontext::get_host_gpr(ucontext, op.data_reg) as u32;
            let status = emulate_store_32(data, addr, paranoid_tso);
            mcontext::set_host_gpr(ucontext, op.dest_reg, status as u64);
        }
        (AmoKind::StoreConditional, 8) => {
            let data = mcontext::get_host_gpr(ucontext, op.data_reg);
            let status = emulate_store_64(data, addr, paranoid_tso);
            mcontext::set_host_gpr(ucontext, op.dest_reg, status as u64);
        }
        _ => return false,
    }

    #[cfg(debug_assertions)]
    eprintln!("unaligned AMO at {:#x}, skipping to {:#x}", pc, pc + 4);

    mcontext::set_pc(ucontext, pc + 4);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codebuf::CodeBuffer;

    #[test]
    fn test_classify32_decision_tree() {
        // Inside an 8-byte line
        for offset in [0u64, 1, 2, 3, 4, 8, 12] {
            assert_eq!(classify32(0x1000 + offset), AccessClass::Aligned64, "offset {offset}");
        }
        // Crossing 8 bytes, within 16
        for offset in [5u64, 6, 7] {
            assert_eq!(classify32(0x1000 + offset), AccessClass::Split16, "offset {offset}");
        }
        // Crossing the 16-byte window
        for offset in [13u64, 14, 15] {
            assert_eq!(classify32(0x1000 + offset), AccessClass::SplitLock, "offset {offset}");
        }
    }

    #[test]
    fn test_classify64_decision_tree() {
        for offset in [0u64, 1, 4, 8] {
            assert_eq!(classify64(0x1000 + offset), AccessClass::Split16, "offset {offset}");
        }
        for offset in [9u64, 12, 15] {
            assert_eq!(classify64(0x1000 + offset), AccessClass::SplitLock, "offset {offset}");
        }
    }

    #[test]
    fn test_decode_amo_from_emitted_instructions() {
        use crate::arch::riscv::{RvEmitter, A0, T0, T1};
        let mut buf = CodeBuffer::new(4096).unwrap();
        let base = buf.cursor_address();
        {
            let mut e = RvEmitter::new(&mut buf);
            e.lr_aqrl(4, T0, A0);
            e.sc_aqrl(8, T0, T1, A0);
            e.add(T0, T0, T1);
        }
        let words: Vec<u32> = buf
            .bytes_at(base, 12)
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();

        let lr = decode_amo(words[0]).unwrap();
        assert_eq!(lr.kind, AmoKind::LoadReserved);
        assert_eq!(lr.size, 4);
        assert_eq!(lr.addr_reg, 10);
        assert_eq!(lr.dest_reg, 5);

        let sc = decode_amo(words[1]).unwrap();
        assert_eq!(sc.kind, AmoKind::StoreConditional);
        assert_eq!(sc.size, 8);
        assert_eq!(sc.data_reg, 6);

        assert!(decode_amo(words[2]).is_none());
    }

    /// Memory window with a known 16-byte-aligned base
    #[repr(align(16))]
    struct Slab([u8; 32]);

    #[test]
    fn test_emulated_load_lanes() {
        let slab = Slab(std::array::from_fn(|i| i as u8));
        let base = slab.0.as_ptr() as u64;
        // Lane at offset 2 within an 8-byte line
        let value = unsafe { emulate_load_32(base + 2, false) };
        assert_eq!(value, u32::from_le_bytes([2, 3, 4, 5]));
        // Fenced path at offset 6 (crosses the 8-byte boundary)
        let value = unsafe { emulate_load_32(base + 6, false) };
        assert_eq!(value, u32::from_le_bytes([6, 7, 8, 9]));
    }

    #[test]
    fn test_sc_emulation_claims_success_and_counts() {
        let before = telemetry::global().get(Counter::SplitLock16B);
        let mut slab = Slab([0; 32]);
        let base = slab.0.as_mut_ptr() as u64;

        // Offset 6: crosses 8 bytes, fits in 16
        let status = unsafe { emulate_store_32(0xAABBCCDD, base + 6, false) };
        assert_eq!(status, 0, "SC emulation must claim success");
        assert_eq!(&slab.0[6..10], &0xAABB_CCDDu32.to_le_bytes());
        // The table is process-wide, so other tests may also be counting
        assert!(telemetry::global().get(Counter::SplitLock16B) >= before + 1);
    }

    #[test]
    fn test_split_lock_counts() {
        let before = telemetry::global().get(Counter::SplitLocks);
        let slab = Slab([0xFF; 32]);
        let base = slab.0.as_ptr() as u64;
        // Offset 13: crosses the 16-byte window
        let _ = unsafe { emulate_load_32(base + 13, true) };
        assert!(telemetry::global().get(Counter::SplitLocks) >= before + 1);
    }

    #[test]
    fn test_find_atomic_operation_bounded_scan() {
        use crate::arch::riscv::{RvEmitter, A0, T0, T1};
        let mut buf = CodeBuffer::new(4096).unwrap();
        let base = buf.cursor_address();
        {
            let mut e = RvEmitter::new(&mut buf);
            e.add(T0, T0, T1);
            e.sc_aqrl(4, T0, T1, A0);
        }
        let words: Vec<u32> = buf
            .bytes_at(base, 8)
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        // Inference is unimplemented; the scan only terminates the window
        assert_eq!(find_atomic_operation(&words), AtomicOperation::None);
        assert_eq!(find_atomic_operation(&[0; 4]), AtomicOperation::None);
    }
}
