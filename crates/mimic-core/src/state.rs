//! Guest CPU state frame
//!
//! One flat `CpuStateFrame` exists per guest thread and is addressable from
//! generated code through a fixed host register (the state pointer). At every
//! boundary between generated code and Rust the frame reflects the
//! architectural guest state exactly, except that statically-allocated guest
//! registers may live in host registers while inside JIT code; those are
//! spilled to the frame at every boundary and refilled on re-entry.

use std::sync::atomic::AtomicU32;

/// Guest general-purpose register indices into `CpuState::gregs`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rbx = 1,
    Rcx = 2,
    Rdx = 3,
    Rsi = 4,
    Rdi = 5,
    Rbp = 6,
    Rsp = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// Indices into `CpuState::flags`: one byte per decoded flag lane.
///
/// The x86 arithmetic flags sit at their EFLAGS bit positions; the x87 status
/// lanes live past them so the reconstructed FSW can be reassembled on demand.
pub mod flag {
    pub const CF: usize = 0;
    pub const PF: usize = 2;
    pub const AF: usize = 4;
    pub const ZF: usize = 6;
    pub const SF: usize = 7;
    pub const TF: usize = 8;
    pub const IF: usize = 9;
    pub const DF: usize = 10;
    pub const OF: usize = 11;

    pub const X87_C0: usize = 20;
    pub const X87_C1: usize = 21;
    pub const X87_C2: usize = 22;
    pub const X87_TOP: usize = 23;
    pub const X87_C3: usize = 24;

    pub const COUNT: usize = 48;
}

/// Architectural guest state, stored flat so generated code can address every
/// field with an immediate offset from the state pointer.
#[derive(Clone)]
#[repr(C, align(16))]
pub struct CpuState {
    pub rip: u64,
    pub gregs: [u64; 16],
    /// Keeps `xmm` 16-byte aligned for paired vector stores
    _pad0: u64,
    /// 16 128-bit SSE registers, low qword first
    pub xmm: [[u64; 2]; 16],
    /// x87 stack: 80-bit values in 128-bit slots (low 64 bits + high 16 bits)
    pub mm: [[u64; 2]; 8],
    /// Decoded flag lanes, one byte each (`flag::*`)
    pub flags: [u8; flag::COUNT],
    pub fcw: u16,
    pub ftw: u16,
    pub mxcsr: u32,
    pub fs_base: u64,
    pub gs_base: u64,
}

impl CpuState {
    pub fn new() -> Self {
        CpuState {
            rip: 0,
            gregs: [0; 16],
            _pad0: 0,
            xmm: [[0; 2]; 16],
            mm: [[0; 2]; 8],
            flags: [0; flag::COUNT],
            fcw: 0x037F,
            ftw: 0,
            mxcsr: 0x1F80,
            fs_base: 0,
            gs_base: 0,
        }
    }

    /// Reassemble the x87 status word from the decoded lanes.
    ///
    /// Top-of-stack lands in bits 11..13, C0/C1/C2 in bits 8/9/10, C3 in 14.
    pub fn reconstruct_fsw(&self) -> u16 {
        ((self.flags[flag::X87_TOP] as u16) << 11)
            | ((self.flags[flag::X87_C0] as u16) << 8)
            | ((self.flags[flag::X87_C1] as u16) << 9)
            | ((self.flags[flag::X87_C2] as u16) << 10)
            | ((self.flags[flag::X87_C3] as u16) << 14)
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of fallback-handler slots in the pointer table
pub const FALLBACK_HANDLER_COUNT: usize = 32;

/// Fixed-layout table of helper addresses inside the state frame.
///
/// JIT code reaches every helper through an immediate offset from the state
/// pointer; no absolute addresses are baked into generated blocks, so a
/// cache flush never invalidates helper plumbing.
#[derive(Clone)]
#[repr(C)]
pub struct PointerTable {
    pub dispatcher_loop_top: u64,
    pub dispatcher_loop_top_fill_sra: u64,
    pub exit_function_linker: u64,
    pub thread_stop_handler: u64,
    pub thread_stop_handler_spill_sra: u64,
    pub thread_pause_handler: u64,
    pub thread_pause_handler_spill_sra: u64,
    pub unimplemented_instruction_handler: u64,
    pub overflow_exception_handler: u64,
    pub signal_return_handler: u64,
    /// L1 lookup table base (`lookup::L1Entry` array)
    pub l1_pointer: u64,
    /// Address of the owning thread's `SignalHandlerRefCounter`
    pub signal_handler_refcount: u64,
    pub ludiv_handler: u64,
    pub ldiv_handler: u64,
    pub lurem_handler: u64,
    pub lrem_handler: u64,
    pub cpuid_obj: u64,
    pub cpuid_function: u64,
    pub syscall_obj: u64,
    pub syscall_function: u64,
    pub fallback_handlers: [u64; FALLBACK_HANDLER_COUNT],
}

impl PointerTable {
    pub fn new() -> Self {
        // Zeroed slots fault loudly if generated code ever calls through an
        // uninitialized entry.
        PointerTable {
            dispatcher_loop_top: 0,
            dispatcher_loop_top_fill_sra: 0,
            exit_function_linker: 0,
            thread_stop_handler: 0,
            thread_stop_handler_spill_sra: 0,
            thread_pause_handler: 0,
            thread_pause_handler_spill_sra: 0,
            unimplemented_instruction_handler: 0,
            overflow_exception_handler: 0,
            signal_return_handler: 0,
            l1_pointer: 0,
            signal_handler_refcount: 0,
            ludiv_handler: 0,
            ldiv_handler: 0,
            lurem_handler: 0,
            lrem_handler: 0,
            cpuid_obj: 0,
            cpuid_function: 0,
            syscall_obj: 0,
            syscall_function: 0,
            fallback_handlers: [0; FALLBACK_HANDLER_COUNT],
        }
    }
}

impl Default for PointerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Signal-driven thread control events (`CpuStateFrame::signal_reason`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SignalEvent {
    None = 0,
    Pause = 1,
    Stop = 2,
    Return = 3,
}

impl SignalEvent {
    pub fn from_u32(v: u32) -> SignalEvent {
        match v {
            1 => SignalEvent::Pause,
            2 => SignalEvent::Stop,
            3 => SignalEvent::Return,
            _ => SignalEvent::None,
        }
    }
}

/// Slots in `CpuStateFrame::jump_anchor`: enough for every callee-saved GPR
/// and FPR half, the frame pointer, and the link register on either host ISA.
pub const JUMP_ANCHOR_SLOTS: usize = 24;

/// The per-thread frame shared between Rust and generated code.
///
/// Generated code holds the frame address in the state register for its
/// entire lifetime; Rust sides hold a pinned raw pointer owned by the thread
/// object. The layout is `repr(C)` so both sides agree on offsets.
#[repr(C)]
pub struct CpuStateFrame {
    pub state: CpuState,
    pub pointers: PointerTable,
    /// Host SP captured on `dispatch` entry; thread-stop resets SP here.
    pub returning_stack_location: u64,
    /// Callee-saved register spill area written by the dispatch entry stub
    /// and reloaded by the thread-stop handler, replacing a `jmp_buf`.
    pub jump_anchor: [u64; JUMP_ANCHOR_SLOTS],
    /// Non-zero puts every block prologue into the single-step pause check.
    pub running_mode: u32,
    pub signal_reason: AtomicU32,
    /// Back-pointer to the owning `ThreadState`, type-erased to keep the
    /// frame free-standing for generated code.
    pub thread: *mut (),
}

impl CpuStateFrame {
    pub fn new() -> Self {
        CpuStateFrame {
            state: CpuState::new(),
            pointers: PointerTable::new(),
            returning_stack_location: 0,
            jump_anchor: [0; JUMP_ANCHOR_SLOTS],
            running_mode: 0,
            signal_reason: AtomicU32::new(SignalEvent::None as u32),
            thread: std::ptr::null_mut(),
        }
    }
}

impl Default for CpuStateFrame {
    fn default() -> Self {
        Self::new()
    }
}

use std::mem::offset_of;

/// Byte offset of guest GPR `index` from the state pointer
pub const fn greg_offset(index: usize) -> i32 {
    (offset_of!(CpuStateFrame, state) + offset_of!(CpuState, gregs) + index * 8) as i32
}

/// Byte offset of guest RIP from the state pointer
pub const fn rip_offset() -> i32 {
    (offset_of!(CpuStateFrame, state) + offset_of!(CpuState, rip)) as i32
}

/// Byte offset of vector register `index` (low qword) from the state pointer
pub const fn xmm_offset(index: usize) -> i32 {
    (offset_of!(CpuStateFrame, state) + offset_of!(CpuState, xmm) + index * 16) as i32
}

/// Byte offset of flag lane `index` from the state pointer
pub const fn flag_offset(index: usize) -> i32 {
    (offset_of!(CpuStateFrame, state) + offset_of!(CpuState, flags) + index) as i32
}

/// Byte offset of a `PointerTable` field, given its offset within the table
pub const fn pointers_offset(field: usize) -> i32 {
    (offset_of!(CpuStateFrame, pointers) + field) as i32
}

/// Byte offset of `running_mode` from the state pointer
pub const fn running_mode_offset() -> i32 {
    offset_of!(CpuStateFrame, running_mode) as i32
}

/// Byte offset of `returning_stack_location` from the state pointer
pub const fn returning_stack_location_offset() -> i32 {
    offset_of!(CpuStateFrame, returning_stack_location) as i32
}

/// Byte offset of `jump_anchor[slot]` from the state pointer
pub const fn jump_anchor_offset(slot: usize) -> i32 {
    (offset_of!(CpuStateFrame, jump_anchor) + slot * 8) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_offsets_are_stable() {
        // The state block leads the frame so the hottest offsets stay small.
        assert_eq!(rip_offset(), 0);
        assert_eq!(greg_offset(0), 8);
        assert_eq!(greg_offset(15), 8 + 15 * 8);
        // Paired 128-bit spills require a 16-byte-aligned vector file
        assert_eq!(xmm_offset(0) % 16, 0);
        assert_eq!(xmm_offset(1) - xmm_offset(0), 16);
        assert_eq!(flag_offset(1) - flag_offset(0), 1);
    }

    #[test]
    fn test_pointer_table_is_dense_u64s() {
        assert_eq!(
            std::mem::size_of::<PointerTable>(),
            (20 + FALLBACK_HANDLER_COUNT) * 8
        );
    }

    #[test]
    fn test_reconstruct_fsw() {
        let mut state = CpuState::new();
        state.flags[flag::X87_TOP] = 0b101;
        state.flags[flag::X87_C0] = 1;
        state.flags[flag::X87_C3] = 1;
        let fsw = state.reconstruct_fsw();
        assert_eq!((fsw >> 11) & 0b111, 0b101);
        assert_eq!((fsw >> 8) & 1, 1);
        assert_eq!((fsw >> 9) & 1, 0);
        assert_eq!((fsw >> 14) & 1, 1);
    }

    #[test]
    fn test_signal_event_round_trip() {
        for ev in [
            SignalEvent::None,
            SignalEvent::Pause,
            SignalEvent::Stop,
            SignalEvent::Return,
        ] {
            assert_eq!(SignalEvent::from_u32(ev as u32), ev);
        }
    }
}
