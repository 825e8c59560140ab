//! Guest-visible signal frame structures (x86-64 Linux)
//!
//! These mirror the guest libc's `ucontext_t`, `siginfo_t`, and FXSAVE
//! layouts bit for bit. A 64-bit guest signal handler receives pointers into
//! its own stack laid out exactly like a native kernel signal frame, so any
//! deviation here is guest-visible corruption.

/// `uc_flags` bit advertising the extended FP state area
pub const UC_FP_XSTATE: u64 = 1;

/// Bytes below the guest RSP reserved by the x86-64 ABI
pub const RED_ZONE_SIZE: u64 = 128;

/// `ss_flags` bit: alternate stack disabled
pub const SS_DISABLE: i32 = 2;

/// `sa_flags` bit: three-argument handler wanting siginfo/ucontext
pub const SA_SIGINFO: u64 = 4;

/// Guest page-fault error-code bits (`uc_mcontext.gregs[ERR]`)
pub const PF_WRITE: u32 = 1 << 1;
pub const PF_USER: u32 = 1 << 2;

/// Indices into `GuestMContext::gregs`, matching the guest libc
pub mod greg {
    pub const R8: usize = 0;
    pub const R9: usize = 1;
    pub const R10: usize = 2;
    pub const R11: usize = 3;
    pub const R12: usize = 4;
    pub const R13: usize = 5;
    pub const R14: usize = 6;
    pub const R15: usize = 7;
    pub const RDI: usize = 8;
    pub const RSI: usize = 9;
    pub const RBP: usize = 10;
    pub const RBX: usize = 11;
    pub const RDX: usize = 12;
    pub const RAX: usize = 13;
    pub const RCX: usize = 14;
    pub const RSP: usize = 15;
    pub const RIP: usize = 16;
    pub const EFL: usize = 17;
    pub const CSGSFS: usize = 18;
    pub const ERR: usize = 19;
    pub const TRAPNO: usize = 20;
    pub const OLDMASK: usize = 21;
    pub const CR2: usize = 22;
    pub const COUNT: usize = 23;
}

/// One 80-bit x87 register in FXSAVE form: 10 significant bytes in 16
#[derive(Clone, Copy)]
#[repr(C)]
pub struct GuestFpxReg {
    pub significand: [u16; 4],
    pub exponent: u16,
    pub reserved: [u16; 3],
}

/// One 128-bit SSE register
#[derive(Clone, Copy)]
#[repr(C)]
pub struct GuestXmmReg {
    pub element: [u32; 4],
}

/// FXSAVE area embedded in the guest `ucontext_t`
#[repr(C)]
pub struct GuestFpState {
    pub cwd: u16,
    pub swd: u16,
    pub ftw: u16,
    pub fop: u16,
    pub rip: u64,
    pub rdp: u64,
    pub mxcsr: u32,
    pub mxcr_mask: u32,
    pub st: [GuestFpxReg; 8],
    pub xmm: [GuestXmmReg; 16],
    pub reserved: [u32; 24],
}

/// Guest `stack_t`
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct GuestStack {
    pub ss_sp: u64,
    pub ss_flags: i32,
    _pad: i32,
    pub ss_size: u64,
}

impl GuestStack {
    pub fn new(ss_sp: u64, ss_flags: i32, ss_size: u64) -> Self {
        GuestStack { ss_sp, ss_flags, _pad: 0, ss_size }
    }

    pub fn disabled() -> Self {
        Self::new(0, SS_DISABLE, 0)
    }
}

/// Guest `mcontext_t`
#[repr(C)]
pub struct GuestMContext {
    pub gregs: [u64; greg::COUNT],
    /// Guest pointer to the in-frame `GuestFpState`
    pub fpregs: u64,
    pub reserved: [u64; 8],
}

/// Guest `ucontext_t`
#[repr(C)]
pub struct GuestUcontext {
    pub uc_flags: u64,
    pub uc_link: u64,
    pub uc_stack: GuestStack,
    pub uc_mcontext: GuestMContext,
    pub uc_sigmask: [u64; 16],
    pub fpregs_mem: GuestFpState,
    pub ssp: [u64; 4],
}

/// Guest `siginfo_t`: only the fields the core fills are named; the union
/// tail keeps the structure at its architectural 128 bytes.
#[repr(C)]
pub struct GuestSiginfo {
    pub si_signo: i32,
    pub si_errno: i32,
    pub si_code: i32,
    _pad: i32,
    /// First union member, valid for SIGSEGV/SIGBUS
    pub si_addr: u64,
    _rest: [u64; 13],
}

impl GuestSiginfo {
    pub fn zeroed() -> Self {
        // Safety: all fields are plain integers.
        unsafe { std::mem::zeroed() }
    }
}

/// Guest `sigaction` state the core consumes when injecting a signal
#[derive(Debug, Clone, Copy)]
pub struct GuestSigAction {
    /// Guest address of the handler (`sa_handler` or `sa_sigaction`)
    pub handler: u64,
    pub sa_flags: u64,
    pub sa_mask: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn test_architectural_sizes() {
        assert_eq!(size_of::<GuestFpxReg>(), 16);
        assert_eq!(size_of::<GuestXmmReg>(), 16);
        assert_eq!(size_of::<GuestFpState>(), 512);
        assert_eq!(size_of::<GuestStack>(), 24);
        assert_eq!(size_of::<GuestMContext>(), 256);
        assert_eq!(size_of::<GuestUcontext>(), 968);
        assert_eq!(size_of::<GuestSiginfo>(), 128);
    }

    #[test]
    fn test_wire_offsets() {
        // The guest reads these by offset; they must match its libc.
        assert_eq!(offset_of!(GuestUcontext, uc_stack), 16);
        assert_eq!(offset_of!(GuestUcontext, uc_mcontext), 40);
        assert_eq!(offset_of!(GuestUcontext, fpregs_mem), 424);
        assert_eq!(
            offset_of!(GuestMContext, gregs) + greg::RIP * 8,
            16 * 8
        );
        assert_eq!(offset_of!(GuestSiginfo, si_addr), 16);
    }
}
