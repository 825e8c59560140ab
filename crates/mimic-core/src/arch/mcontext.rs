//! Host `ucontext` access and context backups
//!
//! The signal core manipulates the interrupted host context through these
//! accessors, and snapshots it into a `ContextBackup` pushed on the guest
//! stack for the duration of a guest signal handler. Layouts differ per host
//! ISA; the x86-64 variant exists so the host-neutral parts of the core can
//! be exercised on development machines.

use crate::state::CpuState;

/// Page-fault classification bits surfaced to the guest
pub use crate::guest_uctx::{PF_USER, PF_WRITE};

/// Cookie written into debug-build backups; a mismatch on restore means the
/// stack holding the backup was trampled and nothing can be trusted.
#[cfg(debug_assertions)]
pub const STACK_COOKIE_MAGIC: u64 = 0x4142_4344_4546_4748;

// ===== AArch64 ESR decoding (host-neutral logic) =====

/// Exception Syndrome Register fields for EL0 data aborts
pub mod esr {
    pub const EC_MASK: u64 = 0b11_1111 << 26;
    pub const EC_DATA_ABORT: u64 = 0b10_0100 << 26;
    /// Write-not-Read: set when the abort came from a store
    pub const WNR: u64 = 1 << 6;
    pub const DFSC_LEVEL_MASK: u64 = 0b11;
    pub const DFSC_LEVEL_EL0: u64 = 0b11;
}

/// Magic values tagging records in the AArch64 `__reserved` area
pub const FPSIMD_MAGIC: u32 = 0x4650_8001;
pub const ESR_MAGIC: u32 = 0x4553_5201;

/// Walk an AArch64 `__reserved` record chain for the ESR record.
///
/// Each record is `{magic: u32, size: u32}` followed by payload; a zero size
/// terminates the chain.
pub fn find_esr_record(reserved: &[u8]) -> Option<u64> {
    let mut offset = 0usize;
    loop {
        if offset + 16 > reserved.len() {
            return None;
        }
        let magic = u32::from_le_bytes(reserved[offset..offset + 4].try_into().unwrap());
        let size = u32::from_le_bytes(reserved[offset + 4..offset + 8].try_into().unwrap());
        if size == 0 {
            return None;
        }
        if magic == ESR_MAGIC {
            return Some(u64::from_le_bytes(
                reserved[offset + 8..offset + 16].try_into().unwrap(),
            ));
        }
        offset += size as usize;
    }
}

/// Derive the guest page-fault error-code bits from an AArch64 ESR value.
///
/// Only the user and write bits are guest-visible; x86 does not report the
/// translation/permission distinction to user space, so it is dropped here.
pub fn protect_flags_from_esr(esr_value: u64) -> u32 {
    assert_eq!(
        esr_value & esr::EC_MASK,
        esr::EC_DATA_ABORT,
        "unexpected ESR exception class: {:#x}",
        esr_value
    );
    let mut flags = 0;
    if esr_value & esr::DFSC_LEVEL_MASK == esr::DFSC_LEVEL_EL0 {
        flags |= PF_USER;
    }
    if esr_value & esr::WNR != 0 {
        flags |= PF_WRITE;
    }
    flags
}

// ===== Native host accessors =====

#[cfg(all(unix, target_arch = "x86_64"))]
mod imp {
    use super::*;
    use libc::{c_void, ucontext_t};

    pub const RED_ZONE_SIZE: u64 = 128;

    unsafe fn uctx<'a>(ucontext: *mut c_void) -> &'a mut ucontext_t {
        &mut *(ucontext as *mut ucontext_t)
    }

    pub unsafe fn get_pc(ucontext: *mut c_void) -> u64 {
        uctx(ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] as u64
    }

    pub unsafe fn set_pc(ucontext: *mut c_void, value: u64) {
        uctx(ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] = value as i64;
    }

    pub unsafe fn get_sp(ucontext: *mut c_void) -> u64 {
        uctx(ucontext).uc_mcontext.gregs[libc::REG_RSP as usize] as u64
    }

    pub unsafe fn set_sp(ucontext: *mut c_void, value: u64) {
        uctx(ucontext).uc_mcontext.gregs[libc::REG_RSP as usize] = value as i64;
    }

    /// The host register holding the state pointer inside generated code
    pub unsafe fn get_state(ucontext: *mut c_void) -> u64 {
        uctx(ucontext).uc_mcontext.gregs[libc::REG_R14 as usize] as u64
    }

    pub unsafe fn set_state(ucontext: *mut c_void, value: u64) {
        uctx(ucontext).uc_mcontext.gregs[libc::REG_R14 as usize] = value as i64;
    }

    pub unsafe fn get_host_gpr(_ucontext: *mut c_void, _index: u32) -> u64 {
        unreachable!("SRA register file access is not defined on x86-64 hosts");
    }

    pub unsafe fn set_host_gpr(_ucontext: *mut c_void, _index: u32, _value: u64) {
        unreachable!("SRA register file access is not defined on x86-64 hosts");
    }

    pub unsafe fn get_host_fpr(_ucontext: *mut c_void, _index: u32) -> [u64; 2] {
        unreachable!("SRA vector file access is not defined on x86-64 hosts");
    }

    pub unsafe fn get_protect_flags(ucontext: *mut c_void) -> u32 {
        uctx(ucontext).uc_mcontext.gregs[libc::REG_ERR as usize] as u32
    }

    /// Host register/FP snapshot
    #[repr(C)]
    pub struct HostState {
        gregs: [i64; 23],
        fpstate: [u8; 512],
        has_fpstate: bool,
    }

    impl HostState {
        pub fn zeroed() -> Self {
            // Safety: all fields are plain data.
            unsafe { std::mem::zeroed() }
        }
    }

    pub unsafe fn backup_host_state(ucontext: *mut c_void, out: &mut HostState) {
        let uc = uctx(ucontext);
        out.gregs = uc.uc_mcontext.gregs;
        out.has_fpstate = !uc.uc_mcontext.fpregs.is_null();
        if out.has_fpstate {
            std::ptr::copy_nonoverlapping(
                uc.uc_mcontext.fpregs as *const u8,
                out.fpstate.as_mut_ptr(),
                512,
            );
        }
    }

    pub unsafe fn restore_host_state(ucontext: *mut c_void, backup: &HostState) {
        let uc = uctx(ucontext);
        uc.uc_mcontext.gregs = backup.gregs;
        if backup.has_fpstate && !uc.uc_mcontext.fpregs.is_null() {
            std::ptr::copy_nonoverlapping(
                backup.fpstate.as_ptr(),
                uc.uc_mcontext.fpregs as *mut u8,
                512,
            );
        }
    }

    pub unsafe fn sigmask_word(ucontext: *mut c_void) -> u64 {
        *(std::ptr::addr_of!(uctx(ucontext).uc_sigmask) as *const u64)
    }

    pub unsafe fn set_sigmask_word(ucontext: *mut c_void, value: u64) {
        *(std::ptr::addr_of_mut!(uctx(ucontext).uc_sigmask) as *mut u64) = value;
    }
}

#[cfg(all(unix, target_arch = "aarch64"))]
mod imp {
    use super::*;
    use libc::{c_void, ucontext_t};

    /// AArch64 has no red zone
    pub const RED_ZONE_SIZE: u64 = 0;

    /// The generated-code state pointer lives in x28
    const STATE_REG: usize = 28;

    unsafe fn uctx<'a>(ucontext: *mut c_void) -> &'a mut ucontext_t {
        &mut *(ucontext as *mut ucontext_t)
    }

    pub unsafe fn get_pc(ucontext: *mut c_void) -> u64 {
        uctx(ucontext).uc_mcontext.pc
    }

    pub unsafe fn set_pc(ucontext: *mut c_void, value: u64) {
        uctx(ucontext).uc_mcontext.pc = value;
    }

    pub unsafe fn get_sp(ucontext: *mut c_void) -> u64 {
        uctx(ucontext).uc_mcontext.sp
    }

    pub unsafe fn set_sp(ucontext: *mut c_void, value: u64) {
        uctx(ucontext).uc_mcontext.sp = value;
    }

    pub unsafe fn get_state(ucontext: *mut c_void) -> u64 {
        uctx(ucontext).uc_mcontext.regs[STATE_REG]
    }

    pub unsafe fn set_state(ucontext: *mut c_void, value: u64) {
        uctx(ucontext).uc_mcontext.regs[STATE_REG] = value;
    }

    pub unsafe fn get_host_gpr(ucontext: *mut c_void, index: u32) -> u64 {
        uctx(ucontext).uc_mcontext.regs[index as usize]
    }

    pub unsafe fn set_host_gpr(ucontext: *mut c_void, index: u32, value: u64) {
        uctx(ucontext).uc_mcontext.regs[index as usize] = value;
    }

    #[repr(C)]
    struct FpsimdContext {
        magic: u32,
        size: u32,
        fpsr: u32,
        fpcr: u32,
        vregs: [[u64; 2]; 32],
    }

    /// The record chain (`__reserved`) begins 16-byte aligned after pstate.
    /// libc keeps the field private, so locate it by layout.
    unsafe fn reserved_ptr(ucontext: *mut c_void) -> *mut u8 {
        let after_pstate = std::ptr::addr_of_mut!(uctx(ucontext).uc_mcontext.pstate) as usize + 8;
        ((after_pstate + 15) & !15) as *mut u8
    }

    const RESERVED_BYTES: usize = 4096;

    unsafe fn fpsimd<'a>(ucontext: *mut c_void) -> &'a mut FpsimdContext {
        let ctx = &mut *(reserved_ptr(ucontext) as *mut FpsimdContext);
        assert_eq!(ctx.magic, FPSIMD_MAGIC, "wrong FPR magic: {:#010x}", ctx.magic);
        ctx
    }

    pub unsafe fn get_host_fpr(ucontext: *mut c_void, index: u32) -> [u64; 2] {
        fpsimd(ucontext).vregs[index as usize]
    }

    pub unsafe fn get_esr(ucontext: *mut c_void) -> Option<u64> {
        let reserved = std::slice::from_raw_parts(reserved_ptr(ucontext), RESERVED_BYTES);
        find_esr_record(reserved)
    }

    pub unsafe fn get_protect_flags(ucontext: *mut c_void) -> u32 {
        protect_flags_from_esr(get_esr(ucontext).expect("no ESR record in signal context"))
    }

    #[repr(C)]
    pub struct HostState {
        gprs: [u64; 31],
        prev_sp: u64,
        prev_pc: u64,
        pstate: u64,
        fpsr: u32,
        fpcr: u32,
        fprs: [[u64; 2]; 32],
    }

    impl HostState {
        pub fn zeroed() -> Self {
            // Safety: all fields are plain data.
            unsafe { std::mem::zeroed() }
        }
    }

    pub unsafe fn backup_host_state(ucontext: *mut c_void, out: &mut HostState) {
        let uc = uctx(ucontext);
        out.gprs.copy_from_slice(&uc.uc_mcontext.regs);
        out.prev_sp = uc.uc_mcontext.sp;
        out.prev_pc = uc.uc_mcontext.pc;
        out.pstate = uc.uc_mcontext.pstate;
        let fp = fpsimd(ucontext);
        out.fpsr = fp.fpsr;
        out.fpcr = fp.fpcr;
        out.fprs = fp.vregs;
    }

    pub unsafe fn restore_host_state(ucontext: *mut c_void, backup: &HostState) {
        let fp = fpsimd(ucontext);
        fp.vregs = backup.fprs;
        fp.fpsr = backup.fpsr;
        fp.fpcr = backup.fpcr;
        let uc = uctx(ucontext);
        uc.uc_mcontext.pstate = backup.pstate;
        uc.uc_mcontext.pc = backup.prev_pc;
        uc.uc_mcontext.sp = backup.prev_sp;
        uc.uc_mcontext.regs.copy_from_slice(&backup.gprs);
    }

    pub unsafe fn sigmask_word(ucontext: *mut c_void) -> u64 {
        *(std::ptr::addr_of!(uctx(ucontext).uc_sigmask) as *const u64)
    }

    pub unsafe fn set_sigmask_word(ucontext: *mut c_void, value: u64) {
        *(std::ptr::addr_of_mut!(uctx(ucontext).uc_sigmask) as *mut u64) = value;
    }
}

#[cfg(all(unix, target_arch = "riscv64"))]
mod imp {
    use libc::{c_void, ucontext_t};

    pub const RED_ZONE_SIZE: u64 = 0;

    /// pc occupies slot 0 of `__gregs`; the state pointer is x27
    const PC_REG: usize = 0;
    const SP_REG: usize = 2;
    const STATE_REG: usize = 27;

    unsafe fn uctx<'a>(ucontext: *mut c_void) -> &'a mut ucontext_t {
        &mut *(ucontext as *mut ucontext_t)
    }

    pub unsafe fn get_pc(ucontext: *mut c_void) -> u64 {
        uctx(ucontext).uc_mcontext.__gregs[PC_REG]
    }

    pub unsafe fn set_pc(ucontext: *mut c_void, value: u64) {
        uctx(ucontext).uc_mcontext.__gregs[PC_REG] = value;
    }

    pub unsafe fn get_sp(ucontext: *mut c_void) -> u64 {
        uctx(ucontext).uc_mcontext.__gregs[SP_REG]
    }

    pub unsafe fn set_sp(ucontext: *mut c_void, value: u64) {
        uctx(ucontext).uc_mcontext.__gregs[SP_REG] = value;
    }

    pub unsafe fn get_state(ucontext: *mut c_void) -> u64 {
        uctx(ucontext).uc_mcontext.__gregs[STATE_REG]
    }

    pub unsafe fn set_state(ucontext: *mut c_void, value: u64) {
        uctx(ucontext).uc_mcontext.__gregs[STATE_REG] = value;
    }

    pub unsafe fn get_host_gpr(ucontext: *mut c_void, index: u32) -> u64 {
        uctx(ucontext).uc_mcontext.__gregs[index as usize]
    }

    pub unsafe fn set_host_gpr(ucontext: *mut c_void, index: u32, value: u64) {
        // x0 is hardwired zero; never store through it
        if index != 0 {
            uctx(ucontext).uc_mcontext.__gregs[index as usize] = value;
        }
    }

    pub unsafe fn get_host_fpr(_ucontext: *mut c_void, _index: u32) -> [u64; 2] {
        unreachable!("vector SRA is not used on RISC-V hosts");
    }

    pub unsafe fn get_protect_flags(_ucontext: *mut c_void) -> u32 {
        // RISC-V exposes no WnR equivalent in the signal frame; report a
        // plain user fault.
        super::PF_USER
    }

    /// Enough for the largest `__riscv_mc_fp_state` variant (Q extension)
    const FP_STATE_BYTES: usize = 528;

    #[repr(C)]
    pub struct HostState {
        gregs: [u64; 32],
        fpregs: [u8; FP_STATE_BYTES],
    }

    impl HostState {
        pub fn zeroed() -> Self {
            // Safety: all fields are plain data.
            unsafe { std::mem::zeroed() }
        }
    }

    fn fp_copy_len() -> usize {
        FP_STATE_BYTES.min(std::mem::size_of::<libc::__riscv_mc_fp_state>())
    }

    pub unsafe fn backup_host_state(ucontext: *mut c_void, out: &mut HostState) {
        let uc = uctx(ucontext);
        out.gregs.copy_from_slice(&uc.uc_mcontext.__gregs);
        std::ptr::copy_nonoverlapping(
            std::ptr::addr_of!(uc.uc_mcontext.__fpregs) as *const u8,
            out.fpregs.as_mut_ptr(),
            fp_copy_len(),
        );
    }

    pub unsafe fn restore_host_state(ucontext: *mut c_void, backup: &HostState) {
        let uc = uctx(ucontext);
        uc.uc_mcontext.__gregs.copy_from_slice(&backup.gregs);
        std::ptr::copy_nonoverlapping(
            backup.fpregs.as_ptr(),
            std::ptr::addr_of_mut!(uc.uc_mcontext.__fpregs) as *mut u8,
            fp_copy_len(),
        );
    }

    pub unsafe fn sigmask_word(ucontext: *mut c_void) -> u64 {
        *(std::ptr::addr_of!(uctx(ucontext).uc_sigmask) as *const u64)
    }

    pub unsafe fn set_sigmask_word(ucontext: *mut c_void, value: u64) {
        *(std::ptr::addr_of_mut!(uctx(ucontext).uc_sigmask) as *mut u64) = value;
    }
}

#[cfg(not(all(unix, any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64"))))]
mod imp {
    use libc::c_void;

    pub const RED_ZONE_SIZE: u64 = 0;

    #[repr(C)]
    pub struct HostState;

    impl HostState {
        pub fn zeroed() -> Self {
            HostState
        }
    }

    pub unsafe fn get_pc(_: *mut c_void) -> u64 {
        unimplemented!("unsupported host")
    }
    pub unsafe fn set_pc(_: *mut c_void, _: u64) {
        unimplemented!("unsupported host")
    }
    pub unsafe fn get_sp(_: *mut c_void) -> u64 {
        unimplemented!("unsupported host")
    }
    pub unsafe fn set_sp(_: *mut c_void, _: u64) {
        unimplemented!("unsupported host")
    }
    pub unsafe fn get_state(_: *mut c_void) -> u64 {
        unimplemented!("unsupported host")
    }
    pub unsafe fn set_state(_: *mut c_void, _: u64) {
        unimplemented!("unsupported host")
    }
    pub unsafe fn get_host_gpr(_: *mut c_void, _: u32) -> u64 {
        unimplemented!("unsupported host")
    }
    pub unsafe fn set_host_gpr(_: *mut c_void, _: u32, _: u64) {
        unimplemented!("unsupported host")
    }
    pub unsafe fn get_host_fpr(_: *mut c_void, _: u32) -> [u64; 2] {
        unimplemented!("unsupported host")
    }
    pub unsafe fn get_protect_flags(_: *mut c_void) -> u32 {
        unimplemented!("unsupported host")
    }
    pub unsafe fn backup_host_state(_: *mut c_void, _: &mut HostState) {
        unimplemented!("unsupported host")
    }
    pub unsafe fn restore_host_state(_: *mut c_void, _: &HostState) {
        unimplemented!("unsupported host")
    }
    pub unsafe fn sigmask_word(_: *mut c_void) -> u64 {
        unimplemented!("unsupported host")
    }
    pub unsafe fn set_sigmask_word(_: *mut c_void, _: u64) {
        unimplemented!("unsupported host")
    }
}

pub use imp::*;

/// Best-effort guest page-fault error code for a data fault: `None` when the
/// host context carries no usable classification.
///
/// # Safety
/// `ucontext` must be a live signal context.
pub unsafe fn data_fault_flags(ucontext: *mut libc::c_void) -> Option<u32> {
    #[cfg(all(unix, target_arch = "aarch64"))]
    {
        let esr_value = get_esr(ucontext)?;
        if esr_value & esr::EC_MASK != esr::EC_DATA_ABORT {
            return None;
        }
        Some(protect_flags_from_esr(esr_value))
    }
    #[cfg(all(unix, any(target_arch = "x86_64", target_arch = "riscv64")))]
    {
        Some(get_protect_flags(ucontext))
    }
    #[cfg(not(all(
        unix,
        any(target_arch = "aarch64", target_arch = "x86_64", target_arch = "riscv64")
    )))]
    {
        let _ = ucontext;
        None
    }
}

/// Snapshot of host and guest state pushed at host-signal entry and popped
/// at sigreturn. Lives on the interrupted stack below the red zone; the
/// signal core keeps a LIFO of their addresses.
#[repr(C)]
pub struct ContextBackup {
    #[cfg(debug_assertions)]
    stack_cookie: u64,
    pub host: HostState,
    pub sigmask: u64,
    pub fault_to_top_and_generated_exception: bool,
    pub signal: i32,
    pub flags: u32,
    pub original_rip: u64,
    pub fpstate_location: u64,
    pub ucontext_location: u64,
    pub siginfo_location: u64,
    pub guest_state: CpuState,
}

/// Backup flag: the interrupted PC was inside JIT code
pub const CONTEXT_FLAG_IN_JIT: u32 = 1 << 0;

impl ContextBackup {
    pub fn zeroed() -> Self {
        ContextBackup {
            #[cfg(debug_assertions)]
            stack_cookie: 0,
            host: HostState::zeroed(),
            sigmask: 0,
            fault_to_top_and_generated_exception: false,
            signal: 0,
            flags: 0,
            original_rip: 0,
            fpstate_location: 0,
            ucontext_location: 0,
            siginfo_location: 0,
            guest_state: CpuState::new(),
        }
    }
}

/// Capture the interrupted host context into `backup`.
///
/// # Safety
/// `ucontext` must be the live `ucontext_t` passed to a signal handler.
pub unsafe fn backup_context(ucontext: *mut libc::c_void, backup: &mut ContextBackup) {
    backup_host_state(ucontext, &mut backup.host);
    backup.sigmask = sigmask_word(ucontext);
    #[cfg(debug_assertions)]
    {
        backup.stack_cookie = STACK_COOKIE_MAGIC;
    }
}

/// Restore a previously captured host context, resuming where the signal
/// struck once the handler returns.
///
/// # Safety
/// `ucontext` must be the live `ucontext_t` passed to a signal handler, and
/// `backup` a value produced by `backup_context`.
pub unsafe fn restore_context(ucontext: *mut libc::c_void, backup: &ContextBackup) {
    #[cfg(debug_assertions)]
    assert_eq!(
        backup.stack_cookie, STACK_COOKIE_MAGIC,
        "stack cookie mismatch: backup stack was trampled"
    );
    restore_host_state(ucontext, &backup.host);
    set_sigmask_word(ucontext, backup.sigmask);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protect_flags_from_esr() {
        // EL0 write data abort
        let esr_value = esr::EC_DATA_ABORT | esr::WNR | esr::DFSC_LEVEL_EL0;
        assert_eq!(protect_flags_from_esr(esr_value), PF_USER | PF_WRITE);

        // EL0 read
        let esr_value = esr::EC_DATA_ABORT | esr::DFSC_LEVEL_EL0;
        assert_eq!(protect_flags_from_esr(esr_value), PF_USER);

        // EL1-level fault reports neither bit
        let esr_value = esr::EC_DATA_ABORT | 0b01;
        assert_eq!(protect_flags_from_esr(esr_value), 0);
    }

    #[test]
    #[should_panic(expected = "unexpected ESR exception class")]
    fn test_protect_flags_wrong_class_panics() {
        protect_flags_from_esr(0);
    }

    #[test]
    fn test_find_esr_record_walks_chain() {
        let mut reserved = vec![0u8; 256];
        // First record: FPSIMD, 32 bytes
        reserved[0..4].copy_from_slice(&FPSIMD_MAGIC.to_le_bytes());
        reserved[4..8].copy_from_slice(&32u32.to_le_bytes());
        // Second record: ESR, 16 bytes, value 0xABCD
        reserved[32..36].copy_from_slice(&ESR_MAGIC.to_le_bytes());
        reserved[36..40].copy_from_slice(&16u32.to_le_bytes());
        reserved[40..48].copy_from_slice(&0xABCDu64.to_le_bytes());

        assert_eq!(find_esr_record(&reserved), Some(0xABCD));
    }

    #[test]
    fn test_find_esr_record_missing() {
        let mut reserved = vec![0u8; 64];
        reserved[0..4].copy_from_slice(&FPSIMD_MAGIC.to_le_bytes());
        reserved[4..8].copy_from_slice(&16u32.to_le_bytes());
        // Terminator record of size 0 follows
        assert_eq!(find_esr_record(&reserved), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_backup_restore_round_trip() {
        // Round-tripping through a synthetic ucontext is the identity
        // (modulo the stack cookie).
        let mut uc: libc::ucontext_t = unsafe { std::mem::zeroed() };

        #[cfg(target_arch = "x86_64")]
        let mut fp: [u8; 512] = [0; 512];
        #[cfg(target_arch = "x86_64")]
        {
            uc.uc_mcontext.fpregs = fp.as_mut_ptr() as *mut _;
            uc.uc_mcontext.gregs[libc::REG_RIP as usize] = 0x1234;
            uc.uc_mcontext.gregs[libc::REG_RSP as usize] = 0x5678;
        }
        #[cfg(target_arch = "aarch64")]
        unsafe {
            // Install an FPSIMD record so the accessor finds its magic; the
            // record area starts 16-byte aligned after pstate.
            let after_pstate =
                std::ptr::addr_of_mut!(uc.uc_mcontext.pstate) as usize + 8;
            let reserved = ((after_pstate + 15) & !15) as *mut u8;
            std::ptr::copy_nonoverlapping(FPSIMD_MAGIC.to_le_bytes().as_ptr(), reserved, 4);
            std::ptr::copy_nonoverlapping(528u32.to_le_bytes().as_ptr(), reserved.add(4), 4);
            uc.uc_mcontext.pc = 0x1234;
            uc.uc_mcontext.sp = 0x5678;
        }
        #[cfg(target_arch = "riscv64")]
        {
            uc.uc_mcontext.__gregs[0] = 0x1234;
            uc.uc_mcontext.__gregs[2] = 0x5678;
        }

        let ucp = &mut uc as *mut _ as *mut libc::c_void;
        let mut backup = ContextBackup::zeroed();
        unsafe {
            backup_context(ucp, &mut backup);
            let pc = get_pc(ucp);
            let sp = get_sp(ucp);
            // Clobber, then restore
            set_pc(ucp, 0xdead);
            set_sp(ucp, 0xbeef);
            restore_context(ucp, &backup);
            assert_eq!(get_pc(ucp), pc);
            assert_eq!(get_sp(ucp), sp);
        }
    }
}
