//! Signal core
//!
//! A process-wide handler owns SIGILL, SIGBUS, SIGSEGV, and the pause
//! signal. Faults whose PC lies inside translated code are reflected into
//! guest semantics: host state is snapshotted into a `ContextBackup` below
//! the interrupted stack, a guest-shaped signal frame is written to the
//! guest stack, and the kernel resumes at the dispatcher loop top with guest
//! RIP pointing at the guest handler. The guest handler's return lands on a
//! deliberately-invalid sentinel instruction whose fault pops the backup.
//! Faults anywhere else chain to whatever handler was installed before us.

use crate::arch::mcontext::{self, ContextBackup, CONTEXT_FLAG_IN_JIT};
use crate::arch::HostIsa;
use crate::guest_uctx::{
    greg, GuestSigAction, GuestSiginfo, GuestStack, GuestUcontext, RED_ZONE_SIZE, SA_SIGINFO,
    SS_DISABLE, UC_FP_XSTATE,
};
use crate::state::{CpuStateFrame, Reg, SignalEvent};
use crate::thread::ThreadState;
use libc::c_void;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Highest real-time signal, least likely to collide with guest usage
/// (64 itself is taken by Valgrind internally)
pub const SIGNAL_FOR_PAUSE: i32 = 63;

pub const MAX_SIGNALS: usize = 64;

thread_local! {
    static TLS_FRAME: Cell<*mut CpuStateFrame> = const { Cell::new(std::ptr::null_mut()) };
}

/// Publish the calling thread's frame for the process-wide handler.
pub fn register_tls_frame(frame: *mut CpuStateFrame) {
    TLS_FRAME.with(|slot| slot.set(frame));
}

fn tls_frame() -> *mut CpuStateFrame {
    TLS_FRAME.with(|slot| slot.get())
}

/// Block every signal; returns the previous mask for `restore_signal_mask`.
pub fn block_all_signals() -> libc::sigset_t {
    // Safety: plain pthread_sigmask round trip
    unsafe {
        let mut all: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut all);
        let mut previous: libc::sigset_t = std::mem::zeroed();
        libc::pthread_sigmask(libc::SIG_SETMASK, &all, &mut previous);
        previous
    }
}

pub fn restore_signal_mask(previous: &libc::sigset_t) {
    // Safety: restoring a mask previously returned by pthread_sigmask
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, previous, std::ptr::null_mut());
    }
}

// ===== Guest ↔ host register index pairs (state index, guest-uc index) =====

const GREG_PAIRS: [(usize, usize); 16] = [
    (Reg::R8 as usize, greg::R8),
    (Reg::R9 as usize, greg::R9),
    (Reg::R10 as usize, greg::R10),
    (Reg::R11 as usize, greg::R11),
    (Reg::R12 as usize, greg::R12),
    (Reg::R13 as usize, greg::R13),
    (Reg::R14 as usize, greg::R14),
    (Reg::R15 as usize, greg::R15),
    (Reg::Rdi as usize, greg::RDI),
    (Reg::Rsi as usize, greg::RSI),
    (Reg::Rbp as usize, greg::RBP),
    (Reg::Rbx as usize, greg::RBX),
    (Reg::Rdx as usize, greg::RDX),
    (Reg::Rax as usize, greg::RAX),
    (Reg::Rcx as usize, greg::RCX),
    (Reg::Rsp as usize, greg::RSP),
];

// ===== Per-thread signal machinery =====

/// Spill the statically-allocated guest registers from the interrupted host
/// register file into the state frame.
///
/// # Safety
/// `ucontext` must be the live context of a fault taken inside JIT code.
pub unsafe fn spill_sra(thread: &mut ThreadState, ucontext: *mut c_void) {
    match thread.engine.isa {
        HostIsa::Aarch64 => {
            for (i, reg) in crate::arch::aarch64::SRA_GPR.iter().enumerate() {
                thread.frame.state.gregs[i] = mcontext::get_host_gpr(ucontext, reg.0 as u32);
            }
            for (i, vreg) in crate::arch::aarch64::SRA_FPR.iter().enumerate() {
                thread.frame.state.xmm[i] = mcontext::get_host_fpr(ucontext, vreg.0 as u32);
            }
        }
        HostIsa::Riscv64 => {
            // Guest vector state stays in memory on this port
            for (i, reg) in crate::arch::riscv::SRA_GPR.iter().enumerate() {
                thread.frame.state.gregs[i] = mcontext::get_host_gpr(ucontext, reg.0 as u32);
            }
        }
    }
}

/// Push a `ContextBackup` beneath the interrupted host stack.
///
/// # Safety
/// `ucontext` must be the live signal context of this thread.
pub unsafe fn store_thread_state(thread: &mut ThreadState, signal: i32, ucontext: *mut c_void) {
    let old_sp = mcontext::get_sp(ucontext);
    let mut new_sp = old_sp - mcontext::RED_ZONE_SIZE;
    new_sp -= std::mem::size_of::<ContextBackup>() as u64;
    new_sp &= !15;

    let backup = new_sp as *mut ContextBackup;
    backup.write(ContextBackup::zeroed());
    mcontext::backup_context(ucontext, &mut *backup);
    (*backup).signal = signal;
    (*backup).original_rip = thread.frame.state.rip;

    // Registers may be split between the frame and host SRA registers here;
    // the host-register snapshot above captures the live half, so the frame
    // copy is taken as-is.
    (*backup).guest_state = thread.frame.state.clone();

    mcontext::set_sp(ucontext, new_sp);
    thread.signal_frames.push(new_sp);
}

/// Pop the most recent `ContextBackup`, restoring guest and host state.
/// Guest-visible edits to the in-frame `ucontext` (a handler rewriting saved
/// registers) are carried back into the guest state.
///
/// # Safety
/// `ucontext` must be the live signal context of this thread, and a backup
/// must have been pushed by `store_thread_state`.
pub unsafe fn restore_thread_state(thread: &mut ThreadState, ucontext: *mut c_void) {
    let sp = thread
        .signal_frames
        .pop()
        .expect("sigreturn without a pushed signal frame");
    let backup = &*(sp as *mut ContextBackup);

    thread.frame.state = backup.guest_state.clone();

    if backup.ucontext_location != 0 {
        let guest_uc = &*(backup.ucontext_location as *const GuestUcontext);
        for (state_idx, uc_idx) in GREG_PAIRS {
            thread.frame.state.gregs[state_idx] = guest_uc.uc_mcontext.gregs[uc_idx];
        }
        thread.frame.state.rip = guest_uc.uc_mcontext.gregs[greg::RIP];
    }

    mcontext::restore_context(ucontext, backup);
}

/// Inject `signal` into the guest: build the guest signal frame and aim the
/// resumed context at the dispatcher so the guest handler runs next.
///
/// # Safety
/// Must run inside the host signal handler for this thread's fault, with
/// `info`/`ucontext` the live kernel-provided values.
pub unsafe fn handle_guest_signal(
    thread: &mut ThreadState,
    signal: i32,
    info: *const libc::siginfo_t,
    ucontext: *mut c_void,
    action: &GuestSigAction,
    guest_stack: &GuestStack,
) -> bool {
    let interrupted_pc = mcontext::get_pc(ucontext);

    store_thread_state(thread, signal, ucontext);

    // Gates code-buffer reclamation until the matching sigreturn
    thread.signal_handler_refcount.fetch_add(1, Ordering::AcqRel);

    mcontext::set_pc(ucontext, thread.dispatcher.absolute_loop_top_fill_sra);
    mcontext::set_state(ucontext, thread.frame_ptr() as u64);

    let old_guest_sp = thread.frame.state.gregs[Reg::Rsp as usize];
    let mut new_guest_sp = old_guest_sp;

    if guest_stack.ss_flags & SS_DISABLE == 0 {
        // Recursive signals already on the alternate stack keep unwinding it
        let alt_base = guest_stack.ss_sp;
        let alt_end = alt_base + guest_stack.ss_size;
        if !(old_guest_sp >= alt_base && old_guest_sp <= alt_end) {
            new_guest_sp = alt_end;
        }
    }

    new_guest_sp -= RED_ZONE_SIZE;

    if action.sa_flags & SA_SIGINFO != 0 {
        if thread.engine.config.sra {
            if thread.is_address_in_jit_code(interrupted_pc, false) {
                spill_sra(thread, ucontext);
                if let Some(&backup_sp) = thread.signal_frames.last() {
                    (*(backup_sp as *mut ContextBackup)).flags |= CONTEXT_FLAG_IN_JIT;
                }
            } else {
                debug_assert!(
                    !thread.is_address_in_jit_code(interrupted_pc, true),
                    "signal in dispatcher stubs has unsynchronized context"
                );
            }
        }

        new_guest_sp -= std::mem::size_of::<GuestUcontext>() as u64;
        let ucontext_location = new_guest_sp;
        new_guest_sp -= std::mem::size_of::<GuestSiginfo>() as u64;
        let siginfo_location = new_guest_sp;

        let guest_uc = ucontext_location as *mut GuestUcontext;
        guest_uc.write(std::mem::zeroed());
        let guest_uc = &mut *guest_uc;

        // Extended FP state lives inside the frame itself
        guest_uc.uc_flags |= UC_FP_XSTATE;
        guest_uc.uc_mcontext.fpregs =
            ucontext_location + std::mem::offset_of!(GuestUcontext, fpregs_mem) as u64;

        let state = &thread.frame.state;
        for (state_idx, uc_idx) in GREG_PAIRS {
            guest_uc.uc_mcontext.gregs[uc_idx] = state.gregs[state_idx];
        }
        guest_uc.uc_mcontext.gregs[greg::RIP] = state.rip;
        if signal == libc::SIGSEGV {
            // x86 reports the access kind through the error code; derived
            // from ESR WnR/EL on AArch64 hosts
            if let Some(flags) = mcontext::data_fault_flags(ucontext) {
                guest_uc.uc_mcontext.gregs[greg::ERR] = flags as u64;
            }
        }

        for (i, value) in state.mm.iter().enumerate() {
            guest_uc.fpregs_mem.st[i].significand = [
                value[0] as u16,
                (value[0] >> 16) as u16,
                (value[0] >> 32) as u16,
                (value[0] >> 48) as u16,
            ];
            guest_uc.fpregs_mem.st[i].exponent = value[1] as u16;
        }
        for (i, value) in state.xmm.iter().enumerate() {
            guest_uc.fpregs_mem.xmm[i].element = [
                value[0] as u32,
                (value[0] >> 32) as u32,
                value[1] as u32,
                (value[1] >> 32) as u32,
            ];
        }
        guest_uc.fpregs_mem.cwd = state.fcw;
        guest_uc.fpregs_mem.swd = state.reconstruct_fsw();
        guest_uc.fpregs_mem.mxcsr = state.mxcsr;

        guest_uc.uc_stack = *guest_stack;

        let guest_si = siginfo_location as *mut GuestSiginfo;
        guest_si.write(GuestSiginfo::zeroed());
        (*guest_si).si_signo = signal;
        match signal {
            libc::SIGSEGV | libc::SIGBUS => {
                (*guest_si).si_code = (*info).si_code;
                (*guest_si).si_errno = (*info).si_errno;
                (*guest_si).si_addr = (*info).si_addr() as u64;
            }
            _ => {
                #[cfg(debug_assertions)]
                eprintln!("unhandled siginfo_t fill for signal {signal}");
            }
        }

        if let Some(&backup_sp) = thread.signal_frames.last() {
            let backup = backup_sp as *mut ContextBackup;
            (*backup).ucontext_location = ucontext_location;
            (*backup).siginfo_location = siginfo_location;
            (*backup).fpstate_location = guest_uc.uc_mcontext.fpregs;
        }

        thread.frame.state.gregs[Reg::Rsi as usize] = siginfo_location;
        thread.frame.state.gregs[Reg::Rdx as usize] = ucontext_location;
    }

    thread.frame.state.rip = action.handler;
    thread.frame.state.gregs[Reg::Rdi as usize] = signal as u64;

    // Return path: the guest handler's `ret` lands on the host-controlled
    // sigreturn trampoline
    new_guest_sp -= 8;
    (new_guest_sp as *mut u64).write(thread.signal_return_address);
    thread.frame.state.gregs[Reg::Rsp as usize] = new_guest_sp;

    true
}

/// Handle the sigreturn and pause-return sentinel faults.
///
/// # Safety
/// Signal-handler context for this thread.
pub unsafe fn handle_sigreturn(thread: &mut ThreadState, ucontext: *mut c_void) -> bool {
    let pc = mcontext::get_pc(ucontext);
    if pc == thread.dispatcher.signal_handler_return || pc == thread.dispatcher.pause_return {
        restore_thread_state(thread, ucontext);
        thread.signal_handler_refcount.fetch_sub(1, Ordering::AcqRel);
        return true;
    }
    false
}

/// Handle the pause signal: suspend, stop, or complete a pause.
///
/// # Safety
/// Signal-handler context for this thread.
pub unsafe fn handle_signal_pause(
    thread: &mut ThreadState,
    signal: i32,
    ucontext: *mut c_void,
) -> bool {
    let reason =
        SignalEvent::from_u32(thread.frame.signal_reason.load(Ordering::Acquire));
    let pc = mcontext::get_pc(ucontext);
    let sra = thread.engine.config.sra;
    let in_jit = thread.is_address_in_jit_code(pc, false);

    match reason {
        SignalEvent::Pause => {
            store_thread_state(thread, signal, ucontext);
            let handler = if sra && in_jit {
                thread.dispatcher.thread_pause_handler_spill_sra
            } else {
                debug_assert!(
                    !sra || !thread.is_address_in_jit_code(pc, true),
                    "signal in dispatcher stubs has unsynchronized context"
                );
                thread.dispatcher.thread_pause_handler
            };
            mcontext::set_pc(ucontext, handler);
            mcontext::set_state(ucontext, thread.frame_ptr() as u64);
            thread.signal_handler_refcount.fetch_add(1, Ordering::AcqRel);
            thread
                .frame
                .signal_reason
                .store(SignalEvent::None as u32, Ordering::Release);
            true
        }
        SignalEvent::Stop => {
            // Unwind straight out of dispatch: SP back to the recorded entry
            // point, PC into the stop handler, refcounting moot.
            mcontext::set_sp(ucontext, thread.frame.returning_stack_location);
            thread.signal_handler_refcount.store(0, Ordering::Release);
            let handler = if sra && in_jit {
                thread.dispatcher.thread_stop_handler_spill_sra
            } else {
                thread.dispatcher.thread_stop_handler
            };
            mcontext::set_pc(ucontext, handler);
            thread
                .frame
                .signal_reason
                .store(SignalEvent::None as u32, Ordering::Release);
            true
        }
        SignalEvent::Return => {
            restore_thread_state(thread, ucontext);
            thread.signal_handler_refcount.fetch_sub(1, Ordering::AcqRel);
            thread
                .frame
                .signal_reason
                .store(SignalEvent::None as u32, Ordering::Release);
            true
        }
        SignalEvent::None => false,
    }
}

/// Top-level dispatch for one host signal on the faulting thread.
///
/// # Safety
/// Signal-handler context.
pub unsafe fn handle_host_signal(
    thread: &mut ThreadState,
    signal: i32,
    info: *const libc::siginfo_t,
    ucontext: *mut c_void,
) -> bool {
    if handle_sigreturn(thread, ucontext) {
        return true;
    }

    if signal == SIGNAL_FOR_PAUSE {
        return handle_signal_pause(thread, signal, ucontext);
    }

    let pc = mcontext::get_pc(ucontext);

    #[cfg(target_arch = "riscv64")]
    if signal == libc::SIGBUS && thread.is_address_in_jit_code(pc, false) {
        if crate::arch::unaligned::handle_sigbus(
            thread.engine.config.paranoid_tso,
            info,
            ucontext,
        ) {
            return true;
        }
    }

    // Host faults outside translated code belong to someone else
    if !thread.is_address_in_jit_code(pc, true) {
        return false;
    }

    let action = global().guest_action(signal);
    if action.handler == 0 {
        // No guest handler registered: let the default action play out
        return false;
    }
    let guest_stack = thread.guest_alt_stack;
    handle_guest_signal(thread, signal, info, ucontext, &action, &guest_stack)
}

// ===== Process-wide delegation =====

struct GuestActionSlot {
    handler: AtomicU64,
    flags: AtomicU64,
    mask: AtomicU64,
}

impl GuestActionSlot {
    const fn new() -> Self {
        GuestActionSlot {
            handler: AtomicU64::new(0),
            flags: AtomicU64::new(0),
            mask: AtomicU64::new(0),
        }
    }
}

/// Process-wide signal delegation: host handler registration plus the guest
/// `sigaction` table. Installation is mutex-guarded; the handler itself only
/// performs lock-free reads.
pub struct SignalDelegator {
    install_lock: Mutex<()>,
    previous: [Mutex<Option<libc::sigaction>>; MAX_SIGNALS + 1],
    guest_actions: [GuestActionSlot; MAX_SIGNALS + 1],
}

static DELEGATOR: OnceCell<SignalDelegator> = OnceCell::new();

pub fn global() -> &'static SignalDelegator {
    DELEGATOR.get_or_init(SignalDelegator::new)
}

impl SignalDelegator {
    fn new() -> Self {
        SignalDelegator {
            install_lock: Mutex::new(()),
            previous: std::array::from_fn(|_| Mutex::new(None)),
            guest_actions: std::array::from_fn(|_| GuestActionSlot::new()),
        }
    }

    /// Install the process-wide host handlers for the signals the core owns.
    pub fn install_host_handlers(&self) {
        let _guard = self.install_lock.lock();
        for signal in [libc::SIGILL, libc::SIGBUS, libc::SIGSEGV, SIGNAL_FOR_PAUSE] {
            // Safety: standard sigaction installation, old action retained
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = host_signal_handler as usize;
                action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
                libc::sigemptyset(&mut action.sa_mask);
                let mut old: libc::sigaction = std::mem::zeroed();
                if libc::sigaction(signal, &action, &mut old) == 0 {
                    *self.previous[signal as usize].lock() = Some(old);
                }
            }
        }
    }

    /// Record the guest's `sigaction` for `signal`; returns the old action.
    pub fn register_guest_sigaction(
        &self,
        signal: i32,
        action: GuestSigAction,
    ) -> GuestSigAction {
        let slot = &self.guest_actions[signal as usize];
        let old = GuestSigAction {
            handler: slot.handler.load(Ordering::Acquire),
            sa_flags: slot.flags.load(Ordering::Acquire),
            sa_mask: slot.mask.load(Ordering::Acquire),
        };
        slot.flags.store(action.sa_flags, Ordering::Release);
        slot.mask.store(action.sa_mask, Ordering::Release);
        slot.handler.store(action.handler, Ordering::Release);
        old
    }

    pub fn guest_action(&self, signal: i32) -> GuestSigAction {
        let slot = &self.guest_actions[signal as usize];
        GuestSigAction {
            handler: slot.handler.load(Ordering::Acquire),
            sa_flags: slot.flags.load(Ordering::Acquire),
            sa_mask: slot.mask.load(Ordering::Acquire),
        }
    }

    /// Forward an unowned fault to whatever was installed before us.
    ///
    /// # Safety
    /// Signal-handler context.
    unsafe fn run_previous_handler(
        &self,
        signal: i32,
        info: *mut libc::siginfo_t,
        ucontext: *mut c_void,
    ) {
        let previous = *self.previous[signal as usize].lock();
        match previous {
            Some(old) if old.sa_sigaction == libc::SIG_IGN => {}
            Some(old)
                if old.sa_sigaction != libc::SIG_DFL && old.sa_flags & libc::SA_SIGINFO != 0 =>
            {
                let handler: unsafe extern "C" fn(i32, *mut libc::siginfo_t, *mut c_void) =
                    std::mem::transmute(old.sa_sigaction);
                handler(signal, info, ucontext);
            }
            Some(old) if old.sa_sigaction != libc::SIG_DFL => {
                let handler: unsafe extern "C" fn(i32) = std::mem::transmute(old.sa_sigaction);
                handler(signal);
            }
            _ => {
                // Default disposition: reinstall and let the kernel act on
                // the re-raised signal when we return
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = libc::SIG_DFL;
                libc::sigemptyset(&mut action.sa_mask);
                libc::sigaction(signal, &action, std::ptr::null_mut());
                libc::raise(signal);
            }
        }
    }
}

/// The process-wide handler registered with the kernel.
///
/// # Safety
/// Installed via `sigaction` with `SA_SIGINFO`; called by the kernel.
unsafe extern "C" fn host_signal_handler(
    signal: i32,
    info: *mut libc::siginfo_t,
    ucontext: *mut c_void,
) {
    let frame = tls_frame();
    if !frame.is_null() {
        let thread = &mut *((*frame).thread as *mut ThreadState);
        if handle_host_signal(thread, signal, info, ucontext) {
            return;
        }
    }
    global().run_previous_handler(signal, info, ucontext);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::frontend::MiniDecoder;
    use crate::hooks::{DefaultCpuid, DenySyscalls};
    use crate::thread::Engine;

    const SIGNAL_RETURN: u64 = 0x9000;

    fn test_thread() -> Box<ThreadState> {
        let engine = Engine::new(EngineConfig::default(), HostIsa::Aarch64);
        ThreadState::new(
            engine,
            Box::new(MiniDecoder::new(SIGNAL_RETURN)),
            Box::new(DefaultCpuid),
            Box::new(DenySyscalls),
            SIGNAL_RETURN,
        )
        .unwrap()
    }

    /// A zeroed native ucontext whose host SP points into `host_stack`, with
    /// the arch-specific FP record chain set up where required.
    fn synthetic_ucontext(host_stack: &mut [u8]) -> Box<libc::ucontext_t> {
        let mut uc: Box<libc::ucontext_t> = Box::new(unsafe { std::mem::zeroed() });
        let sp = host_stack.as_mut_ptr() as u64 + host_stack.len() as u64;
        let sp = sp & !15;

        #[cfg(target_arch = "aarch64")]
        unsafe {
            let after_pstate = std::ptr::addr_of_mut!(uc.uc_mcontext.pstate) as usize + 8;
            let reserved = ((after_pstate + 15) & !15) as *mut u8;
            std::ptr::copy_nonoverlapping(
                mcontext::FPSIMD_MAGIC.to_le_bytes().as_ptr(),
                reserved,
                4,
            );
            std::ptr::copy_nonoverlapping(528u32.to_le_bytes().as_ptr(), reserved.add(4), 4);
        }
        #[cfg(target_arch = "x86_64")]
        {
            uc.uc_mcontext.fpregs = std::ptr::null_mut();
        }

        let ucp = &mut *uc as *mut libc::ucontext_t as *mut c_void;
        unsafe { mcontext::set_sp(ucp, sp) };
        uc
    }

    fn zeroed_siginfo(code: i32, addr: u64) -> Box<libc::siginfo_t> {
        let mut info: Box<libc::siginfo_t> = Box::new(unsafe { std::mem::zeroed() });
        info.si_code = code;
        // si_addr occupies the head of the union at offset 16
        unsafe {
            let base = &mut *info as *mut libc::siginfo_t as *mut u8;
            (base.add(16) as *mut u64).write_unaligned(addr);
        }
        info
    }

    #[test]
    fn test_store_restore_round_trip() {
        let mut thread = test_thread();
        let mut host_stack = vec![0u8; 64 * 1024];
        let mut uc = synthetic_ucontext(&mut host_stack);
        let ucp = &mut *uc as *mut libc::ucontext_t as *mut c_void;

        thread.frame.state.gregs[Reg::Rax as usize] = 0x1111;
        thread.frame.state.rip = 0x40_0000;

        unsafe {
            let sp_before = mcontext::get_sp(ucp);
            store_thread_state(&mut thread, libc::SIGSEGV, ucp);
            assert_eq!(thread.signal_frames.len(), 1);
            assert!(mcontext::get_sp(ucp) < sp_before);

            // Clobber guest state, then restore
            thread.frame.state.gregs[Reg::Rax as usize] = 0xFFFF;
            thread.frame.state.rip = 0;
            restore_thread_state(&mut thread, ucp);
        }
        assert!(thread.signal_frames.is_empty());
        assert_eq!(thread.frame.state.gregs[Reg::Rax as usize], 0x1111);
        assert_eq!(thread.frame.state.rip, 0x40_0000);
    }

    #[test]
    fn test_signal_frames_are_lifo() {
        let mut thread = test_thread();
        let mut host_stack = vec![0u8; 128 * 1024];
        let mut uc = synthetic_ucontext(&mut host_stack);
        let ucp = &mut *uc as *mut libc::ucontext_t as *mut c_void;

        unsafe {
            store_thread_state(&mut thread, libc::SIGSEGV, ucp);
            let first = thread.signal_frames[0];
            store_thread_state(&mut thread, libc::SIGILL, ucp);
            let second = thread.signal_frames[1];
            assert!(second < first, "nested backups grow downward");
            assert_eq!(thread.signal_frames.len(), 2);

            restore_thread_state(&mut thread, ucp);
            assert_eq!(thread.signal_frames, vec![first]);
            restore_thread_state(&mut thread, ucp);
            assert!(thread.signal_frames.is_empty());
        }
    }

    #[test]
    fn test_guest_signal_frame_layout() {
        let mut thread = test_thread();
        let mut host_stack = vec![0u8; 64 * 1024];
        let mut guest_stack = vec![0u8; 64 * 1024];
        let mut uc = synthetic_ucontext(&mut host_stack);
        let ucp = &mut *uc as *mut libc::ucontext_t as *mut c_void;

        let old_guest_sp = guest_stack.as_mut_ptr() as u64 + guest_stack.len() as u64 - 64;
        thread.frame.state.gregs[Reg::Rsp as usize] = old_guest_sp;
        thread.frame.state.gregs[Reg::Rax as usize] = 0x1234_5678;
        thread.frame.state.flags[crate::state::flag::X87_TOP] = 0b011;
        thread.frame.state.fcw = 0x037F;

        let action = GuestSigAction {
            handler: 0x5000,
            sa_flags: SA_SIGINFO,
            sa_mask: 0,
        };
        let stack = GuestStack::disabled();
        let info = zeroed_siginfo(1, 0);

        let handled = unsafe {
            handle_guest_signal(&mut thread, libc::SIGSEGV, &*info, ucp, &action, &stack)
        };
        assert!(handled);

        let state = &thread.frame.state;
        let expected_sp = old_guest_sp
            - RED_ZONE_SIZE
            - std::mem::size_of::<GuestUcontext>() as u64
            - std::mem::size_of::<GuestSiginfo>() as u64
            - 8;
        assert_eq!(state.gregs[Reg::Rsp as usize], expected_sp);

        // Top of stack: the sigreturn trampoline address
        let top = unsafe { (expected_sp as *const u64).read() };
        assert_eq!(top, SIGNAL_RETURN);

        // Handler arguments
        assert_eq!(state.gregs[Reg::Rdi as usize], libc::SIGSEGV as u64);
        let siginfo_loc = state.gregs[Reg::Rsi as usize];
        let ucontext_loc = state.gregs[Reg::Rdx as usize];
        assert_eq!(siginfo_loc, expected_sp + 8);
        assert_eq!(
            ucontext_loc,
            siginfo_loc + std::mem::size_of::<GuestSiginfo>() as u64
        );
        assert_eq!(state.rip, 0x5000);

        // Guest ucontext contents
        let guest_uc = unsafe { &*(ucontext_loc as *const GuestUcontext) };
        assert_eq!(guest_uc.uc_flags & UC_FP_XSTATE, UC_FP_XSTATE);
        assert_eq!(guest_uc.uc_mcontext.gregs[greg::RAX], 0x1234_5678);
        assert_eq!(guest_uc.uc_mcontext.gregs[greg::RSP], old_guest_sp);
        assert_eq!(
            guest_uc.uc_mcontext.fpregs,
            ucontext_loc + std::mem::offset_of!(GuestUcontext, fpregs_mem) as u64
        );
        assert_eq!(guest_uc.fpregs_mem.swd >> 11 & 0b111, 0b011);

        // Guest siginfo
        let guest_si = unsafe { &*(siginfo_loc as *const GuestSiginfo) };
        assert_eq!(guest_si.si_signo, libc::SIGSEGV);
        assert_eq!(guest_si.si_addr, 0);

        // Backup accounting
        assert_eq!(thread.signal_frames.len(), 1);
        assert_eq!(
            thread.signal_handler_refcount.load(Ordering::Acquire),
            1
        );

        // The resumed host context enters the dispatcher with the state
        // register pointing at the frame
        unsafe {
            assert_eq!(
                mcontext::get_pc(ucp),
                thread.dispatcher.absolute_loop_top_fill_sra
            );
            assert_eq!(mcontext::get_state(ucp), thread.frame_ptr() as u64);
        }

        // Guest handler rewrites the saved RAX through its ucontext, then
        // returns: the popped state must carry the edit.
        unsafe {
            let guest_uc = &mut *(ucontext_loc as *mut GuestUcontext);
            guest_uc.uc_mcontext.gregs[greg::RAX] = 0xdead_beef;
            restore_thread_state(&mut thread, ucp);
        }
        assert_eq!(thread.frame.state.gregs[Reg::Rax as usize], 0xdead_beef);
        assert_eq!(thread.frame.state.gregs[Reg::Rsp as usize], old_guest_sp);
    }

    #[test]
    fn test_alt_stack_switch() {
        let mut thread = test_thread();
        let mut host_stack = vec![0u8; 64 * 1024];
        let mut alt = vec![0u8; 64 * 1024];
        let mut uc = synthetic_ucontext(&mut host_stack);
        let ucp = &mut *uc as *mut libc::ucontext_t as *mut c_void;

        // Guest SP far away from the alternate stack
        let mut main_stack = vec![0u8; 4096];
        thread.frame.state.gregs[Reg::Rsp as usize] =
            main_stack.as_mut_ptr() as u64 + main_stack.len() as u64;

        let alt_base = alt.as_mut_ptr() as u64;
        let alt_size = alt.len() as u64;
        let stack = GuestStack::new(alt_base, 0, alt_size);
        let action = GuestSigAction { handler: 0x5000, sa_flags: SA_SIGINFO, sa_mask: 0 };
        let info = zeroed_siginfo(1, 0);

        unsafe {
            handle_guest_signal(&mut thread, libc::SIGSEGV, &*info, ucp, &action, &stack);
        }
        let new_sp = thread.frame.state.gregs[Reg::Rsp as usize];
        assert!(
            new_sp >= alt_base && new_sp < alt_base + alt_size,
            "frame must land on the alternate stack"
        );
    }

    #[test]
    fn test_pause_reason_stop_unwinds_to_anchor() {
        let mut thread = test_thread();
        let mut host_stack = vec![0u8; 16 * 1024];
        let mut uc = synthetic_ucontext(&mut host_stack);
        let ucp = &mut *uc as *mut libc::ucontext_t as *mut c_void;

        thread.frame.returning_stack_location = 0x7000_0000;
        thread
            .frame
            .signal_reason
            .store(SignalEvent::Stop as u32, Ordering::Release);

        let handled = unsafe { handle_signal_pause(&mut thread, SIGNAL_FOR_PAUSE, ucp) };
        assert!(handled);
        unsafe {
            assert_eq!(mcontext::get_sp(ucp), 0x7000_0000);
            assert_eq!(mcontext::get_pc(ucp), thread.dispatcher.thread_stop_handler);
        }
        assert_eq!(thread.signal_handler_refcount.load(Ordering::Acquire), 0);
        assert!(thread.signal_frames.is_empty(), "stop leaves the backup stack alone");
        assert_eq!(
            thread.frame.signal_reason.load(Ordering::Acquire),
            SignalEvent::None as u32
        );
    }

    #[test]
    fn test_pause_reason_none_is_unhandled() {
        let mut thread = test_thread();
        let mut host_stack = vec![0u8; 16 * 1024];
        let mut uc = synthetic_ucontext(&mut host_stack);
        let ucp = &mut *uc as *mut libc::ucontext_t as *mut c_void;
        assert!(!unsafe { handle_signal_pause(&mut thread, SIGNAL_FOR_PAUSE, ucp) });
    }

    #[test]
    fn test_guest_action_registry() {
        let delegator = SignalDelegator::new();
        let action = GuestSigAction { handler: 0xAAAA, sa_flags: SA_SIGINFO, sa_mask: 0xFF };
        let old = delegator.register_guest_sigaction(11, action);
        assert_eq!(old.handler, 0);
        let read_back = delegator.guest_action(11);
        assert_eq!(read_back.handler, 0xAAAA);
        assert_eq!(read_back.sa_flags, SA_SIGINFO);
        assert_eq!(delegator.guest_action(12).handler, 0);
    }

    #[test]
    fn test_fault_outside_jit_is_not_ours() {
        let mut thread = test_thread();
        let mut host_stack = vec![0u8; 16 * 1024];
        let mut uc = synthetic_ucontext(&mut host_stack);
        let ucp = &mut *uc as *mut libc::ucontext_t as *mut c_void;
        let info = zeroed_siginfo(1, 0);
        // PC is zero: not in any code buffer, not in the dispatcher
        let handled =
            unsafe { handle_host_signal(&mut thread, libc::SIGSEGV, &*info, ucp) };
        assert!(!handled);
    }
}
