//! Dispatcher
//!
//! The per-thread trampoline set driving the translate-execute-return loop.
//! Every fragment the original implementation wrote as a naked function is
//! emitted here at construction time with the same emitters the JIT uses,
//! into a small dedicated stub buffer:
//!
//! - the dispatch entry (callee-saved state into the frame's jump anchor,
//!   host SP into `returning_stack_location`),
//! - the loop top in spill and fill-SRA variants,
//! - the exit-function linker thunk,
//! - thread stop/pause handlers and the sigreturn/pause-return sentinels,
//! - long-division helper thunks.
//!
//! The state pointer contract (`x28`/`x27` is callee-saved and never
//! clobbered across calls into Rust) holds by construction of these stubs.

use crate::arch::aarch64 as a64;
use crate::arch::riscv as rv;
use crate::arch::HostIsa;
use crate::codebuf::{flush_icache, CodeBuffer};
use crate::state::{
    jump_anchor_offset, returning_stack_location_offset, CpuStateFrame, PointerTable,
};
use std::io;

const STUB_BUFFER_SIZE: usize = 8192;

/// Addresses of the Rust entry points the stubs call back into
#[derive(Debug, Clone, Copy)]
pub struct DispatcherCallbacks {
    /// `extern "C" fn(*mut CpuStateFrame) -> u64`: cache probe + compile
    pub core_dispatch: u64,
    /// `extern "C" fn(*mut CpuStateFrame, *mut u64) -> u64`: exit linking
    pub exit_function_link: u64,
    /// `extern "C" fn(*mut CpuStateFrame)`: block until resumed
    pub sleep_thread: u64,
    pub ldiv: u64,
    pub lrem: u64,
    pub ludiv: u64,
    pub lurem: u64,
}

/// Generated trampolines and their published addresses for one thread
pub struct Dispatcher {
    isa: HostIsa,
    sra: bool,
    buffer: CodeBuffer,

    pub dispatch_entry: u64,
    pub absolute_loop_top: u64,
    pub absolute_loop_top_fill_sra: u64,
    pub exit_function_linker: u64,
    pub thread_stop_handler: u64,
    pub thread_stop_handler_spill_sra: u64,
    pub thread_pause_handler: u64,
    pub thread_pause_handler_spill_sra: u64,
    /// Deliberately-invalid instruction: return trampoline from a guest
    /// signal handler
    pub signal_handler_return: u64,
    /// Deliberately-invalid instruction: completion of a thread pause
    pub pause_return: u64,
    pub unimplemented_instruction: u64,
    pub overflow_exception: u64,
    pub ldiv_handler: u64,
    pub lrem_handler: u64,
    pub ludiv_handler: u64,
    pub lurem_handler: u64,
}

impl Dispatcher {
    pub fn new(isa: HostIsa, sra: bool, callbacks: &DispatcherCallbacks) -> io::Result<Self> {
        let mut buffer = CodeBuffer::new(STUB_BUFFER_SIZE)?;
        let addrs = match isa {
            HostIsa::Aarch64 => generate_aarch64(&mut buffer, sra, callbacks),
            HostIsa::Riscv64 => generate_riscv(&mut buffer, sra, callbacks),
        };
        flush_icache(buffer.base(), buffer.cursor_offset());
        Ok(Dispatcher {
            isa,
            sra,
            buffer,
            dispatch_entry: addrs.dispatch_entry,
            absolute_loop_top: addrs.absolute_loop_top,
            absolute_loop_top_fill_sra: addrs.absolute_loop_top_fill_sra,
            exit_function_linker: addrs.exit_function_linker,
            thread_stop_handler: addrs.thread_stop_handler,
            thread_stop_handler_spill_sra: addrs.thread_stop_handler_spill_sra,
            thread_pause_handler: addrs.thread_pause_handler,
            thread_pause_handler_spill_sra: addrs.thread_pause_handler_spill_sra,
            signal_handler_return: addrs.signal_handler_return,
            pause_return: addrs.pause_return,
            unimplemented_instruction: addrs.unimplemented_instruction,
            overflow_exception: addrs.overflow_exception,
            ldiv_handler: addrs.ldiv_handler,
            lrem_handler: addrs.lrem_handler,
            ludiv_handler: addrs.ludiv_handler,
            lurem_handler: addrs.lurem_handler,
        })
    }

    pub fn isa(&self) -> HostIsa {
        self.isa
    }

    pub fn sra_enabled(&self) -> bool {
        self.sra
    }

    /// The stub buffer's range, for `is_address_in_jit_code` with
    /// `include_dispatcher`.
    pub fn stub_range(&self) -> (u64, usize) {
        (self.buffer.base(), self.buffer.size())
    }

    pub fn contains(&self, address: u64) -> bool {
        let (start, size) = self.stub_range();
        address >= start && address < start + size as u64
    }

    /// Publish this dispatcher's addresses in a thread's pointer table.
    pub fn init_thread_pointers(&self, pointers: &mut PointerTable) {
        pointers.dispatcher_loop_top = self.absolute_loop_top;
        pointers.dispatcher_loop_top_fill_sra = self.absolute_loop_top_fill_sra;
        pointers.exit_function_linker = self.exit_function_linker;
        pointers.thread_stop_handler = self.thread_stop_handler;
        pointers.thread_stop_handler_spill_sra = self.thread_stop_handler_spill_sra;
        pointers.thread_pause_handler = self.thread_pause_handler;
        pointers.thread_pause_handler_spill_sra = self.thread_pause_handler_spill_sra;
        pointers.unimplemented_instruction_handler = self.unimplemented_instruction;
        pointers.overflow_exception_handler = self.overflow_exception;
        pointers.signal_return_handler = self.signal_handler_return;
        pointers.ldiv_handler = self.ldiv_handler;
        pointers.lrem_handler = self.lrem_handler;
        pointers.ludiv_handler = self.ludiv_handler;
        pointers.lurem_handler = self.lurem_handler;
    }

    /// Enter the dispatcher loop; returns when the thread is stopped.
    ///
    /// # Safety
    /// `frame` must be the live, pinned state frame of the calling thread,
    /// with its pointer table fully initialized; the process must be running
    /// on this dispatcher's host ISA.
    pub unsafe fn dispatch(&self, frame: *mut CpuStateFrame) {
        assert_eq!(
            HostIsa::native(),
            Some(self.isa),
            "generated code targets {} but the process runs elsewhere",
            self.isa.name()
        );
        let entry: unsafe extern "C" fn(*mut CpuStateFrame) =
            std::mem::transmute(self.dispatch_entry as usize);
        entry(frame);
    }
}

struct StubAddresses {
    dispatch_entry: u64,
    absolute_loop_top: u64,
    absolute_loop_top_fill_sra: u64,
    exit_function_linker: u64,
    thread_stop_handler: u64,
    thread_stop_handler_spill_sra: u64,
    thread_pause_handler: u64,
    thread_pause_handler_spill_sra: u64,
    signal_handler_return: u64,
    pause_return: u64,
    unimplemented_instruction: u64,
    overflow_exception: u64,
    ldiv_handler: u64,
    lrem_handler: u64,
    ludiv_handler: u64,
    lurem_handler: u64,
}

fn generate_aarch64(buf: &mut CodeBuffer, sra: bool, cb: &DispatcherCallbacks) -> StubAddresses {
    use a64::*;
    let mut e = A64Emitter::new(buf);

    let rsl = returning_stack_location_offset() as u32;

    // -- dispatch entry: x0 = frame
    let dispatch_entry = e.cursor();
    // Callee-saved registers land in the frame's jump anchor; the thread
    // stop handler reloads them to "long-jump" out of dispatch.
    e.add_imm(X1, X0, jump_anchor_offset(0) as u32);
    e.stp(X19, X20, X1, 0);
    e.stp(X21, X22, X1, 16);
    e.stp(X23, X24, X1, 32);
    e.stp(X25, X26, X1, 48);
    e.stp(X27, X28, X1, 64);
    e.stp(X29, LR, X1, 80);
    e.stp_d(VReg(8), VReg(9), X1, 96);
    e.stp_d(VReg(10), VReg(11), X1, 112);
    e.stp_d(VReg(12), VReg(13), X1, 128);
    e.stp_d(VReg(14), VReg(15), X1, 144);
    e.mov(STATE, X0);
    e.mov_sp(X1, SP);
    e.str(8, X1, STATE, rsl);
    let to_loop = e.new_label();
    e.b_label(to_loop);

    // -- loop top, spill variant: entered from JIT on an indirect exit
    let absolute_loop_top = e.cursor();
    if sra {
        emit_spill_static_regs(&mut e);
    }
    // -- loop top, fill variant: entered with SRA already in the frame
    let absolute_loop_top_fill_sra = e.cursor();
    e.bind(to_loop);
    e.mov(X0, STATE);
    e.load_constant(X2, cb.core_dispatch);
    e.blr(X2);
    if sra {
        emit_fill_static_regs(&mut e);
    }
    e.br(X0);

    // -- exit-function linker thunk: lr points at the link record
    let exit_function_linker = e.cursor();
    e.mov(X0, STATE);
    e.mov(X1, LR);
    if sra {
        emit_spill_static_regs(&mut e);
    }
    e.load_constant(X2, cb.exit_function_link);
    e.blr(X2);
    if sra {
        emit_fill_static_regs(&mut e);
    }
    e.br(X0);

    // -- thread stop: unwind to the dispatch caller
    let thread_stop_handler_spill_sra = e.cursor();
    if sra {
        emit_spill_static_regs(&mut e);
    }
    let thread_stop_handler = e.cursor();
    e.ldr(8, X1, STATE, rsl);
    e.mov_sp(SP, X1);
    e.add_imm(X1, STATE, jump_anchor_offset(0) as u32);
    e.ldp(X19, X20, X1, 0);
    e.ldp(X21, X22, X1, 16);
    e.ldp(X23, X24, X1, 32);
    e.ldp(X25, X26, X1, 48);
    e.ldp(X27, X28, X1, 64);
    e.ldp(X29, LR, X1, 80);
    e.ldp_d(VReg(8), VReg(9), X1, 96);
    e.ldp_d(VReg(10), VReg(11), X1, 112);
    e.ldp_d(VReg(12), VReg(13), X1, 128);
    e.ldp_d(VReg(14), VReg(15), X1, 144);
    e.ret();

    // -- thread pause: sleep, then fault back through the pause-return
    // sentinel so the signal core restores the interrupted context
    let thread_pause_handler_spill_sra = e.cursor();
    if sra {
        emit_spill_static_regs(&mut e);
    }
    let thread_pause_handler = e.cursor();
    e.mov(X0, STATE);
    e.load_constant(X2, cb.sleep_thread);
    e.blr(X2);
    let pause_return = e.cursor();
    e.hlt(2);

    // -- sigreturn sentinel: gdb swallows SIGTRAP, so fault with hlt
    let signal_handler_return = e.cursor();
    e.hlt(1);

    // -- guest SIGILL injection
    let unimplemented_instruction = e.cursor();
    if sra {
        emit_spill_static_regs(&mut e);
    }
    e.hlt(3);

    // -- INTO/#OF; only the faulting sentinel is defined by x86 semantics
    let overflow_exception = e.cursor();
    e.hlt(4);

    // -- long-division helper thunks
    let mut div_thunk = |e: &mut A64Emitter, target: u64| -> u64 {
        let at = e.cursor();
        emit_push_dynamic_regs_lr(e);
        if sra {
            emit_spill_static_regs(e);
        }
        e.load_constant(X3, target);
        e.blr(X3);
        if sra {
            emit_fill_static_regs(e);
        }
        emit_pop_dynamic_regs_lr(e);
        e.ret();
        at
    };
    let ldiv_handler = div_thunk(&mut e, cb.ldiv);
    let lrem_handler = div_thunk(&mut e, cb.lrem);
    let ludiv_handler = div_thunk(&mut e, cb.ludiv);
    let lurem_handler = div_thunk(&mut e, cb.lurem);

    StubAddresses {
        dispatch_entry,
        absolute_loop_top,
        absolute_loop_top_fill_sra,
        exit_function_linker,
        thread_stop_handler,
        thread_stop_handler_spill_sra,
        thread_pause_handler,
        thread_pause_handler_spill_sra,
        signal_handler_return,
        pause_return,
        unimplemented_instruction,
        overflow_exception,
        ldiv_handler,
        lrem_handler,
        ludiv_handler,
        lurem_handler,
    }
}

fn generate_riscv(buf: &mut CodeBuffer, sra: bool, cb: &DispatcherCallbacks) -> StubAddresses {
    use rv::*;
    let mut e = RvEmitter::new(buf);

    let rsl = returning_stack_location_offset();

    // -- dispatch entry: a0 = frame
    let dispatch_entry = e.cursor();
    emit_push_callee_saved(&mut e);
    e.mv(STATE, A0);
    // The recorded SP sits atop the callee-saved block the stop handler pops
    e.sd(SP, rsl, STATE);
    let to_loop = e.new_label();
    e.j_label(to_loop);

    let absolute_loop_top = e.cursor();
    if sra {
        emit_spill_static_regs(&mut e);
    }
    let absolute_loop_top_fill_sra = e.cursor();
    e.bind(to_loop);
    e.mv(A0, STATE);
    e.load_constant(TMP1, cb.core_dispatch);
    e.call_reg(TMP1);
    // a0 is itself a statically-allocated register; carry the target across
    // the fill in a reserved temporary
    e.mv(TMP1, A0);
    if sra {
        emit_fill_static_regs(&mut e);
    }
    e.jr(TMP1);

    // -- exit-function linker thunk: the link temporary points 4 bytes
    // before the record
    let exit_function_linker = e.cursor();
    if sra {
        emit_spill_static_regs(&mut e);
    }
    e.mv(A0, STATE);
    e.addi(A1, TMP2, 4);
    e.load_constant(TMP1, cb.exit_function_link);
    e.call_reg(TMP1);
    e.mv(TMP1, A0);
    if sra {
        emit_fill_static_regs(&mut e);
    }
    e.jr(TMP1);

    // -- thread stop
    let thread_stop_handler_spill_sra = e.cursor();
    if sra {
        emit_spill_static_regs(&mut e);
    }
    let thread_stop_handler = e.cursor();
    e.ld(SP, rsl, STATE);
    emit_pop_callee_saved(&mut e);
    e.ret();

    // Pause, sigreturn, and the remaining service stubs are still
    // placeholder faults on this port; their semantics are pinned by the
    // AArch64 dispatcher.
    let thread_pause_handler_spill_sra = e.cursor();
    e.ebreak();
    let thread_pause_handler = e.cursor();
    e.ebreak();
    let pause_return = e.cursor();
    e.ebreak();
    let signal_handler_return = e.cursor();
    e.ebreak();
    let unimplemented_instruction = e.cursor();
    e.ebreak();
    let overflow_exception = e.cursor();
    e.ebreak();

    StubAddresses {
        dispatch_entry,
        absolute_loop_top,
        absolute_loop_top_fill_sra,
        exit_function_linker,
        thread_stop_handler,
        thread_stop_handler_spill_sra,
        thread_pause_handler,
        thread_pause_handler_spill_sra,
        signal_handler_return,
        pause_return,
        unimplemented_instruction,
        overflow_exception,
        // The helper ABI needs no thunk here: dynamic registers are
        // callee-saved and the backend spills SRA around the call itself.
        ldiv_handler: cb.ldiv,
        lrem_handler: cb.lrem,
        ludiv_handler: cb.ludiv,
        lurem_handler: cb.lurem,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callbacks() -> DispatcherCallbacks {
        DispatcherCallbacks {
            core_dispatch: 0x1111_0000,
            exit_function_link: 0x1111_0100,
            sleep_thread: 0x1111_0200,
            ldiv: 0x1111_0300,
            lrem: 0x1111_0400,
            ludiv: 0x1111_0500,
            lurem: 0x1111_0600,
        }
    }

    fn all_addresses(d: &Dispatcher) -> Vec<u64> {
        vec![
            d.dispatch_entry,
            d.absolute_loop_top,
            d.absolute_loop_top_fill_sra,
            d.exit_function_linker,
            d.thread_stop_handler,
            d.thread_stop_handler_spill_sra,
            d.thread_pause_handler,
            d.thread_pause_handler_spill_sra,
            d.signal_handler_return,
            d.pause_return,
            d.unimplemented_instruction,
            d.overflow_exception,
        ]
    }

    #[test]
    fn test_aarch64_stub_layout() {
        let d = Dispatcher::new(HostIsa::Aarch64, true, &callbacks()).unwrap();
        let (base, size) = d.stub_range();
        for addr in all_addresses(&d) {
            assert!(addr >= base && addr < base + size as u64);
            assert_eq!(addr % 4, 0);
        }
        // The spill variant precedes the fill variant and they differ by
        // exactly the spill sequence (16 paired stores).
        assert_eq!(
            d.absolute_loop_top_fill_sra - d.absolute_loop_top,
            16 * 4
        );
        // The division thunks live in the buffer, not at the raw helpers
        assert!(d.contains(d.ludiv_handler));
        assert!(d.contains(d.ldiv_handler));
    }

    #[test]
    fn test_aarch64_sentinels_are_distinct_faults() {
        let d = Dispatcher::new(HostIsa::Aarch64, true, &callbacks()).unwrap();
        assert_ne!(d.signal_handler_return, d.pause_return);
        // Both sentinels decode as hlt
        for (addr, imm) in [(d.signal_handler_return, 1u32), (d.pause_return, 2u32)] {
            let word = u32::from_le_bytes(
                d.buffer.bytes_at(addr, 4).try_into().unwrap(),
            );
            assert_eq!(word, 0xD440_0000 | imm << 5);
        }
    }

    #[test]
    fn test_no_spill_variants_collapse_without_sra() {
        let d = Dispatcher::new(HostIsa::Aarch64, false, &callbacks()).unwrap();
        assert_eq!(d.absolute_loop_top, d.absolute_loop_top_fill_sra);
        assert_eq!(d.thread_stop_handler, d.thread_stop_handler_spill_sra);
    }

    #[test]
    fn test_riscv_stub_layout() {
        let d = Dispatcher::new(HostIsa::Riscv64, true, &callbacks()).unwrap();
        let (base, size) = d.stub_range();
        for addr in all_addresses(&d) {
            assert!(addr >= base && addr < base + size as u64);
        }
        // Placeholder stubs each get their own faulting address
        let placeholders = [
            d.thread_pause_handler,
            d.thread_pause_handler_spill_sra,
            d.pause_return,
            d.signal_handler_return,
            d.unimplemented_instruction,
            d.overflow_exception,
        ];
        for pair in placeholders.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
        // Division helpers are direct calls on this port
        assert!(!d.contains(d.ludiv_handler));
    }

    #[test]
    fn test_init_thread_pointers_publishes_addresses() {
        let d = Dispatcher::new(HostIsa::Aarch64, true, &callbacks()).unwrap();
        let mut pointers = PointerTable::new();
        d.init_thread_pointers(&mut pointers);
        assert_eq!(pointers.dispatcher_loop_top, d.absolute_loop_top);
        assert_eq!(pointers.signal_return_handler, d.signal_handler_return);
        assert_eq!(pointers.ludiv_handler, d.ludiv_handler);
        assert_ne!(pointers.exit_function_linker, 0);
    }
}
