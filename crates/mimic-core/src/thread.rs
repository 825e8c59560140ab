//! Per-guest-thread state and engine-wide thread control
//!
//! One OS thread per guest thread; each drives its own dispatcher loop. The
//! `ThreadState` owns everything generated code touches: the pinned state
//! frame, the lookup cache, the code-buffer pool, the dispatcher stubs, and
//! the collaborator hooks. The `Engine` carries process-wide pieces: the
//! configuration and the idle-wait accounting used by pause/resume.

use crate::arch::HostIsa;
use crate::codebuf::{BufferRegistry, CodeBuffer, INITIAL_CODE_SIZE};
use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, DispatcherCallbacks};
use crate::fallbacks;
use crate::frontend::BlockSource;
use crate::guest_uctx::GuestStack;
use crate::hooks::{cpuid_shim, syscall_shim, CpuidHandler, SyscallHandler};
use crate::jit::{buffer_demand, CompileOptions, JitBackend};
use crate::lookup::LookupCache;
use crate::signals;
use crate::state::{CpuStateFrame, SignalEvent};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

/// Process-wide engine state
pub struct Engine {
    pub config: EngineConfig,
    pub isa: HostIsa,
    /// Number of threads currently running guest code; pause/resume waits on
    /// this dropping to zero
    idle_wait_refcount: Mutex<usize>,
    idle_wait_cv: Condvar,
}

impl Engine {
    pub fn new(config: EngineConfig, isa: HostIsa) -> Arc<Engine> {
        Arc::new(Engine {
            config,
            isa,
            idle_wait_refcount: Mutex::new(0),
            idle_wait_cv: Condvar::new(),
        })
    }

    pub fn running_threads(&self) -> usize {
        *self.idle_wait_refcount.lock()
    }

    fn enter_running(&self) {
        *self.idle_wait_refcount.lock() += 1;
        self.idle_wait_cv.notify_all();
    }

    fn leave_running(&self) {
        *self.idle_wait_refcount.lock() -= 1;
        self.idle_wait_cv.notify_all();
    }

    /// Block until no thread is executing guest code.
    pub fn wait_idle(&self) {
        let mut count = self.idle_wait_refcount.lock();
        while *count != 0 {
            self.idle_wait_cv.wait(&mut count);
        }
    }
}

/// Wake-up event for a paused thread
pub struct StartRunning {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl StartRunning {
    fn new() -> Self {
        StartRunning { flag: Mutex::new(false), cv: Condvar::new() }
    }

    pub fn notify(&self) {
        *self.flag.lock() = true;
        self.cv.notify_all();
    }

    pub fn wait(&self) {
        let mut flag = self.flag.lock();
        while !*flag {
            self.cv.wait(&mut flag);
        }
        *flag = false;
    }
}

/// Everything one guest thread owns
pub struct ThreadState {
    pub engine: Arc<Engine>,
    /// Pinned: generated code holds its address in the state register
    pub frame: Box<CpuStateFrame>,
    pub lookup_cache: LookupCache,
    pub backend: JitBackend,
    pub dispatcher: Dispatcher,
    pub registry: BufferRegistry,
    /// Code buffers, oldest first; the last one is the active buffer.
    /// Retired buffers stay until a clear outside any signal frame.
    buffers: Vec<CodeBuffer>,
    /// LIFO of host-SP addresses of pushed `ContextBackup`s
    pub signal_frames: Vec<u64>,
    /// Non-zero while a host signal frame is live; gates buffer reclamation
    pub signal_handler_refcount: AtomicU32,
    pub guest_alt_stack: GuestStack,
    /// Guest address of the sigreturn trampoline pushed for guest handlers
    pub signal_return_address: u64,
    pub stop_requested: AtomicBool,
    /// Host TID once `dispatch` is entered, for directed pause signals
    pub tid: AtomicI32,
    pub start_running: StartRunning,
    pub frontend: Mutex<Box<dyn BlockSource>>,
    pub cpuid: Box<dyn CpuidHandler>,
    pub syscall: Box<dyn SyscallHandler>,
}

impl ThreadState {
    pub fn new(
        engine: Arc<Engine>,
        frontend: Box<dyn BlockSource>,
        cpuid: Box<dyn CpuidHandler>,
        syscall: Box<dyn SyscallHandler>,
        signal_return_address: u64,
    ) -> io::Result<Box<ThreadState>> {
        let callbacks = DispatcherCallbacks {
            core_dispatch: core_dispatch as usize as u64,
            exit_function_link: exit_function_link as usize as u64,
            sleep_thread: sleep_thread as usize as u64,
            ldiv: fallbacks::ldiv as usize as u64,
            lrem: fallbacks::lrem as usize as u64,
            ludiv: fallbacks::ludiv as usize as u64,
            lurem: fallbacks::lurem as usize as u64,
        };
        let dispatcher = Dispatcher::new(engine.isa, engine.config.sra, &callbacks)?;
        let backend = JitBackend::new(engine.isa);
        let lookup_cache = LookupCache::new(engine.config.virtual_memory_size);

        let mut registry = BufferRegistry::new();
        let (stub_base, stub_size) = dispatcher.stub_range();
        registry.set_dispatcher_range(stub_base, stub_size);

        let mut initial = CodeBuffer::new(INITIAL_CODE_SIZE)?;
        registry.register(initial.base(), initial.size());
        emit_detection_string(&mut initial, engine.isa);

        let config = engine.config.clone();
        let mut thread = Box::new(ThreadState {
            engine,
            frame: Box::new(CpuStateFrame::new()),
            lookup_cache,
            backend,
            dispatcher,
            registry,
            buffers: vec![initial],
            signal_frames: Vec::new(),
            signal_handler_refcount: AtomicU32::new(0),
            guest_alt_stack: GuestStack::disabled(),
            signal_return_address,
            stop_requested: AtomicBool::new(false),
            tid: AtomicI32::new(0),
            start_running: StartRunning::new(),
            frontend: Mutex::new(frontend),
            cpuid,
            syscall,
        });
        thread.init_frame_pointers(config.running_mode);
        Ok(thread)
    }

    fn init_frame_pointers(&mut self, running_mode: u32) {
        let thread_ptr = self as *mut ThreadState as *mut ();
        let frame = &mut *self.frame;
        frame.thread = thread_ptr;
        frame.running_mode = running_mode;

        self.dispatcher.init_thread_pointers(&mut frame.pointers);
        frame.pointers.l1_pointer = self.lookup_cache.l1_pointer();
        frame.pointers.signal_handler_refcount =
            &self.signal_handler_refcount as *const AtomicU32 as u64;
        frame.pointers.cpuid_obj = &self.cpuid as *const Box<dyn CpuidHandler> as u64;
        frame.pointers.cpuid_function = cpuid_shim as usize as u64;
        frame.pointers.syscall_obj = &self.syscall as *const Box<dyn SyscallHandler> as u64;
        frame.pointers.syscall_function = syscall_shim as usize as u64;
        fallbacks::fill_fallback_pointers(&mut frame.pointers.fallback_handlers);
    }

    pub fn frame_ptr(&mut self) -> *mut CpuStateFrame {
        &mut *self.frame as *mut CpuStateFrame
    }

    fn active_buffer(&mut self) -> &mut CodeBuffer {
        self.buffers.last_mut().expect("thread always owns a code buffer")
    }

    /// Whether `address` points into this thread's translated code.
    pub fn is_address_in_jit_code(&self, address: u64, include_dispatcher: bool) -> bool {
        self.registry.is_address_in_jit_code(address, include_dispatcher)
    }

    /// Record the guest's `sigaltstack` registration for this thread.
    pub fn set_guest_alt_stack(&mut self, stack: GuestStack) {
        self.guest_alt_stack = stack;
    }

    /// Translate the block at `guest_rip` and publish it in the cache.
    /// Returns the host entry.
    pub fn compile_block(&mut self, guest_rip: u64) -> u64 {
        self.compile_block_debug(guest_rip).host_entry
    }

    /// `compile_block` keeping the full compile record (exit sites,
    /// sub-block boundaries) for diagnostics and tests.
    pub fn compile_block_debug(&mut self, guest_rip: u64) -> crate::jit::CompiledBlock {
        let (ir, ra) = {
            let mut frontend = self.frontend.lock();
            frontend.compile_ir(&self.frame, guest_rip)
        };

        // Buffer headroom. A full buffer is recycled outright when no signal
        // frame is live; otherwise it is retained and a fresh one appended,
        // because translated code may still be referenced beneath a signal.
        let demand = buffer_demand(&ir);
        if self.active_buffer().remaining() < demand {
            if self.signal_handler_refcount.load(Ordering::Acquire) == 0 {
                self.clear_cache();
            } else {
                let mut fresh = CodeBuffer::new(INITIAL_CODE_SIZE.max(demand))
                    .expect("allocating replacement code buffer");
                self.registry.register(fresh.base(), fresh.size());
                emit_detection_string(&mut fresh, self.engine.isa);
                self.buffers.push(fresh);
            }
        }

        let opts = CompileOptions {
            entry: guest_rip,
            exit_linker_address: self.dispatcher.exit_function_linker,
            single_step_check: self.frame.running_mode != 0,
            sra: self.engine.config.sra,
            half_barrier_tso: self.engine.config.half_barrier_tso,
        };
        let backend = &self.backend;
        let buf = self.buffers.last_mut().expect("active buffer");
        let compiled = backend.compile_block(buf, &ir, &ra, &opts);
        self.lookup_cache.insert(guest_rip, compiled.host_entry);
        compiled
    }

    /// Drop every translation. Retired buffers are freed and the active
    /// buffer recycled — only legal while no host signal frame is live.
    /// Returns false (and does nothing) otherwise.
    pub fn clear_cache(&mut self) -> bool {
        if self.signal_handler_refcount.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.lookup_cache.clear();
        while self.buffers.len() > 1 {
            let retired = self.buffers.remove(0);
            self.registry.remove(retired.base());
        }
        let isa = self.engine.isa;
        let buf = self.active_buffer();
        buf.reset();
        emit_detection_string(buf, isa);
        true
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Run guest code from the frame's current RIP until the thread stops.
    ///
    /// # Safety
    /// Guest state (RIP, RSP) must point at mapped guest code/stack, and the
    /// process must run on the engine's host ISA.
    pub unsafe fn dispatch(&mut self) {
        self.tid.store(host_tid(), Ordering::Release);
        signals::register_tls_frame(self.frame_ptr());
        self.engine.enter_running();
        let frame = self.frame_ptr();
        self.dispatcher.dispatch(frame);
        self.engine.leave_running();
        signals::register_tls_frame(std::ptr::null_mut());
    }

    /// Ask the thread to stop at its next dispatcher crossing; from another
    /// thread, pair with `kick` to interrupt JIT code.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    /// Deliver the pause signal carrying `reason` to the thread.
    pub fn signal_event(&self, reason: SignalEvent) {
        self.frame.signal_reason.store(reason as u32, Ordering::Release);
        let tid = self.tid.load(Ordering::Acquire);
        if tid != 0 {
            // Safety: plain tgkill on our own process
            unsafe {
                libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, signals::SIGNAL_FOR_PAUSE);
            }
        }
    }
}

fn host_tid() -> i32 {
    // Safety: gettid has no failure modes
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

fn emit_detection_string(buf: &mut CodeBuffer, isa: HostIsa) {
    // Debugging aid when staring at raw memory dumps of the JIT space
    buf.append(b"mimicjit::");
    buf.append(isa.name().as_bytes());
    buf.append(&[0]);
    buf.align_to(8);
}

// ===== Entry points called from generated code =====

/// The dispatcher loop body: probe the cache for the frame's RIP, compiling
/// on a miss, and return the host entry to branch to.
///
/// # Safety
/// Called only from generated dispatcher stubs with a live frame.
pub unsafe extern "C" fn core_dispatch(frame: *mut CpuStateFrame) -> u64 {
    let thread = &mut *((*frame).thread as *mut ThreadState);

    if thread.stop_requested.swap(false, Ordering::AcqRel) {
        return thread.dispatcher.thread_stop_handler;
    }

    let rip = (*frame).state.rip;
    let mut host = thread.lookup_cache.find_block(rip);
    if host == 0 {
        // Mask all signals while the compiler may allocate
        let mask = thread
            .engine
            .config
            .signal_safe_compile
            .then(signals::block_all_signals);
        host = thread.compile_block(rip);
        if let Some(previous) = mask {
            signals::restore_signal_mask(&previous);
        }
    }
    thread.lookup_cache.refresh_l1(rip, host);
    host
}

/// Exit-linker entry: resolve the record's guest target and patch the call
/// site, or bounce to the loop top on a miss.
///
/// # Safety
/// Called only from the generated linker thunk; `record` is a live link
/// record inside this thread's code buffers.
pub unsafe extern "C" fn exit_function_link(frame: *mut CpuStateFrame, record: *mut u64) -> u64 {
    let thread = &mut *((*frame).thread as *mut ThreadState);

    let mask = thread
        .engine
        .config
        .signal_safe_compile
        .then(signals::block_all_signals);

    let isa = thread.engine.isa;
    let linker = thread.dispatcher.exit_function_linker;
    let result = crate::jit::linker::exit_function_link(
        &mut thread.lookup_cache,
        isa,
        record as u64,
        linker,
    );

    if let Some(previous) = mask {
        signals::restore_signal_mask(&previous);
    }

    match result {
        crate::jit::linker::LinkResult::Linked { host_code } => host_code,
        crate::jit::linker::LinkResult::Missing { guest_target } => {
            (*frame).state.rip = guest_target;
            thread.dispatcher.absolute_loop_top
        }
    }
}

/// Pause-handler entry: park until resumed.
///
/// # Safety
/// Called only from the generated pause stub with a live frame.
pub unsafe extern "C" fn sleep_thread(frame: *mut CpuStateFrame) {
    let thread = &mut *((*frame).thread as *mut ThreadState);
    thread.engine.leave_running();
    thread.start_running.wait();
    thread.engine.enter_running();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::MiniDecoder;
    use crate::hooks::{DefaultCpuid, DenySyscalls};

    pub(crate) fn test_thread() -> Box<ThreadState> {
        let engine = Engine::new(EngineConfig::default(), HostIsa::Aarch64);
        ThreadState::new(
            engine,
            Box::new(MiniDecoder::new(0x9000)),
            Box::new(DefaultCpuid),
            Box::new(DenySyscalls),
            0x9000,
        )
        .unwrap()
    }

    #[test]
    fn test_thread_frame_back_pointer() {
        let mut thread = test_thread();
        let frame = thread.frame_ptr();
        unsafe {
            assert_eq!(
                (*frame).thread as *mut ThreadState as usize,
                &mut *thread as *mut ThreadState as usize
            );
        }
    }

    #[test]
    fn test_pointer_table_fully_populated() {
        let thread = test_thread();
        let p = &thread.frame.pointers;
        assert_ne!(p.dispatcher_loop_top, 0);
        assert_ne!(p.exit_function_linker, 0);
        assert_ne!(p.l1_pointer, 0);
        assert_ne!(p.signal_handler_refcount, 0);
        assert_ne!(p.cpuid_function, 0);
        assert_ne!(p.syscall_function, 0);
        assert!(p.fallback_handlers.iter().take(20).all(|&h| h != 0));
    }

    #[test]
    fn test_compile_then_find() {
        let mut thread = test_thread();
        // mov eax, 7 ; jmp +0 at a host buffer standing in for guest memory
        let code = [0xB8u8, 7, 0, 0, 0, 0xEB, 0x00];
        let rip = code.as_ptr() as u64;
        let host = thread.compile_block(rip);
        assert_ne!(host, 0);
        assert_eq!(thread.lookup_cache.find_block(rip), host);
    }

    #[test]
    fn test_detection_string_leads_buffer() {
        let thread = test_thread();
        let buf = thread.buffers.last().unwrap();
        let head = buf.bytes_at(buf.base(), 10);
        assert_eq!(head, b"mimicjit::");
    }

    #[test]
    fn test_cache_overflow_mid_signal_retains_buffers() {
        let mut thread = test_thread();
        let code = [0xB8u8, 7, 0, 0, 0, 0xEB, 0x00];
        let rip = code.as_ptr() as u64;
        thread.compile_block(rip);
        assert_eq!(thread.buffer_count(), 1);

        // Exhaust the active buffer while a signal frame is live
        thread.signal_handler_refcount.store(1, Ordering::Release);
        let waste = thread.active_buffer().remaining() - 64;
        thread.active_buffer().append(&vec![0u8; waste]);
        thread.compile_block(rip + 5);

        assert_eq!(thread.buffer_count(), 2, "old buffer must be retained");
        // Clearing is refused while the refcount is held
        assert!(!thread.clear_cache());
        assert_eq!(thread.buffer_count(), 2);

        // Once the last signal exits, an explicit clear frees retained
        // buffers and recycles the active one
        thread.signal_handler_refcount.store(0, Ordering::Release);
        assert!(thread.clear_cache());
        assert_eq!(thread.buffer_count(), 1);
        assert_eq!(thread.lookup_cache.block_count(), 0);
    }

    #[test]
    fn test_clear_cache_then_recompile_same_entry() {
        let mut thread = test_thread();
        let code = [0xB8u8, 7, 0, 0, 0, 0xEB, 0x00];
        let rip = code.as_ptr() as u64;
        let first = thread.compile_block(rip);
        assert!(thread.clear_cache());
        assert_eq!(thread.lookup_cache.find_block(rip), 0);
        let second = thread.compile_block(rip);
        // Same bump cursor after recycling: identical placement
        assert_eq!(first, second);
    }
}
