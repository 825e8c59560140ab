//! mimic runner: execute a flat x86-64 image through the engine
//!
//! Loads raw guest bytes into memory, points guest RIP at them, and drives
//! the dispatcher until the guest exits. Uses the reference front-end, so
//! the supported guest instruction set is the decoder's subset; real
//! front-ends plug in through the same `BlockSource` interface.

use anyhow::{bail, Context, Result};
use clap::Parser;
use mimic_core::frontend::MiniDecoder;
use mimic_core::hooks::{DefaultCpuid, SyscallHandler};
use mimic_core::signals;
use mimic_core::thread::{Engine, ThreadState};
use mimic_core::{CpuStateFrame, EngineConfig, HostIsa, Reg};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "mimic", about = "Run a flat x86-64 image under the mimic engine")]
struct Args {
    /// Raw guest image (bytes are executed from offset 0)
    image: PathBuf,

    /// Engine configuration (JSON); environment variables override
    #[arg(long)]
    config: Option<PathBuf>,

    /// Guest stack size in bytes
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    stack_size: usize,

    /// Print final guest register state on exit
    #[arg(long)]
    dump_state: bool,

    /// Decode and translate the entry block, then exit without executing
    /// (works on any build host)
    #[arg(long)]
    translate_only: bool,
}

/// Linux-style syscall surface: exit/exit_group stop the thread, write goes
/// to the real file descriptor. Everything else returns -ENOSYS.
struct RunnerSyscalls {
    thread: AtomicU64,
    exit_code: AtomicU64,
}

impl RunnerSyscalls {
    fn new() -> Arc<RunnerSyscalls> {
        Arc::new(RunnerSyscalls { thread: AtomicU64::new(0), exit_code: AtomicU64::new(0) })
    }

    fn bind(&self, thread: &ThreadState) {
        self.thread.store(thread as *const ThreadState as u64, Ordering::Release);
    }

    fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire) as i32
    }
}

struct RunnerSyscallsHandle(Arc<RunnerSyscalls>);

impl SyscallHandler for RunnerSyscallsHandle {
    fn dispatch(&self, frame: &mut CpuStateFrame) -> u64 {
        let nr = frame.state.gregs[Reg::Rax as usize];
        let a0 = frame.state.gregs[Reg::Rdi as usize];
        let a1 = frame.state.gregs[Reg::Rsi as usize];
        let a2 = frame.state.gregs[Reg::Rdx as usize];
        match nr {
            // write
            1 => unsafe {
                libc::write(a0 as i32, a1 as *const libc::c_void, a2 as usize) as u64
            },
            // exit, exit_group
            60 | 231 => {
                self.0.exit_code.store(a0, Ordering::Release);
                let thread = self.0.thread.load(Ordering::Acquire) as *const ThreadState;
                if !thread.is_null() {
                    // Safety: bound to the live thread before dispatch
                    unsafe { (*thread).request_stop() };
                }
                0
            }
            _ => {
                const ENOSYS: u64 = 38;
                ENOSYS.wrapping_neg()
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::from_env(),
    };

    let image = std::fs::read(&args.image)
        .with_context(|| format!("reading image {}", args.image.display()))?;
    if image.is_empty() {
        bail!("image is empty");
    }

    let isa = match HostIsa::native() {
        Some(isa) => isa,
        None if args.translate_only => HostIsa::Aarch64,
        None => bail!("this host ISA cannot execute generated code; use --translate-only"),
    };

    // Guest memory: the process address space. Code and stack are plain
    // allocations; their host addresses are the guest addresses.
    let mut code = image;
    let entry = code.as_mut_ptr() as u64;
    let mut stack = vec![0u8; args.stack_size];
    let stack_top = (stack.as_mut_ptr() as u64 + stack.len() as u64 - 64) & !15;

    // One page of reserved guest addresses for the sigreturn trampoline
    let trampoline = vec![0u8; 4096];
    let signal_return = trampoline.as_ptr() as u64;

    let syscalls = RunnerSyscalls::new();
    let engine = Engine::new(config, isa);
    let mut thread = ThreadState::new(
        engine,
        Box::new(MiniDecoder::new(signal_return)),
        Box::new(DefaultCpuid),
        Box::new(RunnerSyscallsHandle(syscalls.clone())),
        signal_return,
    )?;
    syscalls.bind(&thread);

    thread.frame.state.rip = entry;
    thread.frame.state.gregs[Reg::Rsp as usize] = stack_top;

    if args.translate_only {
        let host_entry = thread.compile_block(entry);
        println!(
            "translated block {:#x} -> host {:#x} ({} blocks cached)",
            entry,
            host_entry,
            thread.lookup_cache.block_count()
        );
        return Ok(());
    }

    signals::global().install_host_handlers();

    // Safety: guest RIP/RSP point at live allocations and the host ISA was
    // verified native above.
    unsafe {
        thread.dispatch();
    }

    if args.dump_state {
        let names = [
            "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        for (name, value) in names.iter().zip(thread.frame.state.gregs.iter()) {
            eprintln!("{name:>4} = {value:#018x}");
        }
        for (name, value) in mimic_core::telemetry::global().report() {
            eprintln!("{name} = {value}");
        }
    }

    drop(stack);
    std::process::exit(syscalls.exit_code());
}
