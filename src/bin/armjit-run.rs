//! Run a raw ARM guest image.
//!
//! The image is mapped at `--base` and executed from `--entry` (the base by default) with a
//! writable stack below `--stack-top`. Two Linux-style system calls are understood: `write`
//! to file descriptors 1 and 2, and `exit`. Anything else is logged and returns -ENOSYS.

use armjit::{
    CpuContext, ExceptionCallbacks, ExecutionContext, ExecutionMode, FlatMemory, InstantCounter,
    JitConfig, MemoryManager,
};
use clap::{Parser, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

const ENOSYS: i64 = 38;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    A64,
    A32,
}

#[derive(Parser, Debug)]
#[command(name = "armjit-run", about = "Execute a raw ARM guest image with armjit")]
struct Cli {
    /// Raw guest image
    image: PathBuf,

    /// Guest instruction set
    #[arg(short, long, value_enum, default_value = "a64")]
    mode: Mode,

    /// Load address of the image
    #[arg(long, default_value = "0x10000", value_parser = parse_address)]
    base: u64,

    /// Entry point (defaults to the load address)
    #[arg(long, value_parser = parse_address)]
    entry: Option<u64>,

    /// Initial stack pointer
    #[arg(long, default_value = "0x800000", value_parser = parse_address)]
    stack_top: u64,

    /// Stack size in bytes
    #[arg(long, default_value = "0x100000", value_parser = parse_address)]
    stack_size: u64,

    /// Disable tiered translation
    #[arg(long)]
    no_tier: bool,

    /// Maximum guest instructions per block
    #[arg(long)]
    max_block: Option<usize>,

    /// Print translator statistics on exit
    #[arg(long)]
    stats: bool,
}

fn parse_address(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid address {text:?}: {e}"))
}

struct LinuxCalls {
    memory: Arc<FlatMemory>,
    exit_code: AtomicI64,
}

impl LinuxCalls {
    fn write(&self, fd: u64, buffer: u64, length: u64) -> i64 {
        let mut bytes = vec![0; length as usize];
        if self.memory.read(buffer, &mut bytes).is_err() {
            return -14;
        }
        let written = match fd {
            1 => std::io::stdout().write_all(&bytes),
            2 => std::io::stderr().write_all(&bytes),
            _ => return -9,
        };
        match written {
            Ok(()) => length as i64,
            Err(_) => -5,
        }
    }
}

impl ExceptionCallbacks for LinuxCalls {
    fn supervisor_call(&self, ctx: &mut ExecutionContext, pc: u64, _imm: u32) {
        let (number, exit, write) = match ctx.mode() {
            ExecutionMode::Aarch64 => (ctx.x(8), 93, 64),
            ExecutionMode::Aarch32Arm => (ctx.x(7), 1, 4),
        };
        let result = if number == exit {
            self.exit_code.store(ctx.x(0) as i64, Ordering::SeqCst);
            ctx.stop();
            0
        } else if number == write {
            self.write(ctx.x(0), ctx.x(1), ctx.x(2))
        } else {
            log::warn!("unsupported system call {number} at {pc:#x}");
            -ENOSYS
        };
        match ctx.mode() {
            ExecutionMode::Aarch64 => ctx.set_x(0, result as u64),
            ExecutionMode::Aarch32Arm => ctx.set_w(0, result as u32),
        }
    }
}

fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let image = std::fs::read(&cli.image)?;
    let mode = match cli.mode {
        Mode::A64 => ExecutionMode::Aarch64,
        Mode::A32 => ExecutionMode::Aarch32Arm,
    };

    let memory = Arc::new(FlatMemory::new());
    memory.map_with(cli.base, &image, true);
    memory.map(
        cli.stack_top.saturating_sub(cli.stack_size),
        cli.stack_size as usize,
        true,
    );

    let mut config = JitConfig::from_env();
    config.mode = mode;
    if cli.no_tier {
        config = config.with_tiered(false);
    }
    if let Some(max_block) = cli.max_block {
        config = config.with_max_block_instructions(max_block);
    }

    let cpu = CpuContext::new(memory.clone(), config)?;
    cpu.prepare_code_range(cli.base, image.len() as u64);

    let calls = Arc::new(LinuxCalls {
        memory,
        exit_code: AtomicI64::new(0),
    });
    let mut context = cpu.create_context(Arc::new(InstantCounter::default()), calls.clone());
    context.set_sp(cli.stack_top);

    let entry = cli.entry.unwrap_or(cli.base);
    log::info!(
        "Running {} ({} bytes) at {entry:#x} in {mode:?}",
        cli.image.display(),
        image.len()
    );
    cpu.execute(&mut context, entry)?;

    if cli.stats {
        eprintln!("{}", cpu.stats());
        let timer = context.timer();
        eprintln!(
            "Guest time: {:?}, host time: {:?}",
            timer.guest_time(),
            timer.host_time()
        );
    }
    Ok(calls.exit_code.load(Ordering::SeqCst) as i32)
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("Error: {error}");
            std::process::exit(1);
        }
    }
}
