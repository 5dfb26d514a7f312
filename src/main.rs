//! minivmm - run a flat real-mode guest image under KVM.
//!
//! The image is copied to guest-physical address 0 and executed on a single
//! vCPU. Every port I/O write is shown as a counter on stdout.
//!
//! This VMM requires Linux with KVM support. It will not run on other platforms.

#[cfg(target_os = "linux")]
mod kvm;
#[cfg(target_os = "linux")]
mod machine;
#[cfg(target_os = "linux")]
mod memory;
#[cfg(target_os = "linux")]
mod runner;

use clap::Parser;
use env_logger::{Builder, Env};
use std::path::PathBuf;
use std::process::ExitCode;

/// Process exit status when the guest halts or shuts down.
#[cfg(target_os = "linux")]
const EXIT_GUEST_SHUTDOWN: u8 = 2;

/// Process exit status when `--max-exits` ends the run.
#[cfg(target_os = "linux")]
const EXIT_LIMIT_REACHED: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "minivmm")]
#[command(about = "Run a flat real-mode guest image under KVM")]
struct Args {
    /// Path to the raw guest image, loaded at guest address 0
    image: PathBuf,

    /// KVM control device [default: /dev/kvm]
    #[arg(long)]
    device: Option<PathBuf>,

    /// Memory size in megabytes
    #[arg(short, long, default_value = "1024")]
    memory: u64,

    /// Pause after each port I/O exit, in milliseconds
    #[arg(long, default_value = "1000")]
    throttle_ms: u64,

    /// Stop after this many vCPU exits
    #[arg(long)]
    max_exits: Option<u64>,
}

fn main() -> ExitCode {
    Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<ExitCode, String> {
    launch(args).map_err(|e| diagnostic(&e))
}

/// One-line description of a fatal error: the failed step and its class.
#[cfg(target_os = "linux")]
fn diagnostic(e: &machine::VmmError) -> String {
    format!("{e} ({})", e.class())
}

#[cfg(target_os = "linux")]
fn launch(args: Args) -> Result<ExitCode, machine::VmmError> {
    use kvm::KvmControl;
    use machine::{Machine, MachineConfig, VmmError};
    use runner::{CounterDisplay, RunConfig, RunLoop, RunOutcome};
    use std::fs::File;
    use std::time::Duration;

    log::info!("minivmm starting...");
    log::info!("Image: {}", args.image.display());
    log::info!("Memory: {} MB", args.memory);

    let device = args
        .device
        .unwrap_or_else(|| PathBuf::from(kvm::DEFAULT_DEVICE));

    let image = File::open(&args.image).map_err(|source| VmmError::OpenImage {
        path: args.image.clone(),
        source,
    })?;

    let config = MachineConfig {
        mem_size: args.memory.saturating_mul(1024 * 1024),
        ..Default::default()
    };
    let machine = Machine::boot(|| KvmControl::open(&device), image, &config)?;

    let run_loop = RunLoop::new(RunConfig {
        throttle: Duration::from_millis(args.throttle_ms),
        max_exits: args.max_exits,
    });
    let outcome = machine.run(&run_loop, &mut CounterDisplay)?;

    let stats = outcome.stats();
    log::info!(
        "vCPU exits: {} total, {} port I/O, {} other",
        stats.exits,
        stats.port_io,
        stats.other
    );

    if let RunOutcome::Shutdown { kind, .. } = outcome {
        log::info!("Guest {}", kind);
    }
    Ok(ExitCode::from(exit_status(&outcome)))
}

/// Process exit status for a run that ended without an error.
///
/// Never 0: a run only ends when the guest stops or the cap cuts it off.
#[cfg(target_os = "linux")]
fn exit_status(outcome: &runner::RunOutcome) -> u8 {
    match outcome {
        runner::RunOutcome::Shutdown { .. } => EXIT_GUEST_SHUTDOWN,
        runner::RunOutcome::ExitLimit { .. } => EXIT_LIMIT_REACHED,
    }
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<ExitCode, String> {
    Err("minivmm requires Linux with KVM support".into())
}
