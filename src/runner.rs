//! The vCPU run loop.
//!
//! ```text
//!              ┌──────────── PortIo: notify handler, throttle ───┐
//!              │                                                 │
//!              ▼              resume()                           │
//!        ┌──────────┐ ─────────────────────────► exit ───────────┤
//!        │ Runnable │                                            │
//!        └──────────┘ ◄──────── Other: warn, count ──────────────┘
//!              │
//!              ├── Shutdown(kind)           → Ok(RunOutcome::Shutdown)
//!              ├── exit cap reached         → Ok(RunOutcome::ExitLimit)
//!              └── resume error, FailEntry,
//!                  InternalError            → Err(KvmError)
//! ```
//!
//! The loop is single-threaded and blocks inside `KVM_RUN` for as long as the
//! guest runs. Nothing can interrupt it from outside; only a guest exit, an
//! interface error or the optional exit cap ends it.

use crate::kvm::{KvmError, PortIo, ShutdownKind, VcpuExit, VcpuInterface, VirtualCpu};
use std::time::Duration;

/// Default pause after each port I/O exit.
pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(1);

/// Trait for handling port I/O exits.
///
/// Called once per port I/O exit with the decoded access.
pub trait IoHandler {
    fn port_io(&mut self, io: &PortIo);
}

/// Prints each port I/O value as a hexadecimal counter on stdout.
pub struct CounterDisplay;

impl IoHandler for CounterDisplay {
    fn port_io(&mut self, io: &PortIo) {
        println!("Counter loop : {:x}", io.data.value());
    }
}

/// Run loop tuning.
#[derive(Debug, Clone, Copy)]
pub struct RunConfig {
    /// Sleep after each port I/O exit, so a guest spinning on OUT does not
    /// flood the terminal. Zero disables the pause.
    pub throttle: Duration,
    /// Stop after this many exits.
    pub max_exits: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            throttle: DEFAULT_THROTTLE,
            max_exits: None,
        }
    }
}

/// Exit counters for one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub exits: u64,
    pub port_io: u64,
    pub other: u64,
}

/// How a run ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The guest halted or shut down.
    Shutdown { kind: ShutdownKind, stats: RunStats },
    /// `max_exits` was reached.
    ExitLimit { stats: RunStats },
}

impl RunOutcome {
    pub fn stats(&self) -> RunStats {
        match self {
            Self::Shutdown { stats, .. } | Self::ExitLimit { stats } => *stats,
        }
    }
}

pub struct RunLoop {
    config: RunConfig,
}

impl RunLoop {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    /// Resume `vcpu` until a terminal exit.
    pub fn run<V, H>(
        &self,
        vcpu: &mut VirtualCpu<V>,
        handler: &mut H,
    ) -> Result<RunOutcome, KvmError>
    where
        V: VcpuInterface,
        H: IoHandler,
    {
        let mut stats = RunStats::default();

        loop {
            if self.config.max_exits.is_some_and(|max| stats.exits >= max) {
                log::info!("Exit limit reached after {} exits", stats.exits);
                return Ok(RunOutcome::ExitLimit { stats });
            }

            let exit = vcpu.resume()?;
            stats.exits += 1;
            if stats.exits == 1 {
                log::debug!("First vCPU exit received: {:?}", exit);
            }

            match exit {
                VcpuExit::PortIo(io) => {
                    stats.port_io += 1;
                    log::debug!(
                        "[I/O] {:?} port={:#x} size={} count={} data@{:#x} -> {:?}",
                        io.direction,
                        io.port,
                        io.size,
                        io.count,
                        io.data_offset,
                        io.data.as_slice()
                    );
                    handler.port_io(&io);
                    if !self.config.throttle.is_zero() {
                        std::thread::sleep(self.config.throttle);
                    }
                }
                VcpuExit::Shutdown(kind) => {
                    log::info!("Guest {} after {} exits", kind, stats.exits);
                    if let Ok(regs) = vcpu.registers() {
                        log::debug!("Final RIP: {:#x}", regs.rip);
                    }
                    return Ok(RunOutcome::Shutdown { kind, stats });
                }
                VcpuExit::FailEntry(reason) => return Err(KvmError::FailEntry(reason)),
                VcpuExit::InternalError(suberror) => {
                    return Err(KvmError::InternalError(suberror))
                }
                VcpuExit::Other(reason) => {
                    stats.other += 1;
                    log::warn!("Unhandled exit reason {}, resuming", reason);
                }
            }
        }
    }
}
