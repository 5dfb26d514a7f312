//! KVM (Kernel-based Virtual Machine) wrapper module.
//!
//! This module gives the rest of the VMM a small, safe surface over the
//! `/dev/kvm` ioctl interface. Three file descriptors are involved:
//!
//! - `/dev/kvm` - system-level operations (API version, create VMs, run buffer size)
//! - VM file descriptor - VM-level operations (memory slots, create vCPUs)
//! - vCPU file descriptor - vCPU-level operations (registers, run)
//!
//! ```text
//! User Space (VMM)                    Kernel Space (KVM)
//! ┌──────────────┐                   ┌──────────────────┐
//! │  KvmControl ─┼──────────────────►│   KVM Module     │
//! │              │    ioctl()        │  ┌────────────┐  │
//! │  KvmVm ──────┼──────────────────►│  │ VM State   │  │
//! │              │                   │  └────────────┘  │
//! │  KvmVcpu ────┼──────────────────►│  ┌────────────┐  │
//! │              │                   │  │ vCPU State │  │
//! │  run buffer ◄┼───── mmap ────────┼──│ kvm_run    │  │
//! └──────────────┘                   │  └────────────┘  │
//!                                    └──────────────────┘
//! ```
//!
//! # Backends
//!
//! The lifecycle types ([`VirtualMachine`], [`VirtualCpu`]) are generic over
//! the traits [`ControlInterface`], [`VmInterface`], [`VcpuInterface`] and
//! [`RunBuffer`]. [`KvmControl`] and friends implement them on top of
//! `kvm-ioctls`; the test suite swaps in a journaling mock.
//!
//! # Ordering
//!
//! The types enforce the order KVM needs:
//!
//! 1. `VirtualMachine::create` from an open control handle
//! 2. `VirtualMachine::install_memory` (slot 0 at guest address 0)
//! 3. `VirtualMachine::create_vcpu` (rejected until memory is installed)
//! 4. `VirtualCpu::map_run_buffer` and `VirtualCpu::init_registers`
//! 5. `VirtualCpu::resume` (rejected until both of the above succeeded)

#[cfg(test)]
pub mod mock;
mod run_buffer;
mod vcpu;
mod vm;

pub use run_buffer::{decode_exit, MappedRunBuffer, RUN_HEADER_SIZE};
pub use vcpu::{IoData, IoDirection, KvmVcpu, PortIo, ShutdownKind, VcpuExit, VirtualCpu};
pub use vm::{KvmVm, VirtualMachine};

use kvm_bindings::{kvm_regs, kvm_sregs, kvm_userspace_memory_region, KVM_API_VERSION};
use kvm_ioctls::Kvm;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::fmt;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default path of the KVM control device.
pub const DEFAULT_DEVICE: &str = "/dev/kvm";

/// Errors that can occur during KVM operations.
///
/// Each variant names the step that failed. None of them are retried.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open the control device.
    ///
    /// This usually means:
    /// - KVM is not available (module not loaded, device absent)
    /// - Insufficient permissions (user not in kvm group)
    /// - Running in a VM without nested virtualization enabled
    #[error("Failed to open {}: {source}", path.display())]
    EnvironmentUnavailable {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    /// The device opened but does not speak the stable KVM API.
    #[error("Unsupported KVM API version {found} (expected {expected})")]
    UnsupportedApiVersion { found: i32, expected: i32 },

    #[error("Failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("Failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    #[error("Failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("Guest memory is already installed in slot 0")]
    MemoryAlreadyInstalled,

    #[error("Guest memory must be installed before creating a vCPU")]
    MemoryNotInstalled,

    #[error("Failed to query vCPU mmap size: {0}")]
    GetVcpuMmapSize(#[source] kvm_ioctls::Error),

    #[error("vCPU run buffer too small: {size} bytes (need at least {min})")]
    RunBufferTooSmall { size: usize, min: usize },

    #[error("Failed to map vCPU run buffer: {0}")]
    MapRunBuffer(#[source] nix::Error),

    #[error("Failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to get special registers: {0}")]
    GetSpecialRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to set special registers: {0}")]
    SetSpecialRegisters(#[source] kvm_ioctls::Error),

    /// `resume` was called before the vCPU was fully set up.
    #[error("vCPU is not runnable: {0}")]
    NotRunnable(&'static str),

    #[error("Failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),

    /// Hardware refused to enter the guest.
    #[error("Failed to enter guest: hardware reason {0:#x}")]
    FailEntry(u64),

    #[error("KVM internal error: suberror {0}")]
    InternalError(u32),

    #[error("Malformed exit record: {0}")]
    MalformedExit(&'static str),
}

/// Coarse failure taxonomy used for operator diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    EnvironmentUnavailable,
    ResourceExhaustion,
    MappingFailure,
    RegisterInitFailure,
    ExecutionFailure,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EnvironmentUnavailable => "environment unavailable",
            Self::ResourceExhaustion => "resource exhaustion",
            Self::MappingFailure => "mapping failure",
            Self::RegisterInitFailure => "register init failure",
            Self::ExecutionFailure => "execution failure",
        };
        f.write_str(name)
    }
}

impl KvmError {
    /// Which taxonomy class this failure belongs to.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::EnvironmentUnavailable { .. } | Self::UnsupportedApiVersion { .. } => {
                FailureClass::EnvironmentUnavailable
            }
            Self::CreateVm(_)
            | Self::CreateVcpu(_)
            | Self::SetMemoryRegion(_)
            | Self::MemoryAlreadyInstalled
            | Self::MemoryNotInstalled => FailureClass::ResourceExhaustion,
            Self::GetVcpuMmapSize(_) | Self::RunBufferTooSmall { .. } | Self::MapRunBuffer(_) => {
                FailureClass::MappingFailure
            }
            Self::GetRegisters(_)
            | Self::SetRegisters(_)
            | Self::GetSpecialRegisters(_)
            | Self::SetSpecialRegisters(_) => FailureClass::RegisterInitFailure,
            Self::NotRunnable(_)
            | Self::Run(_)
            | Self::FailEntry(_)
            | Self::InternalError(_)
            | Self::MalformedExit(_) => FailureClass::ExecutionFailure,
        }
    }
}

/// System-level operations on an open control handle.
pub trait ControlInterface {
    type Vm: VmInterface;

    /// Ask the kernel for a new, empty VM.
    fn create_vm(&self) -> Result<Self::Vm, KvmError>;

    /// Size in bytes of the per-vCPU shared run buffer.
    fn vcpu_mmap_size(&self) -> Result<usize, KvmError>;
}

/// VM-level operations.
pub trait VmInterface {
    type Vcpu: VcpuInterface;

    /// Register a guest memory slot.
    ///
    /// # Safety
    ///
    /// The host range described by `region` must stay mapped and unmoved
    /// for as long as the VM exists.
    unsafe fn set_user_memory_region(
        &self,
        region: kvm_userspace_memory_region,
    ) -> Result<(), KvmError>;

    fn create_vcpu(&self, id: u64) -> Result<Self::Vcpu, KvmError>;
}

/// vCPU-level operations.
pub trait VcpuInterface {
    type RunBuffer: RunBuffer;

    fn get_regs(&self) -> Result<kvm_regs, KvmError>;
    fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError>;
    fn get_sregs(&self) -> Result<kvm_sregs, KvmError>;
    fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError>;

    /// Map `size` bytes of this vCPU's shared run buffer for reading.
    fn map_run_buffer(&self, size: usize) -> Result<Self::RunBuffer, KvmError>;

    /// Enter the guest and block until the next exit.
    fn run(&mut self) -> Result<(), KvmError>;
}

/// Host view of a vCPU's shared run buffer.
pub trait RunBuffer {
    /// Decode the exit left behind by the most recent run.
    fn read_exit(&self) -> Result<VcpuExit, KvmError>;
}

/// The KVM control handle (`/dev/kvm`).
pub struct KvmControl {
    kvm: Kvm,
}

impl KvmControl {
    /// Open the control device and check its API version.
    ///
    /// Opening is an environment precondition, so failures are returned
    /// as-is and never retried.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvmError> {
        let path = path.as_ref();
        let fd = nix::fcntl::open(path, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(|source| KvmError::EnvironmentUnavailable {
                path: path.to_path_buf(),
                source,
            })?;

        // SAFETY: fd was just opened above and nothing else owns it.
        let kvm = unsafe { Kvm::from_raw_fd(fd) };

        let found = kvm.get_api_version();
        let expected = KVM_API_VERSION as i32;
        if found != expected {
            return Err(KvmError::UnsupportedApiVersion { found, expected });
        }

        log::debug!("Opened {} (KVM API version {})", path.display(), found);
        Ok(Self { kvm })
    }
}

impl ControlInterface for KvmControl {
    type Vm = KvmVm;

    fn create_vm(&self) -> Result<KvmVm, KvmError> {
        let vm = self.kvm.create_vm().map_err(KvmError::CreateVm)?;
        Ok(KvmVm::new(vm))
    }

    fn vcpu_mmap_size(&self) -> Result<usize, KvmError> {
        self.kvm
            .get_vcpu_mmap_size()
            .map_err(KvmError::GetVcpuMmapSize)
    }
}
