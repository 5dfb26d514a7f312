//! One virtual machine, set up and ready to run.
//!
//! [`Machine::setup`] acquires resources in a fixed order:
//!
//! 1. guest memory is allocated and the image is copied in (the image
//!    source is consumed and released here)
//! 2. the VM is created from the control handle
//! 3. guest memory is installed as slot 0
//! 4. the vCPU is created, its run buffer mapped, its registers set
//!
//! Loading comes first so an unreadable or oversized image is rejected
//! before any KVM object exists, and the image is never held alongside them.
//!
//! Release runs in reverse and is left to drop order, so it happens on
//! every path, including a failure half-way through `setup`:
//!
//! ```text
//! run buffer → vCPU fd → VM fd → guest memory → control handle
//! ```

use crate::kvm::{
    ControlInterface, FailureClass, KvmError, VirtualCpu, VirtualMachine, VmInterface,
};
use crate::memory::{GuestAddressSpace, MemoryError, DEFAULT_MEM_SIZE};
use crate::runner::{IoHandler, RunLoop, RunOutcome};
use std::io::Read;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level setup and run errors.
#[derive(Error, Debug)]
pub enum VmmError {
    #[error("KVM error: {0}")]
    Kvm(#[from] KvmError),

    #[error("Guest memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Failed to open guest image {}: {source}", path.display())]
    OpenImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl VmmError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Kvm(e) => e.class(),
            Self::Memory(_) => FailureClass::MappingFailure,
            Self::OpenImage { .. } => FailureClass::EnvironmentUnavailable,
        }
    }
}

/// Configuration for building a [`Machine`].
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Guest memory size in bytes. Must be page aligned.
    pub mem_size: u64,
    /// Id of the single vCPU.
    pub vcpu_id: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            mem_size: DEFAULT_MEM_SIZE,
            vcpu_id: 0,
        }
    }
}

type VcpuOf<C> = <<C as ControlInterface>::Vm as VmInterface>::Vcpu;

/// A VM with one vCPU and one memory region, ready to run.
///
/// Field order is teardown order.
pub struct Machine<C: ControlInterface> {
    vcpu: VirtualCpu<VcpuOf<C>>,
    vm: VirtualMachine<C::Vm>,
    _control: C,
}

impl<C: ControlInterface> Machine<C> {
    /// Open a control handle with `open`, then [`setup`](Self::setup) on it.
    ///
    /// If `open` fails nothing else is attempted.
    pub fn boot<R, F>(open: F, image: R, config: &MachineConfig) -> Result<Self, VmmError>
    where
        R: Read,
        F: FnOnce() -> Result<C, KvmError>,
    {
        let control = open()?;
        Self::setup(control, image, config)
    }

    /// Build a runnable VM from an open control handle and a flat image.
    ///
    /// Any failure aborts immediately. Whatever was acquired up to that
    /// point is released in reverse order before the error is returned.
    pub fn setup<R: Read>(
        control: C,
        image: R,
        config: &MachineConfig,
    ) -> Result<Self, VmmError> {
        let memory = GuestAddressSpace::allocate(config.mem_size)?;
        let loaded = memory.load_image(image)?;
        log::info!(
            "Loaded {} byte guest image into {} MiB of guest memory",
            loaded,
            memory.size() >> 20
        );

        let mut vm = VirtualMachine::create(&control)?;
        vm.install_memory(memory)?;

        let mut vcpu = vm.create_vcpu(config.vcpu_id)?;
        vcpu.map_run_buffer(&control)?;
        vcpu.init_registers()?;

        Ok(Self {
            vcpu,
            vm,
            _control: control,
        })
    }

    /// Guest memory, for host-side inspection between exits.
    pub fn memory(&self) -> Option<&GuestAddressSpace> {
        self.vm.memory()
    }

    /// Hand the vCPU to `run_loop` until it terminates.
    ///
    /// The machine is consumed; all of its resources are released when the
    /// loop returns.
    pub fn run<H: IoHandler>(
        mut self,
        run_loop: &RunLoop,
        handler: &mut H,
    ) -> Result<RunOutcome, KvmError> {
        let mut entry = [0u8; 16];
        if let Some(Ok(())) = self.memory().map(|m| m.read(0, &mut entry)) {
            log::debug!("Guest bytes at 0x0: {:02x?}", entry);
        }

        log::info!("Starting vCPU...");
        let outcome = run_loop.run(&mut self.vcpu, handler);
        log::debug!("Releasing VM resources");
        outcome
    }
}
