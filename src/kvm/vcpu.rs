//! Virtual CPU setup and execution.
//!
//! A vCPU executes guest instructions until the hardware needs help, then
//! exits back to us:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      VMM (User Space)                   │
//! │  ┌─────────┐         ┌─────────────┐                    │
//! │  │ resume  │◄────────│ decode exit │◄── run buffer      │
//! │  └────┬────┘         └──────▲──────┘    (kvm_run mmap)  │
//! │       │ KVM_RUN             │ VM exit                   │
//! ├───────┼─────────────────────┼───────────────────────────┤
//! │       ▼      KVM (Kernel)   │                           │
//! │  ┌─────────┐          ┌─────┴─────┐                     │
//! │  │ VMENTRY │─────────►│  VMEXIT   │                     │
//! │  └─────────┘  Guest   └───────────┘                     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Initial CPU state
//!
//! The guest starts in real-address mode. The special registers (segments,
//! control registers) are read back from KVM and written back with only the
//! code segment changed: the reset state has CS base 0xffff0000 (the BIOS
//! reset vector), which is moved to selector 0, base 0 so that RIP 0 fetches
//! from guest physical address 0. The general registers are zeroed except
//! for RIP = 0 and RFLAGS = 0x2 (only the always-one reserved bit set,
//! interrupts disabled).

use super::{KvmError, MappedRunBuffer, RunBuffer, VcpuInterface, RUN_HEADER_SIZE};
use kvm_bindings::{kvm_regs, kvm_sregs};
use std::fmt;
use std::os::fd::BorrowedFd;
use std::os::unix::io::AsRawFd;

/// RFLAGS with only reserved bit 1 set.
pub const RFLAGS_RESERVED: u64 = 0x2;

/// Guest instruction pointer at first entry.
pub const ENTRY_RIP: u64 = 0;

/// Maximum size for I/O operations (x86 supports 1, 2, or 4 byte I/O).
pub const MAX_IO_SIZE: usize = 4;

/// Fixed-size I/O data buffer to avoid heap allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoData {
    /// The data bytes (only first `len` bytes are valid).
    data: [u8; MAX_IO_SIZE],
    /// Number of valid bytes (1, 2, or 4).
    len: u8,
}

impl IoData {
    /// Create IoData from a slice, keeping at most [`MAX_IO_SIZE`] bytes.
    #[inline]
    pub fn from_slice(slice: &[u8]) -> Self {
        let len = slice.len().min(MAX_IO_SIZE);
        let mut data = [0u8; MAX_IO_SIZE];
        data[..len].copy_from_slice(&slice[..len]);
        Self {
            data,
            len: len as u8,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// The transferred value, little-endian and zero-extended to 32 bits.
    #[inline]
    pub fn value(&self) -> u32 {
        u32::from_le_bytes(self.data)
    }
}

/// Direction of a port I/O access, from the guest's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    /// `IN`: guest reads from the port.
    In,
    /// `OUT`: guest writes to the port.
    Out,
}

/// Payload of a port I/O exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortIo {
    pub direction: IoDirection,
    pub port: u16,
    /// Access width in bytes (1, 2, or 4).
    pub size: u8,
    /// Repeat count (> 1 for string instructions).
    pub count: u32,
    /// Byte offset of the data within the run buffer.
    pub data_offset: u64,
    pub data: IoData,
}

/// Why a halted guest is not coming back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// `HLT` with no interrupt source that could ever wake the vCPU.
    Halt,
    /// KVM_EXIT_SHUTDOWN, e.g. a triple fault.
    TripleFault,
}

impl fmt::Display for ShutdownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Halt => f.write_str("halted"),
            Self::TripleFault => f.write_str("shut down"),
        }
    }
}

/// Exit reasons from vCPU execution.
///
/// Decoded from the run buffer right after `KVM_RUN` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuExit {
    /// Guest executed IN/OUT.
    PortIo(PortIo),

    /// Guest stopped for good.
    Shutdown(ShutdownKind),

    /// Failed to enter guest mode; carries the hardware failure reason.
    FailEntry(u64),

    /// KVM internal error; carries the suberror code.
    InternalError(u32),

    /// Any other KVM exit reason, by raw code.
    Other(u32),
}

/// Wrapper around the KVM vCPU file descriptor.
pub struct KvmVcpu {
    vcpu: kvm_ioctls::VcpuFd,
}

impl KvmVcpu {
    pub fn new(vcpu: kvm_ioctls::VcpuFd) -> Self {
        Self { vcpu }
    }
}

impl VcpuInterface for KvmVcpu {
    type RunBuffer = MappedRunBuffer;

    fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.vcpu.get_regs().map_err(KvmError::GetRegisters)
    }

    fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.vcpu.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu.get_sregs().map_err(KvmError::GetSpecialRegisters)
    }

    fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.vcpu
            .set_sregs(sregs)
            .map_err(KvmError::SetSpecialRegisters)
    }

    fn map_run_buffer(&self, size: usize) -> Result<MappedRunBuffer, KvmError> {
        // SAFETY: the descriptor belongs to self.vcpu, which outlives this call.
        let fd = unsafe { BorrowedFd::borrow_raw(self.vcpu.as_raw_fd()) };
        MappedRunBuffer::map(fd, size)
    }

    fn run(&mut self) -> Result<(), KvmError> {
        // The exit is read from our own mapping of the run buffer.
        self.vcpu.run().map_err(KvmError::Run)?;
        Ok(())
    }
}

/// A vCPU and the state needed before it may run.
///
/// `resume` is refused until both [`map_run_buffer`](Self::map_run_buffer)
/// and [`init_registers`](Self::init_registers) have succeeded. The run
/// buffer is declared first so it is unmapped before the vCPU fd closes.
pub struct VirtualCpu<V: VcpuInterface> {
    run_buffer: Option<V::RunBuffer>,
    vcpu: V,
    id: u64,
    registers_ready: bool,
}

impl<V: VcpuInterface> VirtualCpu<V> {
    pub(super) fn new(id: u64, vcpu: V) -> Self {
        Self {
            run_buffer: None,
            vcpu,
            id,
            registers_ready: false,
        }
    }

    /// Query the run buffer size from the control handle and map it.
    pub fn map_run_buffer<C: super::ControlInterface>(
        &mut self,
        control: &C,
    ) -> Result<(), KvmError> {
        let size = control.vcpu_mmap_size()?;
        if size < RUN_HEADER_SIZE {
            return Err(KvmError::RunBufferTooSmall {
                size,
                min: RUN_HEADER_SIZE,
            });
        }

        self.run_buffer = Some(self.vcpu.map_run_buffer(size)?);
        log::debug!("Mapped {} byte run buffer for vCPU {}", size, self.id);
        Ok(())
    }

    /// Put the vCPU into its real-mode entry state.
    ///
    /// The special registers are written back as KVM reports them, except
    /// that CS is flattened to selector 0, base 0. The general registers are
    /// replaced wholesale, so the result does not depend on any earlier
    /// register contents.
    pub fn init_registers(&mut self) -> Result<(), KvmError> {
        let mut sregs = self.vcpu.get_sregs()?;
        sregs.cs.selector = 0;
        sregs.cs.base = 0;
        self.vcpu.set_sregs(&sregs)?;

        let regs = kvm_regs {
            rflags: RFLAGS_RESERVED,
            rip: ENTRY_RIP,
            ..Default::default()
        };
        self.vcpu.set_regs(&regs)?;

        log::debug!(
            "vCPU {} registers: CS={:#x} (base {:#x}) RIP={:#x} RFLAGS={:#x} CR0={:#x}",
            self.id,
            sregs.cs.selector,
            sregs.cs.base,
            regs.rip,
            regs.rflags,
            sregs.cr0
        );

        self.registers_ready = true;
        Ok(())
    }

    /// Current general-purpose registers.
    pub fn registers(&self) -> Result<kvm_regs, KvmError> {
        self.vcpu.get_regs()
    }

    /// Run the guest until its next exit and return the decoded exit.
    pub fn resume(&mut self) -> Result<VcpuExit, KvmError> {
        let run_buffer = self
            .run_buffer
            .as_ref()
            .ok_or(KvmError::NotRunnable("run buffer is not mapped"))?;
        if !self.registers_ready {
            return Err(KvmError::NotRunnable("registers are not initialized"));
        }

        self.vcpu.run()?;
        run_buffer.read_exit()
    }
}
