//! The shared `kvm_run` buffer.
//!
//! Every vCPU fd can be mmap'd to reach a `struct kvm_run` that KVM fills in
//! before `KVM_RUN` returns. For port I/O the transferred bytes live in the
//! same mapping, at `io.data_offset` (normally the second page):
//!
//! ```text
//! offset 0        ┌────────────────────────────┐
//!                 │ kvm_run                    │  exit_reason, exit union
//!                 │                            │  (io, fail_entry, internal..)
//!                 ├────────────────────────────┤
//! data_offset     │ port I/O data              │
//!                 └────────────────────────────┘
//! ```
//!
//! The buffer is mapped read-only: the host only ever inspects exits.

use super::{IoData, IoDirection, KvmError, PortIo, RunBuffer, ShutdownKind, VcpuExit};
use kvm_bindings::{
    kvm_run, KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_IO,
    KVM_EXIT_IO_OUT, KVM_EXIT_SHUTDOWN,
};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;

/// Smallest run buffer that can hold a `struct kvm_run`.
pub const RUN_HEADER_SIZE: usize = std::mem::size_of::<kvm_run>();

/// Decode the exit described by `run`.
///
/// `buffer` is the whole run buffer that `run` heads; port I/O data is
/// looked up in it by `io.data_offset`.
pub fn decode_exit(run: &kvm_run, buffer: &[u8]) -> Result<VcpuExit, KvmError> {
    let exit = match run.exit_reason {
        KVM_EXIT_IO => {
            // SAFETY: `io` is the active union member for KVM_EXIT_IO.
            let io = unsafe { run.__bindgen_anon_1.io };
            let direction = if u32::from(io.direction) == KVM_EXIT_IO_OUT {
                IoDirection::Out
            } else {
                IoDirection::In
            };
            VcpuExit::PortIo(PortIo {
                direction,
                port: io.port,
                size: io.size,
                count: io.count,
                data_offset: io.data_offset,
                data: io_data(buffer, io.data_offset, io.size)?,
            })
        }
        KVM_EXIT_HLT => VcpuExit::Shutdown(ShutdownKind::Halt),
        KVM_EXIT_SHUTDOWN => VcpuExit::Shutdown(ShutdownKind::TripleFault),
        KVM_EXIT_FAIL_ENTRY => {
            // SAFETY: `fail_entry` is the active union member for KVM_EXIT_FAIL_ENTRY.
            let reason =
                unsafe { run.__bindgen_anon_1.fail_entry.hardware_entry_failure_reason };
            VcpuExit::FailEntry(reason)
        }
        KVM_EXIT_INTERNAL_ERROR => {
            // SAFETY: `internal` is the active union member for KVM_EXIT_INTERNAL_ERROR.
            VcpuExit::InternalError(unsafe { run.__bindgen_anon_1.internal.suberror })
        }
        other => VcpuExit::Other(other),
    };
    Ok(exit)
}

fn io_data(buffer: &[u8], data_offset: u64, size: u8) -> Result<IoData, KvmError> {
    let start = usize::try_from(data_offset)
        .map_err(|_| KvmError::MalformedExit("I/O data offset out of range"))?;
    let width = usize::from(size).min(super::vcpu::MAX_IO_SIZE);
    start
        .checked_add(width)
        .and_then(|end| buffer.get(start..end))
        .map(IoData::from_slice)
        .ok_or(KvmError::MalformedExit("I/O data outside run buffer"))
}

/// A read-only, shared mapping of a vCPU's run buffer.
pub struct MappedRunBuffer {
    addr: NonNull<c_void>,
    len: usize,
}

impl MappedRunBuffer {
    /// Map `size` bytes of the run buffer behind vCPU descriptor `fd`.
    pub fn map(fd: BorrowedFd<'_>, size: usize) -> Result<Self, KvmError> {
        let len = NonZeroUsize::new(size)
            .filter(|len| len.get() >= RUN_HEADER_SIZE)
            .ok_or(KvmError::RunBufferTooSmall {
                size,
                min: RUN_HEADER_SIZE,
            })?;

        // SAFETY: we ask the kernel for a fresh mapping, so no existing
        // memory is aliased. It stays valid until munmap in Drop.
        let addr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(KvmError::MapRunBuffer)?;

        Ok(Self { addr, len: size })
    }

    fn run(&self) -> &kvm_run {
        // SAFETY: the mapping is page aligned and at least RUN_HEADER_SIZE
        // bytes long (checked in `map`). KVM only writes to it while KVM_RUN
        // is in progress, which needs the vCPU mutably and so cannot overlap
        // this borrow.
        unsafe { self.addr.cast::<kvm_run>().as_ref() }
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: addr..addr+len is a live PROT_READ mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr() as *const u8, self.len) }
    }
}

impl RunBuffer for MappedRunBuffer {
    fn read_exit(&self) -> Result<VcpuExit, KvmError> {
        decode_exit(self.run(), self.as_slice())
    }
}

impl Drop for MappedRunBuffer {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by mmap in `map` with this length.
        if let Err(e) = unsafe { munmap(self.addr, self.len) } {
            log::warn!("Failed to unmap run buffer: {}", e);
        }
    }
}
