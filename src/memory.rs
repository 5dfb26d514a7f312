//! Guest physical memory backed by the vm-memory crate.
//!
//! The guest sees one contiguous block of RAM starting at guest physical
//! address 0. The block is an anonymous host mapping created by
//! `GuestMemoryMmap`:
//!
//! - `MAP_PRIVATE | MAP_ANONYMOUS`: not backed by a file, zero-filled
//! - `MAP_NORESERVE`: no swap reservation, so a 1 GiB guest costs nothing
//!   until the guest touches it
//!
//! ```text
//! Guest Physical          Host Virtual
//! ┌──────────────┐       ┌──────────────┐
//! │ 0x00000000   │ ────► │ flat image   │ ← copied here by load_image()
//! │              │       │ zero fill    │
//! │ size - 1     │       │              │
//! └──────────────┘       └──────────────┘
//! ```
//!
//! The region is registered with KVM as slot 0 by
//! [`VirtualMachine::install_memory`](crate::kvm::VirtualMachine::install_memory),
//! which also takes ownership of it so the mapping outlives the VM.

use std::io::{ErrorKind, Read};
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryError, GuestMemoryMmap};

/// Largest single read issued while copying a guest image.
pub const IMAGE_CHUNK_SIZE: usize = 4096;

/// Default guest memory size (1 GiB).
pub const DEFAULT_MEM_SIZE: u64 = 1 << 30;

/// Errors that can occur while preparing guest memory.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Invalid guest memory size {size:#x}: must be a non-zero multiple of {page_size:#x}")]
    InvalidSize { size: u64, page_size: u64 },

    #[error("Failed to allocate guest memory: {0}")]
    Allocation(#[source] std::io::Error),

    #[error("Failed to read guest image: {0}")]
    ReadImage(#[source] std::io::Error),

    /// The image has more bytes than the address space can hold.
    ///
    /// Nothing beyond the end of guest memory is written.
    #[error("Guest image does not fit in {capacity:#x} bytes of guest memory")]
    ImageTooLarge { capacity: u64 },

    #[error("Guest memory access at {addr:#x} failed: {source}")]
    Access {
        addr: u64,
        #[source]
        source: GuestMemoryError,
    },
}

/// The guest-physical address space of a VM.
///
/// A single region at guest address 0. The host address is resolved once at
/// allocation and stays fixed for the lifetime of the mapping.
pub struct GuestAddressSpace {
    inner: GuestMemoryMmap,
    size: u64,
    host_addr: u64,
}

impl GuestAddressSpace {
    /// Reserve `size` bytes of zeroed guest memory.
    ///
    /// `size` must be a non-zero multiple of the host page size, since KVM
    /// rejects memory slots that are not page aligned.
    pub fn allocate(size: u64) -> Result<Self, MemoryError> {
        let page_size = host_page_size();
        if size == 0 || size % page_size != 0 {
            return Err(MemoryError::InvalidSize { size, page_size });
        }

        let regions = vec![(GuestAddress(0), size as usize)];
        let inner: GuestMemoryMmap = GuestMemoryMmap::from_ranges(&regions).map_err(|e| {
            MemoryError::Allocation(std::io::Error::other(format!(
                "Failed to create guest memory: {}",
                e
            )))
        })?;

        let host_addr = inner
            .get_host_address(GuestAddress(0))
            .map_err(|source| MemoryError::Access { addr: 0, source })?
            as u64;

        Ok(Self {
            inner,
            size,
            host_addr,
        })
    }

    /// Size of the address space in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Host parts for KVM memory region registration: (host_address, size).
    ///
    /// The address is valid only while this object is alive.
    pub fn as_raw_parts(&self) -> (u64, u64) {
        (self.host_addr, self.size)
    }

    /// Copy a flat guest image into memory starting at guest address 0.
    ///
    /// Reads at most [`IMAGE_CHUNK_SIZE`] bytes at a time and advances by
    /// what each read actually returned. Copying stops at end-of-stream or
    /// on the first short read. If memory fills up while the source still
    /// has data, the load fails with [`MemoryError::ImageTooLarge`].
    ///
    /// The source is consumed, so a file handle is closed as soon as the
    /// image is in place.
    ///
    /// Returns the number of bytes loaded.
    pub fn load_image<R: Read>(&self, mut source: R) -> Result<u64, MemoryError> {
        let mut chunk = [0u8; IMAGE_CHUNK_SIZE];
        let mut offset = 0u64;

        loop {
            let remaining = self.size - offset;
            if remaining == 0 {
                // Full. Anything left in the stream would not fit.
                let mut probe = [0u8; 1];
                if read_chunk(&mut source, &mut probe)? > 0 {
                    return Err(MemoryError::ImageTooLarge {
                        capacity: self.size,
                    });
                }
                break;
            }

            let want = remaining.min(IMAGE_CHUNK_SIZE as u64) as usize;
            let n = read_chunk(&mut source, &mut chunk[..want])?;
            if n == 0 {
                break;
            }

            self.write(offset, &chunk[..n])?;
            offset += n as u64;

            if n < want {
                break;
            }
        }

        log::debug!("Loaded {} bytes of guest image", offset);
        Ok(offset)
    }

    /// Write bytes at a guest physical address.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|source| MemoryError::Access { addr, source })
    }

    /// Read bytes from a guest physical address into a buffer.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|source| MemoryError::Access { addr, source })
    }
}

fn read_chunk<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize, MemoryError> {
    loop {
        match source.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(MemoryError::ReadImage(e)),
        }
    }
}

/// Host page size, falling back to 4 KiB if sysconf cannot tell us.
pub fn host_page_size() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as u64,
        _ => 4096,
    }
}
