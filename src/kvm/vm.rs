//! Virtual machine creation and guest memory registration.
//!
//! Guest memory is managed through "memory slots". Each slot maps a range of
//! guest physical addresses to a range of host virtual addresses:
//!
//! ```text
//! Guest Physical          Host Virtual
//! ┌──────────────┐       ┌──────────────┐
//! │ 0x00000000   │ ────► │ mmap'd region│
//! │              │       │              │
//! │ 0x3FFFFFFF   │       │              │
//! └──────────────┘       └──────────────┘
//!     1 GiB                  1 GiB
//! ```
//!
//! This VMM uses exactly one slot (slot 0) covering the whole address space.
//! KVM uses EPT/NPT to translate guest physical addresses through the host
//! MMU, so the guest reads and writes that host memory directly.

use super::{ControlInterface, KvmError, KvmVcpu, VirtualCpu, VmInterface};
use crate::memory::GuestAddressSpace;
use kvm_bindings::kvm_userspace_memory_region;

/// Slot used for the single guest RAM region.
pub const GUEST_RAM_SLOT: u32 = 0;

/// Guest physical address where guest RAM starts.
pub const GUEST_RAM_BASE: u64 = 0;

/// Wrapper around the KVM VM file descriptor.
pub struct KvmVm {
    vm: kvm_ioctls::VmFd,
}

impl KvmVm {
    pub fn new(vm: kvm_ioctls::VmFd) -> Self {
        Self { vm }
    }
}

impl VmInterface for KvmVm {
    type Vcpu = KvmVcpu;

    unsafe fn set_user_memory_region(
        &self,
        region: kvm_userspace_memory_region,
    ) -> Result<(), KvmError> {
        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(KvmError::SetMemoryRegion)
        }
    }

    fn create_vcpu(&self, id: u64) -> Result<KvmVcpu, KvmError> {
        let vcpu = self.vm.create_vcpu(id).map_err(KvmError::CreateVcpu)?;
        Ok(KvmVcpu::new(vcpu))
    }
}

/// One virtual machine and the guest memory registered with it.
///
/// The VM owns its [`GuestAddressSpace`] once installed. Fields drop in
/// declaration order, so the VM descriptor is closed before the backing
/// memory is unmapped.
pub struct VirtualMachine<V: VmInterface> {
    vm: V,
    memory: Option<GuestAddressSpace>,
}

impl<V: VmInterface> VirtualMachine<V> {
    /// Request a new VM from the control handle.
    pub fn create<C>(control: &C) -> Result<Self, KvmError>
    where
        C: ControlInterface<Vm = V>,
    {
        let vm = control.create_vm()?;
        log::debug!("Created VM");
        Ok(Self { vm, memory: None })
    }

    /// Register `memory` as slot 0 at guest physical address 0.
    ///
    /// After this succeeds every vCPU of this VM fetches instructions and
    /// data from `memory`. Only one region is supported; a second call
    /// fails with [`KvmError::MemoryAlreadyInstalled`].
    pub fn install_memory(&mut self, memory: GuestAddressSpace) -> Result<(), KvmError> {
        if self.memory.is_some() {
            return Err(KvmError::MemoryAlreadyInstalled);
        }

        let (host_addr, size) = memory.as_raw_parts();
        let region = kvm_userspace_memory_region {
            slot: GUEST_RAM_SLOT,
            guest_phys_addr: GUEST_RAM_BASE,
            memory_size: size,
            userspace_addr: host_addr,
            flags: 0,
        };

        // SAFETY: `memory` is moved into `self` below and dropped only after
        // the VM descriptor is closed, so the host range outlives the slot.
        unsafe { self.vm.set_user_memory_region(region)? };

        log::info!(
            "Guest memory: {} MiB at guest {:#x} (host {:#x}, slot {})",
            size >> 20,
            GUEST_RAM_BASE,
            host_addr,
            GUEST_RAM_SLOT
        );

        self.memory = Some(memory);
        Ok(())
    }

    /// Guest memory, once installed.
    pub fn memory(&self) -> Option<&GuestAddressSpace> {
        self.memory.as_ref()
    }

    /// Create a vCPU with the given id.
    ///
    /// Fails with [`KvmError::MemoryNotInstalled`] until [`install_memory`]
    /// has succeeded, so no vCPU can ever run against an empty address space.
    ///
    /// [`install_memory`]: Self::install_memory
    pub fn create_vcpu(&self, id: u64) -> Result<VirtualCpu<V::Vcpu>, KvmError> {
        if self.memory.is_none() {
            return Err(KvmError::MemoryNotInstalled);
        }

        let vcpu = self.vm.create_vcpu(id)?;
        log::debug!("Created vCPU {}", id);
        Ok(VirtualCpu::new(id, vcpu))
    }
}
