//! Virtual machine creation and memory registration.
//!
//! A VM owns a set of memory slots and zero or more vCPUs. This VMM uses a
//! single slot: the whole of guest physical memory is one contiguous region
//! starting at guest physical address 0, backed by an anonymous host mapping.
//!
//! ```text
//! Guest Physical          Host Virtual
//! ┌──────────────┐       ┌──────────────┐
//! │ 0x00000000   │ ────► │ mmap'd region│
//! │     ...      │       │     ...      │
//! │ mem_size - 1 │       │              │
//! └──────────────┘       └──────────────┘
//! ```
//!
//! KVM translates guest physical addresses to host physical addresses through
//! EPT (Intel) or NPT (AMD); the VMM never touches guest memory while the
//! guest is running.

use super::{KvmError, VcpuFd};
use kvm_bindings::kvm_userspace_memory_region;

/// Wrapper around the KVM VM file descriptor.
pub struct VmFd {
    /// The underlying KVM VM file descriptor.
    vm: kvm_ioctls::VmFd,
}

impl VmFd {
    /// Wrap a raw KVM VM file descriptor.
    pub fn new(vm: kvm_ioctls::VmFd) -> Self {
        Self { vm }
    }

    /// Register a guest memory region with KVM.
    ///
    /// Maps the range of guest physical addresses `[guest_addr,
    /// guest_addr + memory_size)` onto host virtual memory at
    /// `userspace_addr`. After registration, guest accesses to these
    /// physical addresses transparently reach the host memory.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the host memory region remains valid and
    /// is not freed or resized for the lifetime of the VM, and that it does
    /// not overlap another registered region.
    pub unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
    ) -> Result<(), KvmError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size,
            userspace_addr,
            flags: 0,
        };

        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(KvmError::SetMemoryRegion)
        }
    }

    /// Create a new virtual CPU.
    ///
    /// KVM maps the vCPU's shared run area as part of creation; exit reasons
    /// and I/O payloads are decoded from it by [`VcpuFd::run`].
    pub fn create_vcpu(&self, id: u64) -> Result<VcpuFd, KvmError> {
        let vcpu = self.vm.create_vcpu(id).map_err(KvmError::CreateVcpu)?;
        Ok(VcpuFd::new(vcpu))
    }
}
