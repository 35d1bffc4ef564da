//! KVM (Kernel-based Virtual Machine) wrapper module.
//!
//! This module provides a safe Rust interface to Linux KVM for hardware-assisted
//! virtualization. The VMM communicates with KVM through ioctls on three kinds
//! of file descriptors:
//!
//! - `/dev/kvm` - System-level operations (API version, create VMs)
//! - VM file descriptor - VM-level operations (create vCPUs, set memory)
//! - vCPU file descriptor - vCPU-level operations (run, get/set registers)
//!
//! ```text
//! User Space (VMM)                    Kernel Space (KVM)
//! ┌──────────────┐                   ┌──────────────────┐
//! │   microvm    │    ioctl()        │  ┌────────────┐  │
//! │  VmFd ───────┼──────────────────►│  │ VM State   │  │
//! │              │                   │  └────────────┘  │
//! │  VcpuFd ─────┼──────────────────►│  ┌────────────┐  │
//! │              │                   │  │ vCPU State │  │
//! └──────────────┘                   └──┴────────────┴──┘
//! ```
//!
//! The guests handled here need none of the usual x86 platform scaffolding
//! (IRQ chip, PIT, CPUID filtering): they never receive interrupts, and their
//! entry state is fully described by the register ABI set up in [`crate::boot`].
//! A VM consists of exactly one memory slot and one vCPU.

mod vcpu;
mod vm;

pub use vcpu::{VcpuExit, VcpuFd};
pub use vm::VmFd;

use kvm_bindings::KVM_API_VERSION;
use kvm_ioctls::Kvm;
use thiserror::Error;

/// Errors that can occur during KVM operations.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open the /dev/kvm device.
    ///
    /// This usually means:
    /// - KVM is not available (not running on Linux, or KVM module not loaded)
    /// - Insufficient permissions (user not in the kvm group)
    /// - Running in a VM without nested virtualization enabled
    #[error("failed to open /dev/kvm: {0}")]
    Open(#[source] kvm_ioctls::Error),

    /// The host reports a KVM API version other than the one we were built for.
    #[error("KVM API version mismatch: got {got}, want {want}")]
    ApiVersion { got: i32, want: i32 },

    /// Failed to create a new VM.
    #[error("failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    /// Failed to create a vCPU.
    #[error("failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    /// Failed to register guest memory with KVM.
    #[error("failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    /// Failed to read CPU registers.
    #[error("failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    /// Failed to set CPU registers.
    #[error("failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    /// Failed to run the vCPU.
    #[error("failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),
}

/// Open the KVM endpoint and create a new virtual machine.
///
/// Opens `/dev/kvm`, verifies that the host speaks the KVM API version this
/// binary was compiled against, and creates an empty VM. Guest memory and
/// the vCPU are attached by the caller afterwards.
///
/// # Errors
///
/// Returns an error if KVM is not accessible, the API version differs from
/// `KVM_API_VERSION`, or VM creation fails.
pub fn create_vm() -> Result<VmFd, KvmError> {
    let kvm = Kvm::new().map_err(KvmError::Open)?;

    // The KVM API version has been 12 since Linux 2.6.22 and is documented
    // as stable; anything else is an interface we do not know.
    let version = kvm.get_api_version();
    if version != KVM_API_VERSION as i32 {
        return Err(KvmError::ApiVersion {
            got: version,
            want: KVM_API_VERSION as i32,
        });
    }

    let vm = kvm.create_vm().map_err(KvmError::CreateVm)?;
    Ok(VmFd::new(vm))
}
