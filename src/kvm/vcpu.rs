//! Virtual CPU management and execution.
//!
//! A vCPU represents a virtual processor that executes guest instructions
//! using hardware-assisted virtualization. The vCPU runs in a loop driven by
//! the caller:
//!
//! 1. The VMM calls [`VcpuFd::run`] - control transfers to the guest
//! 2. The guest executes until a "VM exit" occurs
//! 3. KVM returns control with the exit reason
//! 4. The VMM services the exit and calls `run` again
//!
//! Each exit is decoded exactly once from the vCPU's shared run area into a
//! [`VcpuExit`] value. Port I/O payloads are handed out as slices aliasing
//! the run area: for an `OUT` the guest's bytes are read from it, for an `IN`
//! the response bytes are written back into it before the next `run`.

use super::KvmError;
use kvm_bindings::{kvm_regs, kvm_sregs};
use kvm_ioctls::VcpuExit as KvmVcpuExit;

/// Wrapper around the KVM vCPU file descriptor.
pub struct VcpuFd {
    /// The underlying KVM vCPU file descriptor.
    vcpu: kvm_ioctls::VcpuFd,
}

/// A decoded VM exit.
///
/// Only the exits that are part of the paravirtual guest contract are carried
/// as structured variants; everything else surfaces as [`VcpuExit::Unsupported`]
/// with a static description so the caller can make the fatal branch explicit.
#[derive(Debug)]
pub enum VcpuExit<'a> {
    /// Guest executed HLT.
    Hlt,

    /// Guest executed an IN instruction; fill the slice with the response.
    IoIn(u16, &'a mut [u8]),

    /// Guest executed an OUT instruction; the slice holds the written bytes.
    IoOut(u16, &'a [u8]),

    /// Any exit reason outside the handled set.
    Unsupported(&'static str),
}

impl VcpuFd {
    /// Wrap a raw KVM vCPU file descriptor.
    pub fn new(vcpu: kvm_ioctls::VcpuFd) -> Self {
        Self { vcpu }
    }

    /// Get the special registers (segments, control registers).
    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu.get_sregs().map_err(KvmError::GetRegisters)
    }

    /// Set the special registers.
    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.vcpu.set_sregs(sregs).map_err(KvmError::SetRegisters)
    }

    /// Set the general-purpose registers.
    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.vcpu.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    /// Run the vCPU until the guest next exits.
    ///
    /// Blocks the calling thread while the guest executes. On return the
    /// exit has been decoded from the run area; payload slices borrow from
    /// it and must be consumed before the next call.
    pub fn run(&mut self) -> Result<VcpuExit<'_>, KvmError> {
        match self.vcpu.run().map_err(KvmError::Run)? {
            KvmVcpuExit::Hlt => Ok(VcpuExit::Hlt),
            KvmVcpuExit::IoIn(port, data) => Ok(VcpuExit::IoIn(port, data)),
            KvmVcpuExit::IoOut(port, data) => Ok(VcpuExit::IoOut(port, data)),
            KvmVcpuExit::MmioRead(..) => Ok(VcpuExit::Unsupported("MmioRead")),
            KvmVcpuExit::MmioWrite(..) => Ok(VcpuExit::Unsupported("MmioWrite")),
            KvmVcpuExit::Shutdown => Ok(VcpuExit::Unsupported("Shutdown")),
            KvmVcpuExit::InternalError => Ok(VcpuExit::Unsupported("InternalError")),
            KvmVcpuExit::FailEntry(..) => Ok(VcpuExit::Unsupported("FailEntry")),
            KvmVcpuExit::SystemEvent(..) => Ok(VcpuExit::Unsupported("SystemEvent")),
            KvmVcpuExit::Debug(..) => Ok(VcpuExit::Unsupported("Debug")),
            KvmVcpuExit::Exception => Ok(VcpuExit::Unsupported("Exception")),
            KvmVcpuExit::IrqWindowOpen => Ok(VcpuExit::Unsupported("IrqWindowOpen")),
            _ => Ok(VcpuExit::Unsupported("Other")),
        }
    }
}
