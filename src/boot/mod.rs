//! Guest provisioning: memory, image loading, and vCPU entry state.
//!
//! Bringing up a guest happens in three steps, all before the first
//! `KVM_RUN`:
//!
//! 1. **Memory**: allocate one contiguous anonymous mapping and install it
//!    as guest physical memory starting at address 0 ([`GuestMemory`]).
//! 2. **Images**: place the ELF32 kernel's load segments at their virtual
//!    addresses ([`load_kernel`]) and, optionally, stage an init RAM disk at
//!    [`layout::INITRD_BASE`] ([`load_initrd`]).
//! 3. **Registers**: program the vCPU's segments and general registers for
//!    the selected entry mode and hand the guest its boot ABI
//!    ([`bootstrap_vcpu`]).
//!
//! The resulting guest physical layout:
//!
//! ```text
//! 0x00000000 ┌─────────────────┐
//!            │                 │
//! kernel_base├─────────────────┤
//!            │ Kernel segments │ ← PT_LOAD placement at p_vaddr
//!            ├─────────────────┤
//! 0x00800000 │ initrd (opt.)   │ ← INITRD_BASE, page-rounded size
//!            ├─────────────────┤
//!            │ Free RAM        │
//! mem_size   └─────────────────┘
//! ```

mod elf;
mod initrd;
mod memory;
mod regs;

pub use elf::{load_kernel, ElfCheck, LoadedKernel};
pub use initrd::{load_initrd, Initrd};
pub use memory::GuestMemory;
pub use regs::{bootstrap_vcpu, EntryMode};

use crate::kvm::KvmError;
use thiserror::Error;

/// Guest physical memory layout constants.
pub mod layout {
    /// Guest page size in bytes.
    pub const PAGE_SIZE: u64 = 4096;

    /// Fixed guest physical base address of the init RAM disk.
    ///
    /// 8 MiB leaves room below for kernels linked at the traditional 1 MiB
    /// mark; the loader rejects any image that would reach into it.
    pub const INITRD_BASE: u64 = 0x0080_0000;
}

/// Errors that can occur while provisioning the guest.
#[derive(Error, Debug)]
pub enum BootError {
    /// Guest memory could not be allocated.
    #[error("failed to allocate guest memory: {0}")]
    MemoryAllocation(#[source] std::io::Error),

    /// A write or read fell outside guest physical memory.
    #[error("guest memory access out of bounds (addr={addr:#x}, len={len})")]
    OutOfBounds { addr: u64, len: usize },

    /// The kernel image could not be read from disk.
    #[error("failed to read kernel: {0}")]
    ReadKernel(#[source] std::io::Error),

    /// The initrd file could not be read from disk.
    #[error("failed to read initrd: {0}")]
    ReadInitrd(#[source] std::io::Error),

    /// The kernel image failed ELF validation.
    #[error("invalid kernel image: {0}")]
    InvalidKernel(ElfCheck),

    /// A PT_LOAD segment does not fit in guest memory.
    #[error("load segment {0} is out of guest memory bounds")]
    SegmentOutOfBounds(usize),

    /// The initrd range intersects the loaded kernel range.
    #[error("initrd overlaps with the kernel")]
    InitrdOverlap,

    /// The initrd extends past the end of guest memory.
    #[error("initrd does not fit in guest memory")]
    InitrdTooLarge,

    /// An underlying KVM operation failed.
    #[error(transparent)]
    Kvm(#[from] KvmError),
}
