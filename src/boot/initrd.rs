//! Init RAM disk staging.
//!
//! The initrd is an opaque blob copied verbatim to the fixed guest physical
//! address [`layout::INITRD_BASE`]. Its location and page-rounded size are
//! described to the guest through the RBX register at entry (see
//! [`super::regs`]); nothing about its contents is interpreted here.

use super::memory::GuestMemory;
use super::{layout, BootError, LoadedKernel};
use std::fs;

/// A staged init RAM disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Initrd {
    /// Guest physical base address (always [`layout::INITRD_BASE`]).
    pub base: u64,
    /// File size rounded up to the next page boundary.
    pub size: u64,
}

/// Load an init RAM disk from `path` into guest memory.
///
/// # Errors
///
/// Fails with [`BootError::ReadInitrd`] if the file cannot be read, with
/// [`BootError::InitrdOverlap`] if the staged range would intersect the
/// loaded kernel, and with [`BootError::InitrdTooLarge`] if it would extend
/// past the end of guest memory.
pub fn load_initrd(
    memory: &GuestMemory,
    kernel: &LoadedKernel,
    path: &str,
) -> Result<Initrd, BootError> {
    let bytes = fs::read(path).map_err(BootError::ReadInitrd)?;
    let initrd = stage_initrd(memory, kernel, &bytes)?;

    eprintln!(
        "[Boot] initrd loaded (base={:#x}, size={} bytes)",
        initrd.base,
        bytes.len()
    );

    Ok(initrd)
}

/// Check placement constraints and copy the initrd bytes into guest memory.
pub(crate) fn stage_initrd(
    memory: &GuestMemory,
    kernel: &LoadedKernel,
    bytes: &[u8],
) -> Result<Initrd, BootError> {
    let base = layout::INITRD_BASE;
    let len = bytes.len() as u64;

    // The staged range must not intersect the kernel image.
    let kernel_end = kernel.base + kernel.size;
    if base < kernel_end && kernel.base < base + len {
        return Err(BootError::InitrdOverlap);
    }

    if base + len > memory.size() {
        return Err(BootError::InitrdTooLarge);
    }

    memory.write(base, bytes)?;

    Ok(Initrd {
        base,
        size: len.div_ceil(layout::PAGE_SIZE) * layout::PAGE_SIZE,
    })
}
