//! Guest physical memory backed by the vm-memory crate.
//!
//! Guest physical memory is a single contiguous region starting at address 0,
//! allocated as an anonymous private mapping (`MAP_PRIVATE | MAP_ANONYMOUS |
//! MAP_NORESERVE`) so unwritten guest pages cost nothing on the host. The
//! mapping is advised `MADV_MERGEABLE`, which lets KSM deduplicate identical
//! pages across guests on hosts that enable it.
//!
//! The region is fixed for the lifetime of the VM: it is never resized, and
//! once installed into KVM the host mapping must outlive every vCPU. After
//! the guest starts running only the guest writes to this memory; the VMM
//! touches it solely during image loading.

use super::BootError;
use crate::kvm::VmFd;
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

/// Guest physical memory region.
///
/// A thin wrapper around `GuestMemoryMmap` for the one layout this VMM uses:
/// a single region at guest physical address 0.
pub struct GuestMemory {
    /// The underlying vm-memory mapping.
    inner: GuestMemoryMmap,
    /// Size of the region in bytes.
    size: u64,
}

impl GuestMemory {
    /// Allocate a new guest memory region of `size` bytes at guest physical 0.
    ///
    /// # Errors
    ///
    /// Returns [`BootError::MemoryAllocation`] if the host mapping cannot be
    /// created.
    pub fn new(size: u64) -> Result<Self, BootError> {
        let regions = vec![(GuestAddress(0), size as usize)];

        let inner = GuestMemoryMmap::from_ranges(&regions).map_err(|e| {
            BootError::MemoryAllocation(std::io::Error::other(format!(
                "failed to create guest memory: {}",
                e
            )))
        })?;

        if let Some(region) = inner.iter().next() {
            // Mark guest pages merge-eligible for KSM. Best-effort: hosts
            // without KSM reject the advice.
            unsafe {
                libc::madvise(
                    region.as_ptr() as *mut libc::c_void,
                    size as usize,
                    libc::MADV_MERGEABLE,
                );
            }
        }

        Ok(Self { inner, size })
    }

    /// Total size of guest physical memory in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Get raw parts for KVM memory region registration.
    ///
    /// Returns `(host_virtual_address, size)`. The pointer is valid only
    /// while this `GuestMemory` exists.
    pub fn as_raw_parts(&self) -> (u64, u64) {
        let region = self.inner.iter().next().expect("memory has no regions");
        (region.as_ptr() as u64, self.size)
    }

    /// Install this region into a VM as memory slot 0 at guest physical 0.
    ///
    /// The mapping stays valid as long as `self` is alive; the caller keeps
    /// the `GuestMemory` around for the whole life of the VM.
    pub fn install_into(&self, vm: &VmFd) -> Result<(), BootError> {
        let (host_addr, size) = self.as_raw_parts();
        unsafe {
            vm.set_user_memory_region(0, 0, size, host_addr)?;
        }
        Ok(())
    }

    /// Write bytes at a guest physical address.
    ///
    /// # Errors
    ///
    /// Returns [`BootError::OutOfBounds`] if `[addr, addr + data.len())`
    /// does not lie within guest memory.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), BootError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|_| BootError::OutOfBounds {
                addr,
                len: data.len(),
            })
    }

    /// Read bytes from a guest physical address into a buffer.
    ///
    /// # Errors
    ///
    /// Returns [`BootError::OutOfBounds`] if the range does not lie within
    /// guest memory.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), BootError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|_| BootError::OutOfBounds {
                addr,
                len: data.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_vec(mem: &GuestMemory, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        mem.read(addr, &mut data).unwrap();
        data
    }

    #[test]
    fn test_allocate() {
        let mem = GuestMemory::new(4096).unwrap();
        assert_eq!(mem.size(), 4096);
        let (_, size) = mem.as_raw_parts();
        assert_eq!(size, 4096);
    }

    #[test]
    fn test_fresh_memory_is_zeroed() {
        let mem = GuestMemory::new(4096).unwrap();
        assert_eq!(read_vec(&mem, 0, 16), vec![0u8; 16]);
    }

    #[test]
    fn test_write_read() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(read_vec(&mem, 0, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_write_at_offset() {
        let mem = GuestMemory::new(8192).unwrap();
        mem.write(4096, b"boot").unwrap();
        assert_eq!(read_vec(&mem, 4096, 4), b"boot".to_vec());
    }

    #[test]
    fn test_write_out_of_bounds() {
        let mem = GuestMemory::new(100).unwrap();
        assert!(matches!(
            mem.write(99, &[1, 2]),
            Err(BootError::OutOfBounds { addr: 99, len: 2 })
        ));
    }

    #[test]
    fn test_read_out_of_bounds() {
        let mem = GuestMemory::new(100).unwrap();
        let mut buf = [0u8; 2];
        assert!(mem.read(99, &mut buf).is_err());
    }
}
