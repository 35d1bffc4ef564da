//! ELF32 kernel loader.
//!
//! Guest kernels are statically linked 32-bit little-endian x86 ELF
//! executables. Loading is placement only: each PT_LOAD segment is copied to
//! guest physical memory at its `p_vaddr`, with the `[p_filesz, p_memsz)`
//! tail left to the zero pages of the anonymous backing mapping. There is no
//! relocation and no BIOS hand-off; execution starts directly at `e_entry`
//! once the vCPU is bootstrapped.
//!
//! Header validation follows the ELF32 identification fields in order:
//! magic, class, data encoding, identification version, object type,
//! machine, header version. The loader additionally requires the entry
//! point to fall inside a loaded segment, so a misconfigured link script
//! fails here instead of triple-faulting the guest.

use super::memory::GuestMemory;
use super::BootError;
use std::fs;
use thiserror::Error;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;

/// Size of the ELF32 file header.
const EHDR_SIZE: usize = 52;

// Field offsets within the ELF32 file header.
const E_TYPE: usize = 16;
const E_MACHINE: usize = 18;
const E_VERSION: usize = 20;
const E_ENTRY: usize = 24;
const E_PHOFF: usize = 28;
const E_PHENTSIZE: usize = 42;
const E_PHNUM: usize = 44;

// Field offsets within an ELF32 program header.
const P_TYPE: usize = 0;
const P_OFFSET: usize = 4;
const P_VADDR: usize = 8;
const P_FILESZ: usize = 16;
const P_MEMSZ: usize = 20;

/// The specific validation a kernel image failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfCheck {
    #[error("not an ELF file")]
    Magic,
    #[error("not a 32-bit ELF file")]
    Class,
    #[error("not a little-endian ELF file")]
    Encoding,
    #[error("invalid ELF identification version")]
    IdentVersion,
    #[error("not an executable ELF file")]
    Type,
    #[error("not an x86 ELF file")]
    Machine,
    #[error("invalid ELF header version")]
    HeaderVersion,
    #[error("image is truncated")]
    Truncated,
    #[error("entry point lies outside the loaded segments")]
    EntryNotLoaded,
}

/// Result of loading a kernel image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedKernel {
    /// Guest virtual address of the first instruction (`e_entry`).
    pub entry: u32,
    /// Lowest `p_vaddr` among the loaded segments.
    pub base: u64,
    /// Bytes from `base` to the highest `p_vaddr + p_memsz`.
    pub size: u64,
}

/// Load an ELF32 kernel from `path` into guest memory.
///
/// # Errors
///
/// Fails with [`BootError::ReadKernel`] if the file cannot be read, with
/// [`BootError::InvalidKernel`] if header validation rejects the image, and
/// with [`BootError::SegmentOutOfBounds`] if a PT_LOAD segment does not fit
/// in guest memory.
pub fn load_kernel(memory: &GuestMemory, path: &str) -> Result<LoadedKernel, BootError> {
    let image = fs::read(path).map_err(BootError::ReadKernel)?;
    let kernel = load_image(memory, &image)?;

    eprintln!(
        "[Boot] kernel loaded (entry={:#x}, base={:#x}, size={} bytes)",
        kernel.entry, kernel.base, kernel.size
    );

    Ok(kernel)
}

/// Validate an ELF32 image and place its PT_LOAD segments in guest memory.
pub(crate) fn load_image(memory: &GuestMemory, image: &[u8]) -> Result<LoadedKernel, BootError> {
    validate_header(image)?;

    let entry = u32_at(image, E_ENTRY)?;
    let phoff = u32_at(image, E_PHOFF)? as usize;
    let phentsize = u16_at(image, E_PHENTSIZE)? as usize;
    let phnum = u16_at(image, E_PHNUM)? as usize;

    let mut base = u64::MAX;
    let mut end = 0u64;
    let mut entry_loaded = false;

    for index in 0..phnum {
        let phdr = phoff + index * phentsize;

        if u32_at(image, phdr + P_TYPE)? != PT_LOAD {
            continue;
        }

        let p_offset = u32_at(image, phdr + P_OFFSET)? as usize;
        let p_vaddr = u32_at(image, phdr + P_VADDR)? as u64;
        let p_filesz = u32_at(image, phdr + P_FILESZ)? as usize;
        let p_memsz = u32_at(image, phdr + P_MEMSZ)? as u64;

        let segment_end = p_vaddr + p_memsz;
        if segment_end > memory.size() {
            return Err(BootError::SegmentOutOfBounds(index));
        }

        let bytes = image
            .get(p_offset..p_offset + p_filesz)
            .ok_or(BootError::InvalidKernel(ElfCheck::Truncated))?;
        memory.write(p_vaddr, bytes)?;

        base = base.min(p_vaddr);
        end = end.max(segment_end);
        if (p_vaddr..segment_end).contains(&(entry as u64)) {
            entry_loaded = true;
        }
    }

    if !entry_loaded {
        return Err(BootError::InvalidKernel(ElfCheck::EntryNotLoaded));
    }

    Ok(LoadedKernel {
        entry,
        base,
        size: end - base,
    })
}

fn validate_header(image: &[u8]) -> Result<(), BootError> {
    let invalid = |check| Err(BootError::InvalidKernel(check));

    if image.len() < EHDR_SIZE {
        return invalid(ElfCheck::Truncated);
    }
    if image[..4] != ELF_MAGIC {
        return invalid(ElfCheck::Magic);
    }
    if image[4] != ELFCLASS32 {
        return invalid(ElfCheck::Class);
    }
    if image[5] != ELFDATA2LSB {
        return invalid(ElfCheck::Encoding);
    }
    if image[6] != EV_CURRENT {
        return invalid(ElfCheck::IdentVersion);
    }
    if u16_at(image, E_TYPE)? != ET_EXEC {
        return invalid(ElfCheck::Type);
    }
    if u16_at(image, E_MACHINE)? != EM_386 {
        return invalid(ElfCheck::Machine);
    }
    if u32_at(image, E_VERSION)? != EV_CURRENT as u32 {
        return invalid(ElfCheck::HeaderVersion);
    }

    Ok(())
}

fn u16_at(image: &[u8], offset: usize) -> Result<u16, BootError> {
    match image.get(offset..offset + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(BootError::InvalidKernel(ElfCheck::Truncated)),
    }
}

fn u32_at(image: &[u8], offset: usize) -> Result<u32, BootError> {
    match image.get(offset..offset + 4) {
        Some(b) => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(BootError::InvalidKernel(ElfCheck::Truncated)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A PT_LOAD segment for synthetic test images.
    struct Seg {
        vaddr: u32,
        bytes: Vec<u8>,
        memsz: u32,
    }

    impl Seg {
        fn new(vaddr: u32, bytes: &[u8]) -> Self {
            Self {
                vaddr,
                bytes: bytes.to_vec(),
                memsz: bytes.len() as u32,
            }
        }

        fn with_memsz(mut self, memsz: u32) -> Self {
            self.memsz = memsz;
            self
        }
    }

    fn put_u16(image: &mut [u8], offset: usize, value: u16) {
        image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(image: &mut [u8], offset: usize, value: u32) {
        image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Build a minimal well-formed ELF32 executable image in memory.
    fn build_elf(entry: u32, segs: &[Seg]) -> Vec<u8> {
        let phoff = EHDR_SIZE;
        let data_start = phoff + segs.len() * 32;
        let mut image = vec![0u8; data_start];

        image[..4].copy_from_slice(&ELF_MAGIC);
        image[4] = ELFCLASS32;
        image[5] = ELFDATA2LSB;
        image[6] = EV_CURRENT;
        put_u16(&mut image, E_TYPE, ET_EXEC);
        put_u16(&mut image, E_MACHINE, EM_386);
        put_u32(&mut image, E_VERSION, EV_CURRENT as u32);
        put_u32(&mut image, E_ENTRY, entry);
        put_u32(&mut image, E_PHOFF, phoff as u32);
        put_u16(&mut image, E_PHENTSIZE, 32);
        put_u16(&mut image, E_PHNUM, segs.len() as u16);

        for (i, seg) in segs.iter().enumerate() {
            let phdr = phoff + i * 32;
            let p_offset = image.len() as u32;
            put_u32(&mut image, phdr + P_TYPE, PT_LOAD);
            put_u32(&mut image, phdr + P_OFFSET, p_offset);
            put_u32(&mut image, phdr + P_VADDR, seg.vaddr);
            put_u32(&mut image, phdr + P_FILESZ, seg.bytes.len() as u32);
            put_u32(&mut image, phdr + P_MEMSZ, seg.memsz);
            image.extend_from_slice(&seg.bytes);
        }

        image
    }

    fn mem_64k() -> GuestMemory {
        GuestMemory::new(64 * 1024).unwrap()
    }

    #[test]
    fn test_loads_segment_bytes() {
        let mem = mem_64k();
        let image = build_elf(0x1000, &[Seg::new(0x1000, &[0xde, 0xad, 0xbe, 0xef])]);

        let kernel = load_image(&mem, &image).unwrap();
        assert_eq!(kernel.entry, 0x1000);
        assert_eq!(kernel.base, 0x1000);
        assert_eq!(kernel.size, 4);

        let mut loaded = [0u8; 4];
        mem.read(0x1000, &mut loaded).unwrap();
        assert_eq!(loaded, [0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_bss_tail_stays_zero() {
        let mem = mem_64k();
        let image = build_elf(0x1000, &[Seg::new(0x1000, &[1, 2]).with_memsz(8)]);

        let kernel = load_image(&mem, &image).unwrap();
        assert_eq!(kernel.size, 8);

        let mut loaded = [0xffu8; 8];
        mem.read(0x1000, &mut loaded).unwrap();
        assert_eq!(loaded, [1, 2, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_base_and_size_span_all_segments() {
        let mem = mem_64k();
        let image = build_elf(
            0x2000,
            &[
                Seg::new(0x2000, b"text").with_memsz(0x100),
                Seg::new(0x4000, b"data").with_memsz(0x800),
            ],
        );

        let kernel = load_image(&mem, &image).unwrap();
        assert_eq!(kernel.base, 0x2000);
        assert_eq!(kernel.size, 0x4800 - 0x2000);
    }

    #[test]
    fn test_non_load_segments_are_skipped() {
        let mem = mem_64k();
        let mut image = build_elf(
            0x1000,
            &[Seg::new(0x1000, b"keep"), Seg::new(0x3000, b"skip")],
        );
        // Rewrite the second program header as PT_NOTE.
        put_u32(&mut image, EHDR_SIZE + 32 + P_TYPE, 4);

        let kernel = load_image(&mem, &image).unwrap();
        assert_eq!(kernel.base, 0x1000);
        assert_eq!(kernel.size, 4);

        let mut untouched = [0u8; 4];
        mem.read(0x3000, &mut untouched).unwrap();
        assert_eq!(untouched, [0u8; 4]);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mem = mem_64k();
        let mut image = build_elf(0x1000, &[Seg::new(0x1000, b"code")]);
        image[0] = 0x7e;
        assert!(matches!(
            load_image(&mem, &image),
            Err(BootError::InvalidKernel(ElfCheck::Magic))
        ));
    }

    #[test]
    fn test_rejects_elf64() {
        let mem = mem_64k();
        let mut image = build_elf(0x1000, &[Seg::new(0x1000, b"code")]);
        image[4] = 2;
        assert!(matches!(
            load_image(&mem, &image),
            Err(BootError::InvalidKernel(ElfCheck::Class))
        ));
    }

    #[test]
    fn test_rejects_big_endian() {
        let mem = mem_64k();
        let mut image = build_elf(0x1000, &[Seg::new(0x1000, b"code")]);
        image[5] = 2;
        assert!(matches!(
            load_image(&mem, &image),
            Err(BootError::InvalidKernel(ElfCheck::Encoding))
        ));
    }

    #[test]
    fn test_rejects_bad_ident_version() {
        let mem = mem_64k();
        let mut image = build_elf(0x1000, &[Seg::new(0x1000, b"code")]);
        image[6] = 0;
        assert!(matches!(
            load_image(&mem, &image),
            Err(BootError::InvalidKernel(ElfCheck::IdentVersion))
        ));
    }

    #[test]
    fn test_rejects_relocatable_object() {
        let mem = mem_64k();
        let mut image = build_elf(0x1000, &[Seg::new(0x1000, b"code")]);
        put_u16(&mut image, E_TYPE, 1); // ET_REL
        assert!(matches!(
            load_image(&mem, &image),
            Err(BootError::InvalidKernel(ElfCheck::Type))
        ));
    }

    #[test]
    fn test_rejects_wrong_machine() {
        let mem = mem_64k();
        let mut image = build_elf(0x1000, &[Seg::new(0x1000, b"code")]);
        put_u16(&mut image, E_MACHINE, 62); // EM_X86_64
        assert!(matches!(
            load_image(&mem, &image),
            Err(BootError::InvalidKernel(ElfCheck::Machine))
        ));
    }

    #[test]
    fn test_rejects_bad_header_version() {
        let mem = mem_64k();
        let mut image = build_elf(0x1000, &[Seg::new(0x1000, b"code")]);
        put_u32(&mut image, E_VERSION, 2);
        assert!(matches!(
            load_image(&mem, &image),
            Err(BootError::InvalidKernel(ElfCheck::HeaderVersion))
        ));
    }

    #[test]
    fn test_accepts_image_passing_all_checks() {
        let mem = mem_64k();
        let image = build_elf(0x1000, &[Seg::new(0x1000, b"code")]);
        assert!(load_image(&mem, &image).is_ok());
    }

    #[test]
    fn test_rejects_truncated_image() {
        let mem = mem_64k();
        let image = build_elf(0x1000, &[Seg::new(0x1000, b"code")]);
        assert!(matches!(
            load_image(&mem, &image[..40]),
            Err(BootError::InvalidKernel(ElfCheck::Truncated))
        ));
    }

    #[test]
    fn test_rejects_segment_past_guest_memory() {
        let mem = mem_64k();
        let image = build_elf(
            0x1000,
            &[
                Seg::new(0x1000, b"ok"),
                Seg::new(0xfff0, b"xx").with_memsz(0x20),
            ],
        );
        assert!(matches!(
            load_image(&mem, &image),
            Err(BootError::SegmentOutOfBounds(1))
        ));
    }

    #[test]
    fn test_rejects_entry_outside_loaded_segments() {
        let mem = mem_64k();
        let image = build_elf(0x9000, &[Seg::new(0x1000, b"code")]);
        assert!(matches!(
            load_image(&mem, &image),
            Err(BootError::InvalidKernel(ElfCheck::EntryNotLoaded))
        ));
    }

    #[test]
    fn test_rejects_image_without_load_segments() {
        let mem = mem_64k();
        let image = build_elf(0x1000, &[]);
        assert!(matches!(
            load_image(&mem, &image),
            Err(BootError::InvalidKernel(ElfCheck::EntryNotLoaded))
        ));
    }
}
