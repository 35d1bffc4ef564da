//! vCPU entry state for the guest register ABI.
//!
//! The guest starts in one of two modes:
//!
//! - **Real mode** (default): 16-bit segmented execution exactly as at CPU
//!   reset, except CS is forced to selector 0, base 0 so `RIP` alone names
//!   the entry point.
//! - **Protected mode**: 32-bit flat execution. CS/DS/ES/FS/GS/SS get flat
//!   4 GiB segments out of a fictional GDT (selectors 0x08 and 0x10; the
//!   guest must load a real GDT before reloading any segment register) and
//!   CR0.PE is set. Paging stays off.
//!
//! General registers at the first instruction:
//!
//! ```text
//! RIP    = ELF entry point
//! RFLAGS = 2 (only the always-one bit)
//! RAX    = 0x0c00ffee boot signature
//! RBX    = initrd descriptor: bits 31..12 base >> 12, bits 11..0 size in
//!          4 KiB pages; zero when no initrd is loaded
//! others = 0
//! ```

use super::{BootError, Initrd};
use crate::kvm::VcpuFd;
use kvm_bindings::{kvm_regs, kvm_segment, kvm_sregs};

/// Boot signature the guest may inspect in RAX.
const BOOT_SIGNATURE: u64 = 0x0c00_ffee;

/// CPU mode in which the guest begins execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMode {
    /// 16-bit real mode, as at reset.
    Real,
    /// 32-bit protected mode with flat segments, paging disabled.
    Protected,
}

/// Program the vCPU's segment and general registers for guest entry.
///
/// Reads the segment state KVM initialized at vCPU creation, adjusts it for
/// `mode`, and installs the general-purpose register block of the guest ABI.
pub fn bootstrap_vcpu(
    vcpu: &VcpuFd,
    mode: EntryMode,
    entry: u32,
    initrd: Option<&Initrd>,
) -> Result<(), BootError> {
    let mut sregs = vcpu.get_sregs()?;
    apply_entry_mode(&mut sregs, mode);
    vcpu.set_sregs(&sregs)?;

    vcpu.set_regs(&entry_regs(entry, initrd))?;

    Ok(())
}

/// Adjust reset-state segment registers for the selected entry mode.
///
/// All fields not named here keep whatever KVM provided at vCPU creation.
fn apply_entry_mode(sregs: &mut kvm_sregs, mode: EntryMode) {
    match mode {
        EntryMode::Real => {
            sregs.cs.selector = 0;
            sregs.cs.base = 0;
        }
        EntryMode::Protected => {
            // Flat 4 GiB code segment: type 11 (execute/read, accessed),
            // 32-bit default operand size, page granularity.
            let code = kvm_segment {
                base: 0,
                limit: 0xffff_ffff,
                selector: 1 << 3,
                type_: 11,
                present: 1,
                dpl: 0,
                db: 1,
                s: 1,
                l: 0,
                g: 1,
                ..Default::default()
            };
            // Matching data segment: type 3 (read/write, accessed).
            let data = kvm_segment {
                type_: 3,
                selector: 2 << 3,
                ..code
            };

            sregs.cs = code;
            sregs.ds = data;
            sregs.es = data;
            sregs.fs = data;
            sregs.gs = data;
            sregs.ss = data;

            // CR0.PE enables protected mode.
            sregs.cr0 |= 1;
        }
    }
}

/// Build the general-purpose register block for guest entry.
fn entry_regs(entry: u32, initrd: Option<&Initrd>) -> kvm_regs {
    let rbx = match initrd {
        Some(initrd) => (initrd.base & 0xffff_f000) | ((initrd.size >> 12) & 0xfff),
        None => 0,
    };

    kvm_regs {
        // Only the reserved always-one flag bit is set.
        rflags: 2,
        rip: entry as u64,
        rax: BOOT_SIGNATURE,
        rbx,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_mode_zeroes_cs() {
        let mut sregs = kvm_sregs::default();
        // Reset-style CS: selector 0xf000, base just under 4 GiB.
        sregs.cs.selector = 0xf000;
        sregs.cs.base = 0xffff_0000;
        sregs.cr0 = 0x6000_0010;

        apply_entry_mode(&mut sregs, EntryMode::Real);

        assert_eq!(sregs.cs.selector, 0);
        assert_eq!(sregs.cs.base, 0);
        // CR0 and the other segments are untouched.
        assert_eq!(sregs.cr0, 0x6000_0010);
    }

    #[test]
    fn test_protected_mode_code_segment() {
        let mut sregs = kvm_sregs::default();

        apply_entry_mode(&mut sregs, EntryMode::Protected);

        assert_eq!(sregs.cs.selector, 8);
        assert_eq!(sregs.cs.base, 0);
        assert_eq!(sregs.cs.limit, 0xffff_ffff);
        assert_eq!(sregs.cs.type_, 11);
        assert_eq!(sregs.cs.present, 1);
        assert_eq!(sregs.cs.dpl, 0);
        assert_eq!(sregs.cs.db, 1);
        assert_eq!(sregs.cs.s, 1);
        assert_eq!(sregs.cs.l, 0);
        assert_eq!(sregs.cs.g, 1);
    }

    #[test]
    fn test_protected_mode_data_segments() {
        let mut sregs = kvm_sregs::default();

        apply_entry_mode(&mut sregs, EntryMode::Protected);

        for seg in [sregs.ds, sregs.es, sregs.fs, sregs.gs, sregs.ss] {
            assert_eq!(seg.selector, 16);
            assert_eq!(seg.type_, 3);
            assert_eq!(seg.limit, 0xffff_ffff);
            assert_eq!(seg.present, 1);
        }
    }

    #[test]
    fn test_protected_mode_sets_cr0_pe() {
        let mut sregs = kvm_sregs::default();
        sregs.cr0 = 0x6000_0010;

        apply_entry_mode(&mut sregs, EntryMode::Protected);

        assert_eq!(sregs.cr0, 0x6000_0011);
    }

    #[test]
    fn test_entry_regs_without_initrd() {
        let regs = entry_regs(0x0010_0000, None);

        assert_eq!(regs.rip, 0x0010_0000);
        assert_eq!(regs.rflags, 2);
        assert_eq!(regs.rax, 0x0c00_ffee);
        assert_eq!(regs.rbx, 0);
        assert_eq!(regs.rcx, 0);
        assert_eq!(regs.rsp, 0);
        assert_eq!(regs.rsi, 0);
        assert_eq!(regs.rdi, 0);
    }

    #[test]
    fn test_entry_regs_pack_initrd_descriptor() {
        let initrd = Initrd {
            base: 0x0080_0000,
            size: 0x2000,
        };

        let regs = entry_regs(0x0010_0000, Some(&initrd));

        // Base in the high 20 bits, size in pages in the low 12.
        assert_eq!(regs.rbx, 0x0080_0002);
    }

    #[test]
    fn test_initrd_descriptor_size_is_masked_to_12_bits() {
        let initrd = Initrd {
            base: 0x0080_0000,
            // 16 MiB + one page: the page count wraps past 12 bits.
            size: 0x100_1000,
        };

        let regs = entry_regs(0, Some(&initrd));

        assert_eq!(regs.rbx, 0x0080_0001);
    }
}
