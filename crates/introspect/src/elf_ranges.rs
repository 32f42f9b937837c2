//! Minimal, in-memory ELF program-header interpretation — just enough to
//! turn `AT_PHDR`/`AT_PHENT`/`AT_PHNUM` into a `(base, size)` range. This
//! reads the live, already-mapped program-header table directly out of
//! the process's own address space; it is not a general ELF parser and is
//! not used for anything beyond range computation and the `PT_PHDR`
//! base-address derivation.
//!
//! Parsing a module's on-disk ELF magic bytes for the Module Enumerator's
//! proc-maps fallback goes through `goblin` instead, since there we
//! genuinely have a byte buffer rather than a live phdr array.

pub const PT_LOAD: u32 = 1;
pub const PT_PHDR: u32 = 6;

#[derive(Debug, Clone, Copy, Default)]
pub struct PhdrRange {
    pub lowest: u64,
    pub highest: u64,
    /// Present iff a `PT_PHDR` segment was seen; used to derive the load
    /// base as `phdr_vaddr - p_offset`.
    pub phdr_segment: Option<(u64, u64)>, // (p_vaddr, p_offset)
    /// The first `PT_LOAD` segment with `p_offset == 0`, if any — the
    /// fallback base-address source when no `PT_PHDR` segment exists.
    pub first_zero_offset_load_vaddr: Option<u64>,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf32Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

/// Reads the live program-header array at `phdr_addr` (as given by
/// `AT_PHDR`) and folds it into a `PhdrRange`.
///
/// # Safety
/// `phdr_addr` must point at `phnum` valid, readable program headers of
/// `phent` bytes each, belonging to the calling process's own address
/// space (true for `AT_PHDR`/`AT_PHENT`/`AT_PHNUM` taken from either auxv
/// source in `auxv.rs`).
pub unsafe fn range_from_live_phdrs(phdr_addr: u64, phent: u64, phnum: u64, page_size: u64) -> PhdrRange {
    let mut out = PhdrRange {
        lowest: u64::MAX,
        highest: 0,
        phdr_segment: None,
        first_zero_offset_load_vaddr: None,
    };

    for i in 0..phnum {
        let entry_addr = (phdr_addr as usize) + (i as usize) * (phent as usize);
        let (p_type, p_offset, p_vaddr, p_memsz) = if phent as usize >= core::mem::size_of::<Elf64Phdr>() {
            let p = core::ptr::read_unaligned(entry_addr as *const Elf64Phdr);
            (p.p_type, p.p_offset, p.p_vaddr, p.p_memsz)
        } else {
            let p = core::ptr::read_unaligned(entry_addr as *const Elf32Phdr);
            (p.p_type, p.p_offset as u64, p.p_vaddr as u64, p.p_memsz as u64)
        };

        if p_type == PT_PHDR {
            out.phdr_segment = Some((p_vaddr, p_offset));
        }
        if p_type == PT_LOAD {
            let page_start = p_vaddr & !(page_size - 1);
            out.lowest = out.lowest.min(page_start);
            out.highest = out.highest.max(p_vaddr + p_memsz);
            if p_offset == 0 && out.first_zero_offset_load_vaddr.is_none() {
                out.first_zero_offset_load_vaddr = Some(p_vaddr);
            }
        }
    }

    if out.lowest == u64::MAX {
        out.lowest = 0;
    }
    out
}

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Reads a module's own ELF header, already mapped at `base`, to recover
/// `(e_phoff, e_phentsize, e_phnum)` — used for the interpreter and vDSO,
/// whose program-header location isn't handed to us directly via auxv the
/// way `AT_PHDR`/`AT_PHENT`/`AT_PHNUM` hand us the main program's.
///
/// # Safety
/// `base` must point at a readable, fully-mapped ELF header belonging to
/// the calling process's own address space.
#[cfg(target_pointer_width = "64")]
pub unsafe fn phdr_location_from_ehdr(base: u64) -> Option<(u64, u64, u64)> {
    let magic = core::slice::from_raw_parts(base as *const u8, 4);
    if magic != ELF_MAGIC {
        return None;
    }
    let e_phoff = core::ptr::read_unaligned((base + 32) as *const u64);
    let e_phentsize = core::ptr::read_unaligned((base + 54) as *const u16) as u64;
    let e_phnum = core::ptr::read_unaligned((base + 56) as *const u16) as u64;
    Some((e_phoff, e_phentsize, e_phnum))
}

#[cfg(target_pointer_width = "32")]
pub unsafe fn phdr_location_from_ehdr(base: u64) -> Option<(u64, u64, u64)> {
    let magic = core::slice::from_raw_parts(base as *const u8, 4);
    if magic != ELF_MAGIC {
        return None;
    }
    let e_phoff = core::ptr::read_unaligned((base + 28) as *const u32) as u64;
    let e_phentsize = core::ptr::read_unaligned((base + 42) as *const u16) as u64;
    let e_phnum = core::ptr::read_unaligned((base + 44) as *const u16) as u64;
    Some((e_phoff, e_phentsize, e_phnum))
}

impl PhdrRange {
    pub fn size(&self) -> u64 {
        self.highest.saturating_sub(self.lowest)
    }

    /// Base address derivation: `PT_PHDR` first, else the
    /// first zero-offset `PT_LOAD`, else the caller's ELF-header fallback
    /// (e.g. `AT_SYSINFO_EHDR` for the vDSO, or the live `phdr_addr` minus
    /// a conventionally-known ELF header size for other callers).
    pub fn base_address(&self, fallback: u64) -> u64 {
        if let Some((p_vaddr, p_offset)) = self.phdr_segment {
            return p_vaddr - p_offset;
        }
        if let Some(vaddr) = self.first_zero_offset_load_vaddr {
            return vaddr;
        }
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_saturating_when_empty() {
        let r = PhdrRange::default();
        assert_eq!(r.size(), 0);
    }

    #[test]
    fn base_address_prefers_phdr_segment() {
        let mut r = PhdrRange::default();
        r.phdr_segment = Some((0x401040, 0x40));
        r.first_zero_offset_load_vaddr = Some(0x400000);
        assert_eq!(r.base_address(0xdead), 0x401000);
    }

    #[test]
    fn base_address_falls_back_to_zero_offset_load() {
        let mut r = PhdrRange::default();
        r.first_zero_offset_load_vaddr = Some(0x400000);
        assert_eq!(r.base_address(0xdead), 0x400000);
    }

    #[test]
    fn base_address_falls_back_to_caller_value() {
        let r = PhdrRange::default();
        assert_eq!(r.base_address(0x7fff00000000), 0x7fff00000000);
    }
}
