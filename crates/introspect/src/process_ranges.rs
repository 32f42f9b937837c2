//! Program/interpreter/vDSO discovery. The public entry point,
//! `query_program_modules`, is memoized — computed exactly once and shared
//! by every later caller.

use once_cell::sync::OnceCell;

use crate::auxv::{self, Auxv};
use crate::dumpable::DumpableGuard;
use crate::elf_ranges::{self, PhdrRange};
use crate::error::{Error, Result};
use crate::proc_maps::ProcMaps;
use crate::types::{MemoryRange, ModuleDescriptor, ProgramModules, RtldKind};
use crate::util::page_size;

static PROGRAM_MODULES: OnceCell<ProgramModules> = OnceCell::new();

/// Returns the process's program/interpreter/vDSO record, computing it on
/// first call and returning the same record on every later call.
pub fn query_program_modules() -> Result<&'static ProgramModules> {
    if let Some(existing) = PROGRAM_MODULES.get() {
        return Ok(existing);
    }
    let computed = compute_program_modules()?;
    Ok(PROGRAM_MODULES.get_or_init(|| computed))
}

fn compute_program_modules() -> Result<ProgramModules> {
    let _guard = DumpableGuard::acquire();

    let proc_auxv = auxv::read_from_proc();
    let stack_auxv = auxv::read_from_stack_scan();

    let (proc_auxv, stack_auxv) = match (proc_auxv, stack_auxv) {
        (Ok(p), Ok(s)) => (Some(p), Some(s)),
        (Ok(p), Err(e)) => {
            log::warn!("process_ranges: stack-scan auxv rejected ({e}), trusting /proc/self/auxv alone");
            (Some(p), None)
        }
        (Err(e), Ok(s)) => {
            log::warn!("process_ranges: /proc/self/auxv read failed ({e}), trusting stack scan alone");
            (None, Some(s))
        }
        (Err(e1), Err(e2)) => {
            return Err(Error::Failed {
                errno: 0,
                context: format!("process_ranges: both auxv sources failed ({e1}; {e2})"),
            })
        }
    };

    let page = page_size();

    let kernel_program = proc_auxv.as_ref().map(|a| program_range_from_auxv(a, page));
    let stack_program = stack_auxv.as_ref().map(|a| program_range_from_auxv(a, page));

    // Step 3: if both reads succeeded and disagree on the program base,
    // the kernel view is actually looking at the interpreter.
    let (program_range, interpreter_from_swap, authoritative_auxv) =
        match (&kernel_program, &stack_program) {
            (Some(k), Some(s)) if k.base_address != s.base_address => {
                log::debug!(
                    "process_ranges: kernel/stack program bases disagree (0x{:x} vs 0x{:x}); treating kernel view as interpreter",
                    k.base_address, s.base_address
                );
                (*s, Some(*k), stack_auxv.as_ref().unwrap())
            }
            (Some(k), Some(_)) => (*k, None, proc_auxv.as_ref().unwrap()),
            (Some(k), None) => (*k, None, proc_auxv.as_ref().unwrap()),
            (None, Some(s)) => (*s, None, stack_auxv.as_ref().unwrap()),
            (None, None) => unreachable!("both-failed case returned above"),
        };

    let at_base = authoritative_auxv.get(auxv::AT_BASE).unwrap_or(0);
    let at_sysinfo_ehdr = authoritative_auxv.get(auxv::AT_SYSINFO_EHDR).unwrap_or(0);

    let rtld_kind = if at_base != 0 || interpreter_from_swap.is_some() {
        RtldKind::Shared
    } else {
        RtldKind::None
    };

    let interpreter_range: Option<MemoryRange> = match interpreter_from_swap {
        Some(r) => Some(MemoryRange::new(r.base_address, r.size())),
        None if rtld_kind == RtldKind::Shared && at_base != 0 => unsafe { range_from_module_base(at_base, page) },
        None => None,
    };

    let vdso_range = if at_sysinfo_ehdr != 0 {
        unsafe { range_from_module_base(at_sysinfo_ehdr, page) }
    } else {
        None
    };

    // Step 4: resolve on-disk paths by matching start addresses against
    // /proc/self/maps.
    let maps = ProcMaps::this_process()?;
    let mut path_by_start: std::collections::HashMap<u64, String> = std::collections::HashMap::new();
    for entry in maps {
        path_by_start.entry(entry.start).or_insert(entry.path);
    }

    let program_range = MemoryRange::new(program_range.base_address, program_range.size());
    let program_path = path_by_start
        .get(&program_range.base_address)
        .cloned()
        .unwrap_or_else(|| "/proc/self/exe".to_string());
    let program = ModuleDescriptor::new(program_path, program_range);

    let interpreter = interpreter_range.map(|r| {
        let path = path_by_start.get(&r.base_address).cloned().unwrap_or_default();
        ModuleDescriptor::new(path, r)
    });

    let vdso = vdso_range.map(ModuleDescriptor::vdso);

    Ok(ProgramModules {
        program,
        interpreter,
        vdso,
        rtld_kind,
    })
}

#[derive(Clone, Copy)]
struct ResolvedRange {
    base_address: u64,
    phdr: PhdrRange,
}

impl ResolvedRange {
    fn size(&self) -> u64 {
        self.phdr.size()
    }
}

fn program_range_from_auxv(auxv: &Auxv, page: u64) -> ResolvedRange {
    let phdr_addr = auxv.get(auxv::AT_PHDR).unwrap_or(0);
    let phent = auxv.get(auxv::AT_PHENT).unwrap_or(0);
    let phnum = auxv.get(auxv::AT_PHNUM).unwrap_or(0);
    let phdr = if phdr_addr != 0 && phent != 0 && phnum != 0 {
        unsafe { elf_ranges::range_from_live_phdrs(phdr_addr, phent, phnum, page) }
    } else {
        PhdrRange::default()
    };
    // Fallback base when neither a `PT_PHDR` segment nor a zero-offset
    // `PT_LOAD` segment was found: `AT_PHDR` itself, which is wrong by the
    // ELF header's size but still lands inside the program's first page.
    let base = phdr.base_address(phdr_addr);
    ResolvedRange { base_address: base, phdr }
}

/// Reads a module's own embedded ELF header at `base` to locate its
/// program headers, then folds them into a range the same way the main
/// program's `AT_PHDR`-sourced headers are folded.
unsafe fn range_from_module_base(base: u64, page: u64) -> Option<MemoryRange> {
    let (phoff, phentsize, phnum) = elf_ranges::phdr_location_from_ehdr(base)?;
    if phentsize == 0 || phnum == 0 {
        // Some vDSO builds carry a header but lose their own PT_LOAD/PT_PHDR
        // segments once mapped read-only; a single page is still a valid,
        // if imprecise, answer for enumeration purposes.
        return Some(MemoryRange::new(base, page));
    }
    let phdr_addr = base + phoff;
    let phdr = elf_ranges::range_from_live_phdrs(phdr_addr, phentsize, phnum, page);
    let resolved_base = phdr.base_address(base);
    Some(MemoryRange::new(resolved_base, phdr.size().max(page)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_program_modules_succeeds_and_memoizes() {
        let first = query_program_modules().expect("first query");
        let second = query_program_modules().expect("second query");
        assert_eq!(first.program.path, second.program.path);
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn vdso_path_is_synthesized_when_present() {
        if let Ok(modules) = query_program_modules() {
            if let Some(vdso) = &modules.vdso {
                assert_eq!(vdso.name, "linux-vdso.so.1");
            }
        }
    }
}
