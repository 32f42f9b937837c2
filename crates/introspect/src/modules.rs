//! Module enumeration: list the shared objects and executables mapped into
//! the current process.
//!
//! Strategy, in order of preference:
//! 1. Static binary (`rtld_kind = NONE`): only the program and vDSO exist.
//! 2. `dl_iterate_phdr`, decorated with `/proc/self/maps` path names (the
//!    linker's own name string is often empty for the main program).
//! 3. `/proc/self/maps` scanning with an ELF-magic probe, for the rare
//!    libc that doesn't support `dl_iterate_phdr` (musl predates it; kept
//!    here as the documented fallback).

use std::collections::HashMap;
use std::os::raw::c_int;

use crate::elf_ranges;
use crate::proc_maps::ProcMaps;
use crate::process_ranges::query_program_modules;
use crate::types::{MemoryRange, ModuleDescriptor, RtldKind};
use crate::util::page_size;

/// Returned by the enumeration callback to request early termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    Continue,
    Stop,
}

/// Enumerates every module currently mapped into the process, in no
/// guaranteed order except that the main program is reported first when
/// the static-binary path is taken. The callback's return value decides
/// whether iteration continues.
pub fn enumerate_modules(mut callback: impl FnMut(&ModuleDescriptor) -> ControlFlow) {
    let modules = match query_program_modules() {
        Ok(m) => m,
        Err(e) => {
            log::warn!("modules: query_program_modules failed, nothing to enumerate ({e})");
            return;
        }
    };

    if modules.rtld_kind == RtldKind::None {
        if callback(&modules.program) == ControlFlow::Stop {
            return;
        }
        if let Some(vdso) = &modules.vdso {
            callback(vdso);
        }
        return;
    }

    if dl_iterate_phdr_available() {
        enumerate_via_dl_iterate_phdr(&mut callback);
    } else {
        enumerate_via_proc_maps(&mut callback);
    }
}

/// Probes for `dl_iterate_phdr` via `dlsym(RTLD_DEFAULT, ...)` rather than
/// assuming glibc's presence — musl predates the symbol on some older
/// releases this crate still has to run on, and `dlsym` against the
/// default scope is the one portable
/// way to ask "does the linker export this" without linking against it
/// directly and crashing at load time on a libc that lacks it.
fn dl_iterate_phdr_available() -> bool {
    let Ok(name) = std::ffi::CString::new("dl_iterate_phdr") else {
        return false;
    };
    unsafe { !libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()).is_null() }
}

struct DlIterContext<'a> {
    callback: &'a mut dyn FnMut(&ModuleDescriptor) -> ControlFlow,
    path_by_start: HashMap<u64, String>,
    stopped: bool,
}

extern "C" fn dl_phdr_callback(
    info: *mut libc::dl_phdr_info,
    _size: usize,
    data: *mut std::os::raw::c_void,
) -> c_int {
    unsafe {
        let info = &*info;
        let ctx = &mut *(data as *mut DlIterContext);

        let name = if info.dlpi_name.is_null() {
            String::new()
        } else {
            std::ffi::CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
        };

        let Some(range) = phdr_range(info) else {
            return 0;
        };

        let path = if name.is_empty() {
            ctx.path_by_start
                .get(&range.base_address)
                .cloned()
                .unwrap_or_else(|| "/proc/self/exe".to_string())
        } else {
            name
        };

        let descriptor = ModuleDescriptor::new(path, range);
        if (ctx.callback)(&descriptor) == ControlFlow::Stop {
            ctx.stopped = true;
            return 1; // non-zero halts dl_iterate_phdr's own iteration
        }
    }
    0
}

unsafe fn phdr_range(info: &libc::dl_phdr_info) -> Option<MemoryRange> {
    if info.dlpi_phnum == 0 || info.dlpi_phdr.is_null() {
        return None;
    }
    let page = page_size();
    let phdr = elf_ranges::range_from_live_phdrs(
        info.dlpi_phdr as u64,
        core::mem::size_of::<libc::Elf64_Phdr>() as u64,
        info.dlpi_phnum as u64,
        page,
    );
    let base = info.dlpi_addr as u64;
    Some(MemoryRange::new(base, phdr.size().max(page)))
}

fn enumerate_via_dl_iterate_phdr(callback: &mut impl FnMut(&ModuleDescriptor) -> ControlFlow) {
    let path_by_start = path_by_start_from_maps();
    let mut ctx = DlIterContext {
        callback,
        path_by_start,
        stopped: false,
    };

    unsafe {
        libc::dl_iterate_phdr(Some(dl_phdr_callback), &mut ctx as *mut _ as *mut std::os::raw::c_void);
    }
}

fn path_by_start_from_maps() -> HashMap<u64, String> {
    let mut map = HashMap::new();
    if let Ok(maps) = ProcMaps::this_process() {
        for entry in maps {
            if !entry.path.is_empty() {
                map.entry(entry.start).or_insert(entry.path);
            }
        }
    }
    map
}

/// Proc-maps scanning fallback: accept mappings that are readable, private
/// (not shared), start with the ELF magic, and whose
/// path is either absolute or the vDSO pseudo-path; merge consecutive
/// ranges sharing a path into a single module.
fn enumerate_via_proc_maps(callback: &mut impl FnMut(&ModuleDescriptor) -> ControlFlow) {
    let maps = match ProcMaps::this_process() {
        Ok(m) => m,
        Err(e) => {
            log::warn!("modules: proc-maps fallback unavailable ({e})");
            return;
        }
    };

    let mut current: Option<(String, MemoryRange)> = None;

    for entry in maps {
        if !entry.perms.read || entry.perms.shared {
            continue;
        }

        let display_path = if entry.path == "[vdso]" {
            "linux-vdso.so.1".to_string()
        } else if entry.path.starts_with('/') {
            entry.path.clone()
        } else {
            continue;
        };

        if display_path.starts_with("/dev/") {
            continue;
        }

        let is_header = entry.offset == 0 && has_elf_magic(&display_path);
        if !is_header {
            if let Some((path, range)) = &mut current {
                if *path == display_path && entry.start == range.end() {
                    range.size = entry.end - range.base_address;
                    continue;
                }
            }
            continue;
        }

        if let Some((path, range)) = current.take() {
            let descriptor = ModuleDescriptor::new(path, range);
            if callback(&descriptor) == ControlFlow::Stop {
                return;
            }
        }

        current = Some((display_path, MemoryRange::new(entry.start, entry.end - entry.start)));
    }

    if let Some((path, range)) = current {
        let descriptor = ModuleDescriptor::new(path, range);
        callback(&descriptor);
    }
}

/// Checks the on-disk file's magic bytes rather than the live mapping —
/// the proc-maps fallback only ever has a path, and general ELF parsing
/// is an external collaborator's job, so this goes through `goblin`
/// rather than hand-rolling a second magic check.
fn has_elf_magic(path: &str) -> bool {
    use std::io::Read;
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut header = [0u8; 4];
    if file.read_exact(&mut header).is_err() {
        return false;
    }
    header == *goblin::elf::header::ELFMAG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration_yields_at_least_the_program() {
        let mut seen = Vec::new();
        enumerate_modules(|m| {
            seen.push(m.name.clone());
            ControlFlow::Continue
        });
        assert!(!seen.is_empty());
    }

    #[test]
    fn callback_stop_halts_iteration_early() {
        let mut count = 0;
        enumerate_modules(|_| {
            count += 1;
            ControlFlow::Stop
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn proc_maps_fallback_path_is_internally_consistent() {
        let mut seen = Vec::new();
        enumerate_via_proc_maps(&mut |m| {
            seen.push(m.path.clone());
            ControlFlow::Continue
        });
        assert!(seen.iter().any(|p| p.to_string_lossy().starts_with('/')));
    }
}
