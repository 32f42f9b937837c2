//! Code deflectors: trampolines squeezed into unused ELF padding ("code
//! caves") so a caller with only a few bytes of branch reach can still be
//! redirected to an arbitrary target. Many deflectors share one dispatcher
//! per cave, since caves are scarce and one cave can multiplex many callers
//! distinguished by their return address.

use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::code_slice::{AddressSpec, CodeAllocator};
use crate::error::{Error, Result};
use crate::proc_maps::ProcMaps;
use crate::util::page_size;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
/// The cave probe window: the 8 bytes immediately following the ELF
/// header, accepted only when every byte is zero (genuine padding, never
/// instructions or relocations).
const CAVE_SIZE: usize = 8;

/// A single (return-address → target) redirection installed in a cave.
#[derive(Debug, Clone, Copy)]
pub struct Deflector {
    pub return_address: u64,
    pub target: u64,
    pub trampoline: u64,
}

/// Process-wide table the cave-resident thunk actually reads at runtime,
/// keyed by `dispatcher_handle` (the dispatcher's cave address) and then by
/// caller return address. The thunk runs with no Rust closure environment —
/// it calls `lookup_thunk` as a raw function pointer — so the live
/// `Dispatcher` itself can't be reached directly; this mirror is the only
/// thing the thunk can consult. `Dispatcher::add_deflector`/
/// `remove_deflector`/`install`/`destroy` keep it in sync with each
/// dispatcher's own bookkeeping.
static CALLER_TABLE: Lazy<RwLock<HashMap<u64, HashMap<u64, u64>>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// The indirect-branch helper shared by every deflector in one cave.
pub struct Dispatcher {
    cave_address: u64,
    cave_original_bytes: [u8; CAVE_SIZE],
    thunk: crate::code_slice::CodeSlice,
    callers: HashMap<u64, u64>,
}

impl Dispatcher {
    /// Locates a cave reachable from `near_address` and installs a
    /// dispatcher in it.
    pub fn install(allocator: &mut CodeAllocator, near_address: u64, max_distance: u64) -> Result<Self> {
        let cave_address = find_cave(near_address, max_distance)?;

        let spec = AddressSpec { near_address, max_distance };
        let thunk = allocator.try_alloc_slice_near(spec, 16)?;

        // The handle passed to `lookup_thunk` is the cave address itself
        // (stable and already unique per dispatcher), so the thunk's
        // immediate can be emitted once here with no later patch-up.
        let lookup_addr = lookup_thunk as usize as u64;
        let thunk_code = emit_thunk(lookup_addr, cave_address);
        unsafe {
            thunk.write(&thunk_code);
        }
        allocator.commit();

        let mut cave_original_bytes = [0u8; CAVE_SIZE];
        unsafe {
            core::ptr::copy_nonoverlapping(cave_address as *const u8, cave_original_bytes.as_mut_ptr(), CAVE_SIZE);
        }

        let trampoline_code = emit_cave_trampoline(cave_address, thunk.data_ptr as u64);
        unsafe {
            patch_cave(cave_address, &trampoline_code)?;
        }

        CALLER_TABLE.write().unwrap().entry(cave_address).or_default();

        Ok(Dispatcher {
            cave_address,
            cave_original_bytes,
            thunk,
            callers: HashMap::new(),
        })
    }

    /// Registers a new deflector for `return_address` → `target` in this
    /// dispatcher, returning the caller-facing trampoline address.
    pub fn add_deflector(&mut self, return_address: u64, target: u64) -> Deflector {
        self.callers.insert(return_address, target);
        CALLER_TABLE
            .write()
            .unwrap()
            .entry(self.cave_address)
            .or_default()
            .insert(return_address, target);
        Deflector {
            return_address,
            target,
            trampoline: cave_trampoline_address(self.cave_address),
        }
    }

    pub fn remove_deflector(&mut self, return_address: u64) {
        self.callers.remove(&return_address);
        if let Some(callers) = CALLER_TABLE.write().unwrap().get_mut(&self.cave_address) {
            callers.remove(&return_address);
        }
    }

    /// A direct linear-scan lookup over this dispatcher's own bookkeeping,
    /// matching `return_address` exactly. The runtime path a redirected
    /// branch actually takes goes through `lookup_thunk` and `CALLER_TABLE`
    /// instead, since the thunk has no access to `&Dispatcher`; this method
    /// exists for callers (and tests) that already hold one.
    pub fn lookup(&self, return_address: u64) -> Option<u64> {
        self.callers.get(&return_address).copied()
    }

    /// Restores the cave's original bytes and frees the thunk page. Every
    /// deflector attached to this dispatcher is implicitly invalidated —
    /// callers must not invoke a stale trampoline address afterward.
    pub fn destroy(self, allocator: &mut CodeAllocator) -> Result<()> {
        unsafe {
            patch_cave(self.cave_address, &self.cave_original_bytes)?;
        }
        CALLER_TABLE.write().unwrap().remove(&self.cave_address);
        let Dispatcher { thunk, .. } = self;
        allocator.free_slice(thunk);
        Ok(())
    }
}

/// Owns `Dispatcher` instances by cave address so an embedder can look one
/// up for `add_deflector`/`remove_deflector`/`destroy` without threading it
/// through manually. Not internally synchronized, like the allocator it
/// wraps — callers serialize their own access. The runtime lookup path a
/// thunk actually takes doesn't go through this registry at all; see
/// `CALLER_TABLE`.
pub struct DeflectorRegistry {
    dispatchers: HashMap<u64, Dispatcher>,
}

impl DeflectorRegistry {
    pub fn new() -> Self {
        DeflectorRegistry { dispatchers: HashMap::new() }
    }

    pub fn register(&mut self, dispatcher: Dispatcher) -> u64 {
        let cave = dispatcher.cave_address;
        self.dispatchers.insert(cave, dispatcher);
        cave
    }

    pub fn get(&self, cave_address: u64) -> Option<&Dispatcher> {
        self.dispatchers.get(&cave_address)
    }

    pub fn get_mut(&mut self, cave_address: u64) -> Option<&mut Dispatcher> {
        self.dispatchers.get_mut(&cave_address)
    }

    pub fn remove(&mut self, cave_address: u64) -> Option<Dispatcher> {
        self.dispatchers.remove(&cave_address)
    }
}

impl Default for DeflectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Scans readable-executable ranges from proc-maps for the first
/// zero-filled 8-byte cave within `max_distance` of `near_address`. The
/// slot's existence check doesn't distinguish genuinely unused padding from
/// a hardened binary whose loader has already zeroed that region for other
/// reasons — relaxing this probe is left for later, so this stays
/// byte-for-byte as documented.
fn find_cave(near_address: u64, max_distance: u64) -> Result<u64> {
    let maps = ProcMaps::this_process()?;

    for entry in maps {
        if !(entry.perms.read && entry.perms.exec) {
            continue;
        }
        let slot_address = entry.start + ELF_MAGIC.len() as u64;
        if slot_address + CAVE_SIZE as u64 > entry.end {
            continue;
        }
        let within = slot_address.checked_sub(max_distance).unwrap_or(0) <= near_address
            && near_address.saturating_add(max_distance) >= slot_address + CAVE_SIZE as u64;
        if !within {
            continue;
        }

        let header = unsafe { core::slice::from_raw_parts(entry.start as *const u8, ELF_MAGIC.len()) };
        if header != ELF_MAGIC {
            continue;
        }

        let slot = unsafe { core::slice::from_raw_parts(slot_address as *const u8, CAVE_SIZE) };
        if slot.iter().all(|&b| b == 0) {
            return Ok(slot_address);
        }
    }

    Err(Error::NotFound("deflector: no reachable zero-filled code cave found".into()))
}

/// # Safety
/// `cave_address..cave_address+bytes.len()` must be inside an
/// already-executable mapping this process owns; this flips the
/// containing page(s) writable for the duration of the write.
unsafe fn patch_cave(cave_address: u64, bytes: &[u8]) -> Result<()> {
    let page = page_size();
    let page_start = cave_address & !(page - 1);
    let page_len = ((cave_address + bytes.len() as u64 - page_start) as usize).max(page as usize);

    let rc = libc::mprotect(
        page_start as *mut libc::c_void,
        page_len,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    );
    if rc != 0 {
        return Err(Error::Failed {
            errno: *libc::__errno_location(),
            context: "deflector: mprotect(cave, RWX) failed".into(),
        });
    }

    core::ptr::copy_nonoverlapping(bytes.as_ptr(), cave_address as *mut u8, bytes.len());

    let rc = libc::mprotect(page_start as *mut libc::c_void, page_len, libc::PROT_READ | libc::PROT_EXEC);
    if rc != 0 {
        return Err(Error::Failed {
            errno: *libc::__errno_location(),
            context: "deflector: mprotect(cave, RX) failed".into(),
        });
    }

    #[cfg(target_arch = "aarch64")]
    {
        let mut p = page_start;
        while p < page_start + page_len as u64 {
            core::arch::asm!("dc cvau, {0}", "ic ivau, {0}", in(reg) p);
            p += 64;
        }
        core::arch::asm!("dsb ish", "isb");
    }

    Ok(())
}

/// Emits the cave-resident trampoline: load the thunk address into a
/// scratch register and branch to it. Exactly `CAVE_SIZE` bytes so the
/// write never spills past the verified-zero padding.
#[cfg(target_arch = "x86_64")]
fn emit_cave_trampoline(cave_address: u64, thunk_address: u64) -> [u8; CAVE_SIZE] {
    // A full `jmp qword ptr [rip+0]; .quad thunk_address` doesn't fit in
    // 8 bytes with its own literal, so the cave holds a short `jmp rel32`
    // to the thunk instead — fits easily within CAVE_SIZE with 3 bytes of
    // NOP padding, and `max_distance` is expected to keep the thunk within
    // i32 range of the cave for every caller of this engine.
    let mut out = [0x90u8; CAVE_SIZE]; // NOP-pad the unused tail
    out[0] = 0xe9; // jmp rel32
    // Relative to the byte immediately after the 5-byte jmp instruction.
    let rel = thunk_address as i64 - (cave_address as i64 + 5);
    let rel32 = rel as i32;
    out[1..5].copy_from_slice(&rel32.to_le_bytes());
    out
}

#[cfg(target_arch = "aarch64")]
fn emit_cave_trampoline(cave_address: u64, thunk_address: u64) -> [u8; CAVE_SIZE] {
    // `ldr x16, #8; br x16; .quad thunk_address` would be 16 bytes; with
    // only 8 available, emit a PC-relative `b` instead (±128MB range,
    // which `max_distance` is expected to respect for this architecture).
    let mut out = [0u8; CAVE_SIZE];
    let rel = thunk_address as i64 - cave_address as i64;
    let imm26 = ((rel / 4) as i32) & 0x03ff_ffff;
    let insn: u32 = 0x1400_0000 | (imm26 as u32);
    out[0..4].copy_from_slice(&insn.to_le_bytes());
    out[4..8].fill(0);
    out
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn emit_cave_trampoline(_cave_address: u64, _thunk_address: u64) -> [u8; CAVE_SIZE] {
    [0u8; CAVE_SIZE]
}

fn cave_trampoline_address(cave_address: u64) -> u64 {
    cave_address
}

/// Emits the thunk: a short sequence that calls `lookup_thunk` with
/// `(dispatcher_handle, return_address)` and branches to whatever it
/// returns. The cave holds a `jmp`/`b`, not a `call`/`bl`, so the caller's
/// own return address is still sitting wherever the original call
/// instruction left it — on the stack on x86-64, in the link register on
/// aarch64 — and the thunk has to pick it up from there rather than from
/// its own frame.
#[cfg(target_arch = "x86_64")]
fn emit_thunk(lookup_addr: u64, dispatcher_handle: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0x48, 0xbf]); // movabs rdi, imm64 (dispatcher_handle)
    out.extend_from_slice(&dispatcher_handle.to_le_bytes());
    out.extend_from_slice(&[0x48, 0x8b, 0x34, 0x24]); // mov rsi, [rsp]  (caller's return address)
    out.extend_from_slice(&[0x48, 0xb8]); // movabs rax, imm64 (lookup_addr)
    out.extend_from_slice(&lookup_addr.to_le_bytes());
    out.extend_from_slice(&[0xff, 0xd0]); // call rax
    out.extend_from_slice(&[0xff, 0xe0]); // jmp rax  (lookup_thunk's return value)
    out
}

#[cfg(target_arch = "aarch64")]
fn emit_thunk(lookup_addr: u64, dispatcher_handle: u64) -> Vec<u8> {
    // Load both 64-bit immediates via four `movz`/`movk` each, call, then
    // branch to the returned address in x0.
    let mut out = Vec::new();
    emit_mov64(&mut out, 0, dispatcher_handle); // x0 = dispatcher_handle
    out.extend_from_slice(&mov_x1_lr().to_le_bytes()); // x1 = caller's return address (link register)
    emit_mov64(&mut out, 2, lookup_addr); // x2 = lookup_thunk
    out.extend_from_slice(&0xd63f_0040u32.to_le_bytes()); // blr x2
    out.extend_from_slice(&0xd61f_0000u32.to_le_bytes()); // br x0 (lookup_thunk's return value)
    out
}

#[cfg(target_arch = "aarch64")]
fn mov_x1_lr() -> u32 {
    // `mov x1, x30` == `orr x1, xzr, x30`.
    0xaa00_03e0 | (30u32 << 16) | 1u32
}

#[cfg(target_arch = "aarch64")]
fn emit_mov64(out: &mut Vec<u8>, reg: u32, value: u64) {
    for shift in 0..4u32 {
        let chunk = ((value >> (shift * 16)) & 0xffff) as u32;
        let opcode = if shift == 0 { 0xd280_0000 } else { 0xf2a0_0000 };
        let insn = opcode | (shift << 21) | (chunk << 5) | reg;
        out.extend_from_slice(&insn.to_le_bytes());
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn emit_thunk(_lookup_addr: u64, _dispatcher_handle: u64) -> Vec<u8> {
    Vec::new()
}

/// The function every thunk calls at runtime: consults `CALLER_TABLE` for
/// `dispatcher_handle` (the cave address), then for `return_address` within
/// it, and returns the registered target, or `0` if either lookup misses.
/// A `0` return sends the caller to address zero, which is deliberate —
/// an unregistered return address means this deflector was invoked from
/// somewhere it was never wired up for, and crashing loudly beats silently
/// falling through to garbage.
extern "C" fn lookup_thunk(dispatcher_handle: u64, return_address: u64) -> u64 {
    let Ok(table) = CALLER_TABLE.read() else {
        return 0;
    };
    table
        .get(&dispatcher_handle)
        .and_then(|callers| callers.get(&return_address))
        .copied()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_lookup_matches_registered_caller_only() {
        let mut dispatcher = Dispatcher {
            cave_address: 0,
            cave_original_bytes: [0u8; CAVE_SIZE],
            thunk: test_code_slice(),
            callers: HashMap::new(),
        };
        let deflector = dispatcher.add_deflector(0x1000, 0x2000);
        assert_eq!(dispatcher.lookup(0x1000), Some(0x2000));
        assert_eq!(dispatcher.lookup(0x1001), None);
        assert_eq!(deflector.target, 0x2000);
    }

    #[test]
    fn lookup_thunk_consults_the_process_wide_table() {
        let mut dispatcher = Dispatcher {
            cave_address: 0x5000,
            cave_original_bytes: [0u8; CAVE_SIZE],
            thunk: test_code_slice(),
            callers: HashMap::new(),
        };
        dispatcher.add_deflector(0x6000, 0x7000);
        assert_eq!(lookup_thunk(0x5000, 0x6000), 0x7000);
        assert_eq!(lookup_thunk(0x5000, 0x6001), 0);
        assert_eq!(lookup_thunk(0xdead, 0x6000), 0);

        dispatcher.remove_deflector(0x6000);
        assert_eq!(lookup_thunk(0x5000, 0x6000), 0);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn x86_64_cave_trampoline_encodes_relative_jump() {
        let bytes = emit_cave_trampoline(0x1000, 0x2000);
        assert_eq!(bytes[0], 0xe9);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn x86_64_thunk_loads_both_argument_registers() {
        let bytes = emit_thunk(0x1234, 0x5678);
        assert_eq!(&bytes[0..2], &[0x48, 0xbf]); // movabs rdi, ...
        assert_eq!(&bytes[2..10], &0x5678u64.to_le_bytes());
        assert_eq!(&bytes[10..14], &[0x48, 0x8b, 0x34, 0x24]); // mov rsi, [rsp]
    }

    /// A minimal stand-in `CodeSlice`, for unit-testing dispatcher
    /// bookkeeping without going through the real allocator's mmap path.
    fn test_code_slice() -> crate::code_slice::CodeSlice {
        let mut alloc = CodeAllocator::new(crate::code_slice::AllocatorPolicy { rwx_available: true });
        let spec = AddressSpec { near_address: 0, max_distance: u64::MAX / 2 };
        alloc.try_alloc_slice_near(spec, 1).expect("alloc test slice")
    }
}
