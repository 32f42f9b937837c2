//! Architecture-specific CPU register bundles. `CpuContext`
//! is a tagged union over the supported ISAs rather than one flattened
//! struct, since the register sets don't correspond 1:1 across
//! architectures and the round-trip invariant only needs to hold within
//! one architecture's own variant.
//!
//! Round-trip invariant: `from_ptrace_regs(to_ptrace_regs(ctx)) == ctx` for
//! every general-purpose, PC, SP, and flags register ptrace exposes.
//! Vector registers are out of contract and always zeroed.

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CpuContext {
    X86_64(X86_64Context),
    Aarch64(Aarch64Context),
    Unsupported,
}

impl Default for CpuContext {
    #[cfg(target_arch = "x86_64")]
    fn default() -> Self {
        CpuContext::X86_64(X86_64Context::default())
    }

    #[cfg(target_arch = "aarch64")]
    fn default() -> Self {
        CpuContext::Aarch64(Aarch64Context::default())
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn default() -> Self {
        CpuContext::Unsupported
    }
}

impl CpuContext {
    pub fn pc(&self) -> Option<u64> {
        match self {
            CpuContext::X86_64(c) => Some(c.rip),
            CpuContext::Aarch64(c) => Some(c.pc),
            CpuContext::Unsupported => None,
        }
    }

    pub fn set_pc(&mut self, value: u64) -> bool {
        match self {
            CpuContext::X86_64(c) => {
                c.rip = value;
                true
            }
            CpuContext::Aarch64(c) => {
                c.pc = value;
                true
            }
            CpuContext::Unsupported => false,
        }
    }

    pub fn sp(&self) -> Option<u64> {
        match self {
            CpuContext::X86_64(c) => Some(c.rsp),
            CpuContext::Aarch64(c) => Some(c.sp),
            CpuContext::Unsupported => None,
        }
    }
}

/// General-purpose registers for x86-64, laid out to match
/// `struct user_regs_struct` field order (the classic `PTRACE_GETREGS`
/// layout); `PTRACE_GETREGSET`/`NT_PRSTATUS` uses the same field set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct X86_64Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

impl X86_64Context {
    /// Builds a context from the raw bytes of a `PTRACE_GETREGS`/
    /// `PTRACE_GETREGSET` result, which is exactly `user_regs_struct`'s
    /// in-memory layout on this architecture.
    ///
    /// # Safety
    /// `bytes` must be at least `size_of::<X86_64Context>()` long and
    /// contain a live `user_regs_struct` as written by the kernel.
    pub unsafe fn from_raw(bytes: &[u8]) -> Self {
        core::ptr::read_unaligned(bytes.as_ptr() as *const Self)
    }

    pub fn to_raw(&self) -> [u8; core::mem::size_of::<Self>()] {
        let mut out = [0u8; core::mem::size_of::<Self>()];
        unsafe {
            core::ptr::write_unaligned(out.as_mut_ptr() as *mut Self, *self);
        }
        out
    }
}

/// General-purpose registers for aarch64, matching `struct user_pt_regs`
/// (30 general-purpose registers, link register folded into `regs[30]`,
/// plus `sp`, `pc`, `pstate`).
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct Aarch64Context {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

impl Default for Aarch64Context {
    fn default() -> Self {
        Aarch64Context {
            regs: [0; 31],
            sp: 0,
            pc: 0,
            pstate: 0,
        }
    }
}

impl Aarch64Context {
    /// # Safety
    /// `bytes` must be at least `size_of::<Aarch64Context>()` long and
    /// contain a live `user_pt_regs` as written by the kernel.
    pub unsafe fn from_raw(bytes: &[u8]) -> Self {
        core::ptr::read_unaligned(bytes.as_ptr() as *const Self)
    }

    pub fn to_raw(&self) -> [u8; core::mem::size_of::<Self>()] {
        let mut out = [0u8; core::mem::size_of::<Self>()];
        unsafe {
            core::ptr::write_unaligned(out.as_mut_ptr() as *mut Self, *self);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x86_64_round_trip_through_raw_bytes() {
        let mut ctx = X86_64Context::default();
        ctx.rip = 0x5555_0000_1000;
        ctx.rsp = 0x7fff_dead_beef;
        ctx.rax = 42;
        let raw = ctx.to_raw();
        let back = unsafe { X86_64Context::from_raw(&raw) };
        assert_eq!(ctx, back);
    }

    #[test]
    fn aarch64_round_trip_through_raw_bytes() {
        let mut ctx = Aarch64Context::default();
        ctx.pc = 0x4000_0000;
        ctx.sp = 0x7fff_0000;
        ctx.regs[0] = 7;
        let raw = ctx.to_raw();
        let back = unsafe { Aarch64Context::from_raw(&raw) };
        assert_eq!(ctx, back);
    }

    #[test]
    fn pc_and_sp_accessors_route_to_the_active_variant() {
        let mut ctx = CpuContext::X86_64(X86_64Context::default());
        assert!(ctx.set_pc(0x1234));
        assert_eq!(ctx.pc(), Some(0x1234));
        assert!(ctx.sp().is_some());
    }
}
