//! Thread context modification: the hardest module in the crate.
//! `modify_thread` runs a callback against any thread's CPU
//! context, suspended for the callback's duration — the calling thread's
//! own context via a direct save/restore, every other thread's via the
//! cross-thread ptrace helper in `helper_task`.

use std::sync::atomic::AtomicBool;

use crate::cpu_context::CpuContext;
use crate::error::Result;
use crate::helper_task;

/// Process-wide latch: once the regset ptrace API (`PTRACE_GETREGSET`)
/// is found unsupported, every later call goes straight to the classic
/// `PTRACE_GETREGS`/`PTRACE_SETREGS` pair. A one-way transition, so a
/// benign race on the first store just means two helper tasks both
/// discover the same fact independently.
pub(crate) static REGSET_SUPPORTED: AtomicBool = AtomicBool::new(true);

fn own_tid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Runs `callback` against `thread_id`'s CPU context with that thread
/// suspended for the duration. Returns `false` if the target could not be
/// suspended/read/written; the caller does not learn which step failed,
/// since the condition is transient and usually worth a retry rather
/// than a diagnosis.
pub fn modify_thread(thread_id: i32, callback: impl FnOnce(&mut CpuContext)) -> Result<bool> {
    if thread_id == own_tid() {
        return Ok(modify_current_thread(callback));
    }
    modify_other_thread(thread_id, callback)
}

/// Same-thread case: there is no ptrace path to oneself, so
/// the context is captured and restored through `ucontext(3)` instead.
/// `setcontext` never returns to its caller — the thread resumes at the
/// `getcontext` restore point exactly once, with `callback`'s edits to
/// the general-purpose/PC/SP/flags registers applied.
#[cfg(target_arch = "x86_64")]
#[inline(never)]
fn modify_current_thread(callback: impl FnOnce(&mut CpuContext)) -> bool {
    use crate::cpu_context::X86_64Context;
    use std::sync::atomic::{AtomicBool, Ordering};

    unsafe {
        let mut uc: libc::ucontext_t = core::mem::zeroed();
        // `getcontext` effectively returns twice: once here on capture,
        // and again — via the `setcontext` call below, which resumes
        // execution at this exact point rather than returning normally —
        // once the context is restored with the callback's edits
        // applied. `resumed` distinguishes the two; it has to be an
        // atomic rather than a plain local so the compiler can't prove
        // away the second read across a control-flow edge it never sees.
        let resumed = AtomicBool::new(false);
        if libc::getcontext(&mut uc) != 0 {
            return false;
        }
        if resumed.load(Ordering::SeqCst) {
            return true;
        }
        resumed.store(true, Ordering::SeqCst);

        let greg = |r: usize| uc.uc_mcontext.gregs[r] as u64;
        let mut ctx = CpuContext::X86_64(X86_64Context {
            r15: greg(libc::REG_R15 as usize),
            r14: greg(libc::REG_R14 as usize),
            r13: greg(libc::REG_R13 as usize),
            r12: greg(libc::REG_R12 as usize),
            rbp: greg(libc::REG_RBP as usize),
            rbx: greg(libc::REG_RBX as usize),
            r11: greg(libc::REG_R11 as usize),
            r10: greg(libc::REG_R10 as usize),
            r9: greg(libc::REG_R9 as usize),
            r8: greg(libc::REG_R8 as usize),
            rax: greg(libc::REG_RAX as usize),
            rcx: greg(libc::REG_RCX as usize),
            rdx: greg(libc::REG_RDX as usize),
            rsi: greg(libc::REG_RSI as usize),
            rdi: greg(libc::REG_RDI as usize),
            orig_rax: 0,
            rip: greg(libc::REG_RIP as usize),
            cs: greg(libc::REG_CSGSFS as usize) & 0xffff,
            eflags: greg(libc::REG_EFL as usize),
            rsp: greg(libc::REG_RSP as usize),
            ss: 0,
            fs_base: 0,
            gs_base: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
        });

        callback(&mut ctx);

        let CpuContext::X86_64(c) = ctx else {
            return false;
        };
        uc.uc_mcontext.gregs[libc::REG_R15 as usize] = c.r15 as i64;
        uc.uc_mcontext.gregs[libc::REG_R14 as usize] = c.r14 as i64;
        uc.uc_mcontext.gregs[libc::REG_R13 as usize] = c.r13 as i64;
        uc.uc_mcontext.gregs[libc::REG_R12 as usize] = c.r12 as i64;
        uc.uc_mcontext.gregs[libc::REG_RBP as usize] = c.rbp as i64;
        uc.uc_mcontext.gregs[libc::REG_RBX as usize] = c.rbx as i64;
        uc.uc_mcontext.gregs[libc::REG_R11 as usize] = c.r11 as i64;
        uc.uc_mcontext.gregs[libc::REG_R10 as usize] = c.r10 as i64;
        uc.uc_mcontext.gregs[libc::REG_R9 as usize] = c.r9 as i64;
        uc.uc_mcontext.gregs[libc::REG_R8 as usize] = c.r8 as i64;
        uc.uc_mcontext.gregs[libc::REG_RAX as usize] = c.rax as i64;
        uc.uc_mcontext.gregs[libc::REG_RCX as usize] = c.rcx as i64;
        uc.uc_mcontext.gregs[libc::REG_RDX as usize] = c.rdx as i64;
        uc.uc_mcontext.gregs[libc::REG_RSI as usize] = c.rsi as i64;
        uc.uc_mcontext.gregs[libc::REG_RDI as usize] = c.rdi as i64;
        uc.uc_mcontext.gregs[libc::REG_RIP as usize] = c.rip as i64;
        uc.uc_mcontext.gregs[libc::REG_EFL as usize] = c.eflags as i64;
        uc.uc_mcontext.gregs[libc::REG_RSP as usize] = c.rsp as i64;

        libc::setcontext(&uc);
        // Only reached if `setcontext` itself failed outright.
        false
    }
}

#[cfg(target_arch = "aarch64")]
#[inline(never)]
fn modify_current_thread(callback: impl FnOnce(&mut CpuContext)) -> bool {
    use crate::cpu_context::Aarch64Context;
    use std::sync::atomic::{AtomicBool, Ordering};

    unsafe {
        let mut uc: libc::ucontext_t = core::mem::zeroed();
        let resumed = AtomicBool::new(false);
        if libc::getcontext(&mut uc) != 0 {
            return false;
        }
        if resumed.load(Ordering::SeqCst) {
            return true;
        }
        resumed.store(true, Ordering::SeqCst);

        let mc = &uc.uc_mcontext;
        let mut ctx = CpuContext::Aarch64(Aarch64Context {
            regs: mc.regs,
            sp: mc.sp,
            pc: mc.pc,
            pstate: mc.pstate,
        });

        callback(&mut ctx);

        let CpuContext::Aarch64(c) = ctx else {
            return false;
        };
        uc.uc_mcontext.regs = c.regs;
        uc.uc_mcontext.sp = c.sp;
        uc.uc_mcontext.pc = c.pc;
        uc.uc_mcontext.pstate = c.pstate;

        libc::setcontext(&uc);
        false
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn modify_current_thread(_callback: impl FnOnce(&mut CpuContext)) -> bool {
    false
}

/// Cross-thread case, delegated to the helper task.
fn modify_other_thread(thread_id: i32, callback: impl FnOnce(&mut CpuContext)) -> Result<bool> {
    #[cfg(target_arch = "x86_64")]
    let mut raw = [0u8; core::mem::size_of::<crate::cpu_context::X86_64Context>()];
    #[cfg(target_arch = "aarch64")]
    let mut raw = [0u8; core::mem::size_of::<crate::cpu_context::Aarch64Context>()];
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    let mut raw: [u8; 0] = [];

    let success = helper_task::modify_via_helper(thread_id, &mut raw, |bytes| {
        let mut ctx = bytes_to_context(bytes);
        callback(&mut ctx);
        context_to_bytes(&ctx, bytes);
    })?;

    Ok(success)
}

#[cfg(target_arch = "x86_64")]
fn bytes_to_context(bytes: &[u8]) -> CpuContext {
    CpuContext::X86_64(unsafe { crate::cpu_context::X86_64Context::from_raw(bytes) })
}

#[cfg(target_arch = "x86_64")]
fn context_to_bytes(ctx: &CpuContext, out: &mut [u8]) {
    if let CpuContext::X86_64(c) = ctx {
        out.copy_from_slice(&c.to_raw());
    }
}

#[cfg(target_arch = "aarch64")]
fn bytes_to_context(bytes: &[u8]) -> CpuContext {
    CpuContext::Aarch64(unsafe { crate::cpu_context::Aarch64Context::from_raw(bytes) })
}

#[cfg(target_arch = "aarch64")]
fn context_to_bytes(ctx: &CpuContext, out: &mut [u8]) {
    if let CpuContext::Aarch64(c) = ctx {
        out.copy_from_slice(&c.to_raw());
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn bytes_to_context(_bytes: &[u8]) -> CpuContext {
    CpuContext::Unsupported
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn context_to_bytes(_ctx: &CpuContext, _out: &mut [u8]) {}

fn tgkill(tid: i32, sig: i32) -> bool {
    let pid = unsafe { libc::getpid() };
    unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, sig) == 0 }
}

/// Convenience wrapper: `SIGSTOP`s the target thread and waits for its
/// `/proc/self/task/<tid>/stat` state to report `T` (stopped), used
/// ahead of a `modify_thread` callback that doesn't need a full register
/// round-trip.
pub fn thread_suspend(tid: i32) -> bool {
    tgkill(tid, libc::SIGSTOP)
}

/// Resumes a thread previously suspended via `thread_suspend`.
pub fn thread_resume(tid: i32) -> bool {
    tgkill(tid, libc::SIGCONT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modify_current_thread_sees_its_own_registers() {
        let mut observed_pc = 0u64;
        let ok = modify_thread(own_tid(), |ctx| {
            observed_pc = ctx.pc().unwrap_or(0);
        })
        .expect("modify_thread on self");
        assert!(ok);
        assert_ne!(observed_pc, 0);
    }

    #[test]
    fn suspend_then_resume_round_trips_thread_state() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let running = Arc::new(AtomicBool::new(true));
        let running2 = running.clone();
        let handle = std::thread::spawn(move || {
            while running2.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        });
        let tid = {
            // There is no portable way to get another thread's tid before
            // it reports itself; give it a moment to start.
            std::thread::sleep(std::time::Duration::from_millis(10));
            crate::threads::enumerate_threads()
                .unwrap_or_default()
                .into_iter()
                .find(|t| t.id != own_tid())
                .map(|t| t.id)
        };

        if let Some(tid) = tid {
            assert!(thread_suspend(tid));
            std::thread::sleep(std::time::Duration::from_millis(10));
            let state = crate::threads::read_state(tid);
            assert!(state.is_ok());
            assert!(thread_resume(tid));
        }

        running.store(false, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
