//! The cross-thread ptrace helper: a sibling task, cloned with `CLONE_VM`
//! but deliberately WITHOUT `CLONE_THREAD`, that attaches to the real
//! target on the caller's behalf and reads/writes its registers.
//!
//! Everything the child runs between `raw_clone` and `raw_exit` must avoid
//! the C library entirely — it has no valid thread-local storage, so any
//! libc call that touches errno or a thread-local (which is most of them)
//! is undefined behavior here. The child only ever calls into
//! `raw_syscall` and reads/writes the process-wide statics it shares with
//! the parent through `CLONE_VM`.

use std::os::raw::c_void;
use std::sync::atomic::Ordering;

use crate::raw_syscall::{self, CloneEntry};
use crate::thread_modifier::REGSET_SUPPORTED;

const PTRACE_ATTACH: i64 = 16;
const PTRACE_DETACH: i64 = 17;
const PTRACE_GETREGS: i64 = 12;
const PTRACE_SETREGS: i64 = 13;
const PTRACE_GETREGSET: i64 = 0x4204;
const PTRACE_SETREGSET: i64 = 0x4205;
const NT_PRSTATUS: usize = 1;

const SIGCONT: usize = 18;
const EPERM: i64 = -1;
const ESRCH: i64 = -3;

/// `wait4`'s bit for reaping a task that isn't a traditional forked child —
/// exactly the relationship between this process and the helper it clones
/// with `CLONE_VM` and no exit signal. Without it, `wait4` returns
/// `-ECHILD` and the helper is never reaped.
const __WCLONE: i32 = 0x8000_0000u32 as i32;

/// One-byte acknowledgements exchanged over the socketpair. Values above
/// `READY` but below 100 are success states in the handshake; values ≥100
/// are a distinct failure per step, so the parent can tell (for logging)
/// which stage failed without ever having to act differently on it (the
/// contract is still a plain bool to the caller).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ready = 1,
    ReadContext = 2,
    ModifiedContext = 3,
    WroteContext = 4,
    AttachFailed = 100,
    WaitFailed = 101,
    StopUnexpected = 102,
    ReadRegsFailed = 103,
    WriteRegsFailed = 104,
}

impl Ack {
    fn from_byte(b: u8) -> Option<Ack> {
        match b {
            1 => Some(Ack::Ready),
            2 => Some(Ack::ReadContext),
            3 => Some(Ack::ModifiedContext),
            4 => Some(Ack::WroteContext),
            100 => Some(Ack::AttachFailed),
            101 => Some(Ack::WaitFailed),
            102 => Some(Ack::StopUnexpected),
            103 => Some(Ack::ReadRegsFailed),
            104 => Some(Ack::WriteRegsFailed),
            _ => None,
        }
    }
}

fn send_ack(fd: i32, ack: Ack) {
    let byte = [ack as u8];
    let _ = raw_syscall::raw_write(fd, &byte);
}

fn recv_ack(fd: i32) -> Option<Ack> {
    let mut byte = [0u8; 1];
    let n = raw_syscall::raw_read(fd, &mut byte);
    if n != 1 {
        return None;
    }
    Ack::from_byte(byte[0])
}

#[repr(C)]
struct HelperArgs {
    target_tid: i32,
    sock_fd: i32,
    ctx_ptr: *mut u8,
    ctx_len: usize,
}

/// Child-task entry point, run on the private stack set up by `raw_clone`.
/// Runs the child's half of the handshake in order: wait for `READY`,
/// attach, wait for the stop, read registers into the shared buffer,
/// report `READ_CONTEXT`, wait for `MODIFIED_CONTEXT`, write registers
/// back, detach, report `WROTE_CONTEXT`.
extern "C" fn child_entry(arg: *mut c_void) -> i32 {
    let args = unsafe { &*(arg as *const HelperArgs) };
    let fd = args.sock_fd;

    match recv_ack(fd) {
        Some(Ack::Ready) => {}
        _ => return 1,
    }

    let attach = unsafe { raw_syscall::raw_ptrace(PTRACE_ATTACH, args.target_tid, 0, 0) };
    if attach < 0 {
        send_ack(fd, Ack::AttachFailed);
        return 1;
    }

    let mut status: i32 = 0;
    let waited = raw_syscall::raw_wait4(args.target_tid, &mut status, __WCLONE);
    if waited < 0 {
        send_ack(fd, Ack::WaitFailed);
        best_effort_detach(args.target_tid);
        return 1;
    }
    if !wifstopped(status) {
        send_ack(fd, Ack::StopUnexpected);
        best_effort_detach(args.target_tid);
        return 1;
    }

    if !read_regs(args.target_tid, args.ctx_ptr, args.ctx_len) {
        send_ack(fd, Ack::ReadRegsFailed);
        best_effort_detach(args.target_tid);
        return 1;
    }

    send_ack(fd, Ack::ReadContext);

    match recv_ack(fd) {
        Some(Ack::ModifiedContext) => {}
        _ => {
            best_effort_detach(args.target_tid);
            return 1;
        }
    }

    if !write_regs(args.target_tid, args.ctx_ptr, args.ctx_len) {
        send_ack(fd, Ack::WriteRegsFailed);
        best_effort_detach(args.target_tid);
        return 1;
    }

    let detached = unsafe { raw_syscall::raw_ptrace(PTRACE_DETACH, args.target_tid, 0, SIGCONT) };
    if detached < 0 {
        // Registers are already written; report success anyway per step 5 —
        // the target is left stopped, which is recoverable, versus silently
        // discarding a modification that did take effect.
    }

    send_ack(fd, Ack::WroteContext);
    0
}

fn wifstopped(status: i32) -> bool {
    (status & 0x7f) == 0x7f
}

fn best_effort_detach(target_tid: i32) {
    unsafe {
        raw_syscall::raw_ptrace(PTRACE_DETACH, target_tid, 0, 0);
    }
}

#[repr(C)]
struct Iovec {
    base: *mut u8,
    len: usize,
}

/// Reads the target's registers into `ctx_ptr..ctx_ptr+ctx_len`, preferring
/// `PTRACE_GETREGSET`/`NT_PRSTATUS` and falling back to `PTRACE_GETREGS`
/// after the first failure that isn't `EPERM`/`ESRCH` (memoized process-wide
/// since a kernel either supports the regset API or it doesn't — there's no
/// point re-probing per call).
fn read_regs(tid: i32, ctx_ptr: *mut u8, ctx_len: usize) -> bool {
    if REGSET_SUPPORTED.load(Ordering::Relaxed) {
        let mut iov = Iovec { base: ctx_ptr, len: ctx_len };
        let ret = unsafe {
            raw_syscall::raw_ptrace(PTRACE_GETREGSET, tid, NT_PRSTATUS, &mut iov as *mut _ as usize)
        };
        if ret >= 0 {
            return true;
        }
        if ret != EPERM && ret != ESRCH {
            REGSET_SUPPORTED.store(false, Ordering::Relaxed);
        } else {
            return false;
        }
    }
    let ret = unsafe { raw_syscall::raw_ptrace(PTRACE_GETREGS, tid, 0, ctx_ptr as usize) };
    ret >= 0
}

/// Writes the target's registers back from `ctx_ptr..ctx_ptr+ctx_len`,
/// mirroring whichever API `read_regs` used (the latch doesn't flip
/// between the two halves of one `modify_thread` call).
fn write_regs(tid: i32, ctx_ptr: *mut u8, ctx_len: usize) -> bool {
    if REGSET_SUPPORTED.load(Ordering::Relaxed) {
        let mut iov = Iovec { base: ctx_ptr, len: ctx_len };
        let ret = unsafe {
            raw_syscall::raw_ptrace(PTRACE_SETREGSET, tid, NT_PRSTATUS, &mut iov as *mut _ as usize)
        };
        return ret >= 0;
    }
    let ret = unsafe { raw_syscall::raw_ptrace(PTRACE_SETREGS, tid, 0, ctx_ptr as usize) };
    ret >= 0
}

const STACK_SIZE: usize = 64 * 1024;
const CLONE_VM: i32 = 0x100;
#[cfg(target_arch = "aarch64")]
const CLONE_SETTLS: i32 = 0x80000;

/// Runs the full cross-thread protocol: allocates the helper's stack and
/// TLS pages, clones the sibling task, drives the acknowledgement
/// handshake with `apply` invoked between `READ_CONTEXT`
/// and `MODIFIED_CONTEXT`, then reaps the helper and frees its pages.
///
/// Returns `Ok(true)` iff every ack in the handshake matched the expected
/// sequence (i.e. the target's context was actually read and rewritten).
/// Any other ack — or a syscall failure on the parent's side — yields
/// `Ok(false)`: the target is reported unmodifiable rather than surfacing
/// which specific step failed.
pub fn modify_via_helper(
    target_tid: i32,
    ctx_bytes: &mut [u8],
    apply: impl FnOnce(&mut [u8]),
) -> crate::error::Result<bool> {
    use crate::error::Error;

    let _dumpable = crate::dumpable::DumpableGuard::acquire();

    let stack = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if stack == libc::MAP_FAILED {
        return Err(Error::Failed { errno: unsafe { *libc::__errno_location() }, context: "helper: stack mmap failed".into() });
    }
    let tls = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            4096,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if tls == libc::MAP_FAILED {
        unsafe { libc::munmap(stack, STACK_SIZE) };
        return Err(Error::Failed { errno: unsafe { *libc::__errno_location() }, context: "helper: tls mmap failed".into() });
    }

    let mut fds = [0i32; 2];
    if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) } != 0 {
        unsafe {
            libc::munmap(stack, STACK_SIZE);
            libc::munmap(tls, 4096);
        }
        return Err(Error::Failed { errno: unsafe { *libc::__errno_location() }, context: "helper: socketpair failed".into() });
    }
    let (parent_fd, child_fd) = (fds[0], fds[1]);

    let mut args = HelperArgs {
        target_tid,
        sock_fd: child_fd,
        ctx_ptr: ctx_bytes.as_mut_ptr(),
        ctx_len: ctx_bytes.len(),
    };

    let stack_top = unsafe { (stack as *mut u8).add(STACK_SIZE) };

    #[cfg(target_arch = "aarch64")]
    let flags = CLONE_VM | CLONE_SETTLS;
    #[cfg(not(target_arch = "aarch64"))]
    let flags = CLONE_VM;

    let entry: CloneEntry = child_entry;
    let child_pid = unsafe {
        raw_syscall::raw_clone(flags, stack_top, tls as *mut u8, entry, &mut args as *mut _ as *mut c_void)
    };

    let cleanup = |child_pid: Option<i32>| unsafe {
        if let Some(pid) = child_pid {
            let mut status = 0;
            raw_syscall::raw_wait4(pid, &mut status, __WCLONE);
        }
        libc::close(parent_fd);
        libc::close(child_fd);
        libc::munmap(stack, STACK_SIZE);
        libc::munmap(tls, 4096);
    };

    if child_pid < 0 {
        cleanup(None);
        return Err(Error::Failed { errno: -(child_pid as i32), context: "helper: clone failed".into() });
    }
    let child_pid = child_pid as i32;

    // The child attaches to `target_tid`, which is not its real parent;
    // without this, the kernel refuses the attach outside same-UID debug
    // policy exemptions.
    unsafe {
        libc::prctl(libc::PR_SET_PTRACER, child_pid as libc::c_ulong, 0, 0, 0);
    }

    send_ack(parent_fd, Ack::Ready);

    let first = recv_ack(parent_fd);
    let success = if first == Some(Ack::ReadContext) {
        apply(ctx_bytes);
        send_ack(parent_fd, Ack::ModifiedContext);
        recv_ack(parent_fd) == Some(Ack::WroteContext)
    } else {
        false
    };

    cleanup(Some(child_pid));
    Ok(success)
}
