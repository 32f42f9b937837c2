//! Direct kernel entry points that never touch the C library's per-thread
//! state (errno, `pthread_self`, etc). Everything in this module is safe to
//! call from the helper task spawned by `thread_modifier`, which has no
//! valid thread-local storage of its own until it explicitly sets one up.
//!
//! Every function returns the raw kernel return value: non-negative on
//! success, `-errno` on failure. Callers that want an `Error` should use
//! `Error::from_kernel_ret`.

#[cfg_attr(target_arch = "x86_64", path = "x86_64.rs")]
#[cfg_attr(target_arch = "aarch64", path = "aarch64.rs")]
#[cfg_attr(target_arch = "x86", path = "x86.rs")]
#[cfg_attr(
    not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "x86")),
    path = "unsupported.rs"
)]
mod arch;

pub use arch::CloneEntry;

const ENOSYS: i64 = -38;
const EINTR: i64 = -4;

/// Re-issues a read/write syscall while it keeps failing with `-EINTR`.
///
/// This is the one retry policy applied automatically; every other
/// negative return is handed straight back to the caller.
macro_rules! retry_eintr {
    ($e:expr) => {{
        loop {
            let ret = $e;
            if ret != EINTR {
                break ret;
            }
        }
    }};
}

/// `read(2)`.
pub fn raw_read(fd: i32, buf: &mut [u8]) -> i64 {
    retry_eintr!(unsafe { arch::sys_read(fd, buf.as_mut_ptr(), buf.len()) })
}

/// `write(2)`.
pub fn raw_write(fd: i32, buf: &[u8]) -> i64 {
    retry_eintr!(unsafe { arch::sys_write(fd, buf.as_ptr(), buf.len()) })
}

/// `wait4(2)` (what `waitpid` is implemented in terms of on Linux).
///
/// `options` is the usual `WUNTRACED`/`__WALL`/etc bitmask; `rusage` is
/// always passed as `NULL` since nothing here needs it.
pub fn raw_wait4(pid: i32, status: &mut i32, options: i32) -> i64 {
    unsafe { arch::sys_wait4(pid, status as *mut i32, options, core::ptr::null_mut()) }
}

/// `ptrace(2)`. `addr`/`data` are passed through untyped; callers cast as
/// appropriate for the request (pointer for `GETREGSET`'s `iovec`, integer
/// for `data` on `PTRACE_CONT`/`PTRACE_DETACH`'s signal number, etc).
///
/// # Safety
/// `addr` and `data` must be valid for whatever `request` interprets them
/// as; this is a direct, untyped passthrough to the kernel.
pub unsafe fn raw_ptrace(request: i64, pid: i32, addr: usize, data: usize) -> i64 {
    arch::sys_ptrace(request, pid, addr, data)
}

/// `clone(2)` without `CLONE_THREAD`, entering `entry(arg)` on a private
/// stack in the child and invoking `exit(2)` directly on return — the
/// child branch never falls back through any library epilogue.
///
/// # Safety
/// `child_stack_top` must point one-past-the-end of a writable region at
/// least large enough for `entry`'s needs plus two machine words of
/// bookkeeping that this function reserves for itself. `entry` must not
/// unwind (it runs with no landing pads set up) and must not return except
/// via its own return value, which becomes the child's exit code.
pub unsafe fn raw_clone(
    flags: i32,
    child_stack_top: *mut u8,
    tls: *mut u8,
    entry: CloneEntry,
    arg: *mut core::ffi::c_void,
) -> i64 {
    arch::sys_clone(flags, child_stack_top, tls, entry, arg)
}

/// `exit(2)` — used by the helper task; never returns.
pub fn raw_exit(code: i32) -> ! {
    unsafe { arch::sys_exit(code) }
}

/// `arch_prctl(2)` with `ARCH_SET_FS` — x86-64 only. Other architectures
/// return `ENOSYS` since they set their thread pointer through the clone
/// TLS argument instead.
pub fn raw_arch_set_fs(tls: *mut u8) -> i64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { arch::sys_arch_prctl_set_fs(tls) }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = tls;
        ENOSYS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip_via_pipe() {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let msg = b"hello from raw_syscall";
        let wrote = raw_write(fds[1], msg);
        assert_eq!(wrote, msg.len() as i64);
        let mut buf = [0u8; 64];
        let read = raw_read(fds[0], &mut buf);
        assert_eq!(read, msg.len() as i64);
        assert_eq!(&buf[..read as usize], msg);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
