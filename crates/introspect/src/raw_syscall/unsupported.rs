//! Fallback for architectures this crate has no hand-written syscall
//! trampoline for. Every entry point reports `ENOSYS` rather than failing
//! to build, so the rest of the crate (which is not all arch-specific)
//! still compiles; callers see it the same way they'd see any other
//! kernel-reported failure.

use core::ffi::c_void;

const ENOSYS: i64 = -38;

pub type CloneEntry = extern "C" fn(*mut c_void) -> i32;

pub unsafe fn sys_read(_fd: i32, _buf: *mut u8, _len: usize) -> i64 {
    ENOSYS
}

pub unsafe fn sys_write(_fd: i32, _buf: *const u8, _len: usize) -> i64 {
    ENOSYS
}

pub unsafe fn sys_wait4(_pid: i32, _status: *mut i32, _options: i32, _rusage: *mut c_void) -> i64 {
    ENOSYS
}

pub unsafe fn sys_ptrace(_request: i64, _pid: i32, _addr: usize, _data: usize) -> i64 {
    ENOSYS
}

pub unsafe fn sys_exit(_code: i32) -> ! {
    // There is no syscall trampoline on this architecture; abort is the
    // closest available primitive without one.
    std::process::abort()
}

pub unsafe fn sys_clone(
    _flags: i32,
    _child_stack_top: *mut u8,
    _tls: *mut u8,
    _entry: CloneEntry,
    _arg: *mut c_void,
) -> i64 {
    ENOSYS
}
