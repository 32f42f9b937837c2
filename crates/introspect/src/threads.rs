//! Thread enumeration: list `/proc/self/task`, read each thread's name and
//! state, and combine them into `ThreadDescriptor`s.

use std::fs;

use crate::cpu_context::CpuContext;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Waiting,
    Stopped,
    /// Covers both uninterruptible disk sleep (`D`) and zombie (`Z`).
    ///
    /// The source this behavior is carried from reports both under one
    /// label; whether that's intentional or an old bug is unclear, but the
    /// observed behavior is preserved rather than "corrected" here.
    Uninterruptible,
    Halted,
    Unknown(char),
}

impl ThreadState {
    fn from_stat_char(c: char) -> Self {
        match c {
            'R' => ThreadState::Running,
            'S' => ThreadState::Waiting,
            'T' | 't' => ThreadState::Stopped,
            'D' | 'Z' => ThreadState::Uninterruptible,
            'X' | 'x' => ThreadState::Halted,
            other => ThreadState::Unknown(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThreadDescriptor {
    pub id: i32,
    pub name: String,
    pub state: ThreadState,
    pub cpu_context: CpuContext,
}

/// Lists the threads of the current process as of the moment
/// `/proc/self/task` is read — a snapshot; threads created during
/// enumeration may or may not appear.
pub fn enumerate_threads() -> Result<Vec<ThreadDescriptor>> {
    let entries = fs::read_dir("/proc/self/task")?;
    let mut threads = Vec::new();

    for entry in entries {
        let entry = entry?;
        let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };

        // A task can exit between the readdir listing and our per-thread
        // reads; skip it rather than fail the whole enumeration.
        let name = match read_comm(tid) {
            Ok(n) => n,
            Err(_) => continue,
        };
        let state = match read_state(tid) {
            Ok(s) => s,
            Err(_) => continue,
        };

        threads.push(ThreadDescriptor {
            id: tid,
            name,
            state,
            cpu_context: CpuContext::default(),
        });
    }

    Ok(threads)
}

/// Reads `/proc/self/task/<tid>/comm`, stripping the trailing newline.
pub fn read_comm(tid: i32) -> Result<String> {
    let raw = fs::read_to_string(format!("/proc/self/task/{tid}/comm"))?;
    Ok(raw.trim_end_matches('\n').to_string())
}

/// Reads `/proc/self/task/<tid>/stat` and extracts the single state
/// character, which is the first character past the last `)` — the comm
/// field itself may contain spaces or parentheses, so splitting on the
/// first whitespace-delimited field is unsafe.
pub fn read_state(tid: i32) -> Result<ThreadState> {
    let raw = fs::read_to_string(format!("/proc/self/task/{tid}/stat"))?;
    let after_comm = raw.rfind(')').ok_or_else(|| Error::Failed {
        errno: 0,
        context: format!("task {tid} stat: no ')' found"),
    })?;
    let rest = raw[after_comm + 1..].trim_start();
    let state_char = rest.chars().next().ok_or_else(|| Error::Failed {
        errno: 0,
        context: format!("task {tid} stat: missing state field"),
    })?;
    Ok(ThreadState::from_stat_char(state_char))
}

/// Scans `/proc/self/status` for `TracerPid:` to detect an attached
/// debugger. Returns the tracer's pid, or `None` if untraced.
pub fn tracer_pid() -> Result<Option<i32>> {
    let raw = fs::read_to_string("/proc/self/status")?;
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("TracerPid:") {
            let pid: i32 = rest.trim().parse().unwrap_or(0);
            return Ok(if pid == 0 { None } else { Some(pid) });
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_threads_includes_the_calling_thread() {
        let threads = enumerate_threads().expect("enumerate /proc/self/task");
        assert!(!threads.is_empty());
    }

    #[test]
    fn self_state_is_running_or_waiting() {
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
        let state = read_state(tid).expect("read own state");
        assert!(matches!(state, ThreadState::Running | ThreadState::Waiting));
    }

    #[test]
    fn tracer_pid_reads_without_error() {
        let _ = tracer_pid().expect("read /proc/self/status");
    }
}
