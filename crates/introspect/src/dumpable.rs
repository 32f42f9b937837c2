//! Process-wide dumpability toggle. Android release builds
//! default `PR_GET_DUMPABLE` to 0, which blocks same-UID ptrace and
//! occasionally blocks `/proc/self/auxv` reads; every ptrace attach and
//! every auxv read in this crate acquires this guard first.

use std::sync::Mutex;

use once_cell::sync::Lazy;

struct State {
    count: u32,
    saved: i32,
}

static STATE: Lazy<Mutex<State>> = Lazy::new(|| {
    Mutex::new(State {
        count: 0,
        saved: 1,
    })
});

/// RAII scope: while any `DumpableGuard` is alive, `PR_GET_DUMPABLE`
/// reads 1. Nested acquires increment a refcount; only the 0→1 transition
/// touches the real flag, and only the matching N→0 release restores it.
#[must_use]
pub struct DumpableGuard {
    _private: (),
}

impl DumpableGuard {
    pub fn acquire() -> Self {
        let mut st = STATE.lock().unwrap();
        if st.count == 0 {
            let current = unsafe { libc::prctl(libc::PR_GET_DUMPABLE) };
            st.saved = current;
            if current != 1 {
                log::debug!("dumpable: forcing PR_SET_DUMPABLE=1 (was {current})");
                unsafe {
                    libc::prctl(libc::PR_SET_DUMPABLE, 1);
                }
            }
        }
        st.count += 1;
        DumpableGuard { _private: () }
    }
}

impl Drop for DumpableGuard {
    fn drop(&mut self) {
        let mut st = STATE.lock().unwrap();
        st.count = st.count.saturating_sub(1);
        if st.count == 0 && st.saved != 1 {
            log::debug!("dumpable: restoring PR_SET_DUMPABLE={}", st.saved);
            unsafe {
                libc::prctl(libc::PR_SET_DUMPABLE, st.saved);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Serializes tests that touch the process-global dumpable flag so
    // they don't interleave with each other under a parallel test runner.
    static TEST_LOCK: StdMutex<()> = StdMutex::new(());

    #[test]
    fn nested_acquire_release_restores_original_value() {
        let _serial = TEST_LOCK.lock().unwrap();
        let before = unsafe { libc::prctl(libc::PR_GET_DUMPABLE) };
        {
            let _g1 = DumpableGuard::acquire();
            {
                let _g2 = DumpableGuard::acquire();
                {
                    let _g3 = DumpableGuard::acquire();
                    assert_eq!(unsafe { libc::prctl(libc::PR_GET_DUMPABLE) }, 1);
                }
                assert_eq!(unsafe { libc::prctl(libc::PR_GET_DUMPABLE) }, 1);
            }
        }
        let after = unsafe { libc::prctl(libc::PR_GET_DUMPABLE) };
        assert_eq!(before, after);
    }
}
