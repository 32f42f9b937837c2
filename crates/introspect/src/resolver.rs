//! Symbol and module resolution: turn a module name into a loaded handle,
//! and a `(module, symbol)` pair into an absolute address.

use std::ffi::CString;

use crate::modules::{enumerate_modules, ControlFlow};

/// Resolves `symbol_name` within `module_name`, or in the default global
/// scope when `module_name` is `None`. Returns `0` on failure — this
/// mirrors `dlsym`'s own C convention rather than an `Option`, since
/// `0` is never a valid loaded address.
pub fn module_find_export(module_name: Option<&str>, symbol_name: &str) -> u64 {
    let Ok(symbol) = CString::new(symbol_name) else {
        return 0;
    };

    match module_name {
        None => resolve_in_default_scope(&symbol),
        Some(name) => resolve_in_module(name, &symbol),
    }
}

fn resolve_in_default_scope(symbol: &std::ffi::CStr) -> u64 {
    unsafe {
        let addr = libc::dlsym(libc::RTLD_DEFAULT, symbol.as_ptr());
        addr as u64
    }
}

/// Acquires a non-loading handle on `module_name`: if the module is
/// already mapped, `dlopen(RTLD_LAZY | RTLD_NOLOAD)` returns a handle to
/// it without running its initializers or bumping reachable-but-unloaded
/// semantics. Falls back to a `dl_iterate_phdr`-based link-map walk when
/// `RTLD_NOLOAD` itself isn't supported (musl historically lacked it).
fn resolve_in_module(module_name: &str, symbol: &std::ffi::CStr) -> u64 {
    let Ok(path) = CString::new(module_name) else {
        return 0;
    };

    unsafe {
        let handle = libc::dlopen(path.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD);
        if !handle.is_null() {
            let addr = libc::dlsym(handle, symbol.as_ptr());
            libc::dlclose(handle);
            return addr as u64;
        }
    }

    resolve_via_link_map_walk(module_name, symbol)
}

/// Fallback for libcs without `RTLD_NOLOAD`: walk the already-loaded
/// module list via `dl_iterate_phdr`, match by path suffix (the caller
/// may pass a bare soname like `libc.so` against a full path), and
/// `dlopen` that exact path — which, since it's already mapped, merely
/// bumps a refcount rather than loading anything new.
fn resolve_via_link_map_walk(module_name: &str, symbol: &std::ffi::CStr) -> u64 {
    let mut matched_path: Option<String> = None;
    enumerate_modules(|m| {
        let path_str = m.path.to_string_lossy();
        if path_str.ends_with(module_name) {
            matched_path = Some(path_str.into_owned());
            ControlFlow::Stop
        } else {
            ControlFlow::Continue
        }
    });

    let Some(path_str) = matched_path else {
        return 0;
    };
    let Ok(path) = CString::new(path_str) else {
        return 0;
    };

    unsafe {
        let handle = libc::dlopen(path.as_ptr(), libc::RTLD_LAZY);
        if handle.is_null() {
            return 0;
        }
        let addr = libc::dlsym(handle, symbol.as_ptr());
        libc::dlclose(handle);
        addr as u64
    }
}

/// Forces constructor execution for a module that's already mapped but
/// whose initializers may not have run yet on runtimes that defer them
/// to `dlopen`. Takes and immediately drops an extra handle
/// reference via a real (loading, non-`RTLD_NOLOAD`) `dlopen`.
pub fn module_ensure_initialized(module_name: &str) -> bool {
    let Ok(path) = CString::new(module_name) else {
        return false;
    };
    unsafe {
        let handle = libc::dlopen(path.as_ptr(), libc::RTLD_LAZY);
        if handle.is_null() {
            return false;
        }
        libc::dlclose(handle);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scope_resolves_a_known_libc_symbol() {
        let addr = module_find_export(None, "malloc");
        assert_ne!(addr, 0);
    }

    #[test]
    fn unknown_symbol_resolves_to_zero() {
        let addr = module_find_export(None, "definitely_not_a_real_symbol_zzz");
        assert_eq!(addr, 0);
    }

    #[test]
    fn ensure_initialized_succeeds_for_libc() {
        assert!(module_ensure_initialized("libc.so.6"));
    }
}
