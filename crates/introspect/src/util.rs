//! Small shared helpers that don't belong to any one component.

use once_cell::sync::OnceCell;

static PAGE_SIZE: OnceCell<u64> = OnceCell::new();

/// The system page size, queried once and cached.
pub fn page_size() -> u64 {
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        let p = page_size();
        assert!(p >= 4096);
        assert_eq!(p & (p - 1), 0);
    }
}
