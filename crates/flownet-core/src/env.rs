//! Environment variable helpers
//!
//! Typed lookups with defaults, used by `NetConfig::from_env` and the
//! logging setup.
//!
//! ```ignore
//! use flownet_core::env::{env_get, env_get_size};
//!
//! let max: usize = env_get("FLOW_MAX_RESOURCES", 4096);
//! let stack = env_get_size("FLOW_POLLER_STACK_SIZE", 128 * 1024); // accepts "128k"
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, falling back to `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// `Some(T)` if `key` is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean lookup. "1", "true", "yes", "on" (any case) are true; any other
/// value is false; unset yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Byte size with an optional `k`/`m` suffix (binary units).
pub fn env_get_size(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_size(&v))
        .unwrap_or(default)
}

/// Parse "4096", "128k", "2M" into bytes.
pub fn parse_size(raw: &str) -> Option<usize> {
    let s = raw.trim().to_lowercase();
    let (digits, mult) = if let Some(d) = s.strip_suffix('k') {
        (d, 1024)
    } else if let Some(d) = s.strip_suffix('m') {
        (d, 1024 * 1024)
    } else {
        (s.as_str(), 1)
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(mult)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__FLOW_TEST_UNSET_A__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_opt_none() {
        let val: Option<u64> = env_get_opt("__FLOW_TEST_UNSET_B__");
        assert!(val.is_none());
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__FLOW_TEST_NUM__", " 123 ");
        let val: usize = env_get("__FLOW_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__FLOW_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse_falls_back() {
        std::env::set_var("__FLOW_TEST_BAD__", "many");
        let val: usize = env_get("__FLOW_TEST_BAD__", 7);
        assert_eq!(val, 7);
        std::env::remove_var("__FLOW_TEST_BAD__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for yes in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var("__FLOW_TEST_BOOL__", yes);
            assert!(env_get_bool("__FLOW_TEST_BOOL__", false), "{}", yes);
        }
        for no in ["0", "false", "garbage"] {
            std::env::set_var("__FLOW_TEST_BOOL__", no);
            assert!(!env_get_bool("__FLOW_TEST_BOOL__", true), "{}", no);
        }
        std::env::remove_var("__FLOW_TEST_BOOL__");
        assert!(env_get_bool("__FLOW_TEST_BOOL__", true));
    }

    #[test]
    fn test_env_get_str_default() {
        assert_eq!(env_get_str("__FLOW_TEST_UNSET_C__", "flow"), "flow");
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("128k"), Some(128 * 1024));
        assert_eq!(parse_size("2M"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("k"), None);
        assert_eq!(parse_size("-1"), None);
    }

    #[test]
    fn test_env_get_size() {
        std::env::set_var("__FLOW_TEST_SIZE__", "64k");
        assert_eq!(env_get_size("__FLOW_TEST_SIZE__", 1), 64 * 1024);
        std::env::remove_var("__FLOW_TEST_SIZE__");
        assert_eq!(env_get_size("__FLOW_TEST_SIZE__", 1), 1);
    }
}
