//! Environment variable utilities
//!
//! ```ignore
//! use mbsafe_core::env::{env_get, env_get_bool};
//!
//! let max_conn: usize = env_get("MBS_MAX_CONNECTIONS", 5);
//! let debug = env_get_bool("MBS_DEBUG", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some(T)` if the variable is set and parses, `None` otherwise.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Millisecond duration, or `default` when unset or unparsable.
#[inline]
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__MBS_TEST_UNSET_VAR__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_opt_none() {
        let val: Option<usize> = env_get_opt("__MBS_TEST_UNSET_VAR__");
        assert!(val.is_none());
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__MBS_TEST_NUM__", " 123 ");
        let val: usize = env_get("__MBS_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__MBS_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        std::env::set_var("__MBS_TEST_BOOL__", "TRUE");
        assert!(env_get_bool("__MBS_TEST_BOOL__", false));

        std::env::set_var("__MBS_TEST_BOOL__", "on");
        assert!(env_get_bool("__MBS_TEST_BOOL__", false));

        std::env::set_var("__MBS_TEST_BOOL__", "garbage");
        assert!(!env_get_bool("__MBS_TEST_BOOL__", true));

        std::env::remove_var("__MBS_TEST_BOOL__");
        assert!(env_get_bool("__MBS_TEST_BOOL__", true));
    }

    #[test]
    fn test_env_get_millis() {
        std::env::set_var("__MBS_TEST_MS__", "250");
        assert_eq!(
            env_get_millis("__MBS_TEST_MS__", Duration::ZERO),
            Duration::from_millis(250)
        );
        std::env::set_var("__MBS_TEST_MS__", "soon");
        assert_eq!(
            env_get_millis("__MBS_TEST_MS__", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
        std::env::remove_var("__MBS_TEST_MS__");
    }
}
