//! Environment variable utilities
//!
//! Provides helpers for reading environment variables with defaults.

/// Get environment variable or return default value
pub fn env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get environment variable as Option
///
/// Returns `Some(value)` if set and non-empty, `None` otherwise.
pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Get environment variable as boolean
///
/// `true`, `1`, `yes`, `on` are true and `false`, `0`, `no`, `off` are false
/// (case-insensitive). Unset or anything else is `None`.
pub fn env_flag(key: &str) -> Option<bool> {
    let value = env_opt(key)?;
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Get environment variable as integer
///
/// Returns `Some(value)` if set and parseable, `None` otherwise.
pub fn env_int<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    env_opt(key)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_helpers() {
        std::env::set_var("BLLVM_HARNESS_TEST_INT", "42");
        std::env::set_var("BLLVM_HARNESS_TEST_FLAG", "Off");
        std::env::set_var("BLLVM_HARNESS_TEST_EMPTY", "");

        assert_eq!(env_int::<u64>("BLLVM_HARNESS_TEST_INT"), Some(42));
        assert_eq!(env_flag("BLLVM_HARNESS_TEST_FLAG"), Some(false));
        assert_eq!(env_opt("BLLVM_HARNESS_TEST_EMPTY"), None);
        assert_eq!(env_or_default("BLLVM_HARNESS_TEST_UNSET", "x"), "x");

        std::env::remove_var("BLLVM_HARNESS_TEST_INT");
        std::env::remove_var("BLLVM_HARNESS_TEST_FLAG");
        std::env::remove_var("BLLVM_HARNESS_TEST_EMPTY");
    }
}
