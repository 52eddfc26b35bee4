//! Time utilities
//!
//! Provides safe time operations that handle errors gracefully.

use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Get current Unix timestamp (seconds since epoch)
///
/// Returns 0 if system time is before epoch.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| {
            warn!("System time is before UNIX epoch, using 0 as timestamp");
            std::time::Duration::from_secs(0)
        })
        .as_secs()
}

/// Current time as a block header timestamp
///
/// Saturates instead of wrapping after 2106.
pub fn current_block_time() -> u32 {
    u32::try_from(current_timestamp()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_time_is_recent() {
        // 2020-01-01
        assert!(current_block_time() > 1_577_836_800);
        assert_eq!(current_block_time() as u64 / 60, current_timestamp() / 60);
    }
}
