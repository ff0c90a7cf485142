//! Wall-clock helpers
//!
//! Registry and wire timestamps are Unix milliseconds.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Now, in Unix milliseconds. A clock before the epoch reads as 0.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since_epoch| since_epoch.as_millis() as u64)
}

/// The timestamp `window` ago; anything last active before it has expired
pub fn cutoff_millis(window: Duration) -> u64 {
    let window = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
    current_time_millis().saturating_sub(window)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_moves_forward() {
        let before = current_time_millis();
        std::thread::sleep(Duration::from_millis(5));
        assert!(current_time_millis() >= before + 5);
    }

    #[test]
    fn test_cutoff_lies_in_the_past() {
        let cutoff = cutoff_millis(Duration::from_secs(30 * 60));
        assert!(current_time_millis() - cutoff >= 30 * 60 * 1000);
    }

    #[test]
    fn test_huge_window_saturates() {
        assert_eq!(cutoff_millis(Duration::MAX), 0);
    }
}
