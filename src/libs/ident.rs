//! Identifier minting and monotonic time.
//!
//! Entity ids have the shape `<domain>_<12 base36 chars>`, e.g.
//! `task_4h7k2m9x1q0z`. The 12-character suffix is drawn from a v4 UUID,
//! which keeps the collision probability negligible within a process.
//! Timestamps are milliseconds since epoch and never move backwards within
//! a process: a non-monotonic clock reading is clamped to `previous + 1`.

use parking_lot::Mutex;
use uuid::Uuid;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 12;

/// Mints prefixed entity identifiers.
#[derive(Debug, Default, Clone)]
pub struct IdGenerator;

impl IdGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Returns `<domain>_<12 base36 chars>`.
    pub fn mint(&self, domain: &str) -> String {
        let mut n = Uuid::new_v4().as_u128();
        let mut suffix = [0u8; SUFFIX_LEN];
        for slot in suffix.iter_mut().rev() {
            *slot = BASE36[(n % 36) as usize];
            n /= 36;
        }
        // suffix bytes are always ASCII from the alphabet above
        format!("{}_{}", domain, std::str::from_utf8(&suffix).unwrap_or("000000000000"))
    }
}

/// Process-wide monotonic millisecond clock.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<i64>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { last: Mutex::new(0) }
    }

    /// Current time in milliseconds since epoch, clamped so that two
    /// consecutive calls never return the same or a smaller value.
    pub fn now_ms(&self) -> i64 {
        let mut last = self.last.lock();
        let now = chrono::Utc::now().timestamp_millis();
        let ts = if now <= *last { *last + 1 } else { now };
        *last = ts;
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_shape() {
        let ids = IdGenerator::new();
        let id = ids.mint("task");
        assert!(id.starts_with("task_"));
        assert_eq!(id.len(), "task_".len() + SUFFIX_LEN);
        assert!(id[5..].bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    }

    #[test]
    fn mint_unique() {
        let ids = IdGenerator::new();
        let a = ids.mint("task");
        let b = ids.mint("task");
        assert_ne!(a, b);
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let mut prev = 0;
        for _ in 0..1000 {
            let ts = clock.now_ms();
            assert!(ts > prev);
            prev = ts;
        }
    }
}
