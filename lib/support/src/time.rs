use chrono::{DateTime, TimeZone, Utc};

/// Current wall clock as milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Smallest value a millisecond epoch clock can plausibly hold. Anything
/// below this fits a seconds clock and must not be trusted as milliseconds.
pub const MIN_PLAUSIBLE_MS: i64 = 10_000_000_000;

pub fn is_plausible_ms(ts: i64) -> bool {
    ts >= MIN_PLAUSIBLE_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_a_millisecond_clock() {
        assert!(is_plausible_ms(now_ms()));
    }

    #[test]
    fn seconds_clock_is_not_plausible() {
        // 2026-01-01 as seconds
        assert!(!is_plausible_ms(1_767_225_600));
    }

    #[test]
    fn ms_roundtrip() {
        let ms = 1_700_000_000_123;
        assert_eq!(from_ms(ms).timestamp_millis(), ms);
    }
}
