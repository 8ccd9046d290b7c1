use std::time::SystemTime;

/// Milliseconds elapsed since the unix epoch. Round-trip measurements and
/// check deadlines are tracked at this resolution.
#[inline]
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("System clock is set before the unix epoch")
        .as_millis() as u64
}

/// Whole seconds elapsed since the unix epoch.
#[inline]
pub fn timestamp_secs() -> u64 {
    timestamp_millis() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_secs_agree() {
        let millis = timestamp_millis();
        let secs = timestamp_secs();

        assert!(millis / 1000 >= secs - 1);
        assert!(millis / 1000 <= secs + 1);
    }

    #[test]
    fn test_timestamps_are_sane() {
        // 2020-01-01 in unix seconds; anything earlier means the clock
        // source is broken.
        assert!(timestamp_secs() > 1_577_836_800);
    }
}
