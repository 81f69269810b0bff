//! Small crate-internal helpers.

/// Return an error if the condition does not hold.
macro_rules! require {
    ($cond:expr, $err:expr) => {
        if !($cond) {
            return Err($err);
        }
    };
}
pub(crate) use require;

/// Milliseconds since the unix epoch.
pub(crate) fn current_time_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Microseconds since the unix epoch.
pub(crate) fn current_time_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Nanoseconds since the unix epoch. Saturates far in the future rather than panicking.
pub(crate) fn current_time_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}
