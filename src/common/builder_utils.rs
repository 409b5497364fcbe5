use std::time::Duration;

use super::error::ConfigError;

const YEAR_SECONDS: u64 = 365 * 24 * 3600;

pub(crate) fn ensure_duration(
    name: &'static str,
    duration: Option<Duration>,
    zero_error: ConfigError,
) -> Result<(), ConfigError> {
    let max_duration = Duration::from_secs(1_000 * YEAR_SECONDS);
    match duration {
        Some(d) if d.is_zero() => Err(zero_error),
        Some(d) if d > max_duration => Err(ConfigError::DurationTooLong(name)),
        _ => Ok(()),
    }
}
