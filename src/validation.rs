//! Admission checks applied to user input before it touches storage.

use std::time::Duration;

use chrono_tz::Tz;

use crate::{Error, Result};

pub(crate) const MAX_NAME_LENGTH: usize = 255;
pub(crate) const MAX_SINGLETON_KEY_LENGTH: usize = 255;
pub(crate) const MAX_EXPIRE: Duration = Duration::from_secs(24 * 60 * 60);
pub(crate) const MAX_RETRY_DELAY: i32 = 60 * 60 * 24;

/// Queue names are also embedded in derived singleton keys, so the character
/// class stays deliberately narrow.
pub(crate) fn require_queue_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_argument("queue name", "must not be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::invalid_argument(
            "queue name",
            format!("must be at most {MAX_NAME_LENGTH} characters"),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
    {
        return Err(Error::invalid_argument(
            "queue name",
            "may only contain letters, digits, underscore, dot, and dash",
        ));
    }
    Ok(())
}

pub(crate) fn require_retry_limit(retry_limit: i32) -> Result<()> {
    if retry_limit < 0 {
        return Err(Error::invalid_argument(
            "retry limit",
            "must not be negative",
        ));
    }
    Ok(())
}

pub(crate) fn require_retry_delay(retry_delay: i32) -> Result<()> {
    if !(0..=MAX_RETRY_DELAY).contains(&retry_delay) {
        return Err(Error::invalid_argument(
            "retry delay",
            format!("must be between 0 and {MAX_RETRY_DELAY} seconds"),
        ));
    }
    Ok(())
}

pub(crate) fn require_expire_in(expire_in: Duration) -> Result<()> {
    if expire_in.is_zero() || expire_in > MAX_EXPIRE {
        return Err(Error::invalid_argument(
            "expiration",
            "must be between 1 second and 24 hours",
        ));
    }
    Ok(())
}

pub(crate) fn require_retention(retention: Duration) -> Result<()> {
    if retention < Duration::from_secs(60) {
        return Err(Error::invalid_argument(
            "retention",
            "must be at least one minute",
        ));
    }
    Ok(())
}

pub(crate) fn require_singleton_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_SINGLETON_KEY_LENGTH {
        return Err(Error::invalid_argument(
            "singleton key",
            format!("must be between 1 and {MAX_SINGLETON_KEY_LENGTH} characters"),
        ));
    }
    Ok(())
}

pub(crate) fn require_singleton_seconds(seconds: u32) -> Result<()> {
    if seconds == 0 {
        return Err(Error::invalid_argument(
            "singleton seconds",
            "must be positive",
        ));
    }
    Ok(())
}

/// Quantize `now` (unix milliseconds) down to the containing bucket for
/// debounce/throttle admission: `floor(now / s) * s`, expressed in milliseconds.
pub(crate) fn singleton_bucket(now_millis: i64, seconds: u32) -> i64 {
    let width = seconds as i64 * 1000;
    (now_millis / width) * width
}

/// Parse an IANA timezone name.
pub(crate) fn parse_timezone(timezone: &str) -> Result<Tz> {
    timezone
        .parse::<Tz>()
        .map_err(|_| Error::InvalidTimezone(timezone.to_string()))
}

/// Parse a five-field cron expression (`minute hour dom month dow`).
///
/// The underlying parser wants a seconds field, so one is prepended; callers
/// always see standard five-field notation.
pub(crate) fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    if expression.split_whitespace().count() != 5 {
        return Err(Error::InvalidCron(expression.to_string()));
    }

    format!("0 {expression}")
        .parse::<cron::Schedule>()
        .map_err(|_| Error::InvalidCron(expression.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names() {
        require_queue_name("test-queue").unwrap();
        require_queue_name("a.b_c-d9").unwrap();

        assert!(require_queue_name("").is_err());
        assert!(require_queue_name("has space").is_err());
        assert!(require_queue_name("sneaky/slash").is_err());
        assert!(require_queue_name(&"x".repeat(256)).is_err());
        require_queue_name(&"x".repeat(255)).unwrap();
    }

    #[test]
    fn durations() {
        require_retry_delay(0).unwrap();
        assert!(require_retry_delay(-1).is_err());
        assert!(require_retry_delay(MAX_RETRY_DELAY + 1).is_err());

        require_expire_in(Duration::from_secs(1)).unwrap();
        require_expire_in(MAX_EXPIRE).unwrap();
        assert!(require_expire_in(Duration::ZERO).is_err());
        assert!(require_expire_in(MAX_EXPIRE + Duration::from_secs(1)).is_err());
    }

    #[test]
    fn singleton_buckets() {
        // 2-second buckets: both timestamps land in the same bucket.
        assert_eq!(singleton_bucket(10_250, 2), 10_000);
        assert_eq!(singleton_bucket(11_999, 2), 10_000);
        assert_eq!(singleton_bucket(12_000, 2), 12_000);

        require_singleton_seconds(1).unwrap();
        assert!(require_singleton_seconds(0).is_err());
        require_singleton_key("unique-task").unwrap();
        assert!(require_singleton_key("").is_err());
    }

    #[test]
    fn cron_expressions() {
        parse_cron("* * * * *").unwrap();
        parse_cron("*/5 0 1 1 *").unwrap();
        parse_cron("30 4 * * 1-5").unwrap();

        assert!(parse_cron("* * * *").is_err());
        assert!(parse_cron("0 * * * * *").is_err());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn timezones() {
        parse_timezone("UTC").unwrap();
        parse_timezone("America/New_York").unwrap();
        assert!(parse_timezone("Mars/Olympus_Mons").is_err());
    }
}
