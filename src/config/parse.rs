use std::time::Duration;

use crate::error::ConfigError;

const UNIT_MILLIS: [(&str, u64); 4] = [("ms", 1), ("s", 1_000), ("m", 60_000), ("h", 3_600_000)];

fn unit_millis(unit: &str) -> Result<u64, ConfigError> {
    UNIT_MILLIS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, millis)| *millis)
        .ok_or_else(|| ConfigError::InvalidDurationUnit {
            unit: unit.to_owned(),
        })
}

/// Parses a bare number of seconds, or one or more `<count><unit>` parts
/// such as `"250ms"` or `"1m30s"`. Zero-length durations are rejected.
pub(crate) fn parse_duration_value(raw: &str) -> Result<Duration, ConfigError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ConfigError::DurationEmpty);
    }
    if let Ok(seconds) = text.parse::<u64>() {
        return non_zero(Duration::from_secs(seconds));
    }

    let overflow = || ConfigError::DurationOverflow {
        value: text.to_owned(),
    };
    let mut total_ms = 0u64;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|ch: char| !ch.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(ConfigError::InvalidDurationFormat {
                value: text.to_owned(),
            });
        }
        let (count_text, tail) = rest.split_at(digits);
        let unit_len = tail
            .find(|ch: char| ch.is_ascii_digit())
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);

        let count: u64 = count_text
            .parse()
            .map_err(|source| ConfigError::InvalidDurationNumber {
                value: text.to_owned(),
                source,
            })?;
        let part = count.checked_mul(unit_millis(unit)?).ok_or_else(overflow)?;
        total_ms = total_ms.checked_add(part).ok_or_else(overflow)?;
        rest = next;
    }
    non_zero(Duration::from_millis(total_ms))
}

fn non_zero(duration: Duration) -> Result<Duration, ConfigError> {
    if duration.is_zero() {
        return Err(ConfigError::DurationZero);
    }
    Ok(duration)
}
