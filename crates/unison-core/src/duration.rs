//! Compact duration grammar used by update strategies (`"15min"`, `"5s"`).

use std::time::Duration;

use crate::error::{Error, Result};

/// Parse an integer followed by a unit among `s|sec|second|seconds|m|min|h|d`.
///
/// Whitespace between the number and the unit is allowed. Zero and negative
/// durations are rejected.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    let split = trimmed
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let amount: i64 = number
        .parse()
        .map_err(|_| Error::invalid(format!("invalid duration '{input}'")))?;

    let multiplier: i64 = match unit.trim().to_ascii_lowercase().as_str() {
        "s" | "sec" | "second" | "seconds" => 1,
        "m" | "min" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "" => return Err(Error::invalid(format!("duration '{input}' has no unit"))),
        other => {
            return Err(Error::invalid(format!(
                "unknown duration unit '{other}' in '{input}'"
            )))
        }
    };

    let seconds = amount
        .checked_mul(multiplier)
        .ok_or_else(|| Error::invalid(format!("duration '{input}' is too large")))?;
    if seconds <= 0 {
        return Err(Error::invalid(format!("duration '{input}' must be positive")));
    }
    Ok(Duration::from_secs(seconds as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units() {
        assert_eq!(parse_duration("15min").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("5 seconds").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7_200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration(" 3m ").unwrap(), Duration::from_secs(180));
    }

    #[test]
    fn test_rejects_bad_durations() {
        for bad in ["0s", "-5s", "5", "", "abc", "5 weeks", "1.5h"] {
            assert!(parse_duration(bad).is_err(), "{bad} accepted");
        }
    }
}
