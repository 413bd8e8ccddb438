//! Duration strings in stack.toml: `"90s"`, `"500ms"`, `"2m"`, `"1h"`.

use std::time::Duration;

/// Suffixes in match order. `ms` must be tried before `m` and `s`.
const UNITS: &[(&str, u64)] = &[("ms", 1), ("s", 1_000), ("m", 60_000), ("h", 3_600_000)];

/// Parse a duration string. A bare integer counts as seconds.
///
/// Returns `None` for anything else, including negative or fractional
/// values and overflowing amounts.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (amount, millis_per_unit) = UNITS
        .iter()
        .find_map(|(suffix, scale)| raw.strip_suffix(suffix).map(|n| (n, *scale)))
        .unwrap_or((raw, 1_000));
    if amount.is_empty() || !amount.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let millis = amount.parse::<u64>().ok()?.checked_mul(millis_per_unit)?;
    Some(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_unit_is_understood() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn bare_number_is_seconds() {
        assert_eq!(parse_duration(" 60 "), Some(Duration::from_secs(60)));
    }

    #[test]
    fn malformed_values_are_rejected() {
        for raw in ["", "s", "soon", "-5s", "1.5s", "5 s", "5d"] {
            assert_eq!(parse_duration(raw), None, "{raw:?}");
        }
        assert_eq!(parse_duration("18446744073709551615h"), None);
    }
}
