// ABOUTME: Typed environment variable readers
// ABOUTME: Invalid values log a warning and fall back to the supplied default

use std::fmt::Display;
use std::ops::RangeInclusive;
use std::str::FromStr;
use tracing::warn;

/// Read a non-empty string variable.
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a variable, falling back to `default` when it is unset or unparsable.
pub fn env_parse<T>(name: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match env_string(name) {
        Some(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(
                    "Invalid value '{}' for {}, using default {}",
                    raw, name, default
                );
                default
            }
        },
        None => default,
    }
}

/// Parse an integer variable that must fall inside `range`.
pub fn env_u64_in_range(name: &str, default: u64, range: RangeInclusive<u64>) -> u64 {
    let value = env_parse(name, default);
    if range.contains(&value) {
        value
    } else {
        warn!(
            "{}={} is outside {}..={}, using default {}",
            name,
            value,
            range.start(),
            range.end(),
            default
        );
        default
    }
}

/// Boolean flags accept `1`, `true`, `yes` and `on`.
pub fn env_bool(name: &str) -> bool {
    env_string(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
