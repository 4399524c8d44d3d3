//! Parsing of human-written publish times
//!
//! Accepted forms, tried in order:
//! - RFC 3339 timestamps: "2026-11-20T15:00:00Z"
//! - Relative durations: "30m", "2h", "1d", "in 45 minutes"
//! - Natural language: "tomorrow 3pm", "next monday 10am"

use chrono::{DateTime, Duration, Utc};

use crate::error::{CrosspostError, Result};

/// Parse a schedule string relative to the current time
///
/// # Errors
///
/// Returns a validation error if the input matches none of the supported
/// forms.
pub fn parse_schedule(input: &str) -> Result<DateTime<Utc>> {
    parse_schedule_from(input, Utc::now())
}

/// Parse a schedule string relative to `now`
pub fn parse_schedule_from(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CrosspostError::Validation(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    let relative = input.strip_prefix("in ").unwrap_or(input);
    if let Ok(duration) = parse_duration(relative) {
        return now.checked_add_signed(duration).ok_or_else(|| {
            CrosspostError::Validation(format!("Schedule '{}' is too far in the future", input))
        });
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us).map_err(|e| {
        CrosspostError::Validation(format!("Could not parse schedule '{}': {}", input, e))
    })
}

fn parse_duration(input: &str) -> Result<Duration> {
    let std_duration = humantime::parse_duration(input)
        .map_err(|e| CrosspostError::Validation(format!("Could not parse duration: {}", e)))?;

    Duration::from_std(std_duration)
        .map_err(|_| CrosspostError::Validation("Duration out of range".to_string()))
}
