//! Time parsing and formatting utilities

use std::time::Duration;

use crate::error::{TranscodeError, TranscodeResult};

/// Parser for trim positions given on the command line
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeParser;

impl TimeParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse `SS.ms`, `MM:SS.ms` or `HH:MM:SS.ms` into a duration
    pub fn parse_time(&self, time_str: &str) -> TranscodeResult<Duration> {
        let time_str = time_str.trim();
        let invalid = || TranscodeError::InvalidTimeFormat {
            time: time_str.to_string(),
        };

        let parts: Vec<&str> = time_str.split(':').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(invalid());
        }

        // Only the last field may carry a fraction
        let (whole, last) = parts.split_at(parts.len() - 1);
        let mut seconds = 0.0;
        for field in whole {
            let value: u32 = field.parse().map_err(|_| invalid())?;
            seconds = seconds * 60.0 + value as f64;
        }
        let last: f64 = last[0].parse().map_err(|_| invalid())?;
        if !last.is_finite() || last < 0.0 || (!whole.is_empty() && last >= 60.0) {
            return Err(invalid());
        }
        seconds = seconds * 60.0 + last;

        Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
    }

    /// Parse an optional value; absent means zero
    pub fn parse_or_zero(&self, time_str: Option<&str>) -> TranscodeResult<Duration> {
        match time_str {
            Some(value) => self.parse_time(value),
            None => Ok(Duration::ZERO),
        }
    }
}

/// Format a duration as `HH:MM:SS.ms`, or `MM:SS.ms` below one hour
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let milliseconds = duration.subsec_millis();

    if hours > 0 {
        format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, milliseconds)
    } else {
        format!("{:02}:{:02}.{:03}", minutes, seconds, milliseconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_formats() {
        let parser = TimeParser::new();
        assert_eq!(parser.parse_time("2.5").unwrap(), Duration::from_millis(2_500));
        assert_eq!(parser.parse_time("01:05").unwrap(), Duration::from_secs(65));
        assert_eq!(parser.parse_time("1:05.250").unwrap(), Duration::from_millis(65_250));
        assert_eq!(parser.parse_time("01:00:03").unwrap(), Duration::from_secs(3_603));
        assert_eq!(parser.parse_time(" 00:00:05.5 ").unwrap(), Duration::from_millis(5_500));
    }

    #[test]
    fn test_rejects_invalid_times() {
        let parser = TimeParser::new();
        for bad in ["", "abc", "-1", "1:2:3:4", "01:75", "1.5:00", "NaN", "inf"] {
            assert!(
                matches!(parser.parse_time(bad), Err(TranscodeError::InvalidTimeFormat { .. })),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_missing_value_is_zero() {
        assert_eq!(TimeParser::new().parse_or_zero(None).unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(65_250)), "01:05.250");
        assert_eq!(format_duration(Duration::from_secs(3_603)), "01:00:03.000");
    }
}
