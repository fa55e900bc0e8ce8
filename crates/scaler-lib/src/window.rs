//! Maintenance windows and execution-time parsing
//!
//! Resizes are deferred to a quiet moment: a local time of day at a fixed
//! UTC offset. Named zones are not supported, offsets are explicit.

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Naive layouts accepted when the caller supplies no offset in the timestamp
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Parse `+08:00`, `-0530`, `UTC` or `Z` into a fixed offset
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset, String> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("utc") || raw.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0).ok_or_else(|| "invalid zero offset".to_string());
    }

    let (sign, rest) = match raw.as_bytes().first() {
        Some(b'+') => (1, &raw[1..]),
        Some(b'-') => (-1, &raw[1..]),
        _ => return Err(format!("offset {:?} must start with + or -", raw)),
    };

    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("offset {:?} must look like +HH:MM", raw));
    }

    let hours: i32 = digits[..2].parse().map_err(|_| format!("bad hours in {:?}", raw))?;
    let minutes: i32 = digits[2..].parse().map_err(|_| format!("bad minutes in {:?}", raw))?;
    if hours > 23 || minutes > 59 {
        return Err(format!("offset {:?} out of range", raw));
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| format!("offset {:?} out of range", raw))
}

/// Parse an execution timestamp.
///
/// RFC 3339 input carries its own offset. Naive input is read in
/// `default_offset`.
pub fn parse_execution_time(
    raw: &str,
    default_offset: FixedOffset,
) -> Result<DateTime<FixedOffset>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("execution time is empty".to_string());
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed);
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(at_offset(naive, default_offset));
        }
    }

    Err(format!("unrecognised timestamp {:?}", raw))
}

/// Interpret a naive local datetime at a fixed offset
fn at_offset(local: NaiveDateTime, offset: FixedOffset) -> DateTime<FixedOffset> {
    let utc = local - Duration::seconds(offset.local_minus_utc() as i64);
    DateTime::from_naive_utc_and_offset(utc, offset)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowSpec {
    time: String,
    #[serde(default = "default_offset_str")]
    utc_offset: String,
}

fn default_offset_str() -> String {
    "+00:00".to_string()
}

/// Daily quiet moment at which deferred resizes run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WindowSpec", into = "WindowSpec")]
pub struct MaintenanceWindow {
    time: NaiveTime,
    offset: FixedOffset,
}

impl TryFrom<WindowSpec> for MaintenanceWindow {
    type Error = String;

    fn try_from(spec: WindowSpec) -> Result<Self, Self::Error> {
        let time = NaiveTime::parse_from_str(&spec.time, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&spec.time, "%H:%M:%S"))
            .map_err(|e| format!("invalid window time {:?}: {}", spec.time, e))?;
        let offset = parse_utc_offset(&spec.utc_offset)?;
        Ok(Self { time, offset })
    }
}

impl From<MaintenanceWindow> for WindowSpec {
    fn from(window: MaintenanceWindow) -> Self {
        WindowSpec {
            time: window.time.format("%H:%M:%S").to_string(),
            utc_offset: window.offset.to_string(),
        }
    }
}

impl MaintenanceWindow {
    pub fn new(time: NaiveTime, offset: FixedOffset) -> Self {
        Self { time, offset }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Next occurrence of the window at least `min_lead` after `now`
    pub fn next_after(&self, now: DateTime<Utc>, min_lead: Duration) -> DateTime<FixedOffset> {
        let earliest = now + min_lead;
        let local_date = earliest.with_timezone(&self.offset).date_naive();

        let mut candidate = at_offset(local_date.and_time(self.time), self.offset);
        while candidate.with_timezone(&Utc) <= earliest {
            candidate += Duration::days(1);
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hk() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    #[test]
    fn test_parse_utc_offset() {
        assert_eq!(parse_utc_offset("+08:00").unwrap(), hk());
        assert_eq!(parse_utc_offset("+0800").unwrap(), hk());
        assert_eq!(
            parse_utc_offset("-05:30").unwrap(),
            FixedOffset::west_opt(5 * 3600 + 30 * 60).unwrap()
        );
        assert_eq!(parse_utc_offset("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_utc_offset("Z").unwrap().local_minus_utc(), 0);

        assert!(parse_utc_offset("Asia/Hong_Kong").is_err());
        assert!(parse_utc_offset("+25:00").is_err());
        assert!(parse_utc_offset("+8").is_err());
    }

    #[test]
    fn test_parse_rfc3339_keeps_its_offset() {
        let utc = FixedOffset::east_opt(0).unwrap();
        let parsed = parse_execution_time("2025-01-01T02:00:00+08:00", utc).unwrap();
        assert_eq!(parsed.offset(), &hk());
        assert_eq!(
            parsed.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 12, 31, 18, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_naive_uses_default_offset() {
        let parsed = parse_execution_time("2025-01-01 02:00", hk()).unwrap();
        assert_eq!(
            parsed.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 12, 31, 18, 0, 0).unwrap()
        );

        let with_t = parse_execution_time("2025-01-01T02:00:30", hk()).unwrap();
        assert_eq!(with_t.format("%H:%M:%S").to_string(), "02:00:30");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_execution_time("", hk()).is_err());
        assert!(parse_execution_time("next tuesday", hk()).is_err());
        assert!(parse_execution_time("2025-13-01T00:00:00", hk()).is_err());
    }

    #[test]
    fn test_window_next_occurrence_same_day() {
        let window = MaintenanceWindow::new(NaiveTime::from_hms_opt(2, 0, 0).unwrap(), hk());
        // 2025-01-01 00:30 local
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 16, 30, 0).unwrap();

        let next = window.next_after(now, Duration::zero());
        assert_eq!(next.to_rfc3339(), "2025-01-01T02:00:00+08:00");
    }

    #[test]
    fn test_window_rolls_to_next_day() {
        let window = MaintenanceWindow::new(NaiveTime::from_hms_opt(2, 0, 0).unwrap(), hk());
        // 2025-01-01 03:00 local, past today's window
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 19, 0, 0).unwrap();

        let next = window.next_after(now, Duration::zero());
        assert_eq!(next.to_rfc3339(), "2025-01-02T02:00:00+08:00");
    }

    #[test]
    fn test_window_honours_min_lead() {
        let window = MaintenanceWindow::new(NaiveTime::from_hms_opt(2, 0, 0).unwrap(), hk());
        // 01:50 local with a 15 minute lead pushes past 02:00
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 17, 50, 0).unwrap();

        let next = window.next_after(now, Duration::minutes(15));
        assert_eq!(next.to_rfc3339(), "2025-01-02T02:00:00+08:00");
    }

    #[test]
    fn test_window_deserialize() {
        let window: MaintenanceWindow =
            serde_json::from_str(r#"{"time":"02:00","utc_offset":"+08:00"}"#).unwrap();
        assert_eq!(window.offset(), hk());

        assert!(serde_json::from_str::<MaintenanceWindow>(r#"{"time":"25:00"}"#).is_err());
    }
}
