//! Timestamps inside the server are a `Duration` since the unix epoch, the same
//! value every component of one operation is handed as its fixed "current time".
//! On entries they are stored in generalized time, `YYYYMMDDHHMMSS.mmmZ`.

use std::time::SystemTime;

use time::format_description;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::prelude::*;

pub fn duration_from_epoch_now() -> Duration {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
}

fn to_offset_date_time(ts: Duration) -> OffsetDateTime {
    time::Duration::try_from(ts)
        .ok()
        .and_then(|d| OffsetDateTime::UNIX_EPOCH.checked_add(d))
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn from_offset_date_time(odt: OffsetDateTime) -> Option<Duration> {
    let nanos = odt.unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000)
        .ok()
        .map(Duration::from_millis)
}

pub struct GeneralizedTime;

impl GeneralizedTime {
    pub fn format(ts: Duration) -> String {
        let odt = to_offset_date_time(ts);
        format!(
            "{:04}{:02}{:02}{:02}{:02}{:02}.{:03}Z",
            odt.year(),
            u8::from(odt.month()),
            odt.day(),
            odt.hour(),
            odt.minute(),
            odt.second(),
            odt.millisecond()
        )
    }

    /// Accepts `YYYYMMDDHH[MM[SS]][(.|,)fraction](Z|+hhmm|-hhmm)`.
    pub fn parse(value: &str) -> Result<Duration, DirectoryError> {
        Self::parse_inner(value.trim()).ok_or_else(|| {
            DirectoryError::new(
                ResultCode::InvalidAttributeSyntax,
                format!("{value:?} is not a valid generalized time"),
            )
        })
    }

    fn parse_inner(v: &str) -> Option<Duration> {
        let bytes = v.as_bytes();
        let digits = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
        if !matches!(digits, 10 | 12 | 14) {
            return None;
        }
        let num = |start: usize, len: usize| -> Option<u32> { v.get(start..start + len)?.parse().ok() };
        let year = num(0, 4)? as i32;
        let month = Month::try_from(num(4, 2)? as u8).ok()?;
        let day = num(6, 2)? as u8;
        let hour = num(8, 2)? as u8;
        let minute = if digits >= 12 { num(10, 2)? as u8 } else { 0 };
        let second = if digits >= 14 { num(12, 2)? as u8 } else { 0 };

        let mut rest = &v[digits..];
        let mut millis = 0u16;
        if rest.starts_with('.') || rest.starts_with(',') {
            let frac: String = rest[1..].chars().take_while(|c| c.is_ascii_digit()).collect();
            if frac.is_empty() {
                return None;
            }
            let padded = format!("{:0<3}", &frac[..frac.len().min(3)]);
            millis = padded.parse().ok()?;
            rest = &rest[1 + frac.len()..];
        }

        let offset = match rest {
            "Z" => UtcOffset::UTC,
            s if (s.starts_with('+') || s.starts_with('-')) && s.len() == 5 => {
                let h: i8 = s.get(1..3)?.parse().ok()?;
                let m: i8 = s.get(3..5)?.parse().ok()?;
                let sign = if s.starts_with('-') { -1 } else { 1 };
                UtcOffset::from_hms(sign * h, sign * m, 0).ok()?
            }
            _ => return None,
        };

        let date = Date::from_calendar_date(year, month, day).ok()?;
        let time = Time::from_hms_milli(hour, minute, second, millis).ok()?;
        from_offset_date_time(PrimitiveDateTime::new(date, time).assume_offset(offset))
    }
}

/// Check that a configured format description is usable.
pub fn validate_time_format(format: &str) -> Result<(), ConfigError> {
    format_description::parse_borrowed::<2>(format)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidTimeFormat {
            format: format.to_string(),
            reason: e.to_string(),
        })
}

/// Render a timestamp using a format description such as
/// `[year][month][day][hour][minute][second]Z`.
pub fn format_with(format: &str, ts: Duration) -> Option<String> {
    let items = format_description::parse_borrowed::<2>(format).ok()?;
    to_offset_date_time(ts).format(&items).ok()
}

/// Parse a timestamp written with a format description. Formats without an
/// offset are read as UTC, formats without a time of day as midnight.
pub fn parse_with(format: &str, value: &str) -> Option<Duration> {
    let items = format_description::parse_borrowed::<2>(format).ok()?;
    if let Ok(odt) = OffsetDateTime::parse(value, &items) {
        return from_offset_date_time(odt);
    }
    if let Ok(pdt) = PrimitiveDateTime::parse(value, &items) {
        return from_offset_date_time(pdt.assume_utc());
    }
    Date::parse(value, &items)
        .ok()
        .and_then(|d| from_offset_date_time(d.midnight().assume_utc()))
}

lazy_static! {
    /// Seconds per unit for configured durations. Both abbreviations and full names
    /// are accepted.
    static ref TIME_UNITS: hashbrown::HashMap<&'static str, u64> = {
        let mut m = hashbrown::HashMap::new();
        for (names, secs) in [
            (&["s", "sec", "secs", "second", "seconds"][..], 1),
            (&["m", "min", "mins", "minute", "minutes"][..], 60),
            (&["h", "hr", "hour", "hours"][..], 3600),
            (&["d", "day", "days"][..], 86400),
            (&["w", "week", "weeks"][..], 604800),
        ] {
            for n in names {
                m.insert(*n, secs);
            }
        }
        m
    };
}

/// Parse `"<n>"`, `"<n><unit>"` or `"<n> <unit>"` into seconds. Negative values
/// mean the feature is disabled and become zero.
pub fn parse_duration_secs(value: &str) -> Result<u64, ConfigError> {
    let v = value.trim();
    let split = v
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || (*i == 0 && *c == '-')))
        .map(|(i, _)| i)
        .unwrap_or(v.len());
    let (num, unit) = v.split_at(split);
    let num: i64 = num
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(value.to_string()))?;
    let unit = unit.trim().to_lowercase();
    let factor = if unit.is_empty() {
        1
    } else {
        *TIME_UNITS
            .get(unit.as_str())
            .ok_or_else(|| ConfigError::InvalidDuration(value.to_string()))?
    };
    Ok(u64::try_from(num).unwrap_or(0).saturating_mul(factor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generalized_time_round_trip() {
        sketching::test_init();
        let ts = Duration::from_millis(1_700_000_000_123);
        let s = GeneralizedTime::format(ts);
        assert_eq!(s, "20231114221320.123Z");
        assert_eq!(GeneralizedTime::parse(&s).ok(), Some(ts));
    }

    #[test]
    fn test_generalized_time_variants() {
        sketching::test_init();
        assert_eq!(
            GeneralizedTime::parse("19700101000010Z").ok(),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            GeneralizedTime::parse("197001010100Z").ok(),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(
            GeneralizedTime::parse("19700101010000+0100").ok(),
            Some(Duration::ZERO)
        );
        assert_eq!(
            GeneralizedTime::parse("19700101000000.5Z").ok(),
            Some(Duration::from_millis(500))
        );
        assert!(GeneralizedTime::parse("1970").is_err());
        assert!(GeneralizedTime::parse("19701301000000Z").is_err());
        assert!(GeneralizedTime::parse("19700101000000").is_err());
    }

    #[test]
    fn test_duration_units() {
        sketching::test_init();
        assert_eq!(parse_duration_secs("30").ok(), Some(30));
        assert_eq!(parse_duration_secs("5 m").ok(), Some(300));
        assert_eq!(parse_duration_secs("2 hours").ok(), Some(7200));
        assert_eq!(parse_duration_secs("1d").ok(), Some(86400));
        assert_eq!(parse_duration_secs("3 weeks").ok(), Some(3 * 604800));
        assert_eq!(parse_duration_secs("-5 days").ok(), Some(0));
        assert!(parse_duration_secs("5 fortnights").is_err());
        assert!(parse_duration_secs("days").is_err());
    }

    #[test]
    fn test_custom_formats() {
        sketching::test_init();
        let fmt = "[year][month][day]";
        assert!(validate_time_format(fmt).is_ok());
        assert!(validate_time_format("[year][nonsense]").is_err());
        let ts = Duration::from_secs(86400 * 2 + 500);
        assert_eq!(format_with(fmt, ts).as_deref(), Some("19700103"));
        assert_eq!(parse_with(fmt, "19700103"), Some(Duration::from_secs(86400 * 2)));

        let iso = "[year]-[month]-[day]T[hour]:[minute]:[second]Z";
        assert!(validate_time_format(iso).is_ok());
        assert_eq!(format_with(iso, ts).as_deref(), Some("1970-01-03T00:08:20Z"));
        assert_eq!(parse_with(iso, "1970-01-03T00:08:20Z"), Some(ts));
    }
}
