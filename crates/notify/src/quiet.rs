//! Quiet-hours membership over the operator's local time zone.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use foreman_config::QuietHoursConfig;

/// Predicate over local wall-clock time. Overnight windows
/// (`start > end`, e.g. 22:00–07:00) wrap across midnight.
#[derive(Debug, Clone)]
pub struct QuietHours {
    enabled: bool,
    start: NaiveTime,
    end: NaiveTime,
    tz: Tz,
}

impl QuietHours {
    pub fn new(enabled: bool, start: &str, end: &str, timezone: &str) -> Result<Self> {
        Ok(Self {
            enabled,
            start: parse_hhmm(start)?,
            end: parse_hhmm(end)?,
            tz: resolve_timezone(timezone)?,
        })
    }

    pub fn from_config(config: &QuietHoursConfig) -> Result<Self> {
        Self::new(config.enabled, &config.start, &config.end, &config.timezone)
    }

    pub fn is_quiet_now(&self) -> bool {
        self.is_quiet_at(Utc::now())
    }

    pub fn is_quiet_at(&self, instant: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        let local = self.tz.from_utc_datetime(&instant.naive_utc()).time();
        if self.start <= self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }

    /// Calendar date in the configured zone, anchoring the daily budget.
    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        self.tz.from_utc_datetime(&instant.naive_utc()).date_naive()
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }
}

/// Resolve a configured IANA zone name. An empty value means "the
/// host's zone": detected via the platform database, falling back to
/// UTC when detection fails or reports a name chrono-tz doesn't know.
pub fn resolve_timezone(raw: &str) -> Result<Tz> {
    let raw = raw.trim();
    if raw.is_empty() {
        let host = iana_time_zone::get_timezone().unwrap_or_default();
        return Ok(host.parse().unwrap_or(Tz::UTC));
    }
    raw.parse()
        .map_err(|_| anyhow::anyhow!("unknown timezone '{raw}'"))
}

fn parse_hhmm(raw: &str) -> Result<NaiveTime> {
    let time = NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .with_context(|| format!("invalid HH:MM time '{raw}'"))?;
    if raw.trim().len() != 5 {
        bail!("invalid HH:MM time '{raw}'");
    }
    Ok(time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    /// Overnight window correctness across midnight (property 11).
    #[test]
    fn overnight_window_wraps_midnight() {
        let quiet = QuietHours::new(true, "22:00", "07:00", "UTC").unwrap();
        assert!(quiet.is_quiet_at(at(23, 30)));
        assert!(quiet.is_quiet_at(at(2, 0)));
        assert!(quiet.is_quiet_at(at(6, 59)));
        assert!(!quiet.is_quiet_at(at(7, 0)));
        assert!(!quiet.is_quiet_at(at(12, 0)));
        assert!(quiet.is_quiet_at(at(22, 0)));
        assert!(!quiet.is_quiet_at(at(21, 59)));
    }

    #[test]
    fn same_day_window_does_not_wrap() {
        let quiet = QuietHours::new(true, "13:00", "14:00", "UTC").unwrap();
        assert!(quiet.is_quiet_at(at(13, 30)));
        assert!(!quiet.is_quiet_at(at(12, 59)));
        assert!(!quiet.is_quiet_at(at(14, 0)));
    }

    #[test]
    fn disabled_is_never_quiet() {
        let quiet = QuietHours::new(false, "00:00", "23:59", "UTC").unwrap();
        assert!(!quiet.is_quiet_at(at(3, 0)));
    }

    #[test]
    fn respects_configured_timezone() {
        // 23:30 local in New York == 04:30 UTC next day (EST, March 10 is EDT: UTC-4)
        let quiet = QuietHours::new(true, "22:00", "07:00", "America/New_York").unwrap();
        let utc_instant = Utc.with_ymd_and_hms(2026, 3, 11, 3, 30, 0).unwrap();
        assert!(quiet.is_quiet_at(utc_instant)); // 23:30 EDT on the 10th
        let midday = Utc.with_ymd_and_hms(2026, 3, 10, 16, 0, 0).unwrap(); // 12:00 EDT
        assert!(!quiet.is_quiet_at(midday));
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(QuietHours::new(true, "25:00", "07:00", "UTC").is_err());
        assert!(QuietHours::new(true, "22:00", "07:00", "Mars/Olympus").is_err());
        assert!(QuietHours::new(true, "nope", "07:00", "UTC").is_err());
    }

    #[test]
    fn empty_timezone_falls_back_to_the_host_zone() {
        // whatever the host reports, resolution must succeed and yield a
        // usable zone
        let tz = resolve_timezone("").unwrap();
        let quiet = QuietHours::new(true, "22:00", "07:00", "").unwrap();
        assert_eq!(quiet.timezone(), tz);

        assert_eq!(resolve_timezone("  UTC  ").unwrap(), Tz::UTC);
    }
}
