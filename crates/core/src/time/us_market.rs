use anyhow::Context;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use std::collections::HashSet;

// Fixed UTC-5. During daylight saving this runs an hour late, which only moves the cutoff.
const ET_OFFSET_SECS: i32 = -5 * 3600;

// Before this time (ET) the current session has not closed; use the previous trading day.
const CLOSE_CUTOFF_HOUR_ET: u32 = 16;
const CLOSE_CUTOFF_MINUTE_ET: u32 = 0;

/// NYSE-style calendar: weekends plus fixed-date holidays and `MARKET_HOLIDAYS` extras.
#[derive(Debug, Clone, Default)]
pub struct TradingCalendar {
    holidays: HashSet<NaiveDate>,
}

impl TradingCalendar {
    pub fn new(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }

    pub fn from_env() -> Self {
        let mut holidays = fixed_holidays();
        if let Ok(s) = std::env::var("MARKET_HOLIDAYS") {
            holidays.extend(parse_holidays(&s));
        }
        Self { holidays }
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !is_weekend(date) && !self.holidays.contains(&date)
    }

    pub fn resolve_as_of_date(
        &self,
        as_of_date_arg: Option<&str>,
        now_utc: DateTime<Utc>,
    ) -> anyhow::Result<NaiveDate> {
        if let Some(s) = as_of_date_arg {
            return NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .with_context(|| format!("invalid as-of date {s:?} (expected YYYY-MM-DD)"));
        }

        let et = chrono::FixedOffset::east_opt(ET_OFFSET_SECS).context("invalid ET offset")?;
        let now_et = now_utc.with_timezone(&et);

        let cutoff_reached =
            (now_et.hour(), now_et.minute()) >= (CLOSE_CUTOFF_HOUR_ET, CLOSE_CUTOFF_MINUTE_ET);
        let mut date = now_et.date_naive();
        if !cutoff_reached {
            date = date - Duration::days(1);
        }

        while !self.is_trading_day(date) {
            date = date - Duration::days(1);
        }

        Ok(date)
    }

    /// `from` plus `n` trading days; `from` itself need not be a trading day.
    pub fn add_trading_days(&self, from: NaiveDate, n: u32) -> NaiveDate {
        let mut date = from;
        let mut left = n;
        while left > 0 {
            date = date + Duration::days(1);
            if self.is_trading_day(date) {
                left -= 1;
            }
        }
        date
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun)
}

fn fixed_holidays() -> HashSet<NaiveDate> {
    // Fixed-date closures only; floating ones (Thanksgiving etc.) come from MARKET_HOLIDAYS.
    let mut out = HashSet::new();
    for y in 2024..=2030 {
        for (m, d) in [(1, 1), (6, 19), (7, 4), (12, 25)] {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                out.insert(date);
            }
        }
    }
    out
}

fn parse_holidays(s: &str) -> Vec<NaiveDate> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| NaiveDate::parse_from_str(p, "%Y-%m-%d").ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn rolls_back_on_weekend() {
        // 2026-01-10 is Saturday; 23:00 UTC = 18:00 ET.
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 23, 0, 0).unwrap();
        let d = TradingCalendar::default().resolve_as_of_date(None, now).unwrap();
        assert_eq!(d, date(2026, 1, 9));
    }

    #[test]
    fn uses_previous_day_before_cutoff() {
        // 2026-01-12 (Monday) 15:00 UTC = 10:00 ET.
        let now = Utc.with_ymd_and_hms(2026, 1, 12, 15, 0, 0).unwrap();
        let d = TradingCalendar::default().resolve_as_of_date(None, now).unwrap();
        assert_eq!(d, date(2026, 1, 9));
    }

    #[test]
    fn uses_same_day_after_cutoff() {
        // 2026-01-12 21:30 UTC = 16:30 ET.
        let now = Utc.with_ymd_and_hms(2026, 1, 12, 21, 30, 0).unwrap();
        let d = TradingCalendar::default().resolve_as_of_date(None, now).unwrap();
        assert_eq!(d, date(2026, 1, 12));
    }

    #[test]
    fn explicit_date_wins() {
        let now = Utc.with_ymd_and_hms(2026, 1, 12, 21, 30, 0).unwrap();
        let cal = TradingCalendar::default();
        assert_eq!(cal.resolve_as_of_date(Some("2025-11-03"), now).unwrap(), date(2025, 11, 3));
        assert!(cal.resolve_as_of_date(Some("11/03/2025"), now).is_err());
    }

    #[test]
    fn adds_trading_days_over_weekend_and_holiday() {
        let cal = TradingCalendar::new([date(2026, 1, 19)]);
        // Thu 2026-01-15 + 5: Fri 16, (Mon 19 holiday), Tue 20, Wed 21, Thu 22, Fri 23.
        assert_eq!(cal.add_trading_days(date(2026, 1, 15), 5), date(2026, 1, 23));
        assert_eq!(cal.add_trading_days(date(2026, 1, 15), 0), date(2026, 1, 15));
    }

    #[test]
    fn parses_holiday_list_leniently() {
        let parsed = parse_holidays("2026-11-26, ,bogus,2026-12-24");
        assert_eq!(parsed, vec![date(2026, 11, 26), date(2026, 12, 24)]);
    }
}
