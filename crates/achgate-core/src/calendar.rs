//! Banking-day calendar for the US Federal Reserve.
//!
//! A holiday falling on Sunday is observed the following Monday. A holiday
//! falling on Saturday is not observed by the Federal Reserve.

use chrono::{Datelike, NaiveDate, Weekday};

/// Classification of a single local date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayKind {
    /// Saturday or Sunday.
    pub is_weekend: bool,
    /// An observed Federal Reserve holiday.
    pub is_holiday: bool,
}

impl DayKind {
    /// True when settlement happens on this date.
    #[must_use]
    pub const fn is_banking_day(self) -> bool {
        !self.is_weekend && !self.is_holiday
    }
}

/// Classifies a local date.
#[must_use]
pub fn classify(date: NaiveDate) -> DayKind {
    DayKind {
        is_weekend: is_weekend(date),
        is_holiday: is_holiday(date),
    }
}

/// True for Saturday and Sunday.
#[must_use]
pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// True when `date` is an observed Federal Reserve holiday.
#[must_use]
pub fn is_holiday(date: NaiveDate) -> bool {
    observed_holidays(date.year()).contains(&date)
}

/// True when `date` is neither a weekend nor an observed holiday.
#[must_use]
pub fn is_banking_day(date: NaiveDate) -> bool {
    classify(date).is_banking_day()
}

/// Observed Federal Reserve holidays for `year`, in calendar order.
#[must_use]
pub fn observed_holidays(year: i32) -> Vec<NaiveDate> {
    let fixed = [(1, 1), (6, 19), (7, 4), (11, 11), (12, 25)];
    let floating = [
        nth_weekday(year, 1, Weekday::Mon, 3),
        nth_weekday(year, 2, Weekday::Mon, 3),
        last_weekday(year, 5, Weekday::Mon),
        nth_weekday(year, 9, Weekday::Mon, 1),
        nth_weekday(year, 10, Weekday::Mon, 2),
        nth_weekday(year, 11, Weekday::Thu, 4),
    ];

    let mut days: Vec<NaiveDate> = fixed
        .iter()
        .filter_map(|&(month, day)| NaiveDate::from_ymd_opt(year, month, day))
        .filter_map(observe)
        .chain(floating.into_iter().flatten())
        .collect();
    days.sort_unstable();
    days
}

fn observe(date: NaiveDate) -> Option<NaiveDate> {
    match date.weekday() {
        Weekday::Sat => None,
        Weekday::Sun => date.succ_opt(),
        _ => Some(date),
    }
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    nth_weekday(year, month, weekday, 5).or_else(|| nth_weekday(year, month, weekday, 4))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn fixed_and_floating_holidays() {
        assert!(is_holiday(date(2024, 1, 1)));
        assert!(is_holiday(date(2024, 1, 15)));
        assert!(is_holiday(date(2024, 5, 27)));
        assert!(is_holiday(date(2024, 11, 28)));
        assert!(is_holiday(date(2024, 12, 25)));
        assert!(!is_holiday(date(2024, 3, 4)));
    }

    #[test]
    fn sunday_holidays_are_observed_monday() {
        // 2023-01-01 was a Sunday.
        assert!(!is_holiday(date(2023, 1, 1)));
        assert!(is_holiday(date(2023, 1, 2)));
    }

    #[test]
    fn saturday_holidays_are_not_observed() {
        // 2026-07-04 is a Saturday.
        assert!(!is_holiday(date(2026, 7, 3)));
        assert!(!is_holiday(date(2026, 7, 4)));
        assert_eq!(observed_holidays(2026).len(), 10);
    }

    #[test]
    fn classification() {
        let saturday = classify(date(2024, 3, 2));
        assert!(saturday.is_weekend);
        assert!(!saturday.is_banking_day());
        assert!(is_banking_day(date(2024, 3, 4)));
        assert!(!is_banking_day(date(2024, 7, 4)));
    }
}
