//! Cutoff scheduler.
//!
//! A shard's cutoffs are a timezone plus a list of `HH:MM` times of day.
//! Each time becomes a daily cron trigger evaluated in that timezone. The
//! driver task sleeps until the nearest trigger, classifies the day against
//! the banking calendar and sends a [`Day`] on the output channel. Weekend
//! ticks are not sent.
//!
//! ```rust
//! use achgate_outbound::schedule::CutoffScheduler;
//!
//! let scheduler = CutoffScheduler::new(
//!     "America/New_York",
//!     &["16:15".to_string(), "08:30".to_string(), "12:00".to_string()],
//! )
//! .unwrap();
//! assert_eq!(scheduler.first_window().to_string(), "08:30:00");
//! ```

use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use achgate_core::calendar;
use chrono::{DateTime, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// One cutoff tick, classified in the shard's timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Day {
    /// Tick time in the configured timezone.
    pub time: DateTime<Tz>,
    /// Neither weekend nor holiday.
    pub is_banking_day: bool,
    /// Observed Federal Reserve holiday.
    pub is_holiday: bool,
    /// Saturday or Sunday.
    pub is_weekend: bool,
    /// The tick belongs to the earliest configured window.
    pub first_window: bool,
}

#[derive(Debug, Clone)]
struct Window {
    time: NaiveTime,
    schedule: Schedule,
}

#[derive(Debug)]
struct Windows {
    tz: Tz,
    // Sorted ascending; index 0 is the first window of the day.
    windows: Vec<Window>,
}

impl Windows {
    fn next_fire(&self, after: DateTime<Utc>) -> Option<(DateTime<Tz>, bool)> {
        let local = after.with_timezone(&self.tz);
        self.windows
            .iter()
            .enumerate()
            .filter_map(|(index, window)| {
                window
                    .schedule
                    .after(&local)
                    .next()
                    .map(|at| (at, index == 0))
            })
            .min_by_key(|(at, _)| *at)
    }

    fn classify(time: DateTime<Tz>, first_window: bool) -> Day {
        let kind = calendar::classify(time.date_naive());
        Day {
            time,
            is_banking_day: kind.is_banking_day(),
            is_holiday: kind.is_holiday,
            is_weekend: kind.is_weekend,
            first_window,
        }
    }
}

/// Emits [`Day`] values at each configured cutoff.
///
/// Dropping the scheduler stops it.
#[derive(Debug)]
pub struct CutoffScheduler {
    windows: Arc<Windows>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

fn parse_window(raw: &str) -> Result<NaiveTime> {
    let trimmed = raw.trim();
    let (hour, minute) = trimmed
        .split_once(':')
        .ok_or_else(|| Error::invalid_cutoff(format!("'{raw}' is not HH:MM")))?;
    let hour: u32 = hour
        .parse()
        .map_err(|_| Error::invalid_cutoff(format!("'{raw}' has an invalid hour")))?;
    let minute: u32 = minute
        .parse()
        .map_err(|_| Error::invalid_cutoff(format!("'{raw}' has an invalid minute")))?;
    NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| Error::invalid_cutoff(format!("'{raw}' is out of range")))
}

impl CutoffScheduler {
    /// Builds a scheduler for `timezone` (IANA name) and `times` (`HH:MM`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCutoff`] when `times` is empty or a time does
    /// not parse, and [`Error::UnknownTimezone`] for an unknown zone.
    pub fn new(timezone: &str, times: &[String]) -> Result<Self> {
        let tz = Tz::from_str(timezone.trim())
            .map_err(|_| Error::UnknownTimezone(timezone.to_string()))?;
        if times.is_empty() {
            return Err(Error::invalid_cutoff("no cutoff times configured"));
        }

        let mut parsed = times
            .iter()
            .map(|raw| parse_window(raw))
            .collect::<Result<Vec<_>>>()?;
        parsed.sort_unstable();
        parsed.dedup();

        let windows = parsed
            .into_iter()
            .map(|time| {
                let expr = format!("0 {} {} * * *", time.minute(), time.hour());
                Schedule::from_str(&expr)
                    .map(|schedule| Window { time, schedule })
                    .map_err(|e| Error::invalid_cutoff(format!("{expr}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            windows: Arc::new(Windows { tz, windows }),
            cancel: CancellationToken::new(),
            driver: Mutex::new(None),
        })
    }

    /// The configured timezone.
    #[must_use]
    pub fn timezone(&self) -> Tz {
        self.windows.tz
    }

    /// The earliest configured time of day.
    #[must_use]
    pub fn first_window(&self) -> NaiveTime {
        self.windows
            .windows
            .first()
            .map_or(NaiveTime::MIN, |w| w.time)
    }

    /// Configured times of day, ascending.
    #[must_use]
    pub fn windows(&self) -> Vec<NaiveTime> {
        self.windows.windows.iter().map(|w| w.time).collect()
    }

    /// The next tick strictly after `after`, and whether it is the first window.
    #[must_use]
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<(DateTime<Tz>, bool)> {
        self.windows.next_fire(after)
    }

    /// Classifies a tick time against the banking calendar.
    #[must_use]
    pub fn classify(&self, time: DateTime<Tz>, first_window: bool) -> Day {
        Windows::classify(time, first_window)
    }

    /// Starts the driver task and returns the tick stream.
    ///
    /// The stream ends when the scheduler is stopped or dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCutoff`] if the scheduler was already started
    /// or has been stopped.
    pub fn start(&self) -> Result<mpsc::Receiver<Day>> {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if driver.is_some() || self.cancel.is_cancelled() {
            return Err(Error::invalid_cutoff("scheduler already started"));
        }

        let capacity = (self.windows.windows.len() * 4).max(16);
        let (tx, rx) = mpsc::channel(capacity);
        let windows = Arc::clone(&self.windows);
        let cancel = self.cancel.clone();
        *driver = Some(tokio::spawn(drive(windows, tx, cancel)));
        Ok(rx)
    }

    /// Cancels the triggers and closes the tick stream. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for CutoffScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive(windows: Arc<Windows>, tx: mpsc::Sender<Day>, cancel: CancellationToken) {
    let mut after = Utc::now();
    loop {
        let Some((at, first_window)) = windows.next_fire(after) else {
            tracing::warn!("no upcoming cutoff, scheduler stopping");
            return;
        };
        let at_utc = at.with_timezone(&Utc);
        let wait = (at_utc - Utc::now()).to_std().unwrap_or_default();

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(wait) => {}
        }
        after = at_utc;

        let day = Windows::classify(at, first_window);
        if day.is_weekend {
            tracing::debug!(time = %day.time, "skipping weekend cutoff");
            continue;
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            sent = tx.send(day) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;

    fn times(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn first_window_is_earliest_time() {
        let scheduler =
            CutoffScheduler::new("America/New_York", &times(&["16:15", "08:30", "12:00"])).unwrap();
        assert_eq!(
            scheduler.first_window(),
            NaiveTime::from_hms_opt(8, 30, 0).unwrap()
        );
        assert_eq!(scheduler.windows().len(), 3);
    }

    #[test]
    fn construction_errors() {
        assert!(matches!(
            CutoffScheduler::new("America/New_York", &[]),
            Err(Error::InvalidCutoff { .. })
        ));
        assert!(matches!(
            CutoffScheduler::new("America/New_York", &times(&["25:00"])),
            Err(Error::InvalidCutoff { .. })
        ));
        assert!(matches!(
            CutoffScheduler::new("America/New_York", &times(&["noon"])),
            Err(Error::InvalidCutoff { .. })
        ));
        assert!(matches!(
            CutoffScheduler::new("Mars/Olympus", &times(&["12:00"])),
            Err(Error::UnknownTimezone(_))
        ));
    }

    #[test]
    fn next_fire_picks_nearest_window() {
        let scheduler =
            CutoffScheduler::new("America/New_York", &times(&["16:15", "08:30"])).unwrap();
        let tz = scheduler.timezone();

        // 10:00 local on a Monday.
        let after = tz
            .with_ymd_and_hms(2024, 3, 4, 10, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let (at, first) = scheduler.next_fire(after).unwrap();
        assert_eq!(at.time(), NaiveTime::from_hms_opt(16, 15, 0).unwrap());
        assert!(!first);

        // After the last window the next tick is tomorrow's first window.
        let (at, first) = scheduler.next_fire(at.with_timezone(&Utc)).unwrap();
        assert_eq!(at.date_naive().to_string(), "2024-03-05");
        assert!(first);
    }

    #[test]
    fn classify_marks_weekends_and_holidays() {
        let scheduler = CutoffScheduler::new("America/New_York", &times(&["08:30"])).unwrap();
        let tz = scheduler.timezone();

        let saturday = scheduler.classify(tz.with_ymd_and_hms(2024, 3, 2, 8, 30, 0).unwrap(), true);
        assert!(saturday.is_weekend && !saturday.is_banking_day);

        let july_fourth = scheduler.classify(tz.with_ymd_and_hms(2024, 7, 4, 8, 30, 0).unwrap(), true);
        assert!(july_fourth.is_holiday && !july_fourth.is_weekend && !july_fourth.is_banking_day);

        let monday = scheduler.classify(tz.with_ymd_and_hms(2024, 3, 4, 8, 30, 0).unwrap(), false);
        assert!(monday.is_banking_day && !monday.first_window);
    }

    #[tokio::test]
    async fn stop_closes_the_stream() {
        let scheduler = CutoffScheduler::new("UTC", &times(&["00:00"])).unwrap();
        let mut rx = scheduler.start().unwrap();
        assert!(scheduler.start().is_err());

        scheduler.stop();
        scheduler.stop();
        let next = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
