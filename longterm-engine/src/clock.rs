//! Quarter arithmetic and the wall clock sampling that drives it.
//!
//! The quarter containing an instant is found by cutting the calendar of one
//! configured zone: months are 0-based, `floor(month / 3) * 3` selects the first
//! month of the quarter and the result is midnight of day 1 of that month.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, LocalResult, NaiveDate, TimeZone, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use longterm_core::ZoneSetting;
use longterm_protocol::goal::Period;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::ClockError;

/// Source of wall clock time in epoch milliseconds.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(now_millis),
        }
    }

    pub fn set(&self, now_millis: i64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Maps instants to the start of their enclosing quarter in a fixed zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuarterClock {
    zone: ZoneSetting,
}

impl QuarterClock {
    pub fn new(zone: ZoneSetting) -> Self {
        Self { zone }
    }

    pub fn utc() -> Self {
        Self::new(ZoneSetting::Utc)
    }

    pub fn zone(&self) -> ZoneSetting {
        self.zone
    }

    /// Start of the quarter containing `now_millis`, in epoch milliseconds.
    pub fn quantize(&self, now_millis: i64) -> Result<i64, ClockError> {
        self.bounds(now_millis).map(|(start, _)| start)
    }

    /// The quarter containing `now_millis` as a [`Period`].
    pub fn period_at(&self, now_millis: i64) -> Result<Period, ClockError> {
        let (start, end) = self.bounds(now_millis)?;
        Ok(Period::for_window(start, end))
    }

    fn bounds(&self, now_millis: i64) -> Result<(i64, i64), ClockError> {
        match self.zone {
            ZoneSetting::Local => quarter_bounds(&chrono::Local, now_millis),
            ZoneSetting::Utc => quarter_bounds(&Utc, now_millis),
            ZoneSetting::Fixed(offset) => quarter_bounds(&offset, now_millis),
        }
    }
}

fn quarter_bounds<Tz: TimeZone>(tz: &Tz, now_millis: i64) -> Result<(i64, i64), ClockError> {
    let out_of_range = || ClockError::OutOfRange(now_millis);
    let local = tz
        .timestamp_millis_opt(now_millis)
        .single()
        .ok_or_else(out_of_range)?;

    let year = local.year();
    let first_month0 = local.month0() / 3 * 3;
    let (next_year, next_month0) = if first_month0 + 3 > 11 {
        (year + 1, 0)
    } else {
        (year, first_month0 + 3)
    };

    let start = month_start(tz, year, first_month0 + 1).ok_or_else(out_of_range)?;
    let end = month_start(tz, next_year, next_month0 + 1).ok_or_else(out_of_range)?;
    Ok((start, end))
}

/// Epoch millis of local midnight on day 1 of `month` (1-based).
fn month_start<Tz: TimeZone>(tz: &Tz, year: i32, month: u32) -> Option<i64> {
    let midnight = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
    match tz.from_local_datetime(&midnight) {
        LocalResult::Single(at) => Some(at.timestamp_millis()),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.timestamp_millis()),
        // Midnight skipped by a DST jump: first valid minute of the day.
        LocalResult::None => (1..=24 * 60).find_map(|minutes| {
            tz.from_local_datetime(&(midnight + chrono::Duration::minutes(minutes)))
                .earliest()
                .map(|at| at.timestamp_millis())
        }),
    }
}

/// Samples `clock` every `every` and yields the current quarter start whenever it changes.
///
/// The first sample is taken immediately.
pub fn quarter_starts(
    clock: Arc<dyn Clock>,
    quarter: QuarterClock,
    every: Duration,
) -> BoxStream<'static, i64> {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    stream::unfold(
        (ticker, None::<i64>),
        move |(mut ticker, last)| {
            let clock = clock.clone();
            async move {
                loop {
                    ticker.tick().await;
                    let now = clock.now_millis();
                    match quarter.quantize(now) {
                        Ok(start) if Some(start) == last => continue,
                        Ok(start) => {
                            debug!(start, "quarter changed");
                            return Some((start, (ticker, Some(start))));
                        }
                        Err(err) => warn!(%err, "skipping clock sample"),
                    }
                }
            }
        },
    )
    .boxed()
}
