//! Device tick to wall-clock mapping
//!
//! The device stamps commands with a free-running tick counter. The first
//! timestamped command (or a timestamped greeting) pins a reference pair
//! `(ticks, time)`; later ticks map to `time + (ticks - reference) / rate`.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceClock {
    tick_rate: u32,
    reference: Option<(u64, DateTime<Utc>)>,
}

impl DeviceClock {
    /// `tick_rate` is in ticks per second and must be non-zero
    pub fn new(tick_rate: u32) -> Self {
        Self {
            tick_rate: tick_rate.max(1),
            reference: None,
        }
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    /// The current `(ticks, time)` reference
    pub fn reference(&self) -> Option<(u64, DateTime<Utc>)> {
        self.reference
    }

    /// Pin a new reference, as when the device restarts
    pub fn reset(&mut self, ticks: u64, now: DateTime<Utc>) {
        debug!(ticks, %now, "Device clock reference set");
        self.reference = Some((ticks, now));
    }

    /// Absolute time of `ticks`, if a reference exists
    pub fn to_time(&self, ticks: u64) -> Option<DateTime<Utc>> {
        let (start_ticks, start_time) = self.reference?;
        let elapsed = i128::from(ticks) - i128::from(start_ticks);
        let micros = elapsed * 1_000_000 / i128::from(self.tick_rate);
        let micros = i64::try_from(micros).ok()?;
        start_time.checked_add_signed(Duration::microseconds(micros))
    }

    /// Time to record for a command stamped with `ticks` that arrived at `now`
    ///
    /// Untimestamped commands use their arrival time. The first timestamped
    /// command pins the reference.
    pub fn timestamp(&mut self, ticks: Option<u64>, now: DateTime<Utc>) -> DateTime<Utc> {
        let Some(ticks) = ticks else {
            return now;
        };
        if self.reference.is_none() {
            self.reset(ticks, now);
        }
        self.to_time(ticks).unwrap_or(now)
    }
}
