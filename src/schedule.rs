//! Recurrence descriptions for time-based operators.
//!
//! A [`Schedule`] is an immutable description. Operators turn it into a
//! [`ScheduleDriver`], which hands out the delay before each recurrence and
//! reports when the schedule is exhausted.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    Forever,
    Spaced(Duration),
    Fixed(Duration),
    Exponential { base: Duration, factor: f64 },
    Delays(Arc<[Duration]>),
}

/// A description of when something recurs.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    kind: Kind,
    limit: Option<usize>,
}

impl Schedule {
    /// Recur immediately, forever.
    pub fn forever() -> Self {
        Self {
            kind: Kind::Forever,
            limit: None,
        }
    }

    /// Recur immediately `n` times.
    pub fn recurs(n: usize) -> Self {
        Self::forever().take(n)
    }

    /// Wait `interval` between recurrences, measured from the end of the
    /// previous one.
    pub fn spaced(interval: Duration) -> Self {
        Self {
            kind: Kind::Spaced(interval),
            limit: None,
        }
    }

    /// Recur on multiples of `interval` counted from the first recurrence.
    /// Boundaries missed while the caller was busy are skipped rather than
    /// replayed.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            kind: Kind::Fixed(interval),
            limit: None,
        }
    }

    /// Delays of `base * factor^n` for the n-th recurrence.
    pub fn exponential(base: Duration, factor: f64) -> Self {
        Self {
            kind: Kind::Exponential { base, factor },
            limit: None,
        }
    }

    /// Recur once per listed delay, then stop.
    pub fn from_delays<I>(delays: I) -> Self
    where
        I: IntoIterator<Item = Duration>,
    {
        Self {
            kind: Kind::Delays(delays.into_iter().collect()),
            limit: None,
        }
    }

    /// Stop after at most `n` recurrences.
    pub fn take(mut self, n: usize) -> Self {
        self.limit = Some(self.limit.map_or(n, |limit| limit.min(n)));
        self
    }

    /// Start stepping through the schedule.
    pub fn driver(&self) -> ScheduleDriver {
        ScheduleDriver {
            schedule: self.clone(),
            count: 0,
            start: None,
        }
    }
}

/// Running state of a [`Schedule`].
#[derive(Debug, Clone)]
pub struct ScheduleDriver {
    schedule: Schedule,
    count: usize,
    start: Option<Instant>,
}

impl ScheduleDriver {
    /// The delay before the next recurrence, or `None` once the schedule is
    /// exhausted.
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        if self.schedule.limit.is_some_and(|limit| self.count >= limit) {
            return None;
        }
        let n = self.count;
        let delay = match &self.schedule.kind {
            Kind::Forever => Duration::ZERO,
            Kind::Spaced(interval) => *interval,
            Kind::Fixed(interval) => {
                let start = *self.start.get_or_insert(now);
                if interval.is_zero() {
                    Duration::ZERO
                } else {
                    let elapsed = now.saturating_duration_since(start).as_nanos();
                    let into_period = elapsed % interval.as_nanos();
                    *interval - Duration::from_nanos(into_period as u64)
                }
            }
            Kind::Exponential { base, factor } => {
                let exponent = i32::try_from(n).unwrap_or(i32::MAX);
                Duration::try_from_secs_f64(base.as_secs_f64() * factor.powi(exponent))
                    .unwrap_or(Duration::MAX)
            }
            Kind::Delays(delays) => *delays.get(n)?,
        };
        self.count += 1;
        Some(delay)
    }

    /// Number of recurrences handed out so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Start over from the first recurrence.
    pub fn reset(&mut self) {
        self.count = 0;
        self.start = None;
    }
}
