// src/scheduler.rs
//
// Absolute-deadline pacing shared by the control loop and the policy threads.
//
// The next deadline is always `previous deadline + period`, never `now + period`.
// A slow iteration therefore does not shift the schedule, and it is not
// compensated by skipping ahead either: the following waits return immediately
// until wall-clock time has caught up with the schedule.

use std::time::{Duration, Instant};

/// Overruns are reported on the first occurrence and then every N-th one.
pub const OVERRUN_REPORT_EVERY: u64 = 100;

/// Outcome of reaching one deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// The iteration finished early; sleep this long.
    Sleep(Duration),
    /// The iteration finished after its deadline by this much.
    Late(Duration),
}

#[derive(Debug, Clone)]
pub struct DeadlineSchedule {
    period: Duration,
    next_deadline: Instant,
    overruns: u64,
}

impl DeadlineSchedule {
    /// Start a schedule whose first deadline is `start + period`.
    pub fn new(start: Instant, period: Duration) -> Self {
        let period = period.max(Duration::from_micros(1));
        Self {
            period,
            next_deadline: start + period,
            overruns: 0,
        }
    }

    /// Convenience constructor from a period in seconds.
    pub fn from_secs_f64(start: Instant, period_s: f64) -> Self {
        Self::new(start, Duration::from_secs_f64(period_s.max(0.0)))
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn next_deadline(&self) -> Instant {
        self.next_deadline
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Account for reaching the current deadline at `now` and advance by one period.
    pub fn mark(&mut self, now: Instant) -> Pace {
        let deadline = self.next_deadline;
        self.next_deadline += self.period;
        if now <= deadline {
            Pace::Sleep(deadline - now)
        } else {
            self.overruns += 1;
            Pace::Late(now - deadline)
        }
    }

    /// Block until the current deadline, then advance.
    pub fn wait(&mut self) -> Pace {
        let pace = self.mark(Instant::now());
        if let Pace::Sleep(remaining) = pace {
            if !remaining.is_zero() {
                std::thread::sleep(remaining);
            }
        }
        pace
    }

    /// Whether the latest overrun should be surfaced in the log.
    pub fn should_report_overrun(&self) -> bool {
        self.overruns == 1 || (self.overruns > 0 && self.overruns % OVERRUN_REPORT_EVERY == 0)
    }
}
