use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Lossless conversion for the config's interval values; saturates on
/// durations chrono cannot represent.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::max_value())
}

/// Injectable time source.
///
/// Production code uses [Clock::system]. Tests use [Clock::manual], which
/// only moves when told to and additionally disables scheduling jitter so
/// that rescheduled timestamps are exact.
#[derive(Clone)]
pub enum Clock {
    System,
    Manual(Arc<Mutex<DateTime<Utc>>>),
}

impl Clock {
    pub fn system() -> Self {
        Clock::System
    }

    pub fn manual(start: DateTime<Utc>) -> Self {
        Clock::Manual(Arc::new(Mutex::new(start)))
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Manual(time) => *time.lock().unwrap(),
        }
    }

    /// Moves a manual clock forward. Panics on the system clock; only
    /// tests hold a manual clock.
    pub fn advance(&self, by: chrono::Duration) {
        match self {
            Clock::System => panic!("cannot advance the system clock"),
            Clock::Manual(time) => {
                let mut time = time.lock().unwrap();
                *time += by;
            }
        }
    }

    /// Applies ±10% jitter to a base duration, so that per-account and
    /// per-repo schedules drift apart instead of thundering in lockstep.
    pub fn jittered(&self, base: Duration) -> chrono::Duration {
        let spread = match self {
            Clock::System => {
                let factor = rand::thread_rng().gen_range(0.9..1.1);
                base.mul_f64(factor)
            }
            Clock::Manual(_) => base,
        };
        chrono::Duration::from_std(spread).unwrap_or_else(|_| chrono::Duration::max_value())
    }

    /// `now() + jitter(base)`, the standard way every job computes the
    /// next-run timestamp it writes back to the database.
    pub fn next_run(&self, base: Duration) -> DateTime<Utc> {
        self.now() + self.jittered(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = Clock::manual("2025-01-01T00:00:00Z".parse().unwrap());
        let start = clock.now();
        clock.advance(chrono::Duration::hours(8));
        assert_eq!(clock.now() - start, chrono::Duration::hours(8));
    }

    #[test]
    fn manual_clock_has_no_jitter() {
        let clock = Clock::manual("2025-01-01T00:00:00Z".parse().unwrap());
        assert_eq!(
            clock.jittered(Duration::from_secs(3600)),
            chrono::Duration::hours(1),
        );
        assert_eq!(
            clock.next_run(Duration::from_secs(3600)),
            clock.now() + chrono::Duration::hours(1),
        );
    }

    #[test]
    fn system_jitter_stays_within_bounds() {
        let clock = Clock::system();
        let base = Duration::from_secs(3600);
        for _ in 0..1000 {
            let jittered = clock.jittered(base);
            assert!(jittered >= chrono::Duration::seconds(3240));
            assert!(jittered < chrono::Duration::seconds(3960));
        }
    }
}
