use std::time::{Duration, Instant};

mod average;
pub(crate) use average::MovingAverage;

pub(crate) trait Soonest {
    fn soonest(self, other: Self) -> Self;
}

impl<T: Default> Soonest for (Option<Instant>, T) {
    fn soonest(self, other: Self) -> Self {
        match (self, other) {
            ((Some(v1), s1), (Some(v2), s2)) => {
                if v1 < v2 {
                    (Some(v1), s1)
                } else {
                    (Some(v2), s2)
                }
            }
            ((None, _), (None, _)) => (None, T::default()),
            ((None, _), (v, s)) => (v, s),
            ((v, s), (None, _)) => (v, s),
        }
    }
}

/// Round a duration up to the next whole microsecond.
///
/// Wakeups computed from a budget debt are rounded up so that the budget refresh at the
/// wakeup always covers the debt, despite byte rounding.
pub(crate) fn ceil_micros(d: Duration) -> Duration {
    if d == Duration::MAX {
        return d;
    }
    let micros = (d.as_nanos() + 999) / 1_000;
    Duration::from_micros(micros.min(u64::MAX as u128) as u64)
}
