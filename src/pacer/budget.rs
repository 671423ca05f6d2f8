use std::time::Duration;

use super::macros::log_pacer_budget;
use crate::units::{Bitrate, DataSize};
use crate::util::ceil_micros;

/// Which of the pacer's budgets this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BudgetKind {
    Media,
    Padding,
}

impl BudgetKind {
    fn as_str(&self) -> &'static str {
        match self {
            BudgetKind::Media => "media",
            BudgetKind::Padding => "padding",
        }
    }
}

/// Bytes that may be sent right now.
///
/// Grows with elapsed time at the configured rate and shrinks by whatever is sent. The level
/// is capped above by `rate * burst_interval`. Sending a packet that is larger than the
/// remaining budget leaves a debt that is repaid by later accrual.
///
/// The padding budget is also charged for media it never allowed, so its debt is floored at
/// the size of the last packet. Media debt is not floored.
#[derive(Debug)]
pub(crate) struct Budget {
    kind: BudgetKind,
    rate: Bitrate,
    burst_interval: Duration,
    level: DataSize,
}

impl Budget {
    pub fn new(kind: BudgetKind, rate: Bitrate, burst_interval: Duration) -> Self {
        Budget {
            kind,
            rate,
            burst_interval,
            level: DataSize::ZERO,
        }
    }

    pub fn rate(&self) -> Bitrate {
        self.rate
    }

    /// Change the rate. Credit already accrued is kept, the new cap applies from the next
    /// accrual.
    pub fn set_rate(&mut self, rate: Bitrate) {
        assert!(rate.is_valid(), "budget rate must be valid: {rate:?}");
        self.rate = rate;
    }

    pub fn set_burst_interval(&mut self, burst_interval: Duration) {
        self.burst_interval = burst_interval;
    }

    /// Open the budget with the entire burst credit available.
    pub fn fill(&mut self) {
        self.level = self.cap(Duration::ZERO);
        log_pacer_budget!(self.level.as_bytes_i64(), self.kind.as_str());
    }

    /// Add credit for `elapsed` time.
    ///
    /// If packets were waiting throughout `elapsed` the credit for the full interval is kept
    /// even when it exceeds the burst cap. The packets were due, the pacer just didn't look.
    pub fn accrue(&mut self, elapsed: Duration, backlogged: bool) {
        if elapsed.is_zero() {
            return;
        }

        let catch_up = if backlogged { elapsed } else { Duration::ZERO };

        self.level += self.rate * elapsed;
        self.level = self.level.min(self.cap(catch_up));

        log_pacer_budget!(self.level.as_bytes_i64(), self.kind.as_str());
    }

    /// Whether a packet may start now.
    ///
    /// Any non-negative level allows a send, even if the packet is larger than the level. Once
    /// in debt, nothing starts until the debt is repaid.
    pub fn can_send(&self) -> bool {
        !self.level.is_negative() && !self.rate.is_zero()
    }

    pub fn consume(&mut self, size: DataSize) {
        self.level -= size;

        if self.kind == BudgetKind::Padding {
            self.level = self.level.max(-size);
        }

        log_pacer_budget!(self.level.as_bytes_i64(), self.kind.as_str());
    }

    pub fn level(&self) -> DataSize {
        self.level
    }

    /// Time until the level is back at zero, rounded up to whole microseconds.
    ///
    /// [`Duration::MAX`] if in debt with a zero rate.
    pub fn time_to_clear(&self) -> Duration {
        if !self.level.is_negative() {
            return Duration::ZERO;
        }

        ceil_micros(-self.level / self.rate)
    }

    fn cap(&self, catch_up: Duration) -> DataSize {
        self.rate * self.burst_interval.max(catch_up)
    }
}
