use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A data rate expressed as bits per second(bps).
///
/// Internally the value is tracked as a floating point number for accuracy in the presence of
/// repeated calculations that can yield decimal values.
#[derive(Debug, Default, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Bitrate(f64);

impl Bitrate {
    /// No bits at all.
    pub const ZERO: Self = Self::new(0);

    /// A rate in bits per second.
    pub const fn new(bps: u64) -> Self {
        Bitrate(bps as f64)
    }

    /// Bits per second.
    pub const fn bps(bps: u64) -> Self {
        Self::new(bps)
    }

    /// Kilobits per second.
    pub const fn kbps(kbps: u64) -> Self {
        Self::new(kbps * 10_u64.pow(3))
    }

    /// Megabits per second.
    pub const fn mbps(mbps: u64) -> Self {
        Self::new(mbps * 10_u64.pow(6))
    }

    /// Gigabits per second.
    pub const fn gbps(gbps: u64) -> Self {
        Self::new(gbps * 10_u64.pow(9))
    }

    /// A rate given in bytes per second.
    pub const fn bytes_per_sec(bytes: u64) -> Self {
        Self::new(bytes * 8)
    }

    /// Bits per second.
    pub fn as_f64(&self) -> f64 {
        self.0
    }

    /// Bits per second, rounded up.
    pub fn as_u64(&self) -> u64 {
        self.0.ceil() as u64
    }

    /// Whether nothing is sent at this rate.
    pub fn is_zero(&self) -> bool {
        self.0 == 0.0
    }

    /// Whether this is a rate the pacer can work with, i.e. finite and not negative.
    pub fn is_valid(&self) -> bool {
        self.0.is_finite() && self.0 >= 0.0
    }

    /// Restrict the rate to `min..=max`.
    pub fn clamp(&self, min: Self, max: Self) -> Self {
        Self(self.0.clamp(min.0, max.0))
    }

    /// The larger of two rates.
    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }

    /// The smaller of two rates.
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }
}

impl From<u64> for Bitrate {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl From<f64> for Bitrate {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl Mul<Duration> for Bitrate {
    type Output = DataSize;

    fn mul(self, rhs: Duration) -> Self::Output {
        let bits = self.0 * rhs.as_secs_f64();
        let bytes = bits / 8.0;

        DataSize::bytes(bytes.round() as i64)
    }
}

impl Mul<f64> for Bitrate {
    type Output = Bitrate;

    fn mul(self, rhs: f64) -> Self::Output {
        Bitrate(self.0 * rhs)
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rate = self.0;
        let log = rate.log10().floor() as u64;

        match log {
            0..=2 => write!(f, "{rate}bit/s"),
            3..=5 => write!(f, "{:.3}kbit/s", rate / 10.0_f64.powf(3.0)),
            6..=8 => write!(f, "{:.3}Mbit/s", rate / 10.0_f64.powf(6.0)),
            9..=11 => write!(f, "{:.3}Gbit/s", rate / 10.0_f64.powf(9.0)),
            12.. => write!(f, "{:.3}Tbit/s", rate / 10.0_f64.powf(12.0)),
        }
    }
}

/// An amount of data in bytes.
///
/// Signed, since budgets are allowed to go into debt.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DataSize(i64);

impl DataSize {
    /// Nothing.
    pub const ZERO: Self = DataSize::bytes(0);

    /// A size in bytes.
    pub const fn bytes(bytes: i64) -> DataSize {
        Self(bytes)
    }

    /// Bytes, negative when in debt.
    pub fn as_bytes_i64(&self) -> i64 {
        self.0
    }

    /// Bytes as a float.
    pub fn as_bytes_f64(&self) -> f64 {
        self.0 as f64
    }

    /// Bytes as usize. Negative sizes are reported as 0.
    pub fn as_bytes_usize(&self) -> usize {
        self.0.max(0) as usize
    }

    /// Whether this is a debt.
    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Subtraction that stops at the numeric bounds.
    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl From<usize> for DataSize {
    fn from(value: usize) -> Self {
        Self(value as i64)
    }
}

impl From<u8> for DataSize {
    fn from(value: u8) -> Self {
        Self(value as i64)
    }
}

impl Div<Duration> for DataSize {
    type Output = Bitrate;

    fn div(self, rhs: Duration) -> Self::Output {
        let bytes = self.as_bytes_f64();

        let bps = (bytes * 8.0) / rhs.as_secs_f64();

        bps.into()
    }
}

impl Div<Bitrate> for DataSize {
    type Output = Duration;

    /// Time it takes to move this much data at the given rate.
    ///
    /// Negative sizes take no time, a zero rate takes forever ([`Duration::MAX`]).
    fn div(self, rhs: Bitrate) -> Self::Output {
        if self.0 <= 0 {
            return Duration::ZERO;
        }

        let bits = self.as_bytes_f64() * 8.0;
        let seconds = bits / rhs.as_f64();

        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }
}

impl Mul<i64> for DataSize {
    type Output = DataSize;

    fn mul(self, rhs: i64) -> Self::Output {
        Self(self.0 * rhs)
    }
}

impl AddAssign<DataSize> for DataSize {
    fn add_assign(&mut self, rhs: DataSize) {
        self.0 += rhs.0;
    }
}

impl SubAssign<DataSize> for DataSize {
    fn sub_assign(&mut self, rhs: DataSize) {
        self.0 -= rhs.0;
    }
}

impl Add<DataSize> for DataSize {
    type Output = DataSize;

    fn add(self, rhs: DataSize) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub<DataSize> for DataSize {
    type Output = DataSize;

    fn sub(self, rhs: DataSize) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl Neg for DataSize {
    type Output = DataSize;

    fn neg(self) -> Self::Output {
        Self(-self.0)
    }
}

impl Sum<DataSize> for DataSize {
    fn sum<I: Iterator<Item = DataSize>>(iter: I) -> Self {
        iter.fold(DataSize::ZERO, |acc, s| acc + s)
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.0 as f64;
        let sign = if size < 0.0 { "-" } else { "" };
        let abs = size.abs();
        let log = abs.log10().floor() as u64;

        match log {
            0..=2 => write!(f, "{size}B"),
            3..=5 => write!(f, "{sign}{:.3}kB", abs / 10.0_f64.powf(3.0)),
            6..=8 => write!(f, "{sign}{:.3}MB", abs / 10.0_f64.powf(6.0)),
            9..=11 => write!(f, "{sign}{:.3}GB", abs / 10.0_f64.powf(9.0)),
            12.. => write!(f, "{sign}{:.3}TB", abs / 10.0_f64.powf(12.0)),
        }
    }
}
