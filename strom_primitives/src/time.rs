//! Time keeping in the 108 MHz tick base used throughout the streaming graph.
//!
//! Stream time and system time are two monotone clocks measured in the same
//! tick unit; their difference is the per-input "offset" the streaming clock
//! reconciles during playback.

use std::{cmp, fmt, ops};

/// How many ticks fit in one second
pub const TICKS_PER_SECOND: i64 = 108_000_000;
/// How many ticks fit in one millisecond
pub const TICKS_PER_MILLISEC: i64 = 108_000;
/// How many ticks fit in one microsecond
pub const TICKS_PER_MICROSEC: i64 = 108;

/// A point on one of the two 108 MHz clocks (stream time or system time).
///
/// The value is signed so that offset arithmetic close to zero cannot wrap.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde_derive", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamTime {
    ticks: i64,
}

/// A signed span between two [`StreamTime`] values.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde_derive", derive(serde::Serialize, serde::Deserialize))]
pub struct TickDuration {
    ticks: i64,
}

/// Signed 16.16 fixed point playback speed multiplier.
///
/// `0x10000` is 1x playback. The sign of the raw value is the streaming
/// direction; zero means paused.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde_derive", derive(serde::Serialize, serde::Deserialize))]
pub struct Speed(pub i32);

impl StreamTime {
    /// Time zero on either clock
    pub const ZERO: Self = Self { ticks: 0 };

    pub const fn from_ticks(ticks: i64) -> Self {
        Self { ticks }
    }
    pub const fn from_millis(millis: i64) -> Self {
        Self {
            ticks: millis * TICKS_PER_MILLISEC,
        }
    }
    pub const fn from_secs(secs: i64) -> Self {
        Self {
            ticks: secs * TICKS_PER_SECOND,
        }
    }
    pub const fn ticks(self) -> i64 {
        self.ticks
    }
    pub const fn as_millis(self) -> i64 {
        self.ticks / TICKS_PER_MILLISEC
    }

    /// Scale this time by a 16.16 speed factor, saturating on overflow.
    ///
    /// Used wherever a render-clock time has to be mapped into stream time
    /// under non-unity playback speed.
    #[must_use]
    pub fn fract_mul(self, speed: Speed) -> Self {
        Self {
            ticks: fract_mul_i64(self.ticks, speed.0),
        }
    }
}

impl TickDuration {
    /// The empty span
    pub const ZERO: Self = Self { ticks: 0 };
    /// The largest representable span, used as a saturation rail.
    pub const MAX: Self = Self { ticks: i64::MAX };

    pub const fn from_ticks(ticks: i64) -> Self {
        Self { ticks }
    }
    pub const fn from_millis(millis: i64) -> Self {
        Self {
            ticks: millis * TICKS_PER_MILLISEC,
        }
    }
    pub const fn from_secs(secs: i64) -> Self {
        Self {
            ticks: secs * TICKS_PER_SECOND,
        }
    }
    pub const fn ticks(self) -> i64 {
        self.ticks
    }
    pub const fn as_millis(self) -> i64 {
        self.ticks / TICKS_PER_MILLISEC
    }
    pub const fn as_secs(self) -> i64 {
        self.ticks / TICKS_PER_SECOND
    }
    pub const fn is_negative(self) -> bool {
        self.ticks < 0
    }
    #[must_use]
    pub const fn abs(self) -> Self {
        Self {
            ticks: self.ticks.abs(),
        }
    }

    /// Scale this duration by a 16.16 speed factor, saturating on overflow.
    #[must_use]
    pub fn fract_mul(self, speed: Speed) -> Self {
        Self {
            ticks: fract_mul_i64(self.ticks, speed.0),
        }
    }

    /// Divide this duration by a 16.16 speed factor, saturating on overflow
    /// and rounding towards zero. A zero speed saturates.
    #[must_use]
    pub fn fract_div(self, speed: Speed) -> Self {
        if speed.0 == 0 {
            return if self.ticks < 0 {
                Self { ticks: i64::MIN }
            } else {
                Self { ticks: i64::MAX }
            };
        }
        let wide = (self.ticks as i128) << 16;
        let ticks = wide / speed.0 as i128;
        Self {
            ticks: clamp_i128(ticks),
        }
    }

    /// Number of whole frames of length `frame` that fit into this span.
    ///
    /// The result is truncated towards zero; callers that need the
    /// round-up behaviour of the startup rendezvous add one themselves.
    pub fn frames(self, frame: TickDuration) -> i64 {
        debug_assert!(frame.ticks > 0);
        self.ticks / frame.ticks
    }
}

impl Speed {
    /// 1x forward playback
    pub const UNITY: Self = Self(0x10000);
    /// Paused
    pub const ZERO: Self = Self(0);

    pub const fn raw(self) -> i32 {
        self.0
    }
    pub const fn is_forward(self) -> bool {
        self.0 >= 0
    }
    /// Sign of the speed: `1`, `-1`, or `0` when paused.
    pub const fn direction(self) -> i32 {
        self.0.signum()
    }
}

fn clamp_i128(v: i128) -> i64 {
    if v > i64::MAX as i128 {
        i64::MAX
    } else if v < i64::MIN as i128 {
        i64::MIN
    } else {
        v as i64
    }
}

/// `(value * fract) >> 16` in 128-bit intermediate precision, saturated.
fn fract_mul_i64(value: i64, fract: i32) -> i64 {
    clamp_i128((value as i128 * fract as i128) >> 16)
}

impl PartialOrd for StreamTime {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for StreamTime {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.ticks.cmp(&other.ticks)
    }
}
impl PartialOrd for TickDuration {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TickDuration {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.ticks.cmp(&other.ticks)
    }
}

impl ops::Sub<StreamTime> for StreamTime {
    type Output = TickDuration;

    fn sub(self, rhs: StreamTime) -> TickDuration {
        TickDuration {
            ticks: self.ticks.saturating_sub(rhs.ticks),
        }
    }
}
impl ops::Add<TickDuration> for StreamTime {
    type Output = StreamTime;

    fn add(self, rhs: TickDuration) -> StreamTime {
        StreamTime {
            ticks: self.ticks.saturating_add(rhs.ticks),
        }
    }
}
impl ops::Sub<TickDuration> for StreamTime {
    type Output = StreamTime;

    fn sub(self, rhs: TickDuration) -> StreamTime {
        StreamTime {
            ticks: self.ticks.saturating_sub(rhs.ticks),
        }
    }
}
impl ops::AddAssign<TickDuration> for StreamTime {
    fn add_assign(&mut self, rhs: TickDuration) {
        *self = *self + rhs;
    }
}
impl ops::SubAssign<TickDuration> for StreamTime {
    fn sub_assign(&mut self, rhs: TickDuration) {
        *self = *self - rhs;
    }
}

impl ops::Add<TickDuration> for TickDuration {
    type Output = TickDuration;

    fn add(self, rhs: TickDuration) -> TickDuration {
        TickDuration {
            ticks: self.ticks.saturating_add(rhs.ticks),
        }
    }
}
impl ops::Sub<TickDuration> for TickDuration {
    type Output = TickDuration;

    fn sub(self, rhs: TickDuration) -> TickDuration {
        TickDuration {
            ticks: self.ticks.saturating_sub(rhs.ticks),
        }
    }
}
impl ops::AddAssign<TickDuration> for TickDuration {
    fn add_assign(&mut self, rhs: TickDuration) {
        *self = *self + rhs;
    }
}
impl ops::SubAssign<TickDuration> for TickDuration {
    fn sub_assign(&mut self, rhs: TickDuration) {
        *self = *self - rhs;
    }
}
impl ops::Neg for TickDuration {
    type Output = TickDuration;

    fn neg(self) -> TickDuration {
        TickDuration {
            ticks: self.ticks.saturating_neg(),
        }
    }
}
impl ops::Mul<i64> for TickDuration {
    type Output = TickDuration;

    fn mul(self, rhs: i64) -> TickDuration {
        TickDuration {
            ticks: self.ticks.saturating_mul(rhs),
        }
    }
}
impl ops::Mul<u32> for TickDuration {
    type Output = TickDuration;

    fn mul(self, rhs: u32) -> TickDuration {
        self * rhs as i64
    }
}
impl ops::Div<TickDuration> for TickDuration {
    type Output = i64;

    fn div(self, rhs: TickDuration) -> i64 {
        self.ticks / rhs.ticks
    }
}

impl fmt::Display for StreamTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.as_millis())
    }
}
impl fmt::Display for TickDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.as_millis())
    }
}
impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}x", self.0 as f64 / 65536.0)
    }
}
