//! Exact rational time.
//!
//! All durations and timestamps exchanged across component boundaries are
//! exact rationals in seconds. Encoded timestamps are integer multiples of a
//! per-stream time base; conversions round once, at the boundary.

use num_rational::Rational64;

use crate::ffmpeg;

/// Container-level time unit: timestamps reported by the format layer are in
/// microseconds.
pub const AV_TIME_BASE: i64 = 1_000_000;

/// A point in time or a duration, in seconds.
pub type Seconds = Rational64;

/// Convert a stream time base into an exact rational.
pub fn time_base(tb: ffmpeg::Rational) -> Seconds {
	Seconds::new(tb.numerator() as i64, tb.denominator().max(1) as i64)
}

/// Convert an exact rational back into the library's rational type.
pub fn to_rational(tb: Seconds) -> ffmpeg::Rational {
	ffmpeg::Rational::new(*tb.numer() as i32, *tb.denom() as i32)
}

/// Convert seconds into integer ticks of the given time base, rounding to the
/// nearest tick.
pub fn to_ticks(t: Seconds, tb: Seconds) -> i64 {
	(t / tb).round().to_integer()
}

/// Convert integer ticks of the given time base into seconds.
pub fn from_ticks(ticks: i64, tb: Seconds) -> Seconds {
	Seconds::from_integer(ticks) * tb
}

/// Seconds from a container-level (microsecond) timestamp.
pub fn from_av_time(ts: i64) -> Seconds {
	Seconds::new(ts, AV_TIME_BASE)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_tick_round_trip() {
		let tb = Seconds::new(1, 90_000);
		let t = Seconds::new(7, 2); // 3.5s
		let ticks = to_ticks(t, tb);
		assert_eq!(ticks, 315_000);
		assert_eq!(from_ticks(ticks, tb), t);
	}

	#[test]
	fn test_to_ticks_rounds_to_nearest() {
		let tb = Seconds::new(1, 1000);
		// 1.0004s is closer to tick 1000 than 1001
		assert_eq!(to_ticks(Seconds::new(10004, 10000), tb), 1000);
		// 1.0006s is closer to tick 1001
		assert_eq!(to_ticks(Seconds::new(10006, 10000), tb), 1001);
	}

	#[test]
	fn test_from_av_time() {
		assert_eq!(from_av_time(2_500_000), Seconds::new(5, 2));
	}
}
