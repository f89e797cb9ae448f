use std::str::FromStr;

use splice::time::Seconds;

/// A `start-end` pair in seconds, parsed exactly (no float round-trip).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
	pub start: Seconds,
	pub end: Seconds,
}

impl FromStr for Interval {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (start, end) = s
			.split_once('-')
			.ok_or_else(|| format!("expected start-end, got {s:?}"))?;
		let start = parse_seconds(start)?;
		let end = parse_seconds(end)?;
		if end <= start {
			return Err(format!("empty interval: {s:?}"));
		}
		Ok(Self { start, end })
	}
}

/// Parse a decimal number of seconds into an exact rational.
fn parse_seconds(s: &str) -> Result<Seconds, String> {
	let s = s.trim();
	let bad = || format!("invalid time {s:?}");

	match s.split_once('.') {
		None => {
			let whole: i64 = s.parse().map_err(|_| bad())?;
			Ok(Seconds::from_integer(whole))
		}
		Some((whole, frac)) => {
			if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
				return Err(bad());
			}
			let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| bad())? };
			let digits: i64 = frac.parse().map_err(|_| bad())?;
			let scale = 10_i64.pow(frac.len() as u32);
			Ok(Seconds::from_integer(whole) + Seconds::new(digits, scale))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_whole_seconds() {
		let i: Interval = "2-6".parse().unwrap();
		assert_eq!(i.start, Seconds::from_integer(2));
		assert_eq!(i.end, Seconds::from_integer(6));
	}

	#[test]
	fn test_parse_decimal_seconds_exactly() {
		let i: Interval = "2.5-5.125".parse().unwrap();
		assert_eq!(i.start, Seconds::new(5, 2));
		assert_eq!(i.end, Seconds::new(41, 8));
	}

	#[test]
	fn test_parse_rejects_garbage() {
		assert!("5".parse::<Interval>().is_err());
		assert!("6-5".parse::<Interval>().is_err());
		assert!("a-b".parse::<Interval>().is_err());
		assert!("1.-2".parse::<Interval>().is_err());
	}
}
