//! Cut-segment planning: mapping the requested keep-intervals onto
//! GOP-aligned copy regions and frame-aligned recode regions.
//!
//! A [`CutSegment`] either covers a whole GOP verbatim (`Copy`) or lies
//! strictly inside a single GOP and names the frames to re-encode (`Recode`).
//! The variant drives the match in the video cutter, so a planning bug is a
//! type error there rather than a silent miscut.

use crate::index::{Gop, MediaIndex};
use crate::time::Seconds;

/// Endpoints this close to the file boundaries are snapped outside them, so
/// floating-point jitter at 0 or at the duration cannot force a recode.
const EPSILON: (i64, i64) = (1, 1_000_000);

/// The GOP a segment is cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopRange {
	pub index: usize,
	pub start_dts: i64,
	pub end_dts: i64,
}

impl GopRange {
	fn new(index: usize, gop: &Gop) -> Self {
		Self {
			index,
			start_dts: gop.start_dts,
			end_dts: gop.end_dts,
		}
	}
}

/// One planned unit of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CutSegment {
	/// Copy the covered range bitstream-verbatim. `gop` is absent only on
	/// the video-less path.
	Copy {
		start: Seconds,
		end: Seconds,
		gop: Option<GopRange>,
	},
	/// Decode the GOP's fetch range and re-encode the frames whose PTS falls
	/// in `[start, end)`.
	Recode {
		start: Seconds,
		end: Seconds,
		gop: GopRange,
	},
}

impl CutSegment {
	pub fn start(&self) -> Seconds {
		match self {
			Self::Copy { start, .. } | Self::Recode { start, .. } => *start,
		}
	}

	pub fn end(&self) -> Seconds {
		match self {
			Self::Copy { end, .. } | Self::Recode { end, .. } => *end,
		}
	}

	pub fn duration(&self) -> Seconds {
		self.end() - self.start()
	}

	/// Force this segment through the recode path (full-recode export mode).
	pub fn into_recode(self) -> Self {
		match self {
			Self::Copy { start, end, gop: Some(gop) } => Self::Recode { start, end, gop },
			other => other,
		}
	}
}

/// Shift every interval into container time and snap endpoints at the file
/// boundaries to ±10 s outside them.
pub fn adjust_intervals(
	intervals: &[(Seconds, Seconds)],
	start_time: Seconds,
	duration: Seconds,
) -> Vec<(Seconds, Seconds)> {
	let epsilon = Seconds::new(EPSILON.0, EPSILON.1);
	intervals
		.iter()
		.map(|&(mut s, mut e)| {
			if s <= epsilon {
				s = Seconds::from_integer(-10);
			}
			if e >= duration - epsilon {
				e = duration + Seconds::from_integer(10);
			}
			(s + start_time, e + start_time)
		})
		.collect()
}

/// Plan the cut for `index`, walking the GOP table and the (adjusted,
/// ascending, disjoint) interval list together.
pub fn plan(index: &MediaIndex, intervals: &[(Seconds, Seconds)], keyframe_mode: bool) -> Vec<CutSegment> {
	match &index.video {
		Some(video) if !video.gops.is_empty() => {
			let file_end = index.start_time + index.duration + Seconds::new(1, 10_000);
			plan_video(&video.gops, file_end, intervals, keyframe_mode)
		}
		_ => {
			let Some(track) = index.audio.first() else { return Vec::new() };
			let (Some(first), Some(last)) = (track.first_time(), track.last_time()) else {
				return Vec::new();
			};
			plan_audio_only(first, last + Seconds::new(1, 10_000), intervals)
		}
	}
}

/// Video-less sources are sliced into copy segments of at most 19 s so the
/// driver still gets regular cancellation and progress points.
fn plan_audio_only(min_time: Seconds, max_time: Seconds, intervals: &[(Seconds, Seconds)]) -> Vec<CutSegment> {
	let nineteen = Seconds::from_integer(19);
	let twenty = Seconds::from_integer(20);

	let mut segments = Vec::new();
	for &(start, end) in intervals {
		let mut s = start.max(min_time);
		let e = end.min(max_time);
		while s + twenty < e {
			segments.push(CutSegment::Copy { start: s, end: s + nineteen, gop: None });
			s += nineteen;
		}
		if s < e {
			segments.push(CutSegment::Copy { start: s, end: e, gop: None });
		}
	}
	segments
}

fn plan_video(
	gops: &[Gop],
	file_end: Seconds,
	intervals: &[(Seconds, Seconds)],
	keyframe_mode: bool,
) -> Vec<CutSegment> {
	let mut segments = Vec::new();
	let mut p = 0;

	for (gop_index, gop) in gops.iter().enumerate() {
		let gop_start = gop.start_pts;
		let gop_end = gops.get(gop_index + 1).map(|g| g.start_pts).unwrap_or(file_end);
		let range = GopRange::new(gop_index, gop);

		while p < intervals.len() && intervals[p].1 <= gop_start {
			p += 1;
		}
		if p == intervals.len() || gop_end <= intervals[p].0 {
			// No overlap with any remaining interval.
			continue;
		}

		let (s, e) = intervals[p];
		if keyframe_mode || (gop_start >= s && gop_end <= e) {
			// The GOP is fully kept (or we only cut on keyframes).
			segments.push(CutSegment::Copy {
				start: gop_start,
				end: gop_end,
				gop: Some(range),
			});
			continue;
		}

		// Partial overlap: one or more recode segments clamped to the
		// overlap, all tagged with this GOP so the cutter can reuse a single
		// decoder pass over it.
		if gop_start > s {
			// The interval entered during an earlier GOP and ends inside
			// this one.
			segments.push(CutSegment::Recode { start: gop_start, end: e, gop: range });
			p += 1;
		}
		while p < intervals.len() && intervals[p].1 < gop_end {
			segments.push(CutSegment::Recode {
				start: intervals[p].0,
				end: intervals[p].1,
				gop: range,
			});
			p += 1;
		}
		if p < intervals.len() && intervals[p].0 < gop_end {
			// The interval continues past this GOP; the next GOP picks it up.
			segments.push(CutSegment::Recode {
				start: intervals[p].0,
				end: gop_end,
				gop: range,
			});
		}
	}

	debug_assert!(segments.iter().all(|s| s.start() < s.end()));
	segments
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::index::GopStartNal;

	fn secs(v: f64) -> Seconds {
		Seconds::approximate_float(v).unwrap()
	}

	/// GOPs every 2 s over a 10 s file, 500 DTS ticks per GOP.
	fn gop_table() -> Vec<Gop> {
		(0..5)
			.map(|i| Gop {
				start_pts: Seconds::from_integer(2 * i),
				start_dts: 500 * i,
				end_dts: 500 * i + 499,
				start_nal: GopStartNal::Unknown,
				has_rasl: false,
				leading_end_dts: None,
			})
			.collect()
	}

	fn file_end() -> Seconds {
		Seconds::from_integer(10) + Seconds::new(1, 10_000)
	}

	#[test]
	fn test_keyframe_aligned_interval_copies() {
		let segments = plan_video(&gop_table(), file_end(), &[(secs(2.0), secs(6.0))], false);
		assert_eq!(
			segments,
			vec![
				CutSegment::Copy {
					start: Seconds::from_integer(2),
					end: Seconds::from_integer(4),
					gop: Some(GopRange { index: 1, start_dts: 500, end_dts: 999 }),
				},
				CutSegment::Copy {
					start: Seconds::from_integer(4),
					end: Seconds::from_integer(6),
					gop: Some(GopRange { index: 2, start_dts: 1000, end_dts: 1499 }),
				},
			]
		);
	}

	#[test]
	fn test_mid_gop_interval_recodes_both_ends() {
		let segments = plan_video(&gop_table(), file_end(), &[(secs(2.5), secs(5.5))], false);
		assert_eq!(
			segments,
			vec![
				CutSegment::Recode {
					start: secs(2.5),
					end: Seconds::from_integer(4),
					gop: GopRange { index: 1, start_dts: 500, end_dts: 999 },
				},
				CutSegment::Recode {
					start: Seconds::from_integer(4),
					end: secs(5.5),
					gop: GopRange { index: 2, start_dts: 1000, end_dts: 1499 },
				},
			]
		);
	}

	#[test]
	fn test_interval_slightly_past_boundary_recodes_once() {
		// Starts 1 ms after the GOP boundary and ends mid-GOP: one recode.
		let segments = plan_video(&gop_table(), file_end(), &[(secs(2.001), secs(3.5))], false);
		assert_eq!(
			segments,
			vec![CutSegment::Recode {
				start: secs(2.001),
				end: secs(3.5),
				gop: GopRange { index: 1, start_dts: 500, end_dts: 999 },
			}]
		);
	}

	#[test]
	fn test_two_intervals_inside_one_gop_share_its_fetch_range() {
		let intervals = [(secs(2.2), secs(2.8)), (secs(3.0), secs(3.6))];
		let segments = plan_video(&gop_table(), file_end(), &intervals, false);
		let gop = GopRange { index: 1, start_dts: 500, end_dts: 999 };
		assert_eq!(
			segments,
			vec![
				CutSegment::Recode { start: secs(2.2), end: secs(2.8), gop },
				CutSegment::Recode { start: secs(3.0), end: secs(3.6), gop },
			]
		);
	}

	#[test]
	fn test_keyframe_mode_forces_whole_gop_copies() {
		let segments = plan_video(&gop_table(), file_end(), &[(secs(2.5), secs(5.5))], true);
		assert!(segments.iter().all(|s| matches!(s, CutSegment::Copy { .. })));
		assert_eq!(segments.len(), 2);
		assert_eq!(segments[0].start(), Seconds::from_integer(2));
		assert_eq!(segments[1].end(), Seconds::from_integer(6));
	}

	#[test]
	fn test_interval_covering_tail_copies_last_gop() {
		let segments = plan_video(&gop_table(), file_end(), &[(secs(8.0), secs(10.5))], false);
		assert_eq!(
			segments,
			vec![CutSegment::Copy {
				start: Seconds::from_integer(8),
				end: file_end(),
				gop: Some(GopRange { index: 4, start_dts: 2000, end_dts: 2499 }),
			}]
		);
	}

	#[test]
	fn test_disjoint_intervals_skip_uncovered_gops() {
		// Endpoints as they come back from adjust_intervals: the tail end is
		// already snapped past the file end.
		let intervals = [(secs(0.0), secs(2.0)), (secs(8.0), secs(20.0))];
		let segments = plan_video(&gop_table(), file_end(), &intervals, false);
		assert_eq!(segments.len(), 2);
		assert!(matches!(segments[0], CutSegment::Copy { gop: Some(GopRange { index: 0, .. }), .. }));
		assert!(matches!(segments[1], CutSegment::Copy { gop: Some(GopRange { index: 4, .. }), .. }));
	}

	#[test]
	fn test_audio_only_slices_to_nineteen_seconds() {
		let segments = plan_audio_only(
			Seconds::from_integer(0),
			Seconds::from_integer(60),
			&[(Seconds::from_integer(0), Seconds::from_integer(45))],
		);
		assert_eq!(
			segments.iter().map(|s| (s.start(), s.end())).collect::<Vec<_>>(),
			vec![
				(Seconds::from_integer(0), Seconds::from_integer(19)),
				(Seconds::from_integer(19), Seconds::from_integer(38)),
				(Seconds::from_integer(38), Seconds::from_integer(45)),
			]
		);
		assert!(segments.iter().all(|s| matches!(s, CutSegment::Copy { gop: None, .. })));
	}

	#[test]
	fn test_audio_only_clamps_to_track_range() {
		let segments = plan_audio_only(
			Seconds::from_integer(1),
			Seconds::from_integer(9),
			&[(Seconds::from_integer(-10), Seconds::from_integer(20))],
		);
		assert_eq!(segments.len(), 1);
		assert_eq!(segments[0].start(), Seconds::from_integer(1));
		assert_eq!(segments[0].end(), Seconds::from_integer(9));
	}

	#[test]
	fn test_adjust_intervals_snaps_boundaries() {
		let duration = Seconds::from_integer(10);
		let start_time = Seconds::new(1, 2);
		let adjusted = adjust_intervals(
			&[(Seconds::new(1, 2_000_000), secs(9.9999995)), (secs(3.0), secs(4.0))],
			start_time,
			duration,
		);

		// Both endpoints of the first interval sat within epsilon of the
		// file boundaries; they snap 10 s outside (then shift by start_time).
		assert_eq!(adjusted[0].0, Seconds::from_integer(-10) + start_time);
		assert_eq!(adjusted[0].1, duration + Seconds::from_integer(10) + start_time);
		// Interior endpoints only shift.
		assert_eq!(adjusted[1], (secs(3.0) + start_time, secs(4.0) + start_time));
	}

	#[test]
	fn test_into_recode() {
		let gop = GopRange { index: 0, start_dts: 0, end_dts: 10 };
		let copy = CutSegment::Copy { start: secs(0.0), end: secs(1.0), gop: Some(gop) };
		assert!(matches!(copy.into_recode(), CutSegment::Recode { .. }));

		let audio = CutSegment::Copy { start: secs(0.0), end: secs(1.0), gop: None };
		assert!(matches!(audio.into_recode(), CutSegment::Copy { .. }));
	}

	#[test]
	fn test_planning_is_deterministic() {
		let intervals = [(secs(1.3), secs(4.7)), (secs(6.1), secs(9.2))];
		let a = plan_video(&gop_table(), file_end(), &intervals, false);
		let b = plan_video(&gop_table(), file_end(), &intervals, false);
		assert_eq!(a, b);
	}
}
