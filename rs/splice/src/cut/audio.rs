//! Passthrough audio: select source packets by PTS range, shift timestamps
//! into the output timeline, enforce monotonicity.

use crate::ffmpeg;
use ffmpeg::Packet;

use super::StreamCutter;
use crate::index::AudioTrack;
use crate::plan::CutSegment;
use crate::time::Seconds;
use crate::Result;

/// Initial sentinel low enough that any real first timestamp passes the
/// monotonicity check.
const INITIAL_PREV_TS: i64 = -100_000;

pub struct PassthruAudioCutter<'a> {
	track: &'a AudioTrack,
	out_stream_index: usize,
	out_time_base: Seconds,

	segment_start_in_output: Seconds,
	prev_pts: i64,
	prev_dts: i64,
}

impl<'a> PassthruAudioCutter<'a> {
	pub fn new(track: &'a AudioTrack, out_stream_index: usize, out_time_base: Seconds) -> Self {
		Self {
			track,
			out_stream_index,
			out_time_base,
			segment_start_in_output: Seconds::from_integer(0),
			prev_pts: INITIAL_PREV_TS,
			prev_dts: INITIAL_PREV_TS,
		}
	}

	/// Rescale a native timestamp into the output time base and shift it by
	/// the output offset, truncating the sum toward zero once.
	fn rebase(&self, ts: i64, offset: Seconds) -> i64 {
		(Seconds::from_integer(ts) * self.track.time_base / self.out_time_base + offset).to_integer()
	}
}

impl StreamCutter for PassthruAudioCutter<'_> {
	fn segment(&mut self, segment: &CutSegment) -> Result<Vec<Packet>> {
		let in_tb = self.track.time_base;
		let start = if segment.start() <= Seconds::from_integer(0) {
			0
		} else {
			let start_pts = (segment.start() / in_tb).round().to_integer();
			self.track.packet_pts.partition_point(|&pts| pts < start_pts)
		};
		let end_pts = (segment.end() / in_tb).round().to_integer();
		let end = self.track.packet_pts.partition_point(|&pts| pts < end_pts);

		let offset = (self.segment_start_in_output - segment.start()) / self.out_time_base;

		let mut packets = Vec::with_capacity(end.saturating_sub(start));
		for source in &self.track.packets[start..end] {
			let (Some(pts), Some(dts)) = (source.pts(), source.dts()) else {
				continue;
			};

			let mut packet = source.clone();
			packet.set_stream(self.out_stream_index);
			let mut pts = self.rebase(pts, offset);
			let mut dts = self.rebase(dts, offset);

			if pts <= self.prev_pts {
				tracing::debug!(pts, prev = self.prev_pts, "bumping non-monotonic audio pts");
				pts = self.prev_pts + 1;
			}
			if dts <= self.prev_dts {
				tracing::debug!(dts, prev = self.prev_dts, "bumping non-monotonic audio dts");
				dts = self.prev_dts + 1;
			}
			packet.set_pts(Some(pts));
			packet.set_dts(Some(dts));
			self.prev_pts = pts;
			self.prev_dts = dts;
			packets.push(packet);
		}

		self.segment_start_in_output += segment.duration();
		Ok(packets)
	}

	fn finish(&mut self) -> Result<Vec<Packet>> {
		Ok(Vec::new())
	}
}
