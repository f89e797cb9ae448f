//! Subtitle passthrough.
//!
//! Selection is by start PTS only: a subtitle whose display starts inside the
//! kept range is emitted whole, one that starts before it is dropped. That
//! can show a line slightly longer than the cut would suggest, but never
//! breaks one in half.

use crate::ffmpeg;
use ffmpeg::Packet;

use super::StreamCutter;
use crate::index::SubtitleTrack;
use crate::plan::CutSegment;
use crate::time::Seconds;
use crate::Result;

pub struct SubtitleCutter<'a> {
	track: &'a SubtitleTrack,
	out_stream_index: usize,

	segment_start_in_output: Seconds,
	prev_pts: i64,
	/// Forward cursor into the packet table; one walk across all segments.
	cursor: usize,
}

impl<'a> SubtitleCutter<'a> {
	pub fn new(track: &'a SubtitleTrack, out_stream_index: usize) -> Self {
		Self {
			track,
			out_stream_index,
			segment_start_in_output: Seconds::from_integer(0),
			prev_pts: -100_000,
			cursor: 0,
		}
	}
}

impl StreamCutter for SubtitleCutter<'_> {
	fn segment(&mut self, segment: &CutSegment) -> Result<Vec<Packet>> {
		let in_tb = self.track.time_base;
		let segment_start_pts = (segment.start() / in_tb).to_integer();
		let segment_end_pts = (segment.end() / in_tb).to_integer();
		let offset = self.segment_start_in_output / in_tb;

		let mut packets = Vec::new();
		while self.cursor < self.track.packets.len() {
			let source = &self.track.packets[self.cursor];
			let Some(pts) = source.pts() else {
				self.cursor += 1;
				continue;
			};

			if pts < segment_start_pts {
				self.cursor += 1;
			} else if pts < segment_end_pts {
				self.cursor += 1;

				let mut packet = source.clone();
				packet.set_stream(self.out_stream_index);
				let mut new_pts = (Seconds::from_integer(pts - segment_start_pts) + offset).to_integer();
				if new_pts < self.prev_pts {
					tracing::warn!(pts = new_pts, prev = self.prev_pts, "bumping non-monotonic subtitle pts");
					new_pts = self.prev_pts + 1;
				}
				packet.set_pts(Some(new_pts));
				packet.set_dts(Some(new_pts));
				self.prev_pts = new_pts;
				packets.push(packet);
			} else {
				break;
			}
		}

		self.segment_start_in_output += segment.duration();
		Ok(packets)
	}

	fn finish(&mut self) -> Result<Vec<Packet>> {
		Ok(Vec::new())
	}
}
