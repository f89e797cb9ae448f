//! The media index: everything the planner and cutters need to know about a
//! source file, built eagerly in one demux pass and immutable afterwards.
//!
//! The index records the sorted video frame-PTS array, the GOP table, and the
//! full audio/subtitle packet tables. Compressed audio and subtitles are small
//! relative to video and are kept resident; video packets are never stored,
//! they flow through the cutter on demand.
//!
//! GOP boundaries come from the demuxer's keyframe flag *filtered* by
//! bitstream-level NAL classification (see [`crate::nal`]): a keyframe whose
//! packet carries only parameter sets, or an unsafe recovery point, is not a
//! usable cut entry.

use std::path::{Path, PathBuf};

use crate::ffmpeg;
use ffmpeg::format;
use ffmpeg::media;
use ffmpeg::Packet;

use crate::ffi;
use crate::nal;
use crate::time::{self, Seconds};
use crate::{CutError, Result};

/// Sentinel for packets the demuxer hands us without a DTS.
pub(crate) const NO_DTS: i64 = -100_000_000;

/// The NAL type recorded for the first picture of a GOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GopStartNal {
	/// Classification failed or the codec is not H.264/H.265.
	Unknown,
	/// The classified NAL unit type.
	Known(u8),
	/// The keyframe packet carried only parameter sets; the picture type is
	/// resolved by the look-ahead pass and must not survive `open`.
	Deferred,
}

impl GopStartNal {
	pub fn value(&self) -> Option<u8> {
		match self {
			Self::Known(t) => Some(*t),
			_ => None,
		}
	}
}

/// One group of pictures, i.e. one usable cut entry and everything up to the
/// next one.
#[derive(Debug, Clone)]
pub struct Gop {
	/// Smallest PTS in the GOP, in absolute seconds. With leading pictures
	/// this is *not* the random-access picture's own PTS.
	pub start_pts: Seconds,
	/// DTS of the first packet, for demuxing.
	pub start_dts: i64,
	/// DTS of the last packet (inclusive).
	pub end_dts: i64,
	/// NAL type of the first picture at the GOP start.
	pub start_nal: GopStartNal,
	/// Whether any RASL picture appears in this GOP.
	pub has_rasl: bool,
	/// Largest DTS of any leading (RASL or RADL) picture, when present.
	pub leading_end_dts: Option<i64>,
}

/// Index of the (first) video stream.
pub struct VideoIndex {
	pub stream_index: usize,
	pub time_base: Seconds,
	pub codec: ffmpeg::codec::Id,
	pub parameters: ffmpeg::codec::Parameters,
	pub metadata: Vec<(String, String)>,
	pub disposition: i32,
	pub avg_frame_rate: ffmpeg::Rational,
	/// Every frame PTS, in absolute seconds, sorted ascending.
	pub frame_times: Vec<Seconds>,
	pub gops: Vec<Gop>,
}

impl VideoIndex {
	/// The stream time base as the library's rational type.
	pub fn time_base_q(&self) -> ffmpeg::Rational {
		ffmpeg::Rational::new(*self.time_base.numer() as i32, *self.time_base.denom() as i32)
	}
}

/// One audio stream with its complete packet table.
pub struct AudioTrack {
	pub stream_index: usize,
	pub time_base: Seconds,
	pub parameters: ffmpeg::codec::Parameters,
	pub metadata: Vec<(String, String)>,
	pub disposition: i32,
	pub packets: Vec<Packet>,
	/// PTS of each packet, parallel to `packets`, in stream time base.
	pub packet_pts: Vec<i64>,
}

impl AudioTrack {
	/// PTS of the first packet, in seconds.
	pub fn first_time(&self) -> Option<Seconds> {
		self.packet_pts.first().map(|&pts| time::from_ticks(pts, self.time_base))
	}

	/// PTS of the last packet, in seconds.
	pub fn last_time(&self) -> Option<Seconds> {
		self.packet_pts.last().map(|&pts| time::from_ticks(pts, self.time_base))
	}
}

/// One subtitle stream with its complete packet table.
pub struct SubtitleTrack {
	pub stream_index: usize,
	pub time_base: Seconds,
	pub parameters: ffmpeg::codec::Parameters,
	pub metadata: Vec<(String, String)>,
	pub disposition: i32,
	pub packets: Vec<Packet>,
}

/// Streams the output may carry verbatim (Matroska attachments).
pub struct AttachmentStream {
	pub stream_index: usize,
	pub parameters: ffmpeg::codec::Parameters,
	pub metadata: Vec<(String, String)>,
	pub disposition: i32,
}

pub struct MediaIndex {
	pub path: PathBuf,
	pub start_time: Seconds,
	pub duration: Seconds,
	pub video: Option<VideoIndex>,
	pub audio: Vec<AudioTrack>,
	pub subtitles: Vec<SubtitleTrack>,
	pub attachments: Vec<AttachmentStream>,
}

impl MediaIndex {
	/// Open `path` and build the full index.
	///
	/// The source is opened twice: one handle is dedicated to audio packet
	/// loading so later seeks on the video handle cannot perturb the audio
	/// packet order.
	pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
		ffmpeg::init()?;
		let path = path.as_ref().to_path_buf();

		let mut input = format::input(&path)
			.map_err(|e| CutError::InvalidInput(format!("cannot open {}: {e}", path.display())))?;
		let mut audio_input = format::input(&path)
			.map_err(|e| CutError::InvalidInput(format!("cannot open {}: {e}", path.display())))?;

		let start_time = ffi::container_start_time(&input).map(time::from_av_time).unwrap_or_default();
		let known_duration = ffi::container_duration(&input).map(time::from_av_time);
		let mut duration = known_duration.unwrap_or_default();

		let mut index = Self {
			path,
			start_time,
			duration,
			video: None,
			audio: Vec::new(),
			subtitles: Vec::new(),
			attachments: Vec::new(),
		};

		let mut video_stream = None;
		for stream in input.streams() {
			let params = stream.parameters();
			match params.medium() {
				media::Type::Video if video_stream.is_none() => {
					video_stream = Some(stream.index());
					index.video = Some(VideoIndex {
						stream_index: stream.index(),
						time_base: time::time_base(stream.time_base()),
						codec: params.id(),
						parameters: params.clone(),
						metadata: dictionary_pairs(&stream.metadata()),
						disposition: stream.disposition().bits(),
						avg_frame_rate: stream.avg_frame_rate(),
						frame_times: Vec::new(),
						gops: Vec::new(),
					});
				}
				media::Type::Audio => index.audio.push(AudioTrack {
					stream_index: stream.index(),
					time_base: time::time_base(stream.time_base()),
					parameters: params.clone(),
					metadata: dictionary_pairs(&stream.metadata()),
					disposition: stream.disposition().bits(),
					packets: Vec::new(),
					packet_pts: Vec::new(),
				}),
				media::Type::Subtitle => index.subtitles.push(SubtitleTrack {
					stream_index: stream.index(),
					time_base: time::time_base(stream.time_base()),
					parameters: params.clone(),
					metadata: dictionary_pairs(&stream.metadata()),
					disposition: stream.disposition().bits(),
					packets: Vec::new(),
				}),
				media::Type::Attachment => index.attachments.push(AttachmentStream {
					stream_index: stream.index(),
					parameters: params.clone(),
					metadata: dictionary_pairs(&stream.metadata()),
					disposition: stream.disposition().bits(),
				}),
				_ => tracing::debug!(stream = stream.index(), "ignoring stream"),
			}
		}

		if index.video.is_none() && index.audio.is_empty() {
			return Err(CutError::InvalidInput("source has no video and no audio streams".into()));
		}

		let manual_duration = known_duration.is_none();

		// Main pass: video frame times, GOP boundaries, subtitle packets.
		let mut scan = GopScan::default();
		for (stream, packet) in input.packets() {
			let Some(pts) = packet.pts() else { continue };
			if manual_duration {
				let tb = time::time_base(stream.time_base());
				duration = duration.max(time::from_ticks(pts + packet.duration().max(0), tb));
			}

			if Some(stream.index()) == video_stream {
				let video = index.video.as_mut().unwrap();
				scan.push(video, &packet);
			} else if let Some(track) = index.subtitles.iter_mut().find(|t| t.stream_index == stream.index()) {
				track.packets.push(packet);
			}
		}

		// Dedicated audio pass.
		for (stream, packet) in audio_input.packets() {
			let Some(pts) = packet.pts() else { continue };
			if manual_duration {
				let tb = time::time_base(stream.time_base());
				duration = duration.max(time::from_ticks(pts + packet.duration().max(0), tb));
			}
			if let Some(track) = index.audio.iter_mut().find(|t| t.stream_index == stream.index()) {
				track.packet_pts.push(pts);
				track.packets.push(packet);
			}
		}

		index.duration = duration;

		if let Some(video) = index.video.as_mut() {
			scan.finish(video);
			tracing::debug!(
				frames = video.frame_times.len(),
				gops = video.gops.len(),
				codec = ?video.codec,
				"built video index"
			);

			if video.codec == ffmpeg::codec::Id::HEVC {
				index.resolve_deferred_start_nals()?;
				index.scan_leading_pictures()?;
			}
		}

		Ok(index)
	}

	/// The PTS (in seconds relative to the file start) of the frame nearest
	/// to `t`, clamped to `[first_frame, duration]`.
	pub fn next_frame_time(&self, t: Seconds) -> Seconds {
		let Some(video) = &self.video else { return t };
		let times = &video.frame_times;
		if times.is_empty() {
			return t;
		}

		let target = t + self.start_time;
		let idx = times.partition_point(|&x| x < target);
		if idx == times.len() {
			return self.duration;
		}
		if idx == 0 {
			return times[0] - self.start_time;
		}

		let prev = times[idx - 1];
		let next = times[idx];
		if target - prev <= next - target {
			prev - self.start_time
		} else {
			next - self.start_time
		}
	}

	/// Look-ahead pass for H.265 GOPs whose keyframe packet carried only
	/// parameter sets: scan forward within the GOP for the first picture NAL
	/// (type <= 21) and record it.
	fn resolve_deferred_start_nals(&mut self) -> Result<()> {
		let path = self.path.clone();
		let video = self.video.as_mut().unwrap();
		if !video.gops.iter().any(|g| g.start_nal == GopStartNal::Deferred) {
			return Ok(());
		}

		let mut input = format::input(&path)?;
		let stream_index = video.stream_index;
		let mut remaining = video.gops.iter().filter(|g| g.start_nal == GopStartNal::Deferred).count();
		let mut cursor = GopCursor::default();

		for (stream, packet) in input.packets() {
			if stream.index() != stream_index || packet.pts().is_none() {
				continue;
			}
			let Some(dts) = packet.dts() else { continue };
			let Some(gop) = cursor.advance(&video.gops, dts) else { continue };

			// Skip the GOP-start packet itself; the picture comes later.
			if video.gops[gop].start_nal != GopStartNal::Deferred || dts <= video.gops[gop].start_dts {
				continue;
			}

			let nal_type = packet.data().and_then(nal::h265_nal_unit_type);
			if let Some(t) = nal_type.filter(|&t| t <= 21) {
				video.gops[gop].start_nal = GopStartNal::Known(t);
				remaining -= 1;
				if remaining == 0 {
					break;
				}
			}
		}

		// Anything still unresolved is downgraded with a warning rather than
		// failing the whole index.
		for (i, gop) in video.gops.iter_mut().enumerate() {
			if gop.start_nal == GopStartNal::Deferred {
				tracing::warn!(gop = i, "no picture NAL found after parameter-set keyframe");
				gop.start_nal = GopStartNal::Unknown;
			}
		}

		Ok(())
	}

	/// Leading-pictures pass (H.265 only): classify every packet per GOP,
	/// set `has_rasl`, and record the DTS where leading pictures end.
	fn scan_leading_pictures(&mut self) -> Result<()> {
		let path = self.path.clone();
		let video = self.video.as_mut().unwrap();
		let mut input = format::input(&path)?;
		let stream_index = video.stream_index;
		let mut cursor = GopCursor::default();

		for (stream, packet) in input.packets() {
			if stream.index() != stream_index || packet.pts().is_none() {
				continue;
			}
			let Some(dts) = packet.dts() else { continue };
			let Some(gop) = cursor.advance(&video.gops, dts) else { continue };

			let nal_type = packet.data().and_then(nal::h265_nal_unit_type);
			if nal::is_rasl(nal_type) {
				video.gops[gop].has_rasl = true;
			}
			if nal::is_leading_picture(nal_type) {
				let end = video.gops[gop].leading_end_dts.get_or_insert(dts);
				*end = (*end).max(dts);
			}
		}

		let rasl_gops = video.gops.iter().filter(|g| g.has_rasl).count();
		if rasl_gops > 0 {
			tracing::debug!(gops = rasl_gops, "found GOPs with RASL leading pictures");
		}

		Ok(())
	}
}

fn dictionary_pairs(dict: &ffmpeg::DictionaryRef) -> Vec<(String, String)> {
	dict.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Walks the GOP table alongside a demux pass, keyed on packet DTS.
#[derive(Default)]
struct GopCursor {
	current: usize,
}

impl GopCursor {
	fn advance(&mut self, gops: &[Gop], dts: i64) -> Option<usize> {
		if gops.is_empty() {
			return None;
		}
		while self.current + 1 < gops.len() && dts >= gops[self.current + 1].start_dts {
			self.current += 1;
		}
		Some(self.current)
	}
}

/// Accumulates frame PTSs and GOP boundaries during the main demux pass.
#[derive(Default)]
struct GopScan {
	frame_pts: Vec<i64>,
	keyframe_indices: Vec<usize>,
	start_dts: Vec<i64>,
	end_dts: Vec<i64>,
	start_nals: Vec<GopStartNal>,
	last_seen_dts: Option<i64>,
	seen_keyframe: bool,
}

impl GopScan {
	fn push(&mut self, video: &VideoIndex, packet: &Packet) {
		if packet.is_key() {
			let nal_type = match video.codec {
				ffmpeg::codec::Id::H264 => packet.data().and_then(nal::h264_nal_unit_type),
				ffmpeg::codec::Id::HEVC => packet.data().and_then(nal::h265_nal_unit_type),
				_ => None,
			};

			// The very first keyframe is always a usable entry no matter what
			// its packet looks like; rejecting it would leave no way in.
			let accept = if !self.seen_keyframe {
				self.seen_keyframe = true;
				true
			} else {
				match video.codec {
					ffmpeg::codec::Id::H264 => nal::is_safe_h264_keyframe(nal_type),
					ffmpeg::codec::Id::HEVC => nal::is_safe_h265_keyframe(nal_type),
					_ => true,
				}
			};

			if accept {
				let start_nal = match nal_type {
					// H.265 parameter sets carry no picture; the look-ahead
					// pass fills in the real type.
					Some(t) if video.codec == ffmpeg::codec::Id::HEVC && (32..=34).contains(&t) => {
						GopStartNal::Deferred
					}
					Some(t) => GopStartNal::Known(t),
					None => GopStartNal::Unknown,
				};

				self.keyframe_indices.push(self.frame_pts.len());
				self.start_dts.push(packet.dts().unwrap_or(NO_DTS));
				self.start_nals.push(start_nal);
				if let Some(last) = self.last_seen_dts {
					if self.start_dts.len() > 1 {
						self.end_dts.push(last);
					}
				}
			} else {
				tracing::trace!(pts = packet.pts(), nal = ?nal_type, "rejected unsafe keyframe");
			}
		}

		self.last_seen_dts = packet.dts();
		self.frame_pts.push(packet.pts().unwrap_or(0));
	}

	fn finish(mut self, video: &mut VideoIndex) {
		if let Some(last) = self.last_seen_dts {
			if !self.start_dts.is_empty() && self.end_dts.len() < self.start_dts.len() {
				self.end_dts.push(last);
			}
		}

		self.frame_pts.sort_unstable();
		video.frame_times = self
			.frame_pts
			.iter()
			.map(|&pts| time::from_ticks(pts, video.time_base))
			.collect();

		video.gops = self
			.keyframe_indices
			.iter()
			.zip(&self.start_dts)
			.zip(&self.end_dts)
			.zip(&self.start_nals)
			.map(|(((&frame, &start_dts), &end_dts), &start_nal)| Gop {
				start_pts: video.frame_times[frame],
				start_dts,
				end_dts,
				start_nal,
				has_rasl: false,
				leading_end_dts: None,
			})
			.collect();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_index(frame_times: Vec<Seconds>, start_time: Seconds, duration: Seconds) -> MediaIndex {
		MediaIndex {
			path: PathBuf::new(),
			start_time,
			duration,
			video: Some(VideoIndex {
				stream_index: 0,
				time_base: Seconds::new(1, 1000),
				codec: ffmpeg::codec::Id::H264,
				parameters: ffmpeg::codec::Parameters::new(),
				metadata: Vec::new(),
				disposition: 0,
				avg_frame_rate: ffmpeg::Rational::new(25, 1),
				frame_times,
				gops: Vec::new(),
			}),
			audio: Vec::new(),
			subtitles: Vec::new(),
			attachments: Vec::new(),
		}
	}

	fn secs(n: i64, d: i64) -> Seconds {
		Seconds::new(n, d)
	}

	#[test]
	fn test_next_frame_time_picks_nearer_neighbour() {
		let times = (0..10).map(|i| secs(i, 25)).collect();
		let index = test_index(times, Seconds::from_integer(0), secs(2, 5));

		// 0.05s sits between frames at 0.04 and 0.08; 0.04 is nearer.
		assert_eq!(index.next_frame_time(secs(1, 20)), secs(1, 25));
		// 0.07s is nearer to 0.08.
		assert_eq!(index.next_frame_time(secs(7, 100)), secs(2, 25));
	}

	#[test]
	fn test_next_frame_time_clamps() {
		let times = (0..10).map(|i| secs(i, 25)).collect();
		let index = test_index(times, Seconds::from_integer(0), secs(2, 5));

		// Before the first frame.
		assert_eq!(index.next_frame_time(secs(-1, 1)), secs(0, 1));
		// Past the last frame: clamps to duration.
		assert_eq!(index.next_frame_time(secs(100, 1)), secs(2, 5));
	}

	#[test]
	fn test_next_frame_time_accounts_for_start_time() {
		let start = secs(1, 2);
		let times = (0..10).map(|i| start + secs(i, 25)).collect();
		let index = test_index(times, start, secs(2, 5));

		assert_eq!(index.next_frame_time(secs(0, 1)), secs(0, 1));
		assert_eq!(index.next_frame_time(secs(1, 25)), secs(1, 25));
	}

	#[test]
	fn test_gop_cursor() {
		let gop = |start_dts: i64, end_dts: i64| Gop {
			start_pts: Seconds::from_integer(0),
			start_dts,
			end_dts,
			start_nal: GopStartNal::Unknown,
			has_rasl: false,
			leading_end_dts: None,
		};
		let gops = vec![gop(0, 999), gop(1000, 1999), gop(2000, 2999)];

		let mut cursor = GopCursor::default();
		assert_eq!(cursor.advance(&gops, 0), Some(0));
		assert_eq!(cursor.advance(&gops, 500), Some(0));
		assert_eq!(cursor.advance(&gops, 1000), Some(1));
		assert_eq!(cursor.advance(&gops, 2500), Some(2));
		// The cursor never rewinds; it follows decode order.
		assert_eq!(cursor.advance(&gops, 0), Some(2));
		assert_eq!(cursor.advance(&[], 0), None);
	}
}
