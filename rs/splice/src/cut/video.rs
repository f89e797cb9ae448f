//! The video cutter: a per-segment state machine over three dispositions.
//!
//! - **Copy**: packets for the covered DTS range are pulled from the demuxer,
//!   passed through an optional bitstream filter, and rebased in time.
//! - **Recode**: the GOP's fetch range is decoded, frames inside the segment
//!   are re-encoded. Frames leave the decoder in decode order and are
//!   released in presentation order through a min-heap keyed on PTS.
//! - **Hybrid CRA recode**: a copied CRA GOP whose leading pictures lost
//!   their references (the preceding GOP was cut away) has exactly those
//!   leading pictures re-encoded while the CRA and trailing packets are
//!   copied verbatim.
//!
//! The cutter owns its own demux handle on the source; seeks here can never
//! disturb the audio tables.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::ffmpeg;
use ffmpeg::codec::{self, threading};
use ffmpeg::software::scaling;
use ffmpeg::{decoder, encoder, format, frame, picture, Dictionary, Packet, Rational};

use super::StreamCutter;
use crate::ffi;
use crate::formats::{VideoCodec, VideoExportMode, VideoExportQuality};
use crate::index::{Gop, MediaIndex, VideoIndex, NO_DTS};
use crate::nal;
use crate::plan::{CutSegment, GopRange};
use crate::time::Seconds;
use crate::{CutError, Result};

/// How many decoded frames must sit in the reorder heap before the head may
/// be released. Generous because demuxer-synthesized PTSs cannot be told
/// apart from real ones.
const BUFFERED_FRAMES_COUNT: usize = 15;

/// Demuxed DTS gaps longer than this trigger an explicit seek instead of
/// scanning packet by packet.
const GAP_SKIP_SECONDS: i64 = 120;

/// Encoder-flush artifacts show up as DTS values far outside this window;
/// they are treated as absent and resynthesized.
const DTS_SANE_MIN: i64 = -900_000;
const DTS_SANE_MAX: i64 = 1_000_000_000_000;

#[derive(Debug, Clone, Default)]
pub struct VideoSettings {
	pub mode: VideoExportMode,
	pub quality: VideoExportQuality,
	/// Re-encode into this codec instead of the source codec (full-recode
	/// mode only).
	pub codec_override: Option<VideoCodec>,
	/// Forwarded into `x265-params` so the encoder's log chatter can be
	/// silenced or raised.
	pub x265_log_level: Option<String>,
}

pub struct VideoCutter<'a> {
	gops: &'a [Gop],
	fetcher: Fetcher,
	recoder: Recoder,
	bsf: Option<ffi::BitstreamFilter>,

	in_time_base: Seconds,
	out_time_base: Seconds,
	out_stream_index: usize,

	segment_start_in_output: Seconds,
	last_dts: i64,

	/// GOP index of the most recently copied segment; `None` until the first
	/// copy. Drives the hybrid-CRA discontinuity check.
	last_copied_gop: Option<usize>,
}

impl<'a> VideoCutter<'a> {
	/// Build the cutter before the output header is written: the encoder is
	/// opened eagerly (keyframes mode excepted) so its parameters can be
	/// published onto the output stream while the header can still carry
	/// them. `out_time_base` is the time base set on the output stream; the
	/// driver rescales at mux time if the muxer later rewrites it.
	pub fn new(
		index: &'a MediaIndex,
		settings: VideoSettings,
		out_stream_index: usize,
		out_time_base: Rational,
		global_header: bool,
	) -> Result<Self> {
		let video = index
			.video
			.as_ref()
			.ok_or_else(|| CutError::InvalidInput("source has no video stream".into()))?;

		let input = format::input(&index.path)?;
		let out_tb = crate::time::time_base(out_time_base);

		// AVCC/HVCC sources need conversion to Annex B for remuxing; raw
		// Annex B sources pass through untouched.
		let extradata = ffi::extradata(&video.parameters);
		let bsf_name = match video.codec {
			codec::Id::H264 if !is_annexb(extradata) => Some("h264_mp4toannexb"),
			codec::Id::HEVC if !is_annexb(extradata) => Some("hevc_mp4toannexb"),
			codec::Id::MPEG4 | codec::Id::MSMPEG4V1 | codec::Id::MSMPEG4V2 | codec::Id::MSMPEG4V3 => {
				Some("dump_extra")
			}
			_ => None,
		};
		let bsf = match bsf_name {
			Some(name) => {
				tracing::debug!(filter = name, "remuxing through bitstream filter");
				Some(ffi::BitstreamFilter::new(name, &video.parameters, video.time_base_q())?)
			}
			None => None,
		};

		let codec = settings
			.codec_override
			.or_else(|| VideoCodec::from_id(video.codec));

		// Open the encoder up front so the container header can carry its
		// extradata. Keyframes mode stays lazy: it is the documented escape
		// hatch when the encoder cannot realize the source (VP9 profile 2+),
		// and it only ever encodes on the rare hybrid-CRA path.
		let mode = settings.mode;
		let mut recoder = Recoder::new(video, settings, codec, out_time_base, global_header);
		if mode != VideoExportMode::Keyframes && codec.is_some() {
			recoder.ensure()?;
		}

		Ok(Self {
			gops: &video.gops,
			fetcher: Fetcher::new(input, video),
			recoder,
			bsf,
			in_time_base: video.time_base,
			out_time_base: out_tb,
			out_stream_index,
			segment_start_in_output: Seconds::from_integer(0),
			last_dts: NO_DTS,
			last_copied_gop: None,
		})
	}

	/// Publish the opened encoder's parameters (codec id, extradata, tag)
	/// onto the output stream. Must run before the header is written, or
	/// containers that commit extradata at header time (Matroska, WebM)
	/// advertise the source's parameter sets for re-encoded fragments.
	pub fn apply_encoder_parameters(&self, stream: &mut ffmpeg::StreamMut) -> Result<()> {
		let Some(encoder) = &self.recoder.encoder else {
			return Ok(());
		};
		stream.set_parameters(ffi::context_parameters(encoder)?);
		Ok(())
	}

	fn recode_segment(&mut self, start: Seconds, end: Seconds, gop: GopRange) -> Result<Vec<Packet>> {
		// RASL frames reference the previous GOP; prime the decoder from
		// there so their references exist.
		let priming = (gop.index > 0 && self.gops.get(gop.index).is_some_and(|g| g.has_rasl))
			.then(|| self.gops[gop.index - 1].start_dts);

		self.recoder.ensure()?;

		let in_tb = self.in_time_base;
		let out_tb = self.out_time_base;
		let sso = self.segment_start_in_output;
		let recoder = &mut self.recoder;
		let mut packets = Vec::new();

		self.fetcher.pump(gop.start_dts, gop.end_dts, end, priming, None, &mut |mut frame| {
			let Some(pts) = frame.pts() else { return Ok(()) };
			let t = Seconds::from_integer(pts) * in_tb;
			if t < start || t >= end {
				return Ok(());
			}

			// Shift into segment-relative input time, convert to the output
			// base, then offset by the output time already produced.
			let rel = (Seconds::from_integer(pts) - start / in_tb).to_integer();
			let scaled = (Seconds::from_integer(rel) * in_tb / out_tb).to_integer();
			let out_pts = (Seconds::from_integer(scaled) + sso / out_tb).to_integer();
			frame.set_pts(Some(out_pts));

			packets.extend(recoder.encode_frame(frame)?);
			Ok(())
		})?;

		Ok(packets)
	}

	fn remux_segment(&mut self, start: Seconds, gop: GopRange) -> Result<Vec<Packet>> {
		let segment_start_pts = (start / self.in_time_base).to_integer();
		let offset = self.segment_start_in_output / self.out_time_base;

		let mut packets = Vec::new();
		while let Some(mut packet) = self.fetcher.fetch_packet(gop.start_dts, gop.end_dts)? {
			self.rebase_copy_timestamps(&mut packet, segment_start_pts, offset);
			match &mut self.bsf {
				Some(bsf) => packets.extend(bsf.filter(Some(&packet))?),
				None => packets.push(packet),
			}
		}
		if let Some(bsf) = &mut self.bsf {
			packets.extend(bsf.filter(None)?);
			bsf.flush();
		}
		Ok(packets)
	}

	/// A copy of a CRA GOP whose leading pictures cannot be decoded by the
	/// consumer: the output has a discontinuity right before it, so the
	/// frames the RASL pictures reference are gone.
	fn should_hybrid_recode(&self, gop: GopRange) -> bool {
		let Some(entry) = self.gops.get(gop.index) else { return false };
		if !entry.has_rasl {
			return false;
		}
		match self.last_copied_gop {
			None => gop.index > 0,
			Some(last) => gop.index > last + 1,
		}
	}

	fn hybrid_recode_cra(&mut self, start: Seconds, end: Seconds, gop: GopRange) -> Result<Vec<Packet>> {
		let entry = &self.gops[gop.index];
		let leading_end_dts = entry
			.leading_end_dts
			.ok_or_else(|| CutError::Bitstream("CRA GOP has no recorded leading pictures".into()))?;
		let gop_start_time = entry.start_pts;
		let priming = (gop.index > 0).then(|| self.gops[gop.index - 1].start_dts);

		tracing::debug!(gop = gop.index, "hybrid recode: re-encoding leading pictures of CRA GOP");

		self.recoder.ensure()?;

		// Same reference point as the plain remux path, so the re-encoded
		// leading frames land exactly where the copied packets expect them.
		let segment_start_pts = (start / self.in_time_base).to_integer();
		let offset = self.segment_start_in_output / self.out_time_base;
		let in_tb = self.in_time_base;
		let out_tb = self.out_time_base;

		// Decode leading + CRA; collect the non-leading packets for remux.
		let mut collected = Vec::new();
		let mut frames: Vec<frame::Video> = Vec::new();
		self.fetcher
			.pump(gop.start_dts, leading_end_dts, end, priming, Some(&mut collected), &mut |frame| {
				frames.push(frame);
				Ok(())
			})?;

		// Leading pictures were filtered from the collection, so the first
		// collected packet is the CRA itself.
		let cra_pts = collected
			.first()
			.and_then(|p| p.pts())
			.ok_or_else(|| CutError::Bitstream("no CRA packet found in GOP".into()))?;

		// Leading frames display after the GOP start (priming frames from
		// the previous GOP do not) and before the CRA.
		let mut leading: Vec<_> = frames
			.into_iter()
			.filter(|f| {
				f.pts().is_some_and(|pts| {
					Seconds::from_integer(pts) * in_tb >= gop_start_time && pts < cra_pts
				})
			})
			.collect();
		leading.sort_by_key(|f| f.pts().unwrap_or(0));

		let mut packets = Vec::new();
		for mut frame in leading {
			let pts = frame.pts().unwrap_or(0);
			let rebased = ((Seconds::from_integer(pts - segment_start_pts) * in_tb / out_tb) + offset).to_integer();
			frame.set_pts(Some(rebased));
			packets.extend(self.recoder.encode_frame(frame)?);
		}
		packets.extend(self.recoder.flush()?);

		// Encoder flush can leave garbage DTS on the tail packets.
		for packet in &mut packets {
			if packet.dts().is_none_or(|dts| dts > DTS_SANE_MAX) {
				packet.set_dts(packet.pts());
			}
		}

		// Remux the CRA and everything trailing, with the copy-path timing.
		let mut remux = collected;
		while let Some(packet) = self.fetcher.fetch_packet(leading_end_dts, gop.end_dts)? {
			remux.push(packet);
		}
		for mut packet in remux {
			self.rebase_copy_timestamps(&mut packet, segment_start_pts, offset);
			match &mut self.bsf {
				Some(bsf) => packets.extend(bsf.filter(Some(&packet))?),
				None => packets.push(packet),
			}
		}
		if let Some(bsf) = &mut self.bsf {
			packets.extend(bsf.filter(None)?);
			bsf.flush();
		}

		Ok(packets)
	}

	fn rebase_copy_timestamps(&self, packet: &mut Packet, segment_start_pts: i64, offset: Seconds) {
		let in_tb = self.in_time_base;
		let out_tb = self.out_time_base;
		let rebase =
			|ts: i64| ((Seconds::from_integer(ts - segment_start_pts) * in_tb / out_tb) + offset).to_integer();

		let pts = packet.pts().unwrap_or(0);
		packet.set_pts(Some(rebase(pts)));
		if let Some(dts) = packet.dts() {
			packet.set_dts(Some(rebase(dts)));
		}
	}

	/// Repair emitted timestamps: strictly monotonic DTS, PTS >= DTS, and
	/// synthesized DTS where the encoder or filter produced none.
	fn fix_timestamps(&mut self, packet: &mut Packet) {
		packet.set_stream(self.out_stream_index);
		packet.set_position(-1);

		if packet.dts().is_some_and(|dts| !(DTS_SANE_MIN..=DTS_SANE_MAX).contains(&dts)) {
			packet.set_dts(None);
		}

		let (pts, dts) = repair_timestamps(&mut self.last_dts, packet.pts(), packet.dts());
		packet.set_pts(pts);
		packet.set_dts(Some(dts));
	}
}

/// The timestamp-repair rules, separated from packet plumbing.
fn repair_timestamps(last_dts: &mut i64, pts: Option<i64>, dts: Option<i64>) -> (Option<i64>, i64) {
	match dts {
		Some(mut dts) => {
			if dts <= *last_dts {
				dts = *last_dts + 1;
			}
			*last_dts = dts;
			// PTS >= DTS is required by every container; copy packets can
			// violate it after an encoded segment pushed DTS forward.
			let pts = pts.map(|p| p.max(dts));
			(pts, dts)
		}
		None => {
			// For the first packet use PTS as DTS; afterwards increment
			// minimally so PTS >= DTS survives on later packets.
			let dts = if *last_dts < 0 { pts.unwrap_or(0) } else { *last_dts + 1 };
			*last_dts = dts;
			(pts, dts)
		}
	}
}

impl StreamCutter for VideoCutter<'_> {
	fn segment(&mut self, segment: &CutSegment) -> Result<Vec<Packet>> {
		let mut packets = match *segment {
			CutSegment::Recode { start, end, gop } => self.recode_segment(start, end, gop)?,
			CutSegment::Copy { start, end, gop: Some(gop) } => {
				if self.should_hybrid_recode(gop) {
					let packets = self.hybrid_recode_cra(start, end, gop)?;
					self.last_copied_gop = Some(gop.index);
					packets
				} else {
					// Flush any live encoder first so its delayed packets
					// precede the copied ones.
					let mut packets = self.recoder.flush()?;
					packets.extend(self.remux_segment(start, gop)?);
					self.last_copied_gop = Some(gop.index);
					packets
				}
			}
			// Video-less copies never reach a video cutter.
			CutSegment::Copy { gop: None, .. } => Vec::new(),
		};

		self.segment_start_in_output += segment.duration();
		for packet in &mut packets {
			self.fix_timestamps(packet);
		}
		Ok(packets)
	}

	fn finish(&mut self) -> Result<Vec<Packet>> {
		let mut packets = self.recoder.flush()?;
		for packet in &mut packets {
			self.fix_timestamps(packet);
		}
		Ok(packets)
	}
}

fn is_annexb(extradata: Option<&[u8]>) -> bool {
	match extradata {
		Some(data) => data.starts_with(&[0, 0, 1]) || data.starts_with(&[0, 0, 0, 1]),
		None => false,
	}
}

/// A decoded frame waiting in the reorder heap; ordering is by the explicit
/// key only, never by the frame itself.
struct PendingFrame {
	key: i64,
	frame: frame::Video,
}

impl PartialEq for PendingFrame {
	fn eq(&self, other: &Self) -> bool {
		self.key == other.key
	}
}

impl Eq for PendingFrame {}

impl PartialOrd for PendingFrame {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for PendingFrame {
	fn cmp(&self, other: &Self) -> Ordering {
		self.key.cmp(&other.key)
	}
}

/// Demux + decode state: the cutter's own demux handle, the saved look-ahead
/// packet, the decoder, and the presentation-order reorder heap.
struct Fetcher {
	input: format::context::Input,
	stream_index: usize,
	in_time_base: Seconds,
	codec: codec::Id,
	parameters: codec::Parameters,

	saved_packet: Option<Packet>,
	decoder: Option<decoder::Video>,
	heap: BinaryHeap<Reverse<PendingFrame>>,
	heap_gop_dts: i64,
	/// End DTS of the previous fetch range; when the next range starts right
	/// there, decoder and heap survive so B-frames stay continuous.
	last_fetch_end_dts: Option<i64>,
}

impl Fetcher {
	fn new(input: format::context::Input, video: &VideoIndex) -> Self {
		Self {
			input,
			stream_index: video.stream_index,
			in_time_base: video.time_base,
			codec: video.codec,
			parameters: video.parameters.clone(),
			saved_packet: None,
			decoder: None,
			heap: BinaryHeap::new(),
			heap_gop_dts: -1,
			last_fetch_end_dts: None,
		}
	}

	fn read_video_packet(&mut self) -> Option<Packet> {
		let stream_index = self.stream_index;
		loop {
			let (stream, packet) = self.input.packets().next()?;
			if stream.index() == stream_index {
				return Some(packet);
			}
		}
	}

	/// Produce the next packet whose DTS lies in `[target_dts, end_dts]`,
	/// skipping ahead (with a real seek over long gaps) and saving the first
	/// packet past the range for the next call.
	fn fetch_packet(&mut self, target_dts: i64, end_dts: i64) -> Result<Option<Packet>> {
		if let Some(saved) = self.saved_packet.take() {
			let saved_dts = saved.dts().unwrap_or(NO_DTS);
			if saved_dts >= target_dts {
				if saved_dts <= end_dts {
					return Ok(Some(saved));
				}
				// Still beyond this range; keep it for a later fetch.
				self.saved_packet = Some(saved);
				return Ok(None);
			}
			// Before the target: stale, drop it.
		}

		loop {
			let Some(packet) = self.read_video_packet() else {
				return Ok(None);
			};
			let in_dts = packet.dts().unwrap_or(NO_DTS);

			if packet.pts().is_none() || in_dts < target_dts {
				let gap = Seconds::from_integer(target_dts - in_dts) * self.in_time_base;
				if in_dts > 0 && gap > Seconds::from_integer(GAP_SKIP_SECONDS) {
					let t = target_dts - (Seconds::from_integer(30) / self.in_time_base).to_integer();
					tracing::debug!(target = target_dts, "seeking to skip a demux gap");
					ffi::seek_stream(&mut self.input, self.stream_index, t)?;
					self.saved_packet = None;
				}
				continue;
			}
			if in_dts > end_dts {
				self.saved_packet = Some(packet);
				return Ok(None);
			}
			return Ok(Some(packet));
		}
	}

	fn ensure_decoder(&mut self) -> Result<&mut decoder::Video> {
		if self.decoder.is_none() {
			let mut ctx = codec::context::Context::from_parameters(self.parameters.clone())?;
			ctx.set_threading(threading::Config::kind(threading::Type::Frame));
			self.decoder = Some(ctx.decoder().video()?);
		}
		Ok(self.decoder.as_mut().unwrap())
	}

	fn push_decoded(heap: &mut BinaryHeap<Reverse<PendingFrame>>, mut frame: frame::Video) {
		// Prefer the decoder's best-effort timestamp; some demuxers hand the
		// decoder packets whose PTS it cannot propagate.
		if frame.pts().is_none() {
			let ts = frame.timestamp();
			frame.set_pts(ts);
		}
		let key = frame.pts().unwrap_or(-1);
		heap.push(Reverse(PendingFrame { key, frame }));
	}

	/// Decode `[gop_start_dts, end_dts]` (optionally priming from an earlier
	/// DTS) and hand frames to `on_frame` in presentation order, stopping at
	/// `end_time`. Packets at or after the GOP start are copied into
	/// `collect` when given, minus H.265 leading pictures.
	fn pump(
		&mut self,
		gop_start_dts: i64,
		end_dts: i64,
		end_time: Seconds,
		priming_dts: Option<i64>,
		mut collect: Option<&mut Vec<Packet>>,
		on_frame: &mut dyn FnMut(frame::Video) -> Result<()>,
	) -> Result<()> {
		let continuous = self
			.last_fetch_end_dts
			.is_some_and(|dts| dts == end_dts || dts == gop_start_dts);
		self.last_fetch_end_dts = Some(end_dts);

		// Priming from the previous GOP only applies on a fresh start; a
		// continuous decoder already has the reference frames.
		let start_dts = if continuous {
			gop_start_dts
		} else {
			priming_dts.unwrap_or(gop_start_dts)
		};

		if self.heap_gop_dts != gop_start_dts && !continuous {
			self.heap.clear();
			self.heap_gop_dts = gop_start_dts;
			if let Some(decoder) = &mut self.decoder {
				decoder.flush();
			}
		}

		if start_dts < gop_start_dts && !continuous {
			if let Some(decoder) = &mut self.decoder {
				decoder.flush();
			}
			self.heap.clear();
			match ffi::seek_stream(&mut self.input, self.stream_index, start_dts) {
				Ok(()) => self.saved_packet = None,
				Err(e) => tracing::warn!(dts = start_dts, "priming seek failed: {e}"),
			}
		}

		self.ensure_decoder()?;
		let mut current_dts = gop_start_dts;

		while let Some(packet) = self.fetch_packet(start_dts, end_dts)? {
			current_dts = packet.dts().unwrap_or(current_dts);

			if let Some(collected) = collect.as_mut() {
				// Skip priming packets from before the GOP, and leading
				// pictures, which are being re-encoded instead.
				let mut keep = packet.dts().unwrap_or(current_dts) >= gop_start_dts;
				if keep && self.codec == codec::Id::HEVC {
					let nal_type = packet.data().and_then(nal::h265_nal_unit_type);
					keep = !nal::is_leading_picture(nal_type);
				}
				if keep {
					collected.push(packet.clone());
				}
			}

			let decoder = self.decoder.as_mut().unwrap();
			decoder.send_packet(&packet)?;
			let mut frame = frame::Video::empty();
			while decoder.receive_frame(&mut frame).is_ok() {
				Self::push_decoded(&mut self.heap, frame);
				frame = frame::Video::empty();
			}

			// A frame is safe to release once enough later frames are
			// buffered and nothing still to come can present earlier.
			while self.heap.len() > BUFFERED_FRAMES_COUNT {
				let head = &self.heap.peek().unwrap().0;
				if head.key > current_dts {
					break;
				}
				if Seconds::from_integer(head.key) * self.in_time_base >= end_time {
					// Everything released from here on is past the segment.
					return Ok(());
				}
				let frame = self.heap.pop().unwrap().0.frame;
				on_frame(frame)?;
			}
		}

		// Terminal null: drain the decoder's delay.
		if let Some(decoder) = self.decoder.as_mut() {
			if decoder.send_eof().is_ok() {
				let mut frame = frame::Video::empty();
				while decoder.receive_frame(&mut frame).is_ok() {
					Self::push_decoded(&mut self.heap, frame);
					frame = frame::Video::empty();
				}
			}
		}

		while let Some(head) = self.heap.peek() {
			let head = &head.0;
			if head.frame.pts().is_none() || Seconds::from_integer(head.key) * self.in_time_base >= end_time {
				// Leave frames past the segment for a continuous successor.
				break;
			}
			let frame = self.heap.pop().unwrap().0.frame;
			on_frame(frame)?;
		}

		Ok(())
	}
}

/// Encoder state: opened eagerly at cutter construction (except keyframes
/// mode), dropped on flush, re-opened with identical options on the next
/// recode.
struct Recoder {
	codec: Option<VideoCodec>,
	quality: VideoExportQuality,
	x265_log_level: Option<String>,
	in_parameters: codec::Parameters,
	avg_frame_rate: Rational,
	out_time_base: Rational,
	/// The output format wants parameter sets in extradata rather than (or
	/// in addition to) in-band.
	global_header: bool,

	encoder: Option<encoder::video::Encoder>,
	scaler: Option<scaling::Context>,
	width: u32,
	height: u32,
	enc_last_pts: i64,
}

impl Recoder {
	fn new(
		video: &VideoIndex,
		settings: VideoSettings,
		codec: Option<VideoCodec>,
		out_time_base: Rational,
		global_header: bool,
	) -> Self {
		let (width, height) = ffi::video_dimensions(&video.parameters);
		Self {
			codec,
			quality: settings.quality,
			x265_log_level: settings.x265_log_level,
			in_parameters: video.parameters.clone(),
			avg_frame_rate: video.avg_frame_rate,
			out_time_base,
			global_header,
			encoder: None,
			scaler: None,
			width,
			height,
			enc_last_pts: -1,
		}
	}

	fn ensure(&mut self) -> Result<()> {
		if self.encoder.is_some() {
			return Ok(());
		}

		let codec = self.codec.ok_or_else(|| {
			CutError::UnsupportedCodecCombo("source video codec cannot be re-encoded".into())
		})?;
		let options = self.derive_options(codec)?;

		let found = match codec {
			// The decoder side may be libdav1d; the matching encoder is
			// libaom.
			VideoCodec::Av1 => encoder::find_by_name("libaom-av1"),
			VideoCodec::H264 => encoder::find(codec::Id::H264),
			VideoCodec::Hevc => encoder::find(codec::Id::HEVC),
			VideoCodec::Vp9 => encoder::find(codec::Id::VP9),
		}
		.ok_or_else(|| {
			CutError::UnsupportedCodecCombo(format!("no encoder available for {}", codec.name()))
		})?;

		let mut ctx = codec::context::Context::new_with_codec(found);
		ctx.set_threading(threading::Config::kind(threading::Type::Frame));
		if self.global_header {
			ctx.set_flags(codec::Flags::GLOBAL_HEADER);
		}
		let mut enc = ctx.encoder().video()?;

		enc.set_width(self.width);
		enc.set_height(self.height);
		enc.set_format(ffi::pixel_format(&self.in_parameters));
		let sar = ffi::sample_aspect_ratio(&self.in_parameters);
		if sar.numerator() > 0 {
			enc.set_aspect_ratio(sar);
		}
		enc.set_time_base(self.out_time_base);
		if self.avg_frame_rate.numerator() > 0 {
			enc.set_frame_rate(Some(self.avg_frame_rate));
		}
		if let Some(bit_rate) = ffi::bit_rate(&self.in_parameters) {
			enc.set_bit_rate(bit_rate as usize);
		}

		let mut dict = Dictionary::new();
		for (key, value) in &options {
			dict.set(key, value);
		}
		tracing::debug!(codec = codec.name(), ?options, "opening encoder");

		self.encoder = Some(enc.open_with(dict)?);
		self.enc_last_pts = -1;
		Ok(())
	}

	fn derive_options(&self, codec: VideoCodec) -> Result<Vec<(String, String)>> {
		let lossless = self.quality == VideoExportQuality::Lossless;

		let profile = match codec {
			VideoCodec::Av1 => None,
			VideoCodec::Vp9 => match ffi::profile_name(&self.in_parameters) {
				Some(name) => {
					// "Profile 2" -> "2"; only profiles 0 and 1 are
					// realizable with libvpx.
					let digit = name.chars().last().and_then(|c| c.to_digit(10));
					if digit.is_some_and(|d| d > 1) {
						return Err(CutError::UnsupportedCodecCombo(
							"VP9 profile 2 and 3 are not supported by the encoder".into(),
						));
					}
					digit.map(|d| d.to_string())
				}
				None => None,
			},
			_ => match ffi::profile_name(&self.in_parameters) {
				Some(name) if name.contains("Baseline") => Some("baseline".into()),
				Some(name) if name.contains("High 4:4:4") => Some("high444".into()),
				// Range extensions and friends have no encoder-side name.
				Some(name) if name.contains("Rext") || name.contains("Simple") => None,
				Some(name) => Some(name.to_lowercase().replace([':', ' '], "")),
				None => None,
			},
		};

		let mut crf = self.quality.crf();
		if matches!(codec, VideoCodec::Hevc | VideoCodec::Av1 | VideoCodec::Vp9) {
			// Newer codecs reach the same quality at a higher CRF.
			crf += 4;
		}
		if lossless {
			crf = 0;
		}

		let mut options = vec![("crf".to_string(), crf.to_string())];
		if codec == VideoCodec::Vp9 && lossless {
			options.push(("lossless".to_string(), "1".to_string()));
		}
		if let Some(profile) = profile {
			options.push(("profile".to_string(), profile));
		}

		match codec {
			VideoCodec::H264 => {
				// Keep our SPS id away from the source's; id 0 is almost
				// always taken and a collision corrupts the copied GOPs.
				options.push(("x264-params".to_string(), "sps-id=3".to_string()));
			}
			VideoCodec::Hevc => {
				let mut params = x265_params_from_extradata(ffi::extradata(&self.in_parameters));
				// Explicit repeat-headers; global_header off alone is not
				// enough with x265.
				params.push("repeat-headers=1".to_string());
				// Only the cut boundaries are ours; an encoder-settings SEI
				// would misrepresent the rest of the stream.
				params.push("info=0".to_string());
				if let Some(level) = &self.x265_log_level {
					params.push(format!("log_level={level}"));
				}
				if lossless {
					params.push("lossless=1".to_string());
				}
				options.push(("x265-params".to_string(), params.join(":")));
			}
			_ => {}
		}

		Ok(options)
	}

	/// Encode one frame whose PTS is already in the output time base.
	fn encode_frame(&mut self, mut frame: frame::Video) -> Result<Vec<Packet>> {
		self.ensure()?;

		if let Some(pts) = frame.pts() {
			let pts = if pts <= self.enc_last_pts { self.enc_last_pts + 1 } else { pts };
			self.enc_last_pts = pts;
			frame.set_pts(Some(pts));
		}
		// Let the encoder choose its own frame types.
		frame.set_kind(picture::Type::None);

		let frame = self.scale_if_needed(frame)?;
		let encoder = self.encoder.as_mut().unwrap();
		encoder.send_frame(&frame)?;
		Ok(Self::drain(encoder))
	}

	fn flush(&mut self) -> Result<Vec<Packet>> {
		let Some(mut encoder) = self.encoder.take() else {
			return Ok(Vec::new());
		};
		self.scaler = None;
		encoder.send_eof()?;
		Ok(Self::drain(&mut encoder))
	}

	fn drain(encoder: &mut encoder::video::Encoder) -> Vec<Packet> {
		let mut packets = Vec::new();
		let mut packet = Packet::empty();
		while encoder.receive_packet(&mut packet).is_ok() {
			packets.push(packet);
			packet = Packet::empty();
		}
		packets
	}

	/// Scale to the encoder dimensions with bilinear interpolation, staying
	/// in the same pixel format.
	fn scale_if_needed(&mut self, frame: frame::Video) -> Result<frame::Video> {
		if frame.width() == self.width && frame.height() == self.height {
			return Ok(frame);
		}

		if self.scaler.is_none() {
			self.scaler = Some(scaling::Context::get(
				frame.format(),
				frame.width(),
				frame.height(),
				frame.format(),
				self.width,
				self.height,
				scaling::Flags::BILINEAR,
			)?);
		}
		let scaler = self.scaler.as_mut().unwrap();

		let mut scaled = frame::Video::empty();
		scaler.run(&frame, &mut scaled)?;
		scaled.set_pts(frame.pts());
		Ok(scaled)
	}
}

/// x265 writes its own settings into the extradata as an `options:` tail.
/// Mining them back out is best-effort and only meaningful for x265-encoded
/// sources, but it is the difference between re-encoded boundary frames that
/// match the stream and ones that visibly do not.
fn x265_params_from_extradata(extradata: Option<&[u8]>) -> Vec<String> {
	let Some(data) = extradata else { return Vec::new() };
	let needle = b"options: ";
	let Some(pos) = data.windows(needle.len()).position(|w| w == needle) else {
		return Vec::new();
	};

	let tail = &data[pos + needle.len()..];
	let tail = &tail[..tail.len().saturating_sub(1)];
	let Ok(text) = std::str::from_utf8(tail) else { return Vec::new() };

	text.split_whitespace()
		.map(|option| {
			let mut option = option.replace(':', ",");
			if !option.contains('=') {
				option.push_str("=1");
			}
			option
		})
		.collect()
}

/// Rewrite codec tags the target container cannot carry. MPEG-TS sources tag
/// H.264 as `0x1b` and HEVC as `HEVC`/`0x24`; ISO-BMFF and Matroska muxers
/// want `avc1`/`hev1`/`hvc1`. HEVC in MP4/MOV is forced to `hev1` because the
/// copied bitstream keeps its parameter sets inline.
pub fn normalize_codec_tag(out_stream: &mut ffmpeg::StreamMut, container_name: &str, in_params: &codec::Parameters) {
	let is_mp4_mov_mkv = ["mp4", "mov", "matroska", "webm"].iter().any(|n| container_name.contains(n));
	let is_mp4_or_mov = ["mp4", "mov"].iter().any(|n| container_name.contains(n));
	let in_tag = ffi::codec_tag(in_params);

	match in_params.id() {
		codec::Id::H264 if is_mp4_mov_mkv && in_tag == 0x0000001b => {
			ffi::set_stream_codec_tag(out_stream, fourcc(b"avc1"));
		}
		codec::Id::HEVC if is_mp4_or_mov => {
			ffi::set_stream_codec_tag(out_stream, fourcc(b"hev1"));
		}
		codec::Id::HEVC if is_mp4_mov_mkv && (in_tag == fourcc(b"HEVC") || in_tag == 0x00000024) => {
			ffi::set_stream_codec_tag(out_stream, fourcc(b"hvc1"));
		}
		_ => {}
	}
}

fn fourcc(tag: &[u8; 4]) -> u32 {
	u32::from_le_bytes(*tag)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_repair_monotonic_dts() {
		let mut last = NO_DTS;
		assert_eq!(repair_timestamps(&mut last, Some(10), Some(5)), (Some(10), 5));
		// Same DTS again: bumped by one.
		assert_eq!(repair_timestamps(&mut last, Some(10), Some(5)), (Some(10), 6));
		// Going backwards: bumped past the last.
		assert_eq!(repair_timestamps(&mut last, Some(10), Some(2)), (Some(10), 7));
	}

	#[test]
	fn test_repair_pts_never_below_dts() {
		let mut last = 99;
		let (pts, dts) = repair_timestamps(&mut last, Some(50), Some(80));
		assert_eq!(dts, 100);
		assert_eq!(pts, Some(100));
	}

	#[test]
	fn test_repair_synthesizes_missing_dts() {
		let mut last = NO_DTS;
		// First packet without DTS: PTS becomes DTS.
		assert_eq!(repair_timestamps(&mut last, Some(42), None), (Some(42), 42));
		// Later packets without DTS: minimal increment.
		assert_eq!(repair_timestamps(&mut last, Some(90), None), (Some(90), 43));
	}

	#[test]
	fn test_pending_frame_orders_by_key_only() {
		let mut heap = BinaryHeap::new();
		for key in [30i64, 10, 20] {
			heap.push(Reverse(PendingFrame { key, frame: frame::Video::empty() }));
		}
		let order: Vec<i64> = std::iter::from_fn(|| heap.pop().map(|f| f.0.key)).collect();
		assert_eq!(order, vec![10, 20, 30]);
	}

	#[test]
	fn test_is_annexb() {
		assert!(is_annexb(Some(&[0, 0, 1, 0x67])));
		assert!(is_annexb(Some(&[0, 0, 0, 1, 0x67])));
		assert!(!is_annexb(Some(&[1, 0x64, 0, 31])));
		assert!(!is_annexb(None));
	}

	#[test]
	fn test_x265_params_from_extradata() {
		let extradata = b"x265 (build 199) - 3.5:[Windows][GCC 9.2.0] - options: wpp no-pmode bitrate=2000 rect\0";
		let params = x265_params_from_extradata(Some(extradata));
		assert!(params.contains(&"wpp=1".to_string()));
		assert!(params.contains(&"no-pmode=1".to_string()));
		assert!(params.contains(&"bitrate=2000".to_string()));
		assert!(params.contains(&"rect=1".to_string()));

		assert!(x265_params_from_extradata(None).is_empty());
		assert!(x265_params_from_extradata(Some(b"no options here")).is_empty());
	}

	#[test]
	fn test_fourcc() {
		assert_eq!(fourcc(b"avc1"), 0x31637661);
		assert_eq!(fourcc(b"hev1"), 0x31766568);
	}
}
