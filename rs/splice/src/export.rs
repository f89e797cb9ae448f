//! The cut driver: validates the request, creates the output container(s),
//! instantiates the per-stream cutters, walks the planned segments, and
//! multiplexes whatever they yield.
//!
//! Work is driven by a single pull loop; the only parallelism anywhere is
//! frame threading inside the codec contexts. A shared [`Cancel`] flag is
//! polled between output files and between segments, and a cancelled export
//! removes the partially written file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::ffmpeg;
use ffmpeg::{codec, encoder, format, Dictionary};

use crate::cut::{normalize_codec_tag, PassthruAudioCutter, StreamCutter, SubtitleCutter, VideoCutter, VideoSettings};
use crate::formats::{self, VideoExportMode};
use crate::index::MediaIndex;
use crate::plan::{self, CutSegment};
use crate::time::{self, Seconds};
use crate::{CutError, Result};

const ENCODED_BY: &str = concat!("splice ", env!("CARGO_PKG_VERSION"));

/// Muxer names of containers that cannot hold video.
const AUDIO_ONLY_FORMATS: &[&str] = &["ogg", "mp3", "m4a", "ipod", "flac", "wav"];

/// Shared cancellation flag, polled between output files and between
/// segments. There is no forced interrupt of in-flight codec calls.
#[derive(Debug, Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
	pub fn cancel(&self) {
		self.0.store(true, Ordering::Relaxed);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::Relaxed)
	}
}

/// Progress callbacks: the total segment count first, then the number of
/// completed segments as the export advances.
pub trait Progress {
	fn emit(&mut self, value: usize);
}

/// Per-track audio disposition. Audio re-encoding is out of scope; a track
/// is either passed through or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioTrackExport {
	#[default]
	Passthru,
	Skip,
}

/// Which audio tracks the output carries, parallel to the source's track
/// list. Missing entries drop the track.
#[derive(Debug, Clone, Default)]
pub struct AudioExportInfo {
	pub output_tracks: Vec<AudioTrackExport>,
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
	pub video: VideoSettings,
	/// `None` passes every source audio track through.
	pub audio: Option<AudioExportInfo>,
	/// One output file per keep-interval, numbered from the path template.
	pub segment_mode: bool,
}

/// Cut `index` down to `intervals` (seconds, ascending, disjoint) and write
/// the result to `out_path`.
pub fn export(
	index: &MediaIndex,
	intervals: &[(Seconds, Seconds)],
	out_path: &Path,
	options: &ExportOptions,
	mut progress: Option<&mut dyn Progress>,
	cancel: &Cancel,
) -> Result<()> {
	validate_intervals(intervals)?;

	let ext = formats::extension(out_path);
	let audio_tracks = selected_audio_tracks(index, options);
	validate_output(index, &ext, &audio_tracks, &options.video)?;

	let adjusted = plan::adjust_intervals(intervals, index.start_time, index.duration);
	let mut segments = plan::plan(index, &adjusted, options.video.mode == VideoExportMode::Keyframes);
	if options.video.mode == VideoExportMode::Recode {
		segments = segments.into_iter().map(CutSegment::into_recode).collect();
	}
	tracing::debug!(segments = segments.len(), files = if options.segment_mode { adjusted.len() } else { 1 }, "planned cut");

	let output_files: Vec<(PathBuf, (Seconds, Seconds))> = if options.segment_mode {
		let padding = adjusted.len().to_string().len();
		adjusted
			.iter()
			.enumerate()
			.map(|(i, &interval)| (segment_output_path(out_path, i + 1, padding), interval))
			.collect()
	} else {
		vec![(out_path.to_path_buf(), *adjusted.last().unwrap())]
	};

	let mut previously_done = 0;
	for (path, interval) in &output_files {
		if cancel.is_cancelled() {
			remove_partial(path);
			return Err(CutError::Cancelled);
		}

		previously_done = write_output_file(
			index,
			path,
			*interval,
			&segments,
			previously_done,
			options,
			&audio_tracks,
			progress.as_deref_mut(),
			cancel,
		)?;

		if cancel.is_cancelled() {
			remove_partial(path);
			return Err(CutError::Cancelled);
		}
	}

	Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_output_file(
	index: &MediaIndex,
	path: &Path,
	interval: (Seconds, Seconds),
	segments: &[CutSegment],
	previously_done: usize,
	options: &ExportOptions,
	audio_tracks: &[usize],
	mut progress: Option<&mut dyn Progress>,
	cancel: &Cancel,
) -> Result<usize> {
	let mut output = format::output(&path)?;
	let container_name = output.format().name().to_string();
	let global_header = output.format().flags().contains(format::Flags::GLOBAL_HEADER);

	let mut metadata = Dictionary::new();
	metadata.set("ENCODED_BY", ENCODED_BY);
	output.set_metadata(metadata);

	let include_video = !AUDIO_ONLY_FORMATS.iter().any(|f| container_name.split(',').any(|n| n == *f));
	let supports_attachments = container_name.contains("matroska") || container_name.contains("webm");

	// Time base each cutter produces timestamps in, per output stream. The
	// muxer may rewrite stream time bases at write_header; packets are
	// rescaled at mux time when it does.
	let mut engine_tb: Vec<Option<ffmpeg::Rational>> = Vec::new();

	if supports_attachments {
		for attachment in &index.attachments {
			let mut stream = output.add_stream(encoder::find(codec::Id::None))?;
			stream.set_parameters(attachment.parameters.clone());
			crate::ffi::set_stream_metadata(&mut stream, &attachment.metadata);
			crate::ffi::set_stream_disposition(&mut stream, attachment.disposition);
			engine_tb.push(None);
		}
	}

	// Stream layout: video first, then the selected audio tracks, then
	// subtitles, matching the source order within each kind. Cutters are
	// built before the header is written so the video cutter's eagerly
	// opened encoder can publish its parameters into it.
	let mut video_cutter = None;
	if include_video {
		if let Some(video) = &index.video {
			let mut stream = output.add_stream(encoder::find(codec::Id::None))?;
			stream.set_parameters(video.parameters.clone());
			stream.set_time_base(video.time_base_q());
			crate::ffi::set_stream_metadata(&mut stream, &video.metadata);
			crate::ffi::set_stream_disposition(&mut stream, video.disposition);

			let cutter = VideoCutter::new(
				index,
				options.video.clone(),
				stream.index(),
				video.time_base_q(),
				global_header,
			)?;
			cutter.apply_encoder_parameters(&mut stream)?;
			normalize_codec_tag(&mut stream, &container_name, &video.parameters);

			engine_tb.push(Some(video.time_base_q()));
			video_cutter = Some(cutter);
		}
	}

	let mut audio_cutters = Vec::new();
	for &track_index in audio_tracks {
		let track = &index.audio[track_index];
		let mut stream = output.add_stream(encoder::find(codec::Id::None))?;
		stream.set_parameters(track.parameters.clone());
		stream.set_time_base(time::to_rational(track.time_base));
		crate::ffi::set_stream_metadata(&mut stream, &track.metadata);
		crate::ffi::set_stream_disposition(&mut stream, track.disposition);

		engine_tb.push(Some(time::to_rational(track.time_base)));
		audio_cutters.push(PassthruAudioCutter::new(track, stream.index(), track.time_base));
	}

	let mut subtitle_cutters = Vec::new();
	if include_video {
		for track in &index.subtitles {
			let mut stream = output.add_stream(encoder::find(codec::Id::None))?;
			stream.set_parameters(track.parameters.clone());
			stream.set_time_base(time::to_rational(track.time_base));
			crate::ffi::set_stream_metadata(&mut stream, &track.metadata);
			crate::ffi::set_stream_disposition(&mut stream, track.disposition);

			engine_tb.push(Some(time::to_rational(track.time_base)));
			subtitle_cutters.push(SubtitleCutter::new(track, stream.index()));
		}
	}

	output.write_header()?;

	// Engine vs. final time base, per stream index.
	let stream_tbs: Vec<(Option<ffmpeg::Rational>, ffmpeg::Rational)> = output
		.streams()
		.map(|s| (engine_tb.get(s.index()).copied().flatten(), s.time_base()))
		.collect();

	let mut cutters: Vec<Box<dyn StreamCutter + '_>> = Vec::new();
	if let Some(cutter) = video_cutter {
		cutters.push(Box::new(cutter));
	}
	for cutter in audio_cutters {
		cutters.push(Box::new(cutter));
	}
	for cutter in subtitle_cutters {
		cutters.push(Box::new(cutter));
	}

	if let Some(progress) = progress.as_deref_mut() {
		progress.emit(segments.len());
	}

	let mut done = previously_done;
	for segment in &segments[previously_done..] {
		if cancel.is_cancelled() {
			break;
		}
		if segment.start() >= interval.1 {
			// This segment belongs to the next output file.
			break;
		}

		if let Some(progress) = progress.as_deref_mut() {
			progress.emit(done);
		}
		done += 1;

		for cutter in &mut cutters {
			for mut packet in cutter.segment(segment)? {
				mux(&mut output, &mut packet, &stream_tbs)?;
			}
		}
	}

	for cutter in &mut cutters {
		for mut packet in cutter.finish()? {
			mux(&mut output, &mut packet, &stream_tbs)?;
		}
	}
	output.write_trailer()?;

	if let Some(progress) = progress.as_deref_mut() {
		progress.emit(done);
	}

	Ok(done)
}

fn mux(
	output: &mut format::context::Output,
	packet: &mut ffmpeg::Packet,
	stream_tbs: &[(Option<ffmpeg::Rational>, ffmpeg::Rational)],
) -> Result<()> {
	// Stray flush artifacts that slipped past the per-stream repair.
	if packet.dts().is_some_and(|dts| dts < -900_000) {
		packet.set_dts(None);
	}
	if let Some(dts) = packet.dts() {
		if dts > 1_000_000_000_000 {
			tracing::warn!(dts, pts = ?packet.pts(), "muxing packet with implausible dts");
		}
	}

	// The muxer rewrote this stream's time base at write_header.
	if let Some((Some(engine), final_tb)) = stream_tbs.get(packet.stream()).copied() {
		if engine != final_tb {
			packet.rescale_ts(engine, final_tb);
		}
	}

	packet.write_interleaved(output)?;
	Ok(())
}

fn remove_partial(path: &Path) {
	if path.exists() {
		tracing::debug!(path = %path.display(), "removing partially written output");
		if let Err(e) = std::fs::remove_file(path) {
			tracing::warn!(path = %path.display(), "failed to remove partial output: {e}");
		}
	}
}

fn selected_audio_tracks(index: &MediaIndex, options: &ExportOptions) -> Vec<usize> {
	match &options.audio {
		None => (0..index.audio.len()).collect(),
		Some(info) => (0..index.audio.len())
			.filter(|&i| info.output_tracks.get(i) == Some(&AudioTrackExport::Passthru))
			.collect(),
	}
}

fn validate_intervals(intervals: &[(Seconds, Seconds)]) -> Result<()> {
	if intervals.is_empty() {
		return Err(CutError::InvalidInput("no keep-intervals given".into()));
	}
	let mut prev_end = None;
	for &(start, end) in intervals {
		if start < Seconds::from_integer(0) {
			return Err(CutError::InvalidInput(format!("negative interval start: {start}")));
		}
		if end <= start {
			return Err(CutError::InvalidInput(format!("empty interval: {start}..{end}")));
		}
		if prev_end.is_some_and(|e| start < e) {
			return Err(CutError::InvalidInput(format!("overlapping interval at {start}")));
		}
		prev_end = Some(end);
	}
	Ok(())
}

fn validate_output(index: &MediaIndex, ext: &str, audio_tracks: &[usize], video: &VideoSettings) -> Result<()> {
	if !formats::is_audio_only(ext) {
		if let Some(v) = &index.video {
			let codec = video.codec_override.or_else(|| formats::VideoCodec::from_id(v.codec));
			if let Some(codec) = codec {
				formats::validate_video_combo(codec, ext)?;
			}
		}
	}
	if formats::is_audio_only(ext) && audio_tracks.is_empty() {
		return Err(CutError::InvalidInput(format!(
			"{} output requires at least one audio track",
			ext.to_uppercase()
		)));
	}

	formats::validate_audio_track_count(ext, audio_tracks.len())?;
	for &track in audio_tracks {
		formats::validate_audio_passthru(index.audio[track].parameters.id(), ext)?;
	}
	Ok(())
}

/// Output path for interval `index` (1-based) in segment mode: the
/// zero-padded index replaces the last `#` in the template, or is inserted
/// before the final `.`, or appended when there is neither.
fn segment_output_path(out_path: &Path, index: usize, padding: usize) -> PathBuf {
	let path = out_path.to_string_lossy();
	let number = format!("{index:0padding$}");

	let formatted = if let Some(pos) = path.rfind('#') {
		format!("{}{}{}", &path[..pos], number, &path[pos + 1..])
	} else if let Some(dot) = path.rfind('.') {
		format!("{}{}{}", &path[..dot], number, &path[dot..])
	} else {
		format!("{path}{number}")
	};
	PathBuf::from(formatted)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn secs(v: i64) -> Seconds {
		Seconds::from_integer(v)
	}

	#[test]
	fn test_segment_output_path_hash_template() {
		assert_eq!(segment_output_path(Path::new("out#.mp4"), 1, 1), PathBuf::from("out1.mp4"));
		assert_eq!(segment_output_path(Path::new("out#.mp4"), 2, 2), PathBuf::from("out02.mp4"));
		// Only the last '#' is substituted.
		assert_eq!(segment_output_path(Path::new("a#b#.mkv"), 3, 1), PathBuf::from("a#b3.mkv"));
	}

	#[test]
	fn test_segment_output_path_inserts_before_dot() {
		assert_eq!(segment_output_path(Path::new("clip.mp4"), 7, 2), PathBuf::from("clip07.mp4"));
		assert_eq!(segment_output_path(Path::new("dir.d/clip.mp4"), 1, 1), PathBuf::from("dir.d/clip1.mp4"));
	}

	#[test]
	fn test_segment_output_path_appends_without_dot() {
		assert_eq!(segment_output_path(Path::new("clip"), 12, 2), PathBuf::from("clip12"));
	}

	#[test]
	fn test_validate_intervals() {
		assert!(validate_intervals(&[]).is_err());
		assert!(validate_intervals(&[(secs(0), secs(1))]).is_ok());
		assert!(validate_intervals(&[(secs(1), secs(1))]).is_err());
		assert!(validate_intervals(&[(secs(2), secs(1))]).is_err());
		assert!(validate_intervals(&[(secs(-1), secs(1))]).is_err());
		// Overlap.
		assert!(validate_intervals(&[(secs(0), secs(5)), (secs(4), secs(8))]).is_err());
		// Touching is fine.
		assert!(validate_intervals(&[(secs(0), secs(5)), (secs(5), secs(8))]).is_ok());
	}

	#[test]
	fn test_cancel_flag() {
		let cancel = Cancel::default();
		assert!(!cancel.is_cancelled());
		let clone = cancel.clone();
		clone.cancel();
		assert!(cancel.is_cancelled());
	}
}
