//! Container and codec compatibility tables.
//!
//! Pure lookups: which codecs each output container accepts, which containers
//! are audio-only, and how quality presets map to encoder CRF values. The
//! driver consults these before any output I/O so invalid combinations fail
//! up front instead of mid-mux.

use crate::ffmpeg;
use crate::{CutError, Result};

/// Video codecs the engine can copy or re-encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
	H264,
	Hevc,
	Vp9,
	Av1,
}

impl VideoCodec {
	pub fn from_id(id: ffmpeg::codec::Id) -> Option<Self> {
		use ffmpeg::codec::Id;
		match id {
			Id::H264 => Some(Self::H264),
			Id::HEVC => Some(Self::Hevc),
			Id::VP9 => Some(Self::Vp9),
			Id::AV1 => Some(Self::Av1),
			_ => None,
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Self::H264 => "h264",
			Self::Hevc => "hevc",
			Self::Vp9 => "vp9",
			Self::Av1 => "av1",
		}
	}
}

/// Audio codecs the engine recognizes for passthrough validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
	Aac,
	Mp3,
	Opus,
	Vorbis,
	Flac,
	PcmS16le,
	PcmF32le,
}

impl AudioCodec {
	pub fn from_id(id: ffmpeg::codec::Id) -> Option<Self> {
		use ffmpeg::codec::Id;
		match id {
			Id::AAC => Some(Self::Aac),
			Id::MP3 => Some(Self::Mp3),
			Id::OPUS => Some(Self::Opus),
			Id::VORBIS => Some(Self::Vorbis),
			Id::FLAC => Some(Self::Flac),
			Id::PCM_S16LE => Some(Self::PcmS16le),
			Id::PCM_F32LE => Some(Self::PcmF32le),
			_ => None,
		}
	}
}

/// How the video stream is exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoExportMode {
	/// Re-encode only the GOP fragments that straddle cut boundaries.
	#[default]
	Smartcut,
	/// Cut on keyframes only: inaccurate timing, but lossless and fast.
	Keyframes,
	/// Re-encode everything.
	Recode,
}

/// Quality presets for the re-encoded fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoExportQuality {
	Low,
	#[default]
	Normal,
	High,
	Indistinguishable,
	NearLossless,
	Lossless,
}

impl VideoExportQuality {
	/// The base CRF value for this preset (lower is higher quality).
	pub fn crf(&self) -> i32 {
		match self {
			Self::Low => 23,
			Self::Normal => 18,
			Self::High => 14,
			Self::Indistinguishable => 8,
			Self::NearLossless => 3,
			Self::Lossless => 0,
		}
	}
}

/// The file extension of an output path, lowercased.
pub fn extension(path: &std::path::Path) -> String {
	path.extension().map(|e| e.to_string_lossy().to_lowercase()).unwrap_or_default()
}

/// Containers that cannot hold a video stream. `ipod` is the real name of
/// m4a as far as the muxer is concerned.
pub fn is_audio_only(ext: &str) -> bool {
	matches!(ext, "mp3" | "flac" | "ogg" | "wav" | "m4a" | "ipod")
}

/// Containers limited to a single audio track.
pub fn is_single_audio_track(ext: &str) -> bool {
	matches!(ext, "ogg" | "mp3" | "m4a" | "ipod" | "flac" | "wav")
}

/// Video codecs a container accepts. Empty for audio-only containers.
pub fn valid_video_codecs(ext: &str) -> &'static [VideoCodec] {
	use VideoCodec::*;
	match ext {
		"mp4" => &[H264, Hevc, Av1],
		"mov" => &[H264, Hevc],
		"mkv" => &[H264, Hevc, Vp9, Av1],
		"webm" => &[Vp9, Av1],
		"avi" => &[H264],
		_ if is_audio_only(ext) => &[],
		_ => &[H264, Hevc],
	}
}

/// Audio codecs a container accepts.
pub fn valid_audio_codecs(ext: &str) -> &'static [AudioCodec] {
	use AudioCodec::*;
	match ext {
		"mp3" => &[Mp3],
		"flac" => &[Flac],
		"wav" => &[PcmS16le, PcmF32le],
		"ogg" => &[Opus, Vorbis],
		"m4a" | "ipod" => &[Aac],
		"mp4" | "mov" => &[Aac, Mp3],
		"mkv" => &[Aac, Mp3, Opus, Flac, PcmS16le],
		"webm" => &[Opus, Vorbis],
		"avi" => &[Mp3, PcmS16le],
		_ => &[Aac, Mp3],
	}
}

/// The recommended audio codec for a container.
pub fn default_audio_codec(ext: &str) -> AudioCodec {
	use AudioCodec::*;
	match ext {
		"mp3" => Mp3,
		"flac" => Flac,
		"wav" => PcmS16le,
		"ogg" | "webm" => Opus,
		"avi" => Mp3,
		_ => Aac,
	}
}

/// Reject video codec / container combinations the muxer cannot realize.
pub fn validate_video_combo(codec: VideoCodec, ext: &str) -> Result<()> {
	if is_audio_only(ext) {
		return Ok(()); // video is suppressed, not muxed
	}
	if !valid_video_codecs(ext).contains(&codec) {
		return Err(CutError::InvalidInput(format!(
			"{} video is not supported in {} containers",
			codec.name(),
			ext.to_uppercase()
		)));
	}
	Ok(())
}

/// Reject passthrough when the source audio codec cannot live in the output
/// container (e.g. AAC into MP3).
pub fn validate_audio_passthru(id: ffmpeg::codec::Id, ext: &str) -> Result<()> {
	let allowed = valid_audio_codecs(ext);
	match AudioCodec::from_id(id) {
		Some(codec) if allowed.contains(&codec) => Ok(()),
		Some(_) | None => Err(CutError::UnsupportedCodecCombo(format!(
			"cannot pass {:?} audio through into a {} container",
			id,
			ext.to_uppercase()
		))),
	}
}

/// Reject more audio tracks than the container can hold.
pub fn validate_audio_track_count(ext: &str, tracks: usize) -> Result<()> {
	if tracks > 1 && is_single_audio_track(ext) {
		return Err(CutError::InvalidInput(format!(
			"{} containers can only hold 1 audio track, but {} were selected",
			ext.to_uppercase(),
			tracks
		)));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_audio_only_containers() {
		assert!(is_audio_only("mp3"));
		assert!(is_audio_only("ipod"));
		assert!(!is_audio_only("mkv"));
	}

	#[test]
	fn test_video_combo_rejections() {
		// H.264 cannot go into OGG, HEVC cannot go into WebM.
		assert!(valid_video_codecs("ogg").is_empty());
		assert!(validate_video_combo(VideoCodec::Hevc, "webm").is_err());
		assert!(validate_video_combo(VideoCodec::H264, "avi").is_ok());
		assert!(validate_video_combo(VideoCodec::Av1, "mp4").is_ok());
		assert!(validate_video_combo(VideoCodec::Av1, "mov").is_err());
	}

	#[test]
	fn test_audio_passthru_validation() {
		use ffmpeg::codec::Id;
		// AAC into MP3 is not a passthrough.
		assert!(matches!(
			validate_audio_passthru(Id::AAC, "mp3"),
			Err(CutError::UnsupportedCodecCombo(_))
		));
		assert!(validate_audio_passthru(Id::AAC, "mp4").is_ok());
		assert!(validate_audio_passthru(Id::OPUS, "webm").is_ok());
		assert!(validate_audio_passthru(Id::FLAC, "mkv").is_ok());
		// Unrecognized codecs cannot be validated into anything.
		assert!(validate_audio_passthru(Id::TTA, "mkv").is_err());
	}

	#[test]
	fn test_audio_track_limits() {
		assert!(validate_audio_track_count("ogg", 2).is_err());
		assert!(validate_audio_track_count("ogg", 1).is_ok());
		assert!(validate_audio_track_count("mkv", 4).is_ok());
	}

	#[test]
	fn test_crf_presets() {
		assert_eq!(VideoExportQuality::Low.crf(), 23);
		assert_eq!(VideoExportQuality::Normal.crf(), 18);
		assert_eq!(VideoExportQuality::High.crf(), 14);
		assert_eq!(VideoExportQuality::Indistinguishable.crf(), 8);
		assert_eq!(VideoExportQuality::NearLossless.crf(), 3);
		assert_eq!(VideoExportQuality::Lossless.crf(), 0);
	}

	#[test]
	fn test_defaults() {
		assert_eq!(default_audio_codec("webm"), AudioCodec::Opus);
		assert_eq!(default_audio_codec("mp4"), AudioCodec::Aac);
		assert_eq!(default_audio_codec("wav"), AudioCodec::PcmS16le);
	}
}
