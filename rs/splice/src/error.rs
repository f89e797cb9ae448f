use crate::ffmpeg;

/// A list of possible errors that can occur during an export.
///
/// Per-packet anomalies (bad DTS from an encoder flush, non-monotonic input
/// timestamps) are repaired inline and never surface here; the export either
/// completes or fails once.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum CutError {
	/// Unreadable source, empty interval list, overlapping intervals,
	/// or an output container that cannot hold the requested streams.
	#[error("invalid input: {0}")]
	InvalidInput(String),

	/// The encoder cannot realize the requested codec/profile combination.
	#[error("{0}; select cutting on keyframes instead")]
	UnsupportedCodecCombo(String),

	/// Malformed NAL data or missing extradata on a codec that needs it.
	#[error("bitstream error: {0}")]
	Bitstream(String),

	/// The export was cancelled; the partial output file has been removed.
	#[error("cancelled")]
	Cancelled,

	/// Codec or container failure from the underlying library.
	#[error("codec error: {0}")]
	Codec(#[from] ffmpeg::Error),

	/// I/O failure writing the output.
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CutError>;
