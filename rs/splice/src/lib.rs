//! # splice: frame-accurate media cutting with minimal re-encoding
//!
//! Given a source file and an ordered list of non-overlapping time intervals,
//! `splice` produces an output whose decoded content matches the concatenation
//! of those intervals. Re-encoding is confined to the fragments of
//! group-of-pictures (GOPs) that straddle cut boundaries; the interior of every
//! fully covered GOP is copied bitstream-verbatim.
//!
//! ## Overview
//!
//! - **Index**: open the source once, demux everything, build the frame-PTS
//!   array and a GOP table from raw NAL inspection ([`index`]).
//! - **Plan**: map the requested intervals onto GOP-aligned copy segments and
//!   frame-aligned recode segments ([`plan`]).
//! - **Cut**: per-stream cutters produce output packets per segment
//!   ([`cut`]); the driver muxes them into the output container ([`export`]).
//!
//! The demuxer's keyframe flag alone is not a usable cut table: it also marks
//! parameter-set-only packets and codec-private recovery points. The [`nal`]
//! module classifies packet payloads at the bitstream level so the index only
//! records entries that are actually decodable from scratch.
mod error;

pub mod cut;
pub mod export;
pub mod formats;
pub mod index;
pub mod nal;
pub mod plan;
pub mod time;

mod ffi;

// export the ffmpeg version in use
pub use ffmpeg_next as ffmpeg;

pub use error::*;
