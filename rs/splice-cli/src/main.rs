use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use splice::export::{self, Cancel, ExportOptions, Progress};
use splice::formats::{VideoExportMode, VideoExportQuality};
use splice::index::MediaIndex;

mod interval;
mod log;

use interval::Interval;

#[derive(Parser, Clone)]
#[command(name = "splice", about = "Cut time ranges out of a media file without re-encoding it")]
pub struct Cli {
	/// The source media file.
	pub input: PathBuf,

	/// The output path. In segment mode, a `#` marks where the segment
	/// number goes; without one the number lands before the extension.
	pub output: PathBuf,

	/// A time range to keep, as `start-end` in seconds (e.g. `12.5-74`).
	/// Repeat for multiple ranges; they must be ascending and disjoint.
	#[arg(long = "keep", required = true)]
	pub keep: Vec<Interval>,

	/// How to handle cut boundaries inside a GOP.
	#[arg(long, value_enum, default_value_t = Mode::Smartcut)]
	pub mode: Mode,

	/// Quality preset for re-encoded boundary fragments.
	#[arg(long, value_enum, default_value_t = Quality::Normal)]
	pub quality: Quality,

	/// Write one output file per keep-range instead of a single file.
	#[arg(long)]
	pub segments: bool,

	/// The log configuration.
	#[command(flatten)]
	pub log: log::Log,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
	/// Re-encode only the GOP fragments at cut boundaries (frame-accurate).
	Smartcut,
	/// Cut on keyframes only (fast and lossless, inaccurate boundaries).
	Keyframes,
	/// Re-encode the whole output.
	Recode,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Quality {
	Low,
	Normal,
	High,
	Indistinguishable,
	NearLossless,
	Lossless,
}

struct LogProgress {
	total: usize,
}

impl Progress for LogProgress {
	fn emit(&mut self, value: usize) {
		if self.total == 0 {
			self.total = value;
		} else {
			tracing::info!(done = value, total = self.total, "cutting");
		}
	}
}

fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	cli.log.init();

	let index = MediaIndex::open(&cli.input)
		.with_context(|| format!("failed to index {}", cli.input.display()))?;

	tracing::info!(
		duration = %index.duration,
		gops = index.video.as_ref().map(|v| v.gops.len()).unwrap_or(0),
		audio_tracks = index.audio.len(),
		"indexed source"
	);

	let options = ExportOptions {
		video: splice::cut::VideoSettings {
			mode: match cli.mode {
				Mode::Smartcut => VideoExportMode::Smartcut,
				Mode::Keyframes => VideoExportMode::Keyframes,
				Mode::Recode => VideoExportMode::Recode,
			},
			quality: match cli.quality {
				Quality::Low => VideoExportQuality::Low,
				Quality::Normal => VideoExportQuality::Normal,
				Quality::High => VideoExportQuality::High,
				Quality::Indistinguishable => VideoExportQuality::Indistinguishable,
				Quality::NearLossless => VideoExportQuality::NearLossless,
				Quality::Lossless => VideoExportQuality::Lossless,
			},
			..Default::default()
		},
		audio: None,
		segment_mode: cli.segments,
	};

	let intervals: Vec<_> = cli.keep.iter().map(|i| (i.start, i.end)).collect();
	let cancel = Cancel::default();
	let mut progress = LogProgress { total: 0 };

	export::export(&index, &intervals, &cli.output, &options, Some(&mut progress), &cancel)
		.context("export failed")?;

	tracing::info!(output = %cli.output.display(), "done");
	Ok(())
}
