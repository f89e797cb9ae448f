use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone, Default)]
pub struct Log {
	/// Print debug output.
	#[arg(long, short, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Print no output except errors.
	#[arg(long, short, conflicts_with = "verbose")]
	pub quiet: bool,
}

impl Log {
	pub fn init(&self) {
		let level = if self.quiet {
			"error"
		} else {
			match self.verbose {
				0 => "info",
				1 => "debug",
				_ => "trace",
			}
		};

		// RUST_LOG overrides the flags when set.
		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

		tracing_subscriber::fmt()
			.with_env_filter(filter)
			.with_target(false)
			.with_writer(std::io::stderr)
			.init();
	}
}
