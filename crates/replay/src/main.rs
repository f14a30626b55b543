//! Hearth replay binary.
//!
//! Replays an NDJSON script of session operations (served view contents,
//! raw change rows, channel drops, user actions) against the realtime engine
//! with in-memory collaborators, and prints the resulting views as JSON lines.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use hearth_realtime::{EngineConfig, SessionUser};
use tracing::info;

mod backend;
mod runner;
mod script;

/// Replay command line arguments.
#[derive(Parser, Debug)]
#[command(name = "hearth-replay")]
#[command(about = "Replay scripted change streams against the hearth realtime engine")]
struct Args {
	/// Script to replay, one JSON step per line; `-` reads stdin
	#[arg(value_name = "SCRIPT")]
	script: PathBuf,

	/// Engine configuration (TOML)
	#[arg(short, long, value_name = "PATH")]
	config: Option<PathBuf>,

	/// Logged-in user id
	#[arg(short, long, default_value = "u1")]
	user: String,

	/// Log in as an admin (adds the moderation queue)
	#[arg(long)]
	admin: bool,

	/// Pause after each step, in milliseconds
	#[arg(long, default_value_t = 25)]
	settle_ms: u64,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	setup_tracing(args.verbose);

	let config = match &args.config {
		Some(path) => EngineConfig::load(path).with_context(|| format!("loading config {}", path.display()))?,
		None => EngineConfig::default(),
	};
	let source = read_script(&args.script)?;
	let steps = script::parse(&source)?;
	let user = if args.admin {
		SessionUser::admin(args.user.as_str())
	} else {
		SessionUser::member(args.user.as_str())
	};
	info!(steps = steps.len(), user = %user.id, config = %config.backoff, "starting replay");

	let mut runner = runner::Runner::start(config, user, Duration::from_millis(args.settle_ms)).await?;
	let result = runner.run(steps).await;
	runner.write_to(std::io::stdout().lock())?;
	info!(lines = runner.output().len(), mutations = runner.mutations(), "replay finished");
	runner.finish().await;
	result
}

fn read_script(path: &Path) -> anyhow::Result<String> {
	if path.as_os_str() == "-" {
		let mut source = String::new();
		std::io::stdin().read_to_string(&mut source).context("reading script from stdin")?;
		return Ok(source);
	}
	std::fs::read_to_string(path).with_context(|| format!("reading script {}", path.display()))
}

fn setup_tracing(verbose: bool) {
	use tracing_subscriber::EnvFilter;

	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
		if verbose {
			EnvFilter::new("hearth_realtime=debug,hearth_replay=debug,info")
		} else {
			EnvFilter::new("warn")
		}
	});
	tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}
