mod api;
mod commands;
mod config;
mod discovery;
mod logstream;
mod model;
mod picker;
mod show;
mod status;

use anyhow::{Context, Result};
use clap::Parser;
use clap::error::ErrorKind;
use commands::Commands;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "VKCLI_LOG";

#[derive(Parser, Debug)]
#[command(name = "vkcli")]
#[command(about = "Browse tasks, start attempts and follow their progress", version)]
struct Cli {
	/// Config file to use instead of ~/.vkcli/config.toml
	#[arg(long, global = true)]
	config: Option<PathBuf>,
	/// Log debug output to stderr
	#[arg(short, long, global = true, default_value_t = false)]
	verbose: bool,
	#[command(subcommand)]
	command: Commands,
}

fn main() -> ExitCode {
	let cli = match Cli::try_parse() {
		Ok(cli) => cli,
		Err(err) => {
			let _ = err.print();
			return match err.kind() {
				ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
				_ => ExitCode::FAILURE,
			};
		}
	};
	init_logging(cli.verbose);

	match run(cli) {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			eprintln!("Error: {err:#}");
			ExitCode::FAILURE
		}
	}
}

fn run(cli: Cli) -> Result<()> {
	let cfg = match &cli.config {
		Some(path) => config::load_from(path),
		None => config::load_or_init(),
	}
	.context("failed to load config")?;
	commands::dispatch(cli.command, &cfg, cli.config.as_deref())
}

fn init_logging(verbose: bool) {
	let default = if verbose { Level::DEBUG } else { Level::WARN };
	let filter = EnvFilter::builder()
		.with_default_directive(default.into())
		.with_env_var(LOG_ENV)
		.from_env_lossy();
	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.try_init();
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::CommandFactory;

	#[test]
	fn cli_definition_is_consistent() {
		Cli::command().debug_assert();
	}

	#[test]
	fn parses_exec_options() {
		let cli = Cli::try_parse_from([
			"vkcli",
			"exec",
			"t1",
			"--executor",
			"CLAUDE_CODE",
			"--base-branch",
			"main",
			"-v",
		])
		.unwrap();
		assert!(cli.verbose);
		assert_eq!(
			cli.command,
			Commands::Exec {
				task_id: "t1".to_string(),
				executor: Some("CLAUDE_CODE".to_string()),
				base_branch: Some("main".to_string()),
			}
		);
	}

	#[test]
	fn missing_command_is_an_error() {
		let err = Cli::try_parse_from(["vkcli"]).unwrap_err();
		assert_ne!(err.kind(), ErrorKind::DisplayHelp);
		assert!(Cli::try_parse_from(["vkcli", "frobnicate"]).is_err());
		assert!(Cli::try_parse_from(["vkcli", "list"]).is_err());
	}

	#[test]
	fn global_config_flag_follows_subcommand() {
		let cli = Cli::try_parse_from(["vkcli", "status", "a1", "--config", "/tmp/vk.toml"]).unwrap();
		assert_eq!(cli.config, Some(PathBuf::from("/tmp/vk.toml")));
	}
}
