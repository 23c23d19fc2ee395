//! CLI entry point and dispatch
//!
//! `run()` parses arguments, installs logging, discovers configuration,
//! creates the runtime, dispatches, and prints every error itself. It
//! returns the exit code for `main` to hand to the process.

use anyhow::Result;
use clap::Parser;

use super::args::{Cli, Commands};
use super::commands;
use crate::{CliArgs, Config, ConfigError, ExitCode, StudyweaveError};
use studyweave_utils::logging::init_tracing;
use studyweave_utils::redaction::redact_error_message;

/// Main CLI execution function.
///
/// Returns `Err(code)` for every non-zero exit, including partial runs; the
/// error output has already been printed.
pub fn run() -> Result<(), ExitCode> {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.verbose, cli.json_logs) {
        eprintln!("warning: logging unavailable: {e}");
    }

    let cli_args = cli_args(&cli);
    let config = match Config::discover(&cli_args) {
        Ok(config) => config,
        Err(err) => {
            let err = match err.downcast::<ConfigError>() {
                Ok(config_err) => StudyweaveError::Config(config_err),
                Err(other) => StudyweaveError::Config(ConfigError::InvalidFile(format!("{other:#}"))),
            };
            eprintln!("{}", err.display_for_user());
            return Err(err.to_exit_code());
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("✗ Failed to create async runtime: {e}");
            return Err(ExitCode::INTERNAL);
        }
    };

    let operation = cli.command.operation();
    let result = rt.block_on(async {
        match cli.command {
            Commands::Enhance { input, out, .. } => {
                commands::execute_enhance_command(&input, &out, &config).await
            }
            Commands::Cache(cache_cmd) => {
                commands::execute_cache_command(&cache_cmd, &config).map(|()| ExitCode::SUCCESS)
            }
        }
    });

    match result {
        Ok(code) if code == ExitCode::SUCCESS => Ok(()),
        Ok(code) => Err(code),
        Err(error) => {
            if let Some(studyweave_error) = error.downcast_ref::<StudyweaveError>() {
                eprintln!("{}", studyweave_error.display_for_user());
                return Err(studyweave_error.to_exit_code());
            }
            eprintln!(
                "✗ {operation} failed: {}",
                redact_error_message(&format!("{error:#}"))
            );
            eprintln!("\n  Run with --verbose for more detailed output");
            Err(ExitCode::INTERNAL)
        }
    }
}

/// Configuration overrides carried by the parsed command line.
pub(super) fn cli_args(cli: &Cli) -> CliArgs {
    let mut args = CliArgs {
        config_path: cli.config.clone(),
        cache_dir: cli.cache_dir.clone(),
        ..CliArgs::default()
    };
    if let Commands::Enhance {
        provider,
        model,
        no_cache,
        call_limit,
        max_concurrent_calls,
        deadline_secs,
        ..
    } = &cli.command
    {
        args.provider.clone_from(provider);
        args.model.clone_from(model);
        args.no_cache = *no_cache;
        args.call_limit = *call_limit;
        args.max_concurrent_calls = *max_concurrent_calls;
        args.run_deadline_secs = *deadline_secs;
    }
    args
}
