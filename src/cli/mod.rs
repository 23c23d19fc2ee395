//! Command-line interface for studyweave
//!
//! - `args`: clap definitions
//! - `run`: entry point, config discovery, dispatch, error output
//! - `commands`: command implementations

pub mod args;
mod commands;
mod run;


pub use args::{CacheCommands, Cli, Commands};
pub use run::run;
