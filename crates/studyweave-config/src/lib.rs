//! Configuration for studyweave: model, discovery, validation, source attribution.

mod config;

pub use config::*;
