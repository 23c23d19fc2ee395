//! CLI command implementations

mod cache;
mod enhance;

pub use cache::execute_cache_command;
pub use enhance::execute_enhance_command;
