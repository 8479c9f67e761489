// Library module for ftpmirror
// Re-exports modules for use in integration tests and the binary

pub mod config;
pub mod error;
pub mod fs;
pub mod logging;
pub mod sync;
