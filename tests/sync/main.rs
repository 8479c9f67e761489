// Test module entry point for sync tests
// Engine level tests run against real temp directories

mod common;

mod executor_tests;
mod queue_tests;
mod reconcile_tests;
