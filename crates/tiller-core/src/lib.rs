// Orchestration core: event log, actor processes, steering and checkpoints

pub mod api;
pub mod app;
pub mod config;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod utils;
