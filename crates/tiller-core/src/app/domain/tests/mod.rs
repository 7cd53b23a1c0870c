//! Domain tests module.
//!
//! - Replay tests: restoring state from the log and checkpoints
//! - Property tests: proptest-based checks of log and fold invariants
