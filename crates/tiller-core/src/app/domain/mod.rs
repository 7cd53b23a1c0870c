pub mod checkpoint;
pub mod event;
pub mod message;
pub mod runtime;
pub mod session;
pub mod state;
pub mod types;

#[cfg(test)]
mod tests;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointManager, CheckpointStore};
pub use event::{Event, EventKind};
pub use message::{Message, Role, fold_history, fold_transcript};
pub use state::{ActorState, Phase, TurnCursor};
pub use types::{BranchId, MessageId, SessionId};
