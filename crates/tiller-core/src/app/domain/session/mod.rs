pub mod event_log;
pub mod event_store;
pub mod sqlite_store;
pub mod storage;

pub use event_log::{EventLog, EventSubscription, GlobalSubscription};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore};
pub use sqlite_store::SqliteStore;
pub use storage::{
    Branch, BranchStatus, InMemoryStorage, Session, SessionFilter, SessionStorage, StorageError,
};
