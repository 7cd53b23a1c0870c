//! Live fan-out over a persistent [`EventStore`].
//!
//! Appends go to the store first and are broadcast only once durable, so
//! subscribers never observe an event the log does not hold. Broadcast
//! receivers can lag; when they do, the subscription re-reads the missing
//! range from the store instead of dropping it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};

use super::event_store::{EventStore, EventStoreError};
use crate::app::domain::event::{Event, EventKind};
use crate::app::domain::types::BranchId;

pub const DEFAULT_EVENT_BUFFER_CAPACITY: usize = 256;

pub struct EventLog {
    store: Arc<dyn EventStore>,
    branches: Mutex<HashMap<BranchId, broadcast::Sender<Event>>>,
    all: broadcast::Sender<Event>,
    capacity: usize,
}

impl EventLog {
    pub fn new(store: Arc<dyn EventStore>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            store,
            branches: Mutex::new(HashMap::new()),
            all,
            capacity,
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    fn sender(&self, branch_id: BranchId) -> Result<broadcast::Sender<Event>, EventStoreError> {
        let mut branches = self
            .branches
            .lock()
            .map_err(|_| EventStoreError::lock_poisoned("branch channels"))?;
        Ok(branches
            .entry(branch_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone())
    }

    fn existing_sender(&self, branch_id: BranchId) -> Option<broadcast::Sender<Event>> {
        self.branches
            .lock()
            .ok()
            .and_then(|branches| branches.get(&branch_id).cloned())
    }

    /// Persists then publishes. A failed append publishes nothing.
    pub async fn append(
        &self,
        branch_id: BranchId,
        kind: EventKind,
    ) -> Result<Event, EventStoreError> {
        let event = match self.store.append(branch_id, &kind).await {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(
                    target: "tiller_core::event_store",
                    branch_id = %branch_id,
                    kind = kind.name(),
                    error = %e,
                    "Failed to append event"
                );
                return Err(e);
            }
        };

        tracing::trace!(
            target: "tiller_core::event_store",
            branch_id = %branch_id,
            sequence = event.sequence,
            kind = event.kind.name(),
            "Event appended"
        );

        if let Some(sender) = self.existing_sender(branch_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event.clone());

        Ok(event)
    }

    /// Finite, ordered history of a branch up to `upto` (inclusive).
    pub async fn replay(
        &self,
        branch_id: BranchId,
        upto: Option<u64>,
    ) -> Result<Vec<Event>, EventStoreError> {
        self.store.load_events(branch_id, 0, upto).await
    }

    /// Historical events from `from_sequence` followed by live ones. The
    /// live receiver is registered before history is read, so nothing
    /// appended in between is missed.
    pub async fn subscribe(
        &self,
        branch_id: BranchId,
        from_sequence: u64,
    ) -> Result<EventSubscription, EventStoreError> {
        let rx = self.sender(branch_id)?.subscribe();
        let next = from_sequence.max(1);
        let history = self.store.load_events(branch_id, next - 1, None).await?;

        Ok(EventSubscription {
            branch_id,
            store: self.store.clone(),
            rx,
            next,
            backlog: history.into(),
            closed: false,
        })
    }

    /// Live tail across all branches.
    pub fn subscribe_all(&self) -> GlobalSubscription {
        GlobalSubscription {
            store: self.store.clone(),
            rx: self.all.subscribe(),
            last_seen: HashMap::new(),
            backlog: VecDeque::new(),
        }
    }

    /// Ends the branch's subscriptions once they have drained what was
    /// appended so far.
    pub fn close_branch(&self, branch_id: BranchId) {
        if let Ok(mut branches) = self.branches.lock() {
            branches.remove(&branch_id);
        }
    }
}

pub struct EventSubscription {
    branch_id: BranchId,
    store: Arc<dyn EventStore>,
    rx: broadcast::Receiver<Event>,
    next: u64,
    backlog: VecDeque<Event>,
    closed: bool,
}

impl EventSubscription {
    pub fn branch_id(&self) -> BranchId {
        self.branch_id
    }

    /// Next event in sequence order, or `None` once the branch is closed.
    pub async fn recv(&mut self) -> Option<Result<Event, EventStoreError>> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if event.sequence < self.next {
                    continue;
                }
                self.next = event.sequence + 1;
                return Some(Ok(event));
            }

            if self.closed {
                return None;
            }

            match self.rx.recv().await {
                Ok(event) if event.sequence < self.next => {}
                Ok(event) if event.sequence == self.next => {
                    self.next += 1;
                    return Some(Ok(event));
                }
                Ok(event) => {
                    if let Err(e) = self.backfill(Some(event.sequence - 1)).await {
                        return Some(Err(e));
                    }
                    self.backlog.push_back(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target: "tiller_core::event_store",
                        branch_id = %self.branch_id,
                        skipped,
                        next = self.next,
                        "Subscriber lagged; backfilling from store"
                    );
                    if let Err(e) = self.backfill(None).await {
                        return Some(Err(e));
                    }
                }
                Err(RecvError::Closed) => {
                    self.closed = true;
                    if let Err(e) = self.backfill(None).await {
                        return Some(Err(e));
                    }
                }
            }
        }
    }

    async fn backfill(&mut self, upto: Option<u64>) -> Result<(), EventStoreError> {
        let missing = self
            .store
            .load_events(self.branch_id, self.next - 1, upto)
            .await?;
        self.backlog.extend(missing);
        Ok(())
    }

    pub fn into_stream(mut self) -> impl Stream<Item = Result<Event, EventStoreError>> + Send {
        async_stream::stream! {
            while let Some(item) = self.recv().await {
                yield item;
            }
        }
    }
}

/// Tail of every branch's appends. Gaps are repaired per branch from the
/// store, starting from the first event seen for that branch.
pub struct GlobalSubscription {
    store: Arc<dyn EventStore>,
    rx: broadcast::Receiver<Event>,
    last_seen: HashMap<BranchId, u64>,
    backlog: VecDeque<Event>,
}

impl GlobalSubscription {
    pub async fn recv(&mut self) -> Option<Result<Event, EventStoreError>> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                let last = self.last_seen.entry(event.branch_id).or_insert(0);
                if event.sequence <= *last {
                    continue;
                }
                *last = event.sequence;
                return Some(Ok(event));
            }

            match self.rx.recv().await {
                Ok(event) => {
                    match self.last_seen.get(&event.branch_id).copied() {
                        Some(last) if event.sequence <= last => continue,
                        Some(last) if event.sequence > last + 1 => {
                            match self
                                .store
                                .load_events(event.branch_id, last, Some(event.sequence - 1))
                                .await
                            {
                                Ok(missing) => self.backlog.extend(missing),
                                Err(e) => return Some(Err(e)),
                            }
                        }
                        _ => {}
                    }
                    self.backlog.push_back(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target: "tiller_core::event_store",
                        skipped,
                        "Global subscriber lagged; gaps are repaired per branch"
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(mut self) -> impl Stream<Item = Result<Event, EventStoreError>> + Send {
        async_stream::stream! {
            while let Some(item) = self.recv().await {
                yield item;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::domain::session::InMemoryEventStore;
    use futures::StreamExt;
    use tokio::time::{Duration, timeout};

    fn marker(turn: u64) -> EventKind {
        EventKind::Checkpointed { turn, sequence: 0 }
    }

    fn log(capacity: usize) -> EventLog {
        EventLog::new(Arc::new(InMemoryEventStore::new()), capacity)
    }

    async fn next_seq(sub: &mut EventSubscription) -> u64 {
        timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .sequence
    }

    #[tokio::test]
    async fn subscribe_replays_history_then_live() {
        let log = log(16);
        let branch_id = BranchId::new();
        for turn in 1..=3 {
            log.append(branch_id, marker(turn)).await.unwrap();
        }

        let mut sub = log.subscribe(branch_id, 2).await.unwrap();
        log.append(branch_id, marker(4)).await.unwrap();

        assert_eq!(next_seq(&mut sub).await, 2);
        assert_eq!(next_seq(&mut sub).await, 3);
        assert_eq!(next_seq(&mut sub).await, 4);
    }

    #[tokio::test]
    async fn lagged_subscriber_backfills_without_loss() {
        let log = log(2);
        let branch_id = BranchId::new();
        let mut sub = log.subscribe(branch_id, 1).await.unwrap();

        for turn in 1..=20 {
            log.append(branch_id, marker(turn)).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..20 {
            seen.push(next_seq(&mut sub).await);
        }
        assert_eq!(seen, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn many_subscribers_see_identical_order() {
        let log = Arc::new(log(8));
        let branch_id = BranchId::new();
        let mut subs = Vec::new();
        for _ in 0..8 {
            subs.push(log.subscribe(branch_id, 1).await.unwrap());
        }

        let writer = {
            let log = log.clone();
            tokio::spawn(async move {
                for turn in 1..=50 {
                    log.append(branch_id, marker(turn)).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        for mut sub in subs {
            let mut seen = Vec::new();
            for _ in 0..50 {
                seen.push(next_seq(&mut sub).await);
            }
            assert_eq!(seen, (1..=50).collect::<Vec<_>>());
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn closing_a_branch_ends_its_stream() {
        let log = log(16);
        let branch_id = BranchId::new();
        log.append(branch_id, marker(1)).await.unwrap();

        let sub = log.subscribe(branch_id, 1).await.unwrap();
        log.append(branch_id, marker(2)).await.unwrap();
        log.close_branch(branch_id);

        let events: Vec<_> = timeout(Duration::from_secs(2), sub.into_stream().collect::<Vec<_>>())
            .await
            .unwrap();
        let sequences: Vec<u64> = events.into_iter().map(|e| e.unwrap().sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test]
    async fn global_tail_spans_branches() {
        let log = log(16);
        let mut tail = log.subscribe_all();
        let a = BranchId::new();
        let b = BranchId::new();

        log.append(a, marker(1)).await.unwrap();
        log.append(b, marker(1)).await.unwrap();
        log.append(a, marker(2)).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = timeout(Duration::from_secs(2), tail.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            seen.push((event.branch_id == a, event.sequence));
        }
        assert_eq!(seen, vec![(true, 1), (false, 1), (true, 2)]);
    }
}
