//! Fixtures shared by this crate's tests and by downstream crates through the
//! `test-utils` feature.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tiller_tools::{InputSchema, Tool, ToolCall, ToolContext, ToolError, ToolOutput, ToolRegistry};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::api::{CompletionRequest, CompletionStream, Provider, ProviderError, StreamChunk};
use crate::app::domain::event::{Event, EventKind, Usage};
use crate::app::domain::runtime::SessionRegistry;
use crate::app::domain::session::{EventStore, EventStoreError, InMemoryEventStore};
use crate::app::domain::types::BranchId;
use crate::api::RetryPolicy;
use crate::config::{RuntimeConfig, Stores};

pub const SCRIPTED_USAGE: Usage = Usage {
    input_tokens: 10,
    output_tokens: 5,
    cost_usd: 0.001,
};

/// One provider round as the scripted provider will play it.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Stream(Vec<Result<StreamChunk, ProviderError>>),
    /// The request itself fails before any chunk.
    Reject(ProviderError),
}

impl ScriptStep {
    pub fn text(text: impl Into<String>) -> Self {
        Self::chunks(vec![StreamChunk::TextDelta(text.into())])
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self::tool_calls(vec![call])
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self::chunks(calls.into_iter().map(StreamChunk::ToolCallDirective).collect())
    }

    /// `chunks` followed by a final chunk carrying [`SCRIPTED_USAGE`].
    pub fn chunks(mut chunks: Vec<StreamChunk>) -> Self {
        chunks.push(StreamChunk::Final {
            usage: SCRIPTED_USAGE,
        });
        Self::Stream(chunks.into_iter().map(Ok).collect())
    }
}

/// Provider that replays a fixed script, one step per request, and records
/// every request it receives.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<ScriptStep>>,
    requests: Mutex<Vec<CompletionRequest>>,
    chunk_delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            chunk_delay: None,
        }
    }

    /// Sleeps before yielding each chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub async fn push(&self, step: ScriptStep) {
        self.steps.lock().await.push_back(step);
    }

    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.steps.lock().await.len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        _token: CancellationToken,
    ) -> Result<CompletionStream, ProviderError> {
        self.requests.lock().await.push(request);
        let step = self.steps.lock().await.pop_front();

        let chunks = match step {
            Some(ScriptStep::Stream(chunks)) => chunks,
            Some(ScriptStep::Reject(error)) => return Err(error),
            None => {
                return Err(ProviderError::InvalidRequest {
                    provider: self.name().to_string(),
                    details: "script exhausted".to_string(),
                });
            }
        };

        let delay = self.chunk_delay;
        Ok(Box::pin(async_stream::stream! {
            for chunk in chunks {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                yield chunk;
            }
        }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GlobParams {
    /// Glob pattern; only `*` and `*.ext` forms are understood.
    pub pattern: String,
}

/// `glob` over a fixed list of paths.
pub struct StubGlobTool {
    files: Vec<String>,
}

impl StubGlobTool {
    pub fn new(files: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            files: files.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for StubGlobTool {
    fn default() -> Self {
        Self::new(["Cargo.toml", "src/lib.rs", "src/main.rs"])
    }
}

#[async_trait]
impl Tool for StubGlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "List files matching a glob pattern"
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::of::<GlobParams>()
    }

    async fn execute(&self, input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let params: GlobParams = serde_json::from_value(input)
            .map_err(|e| ToolError::invalid_params("glob", e.to_string()))?;
        let suffix = params.pattern.trim_start_matches('*');
        let matches: Vec<&str> = self
            .files
            .iter()
            .filter(|file| file.ends_with(suffix))
            .map(String::as_str)
            .collect();
        Ok(ToolOutput::text(matches.join("\n")))
    }
}

/// Sleeps for a fixed time, ignoring cancellation, then reports success.
pub struct SlowTool {
    delay: Duration,
    started: Notify,
    completed: AtomicUsize,
}

impl SlowTool {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            started: Notify::new(),
            completed: AtomicUsize::new(0),
        }
    }

    /// Resolves once a call has begun executing.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Waits, then succeeds"
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::object(serde_json::Map::new(), Vec::new())
    }

    async fn execute(&self, _input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        self.started.notify_one();
        tokio::time::sleep(self.delay).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput::text(format!("waited {}ms", self.delay.as_millis())))
    }
}

/// Always fails with an execution error.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::object(serde_json::Map::new(), Vec::new())
    }

    async fn execute(&self, _input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        Err(ToolError::execution("fail", "boom"))
    }
}

/// In-memory event store whose appends can be switched to fail.
#[derive(Default)]
pub struct FailingEventStore {
    inner: InMemoryEventStore,
    failing: AtomicBool,
}

impl FailingEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_appends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventStore for FailingEventStore {
    async fn append(
        &self,
        branch_id: BranchId,
        kind: &EventKind,
    ) -> Result<Event, EventStoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EventStoreError::io_failure("injected append failure"));
        }
        self.inner.append(branch_id, kind).await
    }

    async fn load_events(
        &self,
        branch_id: BranchId,
        after: u64,
        upto: Option<u64>,
    ) -> Result<Vec<Event>, EventStoreError> {
        self.inner.load_events(branch_id, after, upto).await
    }

    async fn latest_sequence(&self, branch_id: BranchId) -> Result<u64, EventStoreError> {
        self.inner.latest_sequence(branch_id).await
    }

    async fn delete_branch(&self, branch_id: BranchId) -> Result<(), EventStoreError> {
        self.inner.delete_branch(branch_id).await
    }
}

/// Runtime settings with retries fast enough for tests.
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        },
        teardown_timeout_ms: 1_000,
        ..RuntimeConfig::default()
    }
}

pub fn tool_registry(tools: Vec<Arc<dyn Tool>>) -> Result<Arc<ToolRegistry>, ToolError> {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool)?;
    }
    Ok(Arc::new(registry))
}

/// Registry over fresh in-memory stores.
pub fn in_memory_registry(
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    config: RuntimeConfig,
) -> SessionRegistry {
    SessionRegistry::new(Stores::in_memory(), provider, tools, config)
}

/// Filters out bookkeeping events so tests can assert on the turn shape.
pub fn turn_shape(events: &[Event]) -> Vec<&'static str> {
    events
        .iter()
        .filter(|event| !matches!(event.kind, EventKind::Checkpointed { .. }))
        .map(|event| event.kind.name())
        .collect()
}
