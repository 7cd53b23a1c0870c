use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tiller_tools::{ToolCall, ToolSchema};
use tokio_util::sync::CancellationToken;

use crate::api::error::ProviderError;
use crate::app::domain::event::{AgentMode, Usage};
use crate::app::domain::message::Message;

/// One increment of a streamed completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamChunk {
    TextDelta(String),
    ToolCallDirective(ToolCall),
    /// Last chunk of a successful stream.
    Final { usage: Usage },
}

pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub history: Vec<Message>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub mode: AgentMode,
}

/// A model backend. Implementations only translate between the wire and
/// [`StreamChunk`]s; retries and timeouts are applied by the caller.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        token: CancellationToken,
    ) -> Result<CompletionStream, ProviderError>;
}
