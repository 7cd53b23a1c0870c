pub mod error;
pub mod provider;
pub mod retry;

pub use error::ProviderError;
pub use provider::{CompletionRequest, CompletionStream, Provider, StreamChunk};
pub use retry::RetryPolicy;
