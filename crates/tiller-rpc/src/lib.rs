//! RPC boundary over the Tiller orchestration core.
//!
//! [`AgentService`] exposes the session, message, steering and event-stream
//! operations a remote client needs. Every failure crosses the boundary as a
//! single tagged [`RpcError`].

pub mod error;
pub mod service;
pub mod types;

pub use error::RpcError;
pub use service::{AgentService, EventStream};
pub use types::{RpcRequest, RpcResponse, SessionCreated, SessionInfo};
