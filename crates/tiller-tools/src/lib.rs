pub mod error;
pub mod registry;
pub mod schema;
pub mod tool;
pub mod validation;

pub use error::ToolError;
pub use registry::ToolRegistry;
pub use schema::{InputSchema, ToolCall, ToolSchema};
pub use tool::{Tool, ToolContext, ToolOutput};
pub use validation::{InputValidator, ValidationOutcome, validate_input};
