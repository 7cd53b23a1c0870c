use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ToolError;
use crate::schema::{ToolCall, ToolSchema};
use crate::tool::{Tool, ToolContext, ToolOutput};
use crate::validation::{InputValidator, ValidationOutcome};

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    validator: InputValidator,
}

/// Name-indexed set of tools, each paired with its compiled input validator.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        let validator = InputValidator::compile(&name, &tool.input_schema())?;
        if self
            .tools
            .insert(name.clone(), RegisteredTool { tool, validator })
            .is_none()
        {
            self.order.push(name);
        }
        Ok(())
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Result<Self, ToolError> {
        self.register(tool)?;
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas in registration order, suitable for a provider request.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|registered| registered.tool.schema())
            .collect()
    }

    pub fn validate(&self, call: &ToolCall) -> Result<(), ToolError> {
        let registered = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;
        match registered.validator.validate(&call.parameters) {
            ValidationOutcome::Valid => Ok(()),
            outcome => outcome.into_result(&call.name),
        }
    }

    /// Validates then runs a call, bounded by `timeout`. The call is never
    /// started if its input does not match the declared schema.
    pub async fn execute(
        &self,
        call: &ToolCall,
        ctx: ToolContext,
        timeout: Duration,
    ) -> Result<ToolOutput, ToolError> {
        self.validate(call)?;
        let registered = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;

        tracing::debug!(
            target: "tiller_tools::registry",
            tool = %call.name,
            call_id = %call.id,
            "Executing tool"
        );

        match tokio::time::timeout(
            timeout,
            registered.tool.execute(call.parameters.clone(), ctx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    target: "tiller_tools::registry",
                    tool = %call.name,
                    call_id = %call.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Tool execution timed out"
                );
                Err(ToolError::Timeout(call.name.clone()))
            }
        }
    }
}
