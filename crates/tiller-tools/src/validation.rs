use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

use crate::error::ToolError;
use crate::schema::InputSchema;

/// Result of checking a value against a tool's input schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Invalid { errors: Vec<String> },
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }

    pub fn into_result(self, tool_name: &str) -> Result<(), ToolError> {
        match self {
            ValidationOutcome::Valid => Ok(()),
            ValidationOutcome::Invalid { errors } => {
                Err(ToolError::invalid_params(tool_name, errors.join("; ")))
            }
        }
    }
}

/// A schema compiled once and reused for every call to the same tool.
pub struct InputValidator {
    compiled: JSONSchema,
}

impl std::fmt::Debug for InputValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputValidator").finish_non_exhaustive()
    }
}

impl InputValidator {
    pub fn compile(tool_name: &str, schema: &InputSchema) -> Result<Self, ToolError> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema.as_value())
            .map_err(|e| ToolError::invalid_schema(tool_name, e.to_string()))?;
        Ok(Self { compiled })
    }

    pub fn validate(&self, input: &Value) -> ValidationOutcome {
        match self.compiled.validate(input) {
            Ok(()) => ValidationOutcome::Valid,
            Err(errors) => ValidationOutcome::Invalid {
                errors: errors
                    .map(|e| {
                        let path = e.instance_path.to_string();
                        if path.is_empty() {
                            e.to_string()
                        } else {
                            format!("{path}: {e}")
                        }
                    })
                    .collect(),
            },
        }
    }
}

/// One-shot validation for callers that do not keep a compiled validator.
pub fn validate_input(schema: &InputSchema, input: &Value) -> ValidationOutcome {
    match InputValidator::compile("input", schema) {
        Ok(validator) => validator.validate(input),
        Err(e) => ValidationOutcome::Invalid {
            errors: vec![e.to_string()],
        },
    }
}
