use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON schema describing a tool's input. Schemas are plain data; validation
/// compiles them at registration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputSchema(Value);

impl InputSchema {
    pub fn new(schema: Value) -> Self {
        Self(strip_meta_schema(schema))
    }

    /// Derive the schema from a parameter type.
    pub fn of<T: JsonSchema>() -> Self {
        Self::new(schemars::schema_for!(T).to_value())
    }

    pub fn object(properties: serde_json::Map<String, Value>, required: Vec<String>) -> Self {
        Self(serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn schema_type(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    pub fn required(&self) -> Vec<&str> {
        self.0
            .get("required")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

// The validator pins its draft explicitly, so the `$schema` marker is dropped.
fn strip_meta_schema(mut schema: Value) -> Value {
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
    }
    schema
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub parameters: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parameters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;

    #[derive(JsonSchema)]
    #[expect(dead_code)]
    struct GlobParams {
        pattern: String,
        path: Option<String>,
    }

    #[test]
    fn derived_schema_lists_required_fields() {
        let schema = InputSchema::of::<GlobParams>();

        assert_eq!(schema.schema_type(), Some("object"));
        assert_eq!(schema.required(), vec!["pattern"]);
        assert!(schema.as_value().get("$schema").is_none());
    }

    #[test]
    fn object_builder_produces_object_schema() {
        let mut props = serde_json::Map::new();
        props.insert("query".to_string(), serde_json::json!({"type": "string"}));
        let schema = InputSchema::object(props, vec!["query".to_string()]);

        assert_eq!(schema.schema_type(), Some("object"));
        assert_eq!(schema.required(), vec!["query"]);
    }
}
