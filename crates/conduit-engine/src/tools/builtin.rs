use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};

use super::registry::Tool;

/// Returns its `text` argument unchanged. Useful as a stand-in for any
/// side-effect-free tool in tests.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echoes the given text back."
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"text": {"type": "string", "description": "text to echo"}}, "required": ["text"]})
    }
    fn concurrency_safe(&self) -> bool {
        true
    }
    async fn call(&self, args: Value) -> Result<String, String> {
        args.get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| "missing required argument: text".to_string())
    }
}

/// An illustrative in-memory `read_file` — the real filesystem tool is an
/// external collaborator (§1), but the dispatcher's loop-detection and
/// output-spilling contract needs something concrete to exercise.
pub struct ReadFileTool {
    files: Arc<RwLock<HashMap<String, String>>>,
}

impl ReadFileTool {
    pub fn new() -> Self {
        Self { files: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub fn seed(&self, path: impl Into<String>, content: impl Into<String>) {
        self.files.write().insert(path.into(), content.into());
    }
}

impl Default for ReadFileTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "Reads the content of a file at the given path."
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"path": {"type": "string", "description": "file path"}}, "required": ["path"]})
    }
    fn concurrency_safe(&self) -> bool {
        true
    }
    async fn call(&self, args: Value) -> Result<String, String> {
        let path = args.get("path").and_then(Value::as_str).ok_or("missing required argument: path")?;
        self.files.read().get(path).cloned().ok_or_else(|| format!("no such file: {path}"))
    }
}

/// Coerces a raw JSON argument value to the type a declared parameter
/// expects, handling the common "string containing an int/float/bool" case
/// providers sometimes emit.
pub fn coerce_arg(expected_type: &str, value: &Value) -> Result<Value, String> {
    match (expected_type, value) {
        ("integer", Value::String(s)) => s.parse::<i64>().map(Value::from).map_err(|_| format!("cannot coerce '{s}' to integer")),
        ("number", Value::String(s)) => s.parse::<f64>().map(Value::from).map_err(|_| format!("cannot coerce '{s}' to number")),
        ("boolean", Value::String(s)) => match s.as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(format!("cannot coerce '{s}' to boolean")),
        },
        _ => Ok(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_text() {
        let out = EchoTool.call(json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn read_file_returns_seeded_content() {
        let tool = ReadFileTool::new();
        tool.seed("/x", "contents");
        let out = tool.call(json!({"path": "/x"})).await.unwrap();
        assert_eq!(out, "contents");
    }

    #[test]
    fn coerce_string_to_integer() {
        assert_eq!(coerce_arg("integer", &json!("42")).unwrap(), json!(42));
    }

    #[test]
    fn coerce_rejects_garbage() {
        assert!(coerce_arg("integer", &json!("not a number")).is_err());
    }
}
