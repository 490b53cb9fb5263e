use crate::clients::ToolDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for ToolError {
    fn from(error: std::io::Error) -> Self {
        ToolError::IoError(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<ToolInfo> for ToolDefinition {
    fn from(info: ToolInfo) -> Self {
        ToolDefinition {
            name: info.name,
            description: info.description,
            parameters: info.parameters,
        }
    }
}

#[async_trait]
pub trait ToolTrait: Send + Sync {
    fn info(&self) -> ToolInfo;
    async fn execute(&self, arguments: Value) -> Result<Value, ToolError>;
}

/// Anything the agents can dispatch a named tool call to: the local
/// [`ToolManager`] or a set of MCP servers.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;
    async fn execute(&self, name: &str, arguments: Value) -> Result<Value, ToolError>;
}

/// Text handed back to the model for a tool result.
pub fn observation_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Checks that `arguments` has the shape `schema` declares: an object, the
/// required properties present, primitive types and enums respected.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), ToolError> {
    let Some(object) = arguments.as_object() else {
        return Err(ToolError::InvalidArguments(format!(
            "expected a JSON object, got {}",
            json_type_name(arguments)
        )));
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for name in required.iter().filter_map(|n| n.as_str()) {
            if !object.contains_key(name) {
                return Err(ToolError::InvalidArguments(format!(
                    "Missing '{}' argument",
                    name
                )));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Ok(());
    };

    for (name, value) in object {
        let Some(property) = properties.get(name) else {
            continue;
        };

        if let Some(expected) = property.get("type") {
            let allowed: Vec<&str> = match expected {
                Value::String(t) => vec![t.as_str()],
                Value::Array(types) => types.iter().filter_map(|t| t.as_str()).collect(),
                _ => Vec::new(),
            };
            if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(t, value)) {
                return Err(ToolError::InvalidArguments(format!(
                    "'{}' should be {}, got {}",
                    name,
                    allowed.join(" or "),
                    json_type_name(value)
                )));
            }
        }

        if let Some(options) = property.get("enum").and_then(|e| e.as_array()) {
            if !options.contains(value) {
                return Err(ToolError::InvalidArguments(format!(
                    "'{}' must be one of {}",
                    name,
                    Value::Array(options.clone())
                )));
            }
        }
    }

    Ok(())
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|n| n.is_finite() && n.fract() == 0.0)
        }
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn required_str<'a>(arguments: &'a Value, name: &str) -> Result<&'a str, ToolError> {
    arguments
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{}' argument", name)))
}

/// Joins a model-supplied relative path onto the tool's base directory.
fn resolve_path(base_path: &Path, path: &str) -> Result<PathBuf, ToolError> {
    let relative = Path::new(path);
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(ToolError::InvalidArguments(format!(
            "path must stay inside the working directory: {}",
            path
        )));
    }
    Ok(base_path.join(relative))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl Operation {
    fn symbol(&self) -> &'static str {
        match self {
            Operation::Add => "+",
            Operation::Subtract => "-",
            Operation::Multiply => "*",
            Operation::Divide => "/",
        }
    }
}

#[derive(Debug, Deserialize)]
struct CalculatorArgs {
    operation: Operation,
    a: f64,
    b: f64,
}

pub struct CalculatorTool;

#[async_trait]
impl ToolTrait for CalculatorTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "calculator".to_string(),
            description: "Perform a basic arithmetic operation on two numbers".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "operation": {
                        "type": "string",
                        "enum": ["add", "subtract", "multiply", "divide"],
                        "description": "The operation to perform"
                    },
                    "a": {
                        "type": "number",
                        "description": "First operand"
                    },
                    "b": {
                        "type": "number",
                        "description": "Second operand"
                    }
                },
                "required": ["operation", "a", "b"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: CalculatorArgs = serde_json::from_value(arguments)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let result = match args.operation {
            Operation::Add => args.a + args.b,
            Operation::Subtract => args.a - args.b,
            Operation::Multiply => args.a * args.b,
            Operation::Divide => {
                if args.b == 0.0 {
                    return Err(ToolError::ExecutionFailed("Division by zero".to_string()));
                }
                args.a / args.b
            }
        };

        Ok(serde_json::json!({
            "expression": format!("{} {} {}", args.a, args.operation.symbol(), args.b),
            "result": result
        }))
    }
}

pub struct FileReadTool {
    base_path: PathBuf,
}

impl FileReadTool {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }
}

#[async_trait]
impl ToolTrait for FileReadTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "read_file".to_string(),
            description: "Read the contents of a file".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path to the file to read, relative to the working directory"
                    }
                },
                "required": ["path"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let path = required_str(&arguments, "path")?;
        let full_path = resolve_path(&self.base_path, path)?;

        let content = tokio::fs::read_to_string(&full_path).await?;
        Ok(serde_json::json!({
            "success": true,
            "content": content,
            "path": path
        }))
    }
}

pub struct FileWriteTool {
    base_path: PathBuf,
}

impl FileWriteTool {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }
}

#[async_trait]
impl ToolTrait for FileWriteTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "write_file".to_string(),
            description: "Write content to a file".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path to the file to write, relative to the working directory"
                    },
                    "content": {
                        "type": "string",
                        "description": "Content to write to the file"
                    }
                },
                "required": ["path", "content"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let path = required_str(&arguments, "path")?;
        let content = required_str(&arguments, "content")?;
        let full_path = resolve_path(&self.base_path, path)?;

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full_path, content).await?;

        Ok(serde_json::json!({
            "success": true,
            "path": path,
            "bytes_written": content.len()
        }))
    }
}

pub struct ListDirTool {
    base_path: PathBuf,
}

impl ListDirTool {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }
}

#[async_trait]
impl ToolTrait for ListDirTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "list_dir".to_string(),
            description: "List directory contents".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Directory to list, relative to the working directory (default: .)"
                    }
                }
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let path = arguments.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let full_path = resolve_path(&self.base_path, path)?;

        let mut entries = tokio::fs::read_dir(&full_path).await?;
        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            items.push(serde_json::json!({
                "name": entry.file_name().to_string_lossy().to_string(),
                "is_dir": metadata.is_dir(),
                "size": metadata.len()
            }));
        }
        items.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

        Ok(serde_json::json!({
            "success": true,
            "path": path,
            "items": items
        }))
    }
}

#[derive(Default)]
pub struct ToolManager {
    tools: BTreeMap<String, Box<dyn ToolTrait>>,
}

impl ToolManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Box<dyn ToolTrait>) {
        let name = tool.info().name;
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous definition replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn ToolTrait> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn get_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|tool| tool.info().into()).collect()
    }
}

#[async_trait]
impl ToolExecutor for ToolManager {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.get_definitions()
    }

    async fn execute(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(format!("Unknown tool: {}", name)))?;

        validate_arguments(&tool.info().parameters, &arguments)?;

        tracing::debug!(tool = %name, "executing local tool");
        tool.execute(arguments).await
    }
}

pub fn default_tools(base_path: PathBuf) -> ToolManager {
    let mut manager = ToolManager::new();

    manager.register(Box::new(CalculatorTool));
    manager.register(Box::new(FileReadTool::new(base_path.clone())));
    manager.register(Box::new(FileWriteTool::new(base_path.clone())));
    manager.register(Box::new(ListDirTool::new(base_path)));

    manager
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn calculator_schema() -> Value {
        CalculatorTool.info().parameters
    }

    #[rstest]
    #[case(serde_json::json!({"operation": "add", "a": 1, "b": 2.5}), true)]
    #[case(serde_json::json!({"operation": "add", "a": 1}), false)]
    #[case(serde_json::json!({"operation": "add", "a": "1", "b": 2}), false)]
    #[case(serde_json::json!({"operation": "modulo", "a": 1, "b": 2}), false)]
    #[case(serde_json::json!([1, 2]), false)]
    fn test_validate_arguments(#[case] arguments: Value, #[case] valid: bool) {
        assert_eq!(validate_arguments(&calculator_schema(), &arguments).is_ok(), valid);
    }

    #[test]
    fn test_validate_integer_and_union_types() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "count": {"type": "integer"},
                "label": {"type": ["string", "null"]}
            }
        });
        assert!(validate_arguments(&schema, &serde_json::json!({"count": 3, "label": null})).is_ok());
        assert!(validate_arguments(&schema, &serde_json::json!({"count": 3.0})).is_ok());
        assert!(validate_arguments(&schema, &serde_json::json!({"count": -2.0})).is_ok());
        assert!(validate_arguments(&schema, &serde_json::json!({"count": 3.5})).is_err());
        assert!(validate_arguments(&schema, &serde_json::json!({"extra": true})).is_ok());
    }

    #[rstest]
    #[case("add", 6.0, 3.0, 9.0)]
    #[case("subtract", 6.0, 3.0, 3.0)]
    #[case("multiply", 6.0, 3.0, 18.0)]
    #[case("divide", 6.0, 3.0, 2.0)]
    #[tokio::test]
    async fn test_calculator(#[case] operation: &str, #[case] a: f64, #[case] b: f64, #[case] expected: f64) {
        let result = CalculatorTool
            .execute(serde_json::json!({"operation": operation, "a": a, "b": b}))
            .await
            .unwrap();
        assert_eq!(result["result"].as_f64(), Some(expected));
    }

    #[tokio::test]
    async fn test_calculator_division_by_zero() {
        let err = CalculatorTool
            .execute(serde_json::json!({"operation": "divide", "a": 1, "b": 0}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn test_file_tools_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let tools = default_tools(dir.path().to_path_buf());

        tools
            .execute(
                "write_file",
                serde_json::json!({"path": "notes/todo.txt", "content": "buy milk"}),
            )
            .await
            .unwrap();

        let read = tools
            .execute("read_file", serde_json::json!({"path": "notes/todo.txt"}))
            .await
            .unwrap();
        assert_eq!(read["content"], "buy milk");

        let listing = tools
            .execute("list_dir", serde_json::json!({"path": "notes"}))
            .await
            .unwrap();
        assert_eq!(listing["items"][0]["name"], "todo.txt");
        assert_eq!(listing["items"][0]["is_dir"], false);
    }

    #[tokio::test]
    async fn test_paths_outside_workdir_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tools = default_tools(dir.path().to_path_buf());

        let err = tools
            .execute("read_file", serde_json::json!({"path": "../secret"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn test_manager_unknown_tool_and_validation() {
        let tools = default_tools(PathBuf::from("."));

        let err = tools.execute("nope", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));

        let err = tools
            .execute("calculator", serde_json::json!({"a": 1, "b": 2}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn test_definitions_sorted() {
        let tools = default_tools(PathBuf::from("."));
        let names: Vec<String> = tools.get_definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["calculator", "list_dir", "read_file", "write_file"]);
    }

    #[test]
    fn test_observation_text() {
        assert_eq!(observation_text(&Value::String("plain".to_string())), "plain");
        assert_eq!(observation_text(&serde_json::json!({"a": 1})), r#"{"a":1}"#);
    }
}
