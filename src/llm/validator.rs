// Schema validation for model-generated tool calls.
// Pure functions: the same calls and tools always produce the same
// valid/invalid partition and the same retry guidance.

use serde::{Deserialize, Serialize};

use super::provider::{Tool, ToolCall};

/// Why a tool call was rejected
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum InvalidReason {
    /// No tool with this name was offered to the model
    UnknownTool,
    /// Arguments were not parseable JSON
    MalformedArguments,
    /// Arguments parsed but violated the tool's schema
    SchemaViolation,
}

/// A rejected tool call with enough context to coach the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidToolCall {
    pub call: ToolCall,
    pub reason: InvalidReason,
    /// Human-readable detail: schema path plus expected/actual
    pub detail: String,
}

/// Partition `calls` into schema-conforming and rejected calls.
///
/// Every call lands in exactly one of the two buckets. Validation stops at
/// the first violation per call, retaining the schema path.
pub fn validate(calls: &[ToolCall], tools: &[Tool]) -> (Vec<ToolCall>, Vec<InvalidToolCall>) {
    let mut valid = Vec::new();
    let mut invalid = Vec::new();

    for call in calls {
        match check_call(call, tools) {
            Ok(()) => valid.push(call.clone()),
            Err((reason, detail)) => invalid.push(InvalidToolCall {
                call: call.clone(),
                reason,
                detail,
            }),
        }
    }

    (valid, invalid)
}

fn check_call(call: &ToolCall, tools: &[Tool]) -> Result<(), (InvalidReason, String)> {
    let tool = tools.iter().find(|t| t.name == call.name).ok_or_else(|| {
        let known: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        (
            InvalidReason::UnknownTool,
            format!(
                "no tool named '{}'; available tools: {}",
                call.name,
                known.join(", ")
            ),
        )
    })?;

    let arguments: serde_json::Value = call.parsed_arguments().map_err(|err| {
        (
            InvalidReason::MalformedArguments,
            format!("arguments are not valid JSON: {}", err),
        )
    })?;

    if !arguments.is_object() {
        return Err((
            InvalidReason::SchemaViolation,
            format!("arguments must be a JSON object, got {}", type_name(&arguments)),
        ));
    }

    let validator = jsonschema::validator_for(&tool.parameters).map_err(|err| {
        (
            InvalidReason::SchemaViolation,
            format!("tool schema itself is invalid: {}", err),
        )
    })?;

    if let Some(error) = validator.iter_errors(&arguments).next() {
        let path = error.instance_path.to_string();
        let at = if path.is_empty() {
            "at root".to_string()
        } else {
            format!("at {}", path)
        };
        return Err((
            InvalidReason::SchemaViolation,
            format!("{}: {}", at, error),
        ));
    }

    Ok(())
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Build a corrective system message for rejected calls.
///
/// Enumerates each offending call with its authoritative schema and common
/// remediation hints so the next attempt can self-correct.
pub fn retry_guidance(invalid: &[InvalidToolCall], tools: &[Tool]) -> String {
    let mut out = String::from(
        "Some tool calls were rejected. Correct them and call the tools again.\n",
    );

    for item in invalid {
        out.push_str(&format!(
            "\nRejected call to '{}' with arguments {}:\n  problem: {}\n",
            item.call.name, item.call.arguments, item.detail
        ));

        if let Some(tool) = tools.iter().find(|t| t.name == item.call.name) {
            out.push_str(&format!(
                "  schema for '{}': {}\n",
                tool.name,
                serde_json::to_string(&tool.parameters).unwrap_or_else(|_| "{}".to_string())
            ));
            for hint in remediation_hints(tool) {
                out.push_str(&format!("  hint: {}\n", hint));
            }
        }
    }

    out.push_str(
        "\nGeneral rules: argument payloads must be JSON objects, enum values must \
         match exactly, required fields may not be omitted, and numbers must not be \
         quoted as strings.",
    );
    out
}

fn remediation_hints(tool: &Tool) -> Vec<String> {
    let mut hints = Vec::new();
    let schema = &tool.parameters;

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        let names: Vec<&str> = required.iter().filter_map(|v| v.as_str()).collect();
        if !names.is_empty() {
            hints.push(format!("required fields: {}", names.join(", ")));
        }
    }

    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (name, prop) in props {
            if let Some(values) = prop.get("enum").and_then(|e| e.as_array()) {
                let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                hints.push(format!("'{}' must be one of: {}", name, rendered.join(", ")));
            }
        }
    }

    hints
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_tool() -> Tool {
        Tool::new(
            "add",
            "Add two integers",
            json!({
                "type": "object",
                "properties": {
                    "a": { "type": "integer" },
                    "b": { "type": "integer" }
                },
                "required": ["a", "b"]
            }),
        )
    }

    fn search_tool() -> Tool {
        Tool::new(
            "search",
            "Search with a mode",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "mode": { "type": "string", "enum": ["fast", "deep"] }
                },
                "required": ["query"]
            }),
        )
    }

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    #[test]
    fn partition_is_exhaustive_and_disjoint() {
        let tools = vec![add_tool()];
        let calls = vec![
            call("add", r#"{"a": 2, "b": 2}"#),
            call("add", r#"{"a": "two", "b": 2}"#),
            call("missing", "{}"),
        ];

        let (valid, invalid) = validate(&calls, &tools);
        assert_eq!(valid.len() + invalid.len(), calls.len());
        assert_eq!(valid.len(), 1);
        assert_eq!(invalid.len(), 2);
    }

    #[test]
    fn unknown_tool_rejected() {
        let (_, invalid) = validate(&[call("nope", "{}")], &[add_tool()]);
        assert_eq!(invalid[0].reason, InvalidReason::UnknownTool);
        assert!(invalid[0].detail.contains("add"));
    }

    #[test]
    fn malformed_json_rejected() {
        let (_, invalid) = validate(&[call("add", "{not json")], &[add_tool()]);
        assert_eq!(invalid[0].reason, InvalidReason::MalformedArguments);
    }

    #[test]
    fn non_object_arguments_rejected() {
        let (_, invalid) = validate(&[call("add", "[1, 2]")], &[add_tool()]);
        assert_eq!(invalid[0].reason, InvalidReason::SchemaViolation);
        assert!(invalid[0].detail.contains("array"));
    }

    #[test]
    fn schema_violation_keeps_path() {
        let (_, invalid) = validate(
            &[call("add", r#"{"a": "two", "b": 2}"#)],
            &[add_tool()],
        );
        assert_eq!(invalid[0].reason, InvalidReason::SchemaViolation);
        assert!(invalid[0].detail.contains("/a"), "{}", invalid[0].detail);
    }

    #[test]
    fn missing_required_field_rejected() {
        let (_, invalid) = validate(&[call("add", r#"{"a": 1}"#)], &[add_tool()]);
        assert_eq!(invalid[0].reason, InvalidReason::SchemaViolation);
    }

    #[test]
    fn valid_call_passes() {
        let (valid, invalid) = validate(
            &[call("search", r#"{"query": "hi", "mode": "fast"}"#)],
            &[search_tool()],
        );
        assert_eq!(valid.len(), 1);
        assert!(invalid.is_empty());
    }

    #[test]
    fn validation_is_deterministic() {
        let tools = vec![add_tool(), search_tool()];
        let calls = vec![
            call("add", r#"{"a": 1, "b": 2}"#),
            call("search", r#"{"mode": "slow"}"#),
        ];

        let first = validate(&calls, &tools);
        let second = validate(&calls, &tools);
        assert_eq!(first.0, second.0);
        assert_eq!(first.1.len(), second.1.len());
        assert_eq!(first.1[0].detail, second.1[0].detail);

        let g1 = retry_guidance(&first.1, &tools);
        let g2 = retry_guidance(&second.1, &tools);
        assert_eq!(g1, g2);
    }

    #[test]
    fn guidance_includes_schema_and_hints() {
        let tools = vec![search_tool()];
        let (_, invalid) = validate(&[call("search", r#"{"mode": "slow"}"#)], &tools);
        let guidance = retry_guidance(&invalid, &tools);

        assert!(guidance.contains("search"));
        assert!(guidance.contains("required fields: query"));
        assert!(guidance.contains(r#""fast""#));
        assert!(guidance.contains("schema for 'search'"));
    }
}
