//! Shared utilities for MCP tool handlers.

use std::time::Duration;

use rmcp::model::{CallToolResult, Content};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::AppError;

/// Tool arguments as received from the MCP client.
pub type Args = Map<String, Value>;

/// Deserialize tool arguments into the tool's input struct.
///
/// # Errors
///
/// Returns `invalid_params` naming the tool when the arguments do not match.
pub fn parse_input<T: DeserializeOwned>(tool: &str, args: Args) -> Result<T, rmcp::ErrorData> {
    serde_json::from_value(Value::Object(args)).map_err(|err| {
        rmcp::ErrorData::invalid_params(format!("invalid {tool} parameters: {err}"), None)
    })
}

/// Map an application error onto the MCP error space.
#[must_use]
pub fn to_error_data(err: &AppError) -> rmcp::ErrorData {
    match err {
        AppError::Validation(_) => rmcp::ErrorData::invalid_params(err.to_string(), None),
        AppError::NotFound(_) => rmcp::ErrorData::resource_not_found(err.to_string(), None),
        _ => rmcp::ErrorData::internal_error(err.to_string(), None),
    }
}

/// Wrap a JSON payload as a successful tool result.
#[must_use]
pub fn json_result(value: &Value) -> CallToolResult {
    CallToolResult::success(vec![Content::text(value.to_string())])
}

/// Serialize `value` into JSON.
///
/// # Errors
///
/// Returns `internal_error` if serialization fails.
pub fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, rmcp::ErrorData> {
    serde_json::to_value(value).map_err(|err| {
        rmcp::ErrorData::internal_error(format!("failed to serialize response: {err}"), None)
    })
}

/// Convert an optional millisecond count into a duration.
#[must_use]
pub fn millis(ms: Option<u64>) -> Option<Duration> {
    ms.map(Duration::from_millis)
}

/// Truncate `text` to at most `max_len` bytes, breaking at the nearest
/// preceding char boundary so the result is always valid UTF-8.
/// Appends `"..."` when truncation occurs and `max_len >= 3`.
#[must_use]
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_owned();
    }

    let limit = if max_len < 3 { max_len } else { max_len - 3 };
    let boundary = text
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= limit)
        .last()
        .unwrap_or(0);

    if max_len < 3 {
        text[..boundary].to_owned()
    } else {
        format!("{}...", &text[..boundary])
    }
}
