//! Wire-shape types for the three kinds of message QMP sends (spec §4.2,
//! §6). Modeled as closed sum types per Design Note 9(b).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QmpErrorBody {
    pub class: String,
    pub desc: String,
}

/// A decoded line from the QMP socket: either a reply to the oldest
/// outstanding request, or an asynchronous event.
#[derive(Debug, Clone)]
pub enum Incoming {
    Response(ResponseBody),
    Event(EventBody),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseBody {
    #[serde(rename = "return")]
    pub result: Option<serde_json::Value>,
    pub error: Option<QmpErrorBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBody {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Greeting {
    #[serde(rename = "QMP")]
    pub qmp: GreetingBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GreetingBody {
    pub version: serde_json::Value,
    pub capabilities: Vec<serde_json::Value>,
}

/// Parse one newline-delimited JSON line into its message shape. A response
/// has `return` or `error`; an event has `event`. Anything else is a
/// protocol violation.
pub fn parse_line(line: &str) -> Result<Incoming, String> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| format!("invalid json: {e}"))?;

    if value.get("event").is_some() {
        let body: EventBody =
            serde_json::from_value(value).map_err(|e| format!("invalid event: {e}"))?;
        return Ok(Incoming::Event(body));
    }

    if value.get("return").is_some() || value.get("error").is_some() {
        let body: ResponseBody =
            serde_json::from_value(value).map_err(|e| format!("invalid response: {e}"))?;
        return Ok(Incoming::Response(body));
    }

    Err(format!("unrecognized qmp message shape: {line}"))
}
