//! Backend control pipe wire shapes (spec §6): duplex line-delimited JSON
//! frames between the parent (Driver Bridge) and the backend child
//! (`qemu-backend-child`), each carrying a monotonic token so responses can
//! be matched out of arrival order — the parent "blocks on the response of
//! its own token, discarding or queueing others" (spec §4.6).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFrame {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    pub token: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub rsp: ResponseBody,
    pub token: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Ok(serde_json::Value),
    Error { error: bool, message: String },
}

impl ResponseBody {
    pub fn ok(value: serde_json::Value) -> Self {
        ResponseBody::Ok(value)
    }

    pub fn err(message: impl Into<String>) -> Self {
        ResponseBody::Error { error: true, message: message.into() }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ResponseBody::Ok(_))
    }
}

/// Per-sender monotonically increasing token generator (spec §6).
#[derive(Debug, Default)]
pub struct TokenCounter(AtomicU64);

impl TokenCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_counter_is_monotonic() {
        let counter = TokenCounter::new();
        let a = counter.next();
        let b = counter.next();
        assert!(b > a);
    }

    #[test]
    fn response_body_round_trips_through_json() {
        let ok = ResponseBody::ok(serde_json::json!({"status": "running"}));
        let encoded = serde_json::to_string(&ok).unwrap();
        let decoded: ResponseBody = serde_json::from_str(&encoded).unwrap();
        assert!(decoded.is_ok());

        let err = ResponseBody::err("vm already started");
        let encoded = serde_json::to_string(&err).unwrap();
        let decoded: ResponseBody = serde_json::from_str(&encoded).unwrap();
        assert!(!decoded.is_ok());
    }
}
