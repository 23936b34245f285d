// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

/// Persistence seam for the per-run trace.
///
/// The agent loop appends a `tool_call` event before executing each call and
/// a `tool_result` event after, with opaque JSON payloads; implementations
/// decide where they land.  Sinks are pre-bound to their run.
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn log_trace(&self, event_type: &str, data: serde_json::Value);
}

/// In-memory sink for tests.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    pub events: std::sync::Mutex<Vec<(String, serde_json::Value)>>,
}

#[cfg(test)]
#[async_trait]
impl TraceSink for RecordingSink {
    async fn log_trace(&self, event_type: &str, data: serde_json::Value) {
        self.events
            .lock()
            .unwrap()
            .push((event_type.to_string(), data));
    }
}
