use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::constants::RATE_LIMIT_BODY_MARKER;
use crate::models::usage::{CacheCreation, UsageRecord};

// Splits an SSE byte stream into complete lines. Forwarded bytes keep their
// original line terminators; a partial trailing line is buffered across
// chunks.
#[derive(Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            lines.push(self.buf.split_to(pos + 1).freeze());
        }
        lines
    }

    pub fn take_remainder(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }
}

// Tallies usage telemetry from the `data:` lines of a relayed SSE stream.
// One record per message: opened by message_start, closed by the
// message_delta that carries output_tokens. Parsing never touches the bytes
// being forwarded.
pub struct UsageAccumulator {
    fallback_model: String,
    records: Vec<UsageRecord>,
    current: Option<UsageRecord>,
    current_has_input: bool,
    last_model: Option<String>,
    rate_limit_detected: bool,
}

impl UsageAccumulator {
    pub fn new(fallback_model: &str) -> Self {
        Self {
            fallback_model: fallback_model.to_string(),
            records: Vec::new(),
            current: None,
            current_has_input: false,
            last_model: None,
            rate_limit_detected: false,
        }
    }

    pub fn observe_line(&mut self, line: &str) {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let Some(data) = trimmed.strip_prefix("data: ") else {
            return;
        };
        let Ok(event) = serde_json::from_str::<Value>(data.trim()) else {
            return;
        };

        match event.get("type").and_then(|v| v.as_str()) {
            Some("message_start") => self.on_message_start(&event),
            Some("message_delta") => self.on_message_delta(&event),
            Some("error") => {
                let message = event
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .or_else(|| event.get("message").and_then(|m| m.as_str()))
                    .unwrap_or_default();
                if message.to_ascii_lowercase().contains(RATE_LIMIT_BODY_MARKER) {
                    self.rate_limit_detected = true;
                }
            }
            _ => {}
        }
    }

    fn on_message_start(&mut self, event: &Value) {
        // An unfinished record means the upstream opened a new message
        // before closing the previous one; keep what was observed.
        if let Some(previous) = self.current.take() {
            self.records.push(previous);
        }

        let message = event.get("message");
        let usage = message.and_then(|m| m.get("usage"));
        let mut record = UsageRecord::default();

        if let Some(model) = message
            .and_then(|m| m.get("model"))
            .and_then(|v| v.as_str())
        {
            record.model = model.to_string();
            self.last_model = Some(model.to_string());
        }

        let mut has_input = false;
        if let Some(usage) = usage {
            if let Some(input) = usage.get("input_tokens").and_then(|v| v.as_u64()) {
                record.input_tokens = input;
                has_input = true;
            }
            record.cache_creation_input_tokens = usage
                .get("cache_creation_input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            record.cache_read_input_tokens = usage
                .get("cache_read_input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            if let Some(nested) = usage.get("cache_creation") {
                let five_minute = nested
                    .get("ephemeral_5m_input_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                let one_hour = nested
                    .get("ephemeral_1h_input_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                if five_minute > 0 || one_hour > 0 {
                    record.cache_creation = Some(CacheCreation {
                        ephemeral_5m_input_tokens: five_minute,
                        ephemeral_1h_input_tokens: one_hour,
                    });
                }
            }
        }

        self.current = Some(record);
        self.current_has_input = has_input;
    }

    fn on_message_delta(&mut self, event: &Value) {
        let output = event
            .get("usage")
            .and_then(|u| u.get("output_tokens"))
            .and_then(|v| v.as_u64());
        let record = self.current.get_or_insert_with(UsageRecord::default);
        if let Some(output) = output {
            record.output_tokens = output;
        }
        if self.current_has_input {
            self.records.push(self.current.take().expect("current record"));
            self.current_has_input = false;
        }
    }

    pub fn rate_limit_detected(&self) -> bool {
        self.rate_limit_detected
    }

    // Collapses everything observed into the per-request record. Always
    // produces a record; a stream without usage events reports zeros.
    pub fn finalize(mut self) -> UsageRecord {
        if let Some(partial) = self.current.take() {
            self.records.push(partial);
        }

        let mut merged = UsageRecord::default();
        for record in &self.records {
            merged.absorb(record);
        }
        merged.model = self
            .last_model
            .unwrap_or_else(|| self.fallback_model.clone());
        merged
    }
}
