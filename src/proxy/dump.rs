use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::{json, Value};
use tokio::fs;

use crate::models::config::DumpConfig;

const DEFAULT_DUMP_DIR: &str = "logs/dumps";
const MASKED_HEADERS: [&str; 3] = ["authorization", "x-api-key", "proxy-authorization"];

// Optional on-disk request/response snapshots for operator debugging.
// Every failure here is logged and swallowed; dumps never affect a request.
pub struct RequestDumper {
    config: DumpConfig,
}

impl RequestDumper {
    pub fn new(config: DumpConfig) -> Self {
        Self { config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn dump(
        &self,
        model: &str,
        kind: &str,
        headers: &HashMap<String, String>,
        body: &Value,
    ) {
        if !self.config.enabled {
            return;
        }

        let base = self
            .config
            .output_dir
            .clone()
            .unwrap_or_else(|| DEFAULT_DUMP_DIR.to_string());
        let dir = PathBuf::from(base).join(sanitize_component(model));
        if let Err(e) = fs::create_dir_all(&dir).await {
            tracing::warn!("[Dump] Failed to create {}: {}", dir.display(), e);
            return;
        }

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%.3f");
        let path = dir.join(format!("{}_{}.log", timestamp, sanitize_component(kind)));
        let payload = json!({
            "model": model,
            "kind": kind,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "headers": mask_headers(headers),
            "body": body,
        });

        match serde_json::to_vec_pretty(&payload) {
            Ok(bytes) => {
                if let Err(e) = fs::write(&path, bytes).await {
                    tracing::warn!("[Dump] Failed to write {}: {}", path.display(), e);
                }
            }
            Err(e) => tracing::warn!("[Dump] Failed to serialize payload: {}", e),
        }
    }
}

fn mask_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let lowered = name.to_ascii_lowercase();
            if MASKED_HEADERS.contains(&lowered.as_str()) {
                (lowered, "***".to_string())
            } else {
                (lowered, value.clone())
            }
        })
        .collect()
}

fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
