use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Value};

use crate::constants::{
    CLAUDE_CODE_SYSTEM_PROMPT, CLI_USER_AGENT, DEFENSIVE_SECURITY_BOILERPLATE, STAINLESS_ARCH,
    STAINLESS_LANG, STAINLESS_OS, STAINLESS_PACKAGE_VERSION, STAINLESS_RUNTIME,
    STAINLESS_RUNTIME_VERSION, TOOL_RESULT_REMINDER_SUFFIX,
};
use crate::models::account::Account;
use crate::models::config::RelayConfig;
use crate::pricing::PricingTable;
use crate::proxy::fingerprint::random_fingerprint;

pub const MODEL_VARIANT_THINKING: &str = "thinking";
const THINKING_DEFAULT_BUDGET: u64 = 31999;

static UNIFIED_USER_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^user_[a-f0-9]{64}(_account__session_[a-f0-9-]{36})$")
        .expect("valid unified user id regex")
});

// Decides whether a request comes from a genuine Claude Code CLI. Non-CC
// requests get the Claude Code system prompt prepended on relay.
pub trait ClaudeCodeValidator: Send + Sync {
    fn validate(&self, headers: &HashMap<String, String>, body: &Value, path: &str) -> bool;
}

// Default heuristic: CLI user-agent plus the CLI's own first system block.
pub struct CliHeaderValidator;

impl ClaudeCodeValidator for CliHeaderValidator {
    fn validate(&self, headers: &HashMap<String, String>, body: &Value, _path: &str) -> bool {
        let ua_matches = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
            .map(|(_, v)| v.starts_with("claude-cli/"))
            .unwrap_or(false);
        if !ua_matches {
            return false;
        }
        match body.get("system") {
            Some(Value::String(s)) => s == CLAUDE_CODE_SYSTEM_PROMPT,
            Some(Value::Array(items)) => items
                .first()
                .and_then(|block| block.get("text"))
                .and_then(|text| text.as_str())
                .map(|text| text == CLAUDE_CODE_SYSTEM_PROMPT)
                .unwrap_or(false),
            _ => false,
        }
    }
}

// Splits a trailing `:variant` off the model name. Only known variants are
// split; anything else stays part of the model id.
pub fn split_model_variant(model: &str) -> (String, Option<String>) {
    if let Some((base, variant)) = model.rsplit_once(':') {
        if variant == MODEL_VARIANT_THINKING {
            return (base.to_string(), Some(variant.to_string()));
        }
    }
    (model.to_string(), None)
}

pub fn prepare_body(
    body: &Value,
    account: &Account,
    config: &RelayConfig,
    pricing: &PricingTable,
    is_real_claude_code: bool,
    is_count_tokens: bool,
) -> Value {
    // Token counting passes through untouched, as does anything that is not
    // a JSON object.
    if is_count_tokens || !body.is_object() {
        return body.clone();
    }

    let mut out = body.clone();

    let mut thinking_variant = false;
    if let Some(model) = out.get("model").and_then(|v| v.as_str()) {
        let (base, variant) = split_model_variant(model);
        thinking_variant = variant.as_deref() == Some(MODEL_VARIANT_THINKING);
        out["model"] = Value::String(base);
    }

    strip_defensive_boilerplate(&mut out);
    strip_tool_result_reminders(&mut out);
    clamp_max_tokens(&mut out, pricing);
    strip_cache_control_ttls(&mut out);

    if !is_real_claude_code {
        inject_claude_code_prompt(&mut out);
    }
    append_operator_system_prompt(&mut out, &config.claude.system_prompt);
    drop_empty_system(&mut out);

    if let Some(object) = out.as_object_mut() {
        // The vendor rejects temperature+top_p together; temperature wins.
        object.remove("top_p");
    }

    apply_unified_client_id(&mut out, account);

    if thinking_variant {
        let budget = out
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .map(|max| max.saturating_sub(1))
            .filter(|budget| *budget > 0)
            .unwrap_or(THINKING_DEFAULT_BUDGET);
        out["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
    }

    out
}

fn strip_defensive_boilerplate(body: &mut Value) {
    let Some(items) = body.get_mut("system").and_then(|v| v.as_array_mut()) else {
        return;
    };
    if items.len() < 2 {
        return;
    }
    let block = &mut items[1];
    if block.get("type").and_then(|v| v.as_str()) != Some("text") {
        return;
    }
    if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
        if text.contains(DEFENSIVE_SECURITY_BOILERPLATE) {
            let cleaned = text.replace(DEFENSIVE_SECURITY_BOILERPLATE, "");
            block["text"] = Value::String(cleaned);
        }
    }
}

fn strip_tool_result_reminders(body: &mut Value) {
    let Some(messages) = body.get_mut("messages").and_then(|v| v.as_array_mut()) else {
        return;
    };
    for message in messages {
        if message.get("role").and_then(|v| v.as_str()) != Some("user") {
            continue;
        }
        let Some(blocks) = message.get_mut("content").and_then(|v| v.as_array_mut()) else {
            continue;
        };
        for block in blocks {
            if block.get("type").and_then(|v| v.as_str()) != Some("tool_result") {
                continue;
            }
            if let Some(content) = block.get("content").and_then(|v| v.as_str()) {
                if content.ends_with(TOOL_RESULT_REMINDER_SUFFIX) {
                    let trimmed =
                        content[..content.len() - TOOL_RESULT_REMINDER_SUFFIX.len()].to_string();
                    block["content"] = Value::String(trimmed);
                }
            }
        }
    }
}

fn clamp_max_tokens(body: &mut Value, pricing: &PricingTable) {
    let Some(model) = body.get("model").and_then(|v| v.as_str()).map(String::from) else {
        return;
    };
    let Some(limit) = pricing.output_token_limit(&model) else {
        return;
    };
    if let Some(requested) = body.get("max_tokens").and_then(|v| v.as_u64()) {
        if requested > limit {
            tracing::warn!(
                "[Prepare] Clamping max_tokens {} -> {} for model {}",
                requested,
                limit,
                model
            );
            body["max_tokens"] = Value::Number(limit.into());
        }
    }
}

fn strip_ttl_from_block(block: &mut Value) {
    if let Some(cache_control) = block.get_mut("cache_control").and_then(|v| v.as_object_mut()) {
        cache_control.remove("ttl");
    }
}

fn strip_cache_control_ttls(body: &mut Value) {
    if let Some(items) = body.get_mut("system").and_then(|v| v.as_array_mut()) {
        for block in items {
            strip_ttl_from_block(block);
        }
    }
    if let Some(messages) = body.get_mut("messages").and_then(|v| v.as_array_mut()) {
        for message in messages {
            if let Some(blocks) = message.get_mut("content").and_then(|v| v.as_array_mut()) {
                for block in blocks {
                    strip_ttl_from_block(block);
                }
            }
        }
    }
}

fn claude_code_block() -> Value {
    json!({
        "type": "text",
        "text": CLAUDE_CODE_SYSTEM_PROMPT,
        "cache_control": {"type": "ephemeral"}
    })
}

fn is_claude_code_block(block: &Value) -> bool {
    block.get("text").and_then(|v| v.as_str()) == Some(CLAUDE_CODE_SYSTEM_PROMPT)
}

fn inject_claude_code_prompt(body: &mut Value) {
    let system = body.get("system").cloned();
    let new_system = match system {
        Some(Value::String(original)) => {
            if original == CLAUDE_CODE_SYSTEM_PROMPT {
                Value::Array(vec![claude_code_block()])
            } else {
                Value::Array(vec![
                    claude_code_block(),
                    json!({"type": "text", "text": original}),
                ])
            }
        }
        Some(Value::Array(items)) => {
            if items.first().map(is_claude_code_block).unwrap_or(false) {
                Value::Array(items)
            } else {
                let mut kept: Vec<Value> = items
                    .into_iter()
                    .filter(|block| !is_claude_code_block(block))
                    .collect();
                kept.insert(0, claude_code_block());
                Value::Array(kept)
            }
        }
        _ => Value::Array(vec![claude_code_block()]),
    };
    body["system"] = new_system;
}

fn append_operator_system_prompt(body: &mut Value, prompt: &str) {
    if prompt.is_empty() {
        return;
    }
    let mut items = match body.get("system").cloned() {
        Some(Value::Array(items)) => items,
        Some(Value::String(original)) => vec![json!({"type": "text", "text": original})],
        _ => Vec::new(),
    };
    let present = items
        .iter()
        .any(|block| block.get("text").and_then(|v| v.as_str()) == Some(prompt));
    if !present {
        items.push(json!({"type": "text", "text": prompt}));
    }
    body["system"] = Value::Array(items);
}

fn drop_empty_system(body: &mut Value) {
    let remove = match body.get("system") {
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => !items.iter().any(|block| {
            block
                .get("text")
                .and_then(|v| v.as_str())
                .map(|text| !text.trim().is_empty())
                .unwrap_or(false)
        }),
        _ => false,
    };
    if remove {
        if let Some(object) = body.as_object_mut() {
            object.remove("system");
        }
    }
}

fn apply_unified_client_id(body: &mut Value, account: &Account) {
    if !account.use_unified_client_id {
        return;
    }
    let Some(unified) = account.unified_client_id.as_deref() else {
        return;
    };

    let existing = body
        .get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(|v| v.as_str())
        .map(String::from);

    let replacement = match existing.as_deref() {
        None | Some("") => Some(format!(
            "user_{}_account__session_{}",
            unified,
            uuid::Uuid::new_v4()
        )),
        Some(current) => UNIFIED_USER_ID_RE
            .captures(current)
            .map(|caps| format!("user_{}{}", unified, &caps[1])),
    };

    if let Some(user_id) = replacement {
        if !body.get("metadata").map(Value::is_object).unwrap_or(false) {
            body["metadata"] = json!({});
        }
        body["metadata"]["user_id"] = Value::String(user_id);
    }
}

// Outbound header set for one dispatch. Names are lowercase; the transport
// passes them through verbatim.
pub fn build_request_headers(
    access_token: &str,
    account: &Account,
    config: &RelayConfig,
    beta_header: &str,
    streaming: bool,
) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    headers.insert(
        "anthropic-version".to_string(),
        config.claude.api_version.clone(),
    );
    headers.insert(
        "authorization".to_string(),
        format!("Bearer {}", access_token),
    );
    headers.insert("x-stainless-lang".to_string(), STAINLESS_LANG.to_string());
    headers.insert(
        "anthropic-dangerous-direct-browser-access".to_string(),
        "true".to_string(),
    );
    headers.insert("x-app".to_string(), "cli".to_string());
    headers.insert("accept-language".to_string(), "*".to_string());
    headers.insert("sec-fetch-mode".to_string(), "cors".to_string());
    headers.insert("accept-encoding".to_string(), "gzip, deflate".to_string());

    if account.ban_mode {
        let fp = random_fingerprint();
        headers.insert("user-agent".to_string(), fp.user_agent);
        headers.insert("x-stainless-package-version".to_string(), fp.package_version);
        headers.insert("x-stainless-os".to_string(), fp.os);
        headers.insert("x-stainless-arch".to_string(), fp.arch);
        headers.insert("x-stainless-runtime".to_string(), fp.runtime);
        headers.insert("x-stainless-runtime-version".to_string(), fp.runtime_version);
    } else {
        headers.insert("user-agent".to_string(), CLI_USER_AGENT.clone());
        headers.insert(
            "x-stainless-package-version".to_string(),
            STAINLESS_PACKAGE_VERSION.to_string(),
        );
        headers.insert("x-stainless-os".to_string(), STAINLESS_OS.to_string());
        headers.insert("x-stainless-arch".to_string(), STAINLESS_ARCH.to_string());
        headers.insert("x-stainless-runtime".to_string(), STAINLESS_RUNTIME.to_string());
        headers.insert(
            "x-stainless-runtime-version".to_string(),
            STAINLESS_RUNTIME_VERSION.to_string(),
        );
    }

    if streaming {
        headers.insert("x-stainless-helper-method".to_string(), "stream".to_string());
        headers.insert("accept".to_string(), "text/event-stream".to_string());
    }
    if !beta_header.is_empty() {
        headers.insert("anthropic-beta".to_string(), beta_header.to_string());
    }
    headers
}

pub fn request_path(is_count_tokens: bool, has_beta: bool) -> String {
    let base = if is_count_tokens {
        crate::constants::COUNT_TOKENS_PATH
    } else {
        crate::constants::MESSAGES_PATH
    };
    if has_beta {
        format!("{}?beta=true", base)
    } else {
        base.to_string()
    }
}

const SENSITIVE_HEADERS: [&str; 9] = [
    "authorization",
    "x-api-key",
    "content-type",
    "host",
    "content-length",
    "connection",
    "proxy-authorization",
    "content-encoding",
    "transfer-encoding",
];

const BROWSER_HEADERS: [&str; 4] = [
    "origin",
    "referer",
    "pragma",
    "anthropic-dangerous-direct-browser-access",
];

const ALWAYS_KEPT_HEADERS: [&str; 3] = ["x-request-id", "anthropic-version", "anthropic-beta"];

// Pass-through filter for ingress headers: credentials and browser noise are
// dropped, request tracing and protocol version survive.
pub fn filter_client_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    let mut filtered = HashMap::new();
    for (name, value) in headers {
        let lowered = name.to_ascii_lowercase();
        if ALWAYS_KEPT_HEADERS.contains(&lowered.as_str()) {
            filtered.insert(lowered, value.clone());
            continue;
        }
        if SENSITIVE_HEADERS.contains(&lowered.as_str()) {
            continue;
        }
        if BROWSER_HEADERS.contains(&lowered.as_str())
            || lowered.starts_with("sec-")
            || lowered.starts_with("accept-")
        {
            continue;
        }
        filtered.insert(lowered, value.clone());
    }
    filtered
}

// Opportunistic capture of a canonical CLI user-agent for the account.
pub fn capture_unified_user_agent(
    account: &Account,
    headers: &HashMap<String, String>,
) -> Option<String> {
    if !account.use_unified_user_agent {
        return None;
    }
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
        .map(|(_, v)| v.clone())
        .filter(|ua| ua.starts_with("claude-cli/"))
}
