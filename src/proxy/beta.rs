use std::sync::LazyLock;

use regex::Regex;

pub const BETA_CLAUDE_CODE: &str = "claude-code-20250219";
pub const BETA_OAUTH: &str = "oauth-2025-04-20";
pub const BETA_INTERLEAVED_THINKING: &str = "interleaved-thinking-2025-05-14";
pub const BETA_FINE_GRAINED_STREAMING: &str = "fine-grained-tool-streaming-2025-05-14";
pub const BETA_CONTEXT_1M: &str = "context-1m-2025-08-07";
pub const BETA_TOKEN_COUNTING: &str = "token-counting-2024-11-01";

// Emission order is fixed; unknown tokens trail in the order they appeared.
const CANONICAL_ORDER: [&str; 6] = [
    BETA_CLAUDE_CODE,
    BETA_OAUTH,
    BETA_INTERLEAVED_THINKING,
    BETA_FINE_GRAINED_STREAMING,
    BETA_CONTEXT_1M,
    BETA_TOKEN_COUNTING,
];

const INTERLEAVED_THINKING_MODELS: [&str; 3] = [
    "claude-sonnet-4-20250514",
    "claude-opus-4-20250514",
    "claude-opus-4-1-20250805",
];

static SONNET_OPUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)sonnet|opus").expect("valid model family regex"));

fn token_applies(token: &str, model: &str) -> bool {
    match token {
        BETA_INTERLEAVED_THINKING => INTERLEAVED_THINKING_MODELS.contains(&model),
        BETA_CLAUDE_CODE => SONNET_OPUS_RE.is_match(model),
        _ => true,
    }
}

pub fn select_beta_tokens(
    model: &str,
    base_beta: &str,
    client_beta: Option<&str>,
    is_count_tokens: bool,
) -> Vec<String> {
    let mut admitted: Vec<String> = Vec::new();
    let mut admit = |token: &str| {
        if !token.is_empty() && !admitted.iter().any(|t| t == token) {
            admitted.push(token.to_string());
        }
    };

    for token in base_beta.split(',').map(str::trim) {
        if token_applies(token, model) {
            admit(token);
        }
    }
    if let Some(client) = client_beta {
        if client.split(',').any(|t| t.trim() == BETA_CONTEXT_1M) {
            admit(BETA_CONTEXT_1M);
        }
    }
    if is_count_tokens {
        admit(BETA_TOKEN_COUNTING);
    }

    let mut ordered: Vec<String> = CANONICAL_ORDER
        .iter()
        .filter(|token| admitted.iter().any(|t| t == *token))
        .map(|token| token.to_string())
        .collect();
    ordered.extend(
        admitted
            .into_iter()
            .filter(|token| !CANONICAL_ORDER.contains(&token.as_str())),
    );
    ordered
}

pub fn build_beta_header(
    model: &str,
    base_beta: &str,
    client_beta: Option<&str>,
    is_count_tokens: bool,
) -> String {
    select_beta_tokens(model, base_beta, client_beta, is_count_tokens).join(",")
}
