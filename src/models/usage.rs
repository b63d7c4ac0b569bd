use serde::{Deserialize, Serialize};

// Token accounting emitted once per completed request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation: Option<CacheCreation>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCreation {
    #[serde(default)]
    pub ephemeral_5m_input_tokens: u64,
    #[serde(default)]
    pub ephemeral_1h_input_tokens: u64,
}

impl UsageRecord {
    // Fold another record into this one; the newer non-empty model wins.
    pub fn absorb(&mut self, other: &UsageRecord) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
        if let Some(other_cc) = &other.cache_creation {
            let cc = self.cache_creation.get_or_insert_with(CacheCreation::default);
            cc.ephemeral_5m_input_tokens += other_cc.ephemeral_5m_input_tokens;
            cc.ephemeral_1h_input_tokens += other_cc.ephemeral_1h_input_tokens;
        }
        if !other.model.is_empty() {
            self.model = other.model.clone();
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }
}
