use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Unauthorized,
    Blocked,
    Error,
}

impl Default for AccountStatus {
    fn default() -> Self {
        Self::Active
    }
}

// A vendor account as seen by the relay core. Created and mutated by the
// account-management subsystem; the core reads it and updates health flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub status: AccountStatus,
    #[serde(default = "default_account_type")]
    pub account_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyDescriptor>,
    // Fingerprint randomization for accounts under upstream scrutiny.
    #[serde(default)]
    pub ban_mode: bool,
    #[serde(default)]
    pub use_unified_client_id: bool,
    // 64 hex chars when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unified_client_id: Option<String>,
    #[serde(default)]
    pub use_unified_user_agent: bool,
    pub created_at: i64,
    pub last_used: i64,
}

fn default_true() -> bool {
    true
}

fn default_account_type() -> String {
    "claude-oauth".to_string()
}

impl Account {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: id.into(),
            name: name.into(),
            is_active: true,
            status: AccountStatus::Active,
            account_type: default_account_type(),
            proxy: None,
            ban_mode: false,
            use_unified_client_id: false,
            unified_client_id: None,
            use_unified_user_agent: false,
            created_at: now,
            last_used: now,
        }
    }

    pub fn update_last_used(&mut self) {
        self.last_used = chrono::Utc::now().timestamp();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSelection {
    pub account_id: String,
    pub account_type: String,
}

// Upstream proxy endpoint bound to an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    // Accepts bool, number, or string in descriptor JSON.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_flexible_bool"
    )]
    pub prefer_ipv4: Option<bool>,
}

fn de_flexible_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(flexible_bool))
}

pub fn flexible_bool(value: &serde_json::Value) -> Option<bool> {
    match value {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::Number(n) => n.as_i64().map(|i| i != 0),
        serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
