use serde::{Deserialize, Serialize};

use crate::constants;

// Loaded once at startup and read-only afterwards; operator changes require
// a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub claude: ClaudeApiConfig,
    pub overload_handling: OverloadHandlingConfig,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub proxy: ProxyPreferences,
    pub dump: DumpConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            claude: ClaudeApiConfig::default(),
            overload_handling: OverloadHandlingConfig::default(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            proxy: ProxyPreferences::default(),
            dump: DumpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudeApiConfig {
    pub api_url: String,
    pub api_version: String,
    // Baseline beta tokens, comma-separated; per-model rules still apply.
    pub beta_header: String,
    // Operator prompt appended to every outbound system list when non-empty.
    pub system_prompt: String,
}

impl Default for ClaudeApiConfig {
    fn default() -> Self {
        Self {
            api_url: constants::DEFAULT_API_URL.to_string(),
            api_version: constants::ANTHROPIC_VERSION.to_string(),
            beta_header: constants::DEFAULT_BETA_HEADER.to_string(),
            system_prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OverloadHandlingConfig {
    // 0 disables overload marking on 529.
    pub enabled_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPreferences {
    pub use_ipv4: bool,
}

impl Default for ProxyPreferences {
    fn default() -> Self {
        Self { use_ipv4: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    pub enabled: bool,
    pub output_dir: Option<String>,
}

fn default_request_timeout() -> u64 {
    600
}

fn default_connect_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_the_vendor_api() {
        let config = RelayConfig::default();
        assert_eq!(config.claude.api_url, "https://api.anthropic.com");
        assert_eq!(config.claude.api_version, "2023-06-01");
        assert_eq!(config.request_timeout_secs, 600);
        assert_eq!(config.connect_timeout_secs, 30);
        assert!(config.proxy.use_ipv4);
        assert_eq!(config.overload_handling.enabled_minutes, 0);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: RelayConfig = serde_json::from_str(
            r#"{"claude": {"api_url": "http://127.0.0.1:9999"}, "request_timeout_secs": 30}"#,
        )
        .unwrap();
        assert_eq!(config.claude.api_url, "http://127.0.0.1:9999");
        assert_eq!(config.claude.api_version, "2023-06-01");
        assert_eq!(config.request_timeout_secs, 30);
    }
}
