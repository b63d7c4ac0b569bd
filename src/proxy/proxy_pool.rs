use dashmap::DashMap;
use serde_json::Value;

use crate::error::{RelayError, RelayResult};
use crate::models::account::{flexible_bool, ProxyDescriptor};

const ALLOWED_PROXY_TYPES: [&str; 3] = ["socks5", "http", "https"];

// A ready-to-use upstream proxy: the reqwest proxy performs the CONNECT
// tunnel (http/https) or SOCKS5 handshake before TLS.
#[derive(Debug, Clone)]
pub struct ProxyAgent {
    pub proxy: reqwest::Proxy,
    pub cache_key: String,
    pub prefer_ipv4: bool,
}

pub struct ProxyAgentFactory {
    cache: DashMap<String, ProxyAgent>,
    default_use_ipv4: bool,
}

impl ProxyAgentFactory {
    pub fn new(default_use_ipv4: bool) -> Self {
        Self {
            cache: DashMap::new(),
            default_use_ipv4,
        }
    }

    // One agent per type://host:port:user tuple; agents are immutable after
    // creation so cached references are stable.
    pub fn agent_for(&self, descriptor: &ProxyDescriptor) -> RelayResult<ProxyAgent> {
        validate_descriptor(descriptor)?;
        let key = cache_key(descriptor);
        if let Some(agent) = self.cache.get(&key) {
            return Ok(agent.clone());
        }

        let agent = self.build_agent(descriptor, key.clone())?;
        let entry = self.cache.entry(key).or_insert(agent);
        Ok(entry.clone())
    }

    fn build_agent(&self, descriptor: &ProxyDescriptor, cache_key: String) -> RelayResult<ProxyAgent> {
        let endpoint = proxy_url(descriptor)?;
        let mut proxy = reqwest::Proxy::all(endpoint.as_str())
            .map_err(|e| RelayError::Proxy(format!("Invalid proxy endpoint: {}", e)))?;

        // HTTP(S) proxy credentials travel as Proxy-Authorization on the
        // CONNECT request; SOCKS5 credentials are already in the URL.
        if descriptor.proxy_type != "socks5" {
            if let (Some(user), Some(pass)) = (&descriptor.username, &descriptor.password) {
                proxy = proxy.basic_auth(user, pass);
            }
        }

        tracing::debug!("[Proxy] Built agent for {}", masked_endpoint(descriptor));

        Ok(ProxyAgent {
            proxy,
            cache_key,
            prefer_ipv4: descriptor.prefer_ipv4.unwrap_or(self.default_use_ipv4),
        })
    }

    pub fn cached_agents(&self) -> usize {
        self.cache.len()
    }
}

// Descriptors arrive either as a JSON object or as a JSON string holding one.
pub fn parse_descriptor(value: &Value) -> RelayResult<ProxyDescriptor> {
    let object = match value {
        Value::String(raw) => serde_json::from_str::<Value>(raw)
            .map_err(|e| RelayError::Proxy(format!("Invalid proxy JSON: {}", e)))?,
        Value::Object(_) => value.clone(),
        _ => return Err(RelayError::Proxy("Proxy descriptor must be an object".to_string())),
    };

    let proxy_type = object
        .get("type")
        .and_then(|v| v.as_str())
        .map(|s| s.to_ascii_lowercase())
        .ok_or_else(|| RelayError::Proxy("Proxy descriptor missing type".to_string()))?;
    let host = object
        .get("host")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RelayError::Proxy("Proxy descriptor missing host".to_string()))?;
    let port = match object.get("port") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
    .ok_or_else(|| RelayError::Proxy("Proxy descriptor missing port".to_string()))?;
    if port == 0 || port > 65535 {
        return Err(RelayError::Proxy(format!("Proxy port out of range: {}", port)));
    }

    let descriptor = ProxyDescriptor {
        proxy_type,
        host,
        port: port as u16,
        username: object
            .get("username")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
        password: object
            .get("password")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        prefer_ipv4: object.get("prefer_ipv4").and_then(flexible_bool),
    };
    validate_descriptor(&descriptor)?;
    Ok(descriptor)
}

fn validate_descriptor(descriptor: &ProxyDescriptor) -> RelayResult<()> {
    if !ALLOWED_PROXY_TYPES.contains(&descriptor.proxy_type.as_str()) {
        return Err(RelayError::Proxy(format!(
            "Unsupported proxy type: {}",
            descriptor.proxy_type
        )));
    }
    if descriptor.host.is_empty() {
        return Err(RelayError::Proxy("Proxy descriptor missing host".to_string()));
    }
    if descriptor.port == 0 {
        return Err(RelayError::Proxy("Proxy port out of range: 0".to_string()));
    }
    Ok(())
}

fn proxy_url(descriptor: &ProxyDescriptor) -> RelayResult<url::Url> {
    let mut endpoint = url::Url::parse(&format!(
        "{}://{}:{}",
        descriptor.proxy_type, descriptor.host, descriptor.port
    ))
    .map_err(|e| RelayError::Proxy(format!("Invalid proxy endpoint: {}", e)))?;

    if descriptor.proxy_type == "socks5" {
        if let Some(user) = &descriptor.username {
            endpoint
                .set_username(user)
                .map_err(|_| RelayError::Proxy("Invalid proxy username".to_string()))?;
            endpoint
                .set_password(descriptor.password.as_deref())
                .map_err(|_| RelayError::Proxy("Invalid proxy password".to_string()))?;
        }
    }
    Ok(endpoint)
}

pub fn cache_key(descriptor: &ProxyDescriptor) -> String {
    format!(
        "{}://{}:{}:{}",
        descriptor.proxy_type,
        descriptor.host,
        descriptor.port,
        descriptor.username.as_deref().unwrap_or("")
    )
}

// Log-safe rendering: first+last username chars survive, passwords never.
pub fn mask_username(username: &str) -> String {
    let chars: Vec<char> = username.chars().collect();
    match chars.len() {
        0 => String::new(),
        1 | 2 => "*".repeat(chars.len()),
        n => format!("{}{}{}", chars[0], "*".repeat(n - 2), chars[n - 1]),
    }
}

pub fn mask_password(password: &str) -> String {
    "*".repeat(password.chars().count().min(8))
}

pub fn masked_endpoint(descriptor: &ProxyDescriptor) -> String {
    match (&descriptor.username, &descriptor.password) {
        (Some(user), Some(pass)) => format!(
            "{}://{}:{}@{}:{}",
            descriptor.proxy_type,
            mask_username(user),
            mask_password(pass),
            descriptor.host,
            descriptor.port
        ),
        (Some(user), None) => format!(
            "{}://{}@{}:{}",
            descriptor.proxy_type,
            mask_username(user),
            descriptor.host,
            descriptor.port
        ),
        _ => format!(
            "{}://{}:{}",
            descriptor.proxy_type, descriptor.host, descriptor.port
        ),
    }
}
