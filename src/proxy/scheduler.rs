use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{RelayError, RelayResult};
use crate::models::account::AccountSelection;
use crate::proxy::accounts::AccountService;

// Stable session fingerprint for sticky routing. Hash the first meaningful
// user message only, so every turn of a conversation lands on the same
// account and keeps its prompt cache warm.
pub fn session_hash(body: &Value) -> Option<String> {
    let messages = body.get("messages")?.as_array()?;
    if messages.is_empty() {
        return None;
    }

    let mut hasher = Sha256::new();
    let mut content_found = false;
    for message in messages {
        if message.get("role").and_then(|v| v.as_str()) != Some("user") {
            continue;
        }
        let text = match message.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(blocks)) => blocks
                .iter()
                .filter(|block| block.get("type").and_then(|v| v.as_str()) == Some("text"))
                .filter_map(|block| block.get("text").and_then(|v| v.as_str()))
                .collect::<Vec<_>>()
                .join(" "),
            _ => continue,
        };
        let clean = text.trim();
        // Skip probe messages and injected reminders; they differ per turn.
        if clean.len() > 10 && !clean.contains("<system-reminder>") {
            hasher.update(clean.as_bytes());
            content_found = true;
            break;
        }
    }

    if !content_found {
        let last = messages.last()?;
        hasher.update(last.to_string().as_bytes());
    }

    let digest = format!("{:x}", hasher.finalize());
    Some(format!("sid-{}", &digest[..16]))
}

// Sticky-session account selection. One mapping per session hash; flagged
// accounts lose all of their mappings so follow-up turns re-route.
pub struct StickyScheduler {
    accounts: Arc<AccountService>,
    sessions: DashMap<String, String>,
    rotation: AtomicUsize,
}

impl StickyScheduler {
    pub fn new(accounts: Arc<AccountService>) -> Self {
        Self {
            accounts,
            sessions: DashMap::new(),
            rotation: AtomicUsize::new(0),
        }
    }

    pub fn select_account_for_api_key(
        &self,
        api_key: &str,
        session_hash: Option<&str>,
        model: &str,
    ) -> RelayResult<AccountSelection> {
        if let Some(hash) = session_hash {
            if let Some(mapped) = self.sessions.get(hash).map(|entry| entry.clone()) {
                match self.accounts.get_account(&mapped) {
                    Ok(account) if self.accounts.is_available(&account) => {
                        tracing::debug!(
                            "[Scheduler] Sticky hit: session {} -> account {}",
                            hash,
                            account.id
                        );
                        return Ok(AccountSelection {
                            account_id: account.id,
                            account_type: account.account_type,
                        });
                    }
                    _ => {
                        self.sessions.remove(hash);
                    }
                }
            }
        }

        let candidates: Vec<_> = self
            .accounts
            .get_all_accounts()
            .into_iter()
            .filter(|account| self.accounts.is_available(account))
            .collect();
        if candidates.is_empty() {
            return Err(RelayError::Scheduling(format!(
                "No available accounts for model {}",
                model
            )));
        }

        let index = self.rotation.fetch_add(1, Ordering::Relaxed) % candidates.len();
        let chosen = &candidates[index];
        if let Some(hash) = session_hash {
            self.sessions.insert(hash.to_string(), chosen.id.clone());
        }
        tracing::info!(
            "[Scheduler] Selected account {} for api key {}... (session: {:?})",
            chosen.id,
            api_key.chars().take(8).collect::<String>(),
            session_hash
        );
        Ok(AccountSelection {
            account_id: chosen.id.clone(),
            account_type: chosen.account_type.clone(),
        })
    }

    pub fn mark_account_rate_limited(
        &self,
        account_id: &str,
        _account_type: &str,
        _session_hash: Option<&str>,
        reset_at: Option<i64>,
    ) -> Result<(), String> {
        self.accounts.get_account(account_id).map_err(|e| e.to_string())?;
        self.accounts.mark_rate_limited(account_id, reset_at);
        self.purge_sessions(account_id);
        Ok(())
    }

    pub fn is_account_rate_limited(&self, account_id: &str) -> bool {
        self.accounts.is_rate_limited(account_id)
    }

    pub fn remove_account_rate_limit(&self, account_id: &str, _account_type: &str) -> bool {
        self.accounts.remove_rate_limit(account_id)
    }

    pub fn mark_account_blocked(
        &self,
        account_id: &str,
        _account_type: &str,
        _session_hash: Option<&str>,
    ) -> Result<(), String> {
        self.accounts
            .set_status(account_id, crate::models::account::AccountStatus::Blocked)?;
        self.purge_sessions(account_id);
        tracing::warn!("[Scheduler] Account {} blocked", account_id);
        Ok(())
    }

    pub fn mark_account_unauthorized(
        &self,
        account_id: &str,
        _account_type: &str,
        _session_hash: Option<&str>,
    ) -> Result<(), String> {
        self.accounts.set_status(
            account_id,
            crate::models::account::AccountStatus::Unauthorized,
        )?;
        self.purge_sessions(account_id);
        tracing::warn!("[Scheduler] Account {} unauthorized", account_id);
        Ok(())
    }

    fn purge_sessions(&self, account_id: &str) {
        self.sessions.retain(|_, mapped| mapped != account_id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
