use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use dashmap::DashMap;

use crate::error::{RelayError, RelayResult};
use crate::models::account::{Account, AccountStatus};
use crate::store::KvStore;

pub const UNAUTHORIZED_ERROR_TTL: Duration = Duration::from_secs(300);
pub const SERVER_ERROR_TTL: Duration = Duration::from_secs(300);
pub const SERVER_ERROR_ALERT_THRESHOLD: i64 = 3;
pub const SESSION_WINDOW_TTL: Duration = Duration::from_secs(5 * 3600);
// Fallback lockout when the vendor sends no reset timestamp.
pub const DEFAULT_RATE_LIMIT_TTL: Duration = Duration::from_secs(3600);

fn kv_key(kind: &str, account_id: &str) -> String {
    format!("claude:{}:{}", kind, account_id)
}

// Registry of vendor accounts plus their health flags. Accounts are created
// and refreshed by the account-management subsystem; the relay reads them
// and flips flags. Flags live in the KV store so counters expire on their
// own and a shared deployment sees one view.
pub struct AccountService {
    accounts: DashMap<String, Account>,
    access_tokens: DashMap<String, String>,
    kv: Arc<dyn KvStore>,
    captured_user_agent: RwLock<Option<String>>,
}

impl AccountService {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            accounts: DashMap::new(),
            access_tokens: DashMap::new(),
            kv,
            captured_user_agent: RwLock::new(None),
        }
    }

    pub fn upsert_account(&self, account: Account) {
        self.accounts.insert(account.id.clone(), account);
    }

    pub fn set_access_token(&self, account_id: &str, token: impl Into<String>) {
        self.access_tokens.insert(account_id.to_string(), token.into());
    }

    pub fn get_account(&self, account_id: &str) -> RelayResult<Account> {
        self.accounts
            .get(account_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| RelayError::Account(format!("Unknown account: {}", account_id)))
    }

    pub fn get_all_accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> =
            self.accounts.iter().map(|entry| entry.clone()).collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }

    // Token refresh itself is owned by the auth subsystem; the relay only
    // reads whatever valid token that subsystem has parked here.
    pub fn get_valid_access_token(&self, account_id: &str) -> RelayResult<String> {
        self.access_tokens
            .get(account_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                RelayError::Account(format!("No access token for account: {}", account_id))
            })
    }

    pub fn touch(&self, account_id: &str) {
        if let Some(mut account) = self.accounts.get_mut(account_id) {
            account.update_last_used();
        }
    }

    pub fn set_status(&self, account_id: &str, status: AccountStatus) -> Result<(), String> {
        match self.accounts.get_mut(account_id) {
            Some(mut account) => {
                account.status = status;
                Ok(())
            }
            None => Err(format!("Unknown account: {}", account_id)),
        }
    }

    // 401 bookkeeping: increment and TTL always travel together.
    pub fn record_unauthorized_error(&self, account_id: &str) -> i64 {
        let key = kv_key("401_errors", account_id);
        let count = self.kv.incr(&key);
        self.kv.expire(&key, UNAUTHORIZED_ERROR_TTL);
        count
    }

    pub fn get_unauthorized_error_count(&self, account_id: &str) -> i64 {
        self.kv
            .get(&kv_key("401_errors", account_id))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn clear_unauthorized_errors(&self, account_id: &str) {
        self.kv.del(&kv_key("401_errors", account_id));
    }

    pub fn mark_rate_limited(&self, account_id: &str, reset_at: Option<i64>) {
        let now = chrono::Utc::now().timestamp();
        let ttl = reset_at
            .map(|at| at.saturating_sub(now))
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(DEFAULT_RATE_LIMIT_TTL);
        let value = reset_at.map(|at| at.to_string()).unwrap_or_else(|| "1".to_string());
        self.kv
            .setex(&kv_key("rate_limited", account_id), ttl, &value);
        tracing::warn!(
            "[Health] Account {} rate limited (reset_at: {:?}, ttl: {}s)",
            account_id,
            reset_at,
            ttl.as_secs()
        );
    }

    pub fn is_rate_limited(&self, account_id: &str) -> bool {
        self.kv.get(&kv_key("rate_limited", account_id)).is_some()
    }

    pub fn rate_limit_reset_at(&self, account_id: &str) -> Option<i64> {
        self.kv
            .get(&kv_key("rate_limited", account_id))
            .and_then(|v| v.parse().ok())
    }

    pub fn remove_rate_limit(&self, account_id: &str) -> bool {
        self.kv.del(&kv_key("rate_limited", account_id))
    }

    pub fn mark_account_overloaded(&self, account_id: &str, minutes: u64) {
        self.kv.setex(
            &kv_key("overloaded", account_id),
            Duration::from_secs(minutes * 60),
            "1",
        );
        tracing::warn!(
            "[Health] Account {} marked overloaded for {} minute(s)",
            account_id,
            minutes
        );
    }

    pub fn is_account_overloaded(&self, account_id: &str) -> bool {
        self.kv.get(&kv_key("overloaded", account_id)).is_some()
    }

    pub fn remove_account_overload(&self, account_id: &str) -> bool {
        self.kv.del(&kv_key("overloaded", account_id))
    }

    pub fn record_server_error(&self, account_id: &str) -> i64 {
        let key = kv_key("server_errors", account_id);
        let count = self.kv.incr(&key);
        self.kv.expire(&key, SERVER_ERROR_TTL);
        count
    }

    pub fn get_server_error_count(&self, account_id: &str) -> i64 {
        self.kv
            .get(&kv_key("server_errors", account_id))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn clear_internal_errors(&self, account_id: &str) {
        self.kv.del(&kv_key("server_errors", account_id));
    }

    pub fn update_session_window_status(&self, account_id: &str, status: &str) {
        self.kv.setex(
            &kv_key("session_window", account_id),
            SESSION_WINDOW_TTL,
            status,
        );
    }

    pub fn get_session_window_status(&self, account_id: &str) -> Option<String> {
        self.kv.get(&kv_key("session_window", account_id))
    }

    // Schedulable right now: active, unflagged, not locked out.
    pub fn is_available(&self, account: &Account) -> bool {
        account.is_active
            && account.status == AccountStatus::Active
            && !self.is_rate_limited(&account.id)
            && !self.is_account_overloaded(&account.id)
    }

    pub fn capture_user_agent(&self, user_agent: String) {
        if let Ok(mut slot) = self.captured_user_agent.write() {
            if slot.as_deref() != Some(user_agent.as_str()) {
                tracing::debug!("[Accounts] Captured canonical client UA: {}", user_agent);
                *slot = Some(user_agent);
            }
        }
    }

    pub fn captured_user_agent(&self) -> Option<String> {
        self.captured_user_agent.read().ok().and_then(|slot| slot.clone())
    }
}
