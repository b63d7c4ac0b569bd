use std::collections::HashMap;
use std::sync::Arc;

use crate::constants::{RATE_LIMIT_BODY_MARKER, RATE_LIMIT_RESET_HEADER, SESSION_WINDOW_HEADER};
use crate::models::config::RelayConfig;
use crate::proxy::accounts::{AccountService, SERVER_ERROR_ALERT_THRESHOLD};
use crate::proxy::scheduler::StickyScheduler;

pub fn header_lookup<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

// Escalation state machine over upstream responses. Exactly one branch fires
// per non-2xx response; 2xx clears every flag the account carries. Failures
// of the underlying bookkeeping never abort the response path.
pub struct HealthController {
    accounts: Arc<AccountService>,
    scheduler: Arc<StickyScheduler>,
    overload_minutes: u64,
}

impl HealthController {
    pub fn new(
        accounts: Arc<AccountService>,
        scheduler: Arc<StickyScheduler>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            accounts,
            scheduler,
            overload_minutes: config.overload_handling.enabled_minutes,
        }
    }

    pub fn classify_response(
        &self,
        account_id: &str,
        account_type: &str,
        session_hash: Option<&str>,
        status: u16,
        headers: &HashMap<String, String>,
        body: Option<&str>,
    ) {
        let body_marks_rate_limit = body
            .map(|text| text.to_ascii_lowercase().contains(RATE_LIMIT_BODY_MARKER))
            .unwrap_or(false);

        if status == 401 {
            let count = self.accounts.record_unauthorized_error(account_id);
            tracing::warn!(
                "[Health] Account {} returned 401 (count: {})",
                account_id,
                count
            );
            // Threshold is one: a single 401 is enough to pull the account.
            if count >= 1 {
                if let Err(e) =
                    self.scheduler
                        .mark_account_unauthorized(account_id, account_type, session_hash)
                {
                    tracing::error!(
                        "[Health] Failed to mark account {} unauthorized: {}",
                        account_id,
                        e
                    );
                }
            }
        } else if status == 403 {
            if let Err(e) =
                self.scheduler
                    .mark_account_blocked(account_id, account_type, session_hash)
            {
                tracing::error!("[Health] Failed to mark account {} blocked: {}", account_id, e);
            }
        } else if status == 429 || body_marks_rate_limit {
            let reset_at = header_lookup(headers, RATE_LIMIT_RESET_HEADER)
                .and_then(|value| value.trim().parse::<i64>().ok());
            if let Err(e) = self.scheduler.mark_account_rate_limited(
                account_id,
                account_type,
                session_hash,
                reset_at,
            ) {
                tracing::error!(
                    "[Health] Failed to mark account {} rate limited: {}",
                    account_id,
                    e
                );
            }
        } else if status == 529 {
            if self.overload_minutes > 0 {
                self.accounts
                    .mark_account_overloaded(account_id, self.overload_minutes);
            } else {
                tracing::warn!(
                    "[Health] Account {} overloaded (529), overload handling disabled",
                    account_id
                );
            }
        } else if (500..=599).contains(&status) {
            self.note_server_error(account_id, status);
        } else {
            tracing::debug!(
                "[Health] Unclassified upstream status {} for account {}",
                status,
                account_id
            );
        }
    }

    pub fn record_success(&self, account_id: &str, headers: &HashMap<String, String>) {
        self.accounts.clear_unauthorized_errors(account_id);
        self.accounts.clear_internal_errors(account_id);
        if self.accounts.is_rate_limited(account_id) {
            self.accounts.remove_rate_limit(account_id);
            tracing::info!("[Health] Account {} recovered from rate limit", account_id);
        }
        if self.accounts.is_account_overloaded(account_id) {
            self.accounts.remove_account_overload(account_id);
            tracing::info!("[Health] Account {} recovered from overload", account_id);
        }
        if let Some(window_status) = header_lookup(headers, SESSION_WINDOW_HEADER) {
            self.accounts
                .update_session_window_status(account_id, window_status);
        }
    }

    // A connect timeout never produced a status line; book it as a 504.
    pub fn record_connection_timeout(&self, account_id: &str) {
        self.note_server_error(account_id, 504);
    }

    fn note_server_error(&self, account_id: &str, status: u16) {
        let count = self.accounts.record_server_error(account_id);
        if count >= SERVER_ERROR_ALERT_THRESHOLD {
            // No auto-disable; an operator has to look at this account.
            tracing::error!(
                "[Health] Account {} has {} recent server errors (last status: {})",
                account_id,
                count,
                status
            );
        } else {
            tracing::warn!(
                "[Health] Account {} server error {} (count: {})",
                account_id,
                status,
                count
            );
        }
    }
}
