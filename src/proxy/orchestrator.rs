use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, RelayResult};
use crate::models::account::{Account, AccountSelection};
use crate::models::config::RelayConfig;
use crate::models::usage::UsageRecord;
use crate::pricing::PricingTable;
use crate::proxy::accounts::AccountService;
use crate::proxy::beta::build_beta_header;
use crate::proxy::dump::RequestDumper;
use crate::proxy::health::{header_lookup, HealthController};
use crate::proxy::prepare::{
    build_request_headers, capture_unified_user_agent, filter_client_headers, prepare_body,
    request_path, ClaudeCodeValidator, CliHeaderValidator,
};
use crate::proxy::proxy_pool::{ProxyAgent, ProxyAgentFactory};
use crate::proxy::scheduler::{session_hash, StickyScheduler};
use crate::proxy::sse_tap::{LineBuffer, UsageAccumulator};
use crate::proxy::upstream::{
    connection_error_status, humanize_connection_error, RequestOptions, UpstreamClient,
};
use crate::store::KvStore;

const ERROR_BODY_LIMIT: usize = 64 * 1024;
const ERROR_BODY_READ_TIMEOUT: Duration = Duration::from_secs(10);

pub type UsageCallback = Box<dyn FnOnce(UsageRecord) + Send + 'static>;
pub type LineTransformer = Box<dyn FnMut(&str) -> Option<String> + Send + 'static>;
pub type RelaySseStream = Pin<Box<dyn Stream<Item = RelayResult<Bytes>> + Send>>;

#[derive(Default)]
pub struct RelayOptions {
    pub is_count_tokens: bool,
    // Ingress-disconnect signal; firing it aborts the upstream exchange.
    pub cancel: Option<CancellationToken>,
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct RelayResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub account_id: String,
}

// Process-wide relay wiring: every request task shares these services.
pub struct RelayContext {
    pub config: Arc<RelayConfig>,
    pub accounts: Arc<AccountService>,
    pub scheduler: Arc<StickyScheduler>,
    pub health: Arc<HealthController>,
    pub upstream: Arc<UpstreamClient>,
    pub proxies: Arc<ProxyAgentFactory>,
    pub pricing: Arc<PricingTable>,
    pub validator: Arc<dyn ClaudeCodeValidator>,
    pub dumper: Arc<RequestDumper>,
}

impl RelayContext {
    pub fn new(config: RelayConfig, kv: Arc<dyn KvStore>, pricing: PricingTable) -> Self {
        let config = Arc::new(config);
        let accounts = Arc::new(AccountService::new(kv));
        let scheduler = Arc::new(StickyScheduler::new(accounts.clone()));
        let health = Arc::new(HealthController::new(
            accounts.clone(),
            scheduler.clone(),
            &config,
        ));
        let upstream = Arc::new(UpstreamClient::new(&config));
        let proxies = Arc::new(ProxyAgentFactory::new(config.proxy.use_ipv4));
        let dumper = Arc::new(RequestDumper::new(config.dump.clone()));
        Self {
            config,
            accounts,
            scheduler,
            health,
            upstream,
            proxies,
            pricing: Arc::new(pricing),
            validator: Arc::new(CliHeaderValidator),
            dumper,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ClaudeCodeValidator>) -> Self {
        self.validator = validator;
        self
    }

    // Must run inside a tokio runtime; owns the pool reaper.
    pub fn start_background_tasks(self: &Arc<Self>) {
        self.upstream.start_reaper();
    }

    async fn plan_dispatch(
        &self,
        body: &Value,
        api_key: &str,
        client_headers: &HashMap<String, String>,
        streaming: bool,
        opts: &RelayOptions,
    ) -> RelayResult<DispatchPlan> {
        let session = session_hash(body);
        let model = body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let selection =
            self.scheduler
                .select_account_for_api_key(api_key, session.as_deref(), &model)?;
        let access_token = self.accounts.get_valid_access_token(&selection.account_id)?;
        let account = self.accounts.get_account(&selection.account_id)?;
        self.accounts.touch(&account.id);

        if let Some(user_agent) = capture_unified_user_agent(&account, client_headers) {
            self.accounts.capture_user_agent(user_agent);
        }

        let is_real_claude_code = self.validator.validate(
            client_headers,
            body,
            crate::constants::MESSAGES_PATH,
        );
        let prepared = prepare_body(
            body,
            &account,
            &self.config,
            &self.pricing,
            is_real_claude_code,
            opts.is_count_tokens,
        );

        let prepared_model = prepared
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(&model)
            .to_string();
        let client_beta = client_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("anthropic-beta"))
            .map(|(_, value)| value.as_str());
        let beta = build_beta_header(
            &prepared_model,
            &self.config.claude.beta_header,
            client_beta,
            opts.is_count_tokens,
        );

        let mut headers = filter_client_headers(client_headers);
        headers.extend(build_request_headers(
            &access_token,
            &account,
            &self.config,
            &beta,
            streaming,
        ));
        if beta.is_empty() {
            headers.remove("anthropic-beta");
        }

        let path = request_path(opts.is_count_tokens, !beta.is_empty());
        let url = format!(
            "{}{}",
            self.config.claude.api_url.trim_end_matches('/'),
            path
        );

        // A broken proxy binding degrades to a direct dispatch instead of
        // failing the request.
        let proxy: Option<ProxyAgent> = match &account.proxy {
            Some(descriptor) => match self.proxies.agent_for(descriptor) {
                Ok(agent) => Some(agent),
                Err(e) => {
                    tracing::error!(
                        "[Relay] Proxy for account {} unusable ({}), dispatching direct",
                        account.id,
                        e
                    );
                    None
                }
            },
            None => None,
        };

        Ok(DispatchPlan {
            selection,
            account,
            session,
            model: prepared_model,
            body: prepared,
            headers,
            url,
            proxy,
        })
    }

    // Buffered end-to-end relay. The upstream body is returned unchanged;
    // health classification happens before this returns.
    pub async fn relay_request(
        &self,
        body: Value,
        api_key: &str,
        client_headers: &HashMap<String, String>,
        opts: RelayOptions,
    ) -> RelayResult<RelayResponse> {
        let plan = self
            .plan_dispatch(&body, api_key, client_headers, false, &opts)
            .await?;
        self.dumper
            .dump(&plan.model, "request", &plan.headers, &plan.body)
            .await;

        let mut request_opts = RequestOptions::post(plan.headers.clone(), plan.body.clone());
        request_opts.proxy = plan.proxy.clone();
        request_opts.timeout = opts.timeout;
        let dispatch = self.upstream.request(&plan.url, request_opts);

        let response = match &opts.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        tracing::info!(
                            "[Relay] Client disconnected, aborting upstream request for account {}",
                            plan.account.id
                        );
                        return Err(RelayError::Aborted);
                    }
                    result = dispatch => result,
                }
            }
            None => dispatch.await,
        };

        let response = match response {
            Ok(response) => response,
            Err(RelayError::Network(e)) => {
                if e.is_timeout() {
                    self.health.record_connection_timeout(&plan.account.id);
                }
                return Err(RelayError::Upstream(humanize_connection_error(&e)));
            }
            Err(other) => return Err(other),
        };

        if response.is_success() {
            self.health.record_success(&plan.account.id, &response.headers);
            let usage = usage_from_buffered_response(&response.body, &plan.model, &plan.account.id);
            tracing::info!(
                "[Relay] ✓ Request completed | Account: {} | Model: {} | In: {} | Out: {}",
                plan.account.id,
                usage.model,
                usage.input_tokens,
                usage.output_tokens
            );
        } else {
            self.health.classify_response(
                &plan.selection.account_id,
                &plan.selection.account_type,
                plan.session.as_deref(),
                response.status,
                &response.headers,
                Some(&response.text()),
            );
        }

        self.dumper
            .dump(
                &plan.model,
                "response",
                &response.headers,
                &response.json().unwrap_or(Value::Null),
            )
            .await;

        Ok(RelayResponse {
            status: response.status,
            headers: response.headers,
            body: response.body,
            account_id: plan.account.id,
        })
    }

    // Streaming relay: bytes are forwarded to the returned stream in arrival
    // order while the tap extracts usage. The callback fires exactly once
    // after a successful stream and never after a failed one. Dropping the
    // stream cancels the upstream exchange.
    pub async fn relay_stream_request_with_usage_capture(
        &self,
        body: Value,
        api_key: &str,
        client_headers: &HashMap<String, String>,
        usage_callback: UsageCallback,
        stream_transformer: Option<LineTransformer>,
        opts: RelayOptions,
    ) -> RelayResult<RelaySseStream> {
        let plan = self
            .plan_dispatch(&body, api_key, client_headers, true, &opts)
            .await?;
        self.dumper
            .dump(&plan.model, "stream_request", &plan.headers, &plan.body)
            .await;

        let mut request_opts = RequestOptions::post(plan.headers.clone(), plan.body.clone());
        request_opts.proxy = plan.proxy.clone();
        request_opts.timeout = opts.timeout;

        let handle = match self.upstream.stream_sse(&plan.url, request_opts).await {
            Ok(handle) => handle,
            Err(RelayError::Network(e)) => {
                let status = connection_error_status(&e);
                if status == 504 {
                    self.health.record_connection_timeout(&plan.account.id);
                }
                tracing::error!(
                    "[Relay] Stream connect failed for account {}: {}",
                    plan.account.id,
                    e
                );
                return Ok(single_frame(sse_error_frame(
                    status,
                    &humanize_connection_error(&e),
                    None,
                )));
            }
            Err(other) => return Err(other),
        };

        if !(200..300).contains(&handle.status) {
            let details = read_error_body(handle.stream).await;
            self.health.classify_response(
                &plan.selection.account_id,
                &plan.selection.account_type,
                plan.session.as_deref(),
                handle.status,
                &handle.headers,
                Some(&details),
            );
            tracing::warn!(
                "[Relay] Upstream stream returned {} for account {}",
                handle.status,
                plan.account.id
            );
            return Ok(single_frame(sse_error_frame(
                handle.status,
                "Upstream error",
                Some(&details),
            )));
        }

        let health = self.health.clone();
        let scheduler = self.scheduler.clone();
        let selection = plan.selection.clone();
        let session = plan.session.clone();
        let response_headers = handle.headers.clone();
        let account_id = plan.account.id.clone();
        let fallback_model = plan.model.clone();
        let chunk_timeout = opts
            .timeout
            .unwrap_or(Duration::from_secs(self.config.request_timeout_secs));
        let cancel = opts.cancel.clone();
        let mut transformer = stream_transformer;
        let mut upstream_stream = handle.stream;

        let stream = async_stream::stream! {
            let mut accumulator = UsageAccumulator::new(&fallback_model);
            let mut lines = LineBuffer::new();
            let mut failed = false;
            let mut cancelled = false;

            loop {
                let next_chunk = if let Some(token) = &cancel {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            tracing::info!(
                                "[Relay] Client disconnected, closing upstream stream for account {}",
                                account_id
                            );
                            cancelled = true;
                            break;
                        }
                        result = tokio::time::timeout(chunk_timeout, upstream_stream.next()) => result,
                    }
                } else {
                    tokio::time::timeout(chunk_timeout, upstream_stream.next()).await
                };

                match next_chunk {
                    Ok(Some(Ok(chunk))) => {
                        for line in lines.push(&chunk) {
                            let text = String::from_utf8_lossy(&line).into_owned();
                            accumulator.observe_line(&text);
                            match transformer.as_mut() {
                                Some(rewrite) => {
                                    if let Some(replacement) = rewrite(&text) {
                                        yield Ok(Bytes::from(replacement));
                                    }
                                }
                                None => yield Ok(line),
                            }
                        }
                    }
                    Ok(Some(Err(e))) => {
                        let status = connection_error_status(&e);
                        if status == 504 {
                            health.record_connection_timeout(&account_id);
                        }
                        tracing::error!(
                            "[Relay] Stream error for account {}: {}",
                            account_id,
                            e
                        );
                        yield Ok(sse_error_frame(status, &humanize_connection_error(&e), None));
                        failed = true;
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        health.record_connection_timeout(&account_id);
                        tracing::error!(
                            "[Relay] Stream timed out after {}s for account {}",
                            chunk_timeout.as_secs(),
                            account_id
                        );
                        yield Ok(sse_error_frame(504, "Connection timed out", None));
                        failed = true;
                        break;
                    }
                }
            }

            if let Some(remainder) = lines.take_remainder() {
                let text = String::from_utf8_lossy(&remainder).into_owned();
                accumulator.observe_line(&text);
                match transformer.as_mut() {
                    Some(rewrite) => {
                        if let Some(replacement) = rewrite(&text) {
                            yield Ok(Bytes::from(replacement));
                        }
                    }
                    None => yield Ok(remainder),
                }
            }

            if !failed && !cancelled {
                let rate_limited = accumulator.rate_limit_detected();
                let mut usage = accumulator.finalize();
                usage.account_id = account_id.clone();

                if rate_limited {
                    let reset_at = header_lookup(&response_headers, crate::constants::RATE_LIMIT_RESET_HEADER)
                        .and_then(|value| value.trim().parse::<i64>().ok());
                    if let Err(e) = scheduler.mark_account_rate_limited(
                        &selection.account_id,
                        &selection.account_type,
                        session.as_deref(),
                        reset_at,
                    ) {
                        tracing::error!(
                            "[Relay] Failed to mark account {} rate limited: {}",
                            selection.account_id,
                            e
                        );
                    }
                } else {
                    health.record_success(&account_id, &response_headers);
                }

                tracing::info!(
                    "[Relay] ✓ Stream completed | Account: {} | Model: {} | In: {} | Out: {}",
                    account_id,
                    usage.model,
                    usage.input_tokens,
                    usage.output_tokens
                );
                usage_callback(usage);
            }
        };

        Ok(Box::pin(stream))
    }
}

struct DispatchPlan {
    selection: AccountSelection,
    account: Account,
    session: Option<String>,
    model: String,
    body: Value,
    headers: HashMap<String, String>,
    url: String,
    proxy: Option<ProxyAgent>,
}

fn sse_error_frame(status: u16, error: &str, details: Option<&str>) -> Bytes {
    let payload = json!({
        "error": error,
        "status": status,
        "details": details,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    Bytes::from(format!("event: error\ndata: {}\n\n", payload))
}

fn single_frame(frame: Bytes) -> RelaySseStream {
    Box::pin(futures::stream::once(async move {
        Ok::<Bytes, RelayError>(frame)
    }))
}

async fn read_error_body(
    mut stream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
) -> String {
    let mut collected = Vec::new();
    loop {
        match tokio::time::timeout(ERROR_BODY_READ_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(chunk))) => {
                collected.extend_from_slice(&chunk);
                if collected.len() >= ERROR_BODY_LIMIT {
                    break;
                }
            }
            _ => break,
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

// Usage for buffered responses: trust the body's usage object, otherwise
// estimate output from the response length.
fn usage_from_buffered_response(body: &Bytes, fallback_model: &str, account_id: &str) -> UsageRecord {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let mut usage = parsed
        .as_ref()
        .and_then(|value| value.get("usage"))
        .and_then(|value| serde_json::from_value::<UsageRecord>(value.clone()).ok())
        .unwrap_or_else(|| UsageRecord {
            output_tokens: (body.len() / 4) as u64,
            ..Default::default()
        });
    usage.model = parsed
        .as_ref()
        .and_then(|value| value.get("model"))
        .and_then(|value| value.as_str())
        .unwrap_or(fallback_model)
        .to_string();
    usage.account_id = account_id.to_string();
    usage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::account::Account;
    use crate::store::MemoryKv;
    use axum::extract::{RawQuery, State};
    use axum::http::HeaderMap as AxumHeaderMap;
    use axum::response::Response;
    use axum::routing::post;
    use axum::{body::Body, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct MockUpstreamState {
        hits: Arc<AtomicUsize>,
        captured_headers: Arc<Mutex<Vec<(String, String)>>>,
        captured_query: Arc<Mutex<Option<String>>>,
        captured_body: Arc<Mutex<Option<Value>>>,
        responses: Arc<Mutex<Vec<MockResponse>>>,
    }

    #[derive(Clone)]
    enum MockResponse {
        Json(u16, Vec<(String, String)>, Value),
        Sse(String),
    }

    async fn mock_handler(
        State(state): State<MockUpstreamState>,
        RawQuery(query): RawQuery,
        headers: AxumHeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        state.hits.fetch_add(1, Ordering::SeqCst);
        *state.captured_query.lock().unwrap() = query;
        *state.captured_body.lock().unwrap() = Some(body);
        let mut captured = Vec::new();
        for (name, value) in &headers {
            captured.push((
                name.as_str().to_string(),
                value.to_str().unwrap_or("<bin>").to_string(),
            ));
        }
        *state.captured_headers.lock().unwrap() = captured;

        let next = {
            let mut responses = state.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses[0].clone()
            }
        };
        match next {
            MockResponse::Json(status, headers, payload) => {
                let mut builder = Response::builder().status(status);
                for (name, value) in headers {
                    builder = builder.header(name, value);
                }
                builder
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap()
            }
            MockResponse::Sse(events) => Response::builder()
                .status(200)
                .header("content-type", "text/event-stream")
                .body(Body::from(events))
                .unwrap(),
        }
    }

    async fn spawn_mock(
        responses: Vec<MockResponse>,
    ) -> (String, MockUpstreamState, tokio::task::JoinHandle<()>) {
        let state = MockUpstreamState {
            responses: Arc::new(Mutex::new(responses)),
            ..Default::default()
        };
        let app = Router::new()
            .route("/v1/messages", post(mock_handler))
            .route("/v1/messages/count_tokens", post(mock_handler))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock");
        });
        (format!("http://{}", addr), state, server)
    }

    fn context_for(base_url: &str, account_ids: &[&str]) -> RelayContext {
        let mut config = RelayConfig::default();
        config.claude.api_url = base_url.to_string();
        config.request_timeout_secs = 10;
        config.connect_timeout_secs = 2;
        let ctx = RelayContext::new(config, Arc::new(MemoryKv::new()), PricingTable::default());
        for id in account_ids {
            ctx.accounts.upsert_account(Account::new(*id, *id));
            ctx.accounts.set_access_token(id, format!("tok-{}", id));
        }
        ctx
    }

    fn chat_body() -> Value {
        json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1000,
            "stream": false,
            "messages": [{"role": "user", "content": "Summarize the release notes please."}]
        })
    }

    fn find_header(headers: &[(String, String)], name: &str) -> Option<String> {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    #[tokio::test]
    async fn relay_sends_bearer_auth_and_beta_query() {
        let (base, state, server) = spawn_mock(vec![MockResponse::Json(
            200,
            vec![],
            json!({"id": "msg_1", "model": "claude-sonnet-4-20250514", "usage": {"input_tokens": 3, "output_tokens": 7}}),
        )])
        .await;
        let ctx = context_for(&base, &["a"]);

        let response = ctx
            .relay_request(chat_body(), "key-1", &HashMap::new(), RelayOptions::default())
            .await
            .expect("relay should succeed");
        server.abort();

        assert_eq!(response.status, 200);
        assert_eq!(response.account_id, "a");

        let headers = state.captured_headers.lock().unwrap().clone();
        assert_eq!(find_header(&headers, "authorization").as_deref(), Some("Bearer tok-a"));
        assert_eq!(find_header(&headers, "anthropic-version").as_deref(), Some("2023-06-01"));
        assert_eq!(find_header(&headers, "x-app").as_deref(), Some("cli"));
        assert_eq!(
            find_header(&headers, "anthropic-beta").as_deref(),
            Some("claude-code-20250219,oauth-2025-04-20,interleaved-thinking-2025-05-14,fine-grained-tool-streaming-2025-05-14")
        );
        assert!(find_header(&headers, "user-agent").unwrap().starts_with("claude-cli/"));
        assert_eq!(
            state.captured_query.lock().unwrap().as_deref(),
            Some("beta=true")
        );

        // Claude Code block was injected for this non-CC client.
        let body = state.captured_body.lock().unwrap().clone().unwrap();
        assert_eq!(
            body["system"][0]["text"],
            crate::constants::CLAUDE_CODE_SYSTEM_PROMPT
        );
        assert!(body.get("top_p").is_none());
    }

    #[tokio::test]
    async fn rate_limited_account_is_flagged_and_next_request_reroutes() {
        let (base, _state, server) = spawn_mock(vec![
            MockResponse::Json(
                429,
                vec![(
                    "anthropic-ratelimit-unified-reset".to_string(),
                    "1700000000".to_string(),
                )],
                json!({"error": {"type": "rate_limit_error", "message": "rate limited"}}),
            ),
            MockResponse::Json(200, vec![], json!({"id": "msg_2", "usage": {}})),
        ])
        .await;
        let ctx = context_for(&base, &["a", "b"]);

        let first = ctx
            .relay_request(chat_body(), "key-1", &HashMap::new(), RelayOptions::default())
            .await
            .expect("passthrough 429");
        assert_eq!(first.status, 429);
        assert!(ctx.accounts.is_rate_limited(&first.account_id));
        assert_eq!(
            ctx.accounts.rate_limit_reset_at(&first.account_id),
            Some(1700000000)
        );
        assert_eq!(ctx.scheduler.session_count(), 0);

        let second = ctx
            .relay_request(chat_body(), "key-1", &HashMap::new(), RelayOptions::default())
            .await
            .expect("second request");
        server.abort();
        assert_eq!(second.status, 200);
        assert_ne!(second.account_id, first.account_id);
    }

    #[tokio::test]
    async fn unauthorized_escalates_on_first_401() {
        let (base, _state, server) = spawn_mock(vec![MockResponse::Json(
            401,
            vec![],
            json!({"error": {"type": "authentication_error", "message": "bad token"}}),
        )])
        .await;
        let ctx = context_for(&base, &["a"]);

        let response = ctx
            .relay_request(chat_body(), "key-1", &HashMap::new(), RelayOptions::default())
            .await
            .expect("passthrough 401");
        server.abort();

        assert_eq!(response.status, 401);
        assert_eq!(ctx.accounts.get_unauthorized_error_count("a"), 1);
        assert_eq!(
            ctx.accounts.get_account("a").unwrap().status,
            crate::models::account::AccountStatus::Unauthorized
        );
    }

    #[tokio::test]
    async fn success_clears_flags_and_persists_session_window() {
        let (base, _state, server) = spawn_mock(vec![MockResponse::Json(
            200,
            vec![(
                "anthropic-ratelimit-unified-5h-status".to_string(),
                "allowed_warning".to_string(),
            )],
            json!({"id": "msg_1", "usage": {"input_tokens": 1, "output_tokens": 1}}),
        )])
        .await;
        let ctx = context_for(&base, &["a"]);
        ctx.accounts.mark_rate_limited("a", None);
        ctx.accounts.record_unauthorized_error("a");

        // The rate-limit flag makes the scheduler skip the account, so lift
        // it into a state where it is selectable but still flagged dirty.
        ctx.accounts.remove_rate_limit("a");
        ctx.relay_request(chat_body(), "key-1", &HashMap::new(), RelayOptions::default())
            .await
            .expect("success");
        server.abort();

        assert_eq!(ctx.accounts.get_unauthorized_error_count("a"), 0);
        assert_eq!(
            ctx.accounts.get_session_window_status("a").as_deref(),
            Some("allowed_warning")
        );
    }

    #[tokio::test]
    async fn streaming_forwards_bytes_verbatim_and_reports_usage_once() {
        let events = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-sonnet-4-20250514\",\"usage\":{\"input_tokens\":10,\"cache_creation_input_tokens\":5,\"cache_read_input_tokens\":2}}}\n",
            "\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n",
            "\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":42}}\n",
            "\n"
        );
        let (base, _state, server) = spawn_mock(vec![MockResponse::Sse(events.to_string())]).await;
        let ctx = context_for(&base, &["a"]);

        let captured: Arc<Mutex<Vec<UsageRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let mut stream = ctx
            .relay_stream_request_with_usage_capture(
                chat_body(),
                "key-1",
                &HashMap::new(),
                Box::new(move |usage| sink.lock().unwrap().push(usage)),
                None,
                RelayOptions::default(),
            )
            .await
            .expect("stream should open");

        let mut forwarded = Vec::new();
        while let Some(item) = stream.next().await {
            forwarded.extend_from_slice(&item.expect("forwarded bytes"));
        }
        server.abort();

        let text = String::from_utf8(forwarded).unwrap();
        assert_eq!(text, events);

        let usages = captured.lock().unwrap().clone();
        assert_eq!(usages.len(), 1, "usage callback must fire exactly once");
        let usage = &usages[0];
        assert_eq!(usage.model, "claude-sonnet-4-20250514");
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 42);
        assert_eq!(usage.cache_creation_input_tokens, 5);
        assert_eq!(usage.cache_read_input_tokens, 2);
        assert_eq!(usage.account_id, "a");
    }

    #[tokio::test]
    async fn streaming_transformer_rewrites_forwarded_lines_only() {
        let events = concat!(
            "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-sonnet-4-20250514\",\"usage\":{\"input_tokens\":4}}}\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":6}}\n",
        );
        let (base, _state, server) = spawn_mock(vec![MockResponse::Sse(events.to_string())]).await;
        let ctx = context_for(&base, &["a"]);

        let captured: Arc<Mutex<Vec<UsageRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let mut stream = ctx
            .relay_stream_request_with_usage_capture(
                chat_body(),
                "key-1",
                &HashMap::new(),
                Box::new(move |usage| sink.lock().unwrap().push(usage)),
                Some(Box::new(|_line| Some("data: rewritten\n".to_string()))),
                RelayOptions::default(),
            )
            .await
            .expect("stream should open");

        let mut forwarded = Vec::new();
        while let Some(item) = stream.next().await {
            forwarded.extend_from_slice(&item.unwrap());
        }
        server.abort();

        let text = String::from_utf8(forwarded).unwrap();
        assert!(text.lines().all(|line| line == "data: rewritten"));
        // The tap still saw the original bytes.
        let usages = captured.lock().unwrap().clone();
        assert_eq!(usages[0].input_tokens, 4);
        assert_eq!(usages[0].output_tokens, 6);
    }

    #[tokio::test]
    async fn streaming_non_2xx_emits_single_error_frame_without_usage() {
        let (base, _state, server) = spawn_mock(vec![MockResponse::Json(
            529,
            vec![],
            json!({"error": {"type": "overloaded_error", "message": "Overloaded"}}),
        )])
        .await;
        let mut config = RelayConfig::default();
        config.claude.api_url = base.clone();
        config.overload_handling.enabled_minutes = 5;
        let ctx = RelayContext::new(config, Arc::new(MemoryKv::new()), PricingTable::default());
        ctx.accounts.upsert_account(Account::new("a", "a"));
        ctx.accounts.set_access_token("a", "tok-a");

        let captured: Arc<Mutex<Vec<UsageRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let mut stream = ctx
            .relay_stream_request_with_usage_capture(
                chat_body(),
                "key-1",
                &HashMap::new(),
                Box::new(move |usage| sink.lock().unwrap().push(usage)),
                None,
                RelayOptions::default(),
            )
            .await
            .expect("error frame stream");

        let mut frames = Vec::new();
        while let Some(item) = stream.next().await {
            frames.push(String::from_utf8(item.unwrap().to_vec()).unwrap());
        }
        server.abort();

        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with("event: error\n"));
        assert!(frames[0].contains("\"status\":529"));
        assert!(ctx.accounts.is_account_overloaded("a"));
        assert!(captured.lock().unwrap().is_empty(), "no usage on failure");
    }

    #[tokio::test]
    async fn in_band_rate_limit_error_escalates_after_stream() {
        let events = concat!(
            "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-sonnet-4-20250514\",\"usage\":{\"input_tokens\":1}}}\n",
            "data: {\"type\":\"error\",\"error\":{\"type\":\"rate_limit_error\",\"message\":\"You exceed your account's rate limit\"}}\n",
        );
        let (base, _state, server) = spawn_mock(vec![MockResponse::Sse(events.to_string())]).await;
        let ctx = context_for(&base, &["a"]);

        let mut stream = ctx
            .relay_stream_request_with_usage_capture(
                chat_body(),
                "key-1",
                &HashMap::new(),
                Box::new(|_| {}),
                None,
                RelayOptions::default(),
            )
            .await
            .unwrap();
        while stream.next().await.is_some() {}
        server.abort();

        assert!(ctx.accounts.is_rate_limited("a"));
    }

    #[tokio::test]
    async fn cancellation_aborts_without_usage_callback() {
        let (base, _state, server) = spawn_mock(vec![MockResponse::Json(
            200,
            vec![],
            json!({"id": "msg", "usage": {}}),
        )])
        .await;
        let ctx = context_for(&base, &["a"]);

        let token = CancellationToken::new();
        token.cancel();
        let result = ctx
            .relay_request(
                chat_body(),
                "key-1",
                &HashMap::new(),
                RelayOptions {
                    cancel: Some(token),
                    ..Default::default()
                },
            )
            .await;
        server.abort();
        assert!(matches!(result, Err(RelayError::Aborted)));
    }

    #[tokio::test]
    async fn connect_failure_surfaces_humanized_error() {
        let ctx = context_for("http://127.0.0.1:1", &["a"]);
        let err = ctx
            .relay_request(chat_body(), "key-1", &HashMap::new(), RelayOptions::default())
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("Connection refused"));
    }

    #[tokio::test]
    async fn count_tokens_rewrites_the_path_and_keeps_body() {
        let (base, state, server) = spawn_mock(vec![MockResponse::Json(
            200,
            vec![],
            json!({"input_tokens": 12}),
        )])
        .await;
        let ctx = context_for(&base, &["a"]);

        let body = json!({
            "model": "claude-sonnet-4-20250514",
            "top_p": 0.5,
            "messages": [{"role": "user", "content": "Count me."}]
        });
        let response = ctx
            .relay_request(
                body.clone(),
                "key-1",
                &HashMap::new(),
                RelayOptions {
                    is_count_tokens: true,
                    ..Default::default()
                },
            )
            .await
            .expect("count tokens");
        server.abort();

        assert_eq!(response.status, 200);
        // Body passed through untouched, token-counting beta advertised.
        let seen = state.captured_body.lock().unwrap().clone().unwrap();
        assert_eq!(seen, body);
        let headers = state.captured_headers.lock().unwrap().clone();
        assert!(find_header(&headers, "anthropic-beta")
            .unwrap()
            .ends_with("token-counting-2024-11-01"));
    }

    #[tokio::test]
    async fn sticky_sessions_pin_identical_bodies_to_one_account() {
        let (base, _state, server) = spawn_mock(vec![MockResponse::Json(
            200,
            vec![],
            json!({"id": "msg", "usage": {}}),
        )])
        .await;
        let ctx = context_for(&base, &["a", "b", "c"]);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let response = ctx
                .relay_request(chat_body(), "key-1", &HashMap::new(), RelayOptions::default())
                .await
                .unwrap();
            seen.insert(response.account_id);
        }
        server.abort();
        assert_eq!(seen.len(), 1, "identical bodies must stay on one account");
    }
}
