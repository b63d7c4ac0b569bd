use std::collections::HashMap;
use std::error::Error as _;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use futures::Stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde_json::Value;
use url::Url;

use crate::error::{RelayError, RelayResult};
use crate::models::config::RelayConfig;
use crate::proxy::proxy_pool::ProxyAgent;

const REAPER_INTERVAL: Duration = Duration::from_secs(60);
const IDLE_EVICTION: Duration = Duration::from_secs(300);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const POOL_MAX_IDLE_PER_HOST: usize = 10;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

pub type UpstreamByteStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

pub struct RequestOptions {
    pub method: Method,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub proxy: Option<ProxyAgent>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn post(headers: HashMap<String, String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            headers,
            body: Some(body),
            proxy: None,
            timeout: None,
        }
    }
}

// Fully buffered upstream response. reqwest already decompressed the body
// per content-encoding and its header map carries no HTTP/2 pseudo-headers.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

// A live SSE exchange: status and headers observed once, body consumed as a
// byte stream in arrival order.
pub struct SseHandle {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub stream: UpstreamByteStream,
}

struct PooledClient {
    client: Client,
    last_used: Instant,
}

// Long-lived client pool keyed by host:port plus the proxy identity. Each
// pooled client multiplexes HTTP/2 streams over its own connections; idle
// entries are reaped so abandoned hosts do not pin sockets forever.
pub struct UpstreamClient {
    clients: DashMap<String, PooledClient>,
    connect_timeout: Duration,
    request_timeout: Duration,
    prefer_ipv4: bool,
}

impl UpstreamClient {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            clients: DashMap::new(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            prefer_ipv4: config.proxy.use_ipv4,
        }
    }

    pub fn start_reaper(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REAPER_INTERVAL).await;
                let evicted = pool.reap_older_than(IDLE_EVICTION);
                if evicted > 0 {
                    tracing::debug!("[Upstream] Reaped {} idle client(s)", evicted);
                }
            }
        });
    }

    pub fn reap_older_than(&self, idle: Duration) -> usize {
        let before = self.clients.len();
        self.clients
            .retain(|_, pooled| pooled.last_used.elapsed() < idle);
        before - self.clients.len()
    }

    pub fn pooled_clients(&self) -> usize {
        self.clients.len()
    }

    fn pool_key(url: &Url, proxy: Option<&ProxyAgent>) -> String {
        let host = url.host_str().unwrap_or_default();
        let port = url.port_or_known_default().unwrap_or(443);
        match proxy {
            Some(agent) => format!("{}:{}|{}", host, port, agent.cache_key),
            None => format!("{}:{}", host, port),
        }
    }

    // Race-free get-or-create: a concurrent loser's freshly built client is
    // dropped on the floor instead of leaking into the pool.
    fn client_for(&self, url: &Url, proxy: Option<&ProxyAgent>) -> RelayResult<Client> {
        let key = Self::pool_key(url, proxy);
        if let Some(mut pooled) = self.clients.get_mut(&key) {
            pooled.last_used = Instant::now();
            return Ok(pooled.client.clone());
        }

        let client = self.build_client(proxy)?;
        let mut entry = self.clients.entry(key).or_insert(PooledClient {
            client,
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();
        Ok(entry.client.clone())
    }

    fn build_client(&self, proxy: Option<&ProxyAgent>) -> RelayResult<Client> {
        let mut builder = Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .tcp_keepalive(TCP_KEEPALIVE)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT);

        let prefer_ipv4 = proxy.map(|agent| agent.prefer_ipv4).unwrap_or(self.prefer_ipv4);
        if prefer_ipv4 {
            builder = builder.local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        }
        if let Some(agent) = proxy {
            builder = builder.proxy(agent.proxy.clone());
        }
        builder.build().map_err(RelayError::Network)
    }

    fn build_request(
        &self,
        client: &Client,
        url: Url,
        opts: &RequestOptions,
    ) -> reqwest::RequestBuilder {
        let mut request = client.request(opts.method.clone(), url);
        request = request.headers(to_header_map(&opts.headers));
        if let Some(body) = &opts.body {
            request = request.json(body);
        }
        if let Some(timeout) = opts.timeout {
            request = request.timeout(timeout);
        }
        request
    }

    pub async fn request(&self, url: &str, opts: RequestOptions) -> RelayResult<UpstreamResponse> {
        let parsed =
            Url::parse(url).map_err(|e| RelayError::Config(format!("Invalid URL {}: {}", url, e)))?;
        let client = self.client_for(&parsed, opts.proxy.as_ref())?;
        let response = self
            .build_request(&client, parsed, &opts)
            .send()
            .await
            .map_err(RelayError::Network)?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response.bytes().await.map_err(RelayError::Network)?;
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    pub async fn stream_sse(&self, url: &str, opts: RequestOptions) -> RelayResult<SseHandle> {
        let parsed =
            Url::parse(url).map_err(|e| RelayError::Config(format!("Invalid URL {}: {}", url, e)))?;
        let client = self.client_for(&parsed, opts.proxy.as_ref())?;
        let response = self
            .build_request(&client, parsed, &opts)
            .send()
            .await
            .map_err(RelayError::Network)?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        Ok(SseHandle {
            status,
            headers,
            stream: Box::pin(response.bytes_stream()),
        })
    }
}

fn to_header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = match HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()) {
            Ok(name) => name,
            Err(_) => {
                tracing::warn!("[Upstream] Dropping invalid header name: {}", name);
                continue;
            }
        };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                map.insert(name, value);
            }
            Err(_) => tracing::warn!("[Upstream] Dropping invalid value for header {}", name),
        }
    }
    map
}

fn collect_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !name.as_str().starts_with(':'))
        .map(|(name, value)| {
            (
                name.as_str().to_ascii_lowercase(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

// Pure mapping from transport failures to operator-facing messages.
pub fn humanize_connection_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        return "Connection timed out".to_string();
    }

    let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionReset => {
                    return "Connection reset by peer".to_string()
                }
                std::io::ErrorKind::ConnectionRefused => return "Connection refused".to_string(),
                std::io::ErrorKind::TimedOut => return "Connection timed out".to_string(),
                _ => {}
            }
        }
        let rendered = cause.to_string().to_ascii_lowercase();
        if rendered.contains("dns") || rendered.contains("resolve") {
            return "Unable to resolve hostname".to_string();
        }
        if rendered.contains("connection refused") {
            return "Connection refused".to_string();
        }
        if rendered.contains("connection reset") {
            return "Connection reset by peer".to_string();
        }
        source = cause.source();
    }

    format!("Connection error: {}", err)
}

// Streams map connect-class failures to 502 and timeouts to 504.
pub fn connection_error_status(err: &reqwest::Error) -> u16 {
    if err.is_timeout() {
        504
    } else {
        502
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, routing::post, Json, Router};
    use serde_json::json;
    use tokio::net::TcpListener;

    fn test_config(url_timeout_secs: u64) -> RelayConfig {
        let mut config = RelayConfig::default();
        config.request_timeout_secs = url_timeout_secs;
        config.connect_timeout_secs = 2;
        config
    }

    async fn spawn_upstream(app: Router) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve upstream");
        });
        (format!("http://{}", addr), server)
    }

    #[tokio::test]
    async fn request_buffers_body_and_lowercases_headers() {
        let app = Router::new().route(
            "/v1/messages",
            post(|| async {
                ([("X-Custom-Header", "Value")], Json(json!({"ok": true})))
            }),
        );
        let (base, server) = spawn_upstream(app).await;

        let client = UpstreamClient::new(&test_config(30));
        let mut headers = HashMap::new();
        headers.insert("X-Test".to_string(), "1".to_string());
        let response = client
            .request(
                &format!("{}/v1/messages", base),
                RequestOptions::post(headers, json!({"model": "m"})),
            )
            .await
            .expect("request should succeed");
        server.abort();

        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("x-custom-header").map(String::as_str), Some("Value"));
        assert_eq!(response.json().unwrap()["ok"], true);
        assert!(response.headers.keys().all(|k| !k.starts_with(':')));
    }

    #[tokio::test]
    async fn clients_are_pooled_per_host_and_reaped_when_idle() {
        let app = Router::new().route("/ping", get(|| async { "pong" }));
        let (base, server) = spawn_upstream(app).await;

        let client = UpstreamClient::new(&test_config(30));
        for _ in 0..3 {
            client
                .request(
                    &format!("{}/ping", base),
                    RequestOptions {
                        method: Method::GET,
                        headers: HashMap::new(),
                        body: None,
                        proxy: None,
                        timeout: None,
                    },
                )
                .await
                .expect("ping");
        }
        server.abort();

        assert_eq!(client.pooled_clients(), 1);
        assert_eq!(client.reap_older_than(Duration::from_secs(300)), 0);
        assert_eq!(client.reap_older_than(Duration::ZERO), 1);
        assert_eq!(client.pooled_clients(), 0);
    }

    #[tokio::test]
    async fn stream_sse_exposes_status_headers_and_ordered_bytes() {
        use futures::StreamExt;

        let app = Router::new().route(
            "/v1/messages",
            post(|| async {
                axum::response::Response::builder()
                    .header("content-type", "text/event-stream")
                    .header("anthropic-ratelimit-unified-5h-status", "allowed")
                    .body(axum::body::Body::from(
                        "event: message_start\ndata: {}\n\nevent: message_stop\ndata: {}\n\n",
                    ))
                    .unwrap()
            }),
        );
        let (base, server) = spawn_upstream(app).await;

        let client = UpstreamClient::new(&test_config(30));
        let mut handle = client
            .stream_sse(
                &format!("{}/v1/messages", base),
                RequestOptions::post(HashMap::new(), json!({})),
            )
            .await
            .expect("stream should open");

        assert_eq!(handle.status, 200);
        assert_eq!(
            handle
                .headers
                .get("anthropic-ratelimit-unified-5h-status")
                .map(String::as_str),
            Some("allowed")
        );

        let mut collected = Vec::new();
        while let Some(chunk) = handle.stream.next().await {
            collected.extend_from_slice(&chunk.expect("chunk"));
        }
        server.abort();

        let text = String::from_utf8(collected).unwrap();
        let start = text.find("message_start").unwrap();
        let stop = text.find("message_stop").unwrap();
        assert!(start < stop, "bytes must arrive in upstream order");
    }

    #[tokio::test]
    async fn refused_connection_is_humanized() {
        let client = UpstreamClient::new(&test_config(30));
        // Port 1 on loopback has no listener.
        let err = client
            .request(
                "http://127.0.0.1:1/v1/messages",
                RequestOptions::post(HashMap::new(), json!({})),
            )
            .await
            .expect_err("must fail");
        match err {
            RelayError::Network(e) => {
                assert_eq!(humanize_connection_error(&e), "Connection refused");
                assert_eq!(connection_error_status(&e), 502);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn slow_upstream_times_out_with_504_classification() {
        let app = Router::new().route(
            "/v1/messages",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let (base, server) = spawn_upstream(app).await;

        let client = UpstreamClient::new(&test_config(30));
        let err = client
            .request(
                &format!("{}/v1/messages", base),
                RequestOptions {
                    method: Method::POST,
                    headers: HashMap::new(),
                    body: Some(json!({})),
                    proxy: None,
                    timeout: Some(Duration::from_millis(150)),
                },
            )
            .await
            .expect_err("must time out");
        server.abort();

        match err {
            RelayError::Network(e) => {
                assert!(e.is_timeout());
                assert_eq!(humanize_connection_error(&e), "Connection timed out");
                assert_eq!(connection_error_status(&e), 504);
            }
            other => panic!("unexpected error: {}", other),
        }

        // A timed-out exchange does not evict the pooled client.
        assert_eq!(client.pooled_clients(), 1);
    }

    #[test]
    fn pool_key_defaults_port_and_separates_proxies() {
        let url = Url::parse("https://api.anthropic.com/v1/messages").unwrap();
        assert_eq!(UpstreamClient::pool_key(&url, None), "api.anthropic.com:443");

        let url = Url::parse("https://api.anthropic.com:8443/v1/messages").unwrap();
        assert_eq!(UpstreamClient::pool_key(&url, None), "api.anthropic.com:8443");
    }

    #[test]
    fn invalid_header_names_are_dropped_not_fatal() {
        let mut headers = HashMap::new();
        headers.insert("ok-header".to_string(), "v".to_string());
        headers.insert("bad header name".to_string(), "v".to_string());
        let map = to_header_map(&headers);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("ok-header"));
    }
}
