//! HTTP collaborator
//!
//! The engine only talks to the network through [`HttpClient`]. The
//! production implementation keeps one `reqwest::Client` (and therefore one
//! connection pool) per egress path.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::header::{HeaderMap, HeaderValue, COOKIE, RETRY_AFTER, SET_COOKIE};
use http::StatusCode;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::HttpClientConfig;
use crate::error::{CourierError, Result};
use crate::models::ProxyEndpoint;

const DIRECT_KEY: &str = "direct";

/// Fully buffered response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Raw `Retry-After` header value, if present and readable
    pub fn retry_after(&self) -> Option<&str> {
        self.headers
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
    }
}

/// Capability contract of the HTTP layer
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// GET `url`, optionally through `proxy`; `None` means direct
    async fn get(&self, url: &str, proxy: Option<&ProxyEndpoint>) -> Result<HttpResponse>;

    /// New client sharing cookies but sending `headers` on every request
    fn clone_with_headers(&self, headers: HeaderMap) -> Arc<dyn HttpClient>;

    /// Current cookie jar, including cookies set by responses
    fn cookies(&self) -> HashMap<String, String>;
}

/// `reqwest` backed client with per-proxy connection pools
pub struct ReqwestClient {
    config: HttpClientConfig,
    headers: HeaderMap,
    cookies: Arc<RwLock<HashMap<String, String>>>,
    clients: DashMap<String, reqwest::Client>,
}

impl ReqwestClient {
    pub fn new(config: HttpClientConfig) -> Self {
        let cookies = parse_cookie_header(config.cookie.as_deref().unwrap_or_default());
        Self {
            config,
            headers: HeaderMap::new(),
            cookies: Arc::new(RwLock::new(cookies)),
            clients: DashMap::new(),
        }
    }

    /// Add or replace a cookie sent with every request
    pub fn set_cookie(&self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.write().insert(name.into(), value.into());
    }

    /// Number of distinct connection pools built so far
    pub fn pool_count(&self) -> usize {
        self.clients.len()
    }

    fn client_for(&self, proxy: Option<&ProxyEndpoint>) -> Result<reqwest::Client> {
        let key = proxy.map(|p| p.key()).unwrap_or(DIRECT_KEY);
        if let Some(client) = self.clients.get(key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .user_agent(self.config.user_agent.clone())
            .default_headers(self.headers.clone());

        builder = match proxy {
            Some(endpoint) => {
                let proxy = reqwest::Proxy::all(endpoint.url()?.as_str()).map_err(|e| {
                    CourierError::InvalidProxyAddress(format!(
                        "{}: {}",
                        endpoint.masked_key(),
                        e.without_url()
                    ))
                })?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };

        let client = builder.build()?;
        debug!(
            egress = proxy.map(|p| p.masked_key()).unwrap_or_else(|| DIRECT_KEY.to_string()),
            "Built HTTP connection pool"
        );
        self.clients.insert(key.to_string(), client.clone());
        Ok(client)
    }

    /// Remember cookies from `Set-Cookie` headers; an expired one is dropped
    fn capture_cookies(&self, headers: &HeaderMap) {
        let updates: Vec<(String, Option<String>)> = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect();
        if updates.is_empty() {
            return;
        }

        let mut cookies = self.cookies.write();
        for (name, value) in updates {
            match value {
                Some(value) => cookies.insert(name, value),
                None => cookies.remove(&name),
            };
        }
    }

    fn cookie_header(&self) -> Option<HeaderValue> {
        let cookies = self.cookies.read();
        if cookies.is_empty() {
            return None;
        }
        let mut pairs: Vec<String> = cookies.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        pairs.sort();
        HeaderValue::from_str(&pairs.join("; ")).ok()
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str, proxy: Option<&ProxyEndpoint>) -> Result<HttpResponse> {
        let client = self.client_for(proxy)?;
        let mut request = client.get(url);
        if let Some(cookie) = self.cookie_header() {
            request = request.header(COOKIE, cookie);
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        self.capture_cookies(&headers);
        let body = response.bytes().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn clone_with_headers(&self, headers: HeaderMap) -> Arc<dyn HttpClient> {
        let mut merged = self.headers.clone();
        for (name, value) in headers.iter() {
            merged.insert(name.clone(), value.clone());
        }

        Arc::new(ReqwestClient {
            config: self.config.clone(),
            headers: merged,
            cookies: Arc::clone(&self.cookies),
            clients: DashMap::new(),
        })
    }

    fn cookies(&self) -> HashMap<String, String> {
        self.cookies.read().clone()
    }
}

/// Split `a=1; b=2` into a map, skipping malformed pairs
pub fn parse_cookie_header(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Name and value of a `Set-Cookie` header; `None` value when it deletes
fn parse_set_cookie(raw: &str) -> Option<(String, Option<String>)> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let expired = parts.any(|attr| {
        let (key, age) = attr.split_once('=').unwrap_or((attr, ""));
        key.trim().eq_ignore_ascii_case("max-age")
            && age.trim().parse::<i64>().is_ok_and(|age| age <= 0)
    });
    let value = value.trim();
    if expired || value.is_empty() {
        return Some((name.to_string(), None));
    }
    Some((name.to_string(), Some(value.to_string())))
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted client for engine and resolver tests

    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    type Handler = dyn Fn(&str, Option<&ProxyEndpoint>) -> Result<HttpResponse> + Send + Sync;
    type DelayFn = dyn Fn(&str) -> Duration + Send + Sync;

    /// One recorded call: URL, the proxy key it went through and when
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct MockCall {
        pub url: String,
        pub proxy: Option<String>,
        pub at: tokio::time::Instant,
    }

    #[derive(Clone)]
    pub(crate) struct MockClient {
        handler: Arc<Handler>,
        delay: Option<Arc<DelayFn>>,
        calls: Arc<Mutex<Vec<MockCall>>>,
    }

    impl MockClient {
        pub(crate) fn new<F>(handler: F) -> Self
        where
            F: Fn(&str, Option<&ProxyEndpoint>) -> Result<HttpResponse> + Send + Sync + 'static,
        {
            Self {
                handler: Arc::new(handler),
                delay: None,
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Client answering every request with a `len`-byte 200
        pub(crate) fn always_ok(len: usize) -> Self {
            Self::new(move |_, _| Ok(ok_body(len)))
        }

        pub(crate) fn with_delay<F>(mut self, delay: F) -> Self
        where
            F: Fn(&str) -> Duration + Send + Sync + 'static,
        {
            self.delay = Some(Arc::new(delay));
            self
        }

        pub(crate) fn calls(&self) -> Vec<MockCall> {
            self.calls.lock().clone()
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        pub(crate) fn calls_for(&self, url: &str) -> usize {
            self.calls.lock().iter().filter(|c| c.url == url).count()
        }

        /// When `url` was first requested
        pub(crate) fn first_call_at(&self, url: &str) -> Option<tokio::time::Instant> {
            self.calls.lock().iter().find(|c| c.url == url).map(|c| c.at)
        }

        pub(crate) fn calls_via(&self, proxy_key: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.proxy.as_deref() == Some(proxy_key))
                .count()
        }
    }

    #[async_trait]
    impl HttpClient for MockClient {
        async fn get(&self, url: &str, proxy: Option<&ProxyEndpoint>) -> Result<HttpResponse> {
            self.calls.lock().push(MockCall {
                url: url.to_string(),
                proxy: proxy.map(|p| p.key().to_string()),
                at: tokio::time::Instant::now(),
            });
            if let Some(delay) = &self.delay {
                tokio::time::sleep(delay(url)).await;
            }
            (self.handler)(url, proxy)
        }

        fn clone_with_headers(&self, _headers: HeaderMap) -> Arc<dyn HttpClient> {
            Arc::new(self.clone())
        }

        fn cookies(&self) -> HashMap<String, String> {
            HashMap::new()
        }
    }

    pub(crate) fn ok_body(len: usize) -> HttpResponse {
        HttpResponse::new(StatusCode::OK, vec![0xAB_u8; len])
    }

    pub(crate) fn json_body(value: serde_json::Value) -> HttpResponse {
        HttpResponse::new(StatusCode::OK, value.to_string())
    }

    pub(crate) fn status(code: u16) -> HttpResponse {
        HttpResponse::new(
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Bytes::new(),
        )
    }

    pub(crate) fn status_with_retry_after(code: u16, retry_after: &str) -> HttpResponse {
        let mut response = status(code);
        if let Ok(value) = HeaderValue::from_str(retry_after) {
            response.headers.insert(RETRY_AFTER, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use std::time::Duration;

    fn config() -> HttpClientConfig {
        HttpClientConfig {
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
            user_agent: "courier-test".to_string(),
            cookie: Some("session=abc; theme=dark".to_string()),
        }
    }

    #[test]
    fn test_parse_cookie_header() {
        let cookies = parse_cookie_header("a=1; b = 2 ;broken; =x");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies.get("a").map(String::as_str), Some("1"));
        assert_eq!(cookies.get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_response_retry_after() {
        let response = status_with_retry_after(429, "12");
        assert_eq!(response.retry_after(), Some("12"));
        assert!(!response.is_success());
        assert!(ok_body(4).is_success());
    }

    #[test]
    fn test_cookies_shared_with_clones() {
        let client = ReqwestClient::new(config());
        let mut headers = HeaderMap::new();
        headers.insert("referer", HeaderValue::from_static("https://site.example/"));
        let clone = client.clone_with_headers(headers);

        client.set_cookie("token", "xyz");
        let cookies = clone.cookies();
        assert_eq!(cookies.get("session").map(String::as_str), Some("abc"));
        assert_eq!(cookies.get("token").map(String::as_str), Some("xyz"));
    }

    #[test]
    fn test_parse_set_cookie() {
        assert_eq!(
            parse_set_cookie("sid=42; Path=/; HttpOnly"),
            Some(("sid".to_string(), Some("42".to_string())))
        );
        assert_eq!(
            parse_set_cookie("sid=gone; Max-Age=0"),
            Some(("sid".to_string(), None))
        );
        assert_eq!(parse_set_cookie("sid=; Path=/"), Some(("sid".to_string(), None)));
        assert_eq!(parse_set_cookie("garbage"), None);
    }

    #[test]
    fn test_response_cookies_are_captured() {
        let client = ReqwestClient::new(config());
        let api = client.clone_with_headers(HeaderMap::new());

        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("cf_clearance=ok; Path=/"));
        headers.append(SET_COOKIE, HeaderValue::from_static("session=; Max-Age=0"));
        client.capture_cookies(&headers);

        let cookies = api.cookies();
        assert_eq!(cookies.get("cf_clearance").map(String::as_str), Some("ok"));
        assert!(!cookies.contains_key("session"));
        assert_eq!(cookies.get("theme").map(String::as_str), Some("dark"));
    }

    #[test]
    fn test_one_pool_per_egress() {
        let client = ReqwestClient::new(config());
        let a = ProxyEndpoint::parse("http://10.0.0.1:3128").unwrap();
        let b = ProxyEndpoint::parse("socks5://u:p@10.0.0.2:1080").unwrap();

        client.client_for(Some(&a)).unwrap();
        client.client_for(Some(&a)).unwrap();
        client.client_for(Some(&b)).unwrap();
        client.client_for(None).unwrap();

        assert_eq!(client.pool_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_records_calls() {
        let client = MockClient::always_ok(8);
        let proxy = ProxyEndpoint::parse("http://10.0.0.1:3128").unwrap();

        client.get("https://a.example/1", Some(&proxy)).await.unwrap();
        client.get("https://a.example/2", None).await.unwrap();

        assert_eq!(client.call_count(), 2);
        assert_eq!(client.calls_via("10.0.0.1:3128"), 1);
        assert_eq!(client.calls()[1].proxy, None);
    }
}
