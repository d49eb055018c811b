use crate::error::{CourierError, Result};
use crate::models::{ProxyCredentials, ProxyEndpoint, ProxyProtocol};
use crate::proxy::rotation::RotationStrategy;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Egress proxy pool
    pub proxy: ProxyPoolConfig,
    /// Worker, retry and health knobs
    pub fetch: FetchTuning,
    /// HTTP client configuration
    pub http: HttpClientConfig,
    /// Chapter resolution endpoints
    pub resolver: ResolverConfig,
    /// Logging configuration
    pub log: LogConfig,
    /// Directory payloads are written to by the binary
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ProxyPoolConfig {
    /// Use the pool at all; disabled means direct connections
    pub enabled: bool,
    pub rotation: RotationStrategy,
    pub entries: Vec<ProxyEntry>,
}

/// One proxy as written in a settings file
///
/// Entries missing `host` or `port` entirely are skipped when the pool is
/// built; entries with present but malformed values are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProxyEntry {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default, deserialize_with = "deserialize_port")]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyEntry {
    /// Build the endpoint; `Ok(None)` when host or port is absent
    pub fn to_endpoint(&self) -> Result<Option<ProxyEndpoint>> {
        let (Some(host), Some(port)) = (self.host.as_deref(), self.port) else {
            return Ok(None);
        };

        let protocol = match self.protocol.as_deref() {
            None => ProxyProtocol::default(),
            Some(raw) => ProxyProtocol::from_str(raw).ok_or_else(|| {
                CourierError::InvalidConfig(format!("unsupported proxy protocol: {}", raw))
            })?,
        };

        let credentials = self
            .login
            .as_ref()
            .filter(|login| !login.is_empty())
            .map(|login| ProxyCredentials {
                login: login.clone(),
                password: self.password.clone().unwrap_or_default(),
            });

        ProxyEndpoint::new(host, port, protocol, credentials)
            .map(Some)
            .map_err(|e| CourierError::InvalidConfig(e.to_string()))
    }
}

impl From<&ProxyEndpoint> for ProxyEntry {
    fn from(endpoint: &ProxyEndpoint) -> Self {
        Self {
            host: Some(endpoint.host().to_string()),
            port: Some(endpoint.port()),
            protocol: Some(endpoint.protocol().as_str().to_string()),
            login: endpoint.credentials().map(|c| c.login.clone()),
            password: endpoint.credentials().map(|c| c.password.clone()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    proxy: Option<ProxySection>,
}

#[derive(Debug, Deserialize)]
struct ProxySection {
    #[serde(default)]
    enable: bool,
    #[serde(default)]
    rotation: Option<String>,
    #[serde(default)]
    proxies: Vec<ProxyEntry>,
    /// Older files carry a single proxy inline
    #[serde(flatten)]
    legacy: ProxyEntry,
}

impl ProxyPoolConfig {
    /// Parse a settings document of the form
    /// `{"proxy": {"enable": true, "rotation": "round-robin", "proxies": [...]}}`
    pub fn from_settings_json(raw: &str) -> Result<Self> {
        let settings: SettingsFile = serde_json::from_str(raw)
            .map_err(|e| CourierError::InvalidConfig(format!("proxy settings: {}", e)))?;

        let Some(section) = settings.proxy else {
            return Ok(Self::default());
        };

        let entries = if section.legacy.host.is_some() {
            vec![section.legacy]
        } else {
            section.proxies
        };

        Ok(Self {
            enabled: section.enable,
            rotation: section
                .rotation
                .as_deref()
                .map(RotationStrategy::from_str)
                .unwrap_or_default(),
            entries,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CourierError::InvalidConfig(format!(
                "cannot read proxy settings {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_settings_json(&raw)
    }

    /// Pool from a comma-separated list of proxy URLs
    pub fn from_urls(raw: &str, rotation: RotationStrategy) -> Result<Self> {
        let entries = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                ProxyEndpoint::parse(s)
                    .map(|endpoint| ProxyEntry::from(&endpoint))
                    .map_err(|e| CourierError::InvalidConfig(format!("COURIER_PROXIES: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            enabled: !entries.is_empty(),
            rotation,
            entries,
        })
    }
}

/// Tuning knobs for the fetch engine
#[derive(Debug, Clone, PartialEq)]
pub struct FetchTuning {
    pub max_workers_per_proxy: usize,
    /// Hard ceiling on concurrent workers
    pub global_worker_cap: usize,
    /// Operator override of the computed worker count
    pub worker_override: Option<usize>,
    pub max_retries: u32,
    /// Pacing delay before each request, also the floor of the retry delay
    pub base_delay: Duration,
    /// First retry delay, doubled per attempt
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub backoff_factor: f64,
    pub jitter_min: f64,
    pub jitter_max: f64,
    pub max_retry_after: Duration,
    pub extra_attempts_for_429: u32,
    /// How long a 429 keeps the pool-wide pacing raised
    pub rate_limit_cooldown: Duration,
    pub rate_limit_multiplier: f64,
    pub failure_threshold: u32,
    pub failure_penalty: Duration,
    pub slow_hits_threshold: u32,
    pub slow_penalty: Duration,
    pub min_speed_bytes_per_sec: u64,
    pub min_duration_for_speed_check: Duration,
    pub min_size_for_speed_check: u64,
    pub speed_window: u32,
    pub warn_cooldown: Duration,
    pub chapter_retry_attempts: u32,
    pub chapter_retry_min_delay: Duration,
    pub chapter_retry_max_delay: Duration,
    pub chapter_retry_jitter_min: f64,
    pub chapter_retry_jitter_max: f64,
    /// Bounded wait for a per-proxy slot
    pub slot_timeout: Duration,
    pub sequential_attempts: u32,
    pub sequential_delay_multiplier: u32,
    /// Bodies shorter than this are treated as broken transfers
    pub min_payload_bytes: usize,
    pub progress_every: usize,
    pub progress_interval: Duration,
}

impl Default for FetchTuning {
    fn default() -> Self {
        Self {
            max_workers_per_proxy: 2,
            global_worker_cap: 10,
            worker_override: None,
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_min: 0.85,
            jitter_max: 1.25,
            max_retry_after: Duration::from_secs(120),
            extra_attempts_for_429: 2,
            rate_limit_cooldown: Duration::from_secs(30),
            rate_limit_multiplier: 3.0,
            failure_threshold: 2,
            failure_penalty: Duration::from_secs(60),
            slow_hits_threshold: 3,
            slow_penalty: Duration::from_secs(30),
            min_speed_bytes_per_sec: 512 * 1024,
            min_duration_for_speed_check: Duration::from_secs(1),
            min_size_for_speed_check: 256 * 1024,
            speed_window: 20,
            warn_cooldown: Duration::from_secs(30),
            chapter_retry_attempts: 3,
            chapter_retry_min_delay: Duration::from_secs(2),
            chapter_retry_max_delay: Duration::from_secs(45),
            chapter_retry_jitter_min: 0.85,
            chapter_retry_jitter_max: 1.25,
            slot_timeout: Duration::from_secs(5),
            sequential_attempts: 2,
            sequential_delay_multiplier: 5,
            min_payload_bytes: 1000,
            progress_every: 10,
            progress_interval: Duration::from_secs(5),
        }
    }
}

impl FetchTuning {
    /// Reject combinations the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if !(self.backoff_factor.is_finite() && self.backoff_factor >= 1.0) {
            return Err(CourierError::InvalidConfig(
                "backoff factor must be a finite number >= 1".into(),
            ));
        }
        for (name, min, max) in [
            ("jitter", self.jitter_min, self.jitter_max),
            (
                "chapter jitter",
                self.chapter_retry_jitter_min,
                self.chapter_retry_jitter_max,
            ),
        ] {
            if !(min.is_finite() && max.is_finite() && min > 0.0 && min <= max) {
                return Err(CourierError::InvalidConfig(format!(
                    "{} bounds must satisfy 0 < min <= max",
                    name
                )));
            }
        }
        if self.chapter_retry_min_delay > self.chapter_retry_max_delay {
            return Err(CourierError::InvalidConfig(
                "chapter retry min delay exceeds max delay".into(),
            ));
        }
        if !(self.rate_limit_multiplier.is_finite() && self.rate_limit_multiplier >= 1.0) {
            return Err(CourierError::InvalidConfig(
                "rate limit multiplier must be >= 1".into(),
            ));
        }
        if self.global_worker_cap == 0 {
            return Err(CourierError::InvalidConfig(
                "global worker cap must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Raw `Cookie` header value sent with every request
    pub cookie: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            user_agent: format!("courier/{}", env!("CARGO_PKG_VERSION")),
            cookie: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// API root; chapters live under `{api_base}/manga/{slug}/chapter`
    pub api_base: String,
    /// Known image mirrors; empty means discover them from the API
    pub image_servers: Vec<String>,
    /// Mirror id preferred during discovery
    pub preferred_server: String,
    /// `Site-Id` header value expected by the API
    pub site_id: Option<String>,
    pub referer: Option<String>,
    /// API token, sent as `Authorization: Bearer ...`
    pub token: Option<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.cdnlibs.org/api".to_string(),
            image_servers: Vec::new(),
            preferred_server: "main".to_string(),
            site_id: Some("1".to_string()),
            referer: None,
            token: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyPoolConfig::default(),
            fetch: FetchTuning::default(),
            http: HttpClientConfig::default(),
            resolver: ResolverConfig::default(),
            log: LogConfig::default(),
            output_dir: PathBuf::from("downloads"),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = FetchTuning::default();
        let fetch = FetchTuning {
            max_workers_per_proxy: parse_env(
                "COURIER_MAX_WORKERS_PER_PROXY",
                defaults.max_workers_per_proxy,
            )?,
            global_worker_cap: parse_env("COURIER_GLOBAL_WORKER_CAP", defaults.global_worker_cap)?,
            worker_override: parse_optional_env("COURIER_WORKERS")?,
            max_retries: parse_env("COURIER_MAX_RETRIES", defaults.max_retries)?,
            base_delay: env_millis("COURIER_BASE_DELAY_MS", defaults.base_delay)?,
            retry_delay: env_millis("COURIER_RETRY_DELAY_MS", defaults.retry_delay)?,
            max_retry_delay: env_millis("COURIER_MAX_RETRY_DELAY_MS", defaults.max_retry_delay)?,
            backoff_factor: parse_env("COURIER_BACKOFF_FACTOR", defaults.backoff_factor)?,
            jitter_min: parse_env("COURIER_JITTER_MIN", defaults.jitter_min)?,
            jitter_max: parse_env("COURIER_JITTER_MAX", defaults.jitter_max)?,
            max_retry_after: env_secs("COURIER_MAX_RETRY_AFTER_SECS", defaults.max_retry_after)?,
            extra_attempts_for_429: parse_env(
                "COURIER_EXTRA_ATTEMPTS_FOR_429",
                defaults.extra_attempts_for_429,
            )?,
            rate_limit_cooldown: env_secs(
                "COURIER_RATE_LIMIT_COOLDOWN_SECS",
                defaults.rate_limit_cooldown,
            )?,
            rate_limit_multiplier: parse_env(
                "COURIER_RATE_LIMIT_MULTIPLIER",
                defaults.rate_limit_multiplier,
            )?,
            failure_threshold: parse_env("COURIER_FAILURE_THRESHOLD", defaults.failure_threshold)?,
            failure_penalty: env_secs("COURIER_FAILURE_PENALTY_SECS", defaults.failure_penalty)?,
            slow_hits_threshold: parse_env(
                "COURIER_SLOW_HITS_THRESHOLD",
                defaults.slow_hits_threshold,
            )?,
            slow_penalty: env_secs("COURIER_SLOW_PENALTY_SECS", defaults.slow_penalty)?,
            min_speed_bytes_per_sec: parse_env(
                "COURIER_MIN_SPEED_BYTES_PER_SEC",
                defaults.min_speed_bytes_per_sec,
            )?,
            min_duration_for_speed_check: env_millis(
                "COURIER_MIN_DURATION_FOR_SPEED_CHECK_MS",
                defaults.min_duration_for_speed_check,
            )?,
            min_size_for_speed_check: parse_env(
                "COURIER_MIN_SIZE_FOR_SPEED_CHECK",
                defaults.min_size_for_speed_check,
            )?,
            speed_window: parse_env("COURIER_SPEED_WINDOW", defaults.speed_window)?,
            warn_cooldown: env_secs("COURIER_WARN_COOLDOWN_SECS", defaults.warn_cooldown)?,
            chapter_retry_attempts: parse_env(
                "COURIER_CHAPTER_RETRY_ATTEMPTS",
                defaults.chapter_retry_attempts,
            )?,
            chapter_retry_min_delay: env_millis(
                "COURIER_CHAPTER_RETRY_MIN_DELAY_MS",
                defaults.chapter_retry_min_delay,
            )?,
            chapter_retry_max_delay: env_millis(
                "COURIER_CHAPTER_RETRY_MAX_DELAY_MS",
                defaults.chapter_retry_max_delay,
            )?,
            chapter_retry_jitter_min: parse_env(
                "COURIER_CHAPTER_RETRY_JITTER_MIN",
                defaults.chapter_retry_jitter_min,
            )?,
            chapter_retry_jitter_max: parse_env(
                "COURIER_CHAPTER_RETRY_JITTER_MAX",
                defaults.chapter_retry_jitter_max,
            )?,
            slot_timeout: env_millis("COURIER_SLOT_TIMEOUT_MS", defaults.slot_timeout)?,
            sequential_attempts: parse_env(
                "COURIER_SEQUENTIAL_ATTEMPTS",
                defaults.sequential_attempts,
            )?,
            sequential_delay_multiplier: parse_env(
                "COURIER_SEQUENTIAL_DELAY_MULTIPLIER",
                defaults.sequential_delay_multiplier,
            )?,
            min_payload_bytes: parse_env("COURIER_MIN_PAYLOAD_BYTES", defaults.min_payload_bytes)?,
            progress_every: parse_env("COURIER_PROGRESS_EVERY", defaults.progress_every)?,
            progress_interval: env_secs(
                "COURIER_PROGRESS_INTERVAL_SECS",
                defaults.progress_interval,
            )?,
        };
        fetch.validate()?;

        let http_defaults = HttpClientConfig::default();
        let resolver_defaults = ResolverConfig::default();

        Ok(Config {
            proxy: parse_proxy_pool()?,
            fetch,
            http: HttpClientConfig {
                connect_timeout: env_secs(
                    "COURIER_CONNECT_TIMEOUT_SECS",
                    http_defaults.connect_timeout,
                )?,
                request_timeout: env_secs(
                    "COURIER_REQUEST_TIMEOUT_SECS",
                    http_defaults.request_timeout,
                )?,
                user_agent: get_env_or("COURIER_USER_AGENT", &http_defaults.user_agent),
                cookie: non_empty_env("COURIER_COOKIE"),
            },
            resolver: ResolverConfig {
                api_base: get_env_or("COURIER_API_BASE", &resolver_defaults.api_base),
                image_servers: match non_empty_env("COURIER_IMAGE_SERVERS") {
                    Some(raw) => split_list(&raw),
                    None => resolver_defaults.image_servers,
                },
                preferred_server: get_env_or(
                    "COURIER_PREFERRED_SERVER",
                    &resolver_defaults.preferred_server,
                ),
                site_id: non_empty_env("COURIER_SITE_ID").or(resolver_defaults.site_id),
                referer: non_empty_env("COURIER_REFERER"),
                token: non_empty_env("COURIER_API_TOKEN"),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
            output_dir: PathBuf::from(get_env_or("COURIER_OUTPUT_DIR", "downloads")),
        })
    }
}

fn parse_proxy_pool() -> Result<ProxyPoolConfig> {
    if let Some(path) = non_empty_env("COURIER_PROXY_FILE") {
        return ProxyPoolConfig::from_file(Path::new(&path));
    }

    let rotation = RotationStrategy::from_str(&get_env_or("COURIER_ROTATION", "round-robin"));
    let mut pool = match non_empty_env("COURIER_PROXIES") {
        Some(raw) => ProxyPoolConfig::from_urls(&raw, rotation)?,
        None => ProxyPoolConfig {
            rotation,
            ..Default::default()
        },
    };

    if let Some(enabled) = parse_optional_env::<bool>("COURIER_PROXY_ENABLED")? {
        pool.enabled = enabled;
    }
    Ok(pool)
}

fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid port: {}", n))),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<u16>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("invalid port: {}", s))),
        Some(other) => Err(D::Error::custom(format!("invalid port: {}", other))),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    Ok(parse_optional_env(key)?.unwrap_or(default))
}

fn parse_optional_env<T: FromStr>(key: &str) -> Result<Option<T>> {
    match non_empty_env(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| CourierError::InvalidConfig(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(None),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    parse_env(key, default.as_millis() as u64).map(Duration::from_millis)
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    parse_env(key, default.as_secs()).map(Duration::from_secs)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
