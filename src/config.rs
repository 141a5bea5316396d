//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `RECEPTOR_CONTROLLER_*`, see [`Config::apply_env`]
//! 2. **Config file**: path via `--config <path>`, or `receptor-gateway.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! ws_listen = "0.0.0.0:8080"
//! mgmt_listen = "0.0.0.0:9090"
//! monitoring_listen = "0.0.0.0:10000"
//! job_receiver_listen = "0.0.0.0:8081"
//! http_shutdown_timeout_secs = 5
//!
//! [websocket]
//! node_id = "node-cloud-receptor-controller"
//! handshake_read_wait_secs = 5
//! write_wait_secs = 5
//! pong_wait_secs = 25
//! max_message_size = 1048576
//! send_message_timeout_secs = 10
//!
//! [auth.service_to_service_credentials]
//! job-receiver = "shared-psk"
//!
//! [kafka]
//! brokers = ["kafka:29092"]
//! responses_topic = "platform.receptor-controller.responses"
//!
//! [redis]
//! host = "localhost"
//! port = 6379
//!
//! [gateway]
//! registrar_impl = "redis"                  # or "local" to skip Redis entirely
//! cluster_service_name = "receptor-gateway-internal"
//! active_registrar_poll_min_delay_ms = 10000
//! active_registrar_poll_max_delay_ms = 20000
//!
//! [proxy]
//! port = 9090
//! client_id = "job-receiver"
//! psk = "shared-psk"
//!
//! [logging]
//! level = "info"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Prefix for every environment override.
pub const ENV_PREFIX: &str = "RECEPTOR_CONTROLLER";

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "receptor-gateway.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Read { path: String, message: String },
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid value for {var}: {message}")]
    InvalidEnv { var: String, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener addresses and HTTP lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Agent-facing WebSocket listener (default `0.0.0.0:8080`).
    #[serde(default = "default_ws_listen")]
    pub ws_listen: String,
    /// Management + job API listener of the gateway (default `0.0.0.0:9090`).
    #[serde(default = "default_mgmt_listen")]
    pub mgmt_listen: String,
    /// `/metrics`, `/liveness`, `/readiness` (default `0.0.0.0:10000`).
    #[serde(default = "default_monitoring_listen")]
    pub monitoring_listen: String,
    /// Listener of the standalone `job_receiver` (default `0.0.0.0:8081`).
    #[serde(default = "default_job_receiver_listen")]
    pub job_receiver_listen: String,
    /// Grace period for draining connections on shutdown (default 5).
    #[serde(default = "default_http_shutdown_timeout")]
    pub http_shutdown_timeout_secs: u64,
    /// File served at `GET /openapi.json`.
    #[serde(default = "default_openapi_spec_file")]
    pub openapi_spec_file: String,
}

/// Per-connection timing and buffering.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Node id this gateway presents in `HI` and as payload sender.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Max seconds to receive the peer's `HI` (default 5).
    #[serde(default = "default_handshake_read_wait")]
    pub handshake_read_wait_secs: u64,
    /// Per-write deadline in seconds (default 5).
    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,
    /// Read deadline in seconds, extended on every pong (default 25).
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,
    /// Ping cadence in milliseconds. Derived as 0.9 x pong wait when unset.
    #[serde(default)]
    pub ping_period_ms: Option<u64>,
    /// Largest inbound WebSocket message (default 1 MiB).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Depth of the send, recv and control channels (default 256).
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
    /// Max seconds to enqueue work onto a session (default 10).
    #[serde(default = "default_send_message_timeout")]
    pub send_message_timeout_secs: u64,
}

/// Service-to-service authentication.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// `client-id -> psk`. Override with
    /// `RECEPTOR_CONTROLLER_SERVICE_TO_SERVICE_CREDENTIALS=id:psk,id2:psk2`.
    #[serde(default)]
    pub service_to_service_credentials: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_kafka_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_responses_topic")]
    pub responses_topic: String,
    /// Start offset for consumers: -1 latest, -2 earliest, otherwise absolute.
    #[serde(default = "default_consumer_offset")]
    pub consumer_offset: i64,
    #[serde(default = "default_batch_size")]
    pub responses_batch_size: usize,
    #[serde(default = "default_batch_bytes")]
    pub responses_batch_bytes: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub responses_batch_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
}

/// Which registrar a gateway runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrarImpl {
    /// Local registry plus the Redis-backed global registry.
    Redis,
    /// Local registry only.
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_registrar_impl")]
    pub registrar_impl: RegistrarImpl,
    /// Headless service whose `A` records list the live replicas.
    #[serde(default = "default_cluster_service_name")]
    pub cluster_service_name: String,
    #[serde(default = "default_poll_min_delay")]
    pub active_registrar_poll_min_delay_ms: u64,
    #[serde(default = "default_poll_max_delay")]
    pub active_registrar_poll_max_delay_ms: u64,
    /// Name recorded in Redis for this replica. Defaults to the replica's IP.
    #[serde(default)]
    pub hostname: Option<String>,
}

/// How this replica reaches peers that own a connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_scheme")]
    pub scheme: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default = "default_proxy_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub psk: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_ws_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_mgmt_listen() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_monitoring_listen() -> String {
    "0.0.0.0:10000".to_string()
}
fn default_job_receiver_listen() -> String {
    "0.0.0.0:8081".to_string()
}
fn default_http_shutdown_timeout() -> u64 {
    5
}
fn default_openapi_spec_file() -> String {
    "/opt/app-root/src/api/api.spec.json".to_string()
}
fn default_node_id() -> String {
    "node-cloud-receptor-controller".to_string()
}
fn default_handshake_read_wait() -> u64 {
    5
}
fn default_write_wait() -> u64 {
    5
}
fn default_pong_wait() -> u64 {
    25
}
fn default_max_message_size() -> usize {
    1024 * 1024
}
fn default_channel_buffer_size() -> usize {
    256
}
fn default_send_message_timeout() -> u64 {
    10
}
fn default_kafka_brokers() -> Vec<String> {
    vec!["kafka:29092".to_string()]
}
fn default_responses_topic() -> String {
    "platform.receptor-controller.responses".to_string()
}
fn default_consumer_offset() -> i64 {
    -1
}
fn default_batch_size() -> usize {
    100
}
fn default_batch_bytes() -> usize {
    1024 * 1024
}
fn default_batch_timeout_ms() -> u64 {
    100
}
fn default_redis_host() -> String {
    "localhost".to_string()
}
fn default_redis_port() -> u16 {
    6379
}
fn default_registrar_impl() -> RegistrarImpl {
    RegistrarImpl::Redis
}
fn default_cluster_service_name() -> String {
    "receptor-gateway-internal".to_string()
}
fn default_poll_min_delay() -> u64 {
    10_000
}
fn default_poll_max_delay() -> u64 {
    20_000
}
fn default_proxy_scheme() -> String {
    "http".to_string()
}
fn default_proxy_port() -> u16 {
    9090
}
fn default_proxy_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_listen: default_ws_listen(),
            mgmt_listen: default_mgmt_listen(),
            monitoring_listen: default_monitoring_listen(),
            job_receiver_listen: default_job_receiver_listen(),
            http_shutdown_timeout_secs: default_http_shutdown_timeout(),
            openapi_spec_file: default_openapi_spec_file(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            handshake_read_wait_secs: default_handshake_read_wait(),
            write_wait_secs: default_write_wait(),
            pong_wait_secs: default_pong_wait(),
            ping_period_ms: None,
            max_message_size: default_max_message_size(),
            channel_buffer_size: default_channel_buffer_size(),
            send_message_timeout_secs: default_send_message_timeout(),
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_kafka_brokers(),
            responses_topic: default_responses_topic(),
            consumer_offset: default_consumer_offset(),
            responses_batch_size: default_batch_size(),
            responses_batch_bytes: default_batch_bytes(),
            responses_batch_timeout_ms: default_batch_timeout_ms(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            registrar_impl: default_registrar_impl(),
            cluster_service_name: default_cluster_service_name(),
            active_registrar_poll_min_delay_ms: default_poll_min_delay(),
            active_registrar_poll_max_delay_ms: default_poll_max_delay(),
            hostname: None,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            scheme: default_proxy_scheme(),
            port: default_proxy_port(),
            timeout_secs: default_proxy_timeout(),
            client_id: String::new(),
            psk: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl WebSocketConfig {
    pub fn handshake_read_wait(&self) -> Duration {
        Duration::from_secs(self.handshake_read_wait_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Explicit ping period, else 9/10 of the pong wait.
    pub fn ping_period(&self) -> Duration {
        match self.ping_period_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.pong_wait() * 9 / 10,
        }
    }

    pub fn send_message_timeout(&self) -> Duration {
        Duration::from_secs(self.send_message_timeout_secs)
    }
}

impl GatewayConfig {
    pub fn poll_delay_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.active_registrar_poll_min_delay_ms),
            Duration::from_millis(self.active_registrar_poll_max_delay_ms),
        )
    }
}

impl RedisConfig {
    /// `redis://[:password@]host:port/db`
    pub fn url(&self) -> String {
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(pw) => format!("redis://:{pw}@{}:{}/{}", self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise looks for
    /// `receptor-gateway.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = if let Some(p) = path {
            Self::from_file(p)?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(DEFAULT_CONFIG_FILE)?
        } else {
            Config::default()
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    /// Apply `RECEPTOR_CONTROLLER_*` overrides read through `lookup`.
    ///
    /// Durations take the unit of the field they set: `*_PING_PERIOD`,
    /// `*_BATCH_TIMEOUT` and `*_POLL_*_DELAY` are milliseconds, the rest
    /// are seconds.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(&format!("{ENV_PREFIX}_{key}"));

        if let Some(v) = get("WS_LISTEN") {
            self.server.ws_listen = v;
        }
        if let Some(v) = get("MGMT_LISTEN") {
            self.server.mgmt_listen = v;
        }
        if let Some(v) = get("MONITORING_LISTEN") {
            self.server.monitoring_listen = v;
        }
        if let Some(v) = get("JOB_RECEIVER_LISTEN") {
            self.server.job_receiver_listen = v;
        }
        if let Some(v) = get("NODE_ID") {
            self.websocket.node_id = v;
        }
        if let Some(v) = get("HANDSHAKE_READ_WAIT") {
            self.websocket.handshake_read_wait_secs = parse_env("HANDSHAKE_READ_WAIT", &v)?;
        }
        if let Some(v) = get("WRITE_WAIT") {
            self.websocket.write_wait_secs = parse_env("WRITE_WAIT", &v)?;
        }
        if let Some(v) = get("PONG_WAIT") {
            self.websocket.pong_wait_secs = parse_env("PONG_WAIT", &v)?;
        }
        if let Some(v) = get("WEBSOCKET_PING_PERIOD") {
            self.websocket.ping_period_ms = Some(parse_env("WEBSOCKET_PING_PERIOD", &v)?);
        }
        if let Some(v) = get("CHANNEL_BUFFER_SIZE") {
            self.websocket.channel_buffer_size = parse_env("CHANNEL_BUFFER_SIZE", &v)?;
        }
        if let Some(v) = get("MAX_MESSAGE_SIZE") {
            self.websocket.max_message_size = parse_env("MAX_MESSAGE_SIZE", &v)?;
        }
        if let Some(v) = get("SEND_MESSAGE_TIMEOUT") {
            self.websocket.send_message_timeout_secs = parse_env("SEND_MESSAGE_TIMEOUT", &v)?;
        }
        if let Some(v) = get("SERVICE_TO_SERVICE_CREDENTIALS") {
            self.auth.service_to_service_credentials = parse_credentials(&v)?;
        }
        if let Some(v) = get("KAFKA_BROKERS") {
            self.kafka.brokers = v.split(',').map(|b| b.trim().to_string()).collect();
        }
        if let Some(v) = get("KAFKA_RESPONSES_TOPIC") {
            self.kafka.responses_topic = v;
        }
        if let Some(v) = get("KAFKA_CONSUMER_OFFSET") {
            self.kafka.consumer_offset = parse_env("KAFKA_CONSUMER_OFFSET", &v)?;
        }
        if let Some(v) = get("KAFKA_RESPONSES_BATCH_SIZE") {
            self.kafka.responses_batch_size = parse_env("KAFKA_RESPONSES_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("KAFKA_RESPONSES_BATCH_BYTES") {
            self.kafka.responses_batch_bytes = parse_env("KAFKA_RESPONSES_BATCH_BYTES", &v)?;
        }
        if let Some(v) = get("KAFKA_RESPONSES_BATCH_TIMEOUT") {
            self.kafka.responses_batch_timeout_ms = parse_env("KAFKA_RESPONSES_BATCH_TIMEOUT", &v)?;
        }
        if let Some(v) = get("REDIS_HOST") {
            self.redis.host = v;
        }
        if let Some(v) = get("REDIS_PORT") {
            self.redis.port = parse_env("REDIS_PORT", &v)?;
        }
        if let Some(v) = get("REDIS_PASSWORD") {
            self.redis.password = Some(v);
        }
        if let Some(v) = get("REDIS_DB") {
            self.redis.db = parse_env("REDIS_DB", &v)?;
        }
        if let Some(v) = get("GATEWAY_CONNECTION_REGISTRAR_IMPL") {
            self.gateway.registrar_impl = match v.to_lowercase().as_str() {
                "redis" => RegistrarImpl::Redis,
                "local" => RegistrarImpl::Local,
                other => {
                    return Err(ConfigError::InvalidEnv {
                        var: format!("{ENV_PREFIX}_GATEWAY_CONNECTION_REGISTRAR_IMPL"),
                        message: format!("unknown registrar {other:?}"),
                    })
                }
            };
        }
        if let Some(v) = get("GATEWAY_CLUSTER_SERVICE_NAME") {
            self.gateway.cluster_service_name = v;
        }
        if let Some(v) = get("GATEWAY_ACTIVE_REGISTRAR_POLL_MIN_DELAY") {
            self.gateway.active_registrar_poll_min_delay_ms =
                parse_env("GATEWAY_ACTIVE_REGISTRAR_POLL_MIN_DELAY", &v)?;
        }
        if let Some(v) = get("GATEWAY_ACTIVE_REGISTRAR_POLL_MAX_DELAY") {
            self.gateway.active_registrar_poll_max_delay_ms =
                parse_env("GATEWAY_ACTIVE_REGISTRAR_POLL_MAX_DELAY", &v)?;
        }
        if let Some(v) = get("GATEWAY_HOSTNAME") {
            self.gateway.hostname = Some(v);
        }
        if let Some(v) = get("PROXY_SCHEME") {
            self.proxy.scheme = v;
        }
        if let Some(v) = get("PROXY_TIMEOUT") {
            self.proxy.timeout_secs = parse_env("PROXY_TIMEOUT", &v)?;
        }
        if let Some(v) = get("PROXY_PORT") {
            self.proxy.port = parse_env("PROXY_PORT", &v)?;
        }
        if let Some(v) = get("PROXY_CLIENT_ID") {
            self.proxy.client_id = v;
        }
        if let Some(v) = get("PROXY_PSK") {
            self.proxy.psk = v;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.websocket.ping_period() >= self.websocket.pong_wait() {
            return Err(ConfigError::Invalid(
                "websocket ping period must be shorter than the pong wait".to_string(),
            ));
        }
        let (min, max) = self.gateway.poll_delay_bounds();
        if min > max {
            return Err(ConfigError::Invalid(
                "active registrar poll min delay exceeds max delay".to_string(),
            ));
        }
        if self.websocket.channel_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "channel buffer size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        var: format!("{ENV_PREFIX}_{key}"),
        message: e.to_string(),
    })
}

/// `id:psk,id2:psk2` into a map.
fn parse_credentials(value: &str) -> Result<HashMap<String, String>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once(':')
                .map(|(id, psk)| (id.trim().to_string(), psk.trim().to_string()))
                .ok_or_else(|| ConfigError::InvalidEnv {
                    var: format!("{ENV_PREFIX}_SERVICE_TO_SERVICE_CREDENTIALS"),
                    message: format!("expected client-id:psk, got {pair:?}"),
                })
        })
        .collect()
}
