//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the aggregator.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Schema version understood by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Root configuration for the aggregator.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Configuration document version.
    pub schema_version: u32,

    /// Inbound HTTP listener.
    pub listener: ListenerConfig,

    /// Backend server definitions.
    pub backends: Vec<BackendConfig>,

    /// Consistent hash ring settings.
    pub ring: RingConfig,

    /// Active health check settings.
    pub health_check: HealthCheckConfig,

    /// Circuit breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Per-backend connection pool settings.
    pub pool: PoolConfig,

    /// Response cache settings.
    pub cache: CacheConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// Hot reload settings.
    pub reload: ReloadConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            listener: ListenerConfig::default(),
            backends: Vec::new(),
            ring: RingConfig::default(),
            health_check: HealthCheckConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            timeouts: TimeoutConfig::default(),
            retries: RetryConfig::default(),
            reload: ReloadConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8640").
    pub bind_address: String,

    /// Maximum accepted request body in bytes.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8640".to_string(),
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Transport used to reach a backend.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawned subprocess speaking line-delimited JSON-RPC over stdio.
    #[serde(alias = "pipe")]
    Stdio,
    /// Plain HTTP request/response.
    Http,
    /// Server-sent events stream plus POST endpoint.
    Sse,
    /// WebSocket text frames.
    #[serde(alias = "ws")]
    Websocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
            TransportKind::Sse => "sse",
            TransportKind::Websocket => "websocket",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" | "pipe" => Ok(TransportKind::Stdio),
            "http" => Ok(TransportKind::Http),
            "sse" => Ok(TransportKind::Sse),
            "websocket" | "ws" => Ok(TransportKind::Websocket),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct BackendConfig {
    /// Unique backend identifier.
    pub id: String,

    /// Transport kind.
    pub transport: TransportKind,

    /// URL for network transports, executable for stdio.
    pub endpoint: String,

    /// Arguments passed to a stdio backend.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Extra environment for a stdio backend.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Weight on the hash ring (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Send `initialize` on every new connection.
    #[serde(default = "default_handshake")]
    pub handshake: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_handshake() -> bool {
    true
}

/// Consistent hash ring configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RingConfig {
    /// Virtual nodes per unit of backend weight.
    pub virtual_nodes: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self { virtual_nodes: 160 }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Probe interval in milliseconds.
    pub interval_ms: u64,

    /// Probe timeout in milliseconds.
    pub timeout_ms: u64,

    /// JSON-RPC method used as the probe.
    pub probe_method: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            timeout_ms: 3_000,
            probe_method: "ping".to_string(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (within the window) that open the circuit.
    pub failure_threshold: u32,

    /// Sliding window for the failure streak in milliseconds.
    pub failure_window_ms: u64,

    /// Time spent Open before a trial is admitted, in milliseconds.
    pub cooldown_ms: u64,

    /// Cooldown growth after a failed trial (1.0 disables growth).
    pub backoff_multiplier: f64,

    /// Upper bound on the grown cooldown, in milliseconds.
    pub max_cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 30_000,
            cooldown_ms: 10_000,
            backoff_multiplier: 2.0,
            max_cooldown_ms: 300_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }
}

/// Connection pool configuration (applied to every backend).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections kept warm per backend.
    pub min_idle: usize,

    /// Maximum connections per backend (idle + checked out).
    pub max_size: usize,

    /// Idle connections older than this are discarded, in seconds.
    pub idle_timeout_secs: u64,

    /// Maximum wait for a free connection, in milliseconds.
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 0,
            max_size: 8,
            idle_timeout_secs: 300,
            acquire_timeout_ms: 2_000,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Response cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Store successful responses.
    pub enabled: bool,

    /// Entry time-to-live in seconds.
    pub ttl_secs: u64,

    /// Memory budget of the exact-match tier in bytes.
    pub max_bytes: usize,

    /// Entry budget of the content-addressed tier.
    pub content_max_entries: usize,

    /// Content-tier hits before an entry is promoted to the exact tier.
    pub promote_after_hits: u32,

    /// Number of lock shards.
    pub shards: usize,

    /// Methods that are coalesced but never stored.
    pub bypass_methods: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 60,
            max_bytes: 16 * 1024 * 1024,
            content_max_entries: 4_096,
            promote_after_hits: 2,
            shards: 16,
            bypass_methods: vec!["ping".to_string()],
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment (spawn, TCP, handshake), in milliseconds.
    pub connect_ms: u64,

    /// Single forwarded call, in milliseconds.
    pub backend_call_ms: u64,

    /// Whole inbound request including retries, in milliseconds.
    pub request_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            backend_call_ms: 30_000,
            request_ms: 60_000,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn backend_call(&self) -> Duration {
        Duration::from_millis(self.backend_call_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per request, first one included.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
        }
    }
}

/// Hot reload configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReloadConfig {
    /// Watch the config file and reload on change.
    pub watch: bool,

    /// Upper bound on draining a superseded generation, in seconds.
    pub drain_grace_secs: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            watch: true,
            drain_grace_secs: 30,
        }
    }
}

impl ReloadConfig {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9464".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_document_uses_defaults() {
        let config: AggregatorConfig = toml::from_str(
            r#"
            [[backends]]
            id = "files"
            transport = "stdio"
            endpoint = "mcp-files"
            "#,
        )
        .unwrap();

        assert_eq!(config.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].weight, 1);
        assert!(config.backends[0].handshake);
        assert_eq!(config.ring.virtual_nodes, 160);
    }

    #[test]
    fn test_transport_aliases() {
        assert_eq!("pipe".parse::<TransportKind>().unwrap(), TransportKind::Stdio);
        assert_eq!("WS".parse::<TransportKind>().unwrap(), TransportKind::Websocket);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }
}
