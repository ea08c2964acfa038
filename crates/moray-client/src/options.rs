//! Client configuration.
//!
//! A client is configured either with a [`PoolConfig`] directly, or with the
//! flat [`LegacyOptions`] that older callers use (`host`/`port`/`url`,
//! `connectTimeout`, `retry`, `dns`, `maxConnections`). The legacy form is
//! translated into a `PoolConfig` by [`translate_legacy_options`].

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

use moray_common::{MorayError, Result};

use crate::recovery::{RecoveryPolicy, RecoverySet, UNBOUNDED_MS};

/// Default constants used when building pool configuration.
///
/// These are passed explicitly to the translator rather than read from
/// globals, so tests and embedders can substitute their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub port: u16,
    pub spares: usize,
    pub max_dns_concurrency: usize,
    pub max_connections: usize,
    pub connect_retries: u32,
    pub connect_timeout_ms: u64,
    pub dns_timeout_ms: u64,
    pub dns_delay_min_ms: u64,
    pub dns_delay_max_ms: u64,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    /// Completed request ids remembered per connection
    pub recent_requests: usize,
    pub refresh_interval_ms: u64,
}

impl Defaults {
    pub const HISTORICAL: Defaults = Defaults {
        port: 2020,
        spares: 4,
        max_dns_concurrency: 3,
        max_connections: 10,
        connect_retries: 5,
        connect_timeout_ms: 2000,
        dns_timeout_ms: 1000,
        dns_delay_min_ms: 10,
        dns_delay_max_ms: 10000,
        delay_min_ms: 1000,
        delay_max_ms: UNBOUNDED_MS,
        recent_requests: 100,
        refresh_interval_ms: 60_000,
    };
}

impl Default for Defaults {
    fn default() -> Self {
        Self::HISTORICAL
    }
}

/// Structured pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// DNS domain or IP literal of the service
    pub domain: String,
    pub default_port: u16,
    /// Resolver addresses; empty means the system configuration
    #[serde(default)]
    pub resolvers: Vec<String>,
    /// Idle connections kept ready beyond those currently claimed
    pub spares: usize,
    /// Upper bound on live connections across all backends
    pub maximum: usize,
    #[serde(rename = "maxDNSConcurrency")]
    pub max_dns_concurrency: usize,
    pub recovery: RecoverySet,
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

fn default_refresh_interval_ms() -> u64 {
    Defaults::HISTORICAL.refresh_interval_ms
}

impl PoolConfig {
    /// Builds a configuration for `domain` using `defaults` everywhere else.
    ///
    /// Connection attempts follow the default retry policy.
    pub fn new(domain: impl Into<String>, port: u16, defaults: &Defaults) -> Result<Self> {
        let dns = dns_policy(defaults, defaults.dns_timeout_ms)?;
        let default = RecoveryPolicy::new(
            defaults.connect_retries,
            defaults.delay_min_ms,
            defaults.delay_max_ms,
            defaults.connect_timeout_ms,
            defaults.connect_timeout_ms,
        )?;

        Ok(Self {
            domain: domain.into(),
            default_port: port,
            resolvers: Vec::new(),
            spares: defaults.spares,
            maximum: defaults.max_connections,
            max_dns_concurrency: defaults.max_dns_concurrency,
            recovery: RecoverySet {
                dns_srv: dns.without_retries(),
                dns,
                default,
            },
            refresh_interval_ms: defaults.refresh_interval_ms,
        })
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(MorayError::InvalidOptions("domain must not be empty".into()));
        }
        if self.maximum == 0 {
            return Err(MorayError::InvalidOptions(
                "maximum connections must be positive".into(),
            ));
        }
        if self.max_dns_concurrency == 0 {
            return Err(MorayError::InvalidOptions(
                "maxDNSConcurrency must be positive".into(),
            ));
        }
        for resolver in &self.resolvers {
            resolver.parse::<IpAddr>().map_err(|_| {
                MorayError::InvalidOptions(format!("resolver {:?} is not an IP address", resolver))
            })?;
        }
        Ok(())
    }
}

/// A port given either as a number or as numeric text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u64),
    Text(String),
}

impl PortValue {
    fn parse(&self) -> Result<u16> {
        let parsed = match self {
            PortValue::Number(n) => u16::try_from(*n).ok(),
            PortValue::Text(s) => s.trim().parse::<u16>().ok(),
        };
        parsed.ok_or_else(|| {
            MorayError::InvalidOptions(format!("port must be a number between 0 and 65535: {:?}", self))
        })
    }
}

impl From<u16> for PortValue {
    fn from(port: u16) -> Self {
        PortValue::Number(port.into())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsOptions {
    pub resolvers: Option<Vec<String>>,
    /// Per-lookup timeout in milliseconds; zero keeps the default
    pub timeout: Option<u64>,
    /// Accepted for compatibility; unused
    pub check_interval: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOptions {
    pub retries: Option<u32>,
    /// Initial delay between connection attempts (ms)
    pub min_timeout: Option<u64>,
    /// Upper bound on the delay between connection attempts (ms)
    pub max_timeout: Option<u64>,
}

/// Policy applied when legacy options carry no `retry` object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MissingRetry {
    /// Connection attempts are never retried
    #[default]
    NoRetries,
    /// Connection attempts use the default retry count and delays
    DefaultRetries,
}

/// The flat option set accepted by older callers.
///
/// # Example
///
/// ```
/// use moray_client::{translate_legacy_options, Defaults, LegacyOptions};
///
/// let options: LegacyOptions = serde_json::from_str(
///     r#"{"url": "tcp://moray.example.com:2222", "connectTimeout": 500}"#,
/// ).unwrap();
/// let config = translate_legacy_options(&options, &Defaults::HISTORICAL).unwrap();
/// assert_eq!(config.domain, "moray.example.com");
/// assert_eq!(config.default_port, 2222);
/// assert_eq!(config.recovery.default.timeout_ms(), 500);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyOptions {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<PortValue>,
    pub connect_timeout: Option<u64>,
    pub max_connections: Option<usize>,
    pub dns: Option<DnsOptions>,
    pub retry: Option<RetryOptions>,
    #[serde(default)]
    pub missing_retry: MissingRetry,
    /// Structured pool configuration; exclusive with every other field
    #[serde(alias = "cueballOptions")]
    pub pool_config: Option<PoolConfig>,
}

impl LegacyOptions {
    pub fn with_host(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port.into()),
            ..Self::default()
        }
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    fn has_connection_fields(&self) -> bool {
        self.url.is_some()
            || self.host.is_some()
            || self.port.is_some()
            || self.connect_timeout.is_some()
            || self.max_connections.is_some()
            || self.dns.is_some()
            || self.retry.is_some()
    }
}

fn dns_policy(defaults: &Defaults, timeout_ms: u64) -> Result<RecoveryPolicy> {
    RecoveryPolicy::new(
        defaults.connect_retries,
        defaults.dns_delay_min_ms,
        defaults.dns_delay_max_ms,
        timeout_ms,
        timeout_ms,
    )
}

/// Resolves `(host, port)` from `host`/`port`/`url`.
///
/// `host` takes precedence over `url`. With a URL, the port comes from the
/// explicit `port` option, then the URL, then the default port. With a bare
/// host, the port must be given.
fn resolve_endpoint(options: &LegacyOptions, defaults: &Defaults) -> Result<(String, u16)> {
    if let (None, Some(raw)) = (&options.host, &options.url) {
        let parsed = url::Url::parse(raw)
            .map_err(|e| MorayError::InvalidOptions(format!("invalid url {:?}: {}", raw, e)))?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| MorayError::InvalidOptions(format!("url {:?} has no host", raw)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

        let port = match &options.port {
            Some(port) => port.parse()?,
            None => parsed.port().unwrap_or(defaults.port),
        };
        return Ok((host, port));
    }

    let host = options
        .host
        .clone()
        .ok_or_else(|| MorayError::InvalidOptions("options.host (string) is required".into()))?;
    let port = options
        .port
        .as_ref()
        .ok_or_else(|| MorayError::InvalidOptions("options.port (number) is required".into()))?
        .parse()?;
    Ok((host, port))
}

/// Translates legacy options into a [`PoolConfig`].
///
/// - The DNS policy uses the default retry count, delays and timeout
///   (`dns.timeout` overrides the timeout when positive). SRV lookups use the
///   same policy with zero retries.
/// - Connection attempts time out after `connectTimeout` (or the default).
/// - Every policy's maximum timeout equals its timeout, so per-attempt
///   timeouts never grow.
/// - The `retry` object sets retries and the delay bounds between attempts;
///   see [`MissingRetry`] for the behavior when it is absent.
///
/// # Errors
///
/// Returns [`MorayError::InvalidOptions`] if no host can be determined, the
/// port is not numeric, `retry.maxTimeout < retry.minTimeout`, or a pool
/// configuration is combined with any legacy connection field.
pub fn translate_legacy_options(options: &LegacyOptions, defaults: &Defaults) -> Result<PoolConfig> {
    if let Some(pool_config) = &options.pool_config {
        if options.has_connection_fields() {
            return Err(MorayError::InvalidOptions(
                "pool configuration cannot be combined with host, port, url, \
                 connectTimeout, maxConnections, dns or retry"
                    .into(),
            ));
        }
        pool_config.validate()?;
        return Ok(pool_config.clone());
    }

    let (domain, default_port) = resolve_endpoint(options, defaults)?;

    let mut resolvers = Vec::new();
    let mut dns_timeout_ms = defaults.dns_timeout_ms;
    if let Some(dns) = &options.dns {
        if let Some(list) = &dns.resolvers {
            resolvers = list.clone();
        }
        if let Some(timeout) = dns.timeout.filter(|t| *t > 0) {
            dns_timeout_ms = timeout;
        }
    }
    let dns = dns_policy(defaults, dns_timeout_ms)?;

    let connect_timeout_ms = options.connect_timeout.unwrap_or(defaults.connect_timeout_ms);
    let (retries, delay_ms, max_delay_ms) = match (&options.retry, options.missing_retry) {
        (Some(retry), _) => {
            let retries = retry.retries.unwrap_or(defaults.connect_retries);
            let (delay, max_delay) = match (retry.min_timeout, retry.max_timeout) {
                (Some(min), Some(max)) => {
                    if max < min {
                        return Err(MorayError::InvalidOptions(
                            "retry.maxTimeout must not be smaller than retry.minTimeout".into(),
                        ));
                    }
                    (min, max)
                }
                (Some(min), None) => (min, min.max(defaults.delay_max_ms)),
                (None, Some(max)) => (defaults.delay_min_ms.min(max), max),
                (None, None) => (defaults.delay_min_ms, defaults.delay_max_ms),
            };
            (retries, delay, max_delay)
        }
        (None, MissingRetry::NoRetries) => (0, 0, 0),
        (None, MissingRetry::DefaultRetries) => (
            defaults.connect_retries,
            defaults.delay_min_ms,
            defaults.delay_max_ms,
        ),
    };
    let default = RecoveryPolicy::new(
        retries,
        delay_ms,
        max_delay_ms,
        connect_timeout_ms,
        connect_timeout_ms,
    )?;

    let config = PoolConfig {
        domain,
        default_port,
        resolvers,
        spares: defaults.spares,
        maximum: options
            .max_connections
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_connections),
        max_dns_concurrency: defaults.max_dns_concurrency,
        recovery: RecoverySet {
            dns_srv: dns.without_retries(),
            dns,
            default,
        },
        refresh_interval_ms: defaults.refresh_interval_ms,
    };
    config.validate()?;
    Ok(config)
}

/// Where a client's pool configuration comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolSource {
    Legacy(LegacyOptions),
    Direct(PoolConfig),
}

impl PoolSource {
    pub fn into_pool_config(self, defaults: &Defaults) -> Result<PoolConfig> {
        match self {
            PoolSource::Legacy(options) => translate_legacy_options(&options, defaults),
            PoolSource::Direct(config) => {
                config.validate()?;
                Ok(config)
            }
        }
    }
}

/// Options for [`MorayClient`](crate::MorayClient).
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub source: PoolSource,
    /// Return the first non-transport cause instead of the wrapped chain
    pub unwrap_errors: bool,
    /// Panic if the client is dropped without being closed
    pub must_close_before_exit: bool,
    pub defaults: Defaults,
}

impl ClientOptions {
    pub fn from_legacy(options: LegacyOptions) -> Self {
        Self::from_source(PoolSource::Legacy(options))
    }

    pub fn from_pool_config(config: PoolConfig) -> Self {
        Self::from_source(PoolSource::Direct(config))
    }

    fn from_source(source: PoolSource) -> Self {
        Self {
            source,
            unwrap_errors: false,
            must_close_before_exit: false,
            defaults: Defaults::HISTORICAL,
        }
    }

    pub fn unwrap_errors(mut self, unwrap: bool) -> Self {
        self.unwrap_errors = unwrap;
        self
    }

    pub fn must_close_before_exit(mut self, must_close: bool) -> Self {
        self.must_close_before_exit = must_close;
        self
    }

    pub fn with_defaults(mut self, defaults: Defaults) -> Self {
        self.defaults = defaults;
        self
    }
}
