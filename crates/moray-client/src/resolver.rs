//! Backend discovery.
//!
//! The pool asks a [`Resolver`] for the current set of backends on startup
//! and on every refresh. [`DnsResolver`] discovers backends the way Moray
//! deployments publish them (SRV records, falling back to plain host
//! records), and [`StaticResolver`] serves a fixed list.

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveError;
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, warn};

use moray_common::{MorayError, Result};

use crate::options::PoolConfig;
use crate::recovery::RecoveryPolicy;

/// One resolved endpoint of the service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    /// Host name the address was resolved from
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
}

impl Backend {
    pub fn new(name: impl Into<String>, address: IpAddr, port: u16) -> Self {
        Self {
            name: name.into(),
            address,
            port,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Identity of the backend within a pool (`address:port`).
    pub fn key(&self) -> String {
        self.socket_addr().to_string()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.socket_addr(), self.name)
    }
}

/// Source of the backend set for a pool.
pub trait Resolver: Send + Sync {
    fn resolve(&self) -> BoxFuture<'_, Result<Vec<Backend>>>;
}

/// A fixed backend list.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    backends: Vec<Backend>,
}

impl StaticResolver {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self { backends }
    }

    pub fn from_addrs(addrs: &[SocketAddr]) -> Self {
        Self::new(
            addrs
                .iter()
                .map(|addr| Backend::new(addr.ip().to_string(), addr.ip(), addr.port()))
                .collect(),
        )
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self) -> BoxFuture<'_, Result<Vec<Backend>>> {
        futures::future::ready(Ok(self.backends.clone())).boxed()
    }
}

/// DNS-based discovery.
///
/// - An IP literal domain resolves to itself without touching DNS.
/// - Otherwise `_moray._tcp.<domain>` is looked up under the SRV policy.
///   Each SRV target is then resolved to addresses, with the port taken
///   from the SRV record.
/// - If SRV yields nothing, `<domain>` itself is resolved under the DNS
///   policy and paired with the default port.
pub struct DnsResolver {
    domain: String,
    port: u16,
    literal: Option<IpAddr>,
    lookup: Option<TokioAsyncResolver>,
    dns: RecoveryPolicy,
    dns_srv: RecoveryPolicy,
    max_concurrency: usize,
}

impl DnsResolver {
    pub fn new(config: &PoolConfig) -> Result<Self> {
        let literal = config
            .domain
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .ok();

        let lookup = match literal {
            Some(_) => None,
            None => Some(build_resolver(config)?),
        };

        Ok(Self {
            domain: config.domain.clone(),
            port: config.default_port,
            literal,
            lookup,
            dns: config.recovery.dns.clone(),
            dns_srv: config.recovery.dns_srv.clone(),
            max_concurrency: config.max_dns_concurrency.max(1),
        })
    }

    async fn resolve_all(&self) -> Result<Vec<Backend>> {
        let resolver = match (&self.lookup, self.literal) {
            (_, Some(address)) => {
                return Ok(vec![Backend::new(self.domain.clone(), address, self.port)])
            }
            (Some(resolver), None) => resolver,
            (None, None) => {
                return Err(MorayError::Internal(format!(
                    "no resolver configured for {}",
                    self.domain
                )))
            }
        };

        let srv_name = format!("_moray._tcp.{}", self.domain);
        let targets: Vec<(String, u16)> =
            match with_policy(&self.dns_srv, &srv_name, || resolver.srv_lookup(srv_name.clone())).await {
                Ok(lookup) => lookup
                    .iter()
                    .map(|srv| (srv.target().to_utf8(), srv.port()))
                    .collect(),
                Err(e) => {
                    debug!(domain = %self.domain, error = %e, "SRV lookup failed; using host records");
                    Vec::new()
                }
            };
        let targets = if targets.is_empty() {
            vec![(self.domain.clone(), self.port)]
        } else {
            targets
        };

        let results: Vec<Result<Vec<Backend>>> = stream::iter(targets)
            .map(|(host, port)| async move {
                let ips = with_policy(&self.dns, &host, || resolver.lookup_ip(host.clone())).await?;
                let name = host.trim_end_matches('.').to_string();
                Ok::<_, MorayError>(
                    ips.iter()
                        .map(|address| Backend::new(name.clone(), address, port))
                        .collect::<Vec<_>>(),
                )
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut seen = HashSet::new();
        let mut backends = Vec::new();
        let mut first_err = None;
        for result in results {
            match result {
                Ok(found) => {
                    for backend in found {
                        if seen.insert(backend.key()) {
                            backends.push(backend);
                        }
                    }
                }
                Err(e) => {
                    warn!(domain = %self.domain, error = %e, "host lookup failed");
                    first_err.get_or_insert(e);
                }
            }
        }

        match (backends.is_empty(), first_err) {
            (true, Some(err)) => Err(err),
            _ => Ok(backends),
        }
    }
}

impl Resolver for DnsResolver {
    fn resolve(&self) -> BoxFuture<'_, Result<Vec<Backend>>> {
        self.resolve_all().boxed()
    }
}

impl fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsResolver")
            .field("domain", &self.domain)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

fn build_resolver(config: &PoolConfig) -> Result<TokioAsyncResolver> {
    if config.resolvers.is_empty() {
        return TokioAsyncResolver::tokio_from_system_conf().map_err(|e| MorayError::Dns {
            domain: config.domain.clone(),
            message: format!("loading system resolver configuration: {}", e),
        });
    }

    let ips = config
        .resolvers
        .iter()
        .map(|r| {
            r.parse::<IpAddr>().map_err(|_| {
                MorayError::InvalidOptions(format!("resolver {:?} is not an IP address", r))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut opts = ResolverOpts::default();
    opts.timeout = config.recovery.dns.timeout_for_attempt(0);
    opts.attempts = 1;

    let servers = NameServerConfigGroup::from_ips_clear(&ips, 53, true);
    Ok(TokioAsyncResolver::tokio(
        ResolverConfig::from_parts(None, Vec::new(), servers),
        opts,
    ))
}

/// Runs one lookup under `policy`: each attempt gets the policy's timeout and
/// failed attempts are followed by the policy's delay.
async fn with_policy<T, F, Fut>(policy: &RecoveryPolicy, name: &str, mut lookup: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ResolveError>>,
{
    let mut attempt = 0;
    loop {
        let timeout = policy.timeout_for_attempt(attempt);
        let message = match tokio::time::timeout(timeout, lookup()).await {
            Ok(Ok(found)) => return Ok(found),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", timeout.as_millis()),
        };

        if attempt >= policy.retries() {
            return Err(MorayError::Dns {
                domain: name.to_string(),
                message,
            });
        }

        debug!(name, attempt, error = %message, "lookup failed; retrying");
        tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Defaults;

    #[tokio::test]
    async fn test_ip_literal_skips_dns() {
        let config = PoolConfig::new("127.0.0.1", 2021, &Defaults::HISTORICAL).unwrap();
        let resolver = DnsResolver::new(&config).unwrap();
        let backends = resolver.resolve().await.unwrap();
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].key(), "127.0.0.1:2021");
    }

    #[tokio::test]
    async fn test_ipv6_literal() {
        let config = PoolConfig::new("[::1]", 2020, &Defaults::HISTORICAL).unwrap();
        let resolver = DnsResolver::new(&config).unwrap();
        let backends = resolver.resolve().await.unwrap();
        assert_eq!(backends[0].key(), "[::1]:2020");
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let addrs: Vec<SocketAddr> = vec!["10.0.0.1:2020".parse().unwrap(), "10.0.0.2:2021".parse().unwrap()];
        let resolver = StaticResolver::from_addrs(&addrs);
        let keys: Vec<String> = resolver.resolve().await.unwrap().iter().map(Backend::key).collect();
        assert_eq!(keys, vec!["10.0.0.1:2020", "10.0.0.2:2021"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_retries_then_fails() {
        let policy = RecoveryPolicy::new(2, 10, 100, 50, 50).unwrap();
        let mut calls = 0;
        let result: Result<()> = with_policy(&policy, "example.com", || {
            calls += 1;
            futures::future::pending::<std::result::Result<(), ResolveError>>()
        })
        .await;

        assert_eq!(calls, 3);
        match result {
            Err(MorayError::Dns { domain, message }) => {
                assert_eq!(domain, "example.com");
                assert!(message.contains("timed out"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
