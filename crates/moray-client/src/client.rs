//! The Moray client facade.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use moray_common::{MorayError, Result};

use crate::buckets::{self, Bucket, BucketConfig};
use crate::connection::RpcConnector;
use crate::context::RpcContext;
use crate::meta;
use crate::objects::{self, BatchRequest, ObjectRecord};
use crate::options::{ClientOptions, PoolConfig};
use crate::pool::{ConnectionPool, PoolEvent, PoolOptions, PoolStats};
use crate::resolver::{DnsResolver, Resolver};
use crate::rpc::{RecordStream, RequestOptions};

/// A client for one Moray service.
///
/// Each RPC claims a pooled connection for its duration and releases it when
/// the RPC finishes. A claim never waits: if no connection is idle the RPC
/// fails with [`MorayError::NoConnections`].
///
/// Must be created inside a tokio runtime.
///
/// # Example
///
/// ```no_run
/// use moray_client::{ClientOptions, LegacyOptions, MorayClient, RequestOptions};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let options = ClientOptions::from_legacy(LegacyOptions::with_host("10.0.0.5", 2020));
/// let client = MorayClient::new(options)?;
/// client.wait_connected().await?;
///
/// let bucket = client.get_bucket("users", &RequestOptions::new()).await?;
/// println!("{} is at version {}", bucket.name, bucket.version());
///
/// client.close().await;
/// # Ok(())
/// # }
/// ```
pub struct MorayClient {
    domain: String,
    pool: ConnectionPool<RpcConnector>,
    unwrap_errors: bool,
    must_close: bool,
    closed: AtomicBool,
}

impl MorayClient {
    /// Creates a client that discovers backends through DNS.
    ///
    /// # Errors
    ///
    /// Returns [`MorayError::InvalidOptions`] if the options do not translate
    /// into a valid pool configuration.
    pub fn new(options: ClientOptions) -> Result<Self> {
        let config = options.source.clone().into_pool_config(&options.defaults)?;
        let resolver = DnsResolver::new(&config)?;
        Self::build(options, config, Arc::new(resolver))
    }

    /// Creates a client whose backends come from `resolver`.
    pub fn with_resolver(options: ClientOptions, resolver: Arc<dyn Resolver>) -> Result<Self> {
        let config = options.source.clone().into_pool_config(&options.defaults)?;
        Self::build(options, config, resolver)
    }

    fn build(
        options: ClientOptions,
        config: PoolConfig,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Self> {
        let connector = RpcConnector::new(options.defaults.recent_requests);
        let pool = ConnectionPool::new(connector, resolver, PoolOptions::from(&config));

        debug!(domain = %config.domain, maximum = config.maximum, "client created");
        Ok(Self {
            domain: config.domain,
            pool,
            unwrap_errors: options.unwrap_errors,
            must_close: options.must_close_before_exit,
            closed: AtomicBool::new(false),
        })
    }

    /// Waits until a usable connection exists.
    ///
    /// # Errors
    ///
    /// Fails if every backend was exhausted before the first connection, or
    /// if the client is closed meanwhile.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut events = self.pool.subscribe();
        let failure = async {
            loop {
                match events.recv().await {
                    Ok(PoolEvent::Error(message)) => {
                        return MorayError::transport("connecting", message)
                    }
                    Ok(PoolEvent::Close) => return MorayError::Closed,
                    Ok(PoolEvent::Connect) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        futures::future::pending::<()>().await
                    }
                }
            }
        };

        tokio::select! {
            claim = self.pool.claim_async() => {
                claim?.release();
                Ok(())
            }
            err = failure => Err(err),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.pool.subscribe()
    }

    pub fn outstanding_claims(&self) -> usize {
        self.pool.outstanding_claims()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn context(&self) -> Result<RpcContext> {
        if self.is_closed() {
            return Err(MorayError::Closed);
        }
        let claim = self.pool.claim().map_err(|e| {
            debug!(error = %e, "claim failed");
            e
        })?;
        Ok(RpcContext::new(claim, self.unwrap_errors))
    }

    pub async fn create_bucket(&self, name: &str, config: &BucketConfig, opts: &RequestOptions) -> Result<()> {
        let ctx = self.context()?;
        let result = buckets::create_bucket(&ctx, name, config, opts).await;
        ctx.release();
        result
    }

    pub async fn get_bucket(&self, name: &str, opts: &RequestOptions) -> Result<Bucket> {
        let ctx = self.context()?;
        let result = buckets::get_bucket(&ctx, name, opts).await;
        ctx.release();
        result
    }

    pub async fn list_buckets(&self, opts: &RequestOptions) -> Result<Vec<Bucket>> {
        let ctx = self.context()?;
        let result = buckets::list_buckets(&ctx, opts).await;
        ctx.release();
        result
    }

    pub async fn update_bucket(&self, name: &str, config: &BucketConfig, opts: &RequestOptions) -> Result<()> {
        let ctx = self.context()?;
        let result = buckets::update_bucket(&ctx, name, config, opts).await;
        ctx.release();
        result
    }

    pub async fn delete_bucket(&self, name: &str, opts: &RequestOptions) -> Result<()> {
        let ctx = self.context()?;
        let result = buckets::delete_bucket(&ctx, name, opts).await;
        ctx.release();
        result
    }

    /// Creates or updates a bucket; see [`buckets::put_bucket`].
    pub async fn put_bucket(&self, name: &str, config: &BucketConfig, opts: &RequestOptions) -> Result<()> {
        let ctx = self.context()?;
        let result = buckets::put_bucket(&ctx, name, config, opts).await;
        ctx.release();
        result
    }

    pub async fn put_object(&self, bucket: &str, key: &str, value: &Value, opts: &RequestOptions) -> Result<Value> {
        let ctx = self.context()?;
        let result = objects::put_object(&ctx, bucket, key, value, opts).await;
        ctx.release();
        result
    }

    pub async fn get_object(&self, bucket: &str, key: &str, opts: &RequestOptions) -> Result<ObjectRecord> {
        let ctx = self.context()?;
        let result = objects::get_object(&ctx, bucket, key, opts).await;
        ctx.release();
        result
    }

    pub async fn delete_object(&self, bucket: &str, key: &str, opts: &RequestOptions) -> Result<()> {
        let ctx = self.context()?;
        let result = objects::delete_object(&ctx, bucket, key, opts).await;
        ctx.release();
        result
    }

    /// Streams the objects in `bucket` matching `filter`.
    ///
    /// If no connection can be claimed the stream yields that error and ends.
    pub fn find_objects(&self, bucket: &str, filter: &str, opts: &RequestOptions) -> RecordStream {
        match self.context() {
            Ok(ctx) => objects::find_objects(ctx, bucket, filter, opts),
            Err(err) => RecordStream::failed(err),
        }
    }

    pub async fn batch(&self, requests: &[BatchRequest], opts: &RequestOptions) -> Result<Value> {
        let ctx = self.context()?;
        let result = objects::batch(&ctx, requests, opts).await;
        ctx.release();
        result
    }

    pub async fn update_objects(
        &self,
        bucket: &str,
        fields: &Map<String, Value>,
        filter: &str,
        opts: &RequestOptions,
    ) -> Result<Value> {
        let ctx = self.context()?;
        let result = objects::update_objects(&ctx, bucket, fields, filter, opts).await;
        ctx.release();
        result
    }

    pub async fn delete_many(&self, bucket: &str, filter: &str, opts: &RequestOptions) -> Result<Value> {
        let ctx = self.context()?;
        let result = objects::delete_many(&ctx, bucket, filter, opts).await;
        ctx.release();
        result
    }

    pub async fn reindex_objects(&self, bucket: &str, count: u32, opts: &RequestOptions) -> Result<Value> {
        let ctx = self.context()?;
        let result = objects::reindex_objects(&ctx, bucket, count, opts).await;
        ctx.release();
        result
    }

    pub async fn ping(&self, deep: bool, opts: &RequestOptions) -> Result<()> {
        let ctx = self.context()?;
        let result = meta::ping(&ctx, deep, opts).await;
        ctx.release();
        result
    }

    pub async fn version(&self, opts: &RequestOptions) -> Result<u64> {
        let ctx = self.context()?;
        let result = meta::version(&ctx, opts).await;
        ctx.release();
        result
    }

    /// Like [`MorayClient::version`], but reports version 1 when the server
    /// does not answer.
    pub async fn version_or_default(&self, opts: &RequestOptions) -> u64 {
        match self.version(opts).await {
            Ok(version) => version,
            Err(err) => {
                debug!(error = %err, "version unavailable; assuming 1");
                1
            }
        }
    }

    pub async fn get_tokens(&self, opts: &RequestOptions) -> Result<Value> {
        let ctx = self.context()?;
        let result = meta::get_tokens(&ctx, opts).await;
        ctx.release();
        result
    }

    pub fn sql(&self, statement: &str, values: Vec<Value>, opts: &RequestOptions) -> RecordStream {
        match self.context() {
            Ok(ctx) => meta::sql(ctx, statement, values, opts),
            Err(err) => RecordStream::failed(err),
        }
    }

    /// Closes the client.
    ///
    /// Closing while RPCs are outstanding is logged; their connections are
    /// torn down once those RPCs finish. Calling this more than once has no
    /// further effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let nclaims = self.pool.outstanding_claims();
        if nclaims > 0 {
            warn!(nclaims, "closing client with outstanding RPCs");
        }

        self.pool.stop().await;
        info!(domain = %self.domain, "client closed");
    }
}

impl fmt::Display for MorayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MorayClient<host={}>", self.domain)
    }
}

impl fmt::Debug for MorayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MorayClient")
            .field("domain", &self.domain)
            .field("unwrap_errors", &self.unwrap_errors)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for MorayClient {
    fn drop(&mut self) {
        if self.must_close && !self.is_closed() && !std::thread::panicking() {
            panic!("{} dropped without being closed", self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{Defaults, PoolConfig};
    use crate::resolver::StaticResolver;

    fn options() -> ClientOptions {
        let config = PoolConfig::new("127.0.0.1", 1, &Defaults::HISTORICAL).unwrap();
        ClientOptions::from_pool_config(config)
    }

    fn unreachable() -> Arc<dyn Resolver> {
        Arc::new(StaticResolver::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_display() {
        let client = MorayClient::with_resolver(options(), unreachable()).unwrap();
        assert_eq!(client.to_string(), "MorayClient<host=127.0.0.1>");
        client.close().await;
    }

    #[tokio::test]
    async fn test_no_connections() {
        let client = MorayClient::with_resolver(options(), unreachable()).unwrap();
        let err = client.ping(false, &RequestOptions::new()).await.unwrap_err();
        assert!(matches!(err, MorayError::NoConnections));
        assert_eq!(client.outstanding_claims(), 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let client = MorayClient::with_resolver(options(), unreachable()).unwrap();
        client.close().await;
        client.close().await;
        assert!(client.is_closed());
        let err = client.version(&RequestOptions::new()).await.unwrap_err();
        assert!(matches!(err, MorayError::Closed));
        assert_eq!(client.version_or_default(&RequestOptions::new()).await, 1);
    }

    #[tokio::test]
    async fn test_wait_connected_without_backends() {
        let client = MorayClient::with_resolver(options(), unreachable()).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), client.wait_connected())
            .await
            .unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.layer(), moray_common::ErrorLayer::Transport);
        assert!(err.to_string().contains("no backends found"));
        client.close().await;
    }

    #[tokio::test]
    #[should_panic(expected = "dropped without being closed")]
    async fn test_must_close_before_exit() {
        let client =
            MorayClient::with_resolver(options().must_close_before_exit(true), unreachable()).unwrap();
        drop(client);
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let mut config = PoolConfig::new("127.0.0.1", 2020, &Defaults::HISTORICAL).unwrap();
        config.maximum = 0;
        let result = MorayClient::with_resolver(ClientOptions::from_pool_config(config), unreachable());
        assert!(matches!(result, Err(MorayError::InvalidOptions(_))));
    }
}
