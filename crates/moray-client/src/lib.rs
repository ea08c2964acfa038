//! Client for the Moray key/value service.
//!
//! A [`MorayClient`] keeps a pool of multiplexed TCP connections to the
//! backends of one service, discovered through DNS, and exposes the bucket,
//! object and SQL RPCs on top of it.

pub mod buckets;
pub mod client;
pub mod connection;
pub mod context;
pub mod meta;
pub mod objects;
pub mod options;
pub mod pool;
pub mod recovery;
pub mod resolver;
pub mod rpc;

pub use buckets::{Bucket, BucketConfig, BucketOptions, IndexSpec};
pub use client::MorayClient;
pub use connection::{RpcConnection, RpcConnector};
pub use context::RpcContext;
pub use objects::{BatchRequest, ObjectRecord};
pub use options::{
    translate_legacy_options, ClientOptions, Defaults, DnsOptions, LegacyOptions, MissingRetry,
    PoolConfig, PoolSource, PortValue, RetryOptions,
};
pub use pool::{ConnectionPool, PoolEvent, PoolStats};
pub use recovery::{RecoveryPolicy, RecoverySet, UNBOUNDED_MS};
pub use resolver::{Backend, DnsResolver, Resolver, StaticResolver};
pub use rpc::{CallOptions, RecordStream, RequestOptions, RequestState, RpcRequest};

pub use moray_common::{ErrorLayer, MorayError, RemoteError, RemoteErrorKind, Result};
