//! Bucket RPCs.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use moray_common::{MorayError, RemoteErrorKind, Result};

use crate::context::RpcContext;
use crate::rpc::{call_buffered, call_no_data, call_one, RequestOptions};

/// How one field of a bucket is indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index type, e.g. `string`, `number`, `boolean`, `ip`
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IndexSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            unique: false,
            extra: Map::new(),
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketOptions {
    /// Schema version; 0 or absent means unversioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The desired configuration of a bucket.
///
/// `pre` and `post` hold server-side trigger definitions. The client treats
/// them as opaque text and never evaluates them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    #[serde(default)]
    pub index: BTreeMap<String, IndexSpec>,
    #[serde(default)]
    pub pre: Vec<String>,
    #[serde(default)]
    pub post: Vec<String>,
    #[serde(default)]
    pub options: BucketOptions,
}

impl BucketConfig {
    pub fn with_index(mut self, field: impl Into<String>, spec: IndexSpec) -> Self {
        self.index.insert(field.into(), spec);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.options.version = Some(version);
        self
    }

    pub fn version(&self) -> u64 {
        self.options.version.unwrap_or(0)
    }
}

/// A bucket as stored on the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub name: String,
    pub index: BTreeMap<String, IndexSpec>,
    pub pre: Vec<String>,
    pub post: Vec<String>,
    pub options: BucketOptions,
    pub mtime: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reindex_active: Option<Value>,
}

impl Bucket {
    pub fn version(&self) -> u64 {
        self.options.version.unwrap_or(0)
    }
}

/// Bucket record as the server sends it: the structured fields are JSON
/// text.
#[derive(Deserialize)]
struct RawBucket {
    name: String,
    index: String,
    pre: String,
    post: String,
    options: String,
    mtime: Value,
    #[serde(default)]
    reindex_active: Option<Value>,
}

fn decode_field<T: serde::de::DeserializeOwned>(bucket: &str, field: &str, text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| {
        MorayError::BadResponse(format!("bucket {}: unable to parse {}: {}", bucket, field, e))
    })
}

fn parse_mtime(bucket: &str, mtime: &Value) -> Result<DateTime<Utc>> {
    let parsed = match mtime {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    };
    parsed.ok_or_else(|| {
        MorayError::BadResponse(format!("bucket {}: unable to parse mtime {}", bucket, mtime))
    })
}

/// Decodes a bucket record returned by `getBucket` or `listBuckets`.
pub fn parse_bucket(record: Value) -> Result<Bucket> {
    let raw: RawBucket = serde_json::from_value(record)
        .map_err(|e| MorayError::BadResponse(format!("unable to parse bucket: {}", e)))?;
    let name = raw.name;

    let reindex_active = match raw.reindex_active {
        Some(Value::String(text)) => Some(decode_field(&name, "reindex_active", &text)?),
        Some(Value::Null) | None => None,
        Some(other) => Some(other),
    };

    Ok(Bucket {
        index: decode_field(&name, "index", &raw.index)?,
        pre: decode_field(&name, "pre", &raw.pre)?,
        post: decode_field(&name, "post", &raw.post)?,
        options: decode_field(&name, "options", &raw.options)?,
        mtime: parse_mtime(&name, &raw.mtime)?,
        reindex_active,
        name,
    })
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MorayError::InvalidArgument(
            "bucket name must not be empty".to_string(),
        ));
    }
    Ok(())
}

pub async fn create_bucket(
    ctx: &RpcContext,
    name: &str,
    config: &BucketConfig,
    opts: &RequestOptions,
) -> Result<()> {
    check_name(name)?;
    let (wire, call) = opts.prepare();
    let args = vec![json!(name), serde_json::to_value(config)?, Value::Object(wire)];
    call_no_data(ctx, "createBucket", args, &call).await
}

pub async fn get_bucket(ctx: &RpcContext, name: &str, opts: &RequestOptions) -> Result<Bucket> {
    check_name(name)?;
    let (wire, call) = opts.prepare();
    let record = call_one(ctx, "getBucket", vec![Value::Object(wire), json!(name)], &call).await?;
    parse_bucket(record).map_err(|e| ctx.finish_error(MorayError::request("getBucket", e)))
}

pub async fn list_buckets(ctx: &RpcContext, opts: &RequestOptions) -> Result<Vec<Bucket>> {
    let (wire, call) = opts.prepare();
    call_buffered(ctx, "listBuckets", vec![Value::Object(wire)], &call)
        .await?
        .into_iter()
        .map(parse_bucket)
        .collect::<Result<Vec<_>>>()
        .map_err(|e| ctx.finish_error(MorayError::request("listBuckets", e)))
}

pub async fn update_bucket(
    ctx: &RpcContext,
    name: &str,
    config: &BucketConfig,
    opts: &RequestOptions,
) -> Result<()> {
    check_name(name)?;
    let (wire, call) = opts.prepare();
    let args = vec![json!(name), serde_json::to_value(config)?, Value::Object(wire)];
    call_no_data(ctx, "updateBucket", args, &call).await
}

pub async fn delete_bucket(ctx: &RpcContext, name: &str, opts: &RequestOptions) -> Result<()> {
    check_name(name)?;
    let (mut wire, call) = opts.prepare();
    wire.insert("bucket".to_string(), json!(name));
    call_no_data(ctx, "delBucket", vec![json!(name), Value::Object(wire)], &call).await
}

/// Creates the bucket or brings it up to `config`.
///
/// - A missing bucket is created.
/// - An existing bucket whose non-zero version already equals the desired
///   version is left alone without further RPCs.
/// - Otherwise the bucket is updated.
///
/// A `BucketConflictError` from the create or update step counts as success:
/// a concurrent caller is assumed to have made the same change. This is not
/// verified, so concurrent callers with different configurations can race.
pub async fn put_bucket(
    ctx: &RpcContext,
    name: &str,
    config: &BucketConfig,
    opts: &RequestOptions,
) -> Result<()> {
    let opts = opts.clone().ensure_req_id();

    let outcome = match get_bucket(ctx, name, &opts).await {
        Ok(existing) => {
            let current = existing.version();
            if current != 0 && current == config.version() {
                debug!(bucket = name, version = current, "putBucket: already at version");
                return Ok(());
            }
            debug!(bucket = name, from = current, to = config.version(), "putBucket: updating");
            update_bucket(ctx, name, config, &opts).await
        }
        Err(err) if err.has_remote_cause(&RemoteErrorKind::BucketNotFound) => {
            debug!(bucket = name, "putBucket: creating");
            create_bucket(ctx, name, config, &opts).await
        }
        Err(err) => return Err(err),
    };

    match outcome {
        Err(err) if err.has_remote_cause(&RemoteErrorKind::BucketConflict) => {
            debug!(bucket = name, error = %err, "putBucket: conflict ignored");
            Ok(())
        }
        other => other,
    }
}
