//! Object RPCs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use moray_common::{MorayError, Result};

use crate::context::RpcContext;
use crate::rpc::{
    call_buffered, call_one, call_optional, call_streaming, CallOptions, RecordStream,
    RequestOptions,
};

/// An object as returned by `getObject` and `findObjects`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub bucket: String,
    pub key: String,
    pub value: Value,
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(rename = "_mtime", default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
    #[serde(rename = "_count", default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ObjectRecord {
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| MorayError::BadResponse(format!("unable to parse object: {}", e)))
    }
}

/// One operation of a `batch` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation")]
pub enum BatchRequest {
    #[serde(rename = "put")]
    Put {
        bucket: String,
        key: String,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Map<String, Value>>,
    },
    #[serde(rename = "update")]
    Update {
        bucket: String,
        fields: Map<String, Value>,
        filter: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Map<String, Value>>,
    },
    #[serde(rename = "delete")]
    Delete {
        bucket: String,
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Map<String, Value>>,
    },
    #[serde(rename = "deleteMany")]
    DeleteMany {
        bucket: String,
        filter: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Map<String, Value>>,
    },
}

impl BatchRequest {
    fn validate(&self, index: usize) -> Result<()> {
        let (bucket, field, value) = match self {
            BatchRequest::Put { bucket, key, .. } | BatchRequest::Delete { bucket, key, .. } => {
                (bucket, "key", key)
            }
            BatchRequest::Update { bucket, filter, .. }
            | BatchRequest::DeleteMany { bucket, filter, .. } => (bucket, "filter", filter),
        };

        for (field, value) in [("bucket", bucket), (field, value)] {
            if value.is_empty() {
                return Err(MorayError::InvalidArgument(format!(
                    "requests[{}].{} must be a non-empty string",
                    index, field
                )));
            }
        }
        Ok(())
    }

    fn to_wire(&self) -> Result<Value> {
        let mut wire = serde_json::to_value(self)?;
        if let (BatchRequest::Put { value, .. }, Value::Object(map)) = (self, &mut wire) {
            map.insert("_value".to_string(), Value::String(serde_json::to_string(value)?));
        }
        Ok(wire)
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(_) => true,
    }
}

/// Builds the options object shared by every object RPC.
fn object_options(opts: &RequestOptions) -> (Map<String, Value>, CallOptions) {
    let (mut wire, call) = opts.prepare();

    if !wire.contains_key("etag") {
        if let Some(etag) = wire.get("_etag").cloned() {
            wire.insert("etag".to_string(), etag);
        }
    }
    if !truthy(wire.get("headers")) {
        wire.insert("headers".to_string(), json!({}));
    }
    for flag in ["no_count", "sql_only"] {
        if !truthy(wire.get(flag)) {
            wire.insert(flag.to_string(), Value::Bool(false));
        }
    }
    wire.entry("noCache").or_insert(Value::Bool(true));

    (wire, call)
}

fn check_bucket(bucket: &str) -> Result<()> {
    if bucket.is_empty() {
        return Err(MorayError::InvalidArgument(
            "bucket must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(MorayError::InvalidArgument("key must not be empty".to_string()));
    }
    Ok(())
}

/// Stores `value` under `key`. Returns the server's reply (typically the new
/// etag), or an empty object if the server sent none.
pub async fn put_object(
    ctx: &RpcContext,
    bucket: &str,
    key: &str,
    value: &Value,
    opts: &RequestOptions,
) -> Result<Value> {
    check_bucket(bucket)?;
    check_key(key)?;
    let (mut wire, call) = object_options(opts);
    wire.insert("_value".to_string(), Value::String(serde_json::to_string(value)?));

    let args = vec![json!(bucket), json!(key), value.clone(), Value::Object(wire)];
    let reply = call_optional(ctx, "putObject", args, &call).await?;
    Ok(reply.unwrap_or_else(|| json!({})))
}

pub async fn get_object(
    ctx: &RpcContext,
    bucket: &str,
    key: &str,
    opts: &RequestOptions,
) -> Result<ObjectRecord> {
    check_bucket(bucket)?;
    check_key(key)?;
    let (wire, call) = object_options(opts);
    let args = vec![json!(bucket), json!(key), Value::Object(wire)];
    let record = call_one(ctx, "getObject", args, &call).await?;
    ObjectRecord::from_value(record).map_err(|e| ctx.finish_error(MorayError::request("getObject", e)))
}

/// Deletes `key`. Whatever the server replies with is ignored.
pub async fn delete_object(
    ctx: &RpcContext,
    bucket: &str,
    key: &str,
    opts: &RequestOptions,
) -> Result<()> {
    check_bucket(bucket)?;
    check_key(key)?;
    let (wire, call) = object_options(opts);
    let args = vec![json!(bucket), json!(key), Value::Object(wire)];
    call_buffered(ctx, "delObject", args, &call).await?;
    Ok(())
}

/// Streams every object in `bucket` matching `filter`.
pub fn find_objects(ctx: RpcContext, bucket: &str, filter: &str, opts: &RequestOptions) -> RecordStream {
    if let Err(err) = check_bucket(bucket) {
        ctx.release();
        return RecordStream::failed(err);
    }
    let (wire, call) = object_options(opts);
    let args = vec![json!(bucket), json!(filter), Value::Object(wire)];
    call_streaming(ctx, "findObjects", args, call, false)
}

/// Runs several operations in one transaction.
///
/// Every request is validated before anything is sent.
pub async fn batch(ctx: &RpcContext, requests: &[BatchRequest], opts: &RequestOptions) -> Result<Value> {
    let wire_requests = requests
        .iter()
        .enumerate()
        .map(|(i, r)| {
            r.validate(i)?;
            r.to_wire()
        })
        .collect::<Result<Vec<_>>>()?;

    let (wire, call) = object_options(opts);
    let args = vec![Value::Array(wire_requests), Value::Object(wire)];
    let reply = call_optional(ctx, "batch", args, &call).await?;
    Ok(reply.unwrap_or_else(|| json!({})))
}

pub async fn update_objects(
    ctx: &RpcContext,
    bucket: &str,
    fields: &Map<String, Value>,
    filter: &str,
    opts: &RequestOptions,
) -> Result<Value> {
    check_bucket(bucket)?;
    let (wire, call) = object_options(opts);
    let args = vec![
        json!(bucket),
        Value::Object(fields.clone()),
        json!(filter),
        Value::Object(wire),
    ];
    let reply = call_optional(ctx, "updateObjects", args, &call).await?;
    Ok(reply.unwrap_or_else(|| json!({})))
}

pub async fn delete_many(
    ctx: &RpcContext,
    bucket: &str,
    filter: &str,
    opts: &RequestOptions,
) -> Result<Value> {
    check_bucket(bucket)?;
    let (wire, call) = object_options(opts);
    let args = vec![json!(bucket), json!(filter), Value::Object(wire)];
    let reply = call_optional(ctx, "deleteMany", args, &call).await?;
    Ok(reply.unwrap_or_else(|| json!({})))
}

/// Reindexes up to `count` rows of `bucket`. The reply carries the number of
/// rows `processed`.
pub async fn reindex_objects(
    ctx: &RpcContext,
    bucket: &str,
    count: u32,
    opts: &RequestOptions,
) -> Result<Value> {
    check_bucket(bucket)?;
    if count == 0 {
        return Err(MorayError::InvalidArgument(
            "count must be greater than zero".to_string(),
        ));
    }
    let (wire, call) = object_options(opts);
    let args = vec![json!(bucket), json!(count), Value::Object(wire)];
    let reply = call_one(ctx, "reindexObjects", args, &call).await?;
    debug!(processed = ?reply.get("processed"), "reindexObjects: processed");
    Ok(reply)
}
