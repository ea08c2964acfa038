//! Server health and raw SQL RPCs.

use serde_json::{json, Map, Value};
use std::time::Duration;

use moray_common::{MorayError, Result};

use crate::context::RpcContext;
use crate::rpc::{call_no_data, call_one, call_streaming, CallOptions, RecordStream, RequestOptions};

pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(1000);

/// Wire options for calls that only carry a request id.
fn id_only(opts: &RequestOptions) -> (Map<String, Value>, CallOptions) {
    let (wire, call) = opts.prepare();
    let mut minimal = Map::new();
    if let Some(req_id) = wire.get("req_id") {
        minimal.insert("req_id".to_string(), req_id.clone());
    }
    (minimal, call)
}

/// Checks that the server is up. A `deep` ping also checks the server's
/// database connection.
///
/// Bounded by the options' timeout, or one second when none is given.
pub async fn ping(ctx: &RpcContext, deep: bool, opts: &RequestOptions) -> Result<()> {
    let (mut wire, mut call) = id_only(opts);
    wire.insert("deep".to_string(), Value::Bool(deep));
    call.timeout.get_or_insert(DEFAULT_PING_TIMEOUT);
    call_no_data(ctx, "ping", vec![Value::Object(wire)], &call).await
}

/// Asks the server for its API version.
///
/// The version is informational; nothing in the client depends on it.
pub async fn version(ctx: &RpcContext, opts: &RequestOptions) -> Result<u64> {
    let (wire, call) = id_only(opts);
    let reply = call_one(ctx, "version", vec![Value::Object(wire)], &call).await?;
    reply
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            ctx.finish_error(MorayError::request(
                "version",
                MorayError::BadResponse("unable to parse version".to_string()),
            ))
        })
}

/// Fetches the server's shard tokens.
///
/// Only servers fronting a sharded deployment answer this; the reply is
/// returned as sent.
pub async fn get_tokens(ctx: &RpcContext, opts: &RequestOptions) -> Result<Value> {
    let (wire, call) = id_only(opts);
    call_one(ctx, "getTokens", vec![Value::Object(wire)], &call).await
}

/// Runs a raw SQL statement, streaming the resulting rows.
///
/// `null` rows are skipped.
pub fn sql(ctx: RpcContext, statement: &str, values: Vec<Value>, opts: &RequestOptions) -> RecordStream {
    let (wire, call) = id_only(opts);
    let args = vec![json!(statement), Value::Array(values), Value::Object(wire)];
    call_streaming(ctx, "sql", args, call, true)
}
