//! The RPC engine.
//!
//! [`call`] dispatches one request on a claimed connection and returns an
//! [`RpcRequest`] handle. Two thin adapters sit on top of it:
//!
//! - buffered calls ([`call_buffered`] and the arity-checking
//!   [`call_one`], [`call_optional`], [`call_no_data`]) collect every payload
//!   before returning
//! - streaming calls ([`call_streaming`]) hand payloads to a
//!   [`RecordStream`] as they arrive
//!
//! Every failure leaving this module is wrapped as
//! [`MorayError::Request`] naming the method, unless the context asks for
//! unwrapped errors.

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tracing::{debug, debug_span, error, warn, Instrument};
use uuid::Uuid;

use moray_common::{millis, MessageStatus, MorayError, RemoteError, RequestId, Result};

use crate::connection::{Delivery, PendingCall, RpcConnection};
use crate::context::RpcContext;

/// Records buffered between a streaming call and its consumer.
const STREAM_BUFFER: usize = 64;

/// Per-call settings.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Abort the request if it has not completed within this long
    pub timeout: Option<Duration>,
    /// Correlation id, recorded on the call's tracing span
    pub req_id: Option<String>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            req_id: None,
        }
    }

    pub fn req_id(mut self, req_id: impl Into<String>) -> Self {
        self.req_id = Some(req_id.into());
        self
    }
}

/// The options object sent to the server as the last argument of a call.
///
/// Anything in `extra` is passed through untouched. A `req_id` is generated
/// when none is given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    /// Client-side deadline; never sent
    #[serde(skip)]
    pub timeout_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_req_id(mut self, req_id: impl Into<String>) -> Self {
        self.req_id = Some(req_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(millis(timeout));
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Pins the request id so that several calls share it.
    pub(crate) fn ensure_req_id(mut self) -> Self {
        if self.req_id.is_none() {
            self.req_id = Some(Uuid::new_v4().to_string());
        }
        self
    }

    /// Splits the options into the wire object and the local call settings.
    pub(crate) fn prepare(&self) -> (Map<String, Value>, CallOptions) {
        let req_id = self
            .req_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut wire = self.extra.clone();
        wire.insert("req_id".to_string(), Value::String(req_id.clone()));

        let call = CallOptions {
            timeout: self.timeout_ms.map(Duration::from_millis),
            req_id: Some(req_id),
        };
        (wire, call)
    }
}

/// Lifecycle of a single request.
///
/// ```text
/// Pending -> Streaming -> Done | Failed | Aborted
///    \_________________________^
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Streaming,
    Done,
    Failed,
    /// The deadline expired before a terminal frame arrived
    Aborted,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Done | RequestState::Failed | RequestState::Aborted
        )
    }

    fn can_become(self, next: RequestState) -> bool {
        match self {
            RequestState::Pending => next != RequestState::Pending,
            RequestState::Streaming => next != RequestState::Pending,
            _ => false,
        }
    }
}

enum Wait {
    Delivery(Option<Delivery>),
    Expired,
}

/// An in-flight request.
///
/// Dropping a request that has not completed aborts it; frames that arrive
/// for it afterwards are discarded by the connection.
pub struct RpcRequest {
    conn: Arc<RpcConnection>,
    method: String,
    id: RequestId,
    rx: mpsc::UnboundedReceiver<Delivery>,
    state: RequestState,
    timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
    ready: VecDeque<Value>,
}

impl RpcRequest {
    pub(crate) fn new(
        conn: Arc<RpcConnection>,
        method: impl Into<String>,
        pending: PendingCall,
        timeout: Option<Duration>,
    ) -> Self {
        let deadline = timeout.map(|t| Box::pin(tokio::time::sleep(t)));
        Self::with_deadline(conn, method, pending, timeout, deadline)
    }

    /// Like [`RpcRequest::new`], but keeps counting down a deadline that was
    /// started before the request was written.
    fn with_deadline(
        conn: Arc<RpcConnection>,
        method: impl Into<String>,
        pending: PendingCall,
        timeout: Option<Duration>,
        deadline: Option<Pin<Box<Sleep>>>,
    ) -> Self {
        Self {
            conn,
            method: method.into(),
            id: pending.id,
            rx: pending.rx,
            state: RequestState::Pending,
            timeout,
            deadline,
            ready: VecDeque::new(),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Whether a deadline is still pending for this request.
    pub fn timer_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Returns the next response payload, or `None` once the request has
    /// completed successfully.
    ///
    /// # Errors
    ///
    /// Fails with the request's terminal error: a wrapped server error, a
    /// timeout, or the fault of the underlying connection.
    pub async fn next_event(&mut self) -> Result<Option<Value>> {
        loop {
            if let Some(payload) = self.ready.pop_front() {
                return Ok(Some(payload));
            }
            if self.state.is_terminal() {
                return Ok(None);
            }

            let wait = match self.deadline.as_mut() {
                Some(deadline) => tokio::select! {
                    biased;
                    delivery = self.rx.recv() => Wait::Delivery(delivery),
                    _ = deadline.as_mut() => Wait::Expired,
                },
                None => Wait::Delivery(self.rx.recv().await),
            };

            match wait {
                Wait::Expired => return Err(self.expire()),
                Wait::Delivery(None) => {
                    let key = self.conn.backend_key();
                    return Err(self.fail(MorayError::ConnectionClosed(key)));
                }
                Wait::Delivery(Some(Delivery::Failed(err))) => return Err(self.fail(err)),
                Wait::Delivery(Some(Delivery::Frame(msg))) => match msg.status {
                    MessageStatus::Data => {
                        self.transition(RequestState::Streaming)?;
                        self.ready.extend(msg.into_payloads());
                    }
                    MessageStatus::End => {
                        self.transition(RequestState::Done)?;
                        self.deadline = None;
                        self.ready.extend(msg.into_payloads());
                    }
                    MessageStatus::Error => {
                        let remote = RemoteError::from_value(msg.data.d);
                        return Err(self.fail(MorayError::Server(remote)));
                    }
                },
            }
        }
    }

    fn transition(&mut self, next: RequestState) -> Result<()> {
        if !self.state.can_become(next) {
            error!(
                method = %self.method,
                id = self.id,
                from = ?self.state,
                to = ?next,
                "invalid request state transition"
            );
            debug_assert!(
                false,
                "invalid request state transition: {:?} -> {:?}",
                self.state, next
            );
            return Err(MorayError::Internal(format!(
                "request {} moved from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, cause: MorayError) -> MorayError {
        self.deadline = None;
        if let Err(err) = self.transition(RequestState::Failed) {
            return err;
        }
        MorayError::request(self.method.clone(), cause)
    }

    fn expire(&mut self) -> MorayError {
        self.deadline = None;
        self.conn.abort(self.id);
        if let Err(err) = self.transition(RequestState::Aborted) {
            return err;
        }

        let timeout_ms = self.timeout.map_or(0, millis);
        warn!(method = %self.method, id = self.id, timeout_ms, "request timed out");
        MorayError::request(self.method.clone(), MorayError::Timeout { timeout_ms })
    }
}

impl Drop for RpcRequest {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.conn.abort(self.id);
        }
    }
}

/// Sends `method` with `args` on the context's connection.
///
/// The timeout starts counting before the request is written, so a peer that
/// stops reading cannot stall the call past its deadline.
///
/// # Errors
///
/// Fails if the timeout is zero or the request cannot be written in time.
pub async fn call(
    ctx: &RpcContext,
    method: &str,
    args: Vec<Value>,
    opts: &CallOptions,
) -> Result<RpcRequest> {
    if opts.timeout.is_some_and(|t| t.is_zero()) {
        return Err(MorayError::InvalidArgument(
            "timeout must be greater than zero".to_string(),
        ));
    }

    let mut deadline = opts.timeout.map(|t| Box::pin(tokio::time::sleep(t)));
    let conn = ctx.connection();
    let (pending, frame) = conn
        .register(method, args)
        .map_err(|e| ctx.finish_error(MorayError::request(method, e)))?;

    let write = conn.write_request(pending.id, method, &frame);
    let written = match deadline.as_mut() {
        Some(deadline) => tokio::select! {
            biased;
            written = write => Some(written),
            _ = deadline.as_mut() => None,
        },
        None => Some(write.await),
    };

    match written {
        Some(Ok(())) => Ok(RpcRequest::with_deadline(
            conn.clone(),
            method,
            pending,
            opts.timeout,
            deadline,
        )),
        Some(Err(err)) => Err(ctx.finish_error(MorayError::request(method, err))),
        None => {
            let timeout_ms = opts.timeout.map_or(0, millis);
            warn!(method, id = pending.id, timeout_ms, "request write timed out");
            conn.abandon_write(
                pending.id,
                MorayError::transport("writing request", format!("timed out after {}ms", timeout_ms)),
            );
            Err(ctx.finish_error(MorayError::request(method, MorayError::Timeout { timeout_ms })))
        }
    }
}

fn rpc_span(method: &str, opts: &CallOptions) -> tracing::Span {
    debug_span!(
        "rpc",
        method,
        req_id = opts.req_id.as_deref().unwrap_or_default()
    )
}

/// Collects every payload of the response, in order.
pub async fn call_buffered(
    ctx: &RpcContext,
    method: &str,
    args: Vec<Value>,
    opts: &CallOptions,
) -> Result<Vec<Value>> {
    async move {
        debug!("rpc: entry");
        let mut request = call(ctx, method, args, opts).await?;
        let mut payloads = Vec::new();
        loop {
            match request.next_event().await {
                Ok(Some(payload)) => payloads.push(payload),
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "rpc: failed");
                    return Err(ctx.finish_error(err));
                }
            }
        }
        debug!(count = payloads.len(), "rpc: done");
        Ok(payloads)
    }
    .instrument(rpc_span(method, opts))
    .await
}

fn bad_response(ctx: &RpcContext, method: &str, expected: &str, found: usize) -> MorayError {
    let err = MorayError::BadResponse(format!(
        "expected {} data messages, found {}",
        expected, found
    ));
    ctx.finish_error(MorayError::request(method, err))
}

/// A buffered call whose response must hold exactly one payload.
pub async fn call_one(
    ctx: &RpcContext,
    method: &str,
    args: Vec<Value>,
    opts: &CallOptions,
) -> Result<Value> {
    let mut payloads = call_buffered(ctx, method, args, opts).await?;
    match payloads.len() {
        1 => Ok(payloads.remove(0)),
        n => Err(bad_response(ctx, method, "1", n)),
    }
}

/// A buffered call whose response holds at most one payload.
pub async fn call_optional(
    ctx: &RpcContext,
    method: &str,
    args: Vec<Value>,
    opts: &CallOptions,
) -> Result<Option<Value>> {
    let mut payloads = call_buffered(ctx, method, args, opts).await?;
    match payloads.len() {
        0 => Ok(None),
        1 => Ok(payloads.pop()),
        n => Err(bad_response(ctx, method, "0 or 1", n)),
    }
}

/// A buffered call whose response must hold no payloads.
pub async fn call_no_data(
    ctx: &RpcContext,
    method: &str,
    args: Vec<Value>,
    opts: &CallOptions,
) -> Result<()> {
    let payloads = call_buffered(ctx, method, args, opts).await?;
    if !payloads.is_empty() {
        return Err(bad_response(ctx, method, "0", payloads.len()));
    }
    Ok(())
}

/// Starts a streaming call.
///
/// The context is released when the call completes, fails, or the returned
/// stream is dropped. `skip_null` drops `null` payloads instead of yielding
/// them.
pub fn call_streaming(
    ctx: RpcContext,
    method: impl Into<String>,
    args: Vec<Value>,
    opts: CallOptions,
    skip_null: bool,
) -> RecordStream {
    let method = method.into();
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let span = rpc_span(&method, &opts);

    tokio::spawn(
        async move {
            debug!("rpc: entry");
            if let Err(err) = drive_stream(&ctx, &method, args, &opts, skip_null, &tx).await {
                debug!(error = %err, "rpc: failed");
                let _ = tx.send(Err(ctx.finish_error(err))).await;
            }
            ctx.release();
        }
        .instrument(span),
    );

    RecordStream { rx }
}

async fn drive_stream(
    ctx: &RpcContext,
    method: &str,
    args: Vec<Value>,
    opts: &CallOptions,
    skip_null: bool,
    tx: &mpsc::Sender<Result<Value>>,
) -> Result<()> {
    let mut request = call(ctx, method, args, opts).await?;
    let mut count = 0usize;
    loop {
        let next = tokio::select! {
            next = request.next_event() => next?,
            _ = tx.closed() => None,
        };
        let Some(record) = next else {
            break;
        };
        if skip_null && record.is_null() {
            continue;
        }
        debug!(?record, "rpc: record");
        if tx.send(Ok(record)).await.is_err() {
            break;
        }
        count += 1;
    }
    if tx.is_closed() {
        debug!("rpc: consumer went away");
        return Ok(());
    }
    debug!(count, "rpc: done");
    Ok(())
}

/// Records of a streaming call.
///
/// Yields each record as it arrives. The stream ends after the last record,
/// or yields exactly one error and then ends.
pub struct RecordStream {
    rx: mpsc::Receiver<Result<Value>>,
}

impl RecordStream {
    /// A stream that fails immediately with `err`.
    pub fn failed(err: MorayError) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(Err(err));
        Self { rx }
    }
}

impl Stream for RecordStream {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
