//! A single TCP connection to a Moray server.
//!
//! An [`RpcConnection`] owns one socket and multiplexes any number of
//! concurrent requests over it. A reader task routes every incoming frame to
//! the request it belongs to by id.
//!
//! Faults can be detected by the socket (I/O errors, peer hangup) or by the
//! multiplexer (undecodable frames, frames for ids that were never issued).
//! However many fire, the connection publishes exactly one failure: the first
//! fault is surfaced through [`PoolConnection::state`] and every fault is kept
//! for diagnostics in [`RpcConnection::faults`].

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use moray_common::transport::{JsonCodec, TcpTransport};
use moray_common::{ErrorLayer, Message, MorayError, RequestId, Result, MAX_REQUEST_ID};

use crate::pool::{ConnectionState, Connector, PoolConnection};
use crate::resolver::Backend;

/// What the reader task hands to a pending request.
#[derive(Debug)]
pub(crate) enum Delivery {
    Frame(Message),
    /// The connection failed before the request completed
    Failed(MorayError),
}

/// A request that has been written to the socket.
pub(crate) struct PendingCall {
    pub(crate) id: RequestId,
    pub(crate) rx: mpsc::UnboundedReceiver<Delivery>,
}

#[derive(Debug, Clone, Copy)]
enum FaultSource {
    Socket,
    Protocol,
}

struct Multiplexer {
    next_id: RequestId,
    pending: HashMap<RequestId, mpsc::UnboundedSender<Delivery>>,
    /// Ids of recently completed or aborted requests
    recent: VecDeque<RequestId>,
    recent_limit: usize,
}

impl Multiplexer {
    fn new(recent_limit: usize) -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
            recent: VecDeque::with_capacity(recent_limit),
            recent_limit,
        }
    }

    fn allocate(&mut self, tx: mpsc::UnboundedSender<Delivery>) -> RequestId {
        loop {
            let id = self.next_id;
            self.next_id = if id >= MAX_REQUEST_ID { 1 } else { id + 1 };
            if !self.pending.contains_key(&id) {
                self.pending.insert(id, tx);
                return id;
            }
        }
    }

    /// Stops tracking `id`; frames that still arrive for it are dropped.
    fn retire(&mut self, id: RequestId) -> Option<mpsc::UnboundedSender<Delivery>> {
        let entry = self.pending.remove(&id);
        if entry.is_some() && self.recent_limit > 0 {
            if self.recent.len() == self.recent_limit {
                self.recent.pop_front();
            }
            self.recent.push_back(id);
        }
        entry
    }
}

struct ConnShared {
    backend: Backend,
    mux: Mutex<Multiplexer>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    faults: Mutex<Vec<MorayError>>,
    destroyed: AtomicBool,
    state: watch::Sender<ConnectionState>,
}

impl ConnShared {
    fn mux(&self) -> MutexGuard<'_, Multiplexer> {
        self.mux.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<'_, Vec<MorayError>> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, msg: Message) -> Result<()> {
        let mut mux = self.mux();
        let id = msg.id;

        if let Some(tx) = mux.pending.get(&id) {
            let terminal = msg.is_terminal();
            // The request may have stopped listening; that is not a fault
            let _ = tx.send(Delivery::Frame(msg));
            if terminal {
                mux.retire(id);
            }
            return Ok(());
        }

        if mux.recent.contains(&id) {
            debug!(backend = %self.backend, id, "dropping frame for completed request");
            return Ok(());
        }

        Err(MorayError::Protocol(format!(
            "received {} frame for unknown request id {}",
            msg.method(),
            id
        )))
    }

    /// Records a fault. Only the first fault, and only while the connection
    /// has not been destroyed, changes the published state.
    fn record_fault(&self, source: FaultSource, err: MorayError) {
        let first = {
            let mut faults = self.faults();
            faults.push(err.clone());
            faults.len() == 1
        };

        if self.destroyed.load(Ordering::SeqCst) {
            debug!(backend = %self.backend, ?source, error = %err, "fault after destroy");
            return;
        }
        if !first {
            debug!(backend = %self.backend, ?source, error = %err, "additional fault");
            return;
        }

        warn!(backend = %self.backend, ?source, error = %err, "connection failed");
        self.fail_pending(&err);
        self.state.send_replace(ConnectionState::Failed(err));
    }

    fn fail_pending(&self, err: &MorayError) {
        let mut mux = self.mux();
        let ids: Vec<RequestId> = mux.pending.keys().copied().collect();
        for id in ids {
            if let Some(tx) = mux.retire(id) {
                let _ = tx.send(Delivery::Failed(err.clone()));
            }
        }
    }

    async fn read_loop(self: Arc<Self>, rd: OwnedReadHalf) {
        let mut rd = BufReader::new(rd);
        loop {
            match TcpTransport::read_frame(&mut rd).await {
                Ok(Some(msg)) => {
                    if let Err(fault) = self.dispatch(msg) {
                        self.record_fault(FaultSource::Protocol, fault);
                        return;
                    }
                }
                Ok(None) => {
                    self.record_fault(
                        FaultSource::Socket,
                        MorayError::ConnectionClosed(self.backend.key()),
                    );
                    return;
                }
                Err(err) if err.layer() == ErrorLayer::Protocol => {
                    self.record_fault(FaultSource::Protocol, err);
                    return;
                }
                Err(err) => {
                    self.record_fault(FaultSource::Socket, err);
                    return;
                }
            }
        }
    }
}

/// Resolves once the connection leaves the connected state.
async fn closed(mut state: watch::Receiver<ConnectionState>) {
    loop {
        if !matches!(*state.borrow_and_update(), ConnectionState::Connected) {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// A multiplexed RPC connection.
pub struct RpcConnection {
    shared: Arc<ConnShared>,
    reader: JoinHandle<()>,
}

impl RpcConnection {
    /// Connects to `backend` with TCP keep-alive enabled and starts the
    /// frame reader.
    ///
    /// `recent_requests` bounds how many completed request ids are
    /// remembered so late frames for them can be told apart from protocol
    /// violations.
    pub async fn connect(backend: &Backend, timeout: Duration, recent_requests: usize) -> Result<Self> {
        let stream = TcpTransport::connect(backend.socket_addr(), timeout).await?;
        debug!(backend = %backend, "connected");

        let (rd, wr) = stream.into_split();
        let (state, _) = watch::channel(ConnectionState::Connected);
        let shared = Arc::new(ConnShared {
            backend: backend.clone(),
            mux: Mutex::new(Multiplexer::new(recent_requests)),
            writer: tokio::sync::Mutex::new(Some(wr)),
            faults: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            state,
        });
        let reader = tokio::spawn(shared.clone().read_loop(rd));

        Ok(Self { shared, reader })
    }

    /// Every fault recorded on this connection, first one first.
    pub fn faults(&self) -> Vec<MorayError> {
        self.shared.faults().clone()
    }

    pub fn backend_key(&self) -> String {
        self.shared.backend.key()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.mux().pending.len()
    }

    /// Writes a request frame and returns the channel its response frames
    /// arrive on.
    pub(crate) async fn send(&self, method: &str, args: Vec<Value>) -> Result<PendingCall> {
        let (pending, frame) = self.register(method, args)?;
        self.write_request(pending.id, method, &frame).await?;
        Ok(pending)
    }

    /// Allocates an id for a new request and encodes its frame. Nothing is
    /// written yet.
    pub(crate) fn register(&self, method: &str, args: Vec<Value>) -> Result<(PendingCall, Vec<u8>)> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(MorayError::ConnectionClosed(self.shared.backend.key()));
        }
        if let Some(first) = self.shared.faults().first() {
            return Err(first.clone());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.mux().allocate(tx);

        match JsonCodec::encode_frame(&Message::request(id, method, args)) {
            Ok(frame) => Ok((PendingCall { id, rx }, frame)),
            Err(err) => {
                self.shared.mux().pending.remove(&id);
                Err(err)
            }
        }
    }

    /// Writes the frame of a registered request.
    ///
    /// Gives up as soon as the connection fails or is destroyed, so a write
    /// stuck on a peer that stopped reading never outlives the connection.
    pub(crate) async fn write_request(&self, id: RequestId, method: &str, frame: &[u8]) -> Result<()> {
        let write = async {
            let mut writer = self.shared.writer.lock().await;
            match writer.as_mut() {
                Some(wr) => TcpTransport::write_raw(wr, frame).await,
                None => Err(MorayError::ConnectionClosed(self.shared.backend.key())),
            }
        };
        let written = tokio::select! {
            written = write => written,
            _ = closed(self.shared.state.subscribe()) => {
                Err(MorayError::ConnectionClosed(self.shared.backend.key()))
            }
        };

        if let Err(err) = written {
            self.shared.mux().pending.remove(&id);
            if !matches!(err, MorayError::ConnectionClosed(_)) {
                self.shared.record_fault(FaultSource::Socket, err.clone());
            }
            return Err(err);
        }

        debug!(backend = %self.shared.backend, id, method, "request sent");
        Ok(())
    }

    /// Abandons a request whose frame may have been partially written.
    ///
    /// The byte stream can no longer be trusted, so the connection fails
    /// with `cause`.
    pub(crate) fn abandon_write(&self, id: RequestId, cause: MorayError) {
        self.shared.mux().retire(id);
        self.shared.record_fault(FaultSource::Socket, cause);
    }

    /// Stops tracking request `id`. The connection stays usable.
    pub(crate) fn abort(&self, id: RequestId) {
        if self.shared.mux().retire(id).is_some() {
            debug!(backend = %self.shared.backend, id, "request aborted");
        }
    }
}

impl PoolConnection for RpcConnection {
    fn backend(&self) -> &Backend {
        &self.shared.backend
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(backend = %self.shared.backend, "destroying connection");
        self.reader.abort();
        // Dropping the write half shuts down our side of the socket. A write
        // in flight holds the lock until it sees the state change below.
        match self.shared.writer.try_lock() {
            Ok(mut writer) => {
                writer.take();
            }
            Err(_) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let shared = self.shared.clone();
                    handle.spawn(async move {
                        shared.writer.lock().await.take();
                    });
                }
            }
        }
        self.shared
            .fail_pending(&MorayError::ConnectionClosed(self.shared.backend.key()));
        self.shared.state.send_replace(ConnectionState::Destroyed);
    }

    // No-op: open connections never keep the runtime alive on their own.
    fn ref_connection(&self) {}

    fn unref_connection(&self) {}
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Opens [`RpcConnection`]s for a pool.
#[derive(Debug, Clone)]
pub struct RpcConnector {
    recent_requests: usize,
    connect_timeout: Duration,
}

impl RpcConnector {
    pub fn new(recent_requests: usize) -> Self {
        Self {
            recent_requests,
            connect_timeout: Duration::from_secs(60),
        }
    }

    /// Upper bound on a single connect, independent of the pool's policy.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Connector for RpcConnector {
    type Connection = RpcConnection;

    fn connect<'a>(&'a self, backend: &'a Backend) -> BoxFuture<'a, Result<RpcConnection>> {
        RpcConnection::connect(backend, self.connect_timeout, self.recent_requests).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moray_common::MessageStatus;
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::net::{TcpListener, TcpStream};

    fn backend(addr: SocketAddr) -> Backend {
        Backend::new("test", addr.ip(), addr.port())
    }

    async fn connected_pair() -> (RpcConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let conn = RpcConnection::connect(&backend(addr), Duration::from_secs(2), 4)
            .await
            .unwrap();
        (conn, accept.await.unwrap())
    }

    #[tokio::test]
    async fn test_single_error_emission() {
        let (conn, _server) = connected_pair().await;
        let mut state = conn.state();

        conn.shared
            .record_fault(FaultSource::Protocol, MorayError::Protocol("bad frame".into()));
        conn.shared
            .record_fault(FaultSource::Socket, MorayError::transport("socket", "reset"));

        assert!(state.has_changed().unwrap());
        match &*state.borrow_and_update() {
            ConnectionState::Failed(MorayError::Protocol(msg)) => assert_eq!(msg, "bad frame"),
            other => panic!("unexpected state: {:?}", other),
        }
        assert!(!state.has_changed().unwrap());
        assert_eq!(conn.faults().len(), 2);
        assert!(!conn.is_usable());
    }

    #[tokio::test]
    async fn test_destroy_suppresses_errors() {
        let (conn, _server) = connected_pair().await;
        conn.destroy();
        conn.shared
            .record_fault(FaultSource::Socket, MorayError::transport("socket", "reset"));

        assert!(matches!(*conn.state().borrow(), ConnectionState::Destroyed));
        assert_eq!(conn.faults().len(), 1);
        assert!(conn.send("ping", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_peer_hangup_fails_pending_requests() {
        let (conn, server) = connected_pair().await;
        let mut call = conn.send("ping", vec![json!({})]).await.unwrap();
        drop(server);

        match call.rx.recv().await {
            Some(Delivery::Failed(err)) => assert_eq!(err.layer(), ErrorLayer::Transport),
            other => panic!("unexpected delivery: {:?}", other),
        }

        let mut state = conn.state();
        state
            .wait_for(|s| matches!(s, ConnectionState::Failed(_)))
            .await
            .unwrap();
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_frames_are_routed_by_id() {
        let (conn, mut server) = connected_pair().await;
        let mut first = conn.send("getObject", vec![json!("b"), json!("k")]).await.unwrap();
        let mut second = conn.send("ping", vec![]).await.unwrap();
        assert_ne!(first.id, second.id);

        let req = TcpTransport::read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(req.method(), "getObject");
        assert_eq!(req.data.d, json!(["b", "k"]));

        TcpTransport::write_frame(&mut server, &Message::end(second.id, "ping"))
            .await
            .unwrap();
        TcpTransport::write_frame(&mut server, &Message::data(first.id, "getObject", vec![json!(1)]))
            .await
            .unwrap();

        match second.rx.recv().await {
            Some(Delivery::Frame(msg)) => assert_eq!(msg.status, MessageStatus::End),
            other => panic!("unexpected delivery: {:?}", other),
        }
        match first.rx.recv().await {
            Some(Delivery::Frame(msg)) => assert_eq!(msg.into_payloads(), vec![json!(1)]),
            other => panic!("unexpected delivery: {:?}", other),
        }
        assert_eq!(conn.pending_requests(), 1);
    }

    #[tokio::test]
    async fn test_late_frames_dropped_unknown_ids_fatal() {
        let (conn, mut server) = connected_pair().await;
        let call = conn.send("ping", vec![]).await.unwrap();
        conn.abort(call.id);
        assert_eq!(conn.pending_requests(), 0);

        TcpTransport::write_frame(&mut server, &Message::end(call.id, "ping"))
            .await
            .unwrap();
        let live = conn.send("ping", vec![]).await.unwrap();
        TcpTransport::write_frame(&mut server, &Message::end(live.id, "ping"))
            .await
            .unwrap();
        let mut live_rx = live.rx;
        assert!(matches!(live_rx.recv().await, Some(Delivery::Frame(_))));
        assert!(conn.is_usable());

        TcpTransport::write_frame(&mut server, &Message::end(4242, "ping"))
            .await
            .unwrap();
        let mut state = conn.state();
        let failed = state
            .wait_for(|s| matches!(s, ConnectionState::Failed(_)))
            .await
            .unwrap()
            .clone();
        match failed {
            ConnectionState::Failed(err) => assert_eq!(err.layer(), ErrorLayer::Protocol),
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_id_then_hangup_fails_once() {
        let (conn, mut server) = connected_pair().await;
        let mut state = conn.state();
        let mut first = conn.send("getObject", vec![json!("b"), json!("k")]).await.unwrap();
        let mut second = conn.send("ping", vec![]).await.unwrap();

        TcpTransport::write_frame(&mut server, &Message::end(4242, "ping"))
            .await
            .unwrap();
        drop(server);

        for call in [&mut first, &mut second] {
            match call.rx.recv().await {
                Some(Delivery::Failed(err)) => assert_eq!(err.layer(), ErrorLayer::Protocol),
                other => panic!("unexpected delivery: {:?}", other),
            }
            assert!(call.rx.recv().await.is_none());
        }

        state.changed().await.unwrap();
        assert!(matches!(
            *state.borrow_and_update(),
            ConnectionState::Failed(MorayError::Protocol(_))
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!state.has_changed().unwrap());
        assert_eq!(conn.faults().len(), 1);
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_destroy_during_stalled_write() {
        // The peer never reads, so a large frame fills the socket buffers
        let (conn, _server) = connected_pair().await;
        let conn = Arc::new(conn);
        let blob = "x".repeat(32 << 20);
        let writer = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send("putObject", vec![json!(blob)]).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!writer.is_finished());

        conn.destroy();
        let written = tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(written, Err(MorayError::ConnectionClosed(_))));

        let mut closed = false;
        for _ in 0..100 {
            if conn.shared.writer.lock().await.is_none() {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(closed);
        assert_eq!(conn.pending_requests(), 0);
        assert!(conn.faults().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_write_fails_connection() {
        let (conn, _server) = connected_pair().await;
        let (pending, _frame) = conn.register("ping", vec![]).unwrap();
        conn.abandon_write(pending.id, MorayError::transport("writing request", "timed out"));

        assert_eq!(conn.pending_requests(), 0);
        assert!(!conn.is_usable());
        assert!(conn.send("ping", vec![]).await.is_err());
    }

    #[test]
    fn test_request_ids_wrap() {
        let mut mux = Multiplexer::new(2);
        mux.next_id = MAX_REQUEST_ID;
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(mux.allocate(tx.clone()), MAX_REQUEST_ID);
        assert_eq!(mux.allocate(tx.clone()), 1);

        mux.retire(1);
        mux.retire(MAX_REQUEST_ID);
        assert_eq!(mux.recent.len(), 2);
        let id = mux.allocate(tx);
        mux.retire(id);
        assert_eq!(mux.recent.len(), 2);
        assert!(!mux.recent.contains(&MAX_REQUEST_ID));
    }
}
