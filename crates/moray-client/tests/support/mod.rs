//! Scripted in-process Moray server used by the integration tests.

#![allow(dead_code)]

use moray_client::{ClientOptions, Defaults, MorayClient, PoolConfig};
use moray_common::transport::TcpTransport;
use moray_common::{Message, RemoteError};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// What the fake server does with one request.
pub enum Reply {
    /// One data frame per record, then `end`
    Records(Vec<Value>),
    /// An `error` frame carrying the remote error
    Error(RemoteError),
    /// Never answer
    Hang,
    /// Close the connection without answering
    Disconnect,
    /// Answer under a request id that was never issued, then close
    UnknownId,
}

type Handler = Arc<dyn Fn(&str, &[Value]) -> Reply + Send + Sync>;
type CallLog = Arc<Mutex<Vec<(String, Vec<Value>)>>>;

pub struct FakeServer {
    pub addr: SocketAddr,
    calls: CallLog,
    accept: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler: Handler = Arc::new(handler);
        let calls: CallLog = Arc::new(Mutex::new(Vec::new()));

        let log = calls.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, handler.clone(), log.clone()));
            }
        });

        Self {
            addr,
            calls,
            accept,
        }
    }

    /// Number of requests received for `method`.
    pub fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    /// Arguments of the most recent request for `method`.
    pub fn last_args(&self, method: &str) -> Option<Vec<Value>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(m, _)| m == method)
            .map(|(_, args)| args.clone())
    }
}

/// Accepts connections and never reads from them.
pub struct SilentServer {
    pub addr: SocketAddr,
    accept: JoinHandle<()>,
}

impl SilentServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        Self { addr, accept }
    }
}

impl Drop for SilentServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn serve_connection(stream: TcpStream, handler: Handler, calls: CallLog) {
    let (rd, mut wr) = stream.into_split();
    let mut rd = BufReader::new(rd);

    while let Ok(Some(request)) = TcpTransport::read_frame(&mut rd).await {
        let method = request.method().to_string();
        let id = request.id;
        let args = request.into_payloads();
        calls.lock().unwrap().push((method.clone(), args.clone()));

        let frames = match handler(&method, &args) {
            Reply::Records(records) => {
                let mut frames: Vec<Message> = records
                    .into_iter()
                    .map(|record| Message::data(id, &method, vec![record]))
                    .collect();
                frames.push(Message::end(id, &method));
                frames
            }
            Reply::Error(err) => vec![Message::error(id, &method, &err)],
            Reply::Hang => Vec::new(),
            Reply::Disconnect => return,
            Reply::UnknownId => {
                let _ = TcpTransport::write_frame(&mut wr, &Message::end(id + 1_000_000, &method)).await;
                return;
            }
        };

        for frame in frames {
            if TcpTransport::write_frame(&mut wr, &frame).await.is_err() {
                return;
            }
        }
    }
}

/// A bucket record the way the server encodes it.
pub fn bucket_record(name: &str, version: u64) -> Value {
    json!({
        "name": name,
        "index": r#"{"email":{"type":"string","unique":true}}"#,
        "pre": "[]",
        "post": "[]",
        "options": format!(r#"{{"version":{}}}"#, version),
        "mtime": "2024-01-15T08:00:00.000Z"
    })
}

pub fn remote(name: &str, message: &str) -> Reply {
    Reply::Error(RemoteError::new(name, message))
}

/// Connects a client to `server` and waits until it is usable.
pub async fn connect(server: &FakeServer) -> MorayClient {
    connect_with(server, |options| options).await
}

pub async fn connect_with<F>(server: &FakeServer, customize: F) -> MorayClient
where
    F: FnOnce(ClientOptions) -> ClientOptions,
{
    connect_port(server.addr.port(), customize).await
}

/// Connects a client to whatever listens on `port` on the loopback address.
pub async fn connect_port<F>(port: u16, customize: F) -> MorayClient
where
    F: FnOnce(ClientOptions) -> ClientOptions,
{
    let config = PoolConfig::new("127.0.0.1", port, &Defaults::HISTORICAL).unwrap();
    let client = MorayClient::new(customize(ClientOptions::from_pool_config(config))).unwrap();
    tokio::time::timeout(Duration::from_secs(5), client.wait_connected())
        .await
        .expect("client did not connect in time")
        .unwrap();
    client
}

/// Waits until the client has no outstanding claims.
pub async fn settle(client: &MorayClient) {
    for _ in 0..100 {
        if client.outstanding_claims() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("claims still outstanding: {}", client.outstanding_claims());
}

/// Waits until the pool holds at least `count` idle connections.
pub async fn wait_idle(client: &MorayClient, count: usize) {
    for _ in 0..200 {
        if client.pool_stats().idle >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pool never reached {} idle connections: {:?}", count, client.pool_stats());
}
