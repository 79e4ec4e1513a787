//! Coordination server
//!
//! A TCP accept loop feeding every decoded request through one mutex-held
//! registry, which makes each operation atomic and the whole service
//! linearizable. Contended acquires answer `retry`; callers poll.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordination::protocol::{decode, encode, ErrorKind, Request, Response};
use crate::coordination::state::{parse_resource_file, CoordinationState};

/// How long a registered caller may stay silent before its resources are
/// forcibly released.
pub const DEFAULT_LIVENESS: Duration = Duration::from_secs(30);

type SharedState = Arc<Mutex<CoordinationState>>;

/// Handle to a running coordination server.
pub struct CoordinationServer {
    addr: SocketAddr,
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl CoordinationServer {
    /// Bind and start serving. Port 0 picks a free port; the actual
    /// address is available from [`CoordinationServer::addr`].
    pub async fn start(
        host: &str,
        port: u16,
        resource_file: Option<&Path>,
        liveness: Duration,
    ) -> Result<Self> {
        let sets = match resource_file {
            Some(path) if path.is_file() => {
                let text = std::fs::read_to_string(path).with_context(|| {
                    format!("failed to read resource file {}", path.display())
                })?;
                parse_resource_file(&text)
            }
            Some(path) => {
                warn!(
                    "resource file {} does not exist; tests acquiring value sets may fail or wait forever",
                    path.display()
                );
                Vec::new()
            }
            None => Vec::new(),
        };

        let state: SharedState = Arc::new(Mutex::new(CoordinationState::with_value_sets(sets)));
        let listener = TcpListener::bind((host, port))
            .await
            .with_context(|| format!("failed to bind coordination server to {host}:{port}"))?;
        let addr = listener.local_addr()?;
        let stop = Arc::new(Notify::new());
        let handle = tokio::spawn(serve(listener, state, stop.clone(), liveness));
        info!("coordination server listening on {addr}");
        Ok(Self { addr, stop, handle })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// URI advertised to workers through the environment.
    pub fn uri(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting connections and wait for the accept loop to end.
    pub async fn stop(self) {
        self.stop.notify_one();
        if let Err(err) = self.handle.await {
            warn!("coordination server task ended abnormally: {err}");
        }
        info!("coordination server stopped");
    }
}

async fn serve(listener: TcpListener, state: SharedState, stop: Arc<Notify>, liveness: Duration) {
    let mut reaper = tokio::time::interval(liveness.max(Duration::from_millis(100)) / 2);
    loop {
        tokio::select! {
            _ = stop.notified() => break,
            _ = reaper.tick() => {
                state.lock().await.reap_dead_callers(liveness);
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("coordination connection from {peer}");
                    tokio::spawn(handle_connection(stream, state.clone(), stop.clone()));
                }
                Err(err) => warn!("accept failed: {err}"),
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, state: SharedState, stop: Arc<Notify>) {
    let (read, write) = stream.into_split();
    let mut write = write;
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                debug!("coordination connection read failed: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let (response, shutdown) = match decode::<Request>(&line) {
            Ok(request) => {
                let shutdown = matches!(request, Request::Stop);
                (apply(&state, request).await, shutdown)
            }
            Err(err) => (
                Response::error(ErrorKind::Malformed, err.to_string()),
                false,
            ),
        };
        if write_line(&mut write, &response).await.is_err() {
            break;
        }
        if shutdown {
            stop.notify_one();
            break;
        }
    }
}

async fn write_line(write: &mut OwnedWriteHalf, response: &Response) -> std::io::Result<()> {
    let mut line = encode(response);
    line.push('\n');
    write.write_all(line.as_bytes()).await?;
    write.flush().await
}

async fn apply(state: &SharedState, request: Request) -> Response {
    let mut state = state.lock().await;
    if let Some(caller) = request_caller(&request) {
        state.touch(caller);
    }
    match request {
        Request::Register { .. } | Request::Ping { .. } => Response::Ok,
        Request::Deregister { caller } => state.deregister(&caller),
        Request::AcquireLock { name, caller } => state.acquire_lock(&name, &caller),
        Request::ReleaseLock { name, caller } => state.release_lock(&name, &caller),
        Request::SetParallelValue { key, value } => state.set_parallel_value(&key, &value),
        Request::GetParallelValue { key } => state.get_parallel_value(&key),
        Request::AcquireValueSet { caller, tag } => {
            state.acquire_value_set(&caller, tag.as_deref())
        }
        Request::GetValueFromSet { key, caller } => state.get_value_from_set(&key, &caller),
        Request::ReleaseValueSet { caller } => state.release_value_set(&caller),
        Request::AddValueSet { name, values } => state.add_value_set(&name, &values),
        Request::RunOnlyOnce { id, caller } => state.run_only_once(&id, &caller),
        Request::RunOnceComplete { id, caller, passed } => {
            state.run_once_complete(&id, &caller, passed)
        }
        Request::Stop => Response::Ok,
    }
}

fn request_caller(request: &Request) -> Option<&str> {
    match request {
        Request::Register { caller }
        | Request::Ping { caller }
        | Request::AcquireLock { caller, .. }
        | Request::ReleaseLock { caller, .. }
        | Request::AcquireValueSet { caller, .. }
        | Request::GetValueFromSet { caller, .. }
        | Request::ReleaseValueSet { caller }
        | Request::RunOnlyOnce { caller, .. }
        | Request::RunOnceComplete { caller, .. } => Some(caller),
        Request::Deregister { .. }
        | Request::SetParallelValue { .. }
        | Request::GetParallelValue { .. }
        | Request::AddValueSet { .. }
        | Request::Stop => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::client::CoordinationClient;
    use std::io::Write as _;

    async fn start_server(resource: Option<&str>) -> CoordinationServer {
        let file = resource.map(|content| {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(content.as_bytes()).unwrap();
            file
        });
        let server = CoordinationServer::start(
            "127.0.0.1",
            0,
            file.as_ref().map(|f| f.path()),
            DEFAULT_LIVENESS,
        )
        .await
        .unwrap();
        // The temp file may be dropped now; the server has read it.
        drop(file);
        server
    }

    #[tokio::test]
    async fn lock_contention_across_connections() {
        let server = start_server(None).await;
        let mut a = CoordinationClient::connect(server.addr()).await.unwrap();
        let mut b = CoordinationClient::connect(server.addr()).await.unwrap();

        assert_eq!(a.acquire_lock_once("db", "a").await.unwrap(), Response::Ok);
        assert_eq!(b.acquire_lock_once("db", "b").await.unwrap(), Response::Retry);
        assert_eq!(a.release_lock("db", "a").await.unwrap(), Response::Ok);
        assert_eq!(b.acquire_lock_once("db", "b").await.unwrap(), Response::Ok);

        server.stop().await;
    }

    #[tokio::test]
    async fn value_set_pool_serves_two_and_rejects_third() {
        let resource = "[S1]\ntags=admin\nHOST=h1\n\n[S2]\ntags=admin\nHOST=h2\n";
        let server = start_server(Some(resource)).await;
        let mut w1 = CoordinationClient::connect(server.addr()).await.unwrap();
        let mut w2 = CoordinationClient::connect(server.addr()).await.unwrap();
        let mut w3 = CoordinationClient::connect(server.addr()).await.unwrap();

        let s1 = w1.acquire_value_set("w1", Some("admin")).await.unwrap();
        let s2 = w2.acquire_value_set("w2", Some("admin")).await.unwrap();
        assert_ne!(s1, s2);

        let denied = w3
            .call(&Request::AcquireValueSet {
                caller: "w3".to_string(),
                tag: Some("admin".to_string()),
            })
            .await
            .unwrap();
        assert!(matches!(
            denied,
            Response::Error {
                kind: ErrorKind::NoValueSetAvailable,
                ..
            }
        ));

        // Hosts are distinct because the sets are distinct.
        let h1 = w1.get_value_from_set("host", "w1").await.unwrap();
        let h2 = w2.get_value_from_set("host", "w2").await.unwrap();
        assert_ne!(h1, h2);

        w1.release_value_set("w1").await.unwrap();
        let s3 = w3.acquire_value_set("w3", Some("admin")).await.unwrap();
        assert_eq!(s3, s1);

        server.stop().await;
    }

    #[tokio::test]
    async fn run_once_is_granted_to_exactly_one_caller() {
        let server = start_server(None).await;
        let mut a = CoordinationClient::connect(server.addr()).await.unwrap();
        let mut b = CoordinationClient::connect(server.addr()).await.unwrap();

        let first = a
            .call(&Request::RunOnlyOnce {
                id: "setup".to_string(),
                caller: "a".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(first, Response::value("first"));

        let pending = b
            .call(&Request::RunOnlyOnce {
                id: "setup".to_string(),
                caller: "b".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(pending, Response::Retry);

        a.call(&Request::RunOnceComplete {
            id: "setup".to_string(),
            caller: "a".to_string(),
            passed: true,
        })
        .await
        .unwrap();

        let second = b
            .call(&Request::RunOnlyOnce {
                id: "setup".to_string(),
                caller: "b".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(second, Response::value("already"));

        server.stop().await;
    }

    #[tokio::test]
    async fn deregister_frees_lease_for_other_callers() {
        let resource = "[Only]\ntags=t\nK=V\n";
        let server = start_server(Some(resource)).await;
        let mut a = CoordinationClient::connect(server.addr()).await.unwrap();
        let mut b = CoordinationClient::connect(server.addr()).await.unwrap();

        a.acquire_value_set("a", Some("t")).await.unwrap();
        a.call(&Request::Deregister {
            caller: "a".to_string(),
        })
        .await
        .unwrap();

        let set = b.acquire_value_set("b", Some("t")).await.unwrap();
        assert_eq!(set, "Only");

        server.stop().await;
    }

    #[tokio::test]
    async fn malformed_requests_get_an_error_response() {
        let server = start_server(None).await;
        let mut client = CoordinationClient::connect(server.addr()).await.unwrap();
        let response = client.call_raw("this is not json").await.unwrap();
        assert!(matches!(
            response,
            Response::Error {
                kind: ErrorKind::Malformed,
                ..
            }
        ));
        server.stop().await;
    }
}
