//! Shared utilities for integration tests: a scriptable origin and a proxy
//! bound to an ephemeral port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use forward_proxy::config::ProxyConfig;
use forward_proxy::net::Listener;
use forward_proxy::{ProxyServer, Shutdown};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// How the mock origin answers.
#[derive(Clone)]
pub enum Reply {
    /// `200 OK` with this body.
    Body(Vec<u8>),
    /// `200 OK` whose body is the request bytes the origin received.
    Echo,
}

/// Origin server that records every request it sees.
pub struct MockOrigin {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockOrigin {
    pub async fn start(reply: Reply) -> Self {
        Self::start_with_delay(reply, Duration::ZERO).await
    }

    /// Like [`start`](Self::start), but waits `delay` before answering.
    pub async fn start_with_delay(reply: Reply, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let (acc, reqs) = (accepted.clone(), requests.clone());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                acc.fetch_add(1, Ordering::SeqCst);
                let reqs = reqs.clone();
                let reply = reply.clone();
                tokio::spawn(async move {
                    let Some((socket, received)) = read_request(socket).await else {
                        return;
                    };
                    reqs.lock().unwrap().push(received.clone());
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let body = match reply {
                        Reply::Body(body) => body,
                        Reply::Echo => received,
                    };
                    let mut socket = socket;
                    let _ = socket.write_all(&ok_response(&body)).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self {
            addr,
            accepted,
            requests,
        }
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }

    /// Absolute-form URL for `path` on this origin.
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.addr.port(), path)
    }
}

/// Full response the mock origin sends for `body`.
pub fn ok_response(body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

/// Read one forwarded request: the header block, and for POST the declared
/// body plus the trailing newline the proxy appends.
async fn read_request(socket: TcpStream) -> Option<(TcpStream, Vec<u8>)> {
    let mut reader = BufReader::new(socket);
    let mut received = Vec::new();
    let mut content_length = 0usize;

    loop {
        let start = received.len();
        if reader.read_until(b'\n', &mut received).await.ok()? == 0 {
            return None;
        }
        let line = String::from_utf8_lossy(&received[start..]).to_string();
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    if received.starts_with(b"POST") {
        let mut body = vec![0u8; content_length + 1];
        reader.read_exact(&mut body).await.ok()?;
        received.extend_from_slice(&body);
    }
    Some((reader.into_inner(), received))
}

/// A proxy serving on an ephemeral loopback port.
pub struct RunningProxy {
    pub addr: SocketAddr,
    shutdown: Shutdown,
    task: JoinHandle<()>,
}

impl RunningProxy {
    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = self.task.await;
    }
}

pub async fn start_proxy(config: ProxyConfig) -> RunningProxy {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener = Listener::from_tcp(tcp, config.listener.max_connections);
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    let server = ProxyServer::new(config);
    let task = tokio::spawn(async move {
        server.run(listener, receiver).await.unwrap();
    });

    RunningProxy {
        addr,
        shutdown,
        task,
    }
}

/// Proxy config caching into `cache_dir`, with short timeouts for tests.
pub fn test_config(cache_dir: &std::path::Path) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.cache.directory = cache_dir.to_path_buf();
    config.timeouts.connect_secs = 2;
    config.timeouts.client_read_secs = 5;
    config.timeouts.origin_read_secs = 5;
    config.timeouts.shutdown_grace_secs = 1;
    config
}

/// Send `request` over a fresh connection and read until the proxy closes.
pub async fn send_raw(proxy: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .expect("proxy did not close the connection")
        .unwrap();
    response
}

/// Files in `dir`, sorted by name.
pub fn cache_files(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
