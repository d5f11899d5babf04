//! Relay engine: origin dialing, request forwarding and response streaming.
//!
//! # Responsibilities
//! - Short-circuit GETs whose target is already cached
//! - Dial the origin under the connect deadline
//! - Forward the received header bytes verbatim (plus body and a trailing
//!   newline for POST)
//! - Stream the origin response to the client chunk by chunk until EOF,
//!   teeing GET responses into the cache
//!
//! # Design Decisions
//! - The origin response is never parsed; EOF ends it
//! - A cache failure drops the cache writer, never the relay
//! - A partially relayed or empty response is never committed to the cache
//! - The origin socket is owned here and closed before returning

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::cache::{CacheLookup, CacheStore, CacheWriter};
use crate::config::ProxyConfig;
use crate::http::{ErrorStatus, Method, OriginTarget, Request};
use crate::observability::metrics;
use crate::resilience::{with_timeout, TimeoutError};

/// Marker appended after a POST body.
const POST_BODY_TERMINATOR: &[u8] = b"\n";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("origin {target} unreachable: {source}")]
    Unreachable {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("connecting to origin {target} timed out")]
    ConnectTimeout { target: String },

    #[error("origin I/O failed after {relayed} bytes: {source}")]
    Origin {
        relayed: u64,
        #[source]
        source: io::Error,
    },

    #[error("origin stalled after {relayed} bytes: {source}")]
    OriginTimeout {
        relayed: u64,
        #[source]
        source: TimeoutError,
    },

    #[error("client I/O failed after {relayed} bytes: {source}")]
    Client {
        relayed: u64,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    /// Status to report, if the client has not received anything yet.
    pub fn status(&self) -> Option<ErrorStatus> {
        match self {
            RelayError::Unreachable { .. } => Some(ErrorStatus::BadGateway),
            RelayError::ConnectTimeout { .. } => Some(ErrorStatus::GatewayTimeout),
            RelayError::Origin { relayed: 0, .. } => Some(ErrorStatus::BadGateway),
            RelayError::OriginTimeout { relayed: 0, .. } => Some(ErrorStatus::GatewayTimeout),
            _ => None,
        }
    }

    /// Bytes already written to the client when the relay failed.
    pub fn relayed(&self) -> u64 {
        match self {
            RelayError::Unreachable { .. } | RelayError::ConnectTimeout { .. } => 0,
            RelayError::Origin { relayed, .. }
            | RelayError::OriginTimeout { relayed, .. }
            | RelayError::Client { relayed, .. } => *relayed,
        }
    }
}

/// How a successful relay was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Replayed from the cache without contacting the origin.
    CacheHit { bytes: u64 },
    /// GET relayed from the origin; `cached` if the response was stored.
    Fetched { bytes: u64, cached: bool },
    /// POST relayed from the origin.
    Posted { bytes: u64 },
}

impl RelayOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            RelayOutcome::CacheHit { bytes }
            | RelayOutcome::Fetched { bytes, .. }
            | RelayOutcome::Posted { bytes } => *bytes,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RelayOutcome::CacheHit { .. } => "cache_hit",
            RelayOutcome::Fetched { .. } => "fetched",
            RelayOutcome::Posted { .. } => "posted",
        }
    }
}

/// Relays one parsed request per call. Shared by all connection tasks.
#[derive(Debug, Clone)]
pub struct RelayEngine {
    cache: Option<CacheStore>,
    chunk_size: usize,
    connect_timeout: Option<Duration>,
    origin_read_timeout: Option<Duration>,
}

impl RelayEngine {
    pub fn new(
        cache: Option<CacheStore>,
        chunk_size: usize,
        connect_timeout: Option<Duration>,
        origin_read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            cache,
            chunk_size: chunk_size.max(1),
            connect_timeout,
            origin_read_timeout,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        let cache = config
            .cache
            .enabled
            .then(|| CacheStore::new(config.cache.directory.clone()));
        Self::new(
            cache,
            config.relay.chunk_size,
            config.timeouts.connect(),
            config.timeouts.origin_read(),
        )
    }

    pub fn cache(&self) -> Option<&CacheStore> {
        self.cache.as_ref()
    }

    /// Serve `request` to `client` from the cache or from `target`.
    pub async fn relay<W>(
        &self,
        request: &Request,
        target: &OriginTarget,
        client: &mut W,
    ) -> Result<RelayOutcome, RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        match request.method() {
            Method::Get => self.relay_get(request, target, client).await,
            Method::Post => self.relay_post(request, target, client).await,
        }
    }

    async fn relay_get<W>(
        &self,
        request: &Request,
        target: &OriginTarget,
        client: &mut W,
    ) -> Result<RelayOutcome, RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        let writer = match &self.cache {
            Some(cache) => match cache.open_or_reserve(request.target()).await {
                CacheLookup::Hit(cached) => {
                    tracing::info!(
                        target_uri = %request.target(),
                        bytes = cached.len(),
                        "Cache hit, replaying stored response"
                    );
                    let bytes = cached
                        .replay(client, self.chunk_size)
                        .await
                        .map_err(|e| RelayError::Client {
                            relayed: e.copied,
                            source: e.source,
                        })?;
                    metrics::record_bytes_relayed("cache", bytes);
                    return Ok(RelayOutcome::CacheHit { bytes });
                }
                CacheLookup::Miss(writer) => {
                    tracing::info!(
                        target_uri = %request.target(),
                        caching = writer.is_some(),
                        "Cache miss, fetching from origin"
                    );
                    writer
                }
            },
            None => None,
        };

        let mut origin = self.dial(target).await?;
        send_request(&mut origin, request.raw_header(), None).await?;
        let (bytes, cached) = self.stream_response(&mut origin, client, writer).await?;
        close_origin(origin).await;

        Ok(RelayOutcome::Fetched { bytes, cached })
    }

    async fn relay_post<W>(
        &self,
        request: &Request,
        target: &OriginTarget,
        client: &mut W,
    ) -> Result<RelayOutcome, RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut origin = self.dial(target).await?;
        send_request(&mut origin, request.raw_header(), Some(request.body())).await?;
        tracing::debug!(body_bytes = request.body().len(), "POST forwarded to origin");

        let (bytes, _) = self.stream_response(&mut origin, client, None).await?;
        close_origin(origin).await;

        Ok(RelayOutcome::Posted { bytes })
    }

    async fn dial(&self, target: &OriginTarget) -> Result<TcpStream, RelayError> {
        tracing::info!(host = %target.host, port = target.port, "Connecting to origin");

        let connect = TcpStream::connect((target.host.as_str(), target.port));
        match with_timeout(self.connect_timeout, "origin connect", connect).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::trace!(error = %e, "Could not set TCP_NODELAY on origin socket");
                }
                tracing::debug!(origin = %target, "Connected to origin");
                Ok(stream)
            }
            Ok(Err(source)) => {
                metrics::record_upstream_error("unreachable");
                Err(RelayError::Unreachable {
                    target: target.to_string(),
                    source,
                })
            }
            Err(_) => {
                metrics::record_upstream_error("connect_timeout");
                Err(RelayError::ConnectTimeout {
                    target: target.to_string(),
                })
            }
        }
    }

    /// Copy the origin response to the client until EOF, teeing into `writer`.
    /// Returns the byte count and whether the response was committed to the cache.
    async fn stream_response<R, W>(
        &self,
        origin: &mut R,
        client: &mut W,
        mut writer: Option<CacheWriter>,
    ) -> Result<(u64, bool), RelayError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.chunk_size];
        let mut relayed = 0u64;

        loop {
            let n = match with_timeout(self.origin_read_timeout, "origin read", origin.read(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(source)) => {
                    metrics::record_upstream_error("read");
                    return Err(RelayError::Origin { relayed, source });
                }
                Err(source) => {
                    metrics::record_upstream_error("read_timeout");
                    return Err(RelayError::OriginTimeout { relayed, source });
                }
            };
            if n == 0 {
                break;
            }
            let chunk = &buf[..n];

            let cache_failure = match writer.as_mut() {
                Some(w) => w.write(chunk).await.err(),
                None => None,
            };
            if let Some(e) = cache_failure {
                tracing::warn!(error = %e, "Cache write failed, continuing without caching");
                writer = None;
            }

            client
                .write_all(chunk)
                .await
                .map_err(|source| RelayError::Client { relayed, source })?;
            relayed += n as u64;
        }

        client
            .flush()
            .await
            .map_err(|source| RelayError::Client { relayed, source })?;
        metrics::record_bytes_relayed("origin", relayed);

        let cached = match writer {
            Some(w) if relayed == 0 => {
                tracing::warn!("Origin closed without a response, not caching");
                drop(w);
                false
            }
            Some(w) => match w.commit().await {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "Cache commit failed, response not stored");
                    false
                }
            },
            None => false,
        };

        tracing::debug!(bytes = relayed, cached, "Origin response relayed");
        Ok((relayed, cached))
    }
}

async fn send_request<W>(origin: &mut W, header: &[u8], body: Option<&[u8]>) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    let sent = async {
        origin.write_all(header).await?;
        if let Some(body) = body {
            origin.write_all(body).await?;
            origin.write_all(POST_BODY_TERMINATOR).await?;
        }
        origin.flush().await
    }
    .await;

    sent.map_err(|source| {
        metrics::record_upstream_error("write");
        RelayError::Origin { relayed: 0, source }
    })
}

async fn close_origin(mut origin: TcpStream) {
    if let Err(e) = origin.shutdown().await {
        tracing::trace!(error = %e, "Origin shutdown failed");
    }
}
