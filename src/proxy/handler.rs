//! Per-connection request handling.
//!
//! # Responsibilities
//! - Own the client socket for the lifetime of one request
//! - Run parser → resolver → relay engine in order
//! - Turn failures into an error response when nothing was sent yet
//! - Log and swallow every error; close the socket on every path

use std::net::SocketAddr;
use std::time::Instant;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::ProxyConfig;
use crate::http::{resolve, ErrorStatus, OriginTarget, ParseError, RequestParser, ResolveError};
use crate::observability::metrics;
use crate::proxy::relay::{RelayEngine, RelayError, RelayOutcome};

/// Why a connection ended without a complete relay.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl HandlerError {
    /// Status to send the client, if a response is still possible.
    pub fn status(&self) -> Option<ErrorStatus> {
        match self {
            HandlerError::Parse(e) => match e {
                ParseError::ConnectionClosed | ParseError::Io(_) => None,
                ParseError::Timeout(_) => Some(ErrorStatus::RequestTimeout),
                ParseError::HeaderTooLarge { .. } => Some(ErrorStatus::HeaderFieldsTooLarge),
                ParseError::BodyTooLarge { .. } => Some(ErrorStatus::PayloadTooLarge),
                ParseError::UnsupportedMethod(_) => Some(ErrorStatus::NotImplemented),
                ParseError::PrematureEof
                | ParseError::MalformedRequestLine(_)
                | ParseError::InvalidContentLength(_) => Some(ErrorStatus::BadRequest),
            },
            HandlerError::Resolve(_) => Some(ErrorStatus::BadRequest),
            HandlerError::Relay(e) => e.status(),
        }
    }

    /// Fixed text for the error response body. Never echoes request bytes.
    fn client_detail(&self) -> &'static str {
        match self {
            HandlerError::Parse(e) => match e {
                ParseError::Timeout(_) => "timed out waiting for the request",
                ParseError::HeaderTooLarge { .. } => "request header block too large",
                ParseError::BodyTooLarge { .. } => "request body too large",
                ParseError::UnsupportedMethod(_) => "only GET and POST are supported",
                ParseError::InvalidContentLength(_) => "invalid Content-Length",
                ParseError::MalformedRequestLine(_) => "malformed request line",
                ParseError::PrematureEof
                | ParseError::ConnectionClosed
                | ParseError::Io(_) => "incomplete request",
            },
            HandlerError::Resolve(ResolveError::MissingHost) => "request has no Host header",
            HandlerError::Resolve(ResolveError::InvalidPort(_)) => "invalid port in request target",
            HandlerError::Relay(RelayError::ConnectTimeout { .. })
            | HandlerError::Relay(RelayError::OriginTimeout { .. }) => "origin did not respond in time",
            HandlerError::Relay(_) => "cannot reach origin",
        }
    }

    fn outcome_label(&self) -> &'static str {
        match self {
            HandlerError::Parse(ParseError::ConnectionClosed) => "closed",
            HandlerError::Parse(_) => "bad_request",
            HandlerError::Resolve(_) => "bad_target",
            HandlerError::Relay(RelayError::Client { .. }) => "client_error",
            HandlerError::Relay(_) => "upstream_error",
        }
    }
}

/// Summary of a successfully served request.
#[derive(Debug, Clone)]
pub struct Served {
    pub method: &'static str,
    pub target_uri: String,
    pub origin: OriginTarget,
    pub outcome: RelayOutcome,
}

/// Drives one client connection through the relay pipeline.
#[derive(Debug)]
pub struct ConnectionHandler {
    parser: RequestParser,
    engine: RelayEngine,
    error_responses: bool,
}

impl ConnectionHandler {
    pub fn new(parser: RequestParser, engine: RelayEngine, error_responses: bool) -> Self {
        Self {
            parser,
            engine,
            error_responses,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(
            RequestParser::new(&config.limits, config.timeouts.client_read()),
            RelayEngine::from_config(config),
            config.relay.error_responses,
        )
    }

    pub fn engine(&self) -> &RelayEngine {
        &self.engine
    }

    /// Serve a client socket; both halves are closed when this returns.
    pub async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        tracing::debug!(peer = %peer, "Handling connection");
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        self.handle_stream(&mut reader, &mut write_half).await;
    }

    /// Run the pipeline over any reader/writer pair. Never fails: errors are
    /// reported to the client where possible, logged, and dropped.
    pub async fn handle_stream<R, W>(&self, reader: &mut R, writer: &mut W)
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let start = Instant::now();
        let mut method = "unknown";

        match self.serve(reader, writer, &mut method).await {
            Ok(served) => {
                tracing::info!(
                    method = served.method,
                    target_uri = %served.target_uri,
                    origin = %served.origin,
                    outcome = served.outcome.label(),
                    bytes = served.outcome.bytes(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Request completed"
                );
                metrics::record_request(method, served.outcome.label(), start);
            }
            Err(err) => {
                self.report(&err, writer).await;
                metrics::record_request(method, err.outcome_label(), start);
            }
        }

        if let Err(e) = writer.shutdown().await {
            tracing::trace!(error = %e, "Client shutdown failed");
        }
    }

    async fn serve<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        method: &mut &'static str,
    ) -> Result<Served, HandlerError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let request = self.parser.parse(reader).await?;
        *method = request.method().as_str();
        tracing::info!(
            method = %request.method(),
            target_uri = %request.target(),
            version = %request.version(),
            "Request received"
        );

        let origin = resolve(&request)?;
        let outcome = self.engine.relay(&request, &origin, writer).await?;

        Ok(Served {
            method: request.method().as_str(),
            target_uri: request.target().to_string(),
            origin,
            outcome,
        })
    }

    async fn report<W>(&self, err: &HandlerError, writer: &mut W)
    where
        W: AsyncWrite + Unpin,
    {
        match err {
            HandlerError::Parse(ParseError::ConnectionClosed) => {
                tracing::debug!("Client closed without sending a request");
            }
            HandlerError::Relay(
                e @ (RelayError::Unreachable { .. } | RelayError::ConnectTimeout { .. }),
            ) => {
                tracing::error!(error = %e, "Error 502: cannot reach origin");
            }
            HandlerError::Relay(e) => {
                tracing::warn!(error = %e, relayed = e.relayed(), "Relay aborted");
            }
            other => {
                tracing::warn!(error = %other, "Rejected request");
            }
        }

        let Some(status) = err.status().filter(|_| self.error_responses) else {
            return;
        };
        let response = status.to_response(err.client_detail());
        if let Err(e) = writer.write_all(&response).await {
            tracing::debug!(error = %e, "Could not deliver error response");
            return;
        }
        if let Err(e) = writer.flush().await {
            tracing::debug!(error = %e, "Could not flush error response");
        }
    }
}
