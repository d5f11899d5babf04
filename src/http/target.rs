//! Origin target resolution.
//!
//! The host to dial always comes from the Host header; the port comes from
//! the request-target authority and defaults to 80. The two are deliberately
//! taken from different places so an absolute-form request can reach an
//! arbitrary port while the Host header names the machine.

use std::fmt;

use thiserror::Error;

use crate::http::request::Request;

/// Port used when the request-target does not name one.
pub const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("request has no Host header")]
    MissingHost,

    #[error("invalid port `{0}` in request target")]
    InvalidPort(String),
}

/// Where a request is relayed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginTarget {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for OriginTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Derive the origin host and port for a parsed request.
pub fn resolve(request: &Request) -> Result<OriginTarget, ResolveError> {
    let host = request
        .host()
        .map(host_without_port)
        .filter(|host| !host.is_empty())
        .ok_or(ResolveError::MissingHost)?;

    let port = match request.target_port() {
        None => DEFAULT_PORT,
        Some(text) => parse_port(text)?,
    };

    Ok(OriginTarget {
        host: host.to_string(),
        port,
    })
}

/// Anything other than a port in 1..=65535 is fatal for the request.
fn parse_port(text: &str) -> Result<u16, ResolveError> {
    text.parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| ResolveError::InvalidPort(text.to_string()))
}

/// `example.org:8080` → `example.org`, `[::1]:80` → `::1`.
fn host_without_port(value: &str) -> &str {
    if let Some(bracketed) = value.strip_prefix('[') {
        return bracketed.split_once(']').map_or(bracketed, |(host, _)| host);
    }
    match value.split_once(':') {
        Some((host, _)) => host,
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::http::request::RequestParser;
    use tokio::io::BufReader;

    async fn request(raw: &str) -> Request {
        let mut reader = BufReader::new(raw.as_bytes());
        RequestParser::new(&LimitsConfig::default(), None)
            .parse(&mut reader)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn defaults_to_port_80() {
        let req = request("GET http://example.org/index.html HTTP/1.1\r\nHost: example.org\r\n\r\n").await;
        assert_eq!(
            resolve(&req).unwrap(),
            OriginTarget {
                host: "example.org".into(),
                port: 80
            }
        );
    }

    #[tokio::test]
    async fn port_from_target_host_from_header() {
        let req = request("GET http://portquiz.net:8080/ HTTP/1.1\r\nHost: portquiz.net:8080\r\n\r\n").await;
        let target = resolve(&req).unwrap();
        assert_eq!(target.host, "portquiz.net");
        assert_eq!(target.port, 8080);
        assert_eq!(target.to_string(), "portquiz.net:8080");
    }

    #[tokio::test]
    async fn host_header_port_is_not_used_for_dialing() {
        let req = request("GET /path HTTP/1.1\r\nHost: example.org:9999\r\n\r\n").await;
        assert_eq!(resolve(&req).unwrap().port, 80);
    }

    #[tokio::test]
    async fn missing_host_fails() {
        let req = request("GET http://example.org/ HTTP/1.1\r\n\r\n").await;
        assert_eq!(resolve(&req).unwrap_err(), ResolveError::MissingHost);
    }

    #[tokio::test]
    async fn non_numeric_port_fails() {
        let req = request("GET http://example.org:http/ HTTP/1.1\r\nHost: example.org\r\n\r\n").await;
        assert_eq!(
            resolve(&req).unwrap_err(),
            ResolveError::InvalidPort("http".into())
        );
    }

    #[tokio::test]
    async fn ipv6_host_header() {
        let req = request("GET http://[::1]:8081/ HTTP/1.1\r\nHost: [::1]:8081\r\n\r\n").await;
        let target = resolve(&req).unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.to_string(), "[::1]:8081");
    }
}
