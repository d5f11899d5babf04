//! Synthetic responses written by the proxy itself.
//!
//! Origin responses are never touched; these are only sent when a request
//! fails before any origin bytes reached the client.

/// Statuses the proxy may answer with on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    BadRequest,
    RequestTimeout,
    PayloadTooLarge,
    HeaderFieldsTooLarge,
    NotImplemented,
    BadGateway,
    GatewayTimeout,
}

impl ErrorStatus {
    pub fn code(&self) -> u16 {
        match self {
            ErrorStatus::BadRequest => 400,
            ErrorStatus::RequestTimeout => 408,
            ErrorStatus::PayloadTooLarge => 413,
            ErrorStatus::HeaderFieldsTooLarge => 431,
            ErrorStatus::NotImplemented => 501,
            ErrorStatus::BadGateway => 502,
            ErrorStatus::GatewayTimeout => 504,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ErrorStatus::BadRequest => "Bad Request",
            ErrorStatus::RequestTimeout => "Request Timeout",
            ErrorStatus::PayloadTooLarge => "Payload Too Large",
            ErrorStatus::HeaderFieldsTooLarge => "Request Header Fields Too Large",
            ErrorStatus::NotImplemented => "Not Implemented",
            ErrorStatus::BadGateway => "Bad Gateway",
            ErrorStatus::GatewayTimeout => "Gateway Timeout",
        }
    }

    /// Complete `Connection: close` response with a plain-text body.
    pub fn to_response(&self, detail: &str) -> Vec<u8> {
        let body = format!("{} {}: {}\n", self.code(), self.reason(), detail);
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.code(),
            self.reason(),
            body.len(),
            body
        )
        .into_bytes()
    }
}
