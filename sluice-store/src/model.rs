use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_codec::{CodecError, decode_body};
use sluice_net::{
    Header, ParseError, Request, Response, join_authority, parse_request, parse_response,
    split_authority,
};
use uuid::Uuid;

/// Where a transaction came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    #[default]
    Browser,
    Scripted,
    Other(String),
}

/// A captured request. The dump is the only stored form; every other view is
/// parsed from it on access, so editing the dump is always enough.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpRequest {
    /// Authority the request is sent to, `host` or `host:port`.
    pub host: String,
    pub dump: Vec<u8>,
    pub tls: bool,
}

impl HttpRequest {
    pub fn new(host: impl Into<String>, dump: impl Into<Vec<u8>>, tls: bool) -> Self {
        Self {
            host: host.into(),
            dump: dump.into(),
            tls,
        }
    }

    pub fn parse(&self) -> Result<Request, ParseError> {
        parse_request(&self.dump)
    }

    pub fn method(&self) -> Option<String> {
        self.parse().ok().map(|request| request.line.method)
    }

    /// The request target as written on the start line.
    pub fn target(&self) -> Option<String> {
        self.parse().ok().map(|request| request.line.target)
    }

    pub fn url(&self) -> Option<String> {
        let target = self.target()?;
        if target.starts_with("http://") || target.starts_with("https://") {
            return Some(target);
        }
        let scheme = self.scheme();
        let default_port = if self.tls { 443 } else { 80 };
        let (host, port) = split_authority(&self.host);
        let authority = join_authority(host, port.unwrap_or(default_port), default_port);
        Some(format!("{scheme}://{authority}{target}"))
    }

    pub fn headers(&self) -> Vec<Header> {
        self.parse()
            .map(|request| request.headers)
            .unwrap_or_default()
    }

    pub fn body(&self) -> Vec<u8> {
        self.parse().map(|request| request.body).unwrap_or_default()
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls { "https" } else { "http" }
    }

    pub fn hostname(&self) -> &str {
        split_authority(&self.host).0
    }

    pub fn port(&self) -> u16 {
        split_authority(&self.host)
            .1
            .unwrap_or(if self.tls { 443 } else { 80 })
    }

    pub fn dump_text(&self) -> String {
        String::from_utf8_lossy(&self.dump).into_owned()
    }
}

/// A captured response, stored as its raw dump like [`HttpRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpResponse {
    pub dump: Vec<u8>,
}

impl HttpResponse {
    pub fn new(dump: impl Into<Vec<u8>>) -> Self {
        Self { dump: dump.into() }
    }

    pub fn parse(&self) -> Result<Response, ParseError> {
        parse_response(&self.dump)
    }

    pub fn status_code(&self) -> Option<u16> {
        self.parse().ok().map(|response| response.line.status_code)
    }

    /// Status code and reason, e.g. `200 OK`.
    pub fn status(&self) -> Option<String> {
        let response = self.parse().ok()?;
        let line = response.line;
        Some(if line.reason.is_empty() {
            line.status_code.to_string()
        } else {
            format!("{} {}", line.status_code, line.reason)
        })
    }

    pub fn headers(&self) -> Vec<Header> {
        self.parse()
            .map(|response| response.headers)
            .unwrap_or_default()
    }

    /// Body with transfer framing removed but content encoding intact.
    pub fn body(&self) -> Vec<u8> {
        self.parse()
            .map(|response| response.body)
            .unwrap_or_default()
    }

    pub fn decoded_body(&self) -> Result<Vec<u8>, CodecError> {
        let Ok(response) = self.parse() else {
            return Ok(Vec::new());
        };
        match response.header("content-encoding") {
            Some(encoding) => decode_body(encoding, &response.body),
            None => Ok(response.body),
        }
    }

    /// Human-readable rendering: the head as captured followed by the body
    /// with transfer and content encodings undone.
    pub fn printable(&self) -> String {
        let Ok(response) = self.parse() else {
            return String::from_utf8_lossy(&self.dump).into_owned();
        };
        let body = match response.header("content-encoding") {
            Some(encoding) => {
                decode_body(encoding, &response.body).unwrap_or_else(|_| response.body.clone())
            }
            None => response.body.clone(),
        };

        let mut text = format!("{} {}", response.line.version, response.line.status_code);
        if !response.line.reason.is_empty() {
            text.push(' ');
            text.push_str(&response.line.reason);
        }
        text.push_str("\r\n");
        for header in &response.headers {
            text.push_str(&header.name);
            text.push_str(": ");
            text.push_str(&header.value);
            text.push_str("\r\n");
        }
        text.push_str("\r\n");
        text.push_str(&String::from_utf8_lossy(&body));
        text
    }
}

/// One captured or in-flight exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: String,
    pub request: HttpRequest,
    pub response: Option<HttpResponse>,
    pub timestamp: Option<DateTime<Utc>>,
    pub seq_number: u64,
    pub provenance: Provenance,
    pub waiting_for_response: bool,
    pub intercept_response: bool,
    pub auto_forwarded: bool,
    pub was_dropped: bool,
    /// Set on a live, intercepted copy once its store record exists.
    pub history_id: Option<String>,
}

impl Transaction {
    pub fn new(request: HttpRequest, provenance: Provenance) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request,
            response: None,
            timestamp: Some(Utc::now()),
            seq_number: 0,
            provenance,
            waiting_for_response: false,
            intercept_response: false,
            auto_forwarded: false,
            was_dropped: false,
            history_id: None,
        }
    }

    pub fn summary(&self) -> TransactionSummary {
        TransactionSummary {
            id: self.id.clone(),
            timestamp: self.timestamp,
            method: self.request.method().unwrap_or_default(),
            url: self.request.url().unwrap_or_default(),
            seq_number: self.seq_number,
            status_code: self.response.as_ref().and_then(HttpResponse::status_code),
            status: self.response.as_ref().and_then(HttpResponse::status),
            response_size: self
                .response
                .as_ref()
                .map(|response| response.body().len())
                .unwrap_or(0),
            provenance: self.provenance.clone(),
            was_dropped: self.was_dropped,
        }
    }
}

/// Lightweight projection used for list display and incremental polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionSummary {
    pub id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub method: String,
    pub url: String,
    pub seq_number: u64,
    pub status_code: Option<u16>,
    pub status: Option<String>,
    pub response_size: usize,
    pub provenance: Provenance,
    pub was_dropped: bool,
}
