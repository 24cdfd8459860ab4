use sluice_net::{
    Header, header_value, parse_response, remove_header, serialize_request, serialize_response,
    set_header,
};
use sluice_store::{HttpRequest, HttpResponse};
use url::Url;

use crate::error::InterceptError;

/// Operator edits to an intercepted request. `None` leaves a part untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestEdit {
    pub method: Option<String>,
    /// Absolute `http(s)://` URL, which may retarget the request, or an
    /// origin-form path.
    pub url: Option<String>,
    /// Replaces the whole header list.
    pub headers: Option<Vec<Header>>,
    pub body: Option<Vec<u8>>,
}

impl RequestEdit {
    pub fn is_empty(&self) -> bool {
        self.method.is_none() && self.url.is_none() && self.headers.is_none() && self.body.is_none()
    }
}

/// Rewrite the request dump with `edit` applied.
///
/// A changed body always gets an exact `Content-Length` and loses any
/// chunked framing.
pub(crate) fn apply_request_edit(
    id: &str,
    request: &mut HttpRequest,
    edit: RequestEdit,
) -> Result<(), InterceptError> {
    if edit.is_empty() {
        return Ok(());
    }
    let malformed = || InterceptError::MalformedRequest(id.to_string());
    let mut parsed = request.parse().map_err(|_| malformed())?;
    let mut host = request.host.clone();
    let mut tls = request.tls;

    if let Some(method) = edit.method {
        let method = method.trim().to_ascii_uppercase();
        if method.is_empty() || method.contains(char::is_whitespace) {
            return Err(malformed());
        }
        parsed.line.method = method;
    }
    if let Some(headers) = edit.headers {
        parsed.headers = headers;
    }
    if let Some(url) = edit.url {
        let url = url.trim();
        if url.starts_with('/') {
            parsed.line.target = url.to_string();
        } else {
            let retarget = Retarget::parse(url).ok_or_else(malformed)?;
            parsed.line.target = retarget.target;
            set_header(&mut parsed.headers, "Host", retarget.authority.clone());
            host = retarget.authority;
            tls = retarget.tls;
        }
    }
    if let Some(body) = edit.body {
        if body != parsed.body {
            remove_header(&mut parsed.headers, "Transfer-Encoding");
            set_header(&mut parsed.headers, "Content-Length", body.len().to_string());
            parsed.body = body;
        }
    }

    request.dump = serialize_request(&parsed.line, &parsed.headers, &parsed.body);
    request.host = host;
    request.tls = tls;
    Ok(())
}

/// Validate an operator-edited response dump and make its length framing
/// match the body it actually carries.
pub(crate) fn normalize_response(id: &str, dump: Vec<u8>) -> Result<HttpResponse, InterceptError> {
    let mut response =
        parse_response(&dump).map_err(|_| InterceptError::MalformedResponse(id.to_string()))?;
    let chunked = header_value(&response.headers, "transfer-encoding")
        .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"));
    let bodiless = matches!(response.line.status_code, 100..=199 | 204 | 304);
    if chunked || bodiless {
        return Ok(HttpResponse::new(dump));
    }

    let length = response.body.len().to_string();
    if header_value(&response.headers, "content-length") == Some(length.as_str()) {
        return Ok(HttpResponse::new(dump));
    }
    set_header(&mut response.headers, "Content-Length", length);
    Ok(HttpResponse::new(serialize_response(
        &response.line,
        &response.headers,
        &response.body,
    )))
}

/// Where an absolute URL sends a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Retarget {
    /// `host` or `host:port`, port omitted when it is the scheme default.
    pub authority: String,
    pub tls: bool,
    /// Origin-form path and query.
    pub target: String,
}

impl Retarget {
    pub(crate) fn parse(raw: &str) -> Option<Self> {
        let url = Url::parse(raw).ok()?;
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            _ => return None,
        };
        let host = url.host_str()?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        Some(Self {
            authority,
            tls,
            target,
        })
    }
}
