use super::types::{Header, RequestLine, StatusLine};

pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

/// Replace the first header called `name` in place and drop any repeats;
/// append it when absent.
pub fn set_header(headers: &mut Vec<Header>, name: &str, value: impl Into<String>) {
    let value = value.into();
    let mut seen = false;
    headers.retain_mut(|header| {
        if !header.name.eq_ignore_ascii_case(name) {
            return true;
        }
        if seen {
            return false;
        }
        seen = true;
        header.value = value.clone();
        true
    });
    if !seen {
        headers.push(Header::new(name, value));
    }
}

pub fn remove_header(headers: &mut Vec<Header>, name: &str) -> bool {
    let before = headers.len();
    headers.retain(|header| !header.name.eq_ignore_ascii_case(name));
    before != headers.len()
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
pub fn split_authority(authority: &str) -> (&str, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            return (host, tail.strip_prefix(':').and_then(|port| port.parse().ok()));
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (authority, None),
        },
        _ => (authority, None),
    }
}

/// Inverse of [`split_authority`]; the port is left out when it is `default_port`.
pub fn join_authority(host: &str, port: u16, default_port: u16) -> String {
    let host = if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    if port == default_port {
        host
    } else {
        format!("{host}:{port}")
    }
}

pub fn serialize_request(line: &RequestLine, headers: &[Header], body: &[u8]) -> Vec<u8> {
    let start = format!("{} {} {}", line.method, line.target, line.version);
    serialize(&start, headers, body)
}

pub fn serialize_response(line: &StatusLine, headers: &[Header], body: &[u8]) -> Vec<u8> {
    let start = if line.reason.is_empty() {
        format!("{} {}", line.version, line.status_code)
    } else {
        format!("{} {} {}", line.version, line.status_code, line.reason)
    };
    serialize(&start, headers, body)
}

fn serialize(start: &str, headers: &[Header], body: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(start.len() + body.len() + headers.len() * 32);
    bytes.extend_from_slice(start.as_bytes());
    bytes.extend_from_slice(b"\r\n");
    for header in headers {
        bytes.extend_from_slice(header.name.as_bytes());
        bytes.extend_from_slice(b": ");
        bytes.extend_from_slice(header.value.as_bytes());
        bytes.extend_from_slice(b"\r\n");
    }
    bytes.extend_from_slice(b"\r\n");
    bytes.extend_from_slice(body);
    bytes
}
