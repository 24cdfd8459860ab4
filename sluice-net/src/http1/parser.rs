use super::edit::header_value;
use super::types::{
    Framing, Header, HttpVersion, Limits, ParseError, ParseErrorKind, Request, RequestLine,
    Response, StatusLine,
};

const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus<T> {
    NeedMore,
    Complete { message: T, raw: Vec<u8> },
    Error { error: ParseError },
}

/// Incremental request parser for one client connection.
///
/// Bytes past the end of a completed request stay buffered, so pipelined
/// requests are picked up by the next [`RequestParser::poll`].
#[derive(Debug, Default)]
pub struct RequestParser {
    buffer: Vec<u8>,
    limits: Limits,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            limits,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus<Request> {
        self.buffer.extend_from_slice(bytes);
        self.poll()
    }

    pub fn poll(&mut self) -> ParseStatus<Request> {
        let leading = self
            .buffer
            .iter()
            .take_while(|byte| **byte == b'\r' || **byte == b'\n')
            .count();
        self.buffer.drain(..leading);
        if self.buffer.is_empty() {
            return ParseStatus::NeedMore;
        }

        match parse_request_prefix(&self.buffer, self.limits) {
            Ok(Some((message, consumed))) => {
                let raw = self.buffer.drain(..consumed).collect();
                ParseStatus::Complete { message, raw }
            }
            Ok(None) => ParseStatus::NeedMore,
            Err(error) => ParseStatus::Error { error },
        }
    }

    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }
}

/// Response parser for a single upstream exchange.
///
/// Close-delimited bodies never complete through [`ResponseParser::push`];
/// call [`ResponseParser::finish`] once the upstream reaches EOF.
#[derive(Debug, Default)]
pub struct ResponseParser {
    buffer: Vec<u8>,
    limits: Limits,
    head_request: bool,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            limits,
            head_request: false,
        }
    }

    /// Responses to HEAD carry headers describing a body that is never sent.
    pub fn for_method(method: &str, limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            limits,
            head_request: method.eq_ignore_ascii_case("HEAD"),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus<Response> {
        self.buffer.extend_from_slice(bytes);
        match self.parse(false) {
            Ok(Some((message, consumed))) => {
                let raw = self.buffer.drain(..consumed).collect();
                ParseStatus::Complete { message, raw }
            }
            Ok(None) => ParseStatus::NeedMore,
            Err(error) => ParseStatus::Error { error },
        }
    }

    pub fn finish(&mut self) -> ParseStatus<Response> {
        match self.parse(true) {
            Ok(Some((message, consumed))) => {
                let raw = self.buffer.drain(..consumed).collect();
                ParseStatus::Complete { message, raw }
            }
            Ok(None) => ParseStatus::Error {
                error: ParseError::new(ParseErrorKind::UnexpectedEof, self.buffer.len()),
            },
            Err(error) => ParseStatus::Error { error },
        }
    }

    fn parse(&mut self, at_eof: bool) -> Result<Option<(Response, usize)>, ParseError> {
        loop {
            let Some((end, terminator)) = find_headers_end(&self.buffer, self.limits)? else {
                return Ok(None);
            };
            let (line, headers) = parse_head(&self.buffer[..end], parse_status_line)?;
            let body_start = end + terminator;

            // Interim responses (100 Continue and friends) are not forwarded.
            if (100..200).contains(&line.status_code) && line.status_code != 101 {
                self.buffer.drain(..body_start);
                continue;
            }

            let framing = response_framing(line.status_code, &headers, self.head_request)?;
            let body = if framing == Framing::UntilClose {
                if !at_eof {
                    return Ok(None);
                }
                let rest = &self.buffer[body_start..];
                if rest.len() > self.limits.max_body_bytes {
                    return Err(ParseError::new(ParseErrorKind::BodyTooLarge, body_start));
                }
                Some((rest.to_vec(), rest.len()))
            } else {
                read_body(&self.buffer, body_start, framing, self.limits)?
            };

            return Ok(body.map(|(body, consumed)| {
                (
                    Response {
                        line,
                        headers,
                        body,
                    },
                    body_start + consumed,
                )
            }));
        }
    }
}

/// Parse a complete request dump.
///
/// Unlike the streaming parser this trusts the dump over its own headers: the
/// body is whatever follows the head, de-chunked when it is chunked. This is
/// what makes an operator-edited dump readable even when the declared length
/// no longer matches.
pub fn parse_request(dump: &[u8]) -> Result<Request, ParseError> {
    let (end, terminator) = head_bounds(dump);
    let (line, headers) = parse_head(&dump[..end], parse_request_line)?;
    let body = lenient_body(dump, end + terminator, &headers);
    Ok(Request {
        line,
        headers,
        body,
    })
}

/// Parse a complete response dump, see [`parse_request`].
pub fn parse_response(dump: &[u8]) -> Result<Response, ParseError> {
    let (end, terminator) = head_bounds(dump);
    let (line, headers) = parse_head(&dump[..end], parse_status_line)?;
    let body = lenient_body(dump, end + terminator, &headers);
    Ok(Response {
        line,
        headers,
        body,
    })
}

fn head_bounds(dump: &[u8]) -> (usize, usize) {
    let limits = Limits {
        max_header_bytes: usize::MAX,
        max_body_bytes: usize::MAX,
    };
    match find_headers_end(dump, limits) {
        Ok(Some(bounds)) => bounds,
        _ => (dump.len(), 0),
    }
}

fn lenient_body(dump: &[u8], body_start: usize, headers: &[Header]) -> Vec<u8> {
    let rest = dump.get(body_start..).unwrap_or_default();
    if is_chunked(headers) {
        let limits = Limits {
            max_header_bytes: usize::MAX,
            max_body_bytes: usize::MAX,
        };
        if let Ok(Some((body, _))) = decode_chunked(dump, body_start, limits) {
            return body;
        }
    }
    rest.to_vec()
}

fn parse_request_prefix(
    buffer: &[u8],
    limits: Limits,
) -> Result<Option<(Request, usize)>, ParseError> {
    let Some((end, terminator)) = find_headers_end(buffer, limits)? else {
        return Ok(None);
    };
    let (line, headers) = parse_head(&buffer[..end], parse_request_line)?;
    let body_start = end + terminator;
    let framing = request_framing(&headers)?;

    Ok(read_body(buffer, body_start, framing, limits)?.map(|(body, consumed)| {
        (
            Request {
                line,
                headers,
                body,
            },
            body_start + consumed,
        )
    }))
}

/// Returns the offset where the head ends and the length of the blank-line
/// terminator. Bare LF line endings are tolerated.
fn find_headers_end(buffer: &[u8], limits: Limits) -> Result<Option<(usize, usize)>, ParseError> {
    let crlf = twoway::find_bytes(buffer, b"\r\n\r\n").map(|index| (index, 4));
    let lf = twoway::find_bytes(buffer, b"\n\n").map(|index| (index, 2));
    let found = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };

    match found {
        Some((index, _)) if index > limits.max_header_bytes => Err(ParseError::new(
            ParseErrorKind::HeaderTooLarge,
            limits.max_header_bytes,
        )),
        Some(bounds) => Ok(Some(bounds)),
        None if buffer.len() > limits.max_header_bytes => Err(ParseError::new(
            ParseErrorKind::HeaderTooLarge,
            limits.max_header_bytes,
        )),
        None => Ok(None),
    }
}

fn find_line_end(buffer: &[u8], start: usize) -> Option<usize> {
    twoway::find_bytes(&buffer[start..], CRLF).map(|offset| start + offset)
}

fn parse_head<L>(
    head: &[u8],
    parse_line: fn(&str, usize) -> Result<L, ParseError>,
) -> Result<(L, Vec<Header>), ParseError> {
    let text = std::str::from_utf8(head)
        .map_err(|err| ParseError::new(ParseErrorKind::InvalidHeader, err.valid_up_to()))?;
    let mut lines = text.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));
    let line = parse_line(lines.next().unwrap_or_default(), 0)?;

    let mut headers: Vec<Header> = Vec::new();
    let mut offset = 0;
    for raw in lines {
        offset += raw.len() + 1;
        if raw.is_empty() {
            continue;
        }
        if raw.starts_with(' ') || raw.starts_with('\t') {
            // obs-fold continuation
            if let Some(last) = headers.last_mut() {
                last.value.push(' ');
                last.value.push_str(raw.trim());
                continue;
            }
        }
        let (name, value) = raw
            .split_once(':')
            .ok_or(ParseError::new(ParseErrorKind::InvalidHeader, offset))?;
        if name.trim().is_empty() {
            return Err(ParseError::new(ParseErrorKind::InvalidHeader, offset));
        }
        headers.push(Header::new(name.trim(), value.trim()));
    }

    Ok((line, headers))
}

fn parse_request_line(text: &str, offset: usize) -> Result<RequestLine, ParseError> {
    let mut parts = text.split_whitespace();
    let method = parts
        .next()
        .ok_or(ParseError::new(ParseErrorKind::InvalidStartLine, offset))?;
    let target = parts
        .next()
        .ok_or(ParseError::new(ParseErrorKind::InvalidStartLine, offset))?;
    let version = parts.next().unwrap_or("HTTP/1.1");
    if parts.next().is_some() {
        return Err(ParseError::new(ParseErrorKind::InvalidStartLine, offset));
    }

    Ok(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version: HttpVersion::parse(version),
    })
}

fn parse_status_line(text: &str, offset: usize) -> Result<StatusLine, ParseError> {
    let mut parts = text.splitn(3, ' ');
    let version = parts.next().unwrap_or("HTTP/1.1");
    let status_code = parts
        .next()
        .and_then(|code| code.trim().parse::<u16>().ok())
        .ok_or(ParseError::new(ParseErrorKind::InvalidStatusLine, offset))?;
    if !version.starts_with("HTTP/") {
        return Err(ParseError::new(ParseErrorKind::InvalidStatusLine, offset));
    }

    Ok(StatusLine {
        version: HttpVersion::parse(version),
        status_code,
        reason: parts.next().unwrap_or("").trim().to_string(),
    })
}

fn is_chunked(headers: &[Header]) -> bool {
    headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case("transfer-encoding"))
        .any(|header| {
            header
                .value
                .split(',')
                .any(|encoding| encoding.trim().eq_ignore_ascii_case("chunked"))
        })
}

fn content_length(headers: &[Header]) -> Result<Option<usize>, ParseError> {
    match header_value(headers, "content-length") {
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ParseError::new(ParseErrorKind::InvalidContentLength, 0)),
        None => Ok(None),
    }
}

fn request_framing(headers: &[Header]) -> Result<Framing, ParseError> {
    if is_chunked(headers) {
        return Ok(Framing::Chunked);
    }
    Ok(match content_length(headers)? {
        Some(0) | None => Framing::Empty,
        Some(length) => Framing::Length(length),
    })
}

fn response_framing(
    status_code: u16,
    headers: &[Header],
    head_request: bool,
) -> Result<Framing, ParseError> {
    if head_request || status_code == 204 || status_code == 304 || status_code < 200 {
        return Ok(Framing::Empty);
    }
    if is_chunked(headers) {
        return Ok(Framing::Chunked);
    }
    Ok(match content_length(headers)? {
        Some(0) => Framing::Empty,
        Some(length) => Framing::Length(length),
        None => Framing::UntilClose,
    })
}

fn read_body(
    buffer: &[u8],
    body_start: usize,
    framing: Framing,
    limits: Limits,
) -> Result<Option<(Vec<u8>, usize)>, ParseError> {
    match framing {
        Framing::Empty => Ok(Some((Vec::new(), 0))),
        Framing::Length(length) => {
            if length > limits.max_body_bytes {
                return Err(ParseError::new(ParseErrorKind::BodyTooLarge, body_start));
            }
            let Some(body_end) = body_start.checked_add(length) else {
                return Err(ParseError::new(ParseErrorKind::BodyTooLarge, body_start));
            };
            if buffer.len() < body_end {
                return Ok(None);
            }
            Ok(Some((buffer[body_start..body_end].to_vec(), length)))
        }
        Framing::Chunked => decode_chunked(buffer, body_start, limits),
        Framing::UntilClose => Ok(None),
    }
}

fn decode_chunked(
    buffer: &[u8],
    body_start: usize,
    limits: Limits,
) -> Result<Option<(Vec<u8>, usize)>, ParseError> {
    let mut cursor = body_start;
    let mut body = Vec::new();

    loop {
        let Some(line_end) = find_line_end(buffer, cursor) else {
            return Ok(None);
        };
        let line = std::str::from_utf8(&buffer[cursor..line_end])
            .map_err(|_| ParseError::new(ParseErrorKind::InvalidChunkSize, cursor))?;
        let size_text = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| ParseError::new(ParseErrorKind::InvalidChunkSize, cursor))?;
        cursor = line_end + CRLF.len();

        if size == 0 {
            // Trailer section ends with an empty line.
            loop {
                let Some(line_end) = find_line_end(buffer, cursor) else {
                    return Ok(None);
                };
                let empty = line_end == cursor;
                cursor = line_end + CRLF.len();
                if empty {
                    return Ok(Some((body, cursor - body_start)));
                }
            }
        }

        let too_large = || ParseError::new(ParseErrorKind::BodyTooLarge, cursor);
        let total = body.len().checked_add(size).ok_or_else(too_large)?;
        if total > limits.max_body_bytes {
            return Err(too_large());
        }
        let next = cursor.checked_add(size).ok_or_else(too_large)?;
        if next.saturating_add(CRLF.len()) > buffer.len() {
            return Ok(None);
        }
        body.extend_from_slice(&buffer[cursor..next]);
        cursor = next;

        if &buffer[cursor..cursor + CRLF.len()] != CRLF {
            return Err(ParseError::new(
                ParseErrorKind::InvalidChunkTerminator,
                cursor,
            ));
        }
        cursor += CRLF.len();
    }
}
