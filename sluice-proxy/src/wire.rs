use std::io;

use sluice_net::{
    Limits, ParseStatus, Request, RequestParser, Response, ResponseParser, header_value,
};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProxyError;

const READ_BUFFER: usize = 8192;

/// Read the next complete request from a client connection.
///
/// Returns `None` on a clean close between requests. Pipelined bytes stay in
/// `parser` for the following call.
pub(crate) async fn read_request<S>(
    stream: &mut S,
    parser: &mut RequestParser,
) -> Result<Option<Request>, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_BUFFER];
    let mut status = parser.poll();
    loop {
        match status {
            ParseStatus::Complete { message, .. } => return Ok(Some(message)),
            ParseStatus::Error { error } => return Err(error.into()),
            ParseStatus::NeedMore => {}
        }
        let n = stream.read(&mut buffer).await?;
        if n == 0 {
            if parser.has_buffered() {
                return Err(ProxyError::Runtime(
                    "client closed the connection mid-request".to_string(),
                ));
            }
            return Ok(None);
        }
        status = parser.push(&buffer[..n]);
    }
}

/// Read one upstream response, returning it with its exact wire bytes.
pub(crate) async fn read_response<S>(
    stream: &mut S,
    method: &str,
) -> Result<(Response, Vec<u8>), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut parser = ResponseParser::for_method(method, Limits::default());
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let n = match stream.read(&mut buffer).await {
            Ok(n) => n,
            // TLS peers often close without close_notify after a
            // close-delimited body.
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => 0,
            Err(err) => return Err(err.into()),
        };
        let status = if n == 0 {
            parser.finish()
        } else {
            parser.push(&buffer[..n])
        };
        match status {
            ParseStatus::Complete { message, raw } => return Ok((message, raw)),
            ParseStatus::NeedMore => continue,
            ParseStatus::Error { error } => return Err(error.into()),
        }
    }
}

/// Whether the client connection must end once `response` is delivered,
/// because its body runs until close or the server asked for it.
pub(crate) fn ends_connection(response: &Response, method: &str) -> bool {
    let headers = &response.headers;
    if header_value(headers, "connection").is_some_and(|value| value.eq_ignore_ascii_case("close"))
    {
        return true;
    }
    if method.eq_ignore_ascii_case("HEAD")
        || matches!(response.line.status_code, 100..=199 | 204 | 304)
    {
        return false;
    }
    let chunked = header_value(headers, "transfer-encoding")
        .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"));
    !chunked && header_value(headers, "content-length").is_none()
}
