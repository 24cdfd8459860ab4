use std::pin::Pin;
use std::time::Duration;

use openssl::ssl::{Ssl, SslConnector};
use sluice_net::{Header, HttpVersion, StatusLine, build_connector, serialize_response};
use sluice_store::{HttpRequest, HttpResponse};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_openssl::SslStream;

use crate::config::UpstreamConfig;
use crate::error::ProxyError;
use crate::wire;

/// Sends captured requests upstream over a fresh connection each time.
///
/// Redirects are returned as-is and upstream certificates are not checked.
#[derive(Clone)]
pub(crate) struct Upstream {
    connector: SslConnector,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    response_timeout: Duration,
}

impl Upstream {
    pub(crate) fn new(config: &UpstreamConfig) -> Result<Self, ProxyError> {
        Ok(Self {
            connector: build_connector()?,
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            response_timeout: config.response_timeout(),
        })
    }

    pub(crate) async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, ProxyError> {
        let method = request.method().unwrap_or_else(|| "GET".to_string());
        let host = request.hostname().to_string();
        let port = request.port();

        let stream = timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| ProxyError::Timeout("upstream connect"))?
            .map_err(|err| ProxyError::Upstream(format!("connect to {host}:{port}: {err}")))?;
        let _ = stream.set_nodelay(true);

        if !request.tls {
            let mut stream = stream;
            return self.exchange(&mut stream, &request.dump, &method).await;
        }

        let ssl = self.client_ssl(&host)?;
        let mut stream = SslStream::new(ssl, stream)
            .map_err(|err| ProxyError::Upstream(err.to_string()))?;
        timeout(self.handshake_timeout, Pin::new(&mut stream).connect())
            .await
            .map_err(|_| ProxyError::Timeout("upstream TLS handshake"))?
            .map_err(|err| ProxyError::Upstream(format!("TLS handshake with {host}: {err}")))?;
        self.exchange(&mut stream, &request.dump, &method).await
    }

    fn client_ssl(&self, host: &str) -> Result<Ssl, ProxyError> {
        let ssl = self
            .connector
            .configure()
            .map_err(|err| ProxyError::Upstream(err.to_string()))?
            .verify_hostname(false)
            .use_server_name_indication(true)
            .into_ssl(host)
            .map_err(|err| ProxyError::Upstream(err.to_string()))?;
        Ok(ssl)
    }

    async fn exchange<S>(
        &self,
        stream: &mut S,
        dump: &[u8],
        method: &str,
    ) -> Result<HttpResponse, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(dump).await?;
        stream.flush().await?;
        let (_, raw) = timeout(self.response_timeout, wire::read_response(stream, method))
            .await
            .map_err(|_| ProxyError::Timeout("upstream response"))??;
        Ok(HttpResponse::new(raw))
    }
}

/// Gateway error handed to the client when forwarding fails.
pub(crate) fn bad_gateway(error: &ProxyError) -> HttpResponse {
    let status = match error {
        ProxyError::Timeout(_) => (504, "Gateway Timeout"),
        _ => (502, "Bad Gateway"),
    };
    let body = format!("sluice could not reach the upstream server: {error}\n");
    simple_response(status.0, status.1, "text/plain; charset=utf-8", body.into_bytes())
}

pub(crate) fn simple_response(
    status_code: u16,
    reason: &str,
    content_type: &str,
    body: Vec<u8>,
) -> HttpResponse {
    let line = StatusLine {
        version: HttpVersion::Http11,
        status_code,
        reason: reason.to_string(),
    };
    let headers = vec![
        Header::new("Content-Type", content_type),
        Header::new("Content-Length", body.len().to_string()),
    ];
    HttpResponse::new(serialize_response(&line, &headers, &body))
}
