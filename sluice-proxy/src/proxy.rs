use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use openssl::ssl::Ssl;
use parking_lot::{Mutex, RwLock};
use sluice_net::{
    CertificateManager, Header, Request, RequestParser, TlsError, build_acceptor, header_value,
    join_authority, remove_header, serialize_request, set_header, split_authority,
};
use sluice_store::{
    ChunkKind, HttpRequest, HttpResponse, Provenance, StoreError, Transaction, TransactionChunk,
    TransactionMetadata, TransactionStore,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_openssl::SslStream;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::edit::{RequestEdit, Retarget, apply_request_edit, normalize_response};
use crate::error::{InterceptError, ProxyError};
use crate::events::TransactionNotifier;
use crate::forward::{Upstream, bad_gateway, simple_response};
use crate::intercept::{Completion, CompletionWaiter, InterceptQueue, Resolution, Verdict};
use crate::landing;
use crate::wire;

/// Status sent to the client when the operator drops its request.
pub const DROP_STATUS: u16 = 444;

const DROP_RESPONSE: &[u8] = b"HTTP/1.1 444 No Response\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// The intercepting proxy: listener, CONNECT bridge, request pipeline and
/// the interception control surface. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProxyServer {
    state: Arc<ProxyState>,
}

struct ProxyState {
    config: ProxyConfig,
    certificates: Arc<CertificateManager>,
    upstream: Upstream,
    queue: InterceptQueue,
    store: TransactionStore,
    notifier: Arc<dyn TransactionNotifier>,
    /// Held across the enabled check and the queue insert, and across
    /// disabling and draining, so no request slips into a drained queue.
    intercept_enabled: Mutex<bool>,
    local_addr: RwLock<Option<SocketAddr>>,
}

/// What a plain-proxy or tunneled request turns into.
enum Route {
    Upstream(HttpRequest),
    Local(Request),
    Invalid(&'static str),
}

enum Next {
    Closed,
    Connect(Request),
}

impl ProxyServer {
    pub fn new(
        config: ProxyConfig,
        certificates: Arc<CertificateManager>,
        notifier: Arc<dyn TransactionNotifier>,
    ) -> Result<Self, ProxyError> {
        config.validate()?;
        let upstream = Upstream::new(&config.upstream)?;
        let queue = InterceptQueue::new(config.intercept.queue_capacity);
        let enabled = config.intercept.enabled_on_start;
        Ok(Self {
            state: Arc::new(ProxyState {
                config,
                certificates,
                upstream,
                queue,
                store: TransactionStore::new(),
                notifier,
                intercept_enabled: Mutex::new(enabled),
                local_addr: RwLock::new(None),
            }),
        })
    }

    /// Load the CA from the configured directory, creating one on first run.
    pub fn from_config(
        config: ProxyConfig,
        notifier: Arc<dyn TransactionNotifier>,
    ) -> Result<Self, ProxyError> {
        let certificates = CertificateManager::load_or_generate(
            config.ca_dir(),
            &config.tls.ca_common_name,
            config.certificate_options(),
        )?;
        Self::new(config, Arc::new(certificates), notifier)
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.state.config
    }

    pub fn certificates(&self) -> &Arc<CertificateManager> {
        &self.state.certificates
    }

    pub fn store(&self) -> &TransactionStore {
        &self.state.store
    }

    pub fn queue(&self) -> &InterceptQueue {
        &self.state.queue
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.state.local_addr.read()
    }

    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        let addr = self.state.config.listen_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|err| ProxyError::Runtime(format!("bind {addr}: {err}")))
    }

    pub async fn run(&self) -> Result<(), ProxyError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProxyError> {
        let local = listener.local_addr()?;
        *self.state.local_addr.write() = Some(local);
        info!(address = %local, "proxy listening");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let state = Arc::clone(&self.state);
            tokio::spawn(
                async move {
                    match handle_connection(state, stream).await {
                        Ok(()) => debug!("connection closed"),
                        Err(err @ (ProxyError::Io(_) | ProxyError::Parse(_))) => {
                            debug!(error = %err, "connection ended")
                        }
                        Err(err) => warn!(error = %err, "connection failed"),
                    }
                }
                .instrument(info_span!("connection", %peer)),
            );
        }
    }

    pub fn intercept_enabled(&self) -> bool {
        *self.state.intercept_enabled.lock()
    }

    /// Toggle interception. Disabling releases every queued transaction that
    /// is still awaiting a decision, unmodified, and returns how many were
    /// released. Requests already forwarded finish their own fetch and are
    /// delivered without response review.
    pub fn set_intercept_enabled(&self, enabled: bool) -> usize {
        let mut flag = self.state.intercept_enabled.lock();
        *flag = enabled;
        if enabled {
            info!("interception enabled");
            return 0;
        }
        let released = self.state.queue.clear();
        info!(released, "interception disabled");
        released
    }

    /// Transactions still waiting for a request decision.
    pub fn pending_requests(&self) -> Vec<Transaction> {
        self.state
            .queue
            .get_all()
            .into_iter()
            .filter(|transaction| {
                transaction.response.is_none()
                    && !transaction.auto_forwarded
                    && !transaction.waiting_for_response
            })
            .collect()
    }

    /// Transactions whose upstream response is waiting for the operator.
    pub fn pending_responses(&self) -> Vec<Transaction> {
        self.state
            .queue
            .get_all()
            .into_iter()
            .filter(|transaction| transaction.intercept_response && transaction.response.is_some())
            .collect()
    }

    /// Apply operator edits to a queued request and let it continue upstream.
    pub fn modify_request(&self, id: &str, edit: RequestEdit) -> Result<(), InterceptError> {
        self.state.queue.update(id, |transaction| {
            if transaction.response.is_some()
                || transaction.waiting_for_response
                || transaction.auto_forwarded
            {
                return Err(InterceptError::AlreadyForwarding(id.to_string()));
            }
            apply_request_edit(id, &mut transaction.request, edit)
        })?;
        self.state.queue.resolve(id, Verdict::Continue)?;
        debug!(%id, "modified request released");
        Ok(())
    }

    /// Forward a queued request.
    ///
    /// Without `intercept_response` the response is fetched and handed to the
    /// client as soon as it arrives. With it, the response is parked in the
    /// queue for review and the client keeps waiting. Calling this on a
    /// parked response delivers it unchanged.
    ///
    /// Must be called from within a tokio runtime.
    pub fn forward_request(&self, id: &str, intercept_response: bool) -> Result<(), InterceptError> {
        let fetch = self.state.queue.update(id, |transaction| {
            if transaction.response.is_some() {
                return Ok(None);
            }
            if transaction.waiting_for_response || transaction.auto_forwarded {
                return Err(InterceptError::AlreadyForwarding(id.to_string()));
            }
            transaction.intercept_response = intercept_response;
            transaction.waiting_for_response = intercept_response;
            transaction.auto_forwarded = !intercept_response;
            Ok(Some(transaction.request.clone()))
        })?;

        let Some(request) = fetch else {
            self.state.queue.resolve(id, Verdict::Continue)?;
            debug!(%id, "reviewed response released");
            return Ok(());
        };

        let state = Arc::clone(&self.state);
        let id = id.to_string();
        tokio::spawn(async move { state.complete_forward(id, request).await }.in_current_span());
        Ok(())
    }

    /// Drop a queued request before it goes anywhere. Requests already
    /// forwarded upstream cannot be dropped.
    pub fn drop_request(&self, id: &str) -> Result<(), InterceptError> {
        self.state.queue.update(id, |transaction| {
            if transaction.response.is_some()
                || transaction.waiting_for_response
                || transaction.auto_forwarded
            {
                return Err(InterceptError::AlreadyForwarding(id.to_string()));
            }
            transaction.was_dropped = true;
            Ok(())
        })?;
        self.state.queue.resolve(id, Verdict::Drop)?;
        debug!(%id, "request dropped");
        Ok(())
    }

    /// Replace a parked response and deliver it to the client.
    pub fn modify_response(&self, id: &str, dump: impl Into<Vec<u8>>) -> Result<(), InterceptError> {
        let response = normalize_response(id, dump.into())?;
        self.state.queue.update(id, |transaction| {
            if transaction.response.is_none() {
                return Err(InterceptError::NoResponse(id.to_string()));
            }
            transaction.response = Some(response);
            Ok(())
        })?;
        self.state.queue.resolve(id, Verdict::Continue)?;
        debug!(%id, "modified response released");
        Ok(())
    }

    /// Record traffic produced outside the proxy (replays, scripted flows)
    /// in the same sequence as captured traffic. It always gets a fresh id.
    pub fn add_transaction_to_history(
        &self,
        mut transaction: Transaction,
    ) -> Result<Transaction, StoreError> {
        transaction.id = Uuid::new_v4().to_string();
        transaction.seq_number = 0;
        transaction.history_id = None;
        transaction.waiting_for_response = false;
        let stored = self.state.store.add(transaction)?;
        self.state.notifier.transaction_added(&stored);
        Ok(stored)
    }

    pub fn transaction_chunk(
        &self,
        id: &str,
        kind: ChunkKind,
        index: usize,
    ) -> Result<TransactionChunk, StoreError> {
        self.state
            .store
            .chunk(id, kind, index, self.state.config.history.chunk_size_bytes)
    }

    pub fn transaction_metadata(&self, id: &str) -> Result<TransactionMetadata, StoreError> {
        self.state
            .store
            .metadata(id, self.state.config.history.chunk_size_bytes)
    }
}

impl ProxyState {
    /// Run one captured request through interception, forwarding and
    /// recording. Returns the response for the client and whether the
    /// connection must close afterwards.
    async fn process(&self, transaction: Transaction) -> (HttpResponse, bool) {
        let suspended = match self.suspend(&transaction) {
            Ok(suspended) => suspended,
            Err(err) => {
                warn!(id = %transaction.id, error = %err, "request not queued, refusing it");
                let body = format!("sluice could not hold the request for review: {err}\n");
                let refusal = simple_response(
                    503,
                    "Service Unavailable",
                    "text/plain; charset=utf-8",
                    body.into_bytes(),
                );
                return (refusal, false);
            }
        };
        let mut transaction = match suspended {
            None => transaction,
            Some(waiter) => match waiter.wait().await {
                Some(Resolution {
                    verdict: Verdict::Drop,
                    transaction,
                }) => return (self.finish_dropped(transaction), true),
                Some(Resolution { transaction, .. }) => transaction,
                None => transaction,
            },
        };

        let response = match &transaction.response {
            Some(response) => response.clone(),
            None => {
                let response = self.fetch(&transaction.request).await;
                transaction.response = Some(response.clone());
                response
            }
        };
        if let Err(err) = self.record(transaction) {
            warn!(error = %err, "failed to record transaction");
        }
        (response, false)
    }

    /// Queue the transaction when interception is on. A request that cannot
    /// be queued is refused rather than slipping past the operator.
    fn suspend(&self, transaction: &Transaction) -> Result<Option<CompletionWaiter>, InterceptError> {
        let enabled = self.intercept_enabled.lock();
        if !*enabled {
            return Ok(None);
        }
        let (completion, waiter) = Completion::new();
        self.queue.add(transaction.clone(), Some(completion))?;
        debug!(id = %transaction.id, url = ?transaction.request.url(), "request intercepted");
        Ok(Some(waiter))
    }

    fn finish_dropped(&self, mut transaction: Transaction) -> HttpResponse {
        transaction.was_dropped = true;
        transaction.response = None;
        if let Err(err) = self.record(transaction) {
            warn!(error = %err, "failed to record dropped transaction");
        }
        HttpResponse::new(DROP_RESPONSE)
    }

    async fn fetch(&self, request: &HttpRequest) -> HttpResponse {
        match self.upstream.send(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(host = %request.host, error = %err, "forwarding failed");
                bad_gateway(&err)
            }
        }
    }

    /// Side-task half of `forward_request`. Whether the response is parked
    /// for review is read when it lands, since disabling interception in the
    /// meantime turns review off.
    async fn complete_forward(&self, id: String, request: HttpRequest) {
        let response = self.fetch(&request).await;
        let attached = self.queue.update(&id, |transaction| {
            transaction.response = Some(response);
            transaction.waiting_for_response = false;
            Ok(transaction.clone())
        });
        let transaction = match attached {
            Ok(transaction) => transaction,
            Err(err) => {
                debug!(%id, error = %err, "transaction left the queue before its response arrived");
                return;
            }
        };

        if !transaction.intercept_response {
            if let Err(err) = self.queue.resolve(&id, Verdict::Continue) {
                debug!(%id, error = %err, "auto-forwarded transaction already released");
            }
            return;
        }

        // Show the exchange in history while the operator reviews it.
        match self.record(transaction) {
            Ok(stored) => {
                let _ = self.queue.update(&id, |transaction| {
                    transaction.history_id = Some(stored.id.clone());
                    Ok(())
                });
                debug!(%id, "response parked for review");
            }
            Err(err) => warn!(%id, error = %err, "failed to record parked response"),
        }
    }

    /// Add the transaction to the store, or update its existing record.
    fn record(&self, mut transaction: Transaction) -> Result<Transaction, StoreError> {
        transaction.waiting_for_response = false;
        if let Some(history_id) = transaction.history_id.take() {
            transaction.id = history_id;
        }
        match self.store.add(transaction.clone()) {
            Ok(stored) => {
                self.notifier.transaction_added(&stored);
                Ok(stored)
            }
            Err(StoreError::Duplicate(_)) => {
                let stored = self.store.update(transaction)?;
                self.notifier.transaction_updated(&stored);
                Ok(stored)
            }
            Err(err) => Err(err),
        }
    }

    fn route(&self, mut request: Request, tunnel: Option<&str>) -> Route {
        if let Some(authority) = tunnel {
            if self.is_self(authority, 443) {
                return Route::Local(request);
            }
            return Route::Upstream(capture(request, authority.to_string(), true));
        }

        let target = request.line.target.clone();
        if target.starts_with('/') || target == "*" {
            let host = header_value(&request.headers, "host").map(str::to_string);
            return match host {
                Some(host) if !self.is_self(&host, 80) => {
                    Route::Upstream(capture(request, host, false))
                }
                _ => Route::Local(request),
            };
        }

        let Some(retarget) = Retarget::parse(&target) else {
            return Route::Invalid("unsupported request target");
        };
        let default_port = if retarget.tls { 443 } else { 80 };
        if self.is_self(&retarget.authority, default_port) {
            return Route::Local(request);
        }
        request.line.target = retarget.target;
        Route::Upstream(capture(request, retarget.authority, retarget.tls))
    }

    /// Whether `authority` names this proxy.
    fn is_self(&self, authority: &str, default_port: u16) -> bool {
        let (host, port) = split_authority(authority);
        let host = host.to_ascii_lowercase();
        if self
            .config
            .advertised_host
            .iter()
            .any(|name| name.eq_ignore_ascii_case(&host))
        {
            return true;
        }

        let Some(local) = *self.local_addr.read() else {
            return false;
        };
        if port.unwrap_or(default_port) != local.port() {
            return false;
        }
        if host == "localhost" || host.eq_ignore_ascii_case(&self.config.listen.host) {
            return true;
        }
        host.parse::<IpAddr>().is_ok_and(|ip| {
            ip == local.ip() || (local.ip().is_unspecified() && ip.is_loopback())
        })
    }
}

/// Normalize a request read off the wire into its stored dump: origin-form
/// target, no hop-by-hop proxy header, a Host header, and the body with any
/// chunked framing removed.
fn capture(mut request: Request, authority: String, tls: bool) -> HttpRequest {
    remove_header(&mut request.headers, "Proxy-Connection");
    if header_value(&request.headers, "host").is_none() {
        request.headers.insert(0, Header::new("Host", authority.clone()));
    }
    if remove_header(&mut request.headers, "Transfer-Encoding") {
        set_header(
            &mut request.headers,
            "Content-Length",
            request.body.len().to_string(),
        );
    }
    let dump = serialize_request(&request.line, &request.headers, &request.body);
    HttpRequest::new(authority, dump, tls)
}

async fn handle_connection(state: Arc<ProxyState>, mut client: TcpStream) -> Result<(), ProxyError> {
    match serve_requests(&state, &mut client, None).await? {
        Next::Closed => Ok(()),
        Next::Connect(request) => bridge_connect(state, client, request).await,
    }
}

/// HTTP/1.1 read loop over one client connection, plain or decrypted.
async fn serve_requests<S>(
    state: &Arc<ProxyState>,
    stream: &mut S,
    tunnel: Option<&str>,
) -> Result<Next, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut parser = RequestParser::new();
    loop {
        let Some(request) = wire::read_request(stream, &mut parser).await? else {
            return Ok(Next::Closed);
        };

        if request.line.method.eq_ignore_ascii_case("CONNECT") {
            if tunnel.is_none() {
                return Ok(Next::Connect(request));
            }
            let refusal = simple_response(
                400,
                "Bad Request",
                "text/plain; charset=utf-8",
                b"CONNECT inside a tunnel is not supported\n".to_vec(),
            );
            write_response(stream, &refusal).await?;
            return Ok(Next::Closed);
        }

        if !handle_request(state, stream, request, tunnel).await? {
            return Ok(Next::Closed);
        }
    }
}

/// Serve one request. Returns whether the connection stays open.
async fn handle_request<S>(
    state: &Arc<ProxyState>,
    client: &mut S,
    request: Request,
    tunnel: Option<&str>,
) -> Result<bool, ProxyError>
where
    S: AsyncWrite + Unpin,
{
    let method = request.line.method.clone();
    let client_close = request.wants_close();

    let (response, mut close) = match state.route(request, tunnel) {
        Route::Upstream(request) => {
            state
                .process(Transaction::new(request, Provenance::Browser))
                .await
        }
        Route::Local(request) => (
            landing::respond(&request, &state.certificates.ca().cert_pem),
            false,
        ),
        Route::Invalid(reason) => (
            simple_response(
                400,
                "Bad Request",
                "text/plain; charset=utf-8",
                format!("{reason}\n").into_bytes(),
            ),
            true,
        ),
    };

    write_response(client, &response).await?;
    close |= response
        .parse()
        .map(|parsed| wire::ends_connection(&parsed, &method))
        .unwrap_or(true);
    Ok(!(client_close || close))
}

async fn write_response<S>(client: &mut S, response: &HttpResponse) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    client.write_all(&response.dump).await?;
    client.flush().await?;
    Ok(())
}

/// Terminate TLS for a CONNECT tunnel and serve the decrypted requests.
async fn bridge_connect(
    state: Arc<ProxyState>,
    mut client: TcpStream,
    request: Request,
) -> Result<(), ProxyError> {
    let (host, port) = split_authority(&request.line.target);
    let host = host.to_string();
    if host.is_empty() {
        let refusal = simple_response(
            400,
            "Bad Request",
            "text/plain; charset=utf-8",
            b"CONNECT target must be host:port\n".to_vec(),
        );
        return write_response(&mut client, &refusal).await;
    }
    let authority = join_authority(&host, port.unwrap_or(443), 443);

    // Mint the certificate before answering so failures reach the client as
    // an HTTP error rather than a broken handshake.
    let manager = Arc::clone(&state.certificates);
    let server_name = host.clone();
    let acceptor = tokio::task::spawn_blocking(move || build_acceptor(&manager, Some(&server_name)))
        .await
        .map_err(|err| ProxyError::Runtime(err.to_string()))?;
    let acceptor = match acceptor {
        Ok(acceptor) => acceptor,
        Err(err) => {
            let failure = simple_response(
                502,
                "Bad Gateway",
                "text/plain; charset=utf-8",
                format!("could not issue a certificate for {host}\n").into_bytes(),
            );
            write_response(&mut client, &failure).await?;
            return Err(err.into());
        }
    };

    client.write_all(TUNNEL_ESTABLISHED).await?;
    client.flush().await?;

    let ssl = Ssl::new(acceptor.context()).map_err(TlsError::from)?;
    let mut tls = SslStream::new(ssl, client).map_err(TlsError::from)?;
    timeout(
        state.config.upstream.handshake_timeout(),
        Pin::new(&mut tls).accept(),
    )
    .await
    .map_err(|_| ProxyError::Timeout("client TLS handshake"))?
    .map_err(|err| ProxyError::Runtime(format!("client TLS handshake: {err}")))?;
    debug!(%authority, "tunnel established");

    serve_requests(&state, &mut tls, Some(&authority)).await?;
    let _ = tls.shutdown().await;
    Ok(())
}
