use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use sluice_proxy::{
    DROP_STATUS, InterceptError, NullNotifier, ProxyConfig, ProxyServer, RequestEdit, StoreEvent,
    event_channel,
};
use sluice_store::{ChunkKind, HttpRequest, Provenance, StoreError, Transaction};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::StreamExt;

struct Harness {
    proxy: ProxyServer,
    addr: SocketAddr,
    _dir: TempDir,
}

async fn start_proxy(configure: impl FnOnce(&mut ProxyConfig)) -> Harness {
    start_proxy_with(configure, Arc::new(NullNotifier)).await
}

async fn start_proxy_with(
    configure: impl FnOnce(&mut ProxyConfig),
    notifier: Arc<dyn sluice_proxy::TransactionNotifier>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ProxyConfig::default();
    config.listen.port = 0;
    config.tls.ca_cert_dir = dir.path().to_string_lossy().into_owned();
    config.upstream.response_timeout_secs = 5;
    configure(&mut config);

    let proxy = ProxyServer::from_config(config, notifier).unwrap();
    let listener = proxy.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = proxy.clone();
    tokio::spawn(async move { server.serve(listener).await });
    Harness {
        proxy,
        addr,
        _dir: dir,
    }
}

struct Upstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

/// Plain HTTP origin that answers every request with its own target.
async fn spawn_upstream() -> Upstream {
    spawn_slow_upstream(Duration::ZERO).await
}

/// Like [`spawn_upstream`], but waits `delay` before answering.
async fn spawn_slow_upstream(delay: Duration) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buffer = [0u8; 1024];
                while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                    let n = stream.read(&mut buffer).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    request.extend_from_slice(&buffer[..n]);
                }
                let text = String::from_utf8_lossy(&request).into_owned();
                let target = text.split(' ').nth(1).unwrap_or("").to_string();
                tokio::time::sleep(delay).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    target.len(),
                    target
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    Upstream { addr, hits }
}

fn get(upstream: SocketAddr, path: &str) -> String {
    format!("GET http://{upstream}{path} HTTP/1.1\r\nHost: {upstream}\r\nConnection: close\r\n\r\n")
}

async fn send_through(proxy: SocketAddr, request: String) -> String {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn forwards_and_records_without_interception() {
    let upstream = spawn_upstream().await;
    let (notifier, mut events) = event_channel();
    let harness = start_proxy_with(|_| {}, Arc::new(notifier)).await;

    let response = send_through(harness.addr, get(upstream.addr, "/plain?x=1")).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("/plain?x=1"));

    let recorded = harness.proxy.store().get_all();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].seq_number, 1);
    assert_eq!(
        recorded[0].request.url(),
        Some(format!("http://{}/plain?x=1", upstream.addr))
    );
    assert_eq!(recorded[0].request.target().as_deref(), Some("/plain?x=1"));

    let event = events.next().await.unwrap();
    assert_matches!(event, StoreEvent::Added(summary) if summary.status_code == Some(200));
}

#[tokio::test]
async fn auto_forward_releases_queued_request() {
    let upstream = spawn_upstream().await;
    let harness = start_proxy(|config| config.intercept.enabled_on_start = true).await;

    let client = tokio::spawn(send_through(harness.addr, get(upstream.addr, "/")));
    wait_until(|| harness.proxy.queue().count() == 1).await;

    let pending = harness.proxy.pending_requests();
    assert_eq!(pending.len(), 1);
    harness.proxy.forward_request(&pending[0].id, false).unwrap();

    let response = client.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("\r\n\r\n/"));
    assert_eq!(harness.proxy.queue().count(), 0);

    let recorded = harness.proxy.store().get_all();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].response.is_some());
    assert!(recorded[0].auto_forwarded);
    assert!(!recorded[0].was_dropped);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropped_request_never_reaches_upstream() {
    let upstream = spawn_upstream().await;
    let harness = start_proxy(|config| config.intercept.enabled_on_start = true).await;

    let client = tokio::spawn(send_through(harness.addr, get(upstream.addr, "/secret")));
    wait_until(|| harness.proxy.queue().count() == 1).await;
    let id = harness.proxy.queue().get_all()[0].id.clone();
    harness.proxy.drop_request(&id).unwrap();

    let response = client.await.unwrap();
    assert!(response.starts_with(&format!("HTTP/1.1 {DROP_STATUS}")));

    let recorded = harness.proxy.store().get_all();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].was_dropped);
    assert!(recorded[0].response.is_none());
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
    assert_matches!(
        harness.proxy.drop_request(&id),
        Err(InterceptError::NotFound(_))
    );
}

#[tokio::test]
async fn disabling_interception_releases_everything() {
    let upstream = spawn_upstream().await;
    let harness = start_proxy(|config| config.intercept.enabled_on_start = true).await;

    let clients: Vec<_> = ["/one", "/two", "/three"]
        .into_iter()
        .map(|path| tokio::spawn(send_through(harness.addr, get(upstream.addr, path))))
        .collect();
    wait_until(|| harness.proxy.queue().count() == 3).await;

    assert_eq!(harness.proxy.set_intercept_enabled(false), 3);
    assert_eq!(harness.proxy.queue().count(), 0);
    assert!(!harness.proxy.intercept_enabled());

    for client in clients {
        let response = client.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
    }
    let mut sequence: Vec<u64> = harness
        .proxy
        .store()
        .get_all()
        .iter()
        .map(|transaction| transaction.seq_number)
        .collect();
    sequence.sort_unstable();
    assert_eq!(sequence, vec![1, 2, 3]);
}

#[tokio::test]
async fn modified_request_is_what_goes_upstream() {
    let upstream = spawn_upstream().await;
    let harness = start_proxy(|config| config.intercept.enabled_on_start = true).await;

    let client = tokio::spawn(send_through(harness.addr, get(upstream.addr, "/original")));
    wait_until(|| harness.proxy.queue().count() == 1).await;
    let id = harness.proxy.queue().get_all()[0].id.clone();

    let edit = RequestEdit {
        url: Some(format!("http://{}/edited", upstream.addr)),
        ..RequestEdit::default()
    };
    harness.proxy.modify_request(&id, edit).unwrap();

    let response = client.await.unwrap();
    assert!(response.ends_with("/edited"));
    let recorded = harness.proxy.store().get(&id).unwrap();
    assert_eq!(recorded.request.target().as_deref(), Some("/edited"));
}

#[tokio::test]
async fn intercepted_response_waits_for_review() {
    let upstream = spawn_upstream().await;
    let harness = start_proxy(|config| config.intercept.enabled_on_start = true).await;

    let client = tokio::spawn(send_through(harness.addr, get(upstream.addr, "/review")));
    wait_until(|| harness.proxy.queue().count() == 1).await;
    let id = harness.proxy.queue().get_all()[0].id.clone();

    harness.proxy.forward_request(&id, true).unwrap();
    wait_until(|| harness.proxy.pending_responses().len() == 1).await;
    wait_until(|| harness.proxy.store().len() == 1).await;
    assert!(harness.proxy.pending_requests().is_empty());
    assert_matches!(
        harness.proxy.modify_request(&id, RequestEdit::default()),
        Err(InterceptError::AlreadyForwarding(_))
    );
    assert!(!client.is_finished());

    harness
        .proxy
        .modify_response(&id, "HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nreviewed")
        .unwrap();

    let response = client.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 201 Created\r\nContent-Length: 8\r\n"));
    assert!(response.ends_with("reviewed"));

    let recorded = harness.proxy.store().get_all();
    assert_eq!(recorded.len(), 1);
    assert_eq!(
        recorded[0].response.as_ref().and_then(|r| r.status_code()),
        Some(201)
    );
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn control_operations_reject_unknown_ids() {
    let harness = start_proxy(|_| {}).await;
    assert_matches!(
        harness.proxy.forward_request("missing", false),
        Err(InterceptError::NotFound(_))
    );
    assert_matches!(
        harness.proxy.modify_request("missing", RequestEdit::default()),
        Err(InterceptError::NotFound(_))
    );
    assert_matches!(
        harness.proxy.modify_response("missing", "HTTP/1.1 200 OK\r\n\r\n"),
        Err(InterceptError::NotFound(_))
    );
}

#[tokio::test]
async fn unreachable_upstream_becomes_bad_gateway() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);
    let harness = start_proxy(|_| {}).await;

    let response = send_through(harness.addr, get(addr, "/")).await;
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"));
    let recorded = harness.proxy.store().get_all();
    assert_eq!(recorded.len(), 1);
    assert_eq!(
        recorded[0].response.as_ref().and_then(|r| r.status_code()),
        Some(502)
    );
}

#[tokio::test]
async fn keep_alive_serves_pipelined_requests() {
    let upstream = spawn_upstream().await;
    let harness = start_proxy(|_| {}).await;

    let request = format!(
        "GET http://{0}/first HTTP/1.1\r\nHost: {0}\r\n\r\n{1}",
        upstream.addr,
        get(upstream.addr, "/second")
    );
    let response = send_through(harness.addr, request).await;
    assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2);
    assert!(response.ends_with("/second"));
    assert_eq!(harness.proxy.store().len(), 2);
}

#[tokio::test]
async fn requests_to_the_proxy_serve_the_landing_page() {
    let harness = start_proxy(|_| {}).await;

    let page = send_through(
        harness.addr,
        format!(
            "GET http://{0}/ HTTP/1.1\r\nHost: {0}\r\nConnection: close\r\n\r\n",
            harness.addr
        ),
    )
    .await;
    assert!(page.starts_with("HTTP/1.1 200 OK"));
    assert!(page.contains("/download-ca"));

    let ca = send_through(
        harness.addr,
        "GET /download-ca HTTP/1.1\r\nHost: sluice\r\nConnection: close\r\n\r\n".to_string(),
    )
    .await;
    assert!(ca.contains("Content-Type: application/x-x509-ca-cert"));
    assert!(ca.contains("Content-Disposition: attachment"));
    assert!(ca.contains("-----BEGIN CERTIFICATE-----"));
    assert!(harness.proxy.store().is_empty());
}

#[tokio::test]
async fn history_chunks_are_bounded() {
    let harness = start_proxy(|config| config.history.chunk_size_bytes = 100).await;

    let mut dump = b"POST /upload HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec();
    dump.resize(300, b'x');
    let transaction = Transaction::new(
        HttpRequest::new("example.com", dump.clone(), false),
        Provenance::Scripted,
    );
    let original_id = transaction.id.clone();
    let stored = harness.proxy.add_transaction_to_history(transaction).unwrap();
    assert_ne!(stored.id, original_id);
    assert_eq!(stored.provenance, Provenance::Scripted);

    let metadata = harness.proxy.transaction_metadata(&stored.id).unwrap();
    assert_eq!(metadata.request_chunks, 3);
    assert!(!metadata.has_response);

    let mut joined = Vec::new();
    for index in 0..metadata.request_chunks {
        let chunk = harness
            .proxy
            .transaction_chunk(&stored.id, ChunkKind::Request, index)
            .unwrap();
        joined.extend_from_slice(&chunk.data);
    }
    assert_eq!(joined, dump);

    assert_matches!(
        harness.proxy.transaction_chunk(&stored.id, ChunkKind::Request, 5),
        Err(StoreError::ChunkOutOfRange { index: 5, total: 3 })
    );
}

#[tokio::test]
async fn forwarded_request_can_no_longer_be_dropped() {
    let upstream = spawn_slow_upstream(Duration::from_millis(300)).await;
    let harness = start_proxy(|config| config.intercept.enabled_on_start = true).await;

    let client = tokio::spawn(send_through(harness.addr, get(upstream.addr, "/slow")));
    wait_until(|| harness.proxy.queue().count() == 1).await;
    let id = harness.proxy.queue().get_all()[0].id.clone();

    harness.proxy.forward_request(&id, false).unwrap();
    wait_until(|| upstream.hits.load(Ordering::SeqCst) == 1).await;
    assert_matches!(
        harness.proxy.drop_request(&id),
        Err(InterceptError::AlreadyForwarding(_))
    );

    let response = client.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let recorded = harness.proxy.store().get_all();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].auto_forwarded);
    assert!(!recorded[0].was_dropped);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disabling_during_a_forward_fetches_once() {
    let upstream = spawn_slow_upstream(Duration::from_millis(300)).await;
    let harness = start_proxy(|config| config.intercept.enabled_on_start = true).await;

    let auto = tokio::spawn(send_through(harness.addr, get(upstream.addr, "/auto")));
    wait_until(|| harness.proxy.queue().count() == 1).await;
    let auto_id = harness.proxy.queue().get_all()[0].id.clone();
    harness.proxy.forward_request(&auto_id, false).unwrap();

    let review = tokio::spawn(send_through(harness.addr, get(upstream.addr, "/review")));
    wait_until(|| harness.proxy.queue().count() == 2).await;
    let review_id = harness
        .proxy
        .pending_requests()
        .into_iter()
        .map(|transaction| transaction.id)
        .find(|id| *id != auto_id)
        .unwrap();
    harness.proxy.forward_request(&review_id, true).unwrap();
    wait_until(|| upstream.hits.load(Ordering::SeqCst) == 2).await;

    // Both requests are already upstream, so nothing is released early.
    assert_eq!(harness.proxy.set_intercept_enabled(false), 0);

    let auto = auto.await.unwrap();
    assert!(auto.ends_with("/auto"));
    let review = review.await.unwrap();
    assert!(review.ends_with("/review"));

    assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);
    assert_eq!(harness.proxy.queue().count(), 0);
    assert_eq!(harness.proxy.store().len(), 2);
}

#[tokio::test]
async fn full_queue_refuses_instead_of_forwarding() {
    let upstream = spawn_upstream().await;
    let harness = start_proxy(|config| {
        config.intercept.enabled_on_start = true;
        config.intercept.queue_capacity = 1;
    })
    .await;

    let held = tokio::spawn(send_through(harness.addr, get(upstream.addr, "/held")));
    wait_until(|| harness.proxy.queue().count() == 1).await;

    let refused = send_through(harness.addr, get(upstream.addr, "/overflow")).await;
    assert!(refused.starts_with("HTTP/1.1 503 Service Unavailable"));
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
    assert!(harness.proxy.store().is_empty());

    assert_eq!(harness.proxy.set_intercept_enabled(false), 1);
    assert!(held.await.unwrap().ends_with("/held"));
}
