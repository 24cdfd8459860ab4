use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use openssl::nid::Nid;
use openssl::ssl::{Ssl, SslConnector, SslMethod};
use sluice_net::{CertificateManager, CertificateOptions, build_acceptor, generate_ca};
use sluice_proxy::{NullNotifier, ProxyConfig, ProxyServer};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_openssl::SslStream;

async fn start_proxy() -> (ProxyServer, SocketAddr, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ProxyConfig::default();
    config.listen.port = 0;
    config.tls.ca_cert_dir = dir.path().to_string_lossy().into_owned();
    let proxy = ProxyServer::from_config(config, Arc::new(NullNotifier)).unwrap();
    let listener = proxy.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = proxy.clone();
    tokio::spawn(async move { server.serve(listener).await });
    (proxy, addr, dir)
}

/// HTTPS origin with its own unrelated CA, answering with `secure <target>`.
async fn spawn_tls_upstream() -> SocketAddr {
    let ca = generate_ca("Upstream Test CA").unwrap();
    let manager = Arc::new(CertificateManager::new(ca, CertificateOptions::default()));
    let acceptor = build_acceptor(&manager, Some("127.0.0.1")).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let ssl = Ssl::new(acceptor.context()).unwrap();
            tokio::spawn(async move {
                let mut stream = SslStream::new(ssl, stream).unwrap();
                if Pin::new(&mut stream).accept().await.is_err() {
                    return;
                }
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
                let body = format!("secure {}", text.split(' ').nth(1).unwrap_or(""));
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// Open a CONNECT tunnel and complete a TLS handshake that trusts only the
/// proxy CA, verifying `server_name`.
async fn open_tunnel(
    proxy: &ProxyServer,
    proxy_addr: SocketAddr,
    target: SocketAddr,
    server_name: &str,
) -> SslStream<TcpStream> {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut reply = Vec::new();
    let mut byte = [0u8; 1];
    while !reply.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        reply.push(byte[0]);
    }
    assert!(reply.starts_with(b"HTTP/1.1 200 Connection Established"));

    let mut builder = SslConnector::builder(SslMethod::tls_client()).unwrap();
    builder
        .cert_store_mut()
        .add_cert(proxy.certificates().ca().cert.clone())
        .unwrap();
    let ssl = builder
        .build()
        .configure()
        .unwrap()
        .into_ssl(server_name)
        .unwrap();
    let mut tls = SslStream::new(ssl, stream).unwrap();
    Pin::new(&mut tls).connect().await.unwrap();
    tls
}

#[tokio::test]
async fn connect_tunnel_is_intercepted_and_recorded() {
    let upstream = spawn_tls_upstream().await;
    let (proxy, proxy_addr, _dir) = start_proxy().await;

    let mut tls = open_tunnel(&proxy, proxy_addr, upstream, "127.0.0.1").await;

    let leaf = tls.ssl().peer_certificate().unwrap();
    let issuer = leaf
        .issuer_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .unwrap()
        .data()
        .as_utf8()
        .unwrap()
        .to_string();
    assert_eq!(issuer, "Sluice Proxy CA");

    tls.write_all(b"GET /secret HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tls.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("secure /secret"));

    let recorded = proxy.store().get_all();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].request.tls);
    assert_eq!(
        recorded[0].request.url(),
        Some(format!("https://{upstream}/secret"))
    );
}

#[tokio::test]
async fn sni_selects_the_presented_certificate() {
    let upstream = spawn_tls_upstream().await;
    let (proxy, proxy_addr, _dir) = start_proxy().await;

    let mut tls = open_tunnel(&proxy, proxy_addr, upstream, "localhost").await;
    tls.write_all(b"GET /named HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tls.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).ends_with("secure /named"));

    // One leaf for the CONNECT target, one for the SNI name.
    assert_eq!(proxy.certificates().cached_hosts(), 2);
}
