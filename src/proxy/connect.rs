//! CONNECT tunneling and TLS interception
//!
//! Every CONNECT is answered with `200 Connection Established` and the
//! client stream is hijacked. Traffic to port 443 or to a host matched by a
//! plugin is sniffed: a leading `0x16` byte (TLS handshake record) routes
//! the stream into a per-host loopback TLS server that terminates TLS with
//! a synthesized certificate and feeds the decrypted requests back through
//! the HTTP engine or the WebSocket shuttle. Anything else is spliced to
//! the origin unchanged, the sniffed byte included.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use http::header::HOST;
use http::{HeaderValue, Request, Response, Uri};
use hyper::ext::ReasonPhrase;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use rustls::version::{TLS12, TLS13};
use rustls::ServerConfig;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::cert::CertificateManager;
use crate::plugin::PluginRegistry;
use crate::proxy::body::{self, empty_body, status_response, ProxyBody};
use crate::proxy::http::HttpEngine;
use crate::proxy::websocket::WebSocketShuttle;
use crate::{Error, Result};

/// TLS record type for a handshake, the first byte of a ClientHello.
const TLS_HANDSHAKE_BYTE: u8 = 0x16;

/// Dial timeout for raw tunnels and loopback connections.
const TUNNEL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the loopback TLS handshake.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A per-host loopback TLS terminator. The listener is owned by its accept
/// task for the process lifetime; the pool keeps the port.
#[derive(Debug, Clone)]
struct MitmServer {
    port: u16,
}

/// Handles CONNECT requests and owns the MITM server pool.
#[derive(Debug)]
pub struct ConnectHandler {
    registry: Arc<PluginRegistry>,
    certs: Arc<CertificateManager>,
    http: Arc<HttpEngine>,
    ws: Arc<WebSocketShuttle>,
    servers: RwLock<HashMap<String, MitmServer>>,
}

impl ConnectHandler {
    pub fn new(
        registry: Arc<PluginRegistry>,
        certs: Arc<CertificateManager>,
        http: Arc<HttpEngine>,
        ws: Arc<WebSocketShuttle>,
    ) -> Self {
        Self {
            registry,
            certs,
            http,
            ws,
            servers: RwLock::new(HashMap::new()),
        }
    }

    /// Answer a CONNECT request. The tunnel itself runs on a spawned task
    /// once hyper completes the upgrade.
    pub async fn handle_tunnel<B>(self: &Arc<Self>, mut req: Request<B>) -> Response<ProxyBody> {
        let Some(authority) = req.uri().authority().cloned() else {
            return status_response(
                http::StatusCode::BAD_REQUEST,
                "CONNECT requires a host:port authority",
            );
        };
        let hostname = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        let port = authority.port_u16().unwrap_or(443);

        info!("[CONNECT] {}:{}", hostname, port);

        let should_intercept = port == 443 || self.registry.match_first(&hostname).is_some();

        let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
            return status_response(
                http::StatusCode::INTERNAL_SERVER_ERROR,
                &Error::HijackUnsupported.to_string(),
            );
        };

        let handler = Arc::clone(self);
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    error!("[CONNECT] hijack failed for {}:{}: {}", hostname, port, e);
                    return;
                }
            };
            let client = TokioIo::new(upgraded);

            if should_intercept {
                handler.intercept(client, hostname, port).await;
            } else {
                debug!(
                    "[CONNECT] no plugin match for {}:{}, tunneling directly",
                    hostname, port
                );
                handler.tunnel_direct(client, &hostname, port, &[]).await;
            }
        });

        let mut response = Response::new(empty_body());
        response
            .headers_mut()
            .insert("proxy-agent", HeaderValue::from_static("echo"));
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        response
    }

    /// Sniff the first byte of the hijacked stream and route it.
    async fn intercept(
        self: &Arc<Self>,
        mut client: impl AsyncRead + AsyncWrite + Unpin + Send + 'static,
        hostname: String,
        port: u16,
    ) {
        let mut first = [0u8; 1];
        if let Err(e) = client.read_exact(&mut first).await {
            debug!("[CONNECT] client closed before first byte: {}", e);
            return;
        }

        if first[0] == TLS_HANDSHAKE_BYTE {
            self.mitm(client, first[0], &hostname).await;
        } else {
            info!(
                "[CONNECT] non-TLS traffic on {}:{}, bypassing interception",
                hostname, port
            );
            self.tunnel_direct(client, &hostname, port, &first).await;
        }
    }

    /// Splice the client to the origin. `prefix` holds bytes already read
    /// by the sniffer; they reach the origin first.
    async fn tunnel_direct(
        &self,
        client: impl AsyncRead + AsyncWrite + Unpin + Send + 'static,
        hostname: &str,
        port: u16,
        prefix: &[u8],
    ) {
        let addr = if hostname.contains(':') {
            format!("[{hostname}]:{port}")
        } else {
            format!("{hostname}:{port}")
        };

        let target = match timeout(TUNNEL_DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("[TUNNEL] {}", Error::tunnel(&addr, e.to_string()));
                return;
            }
            Err(_) => {
                error!("[TUNNEL] {}", Error::tunnel(&addr, "dial timed out"));
                return;
            }
        };

        splice(client, target, prefix).await;
    }

    /// Feed the hijacked stream into this host's loopback TLS server.
    async fn mitm(
        self: &Arc<Self>,
        client: impl AsyncRead + AsyncWrite + Unpin + Send + 'static,
        first_byte: u8,
        hostname: &str,
    ) {
        let server = match self.mitm_server(hostname).await {
            Ok(server) => server,
            Err(e) => {
                // No TLS handshake has happened; dropping the client closes it.
                error!("[MITM] failed to start server for {}: {}", hostname, e);
                return;
            }
        };

        let local = match timeout(
            TUNNEL_DIAL_TIMEOUT,
            TcpStream::connect(("127.0.0.1", server.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("[MITM] loopback dial failed for {}: {}", hostname, e);
                return;
            }
            Err(_) => {
                error!("[MITM] loopback dial timed out for {}", hostname);
                return;
            }
        };

        splice(client, local, &[first_byte]).await;
    }

    /// Get or create the loopback TLS server for `hostname`. First-insert
    /// is serialized by the write lock, so one server exists per host.
    async fn mitm_server(self: &Arc<Self>, hostname: &str) -> Result<MitmServer> {
        if let Some(server) = self.servers.read().await.get(hostname) {
            return Ok(server.clone());
        }

        let mut servers = self.servers.write().await;
        if let Some(server) = servers.get(hostname) {
            return Ok(server.clone());
        }

        // Issue the certificate before accepting anything: a signing
        // failure must close the client with no TLS handshake.
        self.certs.get_certificate(hostname)?;

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        info!("[MITM] dynamic server for {} on 127.0.0.1:{}", hostname, port);

        let mut tls = ServerConfig::builder_with_protocol_versions(&[&TLS12, &TLS13])
            .with_no_client_auth()
            .with_cert_resolver(self.certs.resolver(hostname));
        // HTTP/2 stays suppressed end to end.
        tls.alpn_protocols = vec![b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(tls));

        let handler = Arc::clone(self);
        let server_name = hostname.to_owned();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("[MITM] accept error for {}: {}", server_name, e);
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let handler = Arc::clone(&handler);
                let server_name = server_name.clone();
                tokio::spawn(async move {
                    let tls_stream =
                        match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                            Ok(Ok(stream)) => stream,
                            Ok(Err(e)) => {
                                debug!("[MITM] handshake failed for {}: {}", server_name, e);
                                return;
                            }
                            Err(_) => {
                                debug!("[MITM] handshake timed out for {}", server_name);
                                return;
                            }
                        };

                    let io = TokioIo::new(tls_stream);
                    let service = service_fn(move |req| {
                        let handler = Arc::clone(&handler);
                        let server_name = server_name.clone();
                        async move {
                            Ok::<_, Infallible>(handler.serve_decrypted(req, &server_name).await)
                        }
                    });

                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        debug!("[MITM] connection ended: {}", e);
                    }
                });
            }
        });

        let server = MitmServer { port };
        servers.insert(hostname.to_owned(), server.clone());
        Ok(server)
    }

    /// Handle a decrypted request from a loopback server: restore the
    /// `https` scheme and authority, then dispatch like the front door.
    async fn serve_decrypted(
        self: &Arc<Self>,
        req: Request<hyper::body::Incoming>,
        original_host: &str,
    ) -> Response<ProxyBody> {
        if body::is_websocket_upgrade(req.headers()) {
            info!("[MITM] websocket upgrade for {}", original_host);
            return self.ws.handle_upgrade(req, true).await;
        }

        let (mut parts, inbound_body) = req.into_parts();
        let authority = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .filter(|host| !host.is_empty())
            .unwrap_or(original_host)
            .to_owned();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        if let Ok(uri) = Uri::builder()
            .scheme("https")
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
        {
            parts.uri = uri;
        }

        info!("[MITM] {} {} (host: {})", parts.method, parts.uri, original_host);
        self.http.handle(Request::from_parts(parts, inbound_body)).await
    }
}

/// Pump bytes both ways until either side closes; the prefix is flushed to
/// `target` before splicing begins. Teardown is symmetric: when one
/// direction ends, the other is shut down and both streams drop.
async fn splice(
    mut client: impl AsyncRead + AsyncWrite + Unpin,
    mut target: TcpStream,
    prefix: &[u8],
) {
    if !prefix.is_empty() {
        if let Err(e) = target.write_all(prefix).await {
            debug!("[TUNNEL] failed to flush sniffed bytes: {}", e);
            return;
        }
    }

    match copy_bidirectional(&mut client, &mut target).await {
        Ok((to_target, to_client)) => debug!(
            "[TUNNEL] closed (client->origin {} bytes, origin->client {} bytes)",
            to_target, to_client
        ),
        Err(e) => debug!("[TUNNEL] ended: {}", e),
    }
}
