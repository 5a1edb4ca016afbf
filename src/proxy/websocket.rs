//! WebSocket upgrade shuttle
//!
//! Replays a client's WebSocket upgrade onto the backend over a raw
//! connection, mirrors the backend's `101` to the client, then pumps bytes
//! in both directions without interpreting frames. A plugin target may
//! redirect the upgrade to a different backend; the original path is
//! preserved.

use std::io;
use std::sync::Arc;

use http::header::{CONNECTION, HOST, UPGRADE};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Version};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use crate::plugin::{strip_port, PluginRegistry, TargetScheme};
use crate::proxy::body::{full_body, status_response, ProxyBody};
use crate::Error;

/// Backend stream: raw TCP for `ws`, TLS for `wss`.
trait BackendIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> BackendIo for T {}

#[derive(Debug)]
pub struct WebSocketShuttle {
    registry: Arc<PluginRegistry>,
}

impl WebSocketShuttle {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    /// Shuttle one WebSocket upgrade. `is_secure` distinguishes `ws://`
    /// from MITM-decrypted `wss://` context.
    pub async fn handle_upgrade<B>(&self, mut req: Request<B>, is_secure: bool) -> Response<ProxyBody> {
        let host_header = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .or_else(|| req.uri().authority().map(|a| a.to_string()));
        let Some(host_header) = host_header else {
            return status_response(StatusCode::BAD_REQUEST, "missing Host header");
        };
        let hostname = strip_port(&host_header).to_owned();

        let mut path = req.uri().path().to_owned();
        if let Some(query) = req.uri().query() {
            path.push('?');
            path.push_str(query);
        }

        let protocol = if is_secure { "wss" } else { "ws" };
        info!("[UPGRADE] {} {}{}", protocol, host_header, path);

        // One plugin decides the backend; the path is preserved.
        let mut target_host = host_header.clone();
        let mut target_protocol = protocol;
        if let Some(plugin) = self.registry.match_first(&hostname) {
            if let Some(target) = &plugin.target {
                target_host = target.host_port();
                target_protocol = match target.scheme {
                    TargetScheme::Http | TargetScheme::Ws => "ws",
                    TargetScheme::Https | TargetScheme::Wss => "wss",
                };
                info!(
                    "[PLUGIN WS] forwarding {} -> {}://{}{}",
                    hostname, target_protocol, target_host, path
                );
            }
        }

        let dial_host = if target_host.contains(':') {
            target_host.clone()
        } else if target_protocol == "wss" {
            format!("{target_host}:443")
        } else {
            format!("{target_host}:80")
        };

        let mut backend = match dial_backend(&dial_host, target_protocol == "wss").await {
            Ok(stream) => stream,
            Err(e) => {
                error!("[WS] {}", e);
                return status_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };

        // The raw client stream is required past this point.
        let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
            return status_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &Error::HijackUnsupported.to_string(),
            );
        };

        if let Err(e) = write_upgrade_request(&mut backend, &req, &path, &target_host).await {
            error!("[WS] failed to replay upgrade to {}: {}", dial_host, e);
            return status_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }

        let (read_half, write_half) = tokio::io::split(backend);
        let mut backend_reader = BufReader::new(read_half);

        let mut status_line = String::new();
        if let Err(e) = backend_reader.read_line(&mut status_line).await {
            error!("[WS] failed to read backend status line: {}", e);
            return status_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
        let status_line = status_line.trim_end();
        info!("[UPGRADE] backend status: {}", status_line);

        let status = parse_status_line(status_line);
        let headers = match read_header_block(&mut backend_reader).await {
            Ok(headers) => headers,
            Err(e) => {
                error!("[WS] failed to read backend headers: {}", e);
                return status_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };

        if status != StatusCode::SWITCHING_PROTOCOLS {
            // Forward the refusal verbatim and close.
            warn!("[UPGRADE] backend did not switch protocols: {}", status_line);
            let mut body = Vec::new();
            let _ = backend_reader.read_to_end(&mut body).await;
            let mut response = Response::new(full_body(body));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            return response;
        }

        // Mirror the 101 to the client; once hyper completes the upgrade,
        // pump bytes until either side closes. Data the backend sent right
        // after its 101 sits in the BufReader and drains to the client
        // first.
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    error!("[WS] client upgrade failed: {}", e);
                    return;
                }
            };
            let mut client = TokioIo::new(upgraded);
            let mut backend = tokio::io::join(backend_reader, write_half);
            match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                Ok((to_backend, to_client)) => debug!(
                    "[WS] closed (client->backend {} bytes, backend->client {} bytes)",
                    to_backend, to_client
                ),
                Err(e) => debug!("[WS] pump ended: {}", e),
            }
        });

        let mut response = Response::new(full_body(Vec::new()));
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = headers;
        response
    }
}

async fn dial_backend(dial_host: &str, secure: bool) -> Result<Box<dyn BackendIo>, Error> {
    let tcp = TcpStream::connect(dial_host)
        .await
        .map_err(|e| Error::upstream_dial(dial_host, e.to_string()))?;
    if !secure {
        return Ok(Box::new(tcp));
    }

    // Development tool: the wss backend's certificate is deliberately not
    // verified, matching the insecure dial the proxy has always done.
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(strip_port(dial_host).to_owned())
        .map_err(|e| Error::upstream_dial(dial_host, format!("invalid server name: {e}")))?;
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::upstream_dial(dial_host, e.to_string()))?;
    Ok(Box::new(tls))
}

/// Manually frame the upgrade onto the backend: request line, forced
/// `Host`, re-injected `Connection: Upgrade` and `Upgrade: websocket`, then
/// the remaining headers.
async fn write_upgrade_request<B>(
    backend: &mut Box<dyn BackendIo>,
    req: &Request<B>,
    path: &str,
    target_host: &str,
) -> io::Result<()> {
    let mut frame = format!("{} {} {}\r\n", req.method(), path, version_str(req.version()));
    frame.push_str(&format!("Host: {target_host}\r\n"));
    frame.push_str("Connection: Upgrade\r\n");
    frame.push_str("Upgrade: websocket\r\n");
    for (name, value) in req.headers() {
        if name == HOST || name == CONNECTION || name == UPGRADE {
            continue;
        }
        if let Ok(value) = value.to_str() {
            frame.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    frame.push_str("\r\n");

    backend.write_all(frame.as_bytes()).await?;
    backend.flush().await
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

fn parse_status_line(line: &str) -> StatusCode {
    line.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::BAD_GATEWAY)
}

/// Read header lines up to and including the blank line.
async fn read_header_block<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> io::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed during headers",
            ));
        }
        let line = line.trim_end();
        if line.is_empty() {
            return Ok(headers);
        }
        if let Some((name, value)) = line.split_once(':') {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.trim().as_bytes()),
                HeaderValue::from_str(value.trim()),
            ) {
                headers.append(name, value);
            }
        }
    }
}

/// Certificate verifier that accepts everything (wss backend dial only).
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_parsing() {
        assert_eq!(
            parse_status_line("HTTP/1.1 101 Switching Protocols"),
            StatusCode::SWITCHING_PROTOCOLS
        );
        assert_eq!(parse_status_line("HTTP/1.1 403 Forbidden"), StatusCode::FORBIDDEN);
        assert_eq!(parse_status_line("garbage"), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn header_block_parsing() {
        let raw = b"Upgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: abc=\r\n\r\nframe-data";
        let mut reader = BufReader::new(&raw[..]);
        let headers = read_header_block(&mut reader).await.unwrap();

        assert_eq!(headers.get(UPGRADE).unwrap(), "websocket");
        assert_eq!(headers.get("sec-websocket-accept").unwrap(), "abc=");

        // Bytes after the blank line stay in the reader for the pump.
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"frame-data");
    }

    #[tokio::test]
    async fn header_block_eof_is_an_error() {
        let raw = b"Upgrade: websocket\r\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_header_block(&mut reader).await.is_err());
    }
}
