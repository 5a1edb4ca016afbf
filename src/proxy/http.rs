//! Plain HTTP proxy engine
//!
//! Drives a single HTTP exchange through the plugin pipeline: normalize the
//! request, run `on_request` hooks (a mock short-circuits the exchange),
//! apply the last matching redirect target, send the request upstream over
//! a shared client, run `on_response` hooks, then emit the response with
//! hop-by-hop headers stripped.

use std::time::Duration;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::plugin::{InterceptedResponse, MockResponse, PluginContext, PluginRegistry, Target};
use crate::proxy::body::{self, full_body, status_response, ProxyBody};
use crate::{Error, Result};

/// Shared engine for plain (and MITM-decrypted) HTTP exchanges.
#[derive(Debug)]
pub struct HttpEngine {
    registry: Arc<PluginRegistry>,
    client: reqwest::Client,
}

impl HttpEngine {
    /// Build the engine and its shared upstream client.
    ///
    /// The client dials with a 30 s connect timeout and 30 s TCP keep-alive,
    /// keeps up to 100 idle connections for 90 s, honors the system proxy
    /// environment, never negotiates HTTP/2, never follows redirects, and
    /// never decompresses bodies on its own.
    pub fn new(registry: Arc<PluginRegistry>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .http1_only()
            .redirect(reqwest::redirect::Policy::none())
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .no_zstd()
            .build()
            .map_err(|e| Error::config(format!("failed to build upstream client: {e}")))?;

        Ok(Self { registry, client })
    }

    /// Proxy one HTTP exchange. Failures become responses, never errors.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: hyper::body::Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let (mut parts, inbound_body) = req.into_parts();

        body::strip_hop_by_hop(&mut parts.headers);
        let Some(uri) = absolute_uri(&parts) else {
            return status_response(StatusCode::BAD_REQUEST, "missing request host");
        };
        parts.uri = uri;

        let hostname = parts.uri.host().unwrap_or_default().to_owned();
        info!("[HTTP] {} {} (host: {})", parts.method, parts.uri, hostname);

        let matches = self.registry.match_for_request(&parts);

        // on_request pass: a mock ends the exchange, later targets overwrite
        // earlier ones.
        let mut selected_target: Option<Target> = None;
        if !matches.is_empty() {
            debug!("[HTTP] {} plugin(s) matched for {}", matches.len(), hostname);
            let mut ctx = PluginContext::for_request(&mut parts);
            for plugin in &matches {
                if let Some(hook) = &plugin.on_request {
                    hook(&mut ctx);
                    if let Some(mock) = ctx.take_mock() {
                        info!("[PLUGIN] mock response for {}", hostname);
                        return mock_response(mock);
                    }
                }
                if let Some(target) = &plugin.target {
                    selected_target = Some(target.clone());
                }
            }
        }

        if let Some(target) = &selected_target {
            let host_port = target.host_port();
            info!("[PLUGIN] forwarding {} -> {}://{}", hostname, target.scheme, host_port);
            match rewrite_authority(&parts.uri, target.scheme.as_str(), &host_port) {
                Some(uri) => parts.uri = uri,
                None => return status_response(StatusCode::BAD_GATEWAY, "invalid forward target"),
            }
            if let Ok(value) = HeaderValue::from_str(&host_port) {
                parts.headers.insert(HOST, value);
            }
        }

        // Buffer the inbound body so the outbound request owns its bytes.
        let request_body = match inbound_body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                error!("[HTTP] failed to read request body: {}", e);
                return status_response(StatusCode::BAD_GATEWAY, &e.to_string());
            }
        };

        let mut outbound_headers = parts.headers.clone();
        body::strip_hop_by_hop(&mut outbound_headers);
        // reqwest derives Host and Content-Length from the URL and body.
        outbound_headers.remove(HOST);
        outbound_headers.remove(CONTENT_LENGTH);

        let upstream = self
            .client
            .request(parts.method.clone(), parts.uri.to_string())
            .headers(outbound_headers)
            .body(request_body)
            .send()
            .await;

        let upstream = match upstream {
            Ok(response) => response,
            Err(e) => {
                let host = parts.uri.host().unwrap_or_default().to_owned();
                let error = Error::upstream_dial(host, e.to_string());
                error!("[HTTP] {}", error);
                return status_response(StatusCode::BAD_GATEWAY, &error.to_string());
            }
        };

        let status = upstream.status();
        let mut headers = upstream.headers().clone();

        let wants_response_hooks = matches.iter().any(|p| p.on_response.is_some());
        if wants_response_hooks {
            // Hooks observe a fully buffered body they can decode and replace.
            let upstream_body = match upstream.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    let error = Error::UpstreamRead(e.to_string());
                    error!("[HTTP] {} ({})", error, parts.uri);
                    return status_response(StatusCode::BAD_GATEWAY, &error.to_string());
                }
            };

            let mut intercepted = InterceptedResponse::new(status, headers, upstream_body);
            let mut ctx = PluginContext::for_exchange(&mut parts, &mut intercepted);
            for plugin in &matches {
                if let Some(hook) = &plugin.on_response {
                    hook(&mut ctx);
                }
            }

            let (status, mut headers, response_body) = intercepted.into_parts();
            body::strip_hop_by_hop(&mut headers);
            return assemble(status, headers, full_body(response_body));
        }

        // No response hooks: stream the body straight through.
        body::strip_hop_by_hop(&mut headers);
        let stream = upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(std::io::Error::other);
        assemble(status, headers, StreamBody::new(stream).boxed_unsync())
    }
}

/// Build the absolute request URI, defaulting the scheme to `http` and the
/// authority to the `Host` header.
fn absolute_uri(parts: &http::request::Parts) -> Option<Uri> {
    let scheme = parts.uri.scheme_str().unwrap_or("http");
    let authority = parts
        .uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            parts
                .headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        })
        .filter(|a| !a.is_empty())?;
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .ok()
}

/// Swap scheme and authority on an absolute URI, keeping the path.
fn rewrite_authority(uri: &Uri, scheme: &str, authority: &str) -> Option<Uri> {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .ok()
}

fn assemble(status: StatusCode, headers: HeaderMap, body: ProxyBody) -> Response<ProxyBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn mock_response(mock: MockResponse) -> Response<ProxyBody> {
    let MockResponse {
        status,
        headers,
        body,
    } = mock;

    let mut map = HeaderMap::new();
    for (name, value) in &headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.insert(name, value);
        }
    }

    assemble(
        StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
        map,
        full_body(body.into_bytes()),
    )
}
