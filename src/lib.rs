//! echo - an intercepting HTTP/HTTPS/WebSocket proxy for local development
//!
//! Clients configure the proxy as their forward proxy. TLS is terminated on
//! the fly with certificates signed by a user-supplied root CA, and every
//! decrypted exchange flows through a chain of user-defined plugins that
//! can inspect, mutate, mock, or redirect traffic.
//!
//! ## Features
//!
//! - **HTTP proxying**: standard forward proxying with a plugin pipeline
//! - **HTTPS interception**: CONNECT tunneling with protocol sniffing and
//!   per-host TLS termination
//! - **WebSocket support**: upgrade hijacking and transparent tunneling
//! - **Plugin system**: pattern-matched rules with request/response hooks,
//!   mocks, and redirect targets
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::convert::Infallible;
//! use std::sync::Arc;
//!
//! use hyper::service::service_fn;
//! use hyper_util::rt::TokioIo;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ca_cert = std::fs::read("certs/rootCA.crt")?;
//!     let ca_key = std::fs::read("certs/rootCA.key")?;
//!
//!     let proxy = Arc::new(echo::Echo::new(&ca_cert, &ca_key)?);
//!     proxy.add_plugin(
//!         echo::Plugin::new("example.com").on_request(|ctx| {
//!             ctx.set_request_header("x-custom-header", "value");
//!         }),
//!     );
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8888").await?;
//!     loop {
//!         let (stream, _) = listener.accept().await?;
//!         let proxy = Arc::clone(&proxy);
//!         tokio::spawn(async move {
//!             let service = service_fn(move |req| {
//!                 let proxy = Arc::clone(&proxy);
//!                 async move { Ok::<_, Infallible>(proxy.serve(req).await) }
//!             });
//!             let _ = hyper::server::conn::http1::Builder::new()
//!                 .serve_connection(TokioIo::new(stream), service)
//!                 .with_upgrades()
//!                 .await;
//!         });
//!     }
//! }
//! ```
//!
//! ## Plugins
//!
//! ```rust,no_run
//! # let proxy = echo::Echo::new(b"", b"").unwrap();
//! // Mock a response without contacting the origin
//! proxy.add_plugin(echo::Plugin::new("example.com/api").on_request(|ctx| {
//!     ctx.mock(200, &[("Content-Type", "application/json")], r#"{"status":"ok"}"#);
//! }));
//!
//! // Rewrite a response body
//! proxy.add_plugin(echo::Plugin::new("example.com").on_response(|ctx| {
//!     let body = ctx.get_response_body();
//!     ctx.set_response_body(body.replace("old", "new"));
//! }));
//!
//! // Forward to a different server
//! proxy.add_plugin(
//!     echo::Plugin::new("example.com")
//!         .target(echo::Target::new(echo::TargetScheme::Http, "localhost", 3000)),
//! );
//! ```
//!
//! Log output goes through `tracing`; setting `ECHO_LOG=off` (also `0`,
//! `false`, `no`) silences it at startup.

pub mod error;
pub mod logging;
pub mod matcher;

mod cert;
mod plugin;
mod proxy;

use std::sync::Arc;

use http::{Method, Request, Response};
use tracing::debug;

pub use crate::cert::CertificateManager;
pub use crate::error::{Error, Result};
pub use crate::plugin::{
    Hook, InterceptedResponse, MockBody, MockResponse, Plugin, PluginContext, PluginRegistry,
    Target, TargetScheme,
};
pub use crate::proxy::{decompress, ConnectHandler, HttpEngine, ProxyBody, WebSocketShuttle};

/// The proxy engine: dispatches each inbound request to the CONNECT
/// handler, the WebSocket shuttle, or the HTTP engine.
#[derive(Debug)]
pub struct Echo {
    registry: Arc<PluginRegistry>,
    http: Arc<HttpEngine>,
    ws: Arc<WebSocketShuttle>,
    connect: Arc<ConnectHandler>,
}

impl Echo {
    /// Build the engine from a PEM-encoded root CA certificate and private
    /// key. Accepted key types are `RSA PRIVATE KEY` (PKCS#1) and
    /// `PRIVATE KEY` (PKCS#8).
    pub fn new(ca_cert_pem: &[u8], ca_key_pem: &[u8]) -> Result<Self> {
        logging::init();

        // Pin the process-wide TLS provider before any rustls builder runs.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let (ca_cert, ca_key) = cert::load_root_ca(ca_cert_pem, ca_key_pem)?;
        let certs = Arc::new(CertificateManager::new(&ca_cert, ca_key)?);
        debug!("root CA loaded");

        let registry = Arc::new(PluginRegistry::new());
        let http = Arc::new(HttpEngine::new(Arc::clone(&registry))?);
        let ws = Arc::new(WebSocketShuttle::new(Arc::clone(&registry)));
        let connect = Arc::new(ConnectHandler::new(
            Arc::clone(&registry),
            certs,
            Arc::clone(&http),
            Arc::clone(&ws),
        ));

        Ok(Self {
            registry,
            http,
            ws,
            connect,
        })
    }

    /// Append a plugin. Evaluation order is insertion order.
    pub fn add_plugin(&self, plugin: Plugin) {
        self.registry.add(plugin);
    }

    /// Serve one inbound request. Compatible with a hyper `service_fn`
    /// handler; the connection must be served `.with_upgrades()` so CONNECT
    /// and WebSocket hijacking work.
    pub async fn serve<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: hyper::body::Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        if req.method() == Method::CONNECT {
            return self.connect.handle_tunnel(req).await;
        }
        if proxy::body::is_websocket_upgrade(req.headers()) {
            return self.ws.handle_upgrade(req, false).await;
        }
        self.http.handle(req).await
    }
}
