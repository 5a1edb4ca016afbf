//! Demo proxy: mocks, body rewriting, and forwarding on a local port.
//!
//! Run with `cargo run --example proxy`, then point a client at
//! `http://127.0.0.1:1234` as its HTTP(S) proxy. HTTPS interception
//! requires trusting the demo root CA in `tests/fixtures/ca.crt`.

use std::convert::Infallible;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::TokioIo;

use echo::{Echo, Plugin, Target, TargetScheme};

static CA_CERT: &[u8] = include_bytes!("../tests/fixtures/ca.crt");
static CA_KEY: &[u8] = include_bytes!("../tests/fixtures/ca_pkcs8.key");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let proxy = Arc::new(Echo::new(CA_CERT, CA_KEY)?);

    // Mock responses without touching the origin.
    proxy.add_plugin(
        Plugin::new("https://api.example.com/index.html").on_request(|ctx| {
            ctx.mock(
                200,
                &[("Content-Type", "text/html")],
                "<html><body><h1>Hello echo</h1></body></html>",
            );
        }),
    );
    proxy.add_plugin(Plugin::new("https://api.example.com/api/data").on_request(|ctx| {
        ctx.mock(200, &[("Content-Type", "application/json")], r#"{"ok":true}"#);
    }));

    // Print intercepted request URLs.
    proxy.add_plugin(Plugin::new("*.baidu.com/*").on_request(|ctx| {
        if let Some(uri) = ctx.request_uri() {
            println!("{uri}");
        }
    }));

    // Rewrite HTML response bodies.
    proxy.add_plugin(Plugin::new("*.baidu.com/*").on_response(|ctx| {
        if ctx.get_response_header("Content-Type").contains("text/html") {
            let body = ctx.get_response_body();
            ctx.set_response_body(body.replace("百度一下，你就知道", "Modify"));
        }
    }));

    // Forward one host to another and tag the response.
    proxy.add_plugin(
        Plugin::new("https://www.aaa.com")
            .target(Target::new(TargetScheme::Https, "baidu.com", 443))
            .on_response(|ctx| {
                ctx.set_response_header("x-echo", "1");
            }),
    );

    let addr = "127.0.0.1:1234";
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("echo proxy listening on {addr}");

    loop {
        let (stream, _) = listener.accept().await?;
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let proxy = Arc::clone(&proxy);
                async move { Ok::<_, Infallible>(proxy.serve(req).await) }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                eprintln!("connection error: {e}");
            }
        });
    }
}
