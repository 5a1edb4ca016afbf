//! End-to-end tests for the HTTP engine and plugin pipeline, driving
//! `Echo::serve` directly against local backends.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use echo::{Echo, Plugin, Target, TargetScheme};

static CA_CERT: &[u8] = include_bytes!("fixtures/ca.crt");
static CA_KEY: &[u8] = include_bytes!("fixtures/ca_pkcs8.key");

fn test_proxy() -> Echo {
    Echo::new(CA_CERT, CA_KEY).expect("proxy should construct from the fixture CA")
}

fn get(uri: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

async fn body_bytes(body: echo::ProxyBody) -> Vec<u8> {
    body.collect().await.unwrap().to_bytes().to_vec()
}

/// Accept one connection, capture the request head, send `response`, close.
async fn spawn_backend(response: Vec<u8>) -> (std::net::SocketAddr, Arc<Mutex<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let captured = Arc::new(Mutex::new(Vec::new()));

    let capture = Arc::clone(&captured);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let response = response.clone();
            let capture = Arc::clone(&capture);
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                capture.lock().await.extend_from_slice(&head);
                let _ = stream.write_all(&response).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, captured)
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

#[test]
fn constructs_from_pkcs1_and_pkcs8_keys() {
    Echo::new(CA_CERT, CA_KEY).expect("PKCS#8 key must be accepted");
    Echo::new(CA_CERT, include_bytes!("fixtures/ca_pkcs1.key"))
        .expect("PKCS#1 key must be accepted");
}

#[test]
fn rejects_unsupported_key_material() {
    // A certificate where a key is expected.
    assert!(Echo::new(CA_CERT, CA_CERT).is_err());
    assert!(Echo::new(CA_CERT, b"garbage").is_err());
}

#[tokio::test]
async fn mock_short_circuits_without_contacting_origin() {
    let proxy = test_proxy();
    proxy.add_plugin(
        Plugin::new("https://api.example.com/index.html").on_request(|ctx| {
            ctx.mock(
                200,
                &[("Content-Type", "text/html")],
                "<html><body><h1>Hello echo</h1></body></html>",
            );
        }),
    );

    // The origin does not exist; only the mock can produce a 200.
    let response = proxy.serve(get("https://api.example.com/index.html")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-type").unwrap(), "text/html");
    assert_eq!(
        body_bytes(response.into_body()).await,
        b"<html><body><h1>Hello echo</h1></body></html>"
    );
}

#[tokio::test]
async fn mock_stops_later_plugins() {
    let proxy = test_proxy();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let record = Arc::clone(&order);
    proxy.add_plugin(Plugin::new("stop.example.com").on_request(move |ctx| {
        record.lock().unwrap().push("first");
        ctx.mock(204, &[], "");
    }));
    let record = Arc::clone(&order);
    proxy.add_plugin(Plugin::new("stop.example.com").on_request(move |_ctx| {
        record.lock().unwrap().push("second");
    }));

    let response = proxy.serve(get("http://stop.example.com/")).await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(*order.lock().unwrap(), vec!["first"]);
}

#[tokio::test]
async fn redirect_rewrites_host_and_later_target_wins() {
    let body = b"hello from backend";
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let (addr, captured) = spawn_backend([response.as_bytes(), &body[..]].concat()).await;

    let proxy = test_proxy();
    // The first target points nowhere; the later plugin must win.
    proxy.add_plugin(
        Plugin::new("www.aaa.com").target(Target::new(TargetScheme::Http, "192.0.2.1", 9)),
    );
    proxy.add_plugin(
        Plugin::new("www.aaa.com")
            .target(Target::new(TargetScheme::Http, "127.0.0.1", addr.port()))
            .on_response(|ctx| {
                ctx.set_response_header("x-echo", "1");
            }),
    );

    let response = proxy.serve(get("http://www.aaa.com/path?q=1")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-echo").unwrap(), "1");
    assert_eq!(body_bytes(response.into_body()).await, body);

    let head = String::from_utf8(captured.lock().await.clone()).unwrap();
    assert!(
        head.starts_with("GET /path?q=1 HTTP/1.1\r\n"),
        "path must be preserved: {head}"
    );
    assert!(
        head.to_ascii_lowercase()
            .contains(&format!("host: 127.0.0.1:{}", addr.port())),
        "Host must be rewritten to the target: {head}"
    );
}

#[tokio::test]
async fn response_body_rewrite_normalizes_encoding() {
    let phrase = "百度一下，你就知道";
    let html = format!("<html><title>{phrase}</title></html>");
    let compressed = gzip(html.as_bytes());
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        compressed.len()
    );
    let (addr, _) = spawn_backend([head.as_bytes(), &compressed[..]].concat()).await;

    let proxy = test_proxy();
    proxy.add_plugin(
        Plugin::new("*.baidu.com/*")
            .target(Target::new(TargetScheme::Http, "127.0.0.1", addr.port()))
            .on_response(|ctx| {
                if ctx.get_response_header("Content-Type").contains("text/html") {
                    let body = ctx.get_response_body();
                    ctx.set_response_body(body.replace("百度一下，你就知道", "Modify"));
                }
            }),
    );

    let response = proxy.serve(get("http://www.baidu.com/")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(CONTENT_ENCODING).is_none());

    let expected = "<html><title>Modify</title></html>";
    assert_eq!(
        response
            .headers()
            .get(CONTENT_LENGTH)
            .unwrap()
            .to_str()
            .unwrap(),
        expected.len().to_string()
    );
    assert_eq!(body_bytes(response.into_body()).await, expected.as_bytes());
}

#[tokio::test]
async fn hop_by_hop_headers_do_not_reach_the_origin() {
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec();
    let (addr, captured) = spawn_backend(response).await;

    let proxy = test_proxy();
    let request = Request::builder()
        .uri(format!("http://127.0.0.1:{}/", addr.port()))
        .header("connection", "keep-alive, x-drop")
        .header("keep-alive", "timeout=5")
        .header("proxy-authorization", "Basic abc")
        .header("te", "trailers")
        .header("upgrade", "h2c")
        .header("x-keep", "yes")
        .body(Full::new(Bytes::new()))
        .unwrap();

    let response = proxy.serve(request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let head = String::from_utf8(captured.lock().await.clone())
        .unwrap()
        .to_ascii_lowercase();
    for name in ["keep-alive:", "proxy-authorization:", "te:", "upgrade:"] {
        assert!(!head.contains(name), "{name} leaked to the origin: {head}");
    }
    assert!(head.contains("x-keep: yes"), "end-to-end headers must survive: {head}");
}

#[tokio::test]
async fn upstream_dial_failure_yields_502_with_error_text() {
    let proxy = test_proxy();
    // Nothing listens on port 1; the dial is refused immediately.
    proxy.add_plugin(
        Plugin::new("unreachable.example.com")
            .target(Target::new(TargetScheme::Http, "127.0.0.1", 1)),
    );

    let response = tokio::time::timeout(
        Duration::from_secs(60),
        proxy.serve(get("http://unreachable.example.com/")),
    )
    .await
    .expect("dial failure should resolve quickly");

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(!body_bytes(response.into_body()).await.is_empty());
}

#[tokio::test]
async fn origin_redirects_are_surfaced_verbatim() {
    let response =
        b"HTTP/1.1 302 Found\r\nLocation: http://elsewhere.example.com/\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            .to_vec();
    let (addr, _) = spawn_backend(response).await;

    let proxy = test_proxy();
    let response = proxy
        .serve(get(&format!("http://127.0.0.1:{}/", addr.port())))
        .await;

    // The proxy must not follow the redirect.
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "http://elsewhere.example.com/"
    );
}

#[tokio::test]
async fn connect_without_hijack_capability_is_a_500() {
    let proxy = test_proxy();
    let request = Request::builder()
        .method(http::Method::CONNECT)
        .uri("example.com:443")
        .body(Full::new(Bytes::new()))
        .unwrap();

    // Driven outside a hyper connection there is no upgrade capability.
    let response = proxy.serve(request).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
