//! Response body codec and header hygiene
//!
//! Decompresses response bodies by `Content-Encoding` so plugins always see
//! plain bytes, and strips hop-by-hop headers so they never cross the proxy.

use std::io::{self, Read};

use bytes::Bytes;
use http::header::{HeaderName, CONNECTION, UPGRADE};
use http::{HeaderMap, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};

/// Body type emitted by the proxy.
pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

pub(crate) fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(io::Error::other).boxed_unsync()
}

pub(crate) fn empty_body() -> ProxyBody {
    Empty::new().map_err(io::Error::other).boxed_unsync()
}

/// Plain-text response with the given status.
pub(crate) fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message.as_bytes().to_vec()));
    *response.status_mut() = status;
    response
}

/// Headers scoped to a single transport hop (RFC 7230 §6.1), removed on
/// both ingress and egress. The WebSocket path restores `Connection` and
/// `Upgrade` explicitly when replaying an upgrade.
pub(crate) const HOP_BY_HOP_HEADERS: [HeaderName; 8] = [
    CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-authenticate"),
    HeaderName::from_static("proxy-authorization"),
    HeaderName::from_static("te"),
    HeaderName::from_static("trailers"),
    HeaderName::from_static("transfer-encoding"),
    UPGRADE,
];

/// Remove all hop-by-hop headers from `headers`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Whether the request asks for a WebSocket upgrade: `Upgrade: websocket`
/// with `Connection` containing `upgrade`, both case-insensitive.
pub(crate) fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade && connection
}

/// Decode `data` according to a `Content-Encoding` value.
///
/// Unknown or absent encodings return the raw bytes unchanged.
pub fn decompress(encoding: Option<&str>, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoded = Vec::new();
    match encoding {
        Some("gzip") => {
            flate2::read::GzDecoder::new(data).read_to_end(&mut decoded)?;
        }
        Some("deflate") => {
            flate2::read::DeflateDecoder::new(data).read_to_end(&mut decoded)?;
        }
        Some("br") => {
            brotli::Decompressor::new(data, 4096).read_to_end(&mut decoded)?;
        }
        Some("zstd") | Some("zstandard") | Some("x-zstd") => {
            zstd::stream::read::Decoder::new(data)?.read_to_end(&mut decoded)?;
        }
        _ => return Ok(data.to_vec()),
    }
    Ok(decoded)
}
