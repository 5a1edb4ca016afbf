//! Per-exchange plugin context

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use tracing::warn;

use crate::plugin::rule::{MockBody, MockResponse};
use crate::proxy::body;

/// Buffered upstream response as seen by `on_response` hooks.
#[derive(Debug)]
pub struct InterceptedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub(crate) body: Bytes,
}

impl InterceptedResponse {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub(crate) fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        (self.status, self.headers, self.body)
    }
}

/// Handle passed to plugin hooks for one exchange.
///
/// During `on_request` the response is absent; response accessors are then
/// no-ops and getters return the empty string. The context lives exactly one
/// exchange and is exclusively borrowed by the running hook.
pub struct PluginContext<'a> {
    request: Option<&'a mut http::request::Parts>,
    response: Option<&'a mut InterceptedResponse>,
    mock: Option<MockResponse>,
}

impl<'a> PluginContext<'a> {
    pub(crate) fn for_request(request: &'a mut http::request::Parts) -> Self {
        Self {
            request: Some(request),
            response: None,
            mock: None,
        }
    }

    pub(crate) fn for_exchange(
        request: &'a mut http::request::Parts,
        response: &'a mut InterceptedResponse,
    ) -> Self {
        Self {
            request: Some(request),
            response: Some(response),
            mock: None,
        }
    }

    /// URI of the request being proxied.
    pub fn request_uri(&self) -> Option<&Uri> {
        self.request.as_deref().map(|parts| &parts.uri)
    }

    /// Status of the upstream response, when attached.
    pub fn response_status(&self) -> Option<StatusCode> {
        self.response.as_deref().map(|res| res.status)
    }

    /// Record a mock response; the engine emits it without contacting the
    /// origin and runs no further plugins.
    pub fn mock(&mut self, status: u16, headers: &[(&str, &str)], body: impl Into<MockBody>) {
        self.mock = Some(MockResponse {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.into(),
        });
    }

    pub(crate) fn take_mock(&mut self) -> Option<MockResponse> {
        self.mock.take()
    }

    pub fn set_request_header(&mut self, name: &str, value: &str) {
        if let Some(req) = self.request.as_deref_mut() {
            set_header(&mut req.headers, name, value);
        }
    }

    pub fn del_request_header(&mut self, name: &str) {
        if let Some(req) = self.request.as_deref_mut() {
            del_header(&mut req.headers, name);
        }
    }

    pub fn get_request_header(&self, name: &str) -> String {
        self.request
            .as_deref()
            .map(|req| get_header(&req.headers, name))
            .unwrap_or_default()
    }

    pub fn set_response_header(&mut self, name: &str, value: &str) {
        if let Some(res) = self.response.as_deref_mut() {
            set_header(&mut res.headers, name, value);
        }
    }

    pub fn del_response_header(&mut self, name: &str) {
        if let Some(res) = self.response.as_deref_mut() {
            del_header(&mut res.headers, name);
        }
    }

    pub fn get_response_header(&self, name: &str) -> String {
        self.response
            .as_deref()
            .map(|res| get_header(&res.headers, name))
            .unwrap_or_default()
    }

    /// Read the response body as text, decompressing it if needed.
    ///
    /// The stored body is replaced with the decoded bytes, `Content-Length`
    /// is updated to match, and `Content-Encoding` is removed, so repeated
    /// reads are idempotent and the wire representation stays consistent.
    /// A body that fails to decompress is passed through raw.
    pub fn get_response_body(&mut self) -> String {
        let Some(res) = self.response.as_deref_mut() else {
            return String::new();
        };

        let encoding = res
            .headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let decoded = match body::decompress(encoding.as_deref(), &res.body) {
            Ok(decoded) => decoded,
            Err(error) => {
                warn!(%error, "response body decompression failed, using raw body");
                res.body.to_vec()
            }
        };

        let text = String::from_utf8_lossy(&decoded).into_owned();
        res.body = Bytes::from(decoded);
        res.headers
            .insert(CONTENT_LENGTH, HeaderValue::from(res.body.len()));
        res.headers.remove(CONTENT_ENCODING);
        text
    }

    /// Replace the response body.
    ///
    /// Sets `Content-Length` to the new byte length and removes any
    /// `Content-Encoding`.
    pub fn set_response_body(&mut self, body: impl Into<String>) {
        if let Some(res) = self.response.as_deref_mut() {
            res.body = Bytes::from(body.into().into_bytes());
            res.headers
                .insert(CONTENT_LENGTH, HeaderValue::from(res.body.len()));
            res.headers.remove(CONTENT_ENCODING);
        }
    }
}

fn set_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

fn del_header(headers: &mut HeaderMap, name: &str) {
    if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
        headers.remove(name);
    }
}

fn get_header(headers: &HeaderMap, name: &str) -> String {
    HeaderName::from_bytes(name.as_bytes())
        .ok()
        .and_then(|name| headers.get(name))
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_default()
}
