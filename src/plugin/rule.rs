//! Plugin rule configuration

use std::collections::HashMap;
use std::fmt;

use crate::plugin::context::PluginContext;

/// A hook invoked with exclusive access to the exchange context.
pub type Hook = Box<dyn Fn(&mut PluginContext<'_>) + Send + Sync>;

/// A forwarding/interception rule.
///
/// Built with the fluent constructors:
///
/// ```no_run
/// use echo::{Plugin, Target, TargetScheme};
///
/// let rule = Plugin::new("*.example.com")
///     .target(Target::new(TargetScheme::Https, "backend.local", 8443))
///     .on_response(|ctx| {
///         ctx.set_response_header("x-intercepted", "1");
///     });
/// ```
pub struct Plugin {
    /// Pattern matched against the hostname or full URL (see [`crate::matcher`]).
    pub pattern: String,
    /// Optional redirect target; rewrites the upstream destination.
    pub target: Option<Target>,
    /// Hook run before the upstream request; may set a mock.
    pub on_request: Option<Hook>,
    /// Hook run after the upstream response; may mutate headers or body.
    pub on_response: Option<Hook>,
}

impl Plugin {
    /// Create a rule matching `pattern` with no target and no hooks.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            target: None,
            on_request: None,
            on_response: None,
        }
    }

    /// Forward matching traffic to `target`.
    pub fn target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    /// Run `hook` before the request is sent upstream.
    pub fn on_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut PluginContext<'_>) + Send + Sync + 'static,
    {
        self.on_request = Some(Box::new(hook));
        self
    }

    /// Run `hook` on the upstream response before it reaches the client.
    pub fn on_response<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut PluginContext<'_>) + Send + Sync + 'static,
    {
        self.on_response = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("pattern", &self.pattern)
            .field("target", &self.target)
            .field("on_request", &self.on_request.is_some())
            .field("on_response", &self.on_response.is_some())
            .finish()
    }
}

/// Scheme of a redirect target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl TargetScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    /// Default port implied by the scheme.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Https | Self::Wss => 443,
            Self::Http | Self::Ws => 80,
        }
    }
}

impl fmt::Display for TargetScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where matching requests are forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: TargetScheme,
    pub host: String,
    /// Port 0 derives the port from the scheme.
    pub port: u16,
}

impl Target {
    pub fn new(scheme: TargetScheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Configured port, or the scheme default when the port is 0.
    pub fn effective_port(&self) -> u16 {
        if self.port > 0 {
            self.port
        } else {
            self.scheme.default_port()
        }
    }

    /// Authoritative `host:port` form used for dialing and Host rewriting.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.effective_port())
    }
}

/// Body of a mock response: either text or raw bytes.
#[derive(Debug, Clone)]
pub enum MockBody {
    Text(String),
    Bytes(Vec<u8>),
}

impl MockBody {
    pub(crate) fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(s) => s.into_bytes(),
            Self::Bytes(b) => b,
        }
    }
}

impl From<&str> for MockBody {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for MockBody {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for MockBody {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

/// A static response returned without contacting the origin.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: MockBody,
}
