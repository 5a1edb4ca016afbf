//! Plugin system
//!
//! A plugin is a rule that associates a traffic pattern with optional
//! request/response hooks, a redirect target, or a mock response. Plugins
//! are evaluated in insertion order by the [`PluginRegistry`]; hooks receive
//! a [`PluginContext`] scoped to a single exchange.

mod context;
mod registry;
mod rule;

pub use context::{InterceptedResponse, PluginContext};
pub(crate) use registry::strip_port;
pub use registry::PluginRegistry;
pub use rule::{Hook, MockBody, MockResponse, Plugin, Target, TargetScheme};
