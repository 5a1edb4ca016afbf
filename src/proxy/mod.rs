//! Traffic handling: HTTP engine, WebSocket shuttle, CONNECT interception

pub(crate) mod body;
pub(crate) mod connect;
pub(crate) mod http;
pub(crate) mod websocket;

pub use body::{decompress, ProxyBody};
pub use connect::ConnectHandler;
pub use http::HttpEngine;
pub use websocket::WebSocketShuttle;
