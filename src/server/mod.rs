//! The HTTP server.
//!
//! [`Server`] binds a listener, serves HTTP/1.x (and HTTP/2 over TLS when
//! enabled), hands every request to a [`RequestHandler`] and stops in an
//! orderly way: in-flight requests are answered with 503 (500 after an
//! internal error), connections and sessions are closed, then the listener.

mod config;
mod cors;
mod dispatch;
mod error;
mod handler;
mod http1;
mod http2;
mod lifecycle;
mod listener;
mod logger;
mod request;
mod response;
mod tls;

// Re-export public items
pub use config::{
    default_error_response, ErrorFormatter, Protocol, RequestWaitingCallback, ServerConfig, ServerHooks,
    StartedCallback, StoppedCallback,
};
pub use cors::{access_control_headers, is_preflight, AccessControlConfig};
pub use dispatch::server_timing_header;
pub use error::{BindError, ConfigurationError, Error, HandlerError};
pub use handler::{first_handler, handler_fn, HandlerFuture, RequestHandler};
pub use lifecycle::{origin_for, start_server, Server, ServerHandle, ServerStatus};
pub use listener::{find_free_port, listen, Listening};
pub use logger::Logger;
pub use request::Request;
pub use response::{Body, Response, StatusCode};
pub use tls::{alpn_protocols, make_rustls_config, make_tls_acceptor};
