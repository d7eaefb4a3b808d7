//! A lightweight HTTP/HTTPS/HTTP2 server toolkit.
//!
//! The crate stands up a request/response server around a single handler
//! and takes care of what surrounds it: graceful lifecycle management,
//! cancellation propagation to handlers, CORS negotiation, static files with
//! caching headers and Server-Sent Events rooms.
//!
//! # Features
//!
//! - HTTP/1.1 with keep-alive and chunked streaming responses
//! - HTTPS through rustls, with HTTP/2 negotiated by ALPN
//! - Orderly stop: in-flight requests answered with 503, then connections,
//!   sessions and the listener closed
//! - Stop on process signals through a shared [`signal::SignalBridge`]
//! - Per-request cancellation tokens fired by server stop or client abort
//!
//! # Examples
//!
//! ## Parsing a request head
//!
//! ```
//! use microserve::parse_request;
//!
//! let request = parse_request(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
//! assert_eq!(request.path, "/index.html");
//! ```
//!
//! ## Starting a server
//!
//! ```no_run
//! use microserve::server::{handler_fn, start_server, Response, ServerConfig, StatusCode};
//!
//! # async fn run() -> Result<(), microserve::ServerError> {
//! let handler = handler_fn(|_request| async {
//!     Ok(Some(Response::text(StatusCode::OK, "ok")))
//! });
//! let server = start_server(ServerConfig::default(), handler).await?;
//! println!("listening on {}", server.origin());
//!
//! let reason = server.stop("shutdown").await;
//! assert_eq!(reason.to_string(), "shutdown");
//! # Ok(())
//! # }
//! ```
//!
//! See `demos/basic_server.rs` for files, SSE and CORS together.

pub mod cancel;
pub mod files;
pub mod parser;
pub mod publisher;
pub mod server;
pub mod signal;
pub mod sse;
pub mod tracker;

// Re-export commonly used items for convenience
pub use cancel::{CancelError, CancellationSource, CancellationToken, StopReason};
pub use parser::{parse_request, Error as ParserError, HttpVersion, Method};
pub use server::{
    start_server, Error as ServerError, Request, RequestHandler, Response, Server, ServerConfig, ServerHandle,
    StatusCode,
};
