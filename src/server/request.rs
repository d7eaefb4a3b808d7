//! The request handed to handlers.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::cancel::CancellationToken;
use crate::parser::{HttpVersion, Method, RequestHead};
use crate::server::error::HandlerError;

/// An HTTP request as seen by a handler.
#[derive(Debug, Clone)]
pub struct Request {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// Scheme, host and port the server is reachable at
    pub origin: String,
    /// The request target: path plus query string
    pub resource: String,
    /// The HTTP version
    pub version: HttpVersion,
    /// The HTTP headers, keyed by lowercase name, repeated values joined with ", "
    pub headers: HashMap<String, String>,
    /// Query parameters parsed from the resource
    pub query_params: HashMap<String, String>,
    /// The request body, if one was sent
    pub body: Option<Bytes>,
    /// Address of the client
    pub peer_addr: Option<SocketAddr>,
    cancellation_token: CancellationToken,
}

impl Request {
    /// Create a request for `resource` with no headers or body.
    pub fn new(method: Method, origin: impl Into<String>, resource: impl Into<String>) -> Self {
        let head = RequestHead::new(method, resource.into(), HttpVersion::Http11, HashMap::new());
        Self::from_head(head, origin.into(), None, None, CancellationToken::none())
    }

    pub(crate) fn from_head(
        head: RequestHead,
        origin: String,
        body: Option<Bytes>,
        peer_addr: Option<SocketAddr>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            method: head.method,
            origin,
            resource: head.path,
            version: head.version,
            headers: head.headers,
            query_params: head.query_params,
            body,
            peer_addr,
            cancellation_token,
        }
    }

    /// Add or replace a header.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub(crate) fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Cancelled when the server stops or the client goes away.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// The resource without its query string.
    pub fn path(&self) -> &str {
        self.resource
            .split_once('?')
            .map_or(self.resource.as_str(), |(path, _)| path)
    }

    /// Get a header value. Lookup is case-insensitive.
    pub fn get_header(&self, name: &str) -> Option<&String> {
        self.headers.get(&name.to_ascii_lowercase())
    }

    /// Check if a header exists.
    pub fn has_header(&self, name: &str) -> bool {
        self.get_header(name).is_some()
    }

    /// Get a query parameter value.
    pub fn get_query_param(&self, name: &str) -> Option<&String> {
        self.query_params.get(name)
    }

    /// Check if the request has a JSON content type.
    pub fn is_json(&self) -> bool {
        self.get_header("content-type")
            .map(|ct| ct.to_ascii_lowercase().starts_with("application/json"))
            .unwrap_or(false)
    }

    /// Parse the body as JSON into the specified type.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        let body = self.body.as_deref().unwrap_or_default();
        Ok(serde_json::from_slice(body)?)
    }

    /// The body decoded as UTF-8, lossily.
    pub fn body_text(&self) -> String {
        self.body
            .as_deref()
            .map(|body| String::from_utf8_lossy(body).into_owned())
            .unwrap_or_default()
    }
}
