//! Server configuration.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::cancel::StopReason;
use crate::server::cors::AccessControlConfig;
use crate::server::error::{ConfigurationError, HandlerError};
use crate::server::request::Request;
use crate::server::response::{Response, StatusCode};
use crate::signal::{SignalBridge, Trigger};

/// Transport security of the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Plain,
    Secure,
}

impl Protocol {
    /// URL scheme for this protocol.
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Plain => "http",
            Protocol::Secure => "https",
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Plain HTTP or HTTPS.
    pub protocol: Protocol,
    /// Offer HTTP/2 through ALPN. Requires the secure protocol.
    pub http2: bool,
    /// The address to bind to.
    pub ip: String,
    /// The port to bind to; 0 picks any free port.
    pub port: u16,
    /// With `port` 0, the first free port at or above this one is used.
    pub port_hint: Option<u16>,
    /// Bind exactly `port`, never searching from `port_hint`.
    pub force_port: bool,
    /// PEM certificate chain. Without it the bundled development pair is used.
    pub certificate: Option<PathBuf>,
    /// PEM private key matching `certificate`.
    pub private_key: Option<PathBuf>,
    /// When false, dropping the last [`ServerHandle`](crate::server::ServerHandle) stops the server.
    pub keep_process_alive: bool,
    /// Stop on SIGINT even when `stop_on_exit` is off.
    pub stop_on_sigint: bool,
    /// Stop on SIGHUP, SIGTERM, SIGINT and [`SignalBridge::notify_exit`].
    pub stop_on_exit: bool,
    /// Stop when code outside a request handler panics.
    pub stop_on_crash: bool,
    /// Stop when a request handler fails.
    pub stop_on_internal_error: bool,
    /// CORS negotiation; absent disables it.
    pub access_control: Option<AccessControlConfig>,
    /// Add a `server-timing` header to every response.
    pub send_server_timing: bool,
    /// Delay before a slow handler is reported.
    pub request_waiting_timeout_ms: u64,
    /// The read buffer size.
    pub read_buffer_size: usize,
    /// Requests with a larger body are answered with 413.
    pub max_body_size: usize,
    /// Most verbose level this server logs at.
    pub log_level: LevelFilter,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Plain,
            http2: false,
            ip: "0.0.0.0".to_string(),
            port: 0,
            port_hint: None,
            force_port: false,
            certificate: None,
            private_key: None,
            keep_process_alive: true,
            stop_on_sigint: true,
            stop_on_exit: true,
            stop_on_crash: false,
            stop_on_internal_error: false,
            access_control: None,
            send_server_timing: false,
            request_waiting_timeout_ms: 20_000,
            read_buffer_size: 8192,
            max_body_size: 10 * 1024 * 1024,
            log_level: LevelFilter::Info,
        }
    }
}

impl ServerConfig {
    /// Load a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(json).map_err(|e| ConfigurationError::Invalid(e.to_string()))
    }

    /// Check that the options can be honoured together.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.http2 && self.protocol != Protocol::Secure {
            return Err(ConfigurationError::Http2RequiresSecure);
        }
        if self.certificate.is_some() != self.private_key.is_some() {
            return Err(ConfigurationError::IncompleteCertificate);
        }
        if self.force_port && self.port == 0 {
            return Err(ConfigurationError::ForcePortWithoutPort);
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigurationError::Invalid("read_buffer_size must not be 0".to_string()));
        }
        self.ip_addr()?;
        Ok(())
    }

    /// The bind address parsed from `ip`.
    pub fn ip_addr(&self) -> Result<IpAddr, ConfigurationError> {
        let ip = self.ip.trim_start_matches('[').trim_end_matches(']');
        if ip.eq_ignore_ascii_case("localhost") {
            return Ok(IpAddr::from([127, 0, 0, 1]));
        }
        ip.parse()
            .map_err(|_| ConfigurationError::InvalidIp(self.ip.clone()))
    }

    pub fn request_waiting_timeout(&self) -> Duration {
        Duration::from_millis(self.request_waiting_timeout_ms)
    }

    /// Triggers that stop the server, per the `stop_on_*` options.
    pub fn stop_triggers(&self) -> Vec<Trigger> {
        let mut triggers = Vec::new();
        if self.stop_on_exit {
            triggers.extend(Trigger::EXIT);
        } else if self.stop_on_sigint {
            triggers.push(Trigger::Interrupt);
        }
        if self.stop_on_crash {
            triggers.push(Trigger::Crash);
        }
        triggers
    }
}

/// Called with the origin once the server listens.
pub type StartedCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Called with the reason once the server stopped.
pub type StoppedCallback = Arc<dyn Fn(&StopReason) + Send + Sync>;
/// Called when a handler has not responded within the waiting timeout.
pub type RequestWaitingCallback = Arc<dyn Fn(&Request, Duration) + Send + Sync>;
/// Turns a handler failure into the 500 response sent to the client.
pub type ErrorFormatter = Arc<dyn Fn(&HandlerError, &Request) -> Response + Send + Sync>;

/// Callbacks and collaborators that cannot live in [`ServerConfig`].
#[derive(Clone, Default)]
pub struct ServerHooks {
    pub started_callback: Option<StartedCallback>,
    pub stopped_callback: Option<StoppedCallback>,
    /// Defaults to a warning in the server log.
    pub request_waiting_callback: Option<RequestWaitingCallback>,
    /// Defaults to [`default_error_response`].
    pub error_formatter: Option<ErrorFormatter>,
    /// Defaults to [`SignalBridge::process`].
    pub signal_bridge: Option<SignalBridge>,
}

impl ServerHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_started_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.started_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_stopped_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StopReason) + Send + Sync + 'static,
    {
        self.stopped_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_request_waiting_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Request, Duration) + Send + Sync + 'static,
    {
        self.request_waiting_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_error_formatter<F>(mut self, formatter: F) -> Self
    where
        F: Fn(&HandlerError, &Request) -> Response + Send + Sync + 'static,
    {
        self.error_formatter = Some(Arc::new(formatter));
        self
    }

    pub fn with_signal_bridge(mut self, bridge: SignalBridge) -> Self {
        self.signal_bridge = Some(bridge);
        self
    }
}

impl fmt::Debug for ServerHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHooks")
            .field("started_callback", &self.started_callback.is_some())
            .field("stopped_callback", &self.stopped_callback.is_some())
            .field("request_waiting_callback", &self.request_waiting_callback.is_some())
            .field("error_formatter", &self.error_formatter.is_some())
            .field("signal_bridge", &self.signal_bridge)
            .finish()
    }
}

/// The 500 response used when no error formatter is configured.
///
/// Clients accepting JSON get a JSON document, everyone else plain text.
pub fn default_error_response(error: &HandlerError, request: &Request) -> Response {
    let wants_json = request
        .get_header("accept")
        .is_some_and(|accept| accept.contains("application/json"));

    if wants_json {
        let body = serde_json::json!({
            "code": "INTERNAL_ERROR",
            "message": error.to_string(),
        });
        Response::new(StatusCode::INTERNAL_SERVER_ERROR)
            .with_content_type("application/json")
            .with_body_string(body.to_string())
    } else {
        Response::text(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {error}"),
        )
    }
}
