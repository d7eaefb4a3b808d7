//! The wrapper every request goes through between the protocol drivers and
//! the request handler.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::sync::oneshot;
use tokio::time;

use crate::cancel::{compose_cancellation_token, CancellationSource, CancellationToken, ComposedToken, StopReason};
use crate::parser::Method;
use crate::publisher::Publisher;
use crate::server::config::{default_error_response, ServerConfig, ServerHooks};
use crate::server::cors::{self, AccessControlConfig};
use crate::server::error::HandlerError;
use crate::server::handler::RequestHandler;
use crate::server::logger::Logger;
use crate::server::request::Request;
use crate::server::response::{Response, StatusCode};
use crate::signal::handler_scope;
use crate::tracker::{InflightRequest, Session, Termination};

/// Asks the server to stop; invoked on handler failures when configured.
pub(crate) type StopTrigger = Arc<dyn Fn(StopReason) + Send + Sync>;

/// Runs the request handler with diagnostics, error conversion, CORS and
/// timing headers.
pub(crate) struct Dispatcher {
    handler: RequestHandler,
    hooks: ServerHooks,
    access_control: Option<AccessControlConfig>,
    send_server_timing: bool,
    request_waiting_timeout: Duration,
    stop_on_internal_error: bool,
    logger: Logger,
    server_token: CancellationToken,
    stop_trigger: Option<StopTrigger>,
}

impl Dispatcher {
    pub(crate) fn new(
        config: &ServerConfig,
        hooks: ServerHooks,
        handler: RequestHandler,
        server_token: CancellationToken,
        stop_trigger: Option<StopTrigger>,
    ) -> Self {
        Self {
            handler,
            hooks,
            access_control: config.access_control.clone(),
            send_server_timing: config.send_server_timing,
            request_waiting_timeout: config.request_waiting_timeout(),
            stop_on_internal_error: config.stop_on_internal_error,
            logger: Logger::new(config.log_level),
            server_token,
            stop_trigger,
        }
    }

    pub(crate) fn server_token(&self) -> &CancellationToken {
        &self.server_token
    }

    pub(crate) fn logger(&self) -> Logger {
        self.logger
    }

    /// Produce the response for `request`.
    ///
    /// `None` means the request was abandoned because its token was
    /// cancelled; the caller leaves the answer to whoever cancelled it.
    pub(crate) async fn dispatch(&self, request: Request) -> Option<Response> {
        let started = Instant::now();

        if self.access_control.is_some() && cors::is_preflight(request.method, &request.headers) {
            let response = Response::new(StatusCode::OK).with_header("content-length", "0");
            return Some(self.decorate(response, &request, started));
        }

        let response = match self.run_handler(&request).await {
            Ok(Some(response)) => response,
            Ok(None) => Response::text(
                StatusCode::NOT_IMPLEMENTED,
                format!("no handler responded to {} {}", request.method, request.resource),
            ),
            Err(error) if error.is_cancelled() && request.cancellation_token().is_cancellation_requested() => {
                self.logger.debug(format_args!(
                    "{} {} abandoned: {error}",
                    request.method, request.resource
                ));
                return None;
            }
            Err(error) => self.internal_error(error, &request),
        };
        Some(self.decorate(response, &request, started))
    }

    async fn run_handler(&self, request: &Request) -> Result<Option<Response>, HandlerError> {
        // Called inside the guarded future: panics raised while building the
        // handler's future are caught as well
        let handler = self.handler.clone();
        let request_for_handler = request.clone();
        let handling = AssertUnwindSafe(async move { handler(request_for_handler).await }).catch_unwind();
        let mut handling = pin!(handler_scope(handling));

        let outcome = match time::timeout(self.request_waiting_timeout, &mut handling).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.report_waiting(request);
                handling.await
            }
        };
        outcome.unwrap_or_else(|panic| Err(HandlerError::Panic(panic_message(panic.as_ref()))))
    }

    fn report_waiting(&self, request: &Request) {
        let waited = self.request_waiting_timeout;
        match &self.hooks.request_waiting_callback {
            Some(callback) => callback(request, waited),
            None => self.logger.warn(format_args!(
                "still no response for {} {} after {}ms",
                request.method,
                request.resource,
                waited.as_millis()
            )),
        }
    }

    fn internal_error(&self, error: HandlerError, request: &Request) -> Response {
        self.logger.error(format_args!(
            "error while handling {} {}: {error}",
            request.method, request.resource
        ));
        let response = match &self.hooks.error_formatter {
            Some(formatter) => formatter(&error, request),
            None => default_error_response(&error, request),
        };
        if self.stop_on_internal_error {
            if let Some(stop) = &self.stop_trigger {
                stop(StopReason::InternalError(error.to_string()));
            }
        }
        response
    }

    fn decorate(&self, mut response: Response, request: &Request, started: Instant) -> Response {
        if let Some(access_control) = &self.access_control {
            for (name, value) in cors::access_control_headers(&request.headers, access_control) {
                if name == "vary" {
                    if let Some(existing) = response.header("vary") {
                        let merged = format!("{existing}, {value}");
                        response.set_header("vary", merged);
                        continue;
                    }
                }
                response.set_header(name, value);
            }
        }

        if self.send_server_timing {
            let mut timing = vec![("handler".to_string(), started.elapsed())];
            timing.extend(response.timing.iter().cloned());
            response.set_header("server-timing", server_timing_header(&timing));
        }
        response
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Format named durations as a `server-timing` header value.
pub fn server_timing_header(timing: &[(String, Duration)]) -> String {
    timing
        .iter()
        .map(|(name, duration)| {
            let name: String = name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
                .collect();
            format!("{name};dur={:.2}", duration.as_secs_f64() * 1000.0)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Everything a protocol driver needs to serve requests on one connection.
pub(crate) struct ConnectionContext {
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) requests: Publisher<InflightRequest>,
    pub(crate) sessions: Publisher<Session>,
    pub(crate) origin: String,
    pub(crate) read_buffer_size: usize,
    pub(crate) max_body_size: usize,
}

impl ConnectionContext {
    /// Announce a new request to the request tracker.
    pub(crate) fn announce(&self, method: Method, resource: &str) -> (InflightRequest, oneshot::Receiver<Termination>) {
        let (request, termination) = InflightRequest::new(method, resource);
        self.requests.next(request.clone());
        (request, termination)
    }

    /// The answer for a request announced after the server began stopping.
    ///
    /// Checked after [`announce`](Self::announce): a request announced
    /// before the tracker unsubscribed gets terminated by it instead.
    pub(crate) fn refusal(&self) -> Option<Termination> {
        self.dispatcher.server_token().reason().map(|reason| Termination {
            status: reason.termination_status(),
            reason: reason.to_string(),
        })
    }

    /// A source to cancel when the client goes away, and the request token
    /// combining it with the server token.
    pub(crate) fn request_token(&self) -> (CancellationSource, ComposedToken) {
        let client = CancellationSource::new();
        let token = compose_cancellation_token(&[self.dispatcher.server_token().clone(), client.token()]);
        (client, token)
    }
}

/// Resolves with the terminal answer for a request: either a termination
/// from the request tracker or the destruction of its connection.
pub(crate) async fn interruption(
    termination: oneshot::Receiver<Termination>,
    destroy: CancellationToken,
) -> Termination {
    let terminated = async move {
        match termination.await {
            Ok(termination) => termination,
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        termination = terminated => termination,
        reason = destroy.cancelled() => Termination {
            status: reason.termination_status(),
            reason: reason.to_string(),
        },
    }
}
