//! HTTP request handlers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::server::error::HandlerError;
use crate::server::request::Request;
use crate::server::response::Response;

/// Type alias for a boxed future resolving to a handler outcome.
///
/// `Ok(None)` means the handler has no opinion about the request.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<Response>, HandlerError>> + Send>>;

/// Type alias for a handler function that takes a Request and returns a HandlerFuture.
pub type RequestHandler = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`RequestHandler`].
pub fn handler_fn<F, Fut>(handler: F) -> RequestHandler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Response>, HandlerError>> + Send + 'static,
{
    Arc::new(move |request: Request| -> HandlerFuture { Box::pin(handler(request)) })
}

/// Try `handlers` in order and use the first response produced.
pub fn first_handler(handlers: Vec<RequestHandler>) -> RequestHandler {
    let handlers: Arc<[RequestHandler]> = handlers.into();
    Arc::new(move |request: Request| -> HandlerFuture {
        let handlers = handlers.clone();
        Box::pin(async move {
            for handler in handlers.iter() {
                if let Some(response) = handler(request.clone()).await? {
                    return Ok(Some(response));
                }
            }
            Ok(None)
        })
    })
}
