//! HTTP/2 session driver.

use std::collections::HashMap;
use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use h2::server::{self, SendResponse};
use h2::{Reason, RecvStream, SendStream};
use http::header::{HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::time;

use crate::cancel::{CancellationToken, StopReason};
use crate::parser::{HttpVersion, Method, RequestHead};
use crate::server::dispatch::{interruption, ConnectionContext};
use crate::server::error::Error;
use crate::server::request::Request;
use crate::server::response::{Body, Response, StatusCode};
use crate::tracker::{Connection, Session, SessionCloseError, Termination};

/// How long a destroyed session gets to flush its terminal responses.
const DESTROY_GRACE: Duration = Duration::from_secs(1);

/// Headers HTTP/2 forbids in a response.
const CONNECTION_HEADERS: [&str; 5] = ["connection", "keep-alive", "proxy-connection", "transfer-encoding", "upgrade"];

/// Serve an HTTP/2 session negotiated on `stream`.
///
/// The session is announced to the session tracker once the handshake
/// completes, and reports how it ended when it returns.
pub(crate) async fn serve_session<S>(ctx: Arc<ConnectionContext>, stream: S, connection: &Connection) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let destroy = connection.destroy_token();
    let mut h2 = tokio::select! {
        biased;

        _ = destroy.cancelled() => return Ok(()),
        handshake = server::handshake(stream) => handshake?,
    };

    let (session, mut close_rx) = Session::new(connection.peer_addr());
    ctx.sessions.next(session.clone());

    let outcome = drive(&ctx, &mut h2, connection.peer_addr(), &destroy, &mut close_rx).await;
    session.finish(match &outcome {
        Ok(()) => Ok(()),
        Err(e) if e.is_io() => Err(SessionCloseError::Disconnected),
        Err(e) => Err(SessionCloseError::Protocol(e.to_string())),
    });
    outcome.map_err(Error::Http2)
}

async fn drive<S>(
    ctx: &Arc<ConnectionContext>,
    h2: &mut server::Connection<S, Bytes>,
    peer: SocketAddr,
    destroy: &CancellationToken,
    close_rx: &mut oneshot::Receiver<()>,
) -> Result<(), h2::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut closing = false;
    loop {
        tokio::select! {
            biased;

            _ = destroy.cancelled() => {
                h2.graceful_shutdown();
                return time::timeout(DESTROY_GRACE, drain(h2)).await.unwrap_or(Ok(()));
            }
            _ = &mut *close_rx, if !closing => {
                closing = true;
                h2.graceful_shutdown();
            }
            accepted = h2.accept() => match accepted {
                Some(Ok((request, respond))) => {
                    tokio::spawn(serve_stream(ctx.clone(), request, respond, peer, destroy.clone()));
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
        }
    }
}

/// Drive a shutting-down session to its end, refusing late streams.
async fn drain<S>(h2: &mut server::Connection<S, Bytes>) -> Result<(), h2::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(accepted) = h2.accept().await {
        let (_, mut respond) = accepted?;
        respond.send_reset(Reason::REFUSED_STREAM);
    }
    Ok(())
}

enum BodyError {
    TooLarge,
    Stream(h2::Error),
}

enum Outcome {
    Respond(Response),
    Interrupted(Termination),
    ClientGone,
}

async fn serve_stream(
    ctx: Arc<ConnectionContext>,
    request: http::Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    peer: SocketAddr,
    destroy: CancellationToken,
) {
    let logger = ctx.dispatcher.logger();
    let (parts, mut body) = request.into_parts();

    let Ok(method) = parts.method.as_str().parse::<Method>() else {
        let response = Response::text(StatusCode::NOT_IMPLEMENTED, format!("unsupported method {}", parts.method));
        let _ = send_full(&mut respond, response, Method::GET);
        return;
    };
    let resource = parts
        .uri
        .path_and_query()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in &parts.headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    if let Some(authority) = parts.uri.authority() {
        headers
            .entry("host".to_string())
            .or_insert_with(|| authority.to_string());
    }

    let declared = headers
        .get("content-length")
        .and_then(|length| length.trim().parse::<usize>().ok());
    let body = if declared.is_some_and(|length| length > ctx.max_body_size) {
        Err(BodyError::TooLarge)
    } else {
        tokio::select! {
            biased;

            _ = destroy.cancelled() => return,
            body = read_body(&mut body, ctx.max_body_size) => body,
        }
    };
    let body = match body {
        Ok(body) => body,
        Err(BodyError::TooLarge) => {
            let response = Response::text(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("request body exceeds {} bytes", ctx.max_body_size),
            );
            let _ = send_full(&mut respond, response, method);
            return;
        }
        Err(BodyError::Stream(e)) => {
            logger.debug(format_args!("h2 stream from {peer} failed while reading the body: {e}"));
            return;
        }
    };

    let (inflight, termination) = ctx.announce(method, &resource);
    let _finished = inflight.finish_guard();
    if let Some(refusal) = ctx.refusal() {
        inflight.mark_headers_sent();
        let _ = send_full(&mut respond, Response::text(refusal.status, refusal.reason), method);
        return;
    }

    let (client, token) = ctx.request_token();
    let head = RequestHead::new(method, resource, HttpVersion::Http20, headers);
    let request = Request::from_head(head, ctx.origin.clone(), body, Some(peer), token.token().clone());
    let mut interrupted: BoxFuture<'static, Termination> = interruption(termination, destroy).boxed();

    let outcome = {
        let responding = async {
            match ctx.dispatcher.dispatch(request).await {
                Some(response) => response,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;

            termination = &mut interrupted => Outcome::Interrupted(termination),
            response = responding => Outcome::Respond(response),
            _ = poll_fn(|cx| respond.poll_reset(cx)) => Outcome::ClientGone,
        }
    };

    let sent = match outcome {
        Outcome::Interrupted(termination) => {
            if inflight.headers_sent() {
                Ok(())
            } else {
                inflight.mark_headers_sent();
                send_full(&mut respond, Response::text(termination.status, termination.reason), method)
            }
        }
        Outcome::ClientGone => {
            client.cancel(StopReason::ClientAborted);
            Ok(())
        }
        Outcome::Respond(response) => {
            inflight.mark_headers_sent();
            send_response(&mut respond, response, method, &mut interrupted).await
        }
    };
    if let Err(e) = sent {
        logger.debug(format_args!("h2 stream from {peer} failed while responding: {e}"));
    }
}

async fn read_body(body: &mut RecvStream, max_body_size: usize) -> Result<Option<Bytes>, BodyError> {
    if body.is_end_stream() {
        return Ok(None);
    }
    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(BodyError::Stream)?;
        let _ = body.flow_control().release_capacity(chunk.len());
        if buffer.len() + chunk.len() > max_body_size {
            return Err(BodyError::TooLarge);
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(Some(buffer.freeze()))
}

fn response_head(response: &Response, content_length: Option<usize>) -> http::Response<()> {
    let status = http::StatusCode::from_u16(response.status.as_u16()).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
    let mut head = http::Response::new(());
    *head.status_mut() = status;

    let headers = head.headers_mut();
    for (name, value) in &response.headers {
        if CONNECTION_HEADERS.contains(&name.as_str()) || name == "content-length" {
            continue;
        }
        let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) else {
            log::debug!("dropping invalid response header {name}");
            continue;
        };
        headers.append(name, value);
    }
    if !headers.contains_key(http::header::DATE) {
        if let Ok(date) = HeaderValue::from_str(&httpdate::fmt_http_date(std::time::SystemTime::now())) {
            headers.insert(http::header::DATE, date);
        }
    }
    let content_length = content_length.or_else(|| {
        response
            .header("content-length")
            .and_then(|length| length.trim().parse().ok())
    });
    if let Some(length) = content_length {
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    head
}

/// Send a response whose body is already in memory.
fn send_full(respond: &mut SendResponse<Bytes>, mut response: Response, method: Method) -> Result<(), h2::Error> {
    let bytes = match std::mem::take(&mut response.body) {
        Body::Full(bytes) => bytes,
        _ => Bytes::new(),
    };
    let sends_body = method != Method::HEAD && response.status.allows_body() && !bytes.is_empty();
    let length = response.status.allows_body().then_some(bytes.len());
    let head = response_head(&response, length);
    if sends_body {
        let mut stream = respond.send_response(head, false)?;
        stream.send_data(bytes, true)
    } else {
        respond.send_response(head, true).map(|_| ())
    }
}

async fn send_response(
    respond: &mut SendResponse<Bytes>,
    mut response: Response,
    method: Method,
    interrupted: &mut BoxFuture<'static, Termination>,
) -> Result<(), h2::Error> {
    let sends_body = method != Method::HEAD && response.status.allows_body();
    let mut chunks = match std::mem::take(&mut response.body) {
        Body::Stream(chunks) => chunks,
        Body::Full(bytes) if sends_body && !bytes.is_empty() => {
            let mut stream = respond.send_response(response_head(&response, Some(bytes.len())), false)?;
            return send_chunk(&mut stream, bytes, true).await;
        }
        body => {
            response.body = body;
            return send_full(respond, response, method);
        }
    };

    if !sends_body {
        return respond.send_response(response_head(&response, None), true).map(|_| ());
    }
    let mut stream = respond.send_response(response_head(&response, None), false)?;
    loop {
        tokio::select! {
            biased;

            _ = &mut *interrupted => {
                stream.send_reset(Reason::CANCEL);
                return Ok(());
            }
            chunk = chunks.recv() => match chunk {
                Some(chunk) => send_chunk(&mut stream, chunk, false).await?,
                None => return stream.send_data(Bytes::new(), true),
            },
        }
    }
}

/// Send `data` in pieces the peer's flow control window allows.
async fn send_chunk(stream: &mut SendStream<Bytes>, mut data: Bytes, end: bool) -> Result<(), h2::Error> {
    if data.is_empty() {
        return if end { stream.send_data(data, true) } else { Ok(()) };
    }
    loop {
        stream.reserve_capacity(data.len());
        let capacity = match poll_fn(|cx| stream.poll_capacity(cx)).await {
            Some(capacity) => capacity?,
            None => return Err(h2::Error::from(Reason::CANCEL)),
        };
        if capacity == 0 {
            continue;
        }
        let piece = data.split_to(capacity.min(data.len()));
        let last = data.is_empty();
        stream.send_data(piece, end && last)?;
        if last {
            return Ok(());
        }
    }
}
