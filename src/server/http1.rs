//! HTTP/1.x connection driver.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cancel::StopReason;
use crate::parser::{decode_chunked, parse_request_head, BodyFraming, Error as ParserError, HttpVersion, Method, RequestHead, MAX_HEAD_SIZE};
use crate::server::dispatch::{interruption, ConnectionContext};
use crate::server::error::Error;
use crate::server::request::Request;
use crate::server::response::{Body, Response, StatusCode};
use crate::tracker::{Connection, Termination};

enum ReadError {
    Malformed(ParserError),
    TooLarge,
    Io(io::Error),
}

enum Outcome {
    Respond(Response),
    Interrupted(Termination),
    ClientGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length(usize),
    Chunked,
    CloseDelimited,
    Bodiless,
}

/// Serve requests on `stream` until the peer closes it, the connection is
/// destroyed, or a response ends it.
pub(crate) async fn serve_connection<S>(ctx: &ConnectionContext, stream: S, connection: &Connection) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buffer = BytesMut::with_capacity(ctx.read_buffer_size);
    let destroy = connection.destroy_token();

    loop {
        let head = tokio::select! {
            biased;

            _ = destroy.cancelled() => return Ok(()),
            head = read_head(&mut reader, &mut buffer, ctx.read_buffer_size) => head,
        };
        let head = match head {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(error) => return reject(&mut writer, error, ctx.max_body_size).await,
        };

        let framing = match head.body_framing() {
            Ok(framing) => framing,
            Err(error) => return reject(&mut writer, ReadError::Malformed(error), ctx.max_body_size).await,
        };
        let expects_continue = head
            .get_header("expect")
            .is_some_and(|expect| expect.eq_ignore_ascii_case("100-continue"));
        if expects_continue && framing != BodyFraming::None {
            writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
        }

        let body = tokio::select! {
            biased;

            _ = destroy.cancelled() => return Ok(()),
            body = read_body(&mut reader, &mut buffer, framing, ctx.max_body_size, ctx.read_buffer_size) => body,
        };
        let body = match body {
            Ok(body) => body,
            Err(error) => return reject(&mut writer, error, ctx.max_body_size).await,
        };

        let keep_alive = head.keep_alive();
        let version = head.version;
        let method = head.method;

        let (inflight, termination) = ctx.announce(method, &head.path);
        let _finished = inflight.finish_guard();
        if let Some(refusal) = ctx.refusal() {
            inflight.mark_headers_sent();
            write_terminal(&mut writer, &refusal).await?;
            return Ok(());
        }

        let (client, token) = ctx.request_token();
        let request = Request::from_head(
            head,
            ctx.origin.clone(),
            body,
            Some(connection.peer_addr()),
            token.token().clone(),
        );
        let mut interrupted: BoxFuture<'static, Termination> = interruption(termination, destroy.clone()).boxed();

        let outcome = {
            let responding = async {
                match ctx.dispatcher.dispatch(request).await {
                    Some(response) => response,
                    // Abandoned: the stop or abort that cancelled it answers instead
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;

                termination = &mut interrupted => Outcome::Interrupted(termination),
                response = responding => Outcome::Respond(response),
                _ = client_gone(&mut reader, &mut buffer, ctx.read_buffer_size) => Outcome::ClientGone,
            }
        };

        match outcome {
            Outcome::Interrupted(termination) => {
                if !inflight.headers_sent() {
                    inflight.mark_headers_sent();
                    write_terminal(&mut writer, &termination).await?;
                }
                return Ok(());
            }
            Outcome::ClientGone => {
                client.cancel(StopReason::ClientAborted);
                return Ok(());
            }
            Outcome::Respond(response) => {
                let keep_alive = keep_alive && !ctx.dispatcher.server_token().is_cancellation_requested();
                inflight.mark_headers_sent();
                let keep_alive = write_response(&mut writer, response, version, method, keep_alive, &mut interrupted).await?;
                if !keep_alive {
                    return Ok(());
                }
            }
        }
    }
}

async fn reject<W>(writer: &mut W, error: ReadError, max_body_size: usize) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    match error {
        ReadError::Malformed(e) => {
            let termination = Termination {
                status: StatusCode::BAD_REQUEST,
                reason: format!("Error parsing request: {e}"),
            };
            write_terminal(writer, &termination).await?;
            Err(Error::ParseError(e))
        }
        ReadError::TooLarge => {
            let termination = Termination {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                reason: format!("request body exceeds {max_body_size} bytes"),
            };
            write_terminal(writer, &termination).await?;
            Ok(())
        }
        ReadError::Io(e) => Err(Error::IoError(e)),
    }
}

async fn read_head<R>(reader: &mut R, buffer: &mut BytesMut, read_size: usize) -> Result<Option<RequestHead>, ReadError>
where
    R: AsyncRead + Unpin,
{
    loop {
        // Tolerate blank lines between pipelined requests
        while buffer.starts_with(b"\r\n") {
            buffer.advance(2);
        }
        if !buffer.is_empty() {
            if let Some((head, consumed)) = parse_request_head(buffer).map_err(ReadError::Malformed)? {
                buffer.advance(consumed);
                return Ok(Some(head));
            }
        }

        buffer.reserve(read_size);
        let n = reader.read_buf(buffer).await.map_err(ReadError::Io)?;
        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(ReadError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
    }
}

async fn read_body<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    framing: BodyFraming,
    max_body_size: usize,
    read_size: usize,
) -> Result<Option<Bytes>, ReadError>
where
    R: AsyncRead + Unpin,
{
    match framing {
        BodyFraming::None => Ok(None),
        BodyFraming::Length(length) => {
            if length > max_body_size {
                return Err(ReadError::TooLarge);
            }
            while buffer.len() < length {
                buffer.reserve(read_size.max(length - buffer.len()));
                let n = reader.read_buf(buffer).await.map_err(ReadError::Io)?;
                if n == 0 {
                    return Err(ReadError::Io(io::ErrorKind::UnexpectedEof.into()));
                }
            }
            Ok(Some(buffer.split_to(length).freeze()))
        }
        BodyFraming::Chunked => loop {
            let decoded = decode_chunked(buffer, max_body_size).map_err(|error| match error {
                ParserError::BodyTooLarge(_) => ReadError::TooLarge,
                error => ReadError::Malformed(error),
            })?;
            if let Some((body, consumed)) = decoded {
                buffer.advance(consumed);
                return Ok(Some(Bytes::from(body)));
            }
            if buffer.len() > max_body_size.saturating_add(MAX_HEAD_SIZE) {
                return Err(ReadError::TooLarge);
            }
            buffer.reserve(read_size);
            let n = reader.read_buf(buffer).await.map_err(ReadError::Io)?;
            if n == 0 {
                return Err(ReadError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
        },
    }
}

/// Resolves when the connection is reset while a response is pending.
///
/// A peer that only shut down its write side still gets its response, so
/// end of stream just stops the reading. Bytes of a pipelined request are
/// kept in `buffer` for the next round.
async fn client_gone<R>(reader: &mut R, buffer: &mut BytesMut, read_size: usize)
where
    R: AsyncRead + Unpin,
{
    loop {
        if buffer.len() >= MAX_HEAD_SIZE {
            std::future::pending::<()>().await;
        }
        buffer.reserve(read_size);
        match reader.read_buf(buffer).await {
            Ok(0) => std::future::pending::<()>().await,
            Ok(_) => continue,
            Err(_) => return,
        }
    }
}

fn head_bytes(response: &Response, framing: Framing, keep_alive: bool) -> Vec<u8> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status.as_u16(),
        response.status_text()
    );
    for (name, value) in &response.headers {
        if matches!(name.as_str(), "content-length" | "transfer-encoding" | "connection") {
            continue;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if !response.headers.contains_key("date") {
        head.push_str(&format!("date: {}\r\n", httpdate::fmt_http_date(std::time::SystemTime::now())));
    }
    match framing {
        Framing::Length(length) => head.push_str(&format!("content-length: {length}\r\n")),
        Framing::Chunked => head.push_str("transfer-encoding: chunked\r\n"),
        Framing::CloseDelimited => {}
        Framing::Bodiless => {
            // 304 keeps the representation's length
            if let Some(length) = response.header("content-length") {
                head.push_str(&format!("content-length: {length}\r\n"));
            }
        }
    }
    head.push_str(if keep_alive { "connection: keep-alive\r\n" } else { "connection: close\r\n" });
    head.push_str("\r\n");
    head.into_bytes()
}

/// Write a plain-text response and announce the connection closes.
async fn write_terminal<W>(writer: &mut W, termination: &Termination) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = Response::text(termination.status, termination.reason.clone());
    let body = termination.reason.as_bytes();
    let mut bytes = head_bytes(&response, Framing::Length(body.len()), false);
    if termination.status.allows_body() {
        bytes.extend_from_slice(body);
    }
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Write `response`. Returns whether the connection may serve another request.
async fn write_response<W>(
    writer: &mut W,
    response: Response,
    version: HttpVersion,
    method: Method,
    keep_alive: bool,
    interrupted: &mut BoxFuture<'static, Termination>,
) -> io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let sends_body = method != Method::HEAD && response.status.allows_body();
    let mut response = response;
    let body = std::mem::take(&mut response.body);

    match body {
        Body::Empty | Body::Full(_) if !response.status.allows_body() => {
            writer.write_all(&head_bytes(&response, Framing::Bodiless, keep_alive)).await?;
        }
        Body::Empty => {
            writer.write_all(&head_bytes(&response, Framing::Length(0), keep_alive)).await?;
        }
        Body::Full(bytes) => {
            let mut out = head_bytes(&response, Framing::Length(bytes.len()), keep_alive);
            if sends_body {
                out.extend_from_slice(&bytes);
            }
            writer.write_all(&out).await?;
        }
        Body::Stream(_) if !sends_body => {
            writer.write_all(&head_bytes(&response, Framing::Bodiless, keep_alive)).await?;
        }
        Body::Stream(mut chunks) => {
            let chunked = version != HttpVersion::Http10;
            let keep_alive = keep_alive && chunked;
            let framing = if chunked { Framing::Chunked } else { Framing::CloseDelimited };
            writer.write_all(&head_bytes(&response, framing, keep_alive)).await?;
            writer.flush().await?;

            loop {
                tokio::select! {
                    biased;

                    _ = &mut *interrupted => return Ok(false),
                    chunk = chunks.recv() => match chunk {
                        Some(chunk) if chunk.is_empty() => {}
                        Some(chunk) if chunked => {
                            let mut out = Vec::with_capacity(chunk.len() + 16);
                            out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                            out.extend_from_slice(&chunk);
                            out.extend_from_slice(b"\r\n");
                            writer.write_all(&out).await?;
                            writer.flush().await?;
                        }
                        Some(chunk) => {
                            writer.write_all(&chunk).await?;
                            writer.flush().await?;
                        }
                        None => break,
                    },
                }
            }
            if chunked {
                writer.write_all(b"0\r\n\r\n").await?;
            }
            writer.flush().await?;
            return Ok(keep_alive);
        }
    }
    writer.flush().await?;
    Ok(keep_alive)
}
