//! Server-Sent Events rooms.
//!
//! An [`SseRoom`] fans events out to every open `text/event-stream`
//! response. Sent events are numbered and kept in a bounded history, so a
//! client reconnecting with `last-event-id` receives what it missed before
//! live events resume.


use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::server::{Logger, Request, Response, StatusCode};

/// Events a client may fall behind by before it is disconnected.
const CLIENT_BUFFER: usize = 64;

const KEEPALIVE_COMMENT: &[u8] = b":\n\n";

/// One event as written on the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field; clients dispatch untyped events as `message`
    pub event_type: Option<String>,
    pub data: String,
    /// Assigned by the room when absent
    pub id: Option<u64>,
}

impl SseEvent {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Wire form of the event. Multi-line data becomes one `data:` line per line.
    pub fn encode(&self) -> Bytes {
        let mut out = String::new();
        if let Some(id) = self.id {
            let _ = writeln!(out, "id: {id}");
        }
        if let Some(event_type) = &self.event_type {
            let _ = writeln!(out, "event: {event_type}");
        }
        for line in self.data.split('\n') {
            let _ = writeln!(out, "data: {}", line.trim_end_matches('\r'));
        }
        out.push('\n');
        Bytes::from(out)
    }
}

/// How an [`SseRoom`] behaves.
#[derive(Debug, Clone)]
pub struct SseOptions {
    /// Events kept for replay
    pub history_length: usize,
    /// Open connections allowed at once
    pub max_connections: usize,
    /// Interval between keep-alive comments
    pub keepalive: Option<Duration>,
    /// Reconnection delay advertised to clients with a `retry:` field
    pub retry: Option<Duration>,
    /// Sent to every new connection after the replay, never stored
    pub welcome_event: Option<SseEvent>,
}

impl Default for SseOptions {
    fn default() -> Self {
        Self {
            history_length: 100,
            max_connections: 100,
            keepalive: Some(Duration::from_secs(30)),
            retry: None,
            welcome_event: None,
        }
    }
}

struct RoomState {
    started: bool,
    next_id: u64,
    history: VecDeque<SseEvent>,
    clients: Vec<mpsc::Sender<Bytes>>,
    keepalive: Option<JoinHandle<()>>,
}

impl Default for RoomState {
    fn default() -> Self {
        Self {
            started: false,
            next_id: 1,
            history: VecDeque::new(),
            clients: Vec::new(),
            keepalive: None,
        }
    }
}

impl RoomState {
    /// Write `chunk` to every client, dropping closed and lagging ones.
    fn broadcast(&mut self, chunk: &Bytes, logger: &Logger) {
        self.clients.retain(|client| match client.try_send(chunk.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                logger.debug(format_args!("dropping SSE client that stopped reading"));
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

struct RoomInner {
    options: SseOptions,
    logger: Logger,
    state: Mutex<RoomState>,
}

/// A broadcast channel for event-stream clients.
#[derive(Clone)]
pub struct SseRoom {
    inner: Arc<RoomInner>,
}

impl SseRoom {
    pub fn new(options: SseOptions) -> Self {
        Self::with_logger(options, Logger::default())
    }

    pub fn with_logger(options: SseOptions, logger: Logger) -> Self {
        Self {
            inner: Arc::new(RoomInner {
                options,
                logger,
                state: Mutex::new(RoomState::default()),
            }),
        }
    }

    /// Accept connections and begin sending keep-alive comments.
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        if state.started {
            return;
        }
        state.started = true;
        if let Some(interval) = self.inner.options.keepalive {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let room = Arc::downgrade(&self.inner);
                    state.keepalive = Some(runtime.spawn(keepalive(room, interval)));
                }
                Err(_) => self
                    .inner
                    .logger
                    .warn(format_args!("SSE keep-alive disabled: no tokio runtime")),
            }
        }
    }

    /// End every open stream and refuse new connections with 204.
    ///
    /// The history is kept, so clients reconnecting after a restart resume
    /// where they left off.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.started = false;
        if let Some(task) = state.keepalive.take() {
            task.abort();
        }
        state.clients.clear();
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.lock().started
    }

    /// Open streams.
    pub fn connection_count(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.clients.retain(|client| !client.is_closed());
        state.clients.len()
    }

    /// Open an event stream, replaying the events after `last_event_id`.
    ///
    /// Answers 204 when the room is not started and 503 when it is full.
    pub fn connect(&self, last_event_id: Option<u64>) -> Response {
        let options = &self.inner.options;
        let mut state = self.inner.state.lock();
        if !state.started {
            return Response::new(StatusCode::NO_CONTENT);
        }
        state.clients.retain(|client| !client.is_closed());
        if state.clients.len() >= options.max_connections {
            self.inner.logger.debug(format_args!(
                "refusing SSE connection: {} already open",
                state.clients.len()
            ));
            return Response::text(StatusCode::SERVICE_UNAVAILABLE, "too many connections")
                .with_header("retry-after", "1");
        }

        let (sender, receiver) = mpsc::channel(state.history.len() + CLIENT_BUFFER + 2);
        if let Some(retry) = options.retry {
            let _ = sender.try_send(Bytes::from(format!("retry: {}\n\n", retry.as_millis())));
        }
        if let Some(last_event_id) = last_event_id {
            for event in state.history.iter().filter(|event| event.id > Some(last_event_id)) {
                let _ = sender.try_send(event.encode());
            }
        }
        if let Some(welcome) = &options.welcome_event {
            let _ = sender.try_send(welcome.encode());
        }
        state.clients.push(sender);

        Response::new(StatusCode::OK)
            .with_content_type("text/event-stream")
            .with_header("cache-control", "no-cache")
            .with_stream(receiver)
    }

    /// [`connect`](Self::connect) using the request's `last-event-id` header.
    pub fn connect_request(&self, request: &Request) -> Response {
        let last_event_id = request
            .get_header("last-event-id")
            .and_then(|id| id.trim().parse().ok());
        self.connect(last_event_id)
    }

    /// Record `event` and send it to every open stream. Returns its id.
    pub fn send_event(&self, mut event: SseEvent) -> u64 {
        let mut state = self.inner.state.lock();
        let id = match event.id {
            Some(id) => id,
            None => state.next_id,
        };
        state.next_id = state.next_id.max(id.saturating_add(1));
        event.id = Some(id);

        let chunk = event.encode();
        if self.inner.options.history_length > 0 {
            if state.history.len() == self.inner.options.history_length {
                state.history.pop_front();
            }
            state.history.push_back(event);
        }
        state.broadcast(&chunk, &self.inner.logger);
        id
    }

    /// Buffered events with an id greater than `last_event_id`, oldest first.
    pub fn events_since(&self, last_event_id: u64) -> Vec<SseEvent> {
        self.inner
            .state
            .lock()
            .history
            .iter()
            .filter(|event| event.id > Some(last_event_id))
            .cloned()
            .collect()
    }
}

async fn keepalive(room: Weak<RoomInner>, interval: Duration) {
    let mut ticks = tokio::time::interval(interval);
    ticks.tick().await;
    loop {
        ticks.tick().await;
        let Some(room) = room.upgrade() else {
            return;
        };
        let chunk = Bytes::from_static(KEEPALIVE_COMMENT);
        room.state.lock().broadcast(&chunk, &room.logger);
    }
}
