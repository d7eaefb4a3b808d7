//! The listening socket and its accept loop.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::cancel::{start_operation, CancellationSource, CancellationToken, Operation, OperationError, StopReason};
use crate::server::error::BindError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Idle,
    Running,
    Exited,
}

struct ListeningInner {
    local_addr: SocketAddr,
    socket: Mutex<Option<TcpListener>>,
    shutdown: CancellationSource,
    state: watch::Sender<LoopState>,
}

/// A bound socket, before or while its accept loop runs.
#[derive(Clone)]
pub struct Listening {
    inner: Arc<ListeningInner>,
}

impl Listening {
    fn new(socket: TcpListener, local_addr: SocketAddr) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            inner: Arc::new(ListeningInner {
                local_addr,
                socket: Mutex::new(Some(socket)),
                shutdown: CancellationSource::new(),
                state,
            }),
        }
    }

    /// The address actually bound; carries the real port when 0 was asked.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Run the accept loop, handing every accepted stream to `on_accept`.
    ///
    /// Does nothing when the listener was already closed or is serving.
    pub fn serve<F>(&self, on_accept: F)
    where
        F: Fn(TcpStream, SocketAddr) + Send + 'static,
    {
        let socket = {
            let mut socket = self.inner.socket.lock();
            if self.inner.shutdown.is_cancelled() {
                return;
            }
            let Some(socket) = socket.take() else {
                return;
            };
            self.inner.state.send_replace(LoopState::Running);
            socket
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let shutdown = inner.shutdown.token();
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,
                    accepted = socket.accept() => match accepted {
                        Ok((stream, peer)) => on_accept(stream, peer),
                        Err(e) => {
                            error!("Error accepting connection: {e}");
                            // Usually a transient resource shortage; back off before retrying
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                }
            }
            drop(socket);
            debug!("accept loop on {} exited", inner.local_addr);
            inner.state.send_replace(LoopState::Exited);
        });
    }

    /// Close the socket and wait for the accept loop to exit.
    async fn close(&self) {
        self.inner.shutdown.cancel(StopReason::Unspecified);
        {
            let mut socket = self.inner.socket.lock();
            if socket.take().is_some() {
                self.inner.state.send_replace(LoopState::Exited);
            }
        }
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|state| *state == LoopState::Exited).await;
    }
}

impl fmt::Debug for Listening {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listening")
            .field("local_addr", &self.inner.local_addr)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

/// Bind `ip:port` as a stoppable operation.
///
/// Port 0 binds any free port. Stopping the operation closes the socket and
/// waits for its accept loop.
pub async fn listen(
    token: &CancellationToken,
    ip: IpAddr,
    port: u16,
) -> Result<Operation<Listening>, OperationError<BindError>> {
    start_operation(
        token,
        async move {
            let addr = SocketAddr::new(ip, port);
            let socket = TcpListener::bind(addr)
                .await
                .map_err(|e| BindError::from_io(addr, e))?;
            let local_addr = socket
                .local_addr()
                .map_err(|e| BindError::from_io(addr, e))?;
            Ok(Listening::new(socket, local_addr))
        },
        |listening: Listening| async move { listening.close().await },
    )
    .await
}

/// The first port at or above `start` that `ip` can bind.
pub async fn find_free_port(ip: IpAddr, start: u16) -> Result<u16, BindError> {
    for port in start.max(1)..=u16::MAX {
        let addr = SocketAddr::new(ip, port);
        match TcpListener::bind(addr).await {
            Ok(_) => return Ok(port),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(BindError::from_io(addr, e)),
        }
    }
    Err(BindError::AddressInUse(SocketAddr::new(ip, start)))
}
