//! Shared accept multiplexer for selector-driven listeners.
//!
//! One task waits on every registered listening socket at once and performs
//! only the OS-level accept. Each accepted socket is handed to the
//! registration's [`Selectable`], which must not block. A registration ends
//! when its [`SharedListener`] is closed or it is deregistered.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::closed_socket_error;
use super::tcp::SharedListener;

/// Receives the result of each accept on a registered socket
pub trait Selectable: Send + Sync + 'static {
    fn on_acceptable(&self, accepted: io::Result<TcpStream>);
}

enum SelectorCommand {
    Register {
        id: u64,
        listener: SharedListener,
        handler: Arc<dyn Selectable>,
    },
    Deregister {
        id: u64,
    },
}

/// The shared accept task and its registration handle
pub struct Selector {
    commands: mpsc::UnboundedSender<SelectorCommand>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
    registered: Arc<AtomicUsize>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Selector {
    /// Spawns the selector task on the current runtime
    pub fn start() -> Arc<Self> {
        let (commands, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let registered = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(select_loop(rx, shutdown.clone(), registered.clone()));
        info!("Selector started");
        Arc::new(Self {
            commands,
            shutdown,
            next_id: AtomicU64::new(1),
            registered,
            task: Mutex::new(Some(task)),
        })
    }

    /// Watches `listener` for incoming connections
    pub fn register(&self, listener: SharedListener, handler: Arc<dyn Selectable>) -> io::Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.commands
            .send(SelectorCommand::Register { id, listener, handler })
            .map_err(|_| selector_closed())?;
        Ok(id)
    }

    /// Stops watching a registration
    pub fn deregister(&self, id: u64) -> io::Result<()> {
        self.commands
            .send(SelectorCommand::Deregister { id })
            .map_err(|_| selector_closed())
    }

    /// Registrations currently watched
    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::Acquire)
    }

    /// Stops the selector task, dropping every registered socket
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn selector_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "selector is shut down")
}

async fn select_loop(
    mut commands: mpsc::UnboundedReceiver<SelectorCommand>,
    shutdown: CancellationToken,
    registered: Arc<AtomicUsize>,
) {
    let mut sockets: StreamMap<u64, SharedListener> = StreamMap::new();
    let mut handlers: HashMap<u64, Arc<dyn Selectable>> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(SelectorCommand::Register { id, listener, handler }) => {
                    debug!("Selector registering {}", id);
                    sockets.insert(id, listener);
                    handlers.insert(id, handler);
                }
                Some(SelectorCommand::Deregister { id }) => {
                    debug!("Selector deregistering {}", id);
                    sockets.remove(&id);
                    handlers.remove(&id);
                }
                None => break,
            },
            Some((id, accepted)) = sockets.next(), if !sockets.is_empty() => {
                if let Some(handler) = handlers.get(&id) {
                    handler.on_acceptable(accepted);
                }
            }
        }
        handlers.retain(|id, _| sockets.contains_key(id));
        registered.store(handlers.len(), Ordering::Release);
    }

    registered.store(0, Ordering::Release);
    info!("Selector stopped");
}

/// Bounded queue of raw accepted sockets waiting for their handshake.
///
/// While closed the queue refuses every socket, so an accept that races a
/// listener shutdown is closed instead of lingering until reactivation.
pub struct AcceptQueue {
    local: SocketAddr,
    pending: Mutex<VecDeque<TcpStream>>,
    capacity: usize,
    closed: AtomicBool,
    closes: AtomicU64,
    notify: Notify,
}

impl AcceptQueue {
    pub fn new(local: SocketAddr, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            local,
            pending: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            closes: AtomicU64::new(0),
            notify: Notify::new(),
        })
    }

    /// Queues a socket; a full or closed queue refuses it by closing the socket
    pub fn push(&self, stream: TcpStream) -> bool {
        let mut pending = self.pending.lock();
        if self.closed.load(Ordering::Acquire) {
            debug!("Accept queue on {} closed, refusing {:?}", self.local, stream.peer_addr().ok());
            return false;
        }
        if pending.len() >= self.capacity {
            warn!(
                "Accept queue on {} full ({}), refusing {:?}",
                self.local,
                self.capacity,
                stream.peer_addr().ok()
            );
            return false;
        }
        pending.push_back(stream);
        drop(pending);
        self.notify.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<TcpStream> {
        self.pending.lock().pop_front()
    }

    /// Waits for the next queued socket; fails once the queue is closed,
    /// even if it is reopened before the waiter runs again
    pub async fn pop(&self) -> io::Result<TcpStream> {
        let opened_at = self.closes.load(Ordering::Acquire);
        loop {
            let notified = self.notify.notified();
            if self.is_closed() || self.closes.load(Ordering::Acquire) != opened_at {
                return Err(closed_socket_error());
            }
            if let Some(stream) = self.try_pop() {
                return Ok(stream);
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Accepts sockets again after a [`close`](Self::close)
    pub fn reopen(&self) {
        let _pending = self.pending.lock();
        self.closed.store(false, Ordering::Release);
    }

    /// Refuses further sockets, closes every queued one and wakes a waiting
    /// [`pop`](Self::pop). Returns how many queued sockets were dropped.
    pub fn close(&self) -> usize {
        let drained: Vec<TcpStream> = {
            let mut pending = self.pending.lock();
            self.closed.store(true, Ordering::Release);
            self.closes.fetch_add(1, Ordering::AcqRel);
            pending.drain(..).collect()
        };
        self.notify.notify_waiters();
        drained.len()
    }
}

impl Selectable for AcceptQueue {
    fn on_acceptable(&self, accepted: io::Result<TcpStream>) {
        match accepted {
            Ok(stream) => {
                self.push(stream);
            }
            Err(e) => error!("Exception processing accept event on {}: {}", self.local, e),
        }
    }
}
