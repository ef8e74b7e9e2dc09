//! Duplex local-socket backend
//!
//! Uses Unix domain sockets on Unix/macOS and named pipes on Windows via
//! the interprocess crate. Every client holds a private connection; the
//! service accepts connections on a background thread, runs one reader
//! thread per connection, and routes responses through a routing-key to
//! connection map that is bound from each connection's first request.
//!
//! Socket I/O runs on a small process-wide tokio runtime. The endpoint
//! threads are plain OS threads that drive it with `block_on`, so none of
//! these functions may be called from inside an async task.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};

use crate::common::config::TransportConfig;
use crate::common::paths;
use crate::common::{Error, Result};
use crate::ipc::protocol::{ClientMessage, RoutingKey, ServerMessage, WireRecord};
use crate::ipc::worker::{lock, Worker};

#[cfg(unix)]
mod platform {
    pub use interprocess::local_socket::tokio::{prelude::*, Listener, Stream};
    pub use interprocess::local_socket::{GenericFilePath, ListenerOptions};
}

#[cfg(windows)]
mod platform {
    pub use interprocess::local_socket::tokio::{prelude::*, Listener, Stream};
    pub use interprocess::local_socket::{GenericNamespaced, ListenerOptions};
}

use platform::*;

/// Largest single read; covers the biggest record
const FRAME_CHUNK: usize = 256;
const CONNECT_RETRY: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

static IO_RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The process-wide runtime that owns socket I/O
pub fn io_runtime() -> Result<&'static Runtime> {
    if let Some(rt) = IO_RUNTIME.get() {
        return Ok(rt);
    }
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("dxrt-ipc-io")
        .enable_all()
        .build()?;
    Ok(IO_RUNTIME.get_or_init(|| rt))
}

/// Identifies one accepted connection on the service side
pub type ConnectionId = u64;

// === Framing ===

/// Read exactly one `size`-byte frame
///
/// Bytes read so far are kept in `partial`, so the future may be dropped at
/// any await point and resumed later without losing data. Once the first
/// byte of a frame has arrived the rest must follow within `frame_timeout`.
async fn read_frame<R>(
    reader: &mut R,
    partial: &mut Vec<u8>,
    size: usize,
    frame_timeout: Duration,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; FRAME_CHUNK];

    while partial.len() < size {
        let want = (size - partial.len()).min(chunk.len());
        let read = if partial.is_empty() {
            reader.read(&mut chunk[..want]).await
        } else {
            match tokio::time::timeout(frame_timeout, reader.read(&mut chunk[..want])).await {
                Ok(read) => read,
                Err(_) => {
                    let received = partial.len();
                    partial.clear();
                    return Err(Error::Receive(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("frame stalled after {} of {} bytes", received, size),
                    )));
                }
            }
        };

        match read {
            Ok(0) if partial.is_empty() => return Err(Error::PeerClosed),
            Ok(0) => {
                let actual = partial.len();
                partial.clear();
                return Err(Error::MalformedFrame {
                    expected: size,
                    actual,
                });
            }
            Ok(n) => partial.extend_from_slice(&chunk[..n]),
            Err(e) if is_disconnect(&e) => return Err(Error::PeerClosed),
            Err(e) => return Err(Error::Receive(e)),
        }
    }

    Ok(std::mem::take(partial))
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let written = async {
        writer.write_all(frame).await?;
        writer.flush().await
    }
    .await;

    written.map_err(|e| {
        if is_disconnect(&e) {
            Error::PeerClosed
        } else {
            Error::Send(e)
        }
    })
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// The service is simply not there (yet)
fn is_service_absent(e: &io::Error) -> bool {
    #[cfg(windows)]
    {
        // ERROR_PIPE_BUSY: every instance is taken, try again shortly
        if e.raw_os_error() == Some(231) {
            return true;
        }
    }
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

// === Endpoints ===

/// Create the service listener, replacing a stale socket file
fn bind_listener(rt: &Runtime, name: &str) -> io::Result<Listener> {
    #[cfg(unix)]
    {
        let path = std::path::Path::new(name);
        paths::ensure_socket_dir(path)?;
        paths::remove_socket(path)?;
    }

    // The listener registers with the runtime's reactor
    let _guard = rt.enter();

    #[cfg(unix)]
    let listener = {
        let name = name.to_fs_name::<GenericFilePath>()?;
        ListenerOptions::new().name(name).create_tokio()?
    };

    #[cfg(windows)]
    let listener = {
        let name = name.to_ns_name::<GenericNamespaced>()?;
        ListenerOptions::new().name(name).create_tokio()?
    };

    // Clients run under other accounts than the service
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(name, std::fs::Permissions::from_mode(0o666))?;
    }

    Ok(listener)
}

async fn connect_stream(name: &str) -> io::Result<Stream> {
    #[cfg(unix)]
    let stream = {
        let name = name.to_fs_name::<GenericFilePath>()?;
        Stream::connect(name).await?
    };

    #[cfg(windows)]
    let stream = {
        let name = name.to_ns_name::<GenericNamespaced>()?;
        Stream::connect(name).await?
    };

    Ok(stream)
}

// === Client side ===

struct ClientReader {
    half: Option<ReadHalf<Stream>>,
    partial: Vec<u8>,
    /// Synthetic closes posted by the local endpoint
    wakes: mpsc::UnboundedReceiver<ServerMessage>,
}

/// A client's private connection to the service
pub struct PipeClient {
    name: String,
    writer: Mutex<Option<WriteHalf<Stream>>>,
    reader: Mutex<ClientReader>,
    wake_tx: mpsc::UnboundedSender<ServerMessage>,
    frame_timeout: Duration,
}

impl PipeClient {
    /// Connect, retrying while the service is absent for up to the connect timeout
    pub fn connect(config: &TransportConfig) -> Result<Self> {
        let rt = io_runtime()?;
        let name = config.pipe.resolved_name();
        let deadline = Instant::now() + config.pipe.connect_timeout();

        let stream = loop {
            match rt.block_on(connect_stream(&name)) {
                Ok(stream) => break stream,
                Err(e) if is_service_absent(&e) => {
                    if Instant::now() >= deadline {
                        return Err(Error::ServiceNotRunning(name));
                    }
                    tracing::trace!(pipe = %name, "Service not reachable yet, retrying");
                    thread::sleep(CONNECT_RETRY);
                }
                Err(e) => return Err(Error::channel_init(&format!("pipe {}", name), e)),
            }
        };

        let (read, write) = tokio::io::split(stream);
        let (wake_tx, wakes) = mpsc::unbounded_channel();
        tracing::debug!(pipe = %name, "Connected to service");

        Ok(Self {
            name,
            writer: Mutex::new(Some(write)),
            reader: Mutex::new(ClientReader {
                half: Some(read),
                partial: Vec::with_capacity(ServerMessage::SIZE),
                wakes,
            }),
            wake_tx,
            frame_timeout: config.pipe.frame_timeout(),
        })
    }

    pub fn send(&self, request: &ClientMessage) -> Result<()> {
        let rt = io_runtime()?;
        let frame = request.encode();
        let mut guard = lock(&self.writer);
        let writer = guard.as_mut().ok_or(Error::Closed)?;
        rt.block_on(write_frame(writer, &frame))
    }

    /// Block until a response or a locally posted wake-up arrives
    ///
    /// Wake-ups take priority over bytes already waiting on the socket.
    pub fn receive(&self) -> Result<ServerMessage> {
        let rt = io_runtime()?;
        let mut guard = lock(&self.reader);
        let ClientReader {
            half,
            partial,
            wakes,
        } = &mut *guard;

        if let Ok(wake) = wakes.try_recv() {
            return Ok(wake);
        }
        let half = half.as_mut().ok_or(Error::Closed)?;
        let frame_timeout = self.frame_timeout;

        rt.block_on(async {
            tokio::select! {
                biased;
                Some(wake) = wakes.recv() => Ok(wake),
                frame = read_frame(half, partial, ServerMessage::SIZE, frame_timeout) => {
                    ServerMessage::decode(&frame?)
                }
            }
        })
    }

    /// Post a synthetic close for the thread parked in [`PipeClient::receive`]
    pub fn wake(&self, wake: ServerMessage) -> Result<()> {
        self.wake_tx.send(wake).map_err(|_| Error::Closed)
    }

    /// Discard wake-ups nobody consumed; the connection itself is private
    pub fn drain(&self) -> usize {
        let mut discarded = 0;
        if let Some(mut reader) = try_lock(&self.reader) {
            while reader.wakes.try_recv().is_ok() {
                discarded += 1;
            }
        }
        discarded
    }

    /// Drop the connection
    ///
    /// A read half still held by a receiver thread that failed to stop is
    /// left to that thread.
    pub fn disconnect(&self) {
        lock(&self.writer).take();
        match try_lock(&self.reader) {
            Some(mut reader) => {
                reader.half = None;
                reader.partial.clear();
            }
            None => tracing::debug!(pipe = %self.name, "Read half still in use, leaving it"),
        }
    }
}

fn try_lock<T>(mutex: &Mutex<T>) -> Option<std::sync::MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

// === Service side ===

#[derive(Default)]
struct RequestState {
    pending: VecDeque<ClientMessage>,
    interrupted: bool,
    closed: bool,
}

/// Requests from every reader thread, in arrival order
#[derive(Default)]
struct RequestQueue {
    state: Mutex<RequestState>,
    ready: Condvar,
}

impl RequestQueue {
    fn push(&self, request: ClientMessage) {
        lock(&self.state).pending.push_back(request);
        self.ready.notify_one();
    }

    /// Next request; an interrupt wins over pending requests and is consumed
    fn pop(&self) -> Result<ClientMessage> {
        let mut state = lock(&self.state);
        loop {
            if state.interrupted {
                state.interrupted = false;
                return Err(Error::Stopped);
            }
            if let Some(request) = state.pending.pop_front() {
                return Ok(request);
            }
            if state.closed {
                return Err(Error::Closed);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn interrupt(&self) {
        lock(&self.state).interrupted = true;
        self.ready.notify_all();
    }

    fn clear_interrupt(&self) {
        lock(&self.state).interrupted = false;
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.pending.clear();
        drop(state);
        self.ready.notify_all();
    }
}

/// Write halves and the routes bound to them
#[derive(Default)]
struct HandleMap {
    connections: HashMap<ConnectionId, WriteHalf<Stream>>,
    routes: HashMap<RoutingKey, ConnectionId>,
}

impl HandleMap {
    fn bind(&mut self, key: RoutingKey, id: ConnectionId) {
        if let Some(previous) = self.routes.insert(key, id) {
            if previous != id {
                tracing::debug!(%key, from = previous, to = id, "Routing key moved to a new connection");
            }
        }
    }

    fn release(&mut self, id: ConnectionId) {
        self.routes.retain(|_, bound| *bound != id);
        self.connections.remove(&id);
    }
}

struct Shared {
    handles: Mutex<HandleMap>,
    requests: RequestQueue,
    readers: Mutex<Vec<Worker>>,
    shutdown: watch::Sender<bool>,
    frame_timeout: Duration,
    next_id: AtomicU64,
}

impl Shared {
    /// Take ownership of an accepted connection
    ///
    /// The write half joins the handle map; the read half moves into the
    /// connection's reader thread, which becomes its only owner.
    fn adopt(self: &Arc<Self>, rt: &'static Runtime, stream: Stream) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (read, write) = tokio::io::split(stream);
        lock(&self.handles).connections.insert(id, write);

        let shared = Arc::clone(self);
        let worker = match Worker::spawn(format!("dxrt-ipc-conn-{}", id), move || {
            read_loop(rt, shared, id, read)
        }) {
            Ok(worker) => worker,
            Err(e) => {
                lock(&self.handles).release(id);
                return Err(e);
            }
        };

        let mut readers = lock(&self.readers);
        readers.retain(|reader| !reader.is_finished());
        readers.push(worker);
        tracing::debug!(connection = id, "Client connected");
        Ok(())
    }
}

fn accept_loop(rt: &'static Runtime, listener: Listener, shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        let accepted = rt.block_on(async {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => None,
                accepted = listener.accept() => Some(accepted),
            }
        });

        match accepted {
            None => break,
            Some(Ok(stream)) => {
                if let Err(e) = shared.adopt(rt, stream) {
                    tracing::error!(error = %e, "Failed to start connection reader");
                }
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Accept failed");
                thread::sleep(ACCEPT_BACKOFF);
            }
        }
    }

    tracing::debug!("Accept loop stopped");
}

fn read_loop(rt: &'static Runtime, shared: Arc<Shared>, id: ConnectionId, mut read: ReadHalf<Stream>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut partial = Vec::with_capacity(ClientMessage::SIZE);
    let mut bound = false;

    loop {
        let frame = rt.block_on(async {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => Err(Error::Stopped),
                frame = read_frame(&mut read, &mut partial, ClientMessage::SIZE, shared.frame_timeout) => frame,
            }
        });

        match frame.and_then(|bytes| ClientMessage::decode(&bytes)) {
            Ok(request) => {
                if !bound {
                    lock(&shared.handles).bind(request.routing_key, id);
                    bound = true;
                }
                tracing::trace!(connection = id, code = %request.code, "Request received");
                shared.requests.push(request);
            }
            Err(Error::Stopped) => break,
            Err(Error::PeerClosed) => {
                tracing::debug!(connection = id, "Client disconnected");
                break;
            }
            Err(e) => {
                tracing::warn!(connection = id, error = %e, "Dropping connection after read failure");
                break;
            }
        }
    }

    lock(&shared.handles).release(id);
}

/// The service's listener plus every accepted connection
pub struct PipeServer {
    name: String,
    shared: Arc<Shared>,
    accept: Mutex<Option<Worker>>,
}

impl PipeServer {
    /// Bind the well-known name and start accepting connections
    pub fn start(config: &TransportConfig) -> Result<Self> {
        let rt = io_runtime()?;
        let name = config.pipe.resolved_name();
        let listener = bind_listener(rt, &name)
            .map_err(|e| Error::channel_init(&format!("pipe {}", name), e))?;

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            handles: Mutex::new(HandleMap::default()),
            requests: RequestQueue::default(),
            readers: Mutex::new(Vec::new()),
            shutdown,
            frame_timeout: config.pipe.frame_timeout(),
            next_id: AtomicU64::new(1),
        });

        let accept = {
            let shared = Arc::clone(&shared);
            Worker::spawn("dxrt-ipc-accept", move || accept_loop(rt, listener, shared))?
        };

        tracing::info!(pipe = %name, "Pipe listener ready");
        Ok(Self {
            name,
            shared,
            accept: Mutex::new(Some(accept)),
        })
    }

    /// Next request from any connection
    pub fn receive(&self) -> Result<ClientMessage> {
        self.shared.requests.pop()
    }

    /// Unblock one pending [`PipeServer::receive`] with [`Error::Stopped`]
    pub fn interrupt(&self) {
        self.shared.requests.interrupt();
    }

    /// Drop an interrupt that no receiver picked up
    pub fn clear_interrupt(&self) {
        self.shared.requests.clear_interrupt();
    }

    /// Write a response to the connection bound to its routing key
    pub fn send(&self, response: &ServerMessage) -> Result<()> {
        let rt = io_runtime()?;
        let frame = response.encode();
        let key = response.routing_key;

        let mut handles = lock(&self.shared.handles);
        let id = handles
            .routes
            .get(&key)
            .copied()
            .ok_or(Error::UnknownRoute(key.get()))?;
        let writer = handles
            .connections
            .get_mut(&id)
            .ok_or(Error::UnknownRoute(key.get()))?;

        let written = rt.block_on(write_frame(writer, &frame));
        if matches!(written, Err(Error::PeerClosed)) {
            tracing::debug!(connection = id, %key, "Client went away before its response");
            handles.release(id);
        }
        written
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.shared.handles).connections.len()
    }

    /// Stop accepting, stop every reader and remove the socket file
    pub fn close(&self, timeout: Duration) -> Result<()> {
        self.shared.shutdown.send_replace(true);
        let mut outcome = Ok(());

        if let Some(accept) = lock(&self.accept).take() {
            if let Err(e) = accept.join_timeout(timeout) {
                outcome = Err(e);
            }
        }

        let readers = std::mem::take(&mut *lock(&self.shared.readers));
        for reader in readers {
            if let Err(e) = reader.join_timeout(timeout) {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        {
            let mut handles = lock(&self.shared.handles);
            handles.connections.clear();
            handles.routes.clear();
        }
        self.shared.requests.close();

        #[cfg(unix)]
        if let Err(e) = paths::remove_socket(std::path::Path::new(&self.name)) {
            tracing::warn!(pipe = %self.name, error = %e, "Failed to remove socket file");
        }

        tracing::info!(pipe = %self.name, "Pipe listener closed");
        outcome
    }
}
