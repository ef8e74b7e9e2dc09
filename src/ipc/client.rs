//! Runtime-side endpoint for talking to the device service
//!
//! A [`Client`] works in one of two modes. While idle, [`Client::call`]
//! sends a request and blocks for the matching response. Once a callback
//! is registered a dedicated receiver thread owns the to-client channel and
//! hands every response to the callback; synchronous calls are refused
//! until the callback is removed again.
//!
//! Stopping the receiver thread posts a synthetic close onto the client's
//! own to-client channel. The thread recognises it by a token only this
//! stop knows, so it exits without invoking the callback and without
//! being confused by a close the service really sent.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::common::config::{Backend, TransportConfig};
use crate::common::{Error, Result};

use super::protocol::{ClientMessage, ResponseCode, RoutingKey, ServerMessage, WAKE_SEQ_ID};
use super::transport::ClientTransport;
use super::worker::{lock, StopSignal, Worker};

/// Receives every response while a callback is registered
///
/// Implemented for any `FnMut(&ServerMessage) -> Result<()>` closure. An
/// error is logged and the receiver keeps going.
pub trait ResponseHandler: Send + 'static {
    fn on_response(&mut self, response: &ServerMessage) -> Result<()>;
}

impl<F> ResponseHandler for F
where
    F: FnMut(&ServerMessage) -> Result<()> + Send + 'static,
{
    fn on_response(&mut self, response: &ServerMessage) -> Result<()> {
        self(response)
    }
}

/// Which mode the client is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMode {
    Idle,
    Listening,
    Closed,
}

struct Listener {
    worker: Worker,
    stop: Arc<StopSignal>,
}

enum ClientState {
    Idle,
    Listening(Listener),
    Closed,
}

/// One runtime process's connection to the service
pub struct Client {
    key: RoutingKey,
    transport: Arc<ClientTransport>,
    state: Mutex<ClientState>,
    // Serializes synchronous calls; never held by close
    call_lock: Mutex<()>,
    in_call: AtomicBool,
    closed: AtomicBool,
    next_seq: AtomicI32,
    drained_on_connect: usize,
    shutdown_timeout: Duration,
}

impl Client {
    /// Connect under the current process id
    pub fn connect(config: &TransportConfig) -> Result<Self> {
        Self::connect_as(config, RoutingKey::current_process())
    }

    /// Connect under an explicit routing key
    ///
    /// Responses left over for `key` by an earlier process are drained
    /// before this returns.
    pub fn connect_as(config: &TransportConfig, key: RoutingKey) -> Result<Self> {
        let (transport, drained_on_connect) = ClientTransport::open(config, key)?;
        tracing::debug!(%key, backend = %transport.backend(), drained_on_connect, "Client connected");

        Ok(Self {
            key,
            transport: Arc::new(transport),
            state: Mutex::new(ClientState::Idle),
            call_lock: Mutex::new(()),
            in_call: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_seq: AtomicI32::new(1),
            drained_on_connect,
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    pub fn routing_key(&self) -> RoutingKey {
        self.key
    }

    pub fn backend(&self) -> Backend {
        self.transport.backend()
    }

    /// Stale messages discarded while connecting
    pub fn drained_on_connect(&self) -> usize {
        self.drained_on_connect
    }

    pub fn mode(&self) -> ClientMode {
        match &*lock(&self.state) {
            ClientState::Idle => ClientMode::Idle,
            ClientState::Listening(_) => ClientMode::Listening,
            ClientState::Closed => ClientMode::Closed,
        }
    }

    fn next_seq(&self) -> i32 {
        // Stays positive; zero means "not sequenced" on the wire
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) & i32::MAX;
        seq.max(1)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Send `request` and block for its response
    ///
    /// The routing key and a fresh sequence number are stamped onto the
    /// request. Responses carrying a different non-zero sequence number are
    /// leftovers from an abandoned exchange and are dropped. A concurrent
    /// [`Client::close`] makes a waiting call return [`Error::Closed`].
    pub fn call(&self, mut request: ClientMessage) -> Result<ServerMessage> {
        let _call = lock(&self.call_lock);
        match &*lock(&self.state) {
            ClientState::Idle => {}
            ClientState::Listening(_) => {
                return Err(Error::Unsupported(
                    "synchronous call while a response callback is registered",
                ))
            }
            ClientState::Closed => return Err(Error::Closed),
        }

        self.in_call.store(true, Ordering::SeqCst);
        let outcome = self.exchange(&mut request);
        self.in_call.store(false, Ordering::SeqCst);
        outcome
    }

    fn exchange(&self, request: &mut ClientMessage) -> Result<ServerMessage> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        request.routing_key = self.key;
        request.seq_id = self.next_seq();
        self.transport.send(request)?;
        tracing::trace!(key = %self.key, code = %request.code, seq = request.seq_id, "Request sent");

        loop {
            let response = match self.transport.receive(self.key) {
                Ok(response) => response,
                Err(_) if self.closed.load(Ordering::SeqCst) => return Err(Error::Closed),
                Err(e) => return Err(e),
            };
            if response.is_wake_up() {
                if self.closed.load(Ordering::SeqCst) {
                    tracing::debug!(key = %self.key, "Call cancelled by close");
                    return Err(Error::Closed);
                }
                tracing::trace!(key = %self.key, "Discarding stale wake-up");
                continue;
            }
            if response.seq_id != 0 && response.seq_id != request.seq_id {
                tracing::debug!(
                    key = %self.key,
                    expected = request.seq_id,
                    got = response.seq_id,
                    "Discarding out-of-sequence response"
                );
                continue;
            }
            return Ok(response);
        }
    }

    /// Send without waiting for a response
    ///
    /// The caller's sequence number is kept unless it collides with the
    /// synthetic-close marker, in which case a fresh one is stamped.
    pub fn send_request(&self, mut request: ClientMessage) -> Result<()> {
        self.ensure_open()?;
        request.routing_key = self.key;
        if request.seq_id == WAKE_SEQ_ID {
            request.seq_id = self.next_seq();
        }
        self.transport.send(&request)
    }

    /// Hand every response to `handler` on a dedicated receiver thread
    ///
    /// A previously registered callback is stopped first.
    pub fn register_callback<H: ResponseHandler>(&self, handler: H) -> Result<()> {
        self.replace_callback(Some(Box::new(handler)))
    }

    /// Stop the receiver thread and return to synchronous mode
    pub fn unregister_callback(&self) -> Result<()> {
        self.replace_callback(None)
    }

    fn replace_callback(&self, handler: Option<Box<dyn ResponseHandler>>) -> Result<()> {
        // A call in flight owns the to-client channel until it returns
        let _call = lock(&self.call_lock);
        let mut state = lock(&self.state);
        if let ClientState::Listening(listener) = &*state {
            if listener.worker.is_current() {
                return Err(Error::Reentrant(listener.worker.name().to_string()));
            }
        }

        match std::mem::replace(&mut *state, ClientState::Idle) {
            ClientState::Closed => {
                *state = ClientState::Closed;
                return Err(Error::Closed);
            }
            ClientState::Listening(listener) => self.stop_listener(listener)?,
            ClientState::Idle => {}
        }

        if let Some(handler) = handler {
            *state = ClientState::Listening(self.spawn_listener(handler)?);
            tracing::debug!(key = %self.key, "Response callback registered");
        }
        Ok(())
    }

    fn spawn_listener(&self, handler: Box<dyn ResponseHandler>) -> Result<Listener> {
        let stop = Arc::new(StopSignal::new());
        let worker = {
            let transport = Arc::clone(&self.transport);
            let stop = Arc::clone(&stop);
            let key = self.key;
            Worker::spawn(format!("dxrt-ipc-rx-{}", key), move || {
                receive_loop(&transport, key, &stop, handler)
            })?
        };
        Ok(Listener { worker, stop })
    }

    fn stop_listener(&self, listener: Listener) -> Result<()> {
        if !listener.worker.is_finished() {
            listener.stop.request();
            if let Err(e) = self.transport.wake(self.key, listener.stop.token()) {
                tracing::warn!(key = %self.key, error = %e, "Failed to post wake-up to receiver");
            }
        }
        listener.worker.join_timeout(self.shutdown_timeout)
    }

    /// Discard responses already waiting for this client
    pub fn drain_stale(&self) -> Result<usize> {
        let _call = lock(&self.call_lock);
        let state = lock(&self.state);
        match &*state {
            ClientState::Idle => self.transport.drain(self.key),
            ClientState::Listening(_) => Err(Error::Unsupported(
                "drain while a response callback is registered",
            )),
            ClientState::Closed => Err(Error::Closed),
        }
    }

    /// Stop the receiver thread, if any, and release the channels
    ///
    /// A call blocked waiting for its response is woken and returns
    /// [`Error::Closed`]. Calling this again is a no-op. Must not be called
    /// from the callback.
    pub fn close(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if let ClientState::Listening(listener) = &*state {
            if listener.worker.is_current() {
                return Err(Error::Reentrant(listener.worker.name().to_string()));
            }
        }

        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.in_call.load(Ordering::SeqCst) {
            if let Err(e) = self.transport.wake(self.key, StopSignal::new().token()) {
                tracing::warn!(key = %self.key, error = %e, "Failed to wake pending call");
            }
        }

        let stopped = match std::mem::replace(&mut *state, ClientState::Closed) {
            ClientState::Closed => return Ok(()),
            ClientState::Listening(listener) => self.stop_listener(listener),
            ClientState::Idle => Ok(()),
        };

        self.transport.release();
        tracing::debug!(key = %self.key, "Client closed");
        stopped
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(key = %self.key, error = %e, "Client close failed during drop");
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("key", &self.key)
            .field("backend", &self.transport.backend())
            .field("mode", &self.mode())
            .finish()
    }
}

fn receive_loop(
    transport: &ClientTransport,
    key: RoutingKey,
    stop: &StopSignal,
    mut handler: Box<dyn ResponseHandler>,
) {
    loop {
        let response = match transport.receive(key) {
            Ok(response) => response,
            Err(e) => {
                if stop.is_requested() || e.is_disconnect() {
                    tracing::debug!(%key, error = %e, "Receiver stopping");
                } else {
                    tracing::error!(%key, error = %e, "Receive failed, receiver thread exiting");
                }
                break;
            }
        };

        if response.is_wake_up() {
            if stop.matches(response.data) {
                tracing::debug!(%key, "Receiver stopped by synthetic close");
                break;
            }
            tracing::trace!(%key, "Ignoring stale wake-up");
            continue;
        }

        if let Err(e) = handler.on_response(&response) {
            tracing::warn!(%key, code = %response.code, error = %e, "Response callback failed");
        }
        if response.code == ResponseCode::Close {
            tracing::debug!(%key, "Service sent CLOSE");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ipc::protocol::RequestCode;
    use std::sync::mpsc;

    fn pipe_config(dir: &tempfile::TempDir) -> TransportConfig {
        let mut config = TransportConfig::default();
        config.backend = Backend::Pipe;
        config.pipe.name = Some(dir.path().join("client.sock").to_string_lossy().into_owned());
        config.pipe.connect_timeout_ms = 200;
        config
    }

    #[test]
    fn test_connect_without_service_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Client::connect_as(&pipe_config(&dir), RoutingKey(42)).unwrap_err();
        assert!(matches!(err, Error::ServiceNotRunning(_)));
    }

    #[test]
    fn test_mode_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let config = pipe_config(&dir);
        let server = crate::ipc::server::Server::initialize(&config).unwrap();
        let client = Client::connect_as(&config, RoutingKey(42)).unwrap();
        assert_eq!(client.mode(), ClientMode::Idle);

        let (tx, _rx) = mpsc::channel();
        client
            .register_callback(move |response: &ServerMessage| {
                let _ = tx.send(response.code);
                Ok(())
            })
            .unwrap();
        assert_eq!(client.mode(), ClientMode::Listening);
        assert!(matches!(
            client.call(ClientMessage::new(RequestCode::GetUsage)),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(client.drain_stale(), Err(Error::Unsupported(_))));

        client.unregister_callback().unwrap();
        assert_eq!(client.mode(), ClientMode::Idle);

        client.close().unwrap();
        client.close().unwrap();
        assert_eq!(client.mode(), ClientMode::Closed);
        assert!(matches!(
            client.send_request(ClientMessage::new(RequestCode::GetUsage)),
            Err(Error::Closed)
        ));
        server.close().unwrap();
    }

    #[test]
    fn test_close_wakes_pending_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = pipe_config(&dir);
        config.shutdown_timeout_ms = 500;
        // Nobody answers: the request just sits in the service's queue
        let server = crate::ipc::server::Server::initialize(&config).unwrap();
        let client = Arc::new(Client::connect_as(&config, RoutingKey(44)).unwrap());

        let (tx, rx) = mpsc::channel();
        let caller = {
            let client = Arc::clone(&client);
            std::thread::spawn(move || {
                let _ = tx.send(client.call(ClientMessage::new(RequestCode::DeviceInit)));
            })
        };
        assert!(server.receive_from_client().is_ok());
        assert_eq!(client.mode(), ClientMode::Idle);

        let started = std::time::Instant::now();
        client.close().unwrap();
        assert!(started.elapsed() < config.shutdown_timeout());

        let outcome = rx.recv_timeout(config.shutdown_timeout()).unwrap();
        assert!(matches!(outcome, Err(Error::Closed)));
        caller.join().unwrap();
        assert!(matches!(
            client.call(ClientMessage::new(RequestCode::GetUsage)),
            Err(Error::Closed)
        ));
        server.close().unwrap();
    }

    #[test]
    fn test_send_request_never_forwards_wake_marker() {
        let dir = tempfile::tempdir().unwrap();
        let config = pipe_config(&dir);
        let server = crate::ipc::server::Server::initialize(&config).unwrap();
        let client = Client::connect_as(&config, RoutingKey(45)).unwrap();

        let mut request = ClientMessage::new(RequestCode::Close);
        request.seq_id = WAKE_SEQ_ID;
        client.send_request(request).unwrap();
        let mut request = ClientMessage::new(RequestCode::Close);
        request.seq_id = 17;
        client.send_request(request).unwrap();

        let first = server.receive_from_client().unwrap();
        assert_eq!(first.code, RequestCode::Close);
        assert!(!first.is_wake_up());
        assert!(first.seq_id >= 1);
        assert_eq!(server.receive_from_client().unwrap().seq_id, 17);

        drop(client);
        server.close().unwrap();
    }

    #[test]
    fn test_sequence_numbers_stay_positive() {
        let dir = tempfile::tempdir().unwrap();
        let config = pipe_config(&dir);
        let server = crate::ipc::server::Server::initialize(&config).unwrap();
        let client = Client::connect_as(&config, RoutingKey(43)).unwrap();
        client.next_seq.store(i32::MAX, Ordering::Relaxed);
        assert_eq!(client.next_seq(), i32::MAX);
        assert!(client.next_seq() >= 1);
        drop(client);
        server.close().unwrap();
    }
}
