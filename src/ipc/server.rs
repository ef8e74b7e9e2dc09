//! Service-side endpoint
//!
//! A [`Server`] owns the service end of the channel pair. Requests are
//! either pulled one at a time with [`Server::receive_from_client`] or
//! pushed to a [`RequestHandler`] running on a dispatch thread. Responses
//! go out through [`Server::send_to_client`] or a cloned [`Responder`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::config::{Backend, TransportConfig};
use crate::common::{Error, Result};

use super::protocol::{ClientMessage, ServerMessage};
use super::transport::ServerTransport;
use super::worker::{lock, StopSignal, Worker};

/// Sends responses from inside a request handler or any other thread
#[derive(Clone)]
pub struct Responder {
    transport: Arc<ServerTransport>,
}

impl Responder {
    /// Route `response` to the client named by its routing key
    pub fn send(&self, response: &ServerMessage) -> Result<()> {
        self.transport.send(response)
    }
}

/// Handles every request while dispatch is running
///
/// The handler sees the raw receive result. A malformed record is reported
/// and dispatch carries on; after any other `Err` the dispatch thread
/// exits, so a daemon can escalate the failure.
/// Implemented for any `FnMut(Result<ClientMessage>, &Responder)` closure.
pub trait RequestHandler: Send + 'static {
    fn on_request(&mut self, request: Result<ClientMessage>, responder: &Responder);
}

impl<F> RequestHandler for F
where
    F: FnMut(Result<ClientMessage>, &Responder) + Send + 'static,
{
    fn on_request(&mut self, request: Result<ClientMessage>, responder: &Responder) {
        self(request, responder)
    }
}

struct Dispatcher {
    worker: Worker,
    stop: Arc<StopSignal>,
}

enum DispatchState {
    Idle,
    Running(Dispatcher),
    Closed,
}

/// The device service's end of the transport
pub struct Server {
    transport: Arc<ServerTransport>,
    dispatch: Mutex<DispatchState>,
    shutdown_timeout: Duration,
}

impl Server {
    /// Create fresh channels for the configured backend
    ///
    /// On the message-queue backend any queues left by a previous instance
    /// are removed and recreated. On the pipe backend the listener is bound
    /// and accepting before this returns.
    pub fn initialize(config: &TransportConfig) -> Result<Self> {
        let transport = ServerTransport::open(config)?;
        tracing::info!(backend = %transport.backend(), "Service transport initialized");

        Ok(Self {
            transport: Arc::new(transport),
            dispatch: Mutex::new(DispatchState::Idle),
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    pub fn backend(&self) -> Backend {
        self.transport.backend()
    }

    /// Start accepting clients; accepting already began in [`Server::initialize`]
    pub fn listen(&self) -> Result<()> {
        self.ensure_open()?;
        tracing::debug!(backend = %self.backend(), "Listening for clients");
        Ok(())
    }

    /// Wait for a connection to become ready
    ///
    /// Both backends deliver readiness through their receive path, so this
    /// returns immediately.
    pub fn select(&self) -> Result<()> {
        self.ensure_open()
    }

    fn ensure_open(&self) -> Result<()> {
        match &*lock(&self.dispatch) {
            DispatchState::Closed => Err(Error::Closed),
            _ => Ok(()),
        }
    }

    /// Block for the next request from any client
    pub fn receive_from_client(&self) -> Result<ClientMessage> {
        match &*lock(&self.dispatch) {
            DispatchState::Idle => {}
            DispatchState::Running(_) => {
                return Err(Error::Unsupported(
                    "direct receive while a request handler is registered",
                ))
            }
            DispatchState::Closed => return Err(Error::Closed),
        }

        loop {
            let request = self.transport.receive()?;
            if request.is_wake_up() {
                tracing::trace!("Discarding stale wake-up");
                continue;
            }
            return Ok(request);
        }
    }

    /// Send a response to the client named by its routing key
    pub fn send_to_client(&self, response: &ServerMessage) -> Result<()> {
        self.transport.send(response)
    }

    /// A handle for sending responses from other threads
    pub fn responder(&self) -> Responder {
        Responder {
            transport: Arc::clone(&self.transport),
        }
    }

    /// Live client connections (pipe backend only)
    pub fn connection_count(&self) -> Option<usize> {
        self.transport.connection_count()
    }

    /// Run `handler` for every request on a dedicated dispatch thread
    ///
    /// A previously registered handler is stopped first.
    pub fn register_receive_cb<H: RequestHandler>(&self, handler: H) -> Result<()> {
        self.replace_handler(Some(Box::new(handler)))
    }

    /// Stop the dispatch thread
    pub fn unregister_receive_cb(&self) -> Result<()> {
        self.replace_handler(None)
    }

    fn replace_handler(&self, handler: Option<Box<dyn RequestHandler>>) -> Result<()> {
        let mut state = lock(&self.dispatch);
        if let DispatchState::Running(dispatcher) = &*state {
            if dispatcher.worker.is_current() {
                return Err(Error::Reentrant(dispatcher.worker.name().to_string()));
            }
        }

        match std::mem::replace(&mut *state, DispatchState::Idle) {
            DispatchState::Closed => {
                *state = DispatchState::Closed;
                return Err(Error::Closed);
            }
            DispatchState::Running(dispatcher) => self.stop_dispatch(dispatcher)?,
            DispatchState::Idle => {}
        }

        if let Some(handler) = handler {
            let stop = Arc::new(StopSignal::new());
            let worker = {
                let transport = Arc::clone(&self.transport);
                let stop = Arc::clone(&stop);
                Worker::spawn("dxrt-ipc-dispatch", move || {
                    dispatch_loop(transport, &stop, handler)
                })?
            };
            *state = DispatchState::Running(Dispatcher { worker, stop });
            tracing::debug!("Request handler registered");
        }
        Ok(())
    }

    fn stop_dispatch(&self, dispatcher: Dispatcher) -> Result<()> {
        if !dispatcher.worker.is_finished() {
            dispatcher.stop.request();
            if let Err(e) = self.transport.wake(dispatcher.stop.token()) {
                tracing::warn!(error = %e, "Failed to post wake-up to dispatcher");
            }
        }
        dispatcher.worker.join_timeout(self.shutdown_timeout)?;
        // The thread may have exited before it consumed the wake-up
        self.transport.clear_wake();
        Ok(())
    }

    /// Stop dispatch and every backend thread, then release the channels
    ///
    /// The message queues are removed; the pipe's socket file is deleted.
    /// Calling this again is a no-op. Must not be called from the handler.
    pub fn close(&self) -> Result<()> {
        let mut state = lock(&self.dispatch);
        if let DispatchState::Running(dispatcher) = &*state {
            if dispatcher.worker.is_current() {
                return Err(Error::Reentrant(dispatcher.worker.name().to_string()));
            }
        }

        let stopped = match std::mem::replace(&mut *state, DispatchState::Closed) {
            DispatchState::Closed => return Ok(()),
            DispatchState::Running(dispatcher) => self.stop_dispatch(dispatcher),
            DispatchState::Idle => Ok(()),
        };

        let released = self.transport.close(self.shutdown_timeout);
        tracing::info!(backend = %self.backend(), "Service transport closed");
        stopped.and(released)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Service close failed during drop");
        }
    }
}

fn dispatch_loop(
    transport: Arc<ServerTransport>,
    stop: &StopSignal,
    mut handler: Box<dyn RequestHandler>,
) {
    let responder = Responder { transport };

    loop {
        let received = responder.transport.receive();
        match &received {
            Ok(request) if request.is_wake_up() => {
                if stop.matches(request.data) {
                    tracing::debug!("Dispatcher stopped by synthetic close");
                    break;
                }
                tracing::trace!("Ignoring stale wake-up");
                continue;
            }
            Err(e) if stop.is_requested() => {
                tracing::debug!(error = %e, "Dispatcher stopping");
                break;
            }
            Err(Error::Stopped) => continue,
            _ => {}
        }

        let failed = matches!(&received, Err(e) if !matches!(e, Error::MalformedFrame { .. }));
        handler.on_request(received, &responder);
        if failed {
            tracing::warn!("Receive failed, dispatch thread exiting");
            break;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ipc::client::Client;
    use crate::ipc::protocol::{RequestCode, ResponseCode, RoutingKey};

    fn pipe_config(dir: &tempfile::TempDir) -> TransportConfig {
        let mut config = TransportConfig::default();
        config.backend = Backend::Pipe;
        config.pipe.name = Some(dir.path().join("server.sock").to_string_lossy().into_owned());
        config
    }

    #[test]
    fn test_direct_receive_and_reply() {
        let dir = tempfile::tempdir().unwrap();
        let config = pipe_config(&dir);
        let server = Server::initialize(&config).unwrap();
        server.listen().unwrap();
        server.select().unwrap();

        let client = Client::connect_as(&config, RoutingKey(700)).unwrap();
        client
            .send_request(ClientMessage::new(RequestCode::ViewFreeMemory).with_data(5))
            .unwrap();

        let request = server.receive_from_client().unwrap();
        assert_eq!(request.routing_key, RoutingKey(700));
        assert_eq!(request.data, 5);
        assert_eq!(server.connection_count(), Some(1));

        server
            .send_to_client(&ServerMessage::reply_to(&request, ResponseCode::ViewFreeMemoryResult))
            .unwrap();
        drop(client);
        server.close().unwrap();
    }

    #[test]
    fn test_direct_receive_after_dispatch_stops() {
        let dir = tempfile::tempdir().unwrap();
        let config = pipe_config(&dir);
        let server = Server::initialize(&config).unwrap();
        server
            .register_receive_cb(|_: Result<ClientMessage>, _: &Responder| {})
            .unwrap();
        server.unregister_receive_cb().unwrap();
        // A second stop with no dispatcher running must leave nothing behind
        server.transport.wake(0).unwrap();
        server.transport.clear_wake();

        let client = Client::connect_as(&config, RoutingKey(701)).unwrap();
        client
            .send_request(ClientMessage::new(RequestCode::GetUsage).with_data(3))
            .unwrap();
        let request = server.receive_from_client().unwrap();
        assert_eq!(request.code, RequestCode::GetUsage);
        assert_eq!(request.data, 3);

        drop(client);
        server.close().unwrap();
    }

    #[test]
    fn test_unknown_route_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::initialize(&pipe_config(&dir)).unwrap();
        let err = server
            .send_to_client(&ServerMessage::new(ResponseCode::Close, RoutingKey(999)))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownRoute(999)));
        server.close().unwrap();
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let dir = tempfile::tempdir().unwrap();
        let config = pipe_config(&dir);
        let server = Server::initialize(&config).unwrap();
        server
            .register_receive_cb(|_: Result<ClientMessage>, _: &Responder| {})
            .unwrap();
        assert!(matches!(
            server.receive_from_client(),
            Err(Error::Unsupported(_))
        ));

        server.close().unwrap();
        server.close().unwrap();
        assert!(matches!(server.listen(), Err(Error::Closed)));
        assert!(matches!(
            server.register_receive_cb(|_: Result<ClientMessage>, _: &Responder| {}),
            Err(Error::Closed)
        ));
        assert!(!std::path::Path::new(config.pipe.name.as_deref().unwrap()).exists());
    }
}
