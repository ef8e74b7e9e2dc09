//! Channel pair backends
//!
//! Two interchangeable channel technologies carry the same fixed-size
//! records:
//!
//! - [`queue`]: a system-wide System V message-queue pair (Linux). Every
//!   client attaches to the same two queues and is told apart by the
//!   queue message type, which is its routing key.
//! - [`pipe`]: a duplex local socket (Unix domain socket / Windows named
//!   pipe) with one private connection per client.
//!
//! The backend is picked once when an endpoint is constructed; the
//! [`ClientTransport`] and [`ServerTransport`] enums are the closed set of
//! variants the endpoints work with.

pub mod pipe;
#[cfg(target_os = "linux")]
pub mod queue;

use std::time::Duration;

use crate::common::config::{Backend, TransportConfig};
use crate::common::Result;

use super::protocol::{ClientMessage, RoutingKey, ServerMessage};

/// Which way a channel carries messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToServer,
    ToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ToServer => write!(f, "to-server"),
            Direction::ToClient => write!(f, "to-client"),
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn queue_unavailable<T>() -> Result<T> {
    Err(crate::common::Error::Unsupported(
        "the message-queue backend requires Linux",
    ))
}

/// Client side of a channel pair
pub enum ClientTransport {
    #[cfg(target_os = "linux")]
    Queue(queue::QueuePair),
    Pipe(pipe::PipeClient),
}

impl ClientTransport {
    /// Attach to the service's channels and drain stale messages for `key`
    ///
    /// Returns the transport and the number of stale messages discarded.
    pub fn open(config: &TransportConfig, key: RoutingKey) -> Result<(Self, usize)> {
        match config.backend {
            #[cfg(target_os = "linux")]
            Backend::MessageQueue => {
                let pair = queue::QueuePair::attach(config, key)?;
                let drained = pair.drain(key)?;
                Ok((ClientTransport::Queue(pair), drained))
            }
            #[cfg(not(target_os = "linux"))]
            Backend::MessageQueue => queue_unavailable(),
            Backend::Pipe => Ok((ClientTransport::Pipe(pipe::PipeClient::connect(config)?), 0)),
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            #[cfg(target_os = "linux")]
            ClientTransport::Queue(_) => Backend::MessageQueue,
            ClientTransport::Pipe(_) => Backend::Pipe,
        }
    }

    /// Send one request; the caller has already stamped the routing key
    pub fn send(&self, request: &ClientMessage) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            ClientTransport::Queue(pair) => pair.send_to_server(request),
            ClientTransport::Pipe(pipe) => pipe.send(request),
        }
    }

    /// Block until a response addressed to `key` arrives
    pub fn receive(&self, key: RoutingKey) -> Result<ServerMessage> {
        match self {
            #[cfg(target_os = "linux")]
            ClientTransport::Queue(pair) => pair.receive_from_server(key),
            ClientTransport::Pipe(pipe) => pipe.receive(),
        }
    }

    /// Post a synthetic close on the caller's own to-client channel
    pub fn wake(&self, key: RoutingKey, token: u64) -> Result<()> {
        let wake = ServerMessage::wake_up(key, token);
        match self {
            #[cfg(target_os = "linux")]
            ClientTransport::Queue(pair) => pair.send_to_client(&wake),
            ClientTransport::Pipe(pipe) => pipe.wake(wake),
        }
    }

    /// Discard anything already waiting for `key`
    pub fn drain(&self, key: RoutingKey) -> Result<usize> {
        match self {
            #[cfg(target_os = "linux")]
            ClientTransport::Queue(pair) => pair.drain(key),
            ClientTransport::Pipe(pipe) => Ok(pipe.drain()),
        }
    }

    /// Let go of the channels; clients never remove the shared queues
    pub fn release(&self) {
        match self {
            #[cfg(target_os = "linux")]
            ClientTransport::Queue(pair) => pair.detach(),
            ClientTransport::Pipe(pipe) => pipe.disconnect(),
        }
    }
}

/// Service side of a channel pair
pub enum ServerTransport {
    #[cfg(target_os = "linux")]
    Queue(queue::QueuePair),
    Pipe(pipe::PipeServer),
}

impl ServerTransport {
    /// Create both channels fresh, discarding any previous instance's residue
    pub fn open(config: &TransportConfig) -> Result<Self> {
        match config.backend {
            #[cfg(target_os = "linux")]
            Backend::MessageQueue => Ok(ServerTransport::Queue(queue::QueuePair::recreate(config)?)),
            #[cfg(not(target_os = "linux"))]
            Backend::MessageQueue => queue_unavailable(),
            Backend::Pipe => Ok(ServerTransport::Pipe(pipe::PipeServer::start(config)?)),
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            #[cfg(target_os = "linux")]
            ServerTransport::Queue(_) => Backend::MessageQueue,
            ServerTransport::Pipe(_) => Backend::Pipe,
        }
    }

    /// Block until the next request arrives from any client
    pub fn receive(&self) -> Result<ClientMessage> {
        match self {
            #[cfg(target_os = "linux")]
            ServerTransport::Queue(pair) => pair.receive_from_client(),
            ServerTransport::Pipe(pipe) => pipe.receive(),
        }
    }

    /// Send a response to the client named by its routing key
    pub fn send(&self, response: &ServerMessage) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            ServerTransport::Queue(pair) => pair.send_to_client(response),
            ServerTransport::Pipe(pipe) => pipe.send(response),
        }
    }

    /// Unblock a thread parked in [`ServerTransport::receive`]
    pub fn wake(&self, token: u64) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            ServerTransport::Queue(pair) => {
                pair.send_to_server(&ClientMessage::wake_up(RoutingKey::SERVER, token))
            }
            ServerTransport::Pipe(pipe) => {
                pipe.interrupt();
                Ok(())
            }
        }
    }

    /// Forget a wake-up nobody consumed
    ///
    /// Queue wake-ups are skipped by every receive, so only the pipe keeps
    /// state to clear.
    pub fn clear_wake(&self) {
        match self {
            #[cfg(target_os = "linux")]
            ServerTransport::Queue(_) => {}
            ServerTransport::Pipe(pipe) => pipe.clear_interrupt(),
        }
    }

    /// Number of live client connections, where the backend tracks them
    pub fn connection_count(&self) -> Option<usize> {
        match self {
            #[cfg(target_os = "linux")]
            ServerTransport::Queue(_) => None,
            ServerTransport::Pipe(pipe) => Some(pipe.connection_count()),
        }
    }

    /// Stop backend threads and release the OS resources
    pub fn close(&self, timeout: Duration) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            ServerTransport::Queue(pair) => {
                let _ = timeout;
                pair.remove()
            }
            ServerTransport::Pipe(pipe) => pipe.close(timeout),
        }
    }
}
