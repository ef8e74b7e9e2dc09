//! System V message-queue backend
//!
//! Two well-known queues are shared by every process on the host: one
//! carries requests to the service, the other carries responses back.
//! Each queue message carries a `long` type tag ahead of the payload.
//! Requests are tagged with [`RoutingKey::SERVER`]; responses are tagged
//! with the addressed client's routing key, so a client receiving with its
//! own key as the type filter only ever sees its own traffic.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

use crate::common::config::TransportConfig;
use crate::common::{Error, Result};
use crate::ipc::protocol::{ClientMessage, RoutingKey, ServerMessage, WireRecord};

use super::Direction;

/// Largest payload a queue message may carry
pub const MAX_PAYLOAD: usize = 1024;

const QUEUE_MODE: libc::c_int = 0o666;
const NO_QUEUE: libc::c_int = -1;

/// Kernel message layout: type tag followed by the payload bytes
#[repr(C)]
struct RawMessage {
    mtype: libc::c_long,
    mtext: [u8; MAX_PAYLOAD],
}

impl RawMessage {
    fn new(mtype: libc::c_long) -> Self {
        Self {
            mtype,
            mtext: [0; MAX_PAYLOAD],
        }
    }
}

/// Stale responses are discarded with a short pause between each one
#[derive(Debug, Clone, Copy)]
struct DrainPolicy {
    pause: Duration,
    max_messages: usize,
}

impl From<&TransportConfig> for DrainPolicy {
    fn from(config: &TransportConfig) -> Self {
        Self {
            pause: config.drain_pause(),
            max_messages: config.drain_max_messages,
        }
    }
}

/// One direction of the pair
pub struct MessageQueue {
    key: libc::key_t,
    direction: Direction,
    id: AtomicI32,
}

impl MessageQueue {
    pub fn new(key: i32, direction: Direction) -> Self {
        Self {
            key: key as libc::key_t,
            direction,
            id: AtomicI32::new(NO_QUEUE),
        }
    }

    fn label(&self) -> String {
        format!("{} queue 0x{:08x}", self.direction, self.key)
    }

    fn id(&self) -> Result<libc::c_int> {
        match self.id.load(Ordering::Acquire) {
            NO_QUEUE => Err(Error::Closed),
            id => Ok(id),
        }
    }

    /// Obtain the queue, creating it with mode 0666 if absent
    pub fn open(&self) -> Result<()> {
        let id = unsafe { libc::msgget(self.key, libc::IPC_CREAT | QUEUE_MODE) };
        if id == -1 {
            return Err(Error::channel_init(
                &self.label(),
                io::Error::last_os_error(),
            ));
        }
        self.id.store(id, Ordering::Release);
        tracing::debug!(queue = %self.label(), id, "Message queue attached");
        Ok(())
    }

    /// Remove the queue from the system; a no-op when never opened
    pub fn delete(&self) -> Result<()> {
        let id = self.id.swap(NO_QUEUE, Ordering::AcqRel);
        if id == NO_QUEUE {
            return Ok(());
        }
        if unsafe { libc::msgctl(id, libc::IPC_RMID, std::ptr::null_mut()) } == -1 {
            let err = io::Error::last_os_error();
            // Already removed by someone else
            if !matches!(err.raw_os_error(), Some(libc::EIDRM) | Some(libc::EINVAL)) {
                return Err(Error::Io(err));
            }
        }
        tracing::debug!(queue = %self.label(), id, "Message queue removed");
        Ok(())
    }

    /// Forget the queue id without removing the queue
    pub fn detach(&self) {
        self.id.store(NO_QUEUE, Ordering::Release);
    }

    /// Send `payload` tagged with `key`, retrying on signal interruption
    pub fn send(&self, payload: &[u8], key: RoutingKey) -> Result<()> {
        if key.get() <= 0 {
            return Err(Error::UnknownRoute(key.get()));
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::Send(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} byte payload exceeds {} bytes", payload.len(), MAX_PAYLOAD),
            )));
        }

        let id = self.id()?;
        let mut raw = RawMessage::new(key.get() as libc::c_long);
        raw.mtext[..payload.len()].copy_from_slice(payload);

        loop {
            let rc = unsafe {
                libc::msgsnd(
                    id,
                    &raw as *const RawMessage as *const libc::c_void,
                    payload.len(),
                    0,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EIDRM) | Some(libc::EINVAL) => return Err(Error::PeerClosed),
                _ => return Err(Error::Send(err)),
            }
        }
    }

    fn receive_raw(
        &self,
        raw: &mut RawMessage,
        key: RoutingKey,
        flags: libc::c_int,
    ) -> io::Result<usize> {
        let id = self.id.load(Ordering::Acquire);
        if id == NO_QUEUE {
            return Err(io::Error::from_raw_os_error(libc::EIDRM));
        }
        loop {
            let n = unsafe {
                libc::msgrcv(
                    id,
                    raw as *mut RawMessage as *mut libc::c_void,
                    MAX_PAYLOAD,
                    key.get() as libc::c_long,
                    flags,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
    }

    /// Block until a message tagged `key` arrives and copy it into `buf`
    pub fn receive(&self, buf: &mut [u8], key: RoutingKey) -> Result<usize> {
        self.id()?;
        let mut raw = RawMessage::new(0);
        let n = self
            .receive_raw(&mut raw, key, 0)
            .map_err(|err| match err.raw_os_error() {
                // Queue removed while we were waiting
                Some(libc::EIDRM) | Some(libc::EINVAL) => Error::PeerClosed,
                _ => Error::Receive(err),
            })?;
        if n > buf.len() {
            return Err(Error::MalformedFrame {
                expected: buf.len(),
                actual: n,
            });
        }
        buf[..n].copy_from_slice(&raw.mtext[..n]);
        tracing::trace!(queue = %self.label(), mtype = raw.mtype, bytes = n, "Queue message received");
        Ok(n)
    }

    /// Discard every message currently waiting under `key`
    fn drain(&self, key: RoutingKey, policy: DrainPolicy) -> Result<usize> {
        let mut raw = RawMessage::new(0);
        let mut discarded = 0;

        loop {
            if discarded >= policy.max_messages {
                tracing::warn!(
                    queue = %self.label(),
                    %key,
                    discarded,
                    "Drain limit reached, leaving remaining messages"
                );
                break;
            }
            match self.receive_raw(&mut raw, key, libc::IPC_NOWAIT) {
                Ok(n) => {
                    discarded += 1;
                    tracing::debug!(queue = %self.label(), %key, bytes = n, "Discarded stale message");
                    thread::sleep(policy.pause);
                }
                Err(err) if err.raw_os_error() == Some(libc::ENOMSG) => break,
                Err(err) => return Err(Error::Receive(err)),
            }
        }

        Ok(discarded)
    }
}

/// The to-server / to-client queue pair
pub struct QueuePair {
    to_server: MessageQueue,
    to_client: MessageQueue,
    drain: DrainPolicy,
}

impl QueuePair {
    fn new(config: &TransportConfig) -> Self {
        Self {
            to_server: MessageQueue::new(config.queue.to_server_key, Direction::ToServer),
            to_client: MessageQueue::new(config.queue.to_client_key, Direction::ToClient),
            drain: DrainPolicy::from(config),
        }
    }

    /// Client side: attach to both queues, creating them if absent
    pub fn attach(config: &TransportConfig, key: RoutingKey) -> Result<Self> {
        if key.get() <= 0 {
            return Err(Error::Config(format!(
                "routing key {} must be positive for the message-queue backend",
                key
            )));
        }
        let pair = Self::new(config);
        pair.to_server.open()?;
        pair.to_client.open()?;
        Ok(pair)
    }

    /// Server side: remove any previous instance's queues and create them fresh
    pub fn recreate(config: &TransportConfig) -> Result<Self> {
        let pair = Self::new(config);
        for queue in [&pair.to_server, &pair.to_client] {
            queue.open()?;
            queue.delete()?;
            queue.open()?;
        }
        tracing::info!(
            to_server = %pair.to_server.label(),
            to_client = %pair.to_client.label(),
            "Message queues created"
        );
        Ok(pair)
    }

    /// Discard responses already waiting for `key`
    pub fn drain(&self, key: RoutingKey) -> Result<usize> {
        let discarded = self.to_client.drain(key, self.drain)?;
        if discarded > 0 {
            tracing::info!(%key, discarded, "Drained stale responses");
        }
        Ok(discarded)
    }

    pub fn send_to_server(&self, request: &ClientMessage) -> Result<()> {
        self.to_server.send(&request.encode(), RoutingKey::SERVER)
    }

    /// Next request from any client; records of the wrong size are skipped
    pub fn receive_from_client(&self) -> Result<ClientMessage> {
        let mut buf = [0u8; MAX_PAYLOAD];
        loop {
            let n = self.to_server.receive(&mut buf, RoutingKey::SERVER)?;
            match ClientMessage::decode(&buf[..n]) {
                Err(Error::MalformedFrame { expected, actual }) => {
                    tracing::warn!(
                        queue = %self.to_server.label(),
                        expected,
                        actual,
                        "Skipping malformed request"
                    );
                }
                decoded => return decoded,
            }
        }
    }

    pub fn send_to_client(&self, response: &ServerMessage) -> Result<()> {
        self.to_client.send(&response.encode(), response.routing_key)
    }

    pub fn receive_from_server(&self, key: RoutingKey) -> Result<ServerMessage> {
        let mut buf = [0u8; MAX_PAYLOAD];
        loop {
            let n = self.to_client.receive(&mut buf, key)?;
            match ServerMessage::decode(&buf[..n]) {
                Err(Error::MalformedFrame { expected, actual }) => {
                    tracing::warn!(%key, expected, actual, "Skipping malformed response");
                }
                decoded => return decoded,
            }
        }
    }

    pub fn detach(&self) {
        self.to_server.detach();
        self.to_client.detach();
    }

    /// Remove both queues; any thread blocked on them wakes with an error
    pub fn remove(&self) -> Result<()> {
        let to_server = self.to_server.delete();
        let to_client = self.to_client.delete();
        to_server.and(to_client)
    }
}
