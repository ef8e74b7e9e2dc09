//! DXRT IPC - request/response transport between inference runtimes and
//! the device service daemon
//!
//! Runtime processes talk to the daemon through a [`Client`]; the daemon
//! answers through a [`Server`]. Messages are fixed-layout little-endian
//! records carried over a System V message-queue pair or a duplex local
//! socket.

pub mod cli;
pub mod commands;
pub mod common;
pub mod daemon;
pub mod ipc;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use ipc::{ClientMessage, RequestCode, ResponseCode, RoutingKey, ServerMessage};
pub use ipc::{Client, Server};
