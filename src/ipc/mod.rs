//! Cross-process transport between runtime clients and the device service
//!
//! The wire records live in [`protocol`], the two channel backends in
//! [`transport`], and the endpoints in [`client`] and [`server`].

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod worker;

pub use client::{Client, ClientMode, ResponseHandler};
pub use protocol::{ClientMessage, RequestCode, ResponseCode, RoutingKey, ServerMessage, WireRecord};
pub use server::{RequestHandler, Responder, Server};
