//! Common utilities shared between the library, the daemon and the CLI

pub mod config;
pub mod crash;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, Result};
