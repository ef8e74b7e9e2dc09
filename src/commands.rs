//! CLI command definitions
//!
//! Defines the clap commands for the `dxipc` diagnostic tool.

use clap::Subcommand;

use crate::common::config::Backend;
use crate::ipc::RequestCode;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the loopback diagnostic service until SIGINT/SIGTERM
    Serve {
        /// Channel backend (overrides the config file)
        #[arg(long, value_enum)]
        backend: Option<Backend>,
    },

    /// Send one request and print the response as JSON
    Call {
        /// Request opcode, by name (GET_MEMORY) or number (1)
        opcode: RequestCode,

        /// Generic payload: size, offset or pid depending on the opcode
        #[arg(long, default_value_t = 0)]
        data: u64,

        /// Target device
        #[arg(long, default_value_t = 0)]
        device: u32,

        /// Routing key to send under (default: this process id)
        #[arg(long)]
        key: Option<i64>,

        /// Send without waiting for a response
        #[arg(long)]
        no_wait: bool,

        /// Channel backend (overrides the config file)
        #[arg(long, value_enum)]
        backend: Option<Backend>,
    },

    /// Discard stale responses left for a routing key
    Drain {
        /// Routing key to drain (default: this process id)
        #[arg(long)]
        key: Option<i64>,

        /// Channel backend (overrides the config file)
        #[arg(long, value_enum)]
        backend: Option<Backend>,
    },

    /// List every request opcode and its reply
    Opcodes,
}
