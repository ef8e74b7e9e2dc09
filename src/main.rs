//! dxipc - diagnostic tool for the DXRT service transport
//!
//! Runs a loopback service or sends single requests to a running one over
//! the message-queue or pipe backend.

use clap::Parser;
use dxrt_ipc::common::logging;
use dxrt_ipc::{cli, commands};
use commands::Commands;

#[derive(Parser)]
#[command(name = "dxipc", about = "DXRT service transport diagnostics")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { backend } => cli::serve(backend),
        command => {
            logging::init_cli();
            cli::dispatch(command)
        }
    };

    if let Err(e) = result {
        eprintln!("Error [{}]: {e}", e.code());
        std::process::exit(1);
    }
}
