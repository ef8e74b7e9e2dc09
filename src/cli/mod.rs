//! CLI command handling
//!
//! Runs one diagnostic command against the service and formats output.

use crate::commands::Commands;
use crate::common::config::{Backend, Config, TransportConfig};
use crate::common::{logging, Result};
use crate::daemon;
use crate::ipc::{Client, ClientMessage, RequestCode, RoutingKey, ServerMessage};

/// Load the config file and apply a command-line backend override
fn load_config(backend: Option<Backend>) -> Result<Config> {
    let mut config = Config::load()?;
    if let Some(backend) = backend {
        config.transport.backend = backend;
    }
    Ok(config)
}

fn routing_key(key: Option<i64>) -> RoutingKey {
    key.map(RoutingKey).unwrap_or_else(RoutingKey::current_process)
}

/// Send one request, waiting for the response unless told not to
///
/// Notifications have no reply code and are never waited on.
fn run_call(
    config: &TransportConfig,
    key: RoutingKey,
    request: ClientMessage,
    no_wait: bool,
) -> Result<(RoutingKey, Option<ServerMessage>)> {
    let client = Client::connect_as(config, key)?;
    let response = if no_wait || request.code.reply_code().is_none() {
        client.send_request(request)?;
        None
    } else {
        Some(client.call(request)?)
    };
    let key = client.routing_key();
    client.close()?;
    Ok((key, response))
}

/// Run the loopback service with daemon logging
pub fn serve(backend: Option<Backend>) -> Result<()> {
    let config = load_config(backend)?;
    let _guard = logging::init_daemon(&config.daemon.log_file_name);
    daemon::run(config)
}

/// Dispatch a CLI command
pub fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Serve { backend } => serve(backend),

        Commands::Call {
            opcode,
            data,
            device,
            key,
            no_wait,
            backend,
        } => {
            let config = load_config(backend)?;
            let request = ClientMessage::new(opcode).with_device(device).with_data(data);

            match run_call(&config.transport, routing_key(key), request, no_wait)? {
                (_, Some(response)) => println!("{}", serde_json::to_string_pretty(&response)?),
                (key, None) => println!("Sent {} under key {}", opcode, key),
            }
            Ok(())
        }

        Commands::Drain { key, backend } => {
            let config = load_config(backend)?;
            let client = Client::connect_as(&config.transport, routing_key(key))?;
            let discarded = client.drained_on_connect() + client.drain_stale()?;

            println!(
                "Discarded {} stale message(s) for key {} ({})",
                discarded,
                client.routing_key(),
                client.backend()
            );
            client.close()
        }

        Commands::Opcodes => {
            for code in RequestCode::ALL {
                match code.reply_code() {
                    Some(reply) => println!("{:>5}  {:<40} -> {}", code.as_raw(), code.name(), reply),
                    None => println!("{:>5}  {}", code.as_raw(), code.name()),
                }
            }
            Ok(())
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::daemon::LoopbackResponder;
    use crate::ipc::{ResponseCode, Server};

    fn pipe_config(dir: &tempfile::TempDir) -> TransportConfig {
        let mut config = TransportConfig::default();
        config.backend = Backend::Pipe;
        config.pipe.name = Some(dir.path().join("cli.sock").to_string_lossy().into_owned());
        config
    }

    fn loopback(config: &TransportConfig) -> Server {
        let server = Server::initialize(config).unwrap();
        let (failures, _) = tokio::sync::mpsc::unbounded_channel();
        server.register_receive_cb(LoopbackResponder::new(failures)).unwrap();
        server
    }

    #[test]
    fn test_call_waits_for_reply() {
        let dir = tempfile::tempdir().unwrap();
        let config = pipe_config(&dir);
        let server = loopback(&config);

        let request = ClientMessage::new(RequestCode::GetMemory).with_data(8);
        let (key, response) = run_call(&config, RoutingKey(900), request, false).unwrap();
        assert_eq!(key, RoutingKey(900));
        let response = response.unwrap();
        assert_eq!(response.code, ResponseCode::ConfirmMemoryAllocation);
        assert_eq!(response.data, 8);
        server.close().unwrap();
    }

    #[test]
    fn test_notification_is_sent_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let config = pipe_config(&dir);
        let server = loopback(&config);

        assert!(RequestCode::DeviceInit.reply_code().is_none());
        let request = ClientMessage::new(RequestCode::DeviceInit);
        let (_, response) = run_call(&config, RoutingKey(901), request, false).unwrap();
        assert!(response.is_none());
        server.close().unwrap();
    }
}
