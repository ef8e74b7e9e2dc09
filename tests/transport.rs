//! End-to-end tests for the client and server endpoints
//!
//! Pipe tests bind a socket inside a fresh temp directory. Queue tests run
//! on Linux only and use queue keys private to each test, so they never
//! touch a real service's queues.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use dxrt_ipc::common::config::{Backend, TransportConfig};
use dxrt_ipc::daemon::LoopbackResponder;
use dxrt_ipc::ipc::{ClientMode, Responder};
use dxrt_ipc::{Client, ClientMessage, Error, RequestCode, ResponseCode, RoutingKey, Server, ServerMessage};

const ALLOCATED_OFFSET: u64 = 0x4000_0000;
const WAIT: Duration = Duration::from_secs(5);

/// Poll `cond` until it holds or `WAIT` elapses
fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Answer every GET_MEMORY with a fixed allocation, everything else loopback
fn allocating_server(config: &TransportConfig) -> Server {
    let server = Server::initialize(config).unwrap();
    server.listen().unwrap();
    server
        .register_receive_cb(|request: dxrt_ipc::Result<ClientMessage>, responder: &Responder| {
            let Ok(request) = request else { return };
            let reply = match request.code {
                RequestCode::GetMemory => {
                    ServerMessage::reply_to(&request, ResponseCode::ConfirmMemoryAllocation)
                        .with_data(ALLOCATED_OFFSET)
                }
                _ => match LoopbackResponder::reply(&request) {
                    Some(reply) => reply,
                    None => return,
                },
            };
            let _ = responder.send(&reply);
        })
        .unwrap();
    server
}

fn loopback_server(config: &TransportConfig) -> Server {
    let server = Server::initialize(config).unwrap();
    let (failures, _) = tokio::sync::mpsc::unbounded_channel();
    server
        .register_receive_cb(LoopbackResponder::new(failures))
        .unwrap();
    server
}

fn get_memory(size: u64) -> ClientMessage {
    ClientMessage::new(RequestCode::GetMemory).with_data(size)
}

#[cfg(unix)]
mod pipe {
    use super::*;

    fn config(dir: &tempfile::TempDir) -> TransportConfig {
        let mut config = TransportConfig::default();
        config.backend = Backend::Pipe;
        config.pipe.name = Some(dir.path().join("service.sock").to_string_lossy().into_owned());
        config.pipe.connect_timeout_ms = 1_000;
        config
    }

    #[test]
    fn test_blocking_call_returns_response() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let server = allocating_server(&config);

        let client = Client::connect_as(&config, RoutingKey(1234)).unwrap();
        let response = client.call(get_memory(1_048_576)).unwrap();

        assert_eq!(response.code, ResponseCode::ConfirmMemoryAllocation);
        assert_eq!(response.routing_key, RoutingKey(1234));
        assert_eq!(response.data, ALLOCATED_OFFSET);

        client.close().unwrap();
        server.close().unwrap();
    }

    #[test]
    fn test_close_consumes_synthetic_close() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let server = allocating_server(&config);

        let client = Client::connect_as(&config, RoutingKey(2001)).unwrap();
        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invoked);
        client
            .register_callback(move |_: &ServerMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let started = Instant::now();
        client.close().unwrap();
        assert!(started.elapsed() < config.shutdown_timeout());
        assert_eq!(client.mode(), ClientMode::Closed);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        server.close().unwrap();
    }

    #[test]
    fn test_real_close_reaches_callback() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let server = loopback_server(&config);

        let client = Client::connect_as(&config, RoutingKey(2002)).unwrap();
        let (tx, rx) = mpsc::channel();
        client
            .register_callback(move |response: &ServerMessage| {
                let _ = tx.send(response.code);
                Ok(())
            })
            .unwrap();

        client
            .send_request(ClientMessage::new(RequestCode::Close))
            .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ResponseCode::Close);

        client.unregister_callback().unwrap();
        assert_eq!(client.mode(), ClientMode::Idle);
        // Back in synchronous mode the same connection still works
        let response = client.call(get_memory(64)).unwrap();
        assert_eq!(response.code, ResponseCode::ConfirmMemoryAllocation);

        client.close().unwrap();
        server.close().unwrap();
    }

    #[test]
    fn test_undersized_frame_drops_only_that_connection() {
        use interprocess::local_socket::{prelude::*, GenericFilePath, Stream};
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let server = loopback_server(&config);

        let healthy = Client::connect_as(&config, RoutingKey(3001)).unwrap();
        healthy.call(get_memory(1)).unwrap();
        assert_eq!(server.connection_count(), Some(1));

        {
            let name = config.pipe.name.clone().unwrap();
            let mut raw = Stream::connect(name.to_fs_name::<GenericFilePath>().unwrap()).unwrap();
            raw.write_all(&[0u8; 10]).unwrap();
            assert!(wait_until(|| server.connection_count() == Some(2)));
        }
        assert!(wait_until(|| server.connection_count() == Some(1)));

        let response = healthy.call(get_memory(2)).unwrap();
        assert_eq!(response.data, 2);

        let newcomer = Client::connect_as(&config, RoutingKey(3002)).unwrap();
        let response = newcomer.call(get_memory(3)).unwrap();
        assert_eq!(response.routing_key, RoutingKey(3002));
        assert_eq!(response.data, 3);

        drop(newcomer);
        drop(healthy);
        server.close().unwrap();
    }

    #[test]
    fn test_responses_keep_send_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let server = loopback_server(&config);

        let client = Client::connect_as(&config, RoutingKey(4001)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client
            .register_callback(move |response: &ServerMessage| {
                sink.lock().unwrap().push(response.data);
                Ok(())
            })
            .unwrap();

        for data in 0..50 {
            client.send_request(get_memory(data)).unwrap();
        }
        assert!(wait_until(|| seen.lock().unwrap().len() == 50));
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<u64>>());

        client.close().unwrap();
        server.close().unwrap();
    }

    #[test]
    fn test_no_callbacks_after_unregister() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let server = loopback_server(&config);
        let responder = server.responder();

        let key = RoutingKey(5001);
        let client = Client::connect_as(&config, key).unwrap();
        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invoked);
        client
            .register_callback(move |_: &ServerMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        client.send_request(get_memory(1)).unwrap();
        assert!(wait_until(|| invoked.load(Ordering::SeqCst) == 1));

        client.unregister_callback().unwrap();
        for data in 0..5 {
            responder
                .send(&ServerMessage::new(ResponseCode::ErrorReport, key).with_data(data))
                .unwrap();
        }
        thread::sleep(Duration::from_millis(100));
        assert_eq!(invoked.load(Ordering::SeqCst), 1);

        client.close().unwrap();
        server.close().unwrap();
    }

    #[test]
    fn test_disconnect_releases_route() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let server = loopback_server(&config);

        let key = RoutingKey(6001);
        let client = Client::connect_as(&config, key).unwrap();
        client.call(get_memory(1)).unwrap();
        drop(client);

        assert!(wait_until(|| server.connection_count() == Some(0)));
        let err = server
            .send_to_client(&ServerMessage::new(ResponseCode::ErrorReport, key))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownRoute(6001)));
        server.close().unwrap();
    }
}

#[cfg(target_os = "linux")]
mod queue {
    use super::*;

    static NEXT: AtomicUsize = AtomicUsize::new(0);

    /// Queue keys private to one test
    fn config() -> TransportConfig {
        let n = NEXT.fetch_add(1, Ordering::Relaxed) as i32;
        let base = 0x3200_0000 | ((std::process::id() as i32 & 0xffff) << 8) | (n << 1);
        let mut config = TransportConfig::default();
        config.backend = Backend::MessageQueue;
        config.queue.to_server_key = base;
        config.queue.to_client_key = base | 1;
        config
    }

    #[test]
    fn test_blocking_call_returns_response() {
        let config = config();
        let server = allocating_server(&config);

        let client = Client::connect_as(&config, RoutingKey(1234)).unwrap();
        let response = client.call(get_memory(1_048_576)).unwrap();

        assert_eq!(response.code, ResponseCode::ConfirmMemoryAllocation);
        assert_eq!(response.routing_key, RoutingKey(1234));
        assert_eq!(response.data, ALLOCATED_OFFSET);
        assert_eq!(server.connection_count(), None);

        client.close().unwrap();
        server.close().unwrap();
    }

    #[test]
    fn test_concurrent_clients_see_only_their_responses() {
        let config = config();
        let server = loopback_server(&config);

        let handles: Vec<_> = [7001i64, 7002]
            .into_iter()
            .map(|key| {
                let config = config.clone();
                thread::spawn(move || {
                    let client = Client::connect_as(&config, RoutingKey(key)).unwrap();
                    for _ in 0..20 {
                        let response = client.call(get_memory(key as u64)).unwrap();
                        assert_eq!(response.routing_key, RoutingKey(key));
                        assert_eq!(response.data, key as u64);
                    }
                    client.close().unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        server.close().unwrap();
    }

    #[test]
    fn test_stale_responses_drained_on_connect() {
        let config = config();
        let server = Server::initialize(&config).unwrap();

        let key = RoutingKey(8001);
        for data in 0..3 {
            server
                .send_to_client(&ServerMessage::new(ResponseCode::ConfirmMemoryFree, key).with_data(data))
                .unwrap();
        }

        let client = Client::connect_as(&config, key).unwrap();
        assert_eq!(client.drained_on_connect(), 3);
        assert_eq!(client.drain_stale().unwrap(), 0);

        client.close().unwrap();
        server.close().unwrap();
    }

    #[test]
    fn test_close_leaves_no_wake_up_behind() {
        let config = config();
        let server = loopback_server(&config);

        let key = RoutingKey(8101);
        let client = Client::connect_as(&config, key).unwrap();
        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invoked);
        client
            .register_callback(move |_: &ServerMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        client.close().unwrap();
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        let successor = Client::connect_as(&config, key).unwrap();
        assert_eq!(successor.drained_on_connect(), 0);
        successor.close().unwrap();
        server.close().unwrap();
    }

    #[test]
    fn test_responses_keep_send_order() {
        let config = config();
        let server = loopback_server(&config);

        let client = Client::connect_as(&config, RoutingKey(8201)).unwrap();
        let (tx, rx) = mpsc::channel();
        client
            .register_callback(move |response: &ServerMessage| {
                let _ = tx.send(response.data);
                Ok(())
            })
            .unwrap();

        for data in 0..30 {
            client.send_request(get_memory(data)).unwrap();
        }
        let received: Vec<u64> = (0..30).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(received, (0..30).collect::<Vec<u64>>());

        client.close().unwrap();
        server.close().unwrap();
    }

    #[test]
    fn test_rogue_frame_does_not_stop_dispatch() {
        use dxrt_ipc::ipc::transport::queue::MessageQueue;
        use dxrt_ipc::ipc::transport::Direction;

        let config = config();
        let server = loopback_server(&config);

        let rogue = MessageQueue::new(config.queue.to_server_key, Direction::ToServer);
        rogue.open().unwrap();
        rogue.send(&[0u8; 10], RoutingKey::SERVER).unwrap();
        rogue.detach();

        let client = Client::connect_as(&config, RoutingKey(8401)).unwrap();
        let response = client.call(get_memory(9)).unwrap();
        assert_eq!(response.code, ResponseCode::ConfirmMemoryAllocation);
        assert_eq!(response.data, 9);

        client.close().unwrap();
        server.close().unwrap();
    }

    #[test]
    fn test_close_wakes_pending_call() {
        let mut config = config();
        config.shutdown_timeout_ms = 500;
        // Initialized without a handler: the request is never answered
        let server = Server::initialize(&config).unwrap();
        let client = Arc::new(Client::connect_as(&config, RoutingKey(8501)).unwrap());

        let (tx, rx) = mpsc::channel();
        let caller = {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                let _ = tx.send(client.call(ClientMessage::new(RequestCode::DeviceInit)));
            })
        };
        assert_eq!(server.receive_from_client().unwrap().code, RequestCode::DeviceInit);

        let started = Instant::now();
        client.close().unwrap();
        assert!(started.elapsed() < config.shutdown_timeout());
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Err(Error::Closed)));
        caller.join().unwrap();
        server.close().unwrap();
    }

    #[test]
    fn test_server_close_removes_queues() {
        let config = config();
        let server = Server::initialize(&config).unwrap();
        let client = Client::connect_as(&config, RoutingKey(8301)).unwrap();
        server.close().unwrap();

        // The queue id the client holds is gone
        let err = client.call(get_memory(1)).unwrap_err();
        assert!(matches!(err, Error::PeerClosed));
    }
}
