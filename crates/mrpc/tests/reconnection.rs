#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

//! Reconnect-loop behavior across a server restart.

use std::time::{Duration, Instant};

use mrpc::config::{ClientConfig, ReconnectionConfig};
use mrpc::{Client, ClientBuilder, ErrorKind, MethodError, Server, ServerBuilder};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn echo_server(uri: &str) -> Server {
    ServerBuilder::new()
        .method("echo", |(text,): (String,)| Ok(text))
        .method("slow_echo", |(text,): (String,)| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(text)
        })
        .method("fail", |(): ()| -> Result<(), MethodError> {
            Err(MethodError::new("nope"))
        })
        .listen_to(uri)
        .build()
        .unwrap()
}

fn fast_reconnect_client(uri: String) -> Client {
    let config = ClientConfig {
        uris: vec![uri],
        reconnection: ReconnectionConfig {
            initial_waiting_time_sec: 0.05,
            max_waiting_time_sec: 0.2,
            max_jitter_waiting_time_sec: 0.01,
        },
        ..ClientConfig::default()
    };
    ClientBuilder::from_config(config).build().unwrap()
}

fn wait_until_disconnected(client: &Client) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while client.is_connected() {
        assert!(Instant::now() < deadline, "close was never observed");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn client_survives_a_server_restart() {
    let server = echo_server("tcp://127.0.0.1:0");
    let uri = server.local_uris()[0].to_string();

    let client = fast_reconnect_client(uri.clone());
    client.wait_until_connected(CONNECT_TIMEOUT).unwrap();

    let first: String = client.call("echo", ("before",)).unwrap();
    assert_eq!(first, "before");

    // Take the server down; calls must fail fast while disconnected.
    server.stop();
    drop(server);
    wait_until_disconnected(&client);

    let error = client.call::<String>("echo", ("down",)).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ConnectionFailure);

    // Restart on the same endpoint; the backoff loop reconnects by itself.
    let server = echo_server(&uri);
    client.wait_until_connected(CONNECT_TIMEOUT).unwrap();

    let second: String = client.call("echo", ("after",)).unwrap();
    assert_eq!(second, "after");

    drop(server);
}

#[test]
fn outstanding_calls_drain_with_connection_failure_on_disconnect() {
    let server = echo_server("tcp://127.0.0.1:0");
    let uri = server.local_uris()[0].to_string();

    let client = fast_reconnect_client(uri);
    client.wait_until_connected(CONNECT_TIMEOUT).unwrap();

    let pending = client.async_call::<String>("slow_echo", ("late",));

    // Stop the server while the handler is still sleeping.
    std::thread::sleep(Duration::from_millis(100));
    server.stop();
    drop(server);

    let error = pending.get_result().unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ConnectionFailure);
}

#[test]
fn stopping_the_client_aborts_outstanding_calls() {
    let server = echo_server("tcp://127.0.0.1:0");
    let client = fast_reconnect_client(server.local_uris()[0].to_string());
    client.wait_until_connected(CONNECT_TIMEOUT).unwrap();

    let pending = client.async_call::<String>("slow_echo", ("late",));

    std::thread::sleep(Duration::from_millis(100));
    client.stop();

    let error = pending.get_result().unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Aborted);
}

#[test]
fn second_uri_is_used_when_the_first_is_down() {
    // A freshly bound-then-dropped endpoint refuses connections.
    let dead_uri = {
        let server = echo_server("tcp://127.0.0.1:0");
        server.local_uris()[0].to_string()
    };

    let server = echo_server("tcp://127.0.0.1:0");
    let live_uri = server.local_uris()[0].to_string();

    let config = ClientConfig {
        uris: vec![dead_uri, live_uri],
        ..ClientConfig::default()
    };
    let client = ClientBuilder::from_config(config).build().unwrap();
    client.wait_until_connected(CONNECT_TIMEOUT).unwrap();

    let echoed: String = client.call("echo", ("routed",)).unwrap();
    assert_eq!(echoed, "routed");
}
