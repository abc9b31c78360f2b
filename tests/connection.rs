//! Integration tests driving the public API over real pipe and TCP
//! endpoints.
//!
//! Callbacks are observed through std channels with generous timeouts; no
//! test depends on wall-clock sleeps for correctness.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use bytes::Bytes;

use pipelink::{
    new_client_connection, new_multi_server_connection, new_server_connection,
    new_tcp_client_connection, new_tcp_server_connection, InvokeResult, LogLevel, ReplySender,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Unique per-test pipe endpoint name.
fn unique_endpoint(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!(
        "pipelink-test-{}-{}-{}-{:x}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed),
        nanos
    )
}

/// Deterministic pseudo-random bytes (no RNG dependency needed).
fn pseudo_random_bytes(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        out.push((seed >> 33) as u8);
    }
    out
}

#[test]
fn immediate_echo_roundtrip() {
    let endpoint = unique_endpoint("echo");

    let server = new_server_connection(&endpoint, false);
    server.on_invoked_immediate(|body| body);
    server.connect();

    let client = new_client_connection(&endpoint);
    client.connect();

    let (tx, rx) = mpsc::channel();
    client.invoke_with_callback(Bytes::from_static(b"ping"), move |result, body| {
        tx.send((result, body)).unwrap();
    });

    let (result, body) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(result, InvokeResult::Good);
    assert_eq!(&body[..], b"ping");
}

#[test]
fn short_and_long_messages_arrive_in_order() {
    let endpoint = unique_endpoint("interleave");

    let short = pseudo_random_bytes(1_000, 7);
    let long = pseudo_random_bytes(50_000, 11);

    let server = new_server_connection(&endpoint, false);
    let (connected_tx, connected_rx) = mpsc::channel();
    server.on_connect(move || {
        let _ = connected_tx.send(());
    });
    server.connect();

    let client = new_client_connection(&endpoint);
    let (received_tx, received_rx) = mpsc::channel();
    client.on_received(move |body| {
        received_tx.send(body).unwrap();
    });
    client.connect();

    connected_rx.recv_timeout(TIMEOUT).unwrap();
    server.send(Bytes::from(short.clone()));
    server.send(Bytes::from(long.clone()));

    let first = received_rx.recv_timeout(TIMEOUT).unwrap();
    let second = received_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(&first[..], &short[..]);
    assert_eq!(&second[..], &long[..]);
}

#[test]
fn client_reconnects_after_server_restart() {
    let endpoint = unique_endpoint("reconnect");

    let server = new_server_connection(&endpoint, false);
    server.connect();

    let client = new_client_connection(&endpoint);
    let (connect_tx, connect_rx) = mpsc::channel();
    let (disconnect_tx, disconnect_rx) = mpsc::channel();
    client.on_connect(move || {
        let _ = connect_tx.send(());
    });
    client.on_disconnect(move || {
        let _ = disconnect_tx.send(());
    });
    client.connect();

    connect_rx.recv_timeout(TIMEOUT).unwrap();

    drop(server);
    disconnect_rx.recv_timeout(TIMEOUT).unwrap();

    // Rebuild the endpoint; the client's redial loop should find it.
    let server = new_server_connection(&endpoint, false);
    server.connect();

    connect_rx.recv_timeout(TIMEOUT).unwrap();
    drop(server);
}

#[test]
fn pending_invoke_resolves_on_remote_disconnect() {
    let endpoint = unique_endpoint("cancel");

    let server = new_server_connection(&endpoint, false);
    let (connected_tx, connected_rx) = mpsc::channel();
    server.on_connect(move || {
        let _ = connected_tx.send(());
    });
    server.connect();

    let client = new_client_connection(&endpoint);
    let (reply_tx, reply_rx) = mpsc::channel::<ReplySender>();
    client.on_invoked_reply(move |_body, reply| {
        reply_tx.send(reply).unwrap();
    });
    client.connect();

    connected_rx.recv_timeout(TIMEOUT).unwrap();

    let (result_tx, result_rx) = mpsc::channel();
    server.invoke_with_callback(Bytes::from_static(b"x"), move |result, body| {
        result_tx.send((result, body)).unwrap();
    });

    // The client stashes the reply sender instead of answering.
    let stashed = reply_rx.recv_timeout(TIMEOUT).unwrap();

    drop(client);

    let (result, body) = result_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(result, InvokeResult::RemoteDisconnect);
    assert!(body.is_empty());

    // Replying into the destroyed engine must be a silent no-op.
    stashed.send(Bytes::from_static(b"late"));
}

#[test]
fn multi_server_broadcast_reaches_all_peers() {
    let endpoint = unique_endpoint("broadcast");

    let server = new_multi_server_connection(&endpoint, false);
    let (connected_tx, connected_rx) = mpsc::channel();
    server.on_connect(move |id| {
        let _ = connected_tx.send(id);
    });
    server.connect();

    let mut clients = Vec::new();
    let (received_tx, received_rx) = mpsc::channel();
    for _ in 0..3 {
        let client = new_client_connection(&endpoint);
        let tx = received_tx.clone();
        client.on_received(move |body| {
            tx.send(body).unwrap();
        });
        client.connect();
        clients.push(client);
    }

    let mut ids = std::collections::HashSet::new();
    for _ in 0..3 {
        ids.insert(connected_rx.recv_timeout(TIMEOUT).unwrap());
    }
    assert_eq!(ids.len(), 3);
    assert_eq!(server.active_connections(), 3);

    server.broadcast(Bytes::from_static(b"hi"));

    for _ in 0..3 {
        let body = received_rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(&body[..], b"hi");
    }
}

#[test]
fn invoke_before_connect_is_flushed_on_connect() {
    let endpoint = unique_endpoint("preconnect");

    let server = new_server_connection(&endpoint, false);
    server.on_invoked_immediate(|body| body);
    server.connect();

    let client = new_client_connection(&endpoint);
    let (tx, rx) = mpsc::channel();
    client.invoke_with_callback(Bytes::from_static(b"q"), move |result, body| {
        tx.send((result, body)).unwrap();
    });

    client.connect();

    let (result, body) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(result, InvokeResult::Good);
    assert_eq!(&body[..], b"q");
}

#[test]
fn invoke_without_callback_routes_through_on_result() {
    let endpoint = unique_endpoint("onresult");

    let server = new_server_connection(&endpoint, false);
    server.on_invoked_immediate(|body| body);
    server.connect();

    let client = new_client_connection(&endpoint);
    let (tx, rx) = mpsc::channel();
    client.on_result(move |request_id, body| {
        tx.send((request_id, body)).unwrap();
    });
    client.connect();

    let issued = client.invoke(Bytes::from_static(b"collect"));
    assert_ne!(issued, 0);

    let (request_id, body) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(request_id, issued);
    assert_eq!(&body[..], b"collect");
}

#[test]
fn promise_id_handler_with_send_result() {
    let endpoint = unique_endpoint("promise");

    let server = new_server_connection(&endpoint, false);
    let (request_tx, request_rx) = mpsc::channel();
    server.on_invoked(move |request_id, body| {
        request_tx.send((request_id, body)).unwrap();
    });
    server.connect();

    let client = new_client_connection(&endpoint);
    let (result_tx, result_rx) = mpsc::channel();
    client.invoke_with_callback(Bytes::from_static(b"question"), move |result, body| {
        result_tx.send((result, body)).unwrap();
    });
    client.connect();

    // The server answers out-of-band, from this thread.
    let (request_id, body) = request_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(&body[..], b"question");
    server.send_result(request_id, Bytes::from_static(b"answer"));

    let (result, body) = result_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(result, InvokeResult::Good);
    assert_eq!(&body[..], b"answer");
}

#[test]
fn reply_variant_answers_from_foreign_thread() {
    let endpoint = unique_endpoint("reply");

    let server = new_server_connection(&endpoint, false);
    server.on_invoked_reply(|body, reply| {
        // Answer from a thread that has nothing to do with the connection.
        std::thread::spawn(move || {
            let mut answer = body.to_vec();
            answer.reverse();
            reply.send(Bytes::from(answer));
        });
    });
    server.connect();

    let client = new_client_connection(&endpoint);
    let (tx, rx) = mpsc::channel();
    client.invoke_with_callback(Bytes::from_static(b"abc"), move |result, body| {
        tx.send((result, body)).unwrap();
    });
    client.connect();

    let (result, body) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(result, InvokeResult::Good);
    assert_eq!(&body[..], b"cba");
}

#[test]
fn local_disconnect_resolves_pending_invokes() {
    let endpoint = unique_endpoint("localdisc");

    let server = new_server_connection(&endpoint, false);
    // No invoked handler: requests pile up unanswered.
    let (connected_tx, connected_rx) = mpsc::channel();
    server.on_connect(move || {
        let _ = connected_tx.send(());
    });
    server.connect();

    let client = new_client_connection(&endpoint);
    let (tx, rx) = mpsc::channel();
    client.invoke_with_callback(Bytes::from_static(b"never answered"), move |result, body| {
        tx.send((result, body)).unwrap();
    });
    client.connect();

    connected_rx.recv_timeout(TIMEOUT).unwrap();
    client.disconnect();

    let (result, body) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(result, InvokeResult::LocalDisconnect);
    assert!(body.is_empty());
}

#[test]
fn invoke_after_disconnect_fails_fast() {
    let endpoint = unique_endpoint("afterdisc");

    let client = new_client_connection(&endpoint);
    client.connect();
    client.disconnect();

    let (tx, rx) = mpsc::channel();
    client.invoke_with_callback(Bytes::from_static(b"too late"), move |result, _| {
        tx.send(result).unwrap();
    });

    assert_eq!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        InvokeResult::LocalDisconnect
    );
}

#[test]
fn latest_only_server_switches_to_newest_client() {
    let endpoint = unique_endpoint("latest");

    let server = new_server_connection(&endpoint, false);
    let (connected_tx, connected_rx) = mpsc::channel();
    server.on_connect(move || {
        let _ = connected_tx.send(());
    });
    server.connect();

    let first = new_client_connection(&endpoint);
    let (first_disc_tx, first_disc_rx) = mpsc::channel();
    first.on_disconnect(move || {
        let _ = first_disc_tx.send(());
    });
    first.connect();
    connected_rx.recv_timeout(TIMEOUT).unwrap();

    let second = new_client_connection(&endpoint);
    let (second_rx_tx, second_rx_rx) = mpsc::channel();
    second.on_received(move |body| {
        second_rx_tx.send(body).unwrap();
    });
    second.connect();
    connected_rx.recv_timeout(TIMEOUT).unwrap();

    // The first client was evicted by the accept policy. Drop it before it
    // redials, or the two clients keep evicting each other.
    first_disc_rx.recv_timeout(TIMEOUT).unwrap();
    drop(first);

    // The second client may itself have been evicted by the first's redial
    // attempts in the meantime; it reconnects on its own, so just resend
    // until the message lands.
    let deadline = std::time::Instant::now() + TIMEOUT;
    let body = loop {
        server.send(Bytes::from_static(b"to the newest"));
        match second_rx_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(body) => break body,
            Err(_) if std::time::Instant::now() < deadline => continue,
            Err(e) => panic!("second client never received the message: {e}"),
        }
    };
    assert_eq!(&body[..], b"to the newest");
}

#[test]
fn tcp_echo_roundtrip() {
    // Find a free port, then hand it to the real endpoints.
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let endpoint = format!("127.0.0.1:{port}");

    let server = new_tcp_server_connection(&endpoint);
    server.on_invoked_immediate(|body| body);
    server.connect();

    let client = new_tcp_client_connection(&endpoint);
    let (tx, rx) = mpsc::channel();
    client.invoke_with_callback(Bytes::from_static(b"over tcp"), move |result, body| {
        tx.send((result, body)).unwrap();
    });
    client.connect();

    let (result, body) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(result, InvokeResult::Good);
    assert_eq!(&body[..], b"over tcp");
}

#[test]
fn repeated_connect_disconnect_cycles() {
    let endpoint = unique_endpoint("cycles");

    let server = new_server_connection(&endpoint, false);
    server.on_invoked_immediate(|body| body);
    server.connect();

    let client = new_client_connection(&endpoint);
    for round in 0..5u8 {
        client.connect();

        let (tx, rx) = mpsc::channel();
        client.invoke_with_callback(Bytes::from(vec![round]), move |result, body| {
            tx.send((result, body)).unwrap();
        });

        let (result, body) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(result, InvokeResult::Good);
        assert_eq!(&body[..], &[round]);

        client.disconnect();
    }
}

#[test]
fn connect_is_idempotent_while_connected() {
    let endpoint = unique_endpoint("idempotent");

    let server = new_server_connection(&endpoint, false);
    server.on_invoked_immediate(|body| body);
    server.connect();
    // A second connect on a live server must not disturb the first.
    server.connect();

    let client = new_client_connection(&endpoint);
    client.connect();
    client.connect();

    let (tx, rx) = mpsc::channel();
    client.invoke_with_callback(Bytes::from_static(b"still one"), move |result, body| {
        tx.send((result, body)).unwrap();
    });

    let (result, body) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(result, InvokeResult::Good);
    assert_eq!(&body[..], b"still one");
}

#[test]
fn log_events_reach_the_sink() {
    let endpoint = unique_endpoint("logs");

    let client = new_client_connection(&endpoint);
    let (tx, rx) = mpsc::channel();
    client.on_log(
        move |level, message, category| {
            let _ = tx.send((level, message, category));
        },
        LogLevel::Debug,
    );
    client.connect();

    // `connect` itself logs at info with the connection category.
    let mut saw_connect = false;
    while let Ok((level, message, category)) = rx.recv_timeout(TIMEOUT) {
        if message.contains("connect") {
            assert_eq!(level, LogLevel::Info);
            assert_eq!(category, "connection");
            saw_connect = true;
            break;
        }
    }
    assert!(saw_connect);
}

#[test]
fn bind_failure_surfaces_on_error() {
    // Two servers on the same endpoint: the second bind must fail.
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let endpoint = format!("127.0.0.1:{port}");

    let first = new_tcp_server_connection(&endpoint);
    first.connect();

    let second = new_tcp_server_connection(&endpoint);
    let (tx, rx) = mpsc::channel();
    second.on_error(move || {
        let _ = tx.send(());
    });
    second.connect();

    rx.recv_timeout(TIMEOUT).unwrap();
}

#[test]
fn server_invoke_to_unknown_peer_resolves_remote_disconnect() {
    let endpoint = unique_endpoint("nopeer");

    let server = new_multi_server_connection(&endpoint, false);
    server.connect();

    let (tx, rx) = mpsc::channel();
    server.invoke_with_callback(42, Bytes::from_static(b"anyone there?"), move |result, _| {
        tx.send(result).unwrap();
    });

    assert_eq!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        InvokeResult::RemoteDisconnect
    );
}
