//! End-to-end scenarios over localhost UDP: handshake, data round trips,
//! epoch rotation, connect timeout, and close semantics.
//!
//! Run with: cargo test --test roundtrip_test

use std::time::{Duration, Instant};
use sudp::{connect, listen, ClientConn, ClientOpts, LocalAddr, RemoteAddr, ServerConn, SudpError};

const SERVER_VADDR: u16 = 0;
const CLIENT_VADDR: u16 = 1001;
const HMAC_KEY: &[u8] = b"password";

/// Start a server for one client and connect that client to it.
async fn connected_pair(opts: ClientOpts) -> (ServerConn, ClientConn) {
    let server_key = sudp::generate_key();
    let client_key = sudp::generate_key();

    let server_local = LocalAddr {
        virtual_address: SERVER_VADDR,
        private_key: Some(server_key.clone()),
        network_address: Some("127.0.0.1:0".parse().unwrap()),
    };
    let known_clients = vec![RemoteAddr {
        virtual_address: CLIENT_VADDR,
        public_key: Some((*client_key.verifying_key()).clone()),
        hmac_key: Some(HMAC_KEY.to_vec()),
        network_address: None,
    }];
    let server = listen(&server_local, &known_clients).await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let client_local = LocalAddr {
        virtual_address: CLIENT_VADDR,
        private_key: Some(client_key),
        network_address: Some("127.0.0.1:0".parse().unwrap()),
    };
    let remote = RemoteAddr {
        virtual_address: SERVER_VADDR,
        public_key: Some((*server_key.verifying_key()).clone()),
        hmac_key: Some(HMAC_KEY.to_vec()),
        network_address: Some(server_addr),
    };
    let client = connect(&client_local, &remote, opts).await.unwrap();

    (server, client)
}

#[tokio::test]
async fn handshake_and_data_roundtrip() {
    let (server, client) = connected_pair(ClientOpts::default()).await;

    client.send(b"hello").await.unwrap();
    let (payload, src) = server.recv_from().await.unwrap();
    assert_eq!(payload, b"hello");
    assert_eq!(src, CLIENT_VADDR);

    server.send_to(b"world", CLIENT_VADDR).await.unwrap();
    assert_eq!(client.recv().await.unwrap(), b"world");

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn send_to_unknown_peer_is_not_ready() {
    let (server, client) = connected_pair(ClientOpts::default()).await;

    let err = server.send_to(b"x", 4242).await.unwrap_err();
    assert!(matches!(err, SudpError::NotReady));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn epoch_rotation_survives_traffic() {
    let opts = ClientOpts {
        epoch_change: Duration::from_secs(1),
        ..ClientOpts::default()
    };
    let (server, client) = connected_pair(opts).await;

    client.send(b"before rotation").await.unwrap();
    assert_eq!(server.recv_from().await.unwrap().0, b"before rotation");

    // let the epoch-change timer fire and the rotation handshake settle
    tokio::time::sleep(Duration::from_millis(1600)).await;

    client.send(b"after rotation").await.unwrap();
    assert_eq!(server.recv_from().await.unwrap().0, b"after rotation");
    server.send_to(b"still here", CLIENT_VADDR).await.unwrap();
    assert_eq!(client.recv().await.unwrap(), b"still here");

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn connect_times_out_against_silent_server() {
    // a bound socket that never answers
    let sink = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sink_addr = sink.local_addr().unwrap();

    let client_key = sudp::generate_key();
    let server_key = sudp::generate_key();
    let local = LocalAddr {
        virtual_address: CLIENT_VADDR,
        private_key: Some(client_key),
        network_address: None,
    };
    let remote = RemoteAddr {
        virtual_address: SERVER_VADDR,
        public_key: Some((*server_key.verifying_key()).clone()),
        hmac_key: Some(HMAC_KEY.to_vec()),
        network_address: Some(sink_addr),
    };
    let opts = ClientOpts {
        tries: 2,
        time_retry: Duration::from_millis(300),
        epoch_change: Duration::from_secs(30),
    };

    let started = Instant::now();
    let err = connect(&local, &remote, opts).await.unwrap_err();
    assert!(matches!(err, SudpError::Timeout));
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn connect_fails_without_keys() {
    let local = LocalAddr {
        virtual_address: CLIENT_VADDR,
        private_key: None,
        network_address: None,
    };
    let remote = RemoteAddr {
        virtual_address: SERVER_VADDR,
        public_key: None,
        hmac_key: None,
        network_address: Some("127.0.0.1:9".parse().unwrap()),
    };
    let err = connect(&local, &remote, ClientOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SudpError::ConfigMissing(_)));
}

#[tokio::test]
async fn listen_fails_without_bind_address() {
    let local = LocalAddr {
        virtual_address: SERVER_VADDR,
        private_key: Some(sudp::generate_key()),
        network_address: None,
    };
    let err = listen(&local, &[]).await.unwrap_err();
    assert!(matches!(err, SudpError::ConfigMissing(_)));
}

#[tokio::test]
async fn close_is_idempotent_and_fails_operations_fast() {
    let (server, client) = connected_pair(ClientOpts::default()).await;

    client.close().await.unwrap();
    client.close().await.unwrap();
    assert!(matches!(client.send(b"x").await, Err(SudpError::Closed)));
    assert!(matches!(client.recv().await, Err(SudpError::Closed)));

    server.close().await.unwrap();
    server.close().await.unwrap();
    assert!(matches!(
        server.send_to(b"x", CLIENT_VADDR).await,
        Err(SudpError::Closed)
    ));
    assert!(matches!(server.recv_from().await, Err(SudpError::Closed)));
}

#[tokio::test]
async fn silent_peer_expires_and_sends_fail() {
    let (server, client) = connected_pair(ClientOpts::default()).await;

    client.send(b"hello").await.unwrap();
    assert_eq!(server.recv_from().await.unwrap().0, b"hello");

    // closing the client stops its keep-alives; the server's liveness
    // sweep resets the peer after the 5 s TTL
    client.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(6500)).await;

    let err = server.send_to(b"anyone there", CLIENT_VADDR).await.unwrap_err();
    assert!(matches!(err, SudpError::NotReady));

    server.close().await.unwrap();
}
