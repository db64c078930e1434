//! Threaded Facade Integration Tests
//!
//! Drives `ThreadedStreamManager` from a plain thread while a local server
//! runs on its own runtime.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;

use serde_json::json;

use common::{MockServer, WAIT, config, next_json, send_json};
use orderly_stream_client::infrastructure::orderly::threaded::ClientFactory;
use orderly_stream_client::{Channel, StreamClient, ThreadedStreamManager, WsConnector};

fn factory(url: String) -> ClientFactory {
    Arc::new(move |channel| {
        Ok(StreamClient::new_public(
            config(channel, &url, 5),
            Arc::new(WsConnector::new()),
        ))
    })
}

#[test]
fn listener_receives_data_and_pings() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut server = runtime.block_on(MockServer::start());
    let manager = ThreadedStreamManager::with_factory(factory(server.url())).unwrap();

    let (tx, rx) = std_mpsc::channel();
    let pings = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pings);
    manager
        .start_socket(
            "bbos",
            "bbos",
            move |message| {
                let _ = tx.send(message);
            },
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            false,
        )
        .unwrap();

    runtime.block_on(async {
        let mut ws = server.accept().await;
        assert_eq!(
            next_json(&mut ws).await,
            json!({"id": "WS_PUBLIC", "event": "subscribe", "topic": "bbos"})
        );
        send_json(&mut ws, &json!({"event": "subscribe", "success": true})).await;
        send_json(&mut ws, &json!({"event": "ping", "ts": 1})).await;
        assert_eq!(next_json(&mut ws).await, json!({"event": "pong"}));
        send_json(&mut ws, &json!({"topic": "bbos", "data": {"price": 1}})).await;

        // Keep the socket open until the callback has run.
        let message = tokio::task::spawn_blocking(move || rx.recv_timeout(WAIT))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, json!({"price": 1}));
    });

    let deadline = std::time::Instant::now() + WAIT;
    while pings.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    assert_eq!(pings.load(Ordering::SeqCst), 1);

    manager.stop();
    manager.join();
}

#[test]
fn operations_before_connect_are_not_dropped() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut server = runtime.block_on(MockServer::start());
    let manager = ThreadedStreamManager::with_factory(factory(server.url())).unwrap();

    // Both calls land before the socket is accepted.
    manager.subscribe("bbos", false).unwrap();
    manager.subscribe("trades", false).unwrap();

    runtime.block_on(async {
        let mut ws = server.accept().await;
        let mut topics = vec![
            next_json(&mut ws).await["topic"].as_str().unwrap().to_owned(),
            next_json(&mut ws).await["topic"].as_str().unwrap().to_owned(),
        ];
        topics.sort();
        assert_eq!(topics, vec!["bbos", "trades"]);
    });

    manager.stop();
    manager.join();
    assert!(manager.subscribe("bbos", false).is_err());
}

#[test]
fn private_socket_without_keys_is_rejected() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let server = runtime.block_on(MockServer::start());
    let url = server.url();
    let factory: ClientFactory = Arc::new(move |channel| match channel {
        Channel::Public => Ok(StreamClient::new_public(
            config(channel, &url, 5),
            Arc::new(WsConnector::new()),
        )),
        Channel::Private => Err(orderly_stream_client::AuthError::EmptyValue("orderly key").into()),
    });
    let manager = ThreadedStreamManager::with_factory(factory).unwrap();

    let result = manager.start_socket("position", "position", |_| {}, None, true);
    assert!(matches!(
        result,
        Err(orderly_stream_client::StreamError::Signing(_))
    ));

    manager.stop();
    manager.join();
}
