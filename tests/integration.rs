//! Integration tests for chanmux.
//!
//! Two multiplexers joined by an in-memory duplex stream (or a Unix
//! socket), exercising the full channel stack end to end. Scenarios that
//! depend on heartbeats or deadlines run on tokio's paused clock.

use std::time::Duration;

#[cfg(unix)]
use chanmux::transport::{generate_pipe_path, PipeListener, PipeStream};
use chanmux::{
    ChannelConfig, ChannelError, EventChannel, Multiplexer, MultiplexerConfig, ReliableChannel, Value,
};
use tokio::io::duplex;
use tokio::sync::oneshot;
use tokio::time::Instant;

const PERIOD: Duration = Duration::from_secs(1);

fn config() -> ChannelConfig {
    ChannelConfig {
        heartbeat_secs: PERIOD.as_secs_f64(),
        ..ChannelConfig::default()
    }
}

fn pair() -> (Multiplexer, Multiplexer) {
    let (a, b) = duplex(1024 * 1024);
    (
        Multiplexer::new(a, MultiplexerConfig::initiator()),
        Multiplexer::new(b, MultiplexerConfig::default()),
    )
}

/// Bind the next conversation announced on `server`.
async fn accept(server: &Multiplexer, config: &ChannelConfig) -> ReliableChannel {
    let first = server.recv().await.unwrap();
    config.wrap(server.channel_from(first).unwrap())
}

/// Open a reliable channel pair; the server has consumed `openthat`.
async fn open(client: &Multiplexer, server: &Multiplexer) -> (ReliableChannel, ReliableChannel) {
    let config = config();
    let client_chan = config.wrap(client.channel());
    client_chan.emit("openthat", vec![]).await.unwrap();

    let server_chan = accept(server, &config).await;
    let event = server_chan.recv(None).await.unwrap();
    assert_eq!(event.name, "openthat");

    (client_chan, server_chan)
}

fn int(value: &Value) -> i64 {
    value.as_i64().unwrap()
}

/// Envelopes on one channel arrive in order and never leak to another.
#[tokio::test]
async fn test_ordering_and_isolation() {
    let (client, server) = pair();
    let a = client.channel();
    let b = client.channel();

    for i in 0..50 {
        a.emit("a", vec![Value::from(i)]).await.unwrap();
        b.emit("b", vec![Value::from(i)]).await.unwrap();
    }

    let first = server.channel_from(server.recv().await.unwrap()).unwrap();
    let second = server.channel_from(server.recv().await.unwrap()).unwrap();
    assert_eq!(server.active_channels(), 2);

    for channel in [&first, &second] {
        let expected_name = if channel.channel_id() == a.channel_id() { "a" } else { "b" };
        for i in 0..50 {
            let event = channel.recv(Some(Duration::from_secs(5))).await.unwrap();
            assert_eq!(event.name, expected_name);
            assert_eq!(event.channel_id().as_ref(), Some(channel.channel_id()));
            assert_eq!(int(&event.args[0]), i);
        }
    }
}

/// Ordering holds through the full stack, across several credit windows.
#[tokio::test(start_paused = true)]
async fn test_ordering_through_flow_control() {
    let (client, server) = pair();
    let (client_chan, server_chan) = open(&client, &server).await;

    let producer = tokio::spawn(async move {
        for i in 0..500 {
            client_chan.emit("n", vec![Value::from(i)]).await.unwrap();
        }
        client_chan
    });

    for i in 0..500 {
        let event = server_chan.recv(None).await.unwrap();
        assert_eq!(int(&event.args[0]), i);
    }
    let _client_chan = producer.await.unwrap();
}

/// Receiver closes its channel: the blocked peer sees a lost remote.
#[tokio::test(start_paused = true)]
async fn test_close_server_channel() {
    let (client, server) = pair();
    let (client_chan, server_chan) = open(&client, &server).await;

    server_chan.close();
    let closed_at = Instant::now();

    let err = client_chan.recv(None).await.unwrap_err();
    assert!(err.is_lost_remote(), "unexpected error: {}", err);
    assert!(closed_at.elapsed() <= PERIOD * 2);
}

/// Receiver closes its channel and its connection.
#[tokio::test(start_paused = true)]
async fn test_close_server_connection() {
    let (client, server) = pair();
    let (client_chan, server_chan) = open(&client, &server).await;

    server_chan.close();
    server.close();
    let closed_at = Instant::now();

    let err = client_chan.recv(None).await.unwrap_err();
    assert!(err.is_lost_remote());
    assert!(closed_at.elapsed() < PERIOD);
}

/// Sender closes its channel: the still-open receiver sees a lost remote.
#[tokio::test(start_paused = true)]
async fn test_close_client_channel() {
    let (client, server) = pair();
    let (client_chan, server_chan) = open(&client, &server).await;

    client_chan.close();
    drop(client_chan);
    let closed_at = Instant::now();

    let err = server_chan.recv(None).await.unwrap_err();
    assert!(err.is_lost_remote());
    assert!(closed_at.elapsed() <= PERIOD * 2);
}

/// Heartbeats keep an idle channel usable well past the liveness window.
#[tokio::test(start_paused = true)]
async fn test_heartbeat_keeps_idle_channel_alive() {
    let (client, server) = pair();
    let (client_chan, server_chan) = open(&client, &server).await;

    tokio::time::sleep(PERIOD * 3).await;
    // The client spent its bootstrap credit; the server's next recv grants more.
    let (sent, received) = tokio::join!(
        client_chan.emit("ping", vec![]),
        server_chan.recv(Some(PERIOD))
    );
    sent.unwrap();
    assert_eq!(received.unwrap().name, "ping");

    tokio::time::sleep(PERIOD * 30).await;
    server_chan.emit("pong", vec![]).await.unwrap();
    assert_eq!(client_chan.recv(Some(PERIOD)).await.unwrap().name, "pong");

    server_chan.close();
    let closed_at = Instant::now();
    let err = client_chan.recv(None).await.unwrap_err();
    assert!(err.is_lost_remote());
    assert!(closed_at.elapsed() <= PERIOD * 2);
}

/// Twenty `add` requests answered with their sums, in order.
#[tokio::test(start_paused = true)]
async fn test_request_response_round_trip() {
    let (client, server) = pair();
    let server_config = config();

    let server_task = tokio::spawn(async move {
        let server_chan = accept(&server, &server_config).await;
        for _ in 0..20 {
            let event = server_chan.recv(None).await.unwrap();
            assert_eq!(event.name, "add");
            let sum = int(&event.args[0]) + int(&event.args[1]);
            server_chan.emit("OK", vec![Value::from(sum)]).await.unwrap();
        }
        server_chan.close();
        server
    });

    let client_chan = config().wrap(client.channel());
    for x in 0..20i64 {
        client_chan
            .emit("add", vec![Value::from(x), Value::from(x * x)])
            .await
            .unwrap();
        let event = client_chan.recv(None).await.unwrap();
        assert_eq!(event.name, "OK");
        assert_eq!(event.args, vec![Value::from(x + x * x)]);
    }

    let _server = server_task.await.unwrap();
}

/// A slow responder makes the requester time out; once the requester is
/// gone the responder's late reply fails with a lost remote.
#[tokio::test(start_paused = true)]
async fn test_client_timeout_then_server_lost() {
    let (client, server) = pair();
    let server_config = config();

    let server_task = tokio::spawn(async move {
        let server_chan = accept(&server, &server_config).await;
        let event = server_chan.recv(None).await.unwrap();
        assert_eq!(event.name, "sleep");

        tokio::time::sleep(Duration::from_secs(10)).await;
        let result = server_chan.emit("OK", vec![]).await;
        (server, result)
    });

    let client_chan = config().wrap(client.channel());
    client_chan
        .emit("sleep", vec![Value::from(10)])
        .await
        .unwrap();

    let started = Instant::now();
    let err = client_chan.recv(Some(Duration::from_secs(3))).await.unwrap_err();
    assert!(err.is_timeout());
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(3) && waited < Duration::from_secs(3) + PERIOD);
    client_chan.close();

    let (_server, result) = server_task.await.unwrap();
    let err = result.unwrap_err();
    assert!(err.is_lost_remote(), "unexpected error: {}", err);
}

/// A timed-out recv leaves the channel usable.
#[tokio::test(start_paused = true)]
async fn test_timeout_is_not_sticky() {
    let (client, server) = pair();
    let (client_chan, server_chan) = open(&client, &server).await;

    let err = client_chan.recv(Some(Duration::from_secs(3))).await.unwrap_err();
    assert!(matches!(err, ChannelError::Timeout(_)));

    server_chan.emit("late", vec![]).await.unwrap();
    assert_eq!(client_chan.recv(Some(Duration::from_secs(3))).await.unwrap().name, "late");
}

/// Bootstrap credit of 1, then a window of exactly 100.
#[tokio::test]
async fn test_congestion_control_server_pushing() {
    let (client, server) = pair();
    let config = ChannelConfig::default();

    let client_chan = config.wrap(client.channel());
    client_chan.emit("coucou", vec![]).await.unwrap();
    let server_chan = accept(&server, &config).await;
    assert_eq!(server_chan.recv(None).await.unwrap().name, "coucou");

    let (congested_tx, congested_rx) = oneshot::channel();
    let (resume_tx, resume_rx) = oneshot::channel();

    let receiver = tokio::spawn(async move {
        let first = client_chan.recv(None).await.unwrap();
        assert_eq!(int(&first.args[0]), 0);

        // Grants the full window, then holds it open without reading.
        congested_rx.await.unwrap();
        let second = client_chan.recv(None).await.unwrap();
        assert_eq!(int(&second.args[0]), 1);
        resume_rx.await.unwrap();

        for x in 2..200 {
            let event = client_chan.recv(None).await.unwrap();
            assert_eq!(event.name, "coucou");
            assert_eq!(int(&event.args[0]), x);
        }
        client_chan
    });

    // Bootstrap window: exactly one send.
    assert!(server_chan.try_emit("coucou", vec![Value::from(0)]).await.unwrap());
    assert!(!server_chan.try_emit("coucou", vec![Value::from(1)]).await.unwrap());
    congested_tx.send(()).unwrap();

    // Waits for the receiver's first grant.
    server_chan.emit("coucou", vec![Value::from(1)]).await.unwrap();

    // Steady-state window: 100 including the blocking send above.
    for x in 2..=100 {
        assert!(server_chan.try_emit("coucou", vec![Value::from(x)]).await.unwrap());
    }
    assert!(!server_chan.try_emit("coucou", vec![Value::from(101)]).await.unwrap());
    resume_tx.send(()).unwrap();

    for x in 101..200 {
        server_chan.emit("coucou", vec![Value::from(x)]).await.unwrap();
    }

    let _client_chan = receiver.await.unwrap();
}

/// The full stack over a Unix-domain socket.
#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_round_trip() {
    let path = generate_pipe_path();
    let listener = PipeListener::bind(&path).await.unwrap();

    let (connected, accepted) = tokio::join!(PipeStream::connect(&path), listener.accept());
    let client = Multiplexer::new(connected.unwrap().into_inner(), MultiplexerConfig::initiator());
    let server = Multiplexer::new(accepted.unwrap().into_inner(), MultiplexerConfig::default());

    let config = ChannelConfig::default();
    let client_chan = config.wrap(client.channel());
    client_chan
        .emit("add", vec![Value::from(2), Value::from(3)])
        .await
        .unwrap();

    let server_chan = accept(&server, &config).await;
    let request = server_chan.recv(Some(Duration::from_secs(5))).await.unwrap();
    let sum = int(&request.args[0]) + int(&request.args[1]);
    server_chan.emit("OK", vec![Value::from(sum)]).await.unwrap();

    let reply = client_chan.recv(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(reply.args, vec![Value::from(5)]);
}

/// Closing the multiplexer unblocks every channel it owns.
#[tokio::test(start_paused = true)]
async fn test_multiplexer_close_fails_all_channels() {
    let (client, server) = pair();
    let (first, _first_remote) = open(&client, &server).await;
    let (second, _second_remote) = open(&client, &server).await;

    client.close();

    assert!(first.recv(None).await.unwrap_err().is_lost_remote());
    assert!(second.recv(None).await.unwrap_err().is_lost_remote());
    client.closed().await;
}
