//! Responder and initiator exchanging `add` requests over a Unix socket.
//!
//! Run with: `cargo run --example echo`

use std::time::Duration;

use chanmux::transport::{generate_pipe_path, PipeListener, PipeStream};
use chanmux::{ChannelConfig, EventChannel, Multiplexer, MultiplexerConfig, Value};

const REQUESTS: i64 = 5;

async fn respond(server: Multiplexer, config: ChannelConfig) -> chanmux::Result<()> {
    let first = server.recv().await?;
    let channel = config.wrap(server.channel_from(first)?);

    for _ in 0..REQUESTS {
        let request = channel.recv(None).await?;
        let sum: i64 = request.args.iter().filter_map(Value::as_i64).sum();
        channel.emit("OK", vec![Value::from(sum)]).await?;
    }

    channel.close();
    Ok(())
}

#[tokio::main]
async fn main() -> chanmux::Result<()> {
    let path = generate_pipe_path();
    let listener = PipeListener::bind(&path).await?;
    let config = ChannelConfig::default();

    let (connected, accepted) = tokio::join!(PipeStream::connect(&path), listener.accept());
    let client = Multiplexer::new(connected?.into_inner(), MultiplexerConfig::initiator());
    let server = Multiplexer::new(accepted?.into_inner(), config.multiplexer());

    let responder = tokio::spawn(respond(server, config.clone()));

    let channel = config.wrap(client.channel());
    for x in 0..REQUESTS {
        channel.emit("add", vec![Value::from(x), Value::from(x * x)]).await?;
        let reply = channel.recv(Some(Duration::from_secs(3))).await?;
        println!("add({}, {}) -> {} {:?}", x, x * x, reply.name, reply.args);
    }
    channel.close();

    match responder.await {
        Ok(result) => result,
        Err(e) => Err(chanmux::ChannelError::Protocol(format!("responder failed: {}", e))),
    }
}
