//! Agent against a stand-in broker and a local upstream

use axum::{body::Bytes, routing::post, Router};
use fleet_agent::{Agent, AgentConfig};
use fleet_proto::{AgentReply, TunnelRequest};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

async fn spawn_upstream() -> SocketAddr {
    let app = Router::new().route(
        "/rpc",
        post(|body: Bytes| async move { body.to_ascii_uppercase() }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn accept_agent(listener: &TcpListener) -> WebSocketStream<tokio::net::TcpStream> {
    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("agent never connected")
        .unwrap();
    accept_async(stream).await.unwrap()
}

async fn round_trip(
    ws: &mut WebSocketStream<tokio::net::TcpStream>,
    request: &TunnelRequest,
) -> AgentReply {
    let json = String::from_utf8(request.to_json().unwrap()).unwrap();
    ws.send(Message::Text(json)).await.unwrap();

    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return AgentReply::from_json(text.as_bytes()).unwrap(),
            Message::Binary(data) => return AgentReply::from_json(&data).unwrap(),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_agent_serves_requests_and_reconnects() {
    let upstream = spawn_upstream().await;
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broker_addr = broker.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let config = AgentConfig {
        broker_url: format!("ws://{}/websocket", broker_addr),
        initial_delay: Duration::from_millis(10),
        ..AgentConfig::default()
    };
    let agent = Agent::new(config, shutdown.clone()).unwrap();
    let running = tokio::spawn(async move { agent.run().await });

    let mut ws = accept_agent(&broker).await;
    let request = TunnelRequest::new(
        "POST",
        format!("http://{}/rpc", upstream),
        "application/binary",
        "game/1.0",
        b"first",
    );
    let reply = round_trip(&mut ws, &request).await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body().unwrap(), b"FIRST");

    // Requests are answered in order on one connection
    for i in 0..3 {
        let body = format!("call-{}", i);
        let request = TunnelRequest::new(
            "POST",
            format!("http://{}/rpc", upstream),
            "",
            "",
            body.as_bytes(),
        );
        let reply = round_trip(&mut ws, &request).await;
        assert_eq!(reply.body().unwrap(), body.to_ascii_uppercase().into_bytes());
    }

    // Broker drops the agent; it dials back in
    ws.close(None).await.unwrap();
    drop(ws);

    let mut ws = accept_agent(&broker).await;
    let request = TunnelRequest::new(
        "POST",
        format!("http://{}/rpc", upstream),
        "",
        "",
        b"again",
    );
    let reply = round_trip(&mut ws, &request).await;
    assert_eq!(reply.body().unwrap(), b"AGAIN");

    shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_failed_upstream_is_answered_with_502() {
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broker_addr = broker.local_addr().unwrap();

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_addr = closed.local_addr().unwrap();
    drop(closed);

    let shutdown = CancellationToken::new();
    let config = AgentConfig {
        broker_url: format!("ws://{}/websocket", broker_addr),
        ..AgentConfig::default()
    };
    let agent = Agent::new(config, shutdown.clone()).unwrap();
    tokio::spawn(async move { agent.run().await });

    let mut ws = accept_agent(&broker).await;
    let request = TunnelRequest::new("GET", format!("http://{}/", closed_addr), "", "", b"");
    let reply = round_trip(&mut ws, &request).await;

    assert_eq!(reply.status, 502);
    assert!(reply.body().unwrap().is_empty());

    // The connection survives the failure
    let reply = round_trip(&mut ws, &request).await;
    assert_eq!(reply.status, 502);

    shutdown.cancel();
}
