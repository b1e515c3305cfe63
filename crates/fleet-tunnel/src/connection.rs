//! One connected tunnel agent
//!
//! The agent answers requests strictly one at a time, so a connection has a
//! single response slot. Forwarders queue on a per-connection lock, install a
//! oneshot in the slot, send their frame and wait for the reader loop to fill
//! the slot with the next frame from the agent.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::TunnelError;

/// Outbound frames buffered per agent
const OUTBOUND_CAPACITY: usize = 64;

pub struct AgentConnection {
    id: u64,
    outbound: mpsc::Sender<Vec<u8>>,
    response_slot: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
    request_lock: Mutex<()>,
    cancel: CancellationToken,
    connected_at: Instant,
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AgentConnection {
    /// Create a connection and the receiving end of its outbound queue
    pub fn new(id: u64) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let conn = Arc::new(Self {
            id,
            outbound,
            response_slot: Mutex::new(None),
            request_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            connected_at: Instant::now(),
        });
        (conn, outbound_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue a frame for the agent without waiting for an answer
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Disconnected(self.id));
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TunnelError::Disconnected(self.id))
    }

    /// Send one request frame and wait for the agent's answer.
    ///
    /// Requests on the same connection are served one after the other; time
    /// spent queueing counts against `timeout`. Once the frame is sent, a
    /// timeout closes the connection: replies carry no request id, so a late
    /// answer could otherwise reach the next caller.
    pub async fn forward(&self, frame: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, TunnelError> {
        let deadline = Instant::now() + timeout;

        let _turn = timeout_at(deadline, self.request_lock.lock())
            .await
            .map_err(|_| TunnelError::Timeout(self.id, timeout))?;

        let response = self.expect_response().await?;

        if let Err(e) = self.send(frame).await {
            self.response_slot.lock().await.take();
            return Err(e);
        }

        self.await_response(response, deadline, timeout).await
    }

    async fn expect_response(&self) -> Result<oneshot::Receiver<Vec<u8>>, TunnelError> {
        let (tx, rx) = oneshot::channel();
        *self.response_slot.lock().await = Some(tx);

        // close() cancels before it clears the slot
        if self.is_closed() {
            self.response_slot.lock().await.take();
            return Err(TunnelError::Disconnected(self.id));
        }
        Ok(rx)
    }

    async fn await_response(
        &self,
        response: oneshot::Receiver<Vec<u8>>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Vec<u8>, TunnelError> {
        match timeout_at(deadline, response).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(TunnelError::Disconnected(self.id)),
            Err(_) => {
                warn!(agent_id = self.id, ?timeout, "Agent did not answer in time, closing");
                self.close().await;
                Err(TunnelError::Timeout(self.id, timeout))
            }
        }
    }

    /// Hand a frame from the agent to the waiting request, if any
    pub async fn deliver(&self, payload: Vec<u8>) {
        match self.response_slot.lock().await.take() {
            Some(tx) => {
                if tx.send(payload).is_err() {
                    debug!(agent_id = self.id, "Requester went away before the answer");
                }
            }
            None => {
                warn!(
                    agent_id = self.id,
                    len = payload.len(),
                    "Dropping unsolicited frame from agent"
                );
            }
        }
    }

    /// Stop both loops and fail the waiting request
    pub async fn close(&self) {
        self.cancel.cancel();
        self.response_slot.lock().await.take();
    }

    /// Drive the agent's WebSocket until it closes or stops answering pings
    pub async fn run(
        self: &Arc<Self>,
        socket: WebSocket,
        outbound: mpsc::Receiver<Vec<u8>>,
        pong_wait: Duration,
    ) {
        let (sink, mut stream) = socket.split();
        let ping_period = pong_wait * 7 / 10;

        let writer = tokio::spawn(write_loop(
            sink,
            outbound,
            self.cancel.clone(),
            ping_period,
            self.id,
        ));

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = tokio::time::timeout(pong_wait, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    warn!(agent_id = self.id, ?pong_wait, "Agent went silent, closing");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(agent_id = self.id, error = %e, "Agent read error");
                    break;
                }
                Ok(Some(Ok(Message::Text(text)))) => {
                    self.deliver(text.as_str().as_bytes().to_vec()).await;
                }
                Ok(Some(Ok(Message::Binary(data)))) => {
                    self.deliver(data.to_vec()).await;
                }
                Ok(Some(Ok(Message::Close(_)))) => break,
                Ok(Some(Ok(_))) => {
                    trace!(agent_id = self.id, "Agent heartbeat");
                }
            }
        }

        self.close().await;
        if let Err(e) = writer.await {
            warn!(agent_id = self.id, error = %e, "Agent writer task failed");
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    ping_period: Duration,
    agent_id: u64,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + ping_period, ping_period);

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => match String::from_utf8(frame) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => Message::Binary(e.into_bytes().into()),
                },
                None => break,
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        if let Err(e) = sink.send(message).await {
            debug!(agent_id, error = %e, "Agent write failed");
            break;
        }
    }

    cancel.cancel();
    let _ = sink.close().await;
    debug!(agent_id, "Agent writer stopped");
}
