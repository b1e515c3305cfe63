//! Broker connection with automatic reconnection

use fleet_proto::{AgentReply, TunnelRequest};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::AgentError;
use crate::executor::{RequestExecutor, UPSTREAM_FAILED_STATUS};

type BrokerStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Broker agent endpoint, e.g. `ws://127.0.0.1:8081/websocket`
    pub broker_url: String,
    /// Consecutive failed attempts before giving up (0 = infinite)
    pub max_reconnect_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker_url: "ws://127.0.0.1:8081/websocket".to_string(),
            max_reconnect_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

pub struct Agent {
    config: AgentConfig,
    executor: RequestExecutor,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(config: AgentConfig, shutdown: CancellationToken) -> Result<Self, AgentError> {
        Ok(Self {
            config,
            executor: RequestExecutor::new()?,
            shutdown,
        })
    }

    /// Serve the broker until shutdown, reconnecting whenever the link drops.
    ///
    /// The attempt counter and the backoff reset once a connection is made, so
    /// the limit applies to consecutive failures.
    pub async fn run(&self) -> Result<(), AgentError> {
        let max_attempts = self.config.max_reconnect_attempts;
        let mut attempt = 0;
        let mut delay = self.config.initial_delay;

        loop {
            attempt += 1;
            info!(
                "Connection attempt {} (max: {})",
                attempt,
                if max_attempts == 0 {
                    "∞".to_string()
                } else {
                    max_attempts.to_string()
                }
            );

            let outcome = match self.connect().await {
                Ok(ws) => {
                    attempt = 0;
                    delay = self.config.initial_delay;
                    self.serve(ws).await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    info!("Agent stopped");
                    return Ok(());
                }
                Err(e) => {
                    error!("Agent error: {}", e);

                    if max_attempts > 0 && attempt >= max_attempts {
                        error!("Maximum reconnection attempts ({}) reached", max_attempts);
                        return Err(AgentError::AttemptsExhausted(max_attempts));
                    }

                    warn!("Reconnecting in {:?}...", delay);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = next_delay(delay, self.config.max_delay);
                }
            }
        }
    }

    async fn connect(&self) -> Result<BrokerStream, AgentError> {
        let (ws, _) = connect_async(self.config.broker_url.as_str())
            .await
            .map_err(|e| AgentError::ConnectionFailed {
                url: self.config.broker_url.clone(),
                source: e,
            })?;
        info!(url = %self.config.broker_url, "Connected to broker");
        Ok(ws)
    }

    /// Answer requests one by one until the broker goes away (`Err`) or
    /// shutdown is requested (`Ok`)
    async fn serve(&self, mut ws: BrokerStream) -> Result<(), AgentError> {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = ws.close(None).await;
                    return Ok(());
                }
                message = ws.next() => message,
            };

            let frame = match message {
                None | Some(Ok(Message::Close(_))) => return Err(AgentError::Closed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(_)) => {
                    trace!("Broker heartbeat");
                    continue;
                }
            };

            let reply = self.handle(&frame).await;
            let json = reply.to_json()?;
            let message = match String::from_utf8(json) {
                Ok(text) => Message::Text(text),
                Err(e) => Message::Binary(e.into_bytes()),
            };
            ws.send(message).await?;
        }
    }

    async fn handle(&self, frame: &[u8]) -> AgentReply {
        match TunnelRequest::from_json(frame) {
            Ok(request) => {
                debug!(method = %request.meth, host = %request.host, "Executing request");
                self.executor.execute(&request).await
            }
            Err(e) => {
                warn!(error = %e, len = frame.len(), "Unreadable request from broker");
                AgentReply::new(UPSTREAM_FAILED_STATUS, &[], "")
            }
        }
    }
}

/// Double the reconnect delay, capped at `max`
pub fn next_delay(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current * 2, max)
}
