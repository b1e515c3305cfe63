//! Tunnel broker: agent registration and request forwarding
//!
//! Agents connect to the agent listener and receive the next unused integer
//! id, which doubles as the id of their proxy record. Callers send plain HTTP
//! requests to the forward listener with a `Proxy-Id` header naming the agent
//! and a `Final-Host` header naming the real target.

use axum::{
    body::Bytes,
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use fleet_proto::{Proxy, TunnelRequest, FINAL_HOST_HEADER, PROXY_ID_HEADER};
use fleet_store::{Inventory, InventoryError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::connection::AgentConnection;
use crate::error::TunnelError;
use crate::registry::TunnelRegistry;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Where agents connect (`GET /websocket`)
    pub agent_addr: SocketAddr,
    /// Where callers send requests to forward
    pub forward_addr: SocketAddr,
    /// Upper bound on one forwarded request, queueing included
    pub forward_timeout: Duration,
    /// An agent silent for this long is dropped
    pub pong_wait: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            agent_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            forward_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            forward_timeout: Duration::from_secs(20),
            pong_wait: Duration::from_secs(15),
        }
    }
}

pub struct TunnelBroker {
    config: BrokerConfig,
    registry: TunnelRegistry,
    inventory: Arc<dyn Inventory>,
    last_id: AtomicU64,
}

impl TunnelBroker {
    /// Create a broker over `inventory`.
    ///
    /// Proxy records left over from a previous run are dropped; ids continue
    /// after the highest id ever stored so a dead proxy is never reused.
    pub async fn new(
        config: BrokerConfig,
        inventory: Arc<dyn Inventory>,
    ) -> Result<Arc<Self>, InventoryError> {
        let max_id = inventory.max_proxy_id().await?;
        inventory.drop_proxies().await?;
        info!(max_id, "Tunnel broker ready");

        Ok(Arc::new(Self {
            config,
            registry: TunnelRegistry::new(),
            inventory,
            last_id: AtomicU64::new(max_id),
        }))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    /// Router for the agent listener
    pub fn agent_router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/websocket", get(agent_upgrade))
            .with_state(self.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Router for the forward listener; every path is forwarded
    pub fn forward_router(self: &Arc<Self>) -> Router {
        Router::new()
            .fallback(forward_request)
            .with_state(self.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve both listeners until one of them fails
    pub async fn start(self: Arc<Self>) -> Result<(), anyhow::Error> {
        let agent_listener = tokio::net::TcpListener::bind(self.config.agent_addr).await?;
        let forward_listener = tokio::net::TcpListener::bind(self.config.forward_addr).await?;

        info!("Agent endpoint: ws://{}/websocket", self.config.agent_addr);
        info!("Forward endpoint: http://{}", self.config.forward_addr);

        let agents = axum::serve(agent_listener, self.agent_router());
        let forwards = axum::serve(forward_listener, self.forward_router());

        tokio::try_join!(
            async move { agents.await.map_err(|e| anyhow::anyhow!("Agent server error: {}", e)) },
            async move { forwards.await.map_err(|e| anyhow::anyhow!("Forward server error: {}", e)) },
        )?;

        Ok(())
    }

    /// Register an upgraded agent socket and serve it until it disconnects
    pub async fn attach(self: &Arc<Self>, socket: WebSocket) {
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (conn, outbound) = AgentConnection::new(id);

        self.registry.register(conn.clone()).await;
        if let Err(e) = self.inventory.add_proxy(Proxy::new(id)).await {
            error!(agent_id = id, error = %e, "Failed to store proxy record");
        }
        info!(agent_id = id, "New tunnel agent");

        conn.run(socket, outbound, self.config.pong_wait).await;

        self.registry.deregister(id).await;
        let mut proxy = Proxy::new(id);
        proxy.dead = true;
        if let Err(e) = self.inventory.update_proxy(&proxy).await {
            warn!(agent_id = id, error = %e, "Failed to mark proxy dead");
        }
        info!(
            agent_id = id,
            connected_secs = conn.connected_for().as_secs(),
            "Tunnel agent disconnected"
        );
    }

    /// Forward one HTTP request through the agent named in its headers
    pub async fn forward(
        &self,
        method: &Method,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Vec<u8>, TunnelError> {
        let raw_id = header_str(headers, PROXY_ID_HEADER);
        let id: u64 = raw_id
            .trim()
            .parse()
            .map_err(|_| TunnelError::InvalidProxyId(raw_id.to_string()))?;

        let conn = self.registry.lookup(id).await?;

        let request = TunnelRequest::new(
            method.as_str(),
            header_str(headers, FINAL_HOST_HEADER),
            header_str(headers, header::CONTENT_TYPE.as_str()),
            header_str(headers, header::USER_AGENT.as_str()),
            body,
        );
        debug!(agent_id = id, method = %method, host = %request.host, "Forwarding request");

        conn.forward(request.to_json()?, self.config.forward_timeout)
            .await
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

async fn agent_upgrade(
    State(broker): State<Arc<TunnelBroker>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move { broker.attach(socket).await })
}

async fn forward_request(
    State(broker): State<Arc<TunnelBroker>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match broker.forward(&method, &headers, &body).await {
        Ok(reply) => (StatusCode::OK, reply).into_response(),
        Err(e) => {
            warn!(error = %e, "Forwarding failed");
            e.http_response().into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_store::InMemoryInventory;

    async fn broker(inventory: Arc<InMemoryInventory>) -> Arc<TunnelBroker> {
        TunnelBroker::new(BrokerConfig::default(), inventory)
            .await
            .unwrap()
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    #[tokio::test]
    async fn test_startup_drops_stale_proxies_and_keeps_id_sequence() {
        let inventory = Arc::new(InMemoryInventory::new());
        inventory.add_proxy(Proxy::new(41)).await.unwrap();

        let broker = broker(inventory.clone()).await;

        assert_eq!(inventory.proxy_count().await, 0);
        assert_eq!(broker.last_id.load(Ordering::SeqCst), 41);
    }

    #[tokio::test]
    async fn test_forward_rejects_bad_proxy_id() {
        let broker = broker(Arc::new(InMemoryInventory::new())).await;

        let err = broker
            .forward(&Method::GET, &headers(&[("proxy-id", "abc")]), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::InvalidProxyId(_)));
        assert_eq!(err.http_response(), (StatusCode::BAD_REQUEST, "Internal error"));

        let err = broker
            .forward(&Method::GET, &HeaderMap::new(), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::InvalidProxyId(_)));
    }

    #[tokio::test]
    async fn test_forward_to_unknown_agent() {
        let broker = broker(Arc::new(InMemoryInventory::new())).await;

        let err = broker
            .forward(&Method::POST, &headers(&[("proxy-id", "12")]), b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::TunnelNotFound(12)));
        assert_eq!(err.http_response(), (StatusCode::BAD_REQUEST, "Internal Error"));
    }

    #[tokio::test]
    async fn test_forward_builds_tunnel_request() {
        let broker = broker(Arc::new(InMemoryInventory::new())).await;
        let (conn, mut outbound) = AgentConnection::new(2);
        broker.registry().register(conn.clone()).await;

        let agent = tokio::spawn(async move {
            let frame = outbound.recv().await.unwrap();
            conn.deliver(b"{\"status\":200}".to_vec()).await;
            TunnelRequest::from_json(&frame).unwrap()
        });

        let reply = broker
            .forward(
                &Method::POST,
                &headers(&[
                    ("proxy-id", "2"),
                    ("final-host", "https://upstream.example/rpc"),
                    ("content-type", "application/binary"),
                    ("user-agent", "game/1.0"),
                ]),
                b"payload",
            )
            .await
            .unwrap();

        assert_eq!(reply, b"{\"status\":200}");
        let request = agent.await.unwrap();
        assert_eq!(request.meth, "POST");
        assert_eq!(request.host, "https://upstream.example/rpc");
        assert_eq!(request.cont, "application/binary");
        assert_eq!(request.user, "game/1.0");
        assert_eq!(request.body().unwrap(), b"payload");
    }
}
