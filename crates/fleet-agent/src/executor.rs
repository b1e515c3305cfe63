//! Performs forwarded requests from this host's network position

use fleet_proto::{AgentReply, TunnelRequest};
use reqwest::header::{CONTENT_TYPE, LOCATION, USER_AGENT};
use reqwest::redirect::Policy;
use tracing::{debug, warn};

use crate::error::AgentError;

/// Status reported to the broker when the upstream call itself failed
pub const UPSTREAM_FAILED_STATUS: u16 = 502;

pub struct RequestExecutor {
    client: reqwest::Client,
}

impl RequestExecutor {
    /// Redirects are handed back to the broker, never followed here
    pub fn new() -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// Run one request. Failures become a 502 reply with an empty body.
    pub async fn execute(&self, request: &TunnelRequest) -> AgentReply {
        match self.try_execute(request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(host = %request.host, error = %e, "Upstream request failed");
                AgentReply::new(UPSTREAM_FAILED_STATUS, &[], "")
            }
        }
    }

    async fn try_execute(&self, request: &TunnelRequest) -> Result<AgentReply, AgentError> {
        let body = request.body()?;

        let mut builder = if request.meth.eq_ignore_ascii_case("GET") {
            self.client.get(&request.host)
        } else {
            self.client.post(&request.host)
        };
        if !request.user.is_empty() {
            builder = builder.header(USER_AGENT, &request.user);
        }
        if !request.cont.is_empty() {
            builder = builder.header(CONTENT_TYPE, &request.cont);
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let payload = response.bytes().await?;

        debug!(host = %request.host, status, len = payload.len(), "Upstream answered");
        Ok(AgentReply::new(status, &payload, location))
    }
}
