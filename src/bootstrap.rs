//! Session bootstrap over the REST API.
//!
//! Before any audio flows, the client resolves the agent by name, creates a
//! session around it, and joins as a named participant. Every failure here
//! maps to `SessionSetup`; there is nothing to retry at this layer.

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// An agent as returned by the lookup endpoint. Media fields drive optional
/// UI; only `id` matters to the pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub media_mime_type: Option<String>,
    #[serde(default)]
    pub orientation: Option<String>,
}

#[derive(Serialize)]
struct LookupRequest<'a> {
    names: Vec<&'a str>,
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    agents: Vec<AgentProfile>,
}

#[derive(Serialize)]
struct InitiateRequest<'a> {
    agent_ids: Vec<&'a str>,
}

#[derive(Deserialize)]
struct InitiateResponse {
    swarm_id: Option<String>,
}

#[derive(Serialize)]
struct JoinRequest<'a> {
    swarm_id: &'a str,
    name: &'a str,
    user_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct JoinResponse {
    participant_id: Option<String>,
}

#[derive(Serialize)]
struct ReloadRequest<'a> {
    swarm_id: &'a str,
    agent_id: &'a str,
}

#[derive(Deserialize)]
struct ReloadResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

pub struct BootstrapClient {
    http: reqwest::Client,
    base_url: String,
}

impl BootstrapClient {
    pub fn new(base_url: &str) -> PipelineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::SessionSetup(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// The duplex voice endpoint derived from the API base.
    pub fn voice_url(&self) -> String {
        let mut url = self.base_url.clone();
        if let Some(rest) = url.strip_prefix("https://") {
            url = format!("wss://{rest}");
        } else if let Some(rest) = url.strip_prefix("http://") {
            url = format!("ws://{rest}");
        }
        format!("{url}/voice")
    }

    /// Resolve an agent by display name.
    pub async fn lookup_agent(&self, name: &str) -> PipelineResult<AgentProfile> {
        let response: LookupResponse = self
            .post_json("/swarm/agents/by-names", &LookupRequest { names: vec![name] })
            .await?;
        response
            .agents
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::SessionSetup(format!("no agent named '{name}'")))
    }

    /// Create a fresh session containing the given agents.
    pub async fn initiate_swarm(&self, agent_ids: &[&str]) -> PipelineResult<String> {
        let response: InitiateResponse = self
            .post_json(
                "/swarm/initiate",
                &InitiateRequest {
                    agent_ids: agent_ids.to_vec(),
                },
            )
            .await?;
        response
            .swarm_id
            .ok_or_else(|| PipelineError::SessionSetup("initiate returned no swarm_id".into()))
    }

    /// Join the session and obtain the participant identity used in the
    /// stream handshake.
    pub async fn join_swarm(&self, swarm_id: &str, display_name: &str) -> PipelineResult<String> {
        let response: JoinResponse = self
            .post_json(
                "/swarm/join",
                &JoinRequest {
                    swarm_id,
                    name: display_name,
                    user_id: None,
                },
            )
            .await?;
        response
            .participant_id
            .ok_or_else(|| PipelineError::SessionSetup("join returned no participant_id".into()))
    }

    /// Ask the backend to refresh the agent's definition inside the session.
    pub async fn reload_agent(&self, swarm_id: &str, agent_id: &str) -> PipelineResult<()> {
        let response: ReloadResponse = self
            .post_json("/reload-agent", &ReloadRequest { swarm_id, agent_id })
            .await?;
        if response.status != "ok" {
            return Err(PipelineError::SessionSetup(format!(
                "agent reload failed: {}",
                response.message.unwrap_or_else(|| response.status.clone())
            )));
        }
        debug!(agent_id, "agent reloaded");
        Ok(())
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> PipelineResult<R>
    where
        B: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| PipelineError::SessionSetup(format!("POST {url}: {e}")))?
            .error_for_status()
            .map_err(|e| PipelineError::SessionSetup(format!("POST {url}: {e}")))?;
        response
            .json::<R>()
            .await
            .map_err(|e| PipelineError::SessionSetup(format!("decode {url} response: {e}")))
    }
}
