//! HTTP binding for the canonical contact registry.

use anyhow::Context;
use async_trait::async_trait;
use csync_core::{Birthday, CandidateIdentifier, CanonicalAgent};
use csync_transport::{
    classify_status, redirect_target, HttpClientConfig, HttpTransport, ResponseSnapshot,
    StatusClass,
};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::{AdapterError, IdentifyResult, ImportRequest, Registry};

#[derive(Debug, Clone)]
pub struct RegistryClientConfig {
    pub base_url: String,
    pub api_key: String,
    /// Identifier type the registry files remote directory ids under.
    pub remote_id_type: String,
    pub http: HttpClientConfig,
}

#[derive(Debug)]
pub struct RegistryClient {
    base_url: String,
    remote_id_type: String,
    http: HttpTransport,
}

#[derive(Debug, Serialize)]
struct ImportBody<'a> {
    identifiers: Vec<Map<String, JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    birthday: Option<&'a Birthday>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AgentIdWire {
    Number(u64),
    Text(String),
}

impl AgentIdWire {
    fn into_string(self) -> String {
        match self {
            AgentIdWire::Number(n) => n.to_string(),
            AgentIdWire::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AgentWire {
    id: AgentIdWire,
    name: String,
    #[serde(default)]
    phone_numbers: Vec<String>,
    #[serde(default)]
    is_dead: bool,
    #[serde(default)]
    starred: bool,
}

impl From<AgentWire> for CanonicalAgent {
    fn from(wire: AgentWire) -> Self {
        Self {
            id: wire.id.into_string(),
            name: wire.name,
            active_phones: wire.phone_numbers.into_iter().collect(),
            is_deceased: wire.is_dead,
            is_starred: wire.starred,
        }
    }
}

/// Agent id out of a `Location` header such as `/agents/42` or `https://host/agents/42`.
pub fn agent_id_from_location(location: &str) -> Option<String> {
    let (_, rest) = location.rsplit_once("/agents/")?;
    let id = rest.trim_end_matches('/');
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

impl RegistryClient {
    pub fn new(config: RegistryClientConfig) -> anyhow::Result<Self> {
        let mut http_config = config.http;
        let key = HeaderValue::from_str(&format!("key {}", config.api_key))
            .context("registry api key is not a valid header value")?;
        http_config.default_headers.insert(AUTHORIZATION, key);

        let mut base_url = config.base_url;
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            base_url,
            remote_id_type: config.remote_id_type,
            http: HttpTransport::new("registry", http_config)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Query parameters naming one identifier, shared by identify and import.
    pub fn identifier_params(&self, identifier: &CandidateIdentifier) -> Vec<(&'static str, String)> {
        let value = identifier.value().to_string();
        match identifier {
            CandidateIdentifier::RegistryTag(_) => vec![("type", "agent".into()), ("id", value)],
            CandidateIdentifier::RemoteSystemId(_) => {
                vec![("type", self.remote_id_type.clone()), ("id", value)]
            }
            CandidateIdentifier::Phone(_) => vec![("type", "phone".into()), ("number", value)],
            CandidateIdentifier::Email(_) => vec![("type", "email".into()), ("address", value)],
            CandidateIdentifier::Name(_) => vec![("type", "name".into()), ("name", value)],
        }
    }

    fn agent_from_redirect(
        stage: &'static str,
        resp: &reqwest::Response,
    ) -> Option<String> {
        if resp.status() != StatusCode::FOUND {
            return None;
        }
        let location = redirect_target(resp)?;
        let id = agent_id_from_location(&location);
        if id.is_none() {
            tracing::warn!(stage, location = %location, "redirect did not point at an agent");
        }
        id
    }
}

#[async_trait]
impl Registry for RegistryClient {
    async fn identify(
        &self,
        identifier: &CandidateIdentifier,
    ) -> Result<IdentifyResult, AdapterError> {
        const STAGE: &str = "identify";
        let request = self
            .http
            .client()
            .get(self.url("identify"))
            .query(&self.identifier_params(identifier));
        let resp = self.http.send(STAGE, request).await?;

        if let Some(id) = Self::agent_from_redirect(STAGE, &resp) {
            return Ok(IdentifyResult::Found(id));
        }
        match resp.status() {
            StatusCode::CONFLICT => Ok(IdentifyResult::Conflict),
            StatusCode::NOT_FOUND => Ok(IdentifyResult::NotFound),
            _ => Err(AdapterError::from_snapshot(
                STAGE,
                ResponseSnapshot::capture(STAGE, resp).await?,
            )),
        }
    }

    async fn create(&self, name: &str) -> Result<String, AdapterError> {
        const STAGE: &str = "create";
        let request = self
            .http
            .client()
            .post(self.url("agents/add"))
            .form(&[("name", name)]);
        let resp = self.http.send(STAGE, request).await?;

        match Self::agent_from_redirect(STAGE, &resp) {
            Some(id) => Ok(id),
            None => Err(AdapterError::from_snapshot(
                STAGE,
                ResponseSnapshot::capture(STAGE, resp).await?,
            )),
        }
    }

    async fn import(&self, request: &ImportRequest) -> Result<CanonicalAgent, AdapterError> {
        const STAGE: &str = "import";
        let body = ImportBody {
            identifiers: request
                .identifiers
                .iter()
                .map(|identifier| {
                    self.identifier_params(identifier)
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), JsonValue::String(v)))
                        .collect()
                })
                .collect(),
            birthday: request.birthday.as_ref(),
        };
        let req = self
            .http
            .client()
            .post(self.url("agents/import"))
            .json(&body);
        let resp = self.http.send(STAGE, req).await?;
        let status = resp.status();
        let snapshot = ResponseSnapshot::capture(STAGE, resp).await?;
        if classify_status(status) != StatusClass::Success {
            return Err(AdapterError::from_snapshot(STAGE, snapshot));
        }
        let wire: AgentWire = serde_json::from_str(&snapshot.body)
            .map_err(|source| AdapterError::Decode { stage: STAGE, source })?;
        Ok(wire.into())
    }
}
