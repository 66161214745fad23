//! Capability contracts for the remote directory, the registry and the run reporter,
//! plus their HTTP bindings.

use async_trait::async_trait;
use csync_core::{Birthday, CandidateIdentifier, CanonicalAgent, RecordUpdate, RemoteRecord};
use csync_transport::{ResponseSnapshot, TransportError};
use serde::Serialize;
use thiserror::Error;

pub mod people;
pub mod registry;
pub mod tracker;

pub use people::{normalize_person, NormalizeOptions, PeopleDirectory, PeopleDirectoryConfig, Person};
pub use registry::{RegistryClient, RegistryClientConfig};
pub use tracker::{ScheduleTracker, ScheduleTrackerConfig};

pub const CRATE_NAME: &str = "csync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{stage}: server error {status}: {body}")]
    ServerError {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[error("{stage}: unexpected status code {status} {reason}: {body}")]
    UnexpectedResponse {
        stage: &'static str,
        status: u16,
        reason: String,
        body: String,
    },
    #[error("{stage}: decoding response failed: {source}")]
    Decode {
        stage: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    /// 5xx responses are server failures; anything else off-contract is unexpected.
    pub fn from_snapshot(stage: &'static str, snapshot: ResponseSnapshot) -> Self {
        if snapshot.status >= 500 {
            AdapterError::ServerError {
                stage,
                status: snapshot.status,
                body: snapshot.body,
            }
        } else {
            AdapterError::UnexpectedResponse {
                stage,
                status: snapshot.status,
                reason: snapshot.reason,
                body: snapshot.body,
            }
        }
    }
}

/// Read and write access to the remote address book.
#[async_trait]
pub trait RemoteDirectory: Send + Sync {
    /// Member record ids of a group, in the order the directory lists them.
    async fn group_members(
        &self,
        group: &str,
        max_members: usize,
    ) -> Result<Vec<String>, AdapterError>;

    /// Fetch and normalize one page of records. Callers keep pages within the per-call limit.
    async fn batch_get(&self, remote_ids: &[String]) -> Result<Vec<RemoteRecord>, AdapterError>;

    /// Write one page of partial updates. Callers keep pages within the per-call limit.
    async fn batch_update(&self, updates: &[RecordUpdate]) -> Result<(), AdapterError>;
}

/// Outcome of a single-identifier registry lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifyResult {
    Found(String),
    Conflict,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub identifiers: Vec<CandidateIdentifier>,
    pub birthday: Option<Birthday>,
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn identify(
        &self,
        identifier: &CandidateIdentifier,
    ) -> Result<IdentifyResult, AdapterError>;

    async fn create(&self, name: &str) -> Result<String, AdapterError>;

    /// Idempotent upsert; returns the registry's authoritative record.
    async fn import(&self, request: &ImportRequest) -> Result<CanonicalAgent, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub system: String,
    #[serde(rename = "frequency")]
    pub frequency_secs: u64,
    pub status: RunStatus,
    pub message: Option<String>,
}

#[async_trait]
pub trait RunReporter: Send + Sync {
    async fn report(&self, report: &RunReport) -> Result<(), AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_status_picks_error_kind() {
        let server = AdapterError::from_snapshot(
            "identify",
            ResponseSnapshot {
                status: 503,
                reason: "Service Unavailable".into(),
                body: "down".into(),
            },
        );
        assert!(matches!(server, AdapterError::ServerError { status: 503, .. }));

        let odd = AdapterError::from_snapshot(
            "create",
            ResponseSnapshot {
                status: 200,
                reason: "OK".into(),
                body: "<html/>".into(),
            },
        );
        assert_eq!(
            odd.to_string(),
            "create: unexpected status code 200 OK: <html/>"
        );
    }

    #[test]
    fn run_report_serializes_tracker_payload() {
        let report = RunReport {
            system: "lucos_contacts_googlesync_import".into(),
            frequency_secs: 300,
            status: RunStatus::Error,
            message: Some("identify: server error 500: boom".into()),
        };
        let value = serde_json::to_value(&report).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "system": "lucos_contacts_googlesync_import",
                "frequency": 300,
                "status": "error",
                "message": "identify: server error 500: boom",
            })
        );
    }
}
