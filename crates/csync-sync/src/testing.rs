//! In-memory capability fakes for matcher and pipeline tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use csync_adapters::{
    AdapterError, IdentifyResult, ImportRequest, Registry, RemoteDirectory, RunReport,
    RunReporter,
};
use csync_core::{
    CandidateIdentifier, CanonicalAgent, IdentifierKind, PhonePrefixRule, RecordUpdate,
    RemoteRecord,
};

#[derive(Default)]
struct RegistryState {
    identify_calls: usize,
    import_calls: usize,
    created: Vec<String>,
    agents: BTreeMap<String, CanonicalAgent>,
}

/// Registry double: scripted identify answers, sequential create ids, upserting import.
#[derive(Default)]
pub struct FakeRegistry {
    identify: HashMap<(IdentifierKind, String), IdentifyResult>,
    failing: Option<IdentifierKind>,
    state: Mutex<RegistryState>,
}

impl FakeRegistry {
    pub fn with_identify(
        mut self,
        kind: IdentifierKind,
        value: &str,
        result: IdentifyResult,
    ) -> Self {
        self.identify.insert((kind, value.to_string()), result);
        self
    }

    pub fn failing_identify(mut self, kind: IdentifierKind) -> Self {
        self.failing = Some(kind);
        self
    }

    /// Seed authoritative state that import will return for this agent id.
    pub fn with_agent(self, agent: CanonicalAgent) -> Self {
        self.state
            .lock()
            .expect("registry state")
            .agents
            .insert(agent.id.clone(), agent);
        self
    }

    pub fn identify_calls(&self) -> usize {
        self.state.lock().expect("registry state").identify_calls
    }

    pub fn import_calls(&self) -> usize {
        self.state.lock().expect("registry state").import_calls
    }

    pub fn created_names(&self) -> Vec<String> {
        self.state.lock().expect("registry state").created.clone()
    }

    pub fn agent_count(&self) -> usize {
        self.state.lock().expect("registry state").agents.len()
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn identify(
        &self,
        identifier: &CandidateIdentifier,
    ) -> Result<IdentifyResult, AdapterError> {
        self.state.lock().expect("registry state").identify_calls += 1;
        if self.failing == Some(identifier.kind()) {
            return Err(AdapterError::ServerError {
                stage: "identify",
                status: 500,
                body: "boom".into(),
            });
        }
        Ok(self
            .identify
            .get(&(identifier.kind(), identifier.value().to_string()))
            .cloned()
            .unwrap_or(IdentifyResult::NotFound))
    }

    async fn create(&self, name: &str) -> Result<String, AdapterError> {
        let mut state = self.state.lock().expect("registry state");
        state.created.push(name.to_string());
        Ok(format!("new-{}", state.created.len()))
    }

    async fn import(&self, request: &ImportRequest) -> Result<CanonicalAgent, AdapterError> {
        let mut state = self.state.lock().expect("registry state");
        state.import_calls += 1;
        let Some(CandidateIdentifier::RegistryTag(id)) = request.identifiers.first() else {
            return Err(AdapterError::Message("import without agent id".into()));
        };
        let prefix = PhonePrefixRule::default();
        let agent = state.agents.entry(id.clone()).or_insert_with(|| CanonicalAgent {
            id: id.clone(),
            name: request
                .identifiers
                .iter()
                .find_map(|i| match i {
                    CandidateIdentifier::Name(name) => Some(name.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| "Unknown Google Contact".into()),
            active_phones: request
                .identifiers
                .iter()
                .filter_map(|i| match i {
                    CandidateIdentifier::Phone(phone) => Some(prefix.to_domestic(phone)),
                    _ => None,
                })
                .collect(),
            is_deceased: false,
            is_starred: false,
        });
        Ok(agent.clone())
    }
}

#[derive(Default)]
struct DirectoryState {
    get_pages: Vec<usize>,
    update_pages: Vec<Vec<RecordUpdate>>,
}

/// Remote directory double serving a fixed group and recording every page it sees.
#[derive(Default)]
pub struct FakeDirectory {
    members: Vec<String>,
    records: HashMap<String, RemoteRecord>,
    fail_updates: bool,
    state: Mutex<DirectoryState>,
}

impl FakeDirectory {
    pub fn new(records: Vec<RemoteRecord>) -> Self {
        Self {
            members: records.iter().map(|r| r.remote_id.clone()).collect(),
            records: records
                .into_iter()
                .map(|r| (r.remote_id.clone(), r))
                .collect(),
            ..Default::default()
        }
    }

    pub fn failing_updates(mut self) -> Self {
        self.fail_updates = true;
        self
    }

    pub fn get_pages(&self) -> Vec<usize> {
        self.state.lock().expect("directory state").get_pages.clone()
    }

    pub fn update_pages(&self) -> Vec<Vec<RecordUpdate>> {
        self.state.lock().expect("directory state").update_pages.clone()
    }
}

#[async_trait]
impl RemoteDirectory for FakeDirectory {
    async fn group_members(
        &self,
        _group: &str,
        max_members: usize,
    ) -> Result<Vec<String>, AdapterError> {
        Ok(self.members.iter().take(max_members).cloned().collect())
    }

    async fn batch_get(&self, remote_ids: &[String]) -> Result<Vec<RemoteRecord>, AdapterError> {
        self.state
            .lock()
            .expect("directory state")
            .get_pages
            .push(remote_ids.len());
        remote_ids
            .iter()
            .map(|id| {
                self.records
                    .get(id)
                    .cloned()
                    .ok_or_else(|| AdapterError::Message(format!("no record {id}")))
            })
            .collect()
    }

    async fn batch_update(&self, updates: &[RecordUpdate]) -> Result<(), AdapterError> {
        if self.fail_updates {
            return Err(AdapterError::ServerError {
                stage: "batch_update",
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.state
            .lock()
            .expect("directory state")
            .update_pages
            .push(updates.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeReporter {
    reports: Mutex<Vec<RunReport>>,
    fail: bool,
}

impl FakeReporter {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn reports(&self) -> Vec<RunReport> {
        self.reports.lock().expect("reports").clone()
    }
}

#[async_trait]
impl RunReporter for FakeReporter {
    async fn report(&self, report: &RunReport) -> Result<(), AdapterError> {
        self.reports.lock().expect("reports").push(report.clone());
        if self.fail {
            return Err(AdapterError::Message("tracker unreachable".into()));
        }
        Ok(())
    }
}
