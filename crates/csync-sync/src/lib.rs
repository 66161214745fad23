//! Reconciliation pipeline: page through the remote group, match or create each person
//! in the registry, and write the registry's state back as minimal patches.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csync_adapters::{
    PeopleDirectory, PeopleDirectoryConfig, Registry, RegistryClient, RegistryClientConfig,
    RemoteDirectory, RunReport, RunReporter, RunStatus, ScheduleTracker, ScheduleTrackerConfig,
};
use csync_core::{
    build_identifiers, compute_patch, MatchOutcome, PatchRules, RecordUpdate, RemoteRecord,
    UpdateField,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod matcher;
#[cfg(test)]
mod testing;

pub use config::{PacingSettings, ReconcileConfig, ReconcileSettings, REMOTE_PAGE_LIMIT};
pub use matcher::{import_identifiers, import_record, match_identity};

pub const CRATE_NAME: &str = "csync-sync";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub members: usize,
    pub read_batches: usize,
    pub matched: usize,
    pub created: usize,
    pub ambiguous: usize,
    pub patched: usize,
    pub write_batches: usize,
    /// The group listing hit `max_group_members`; members past the cap were not seen.
    pub member_cap_reached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub counters: RunCounters,
}

/// Pipeline progress. `Done` and `Failed` are terminal.
#[derive(Debug)]
pub enum PipelineState {
    Fetching {
        remaining: VecDeque<String>,
        patches: BTreeMap<String, RecordUpdate>,
    },
    /// Write pages still to send. Every update in a page touches the same fields.
    Flushing {
        pending: VecDeque<Vec<RecordUpdate>>,
    },
    Done,
    Failed(anyhow::Error),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed(_))
    }
}

fn take_page<T>(queue: &mut VecDeque<T>, size: usize) -> Vec<T> {
    let n = size.min(queue.len());
    queue.drain(..n).collect()
}

/// Split patches into write pages of at most `page_size`, one field mask per page.
///
/// The directory overwrites every masked field on every contact in a request, so a
/// page mixing a name fix with a phone prune would blank the other contact's field.
pub fn write_pages(
    patches: impl IntoIterator<Item = RecordUpdate>,
    page_size: usize,
) -> VecDeque<Vec<RecordUpdate>> {
    let mut by_mask: BTreeMap<BTreeSet<UpdateField>, Vec<RecordUpdate>> = BTreeMap::new();
    for update in patches {
        by_mask.entry(update.update_mask()).or_default().push(update);
    }
    by_mask
        .into_values()
        .flat_map(|group| {
            let mut group: VecDeque<_> = group.into();
            let mut pages = Vec::new();
            while !group.is_empty() {
                pages.push(take_page(&mut group, page_size.max(1)));
            }
            pages
        })
        .collect()
}

pub struct ReconcilePipeline {
    settings: ReconcileSettings,
    group: String,
    rules: PatchRules,
    directory: Box<dyn RemoteDirectory>,
    registry: Box<dyn Registry>,
}

impl ReconcilePipeline {
    pub fn new(
        settings: ReconcileSettings,
        group: impl Into<String>,
        directory: Box<dyn RemoteDirectory>,
        registry: Box<dyn Registry>,
    ) -> Self {
        let settings = settings.clamped();
        Self {
            rules: settings.patch_rules(),
            settings,
            group: group.into(),
            directory,
            registry,
        }
    }

    pub fn from_config(config: &ReconcileConfig) -> Result<Self> {
        let directory = PeopleDirectory::new(PeopleDirectoryConfig {
            base_url: config.remote_api_url.clone(),
            access_token: config.remote_access_token.clone(),
            normalize: config.settings.normalize_options(),
            http: config.http_client_config(),
        })?;
        let registry = RegistryClient::new(RegistryClientConfig {
            base_url: config.registry_url.clone(),
            api_key: config.registry_api_key.clone(),
            remote_id_type: config.settings.remote_id_type.clone(),
            http: config.registry_http_client_config(),
        })?;
        Ok(Self::new(
            config.settings.clone(),
            config.remote_group.clone(),
            Box::new(directory),
            Box::new(registry),
        ))
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile_run", %run_id, group = %self.group);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = Utc::now();
        let members = self
            .directory
            .group_members(&self.group, self.settings.max_group_members)
            .await
            .with_context(|| format!("listing members of {}", self.group))?;
        info!(members = members.len(), "reconcile run started");
        let member_cap_reached = members.len() >= self.settings.max_group_members;
        if member_cap_reached {
            warn!(
                cap = self.settings.max_group_members,
                "group listing reached max_group_members; later members are not reconciled"
            );
        }

        let mut counters = RunCounters {
            members: members.len(),
            member_cap_reached,
            ..Default::default()
        };
        let mut state = PipelineState::Fetching {
            remaining: members.into(),
            patches: BTreeMap::new(),
        };
        loop {
            state = match self.step(state, &mut counters).await {
                PipelineState::Done => break,
                PipelineState::Failed(err) => {
                    error!(error = %format!("{err:#}"), "reconcile run halted");
                    return Err(err);
                }
                next => next,
            };
        }

        info!(
            matched = counters.matched,
            created = counters.created,
            ambiguous = counters.ambiguous,
            patched = counters.patched,
            "reconcile run complete"
        );
        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            counters,
        })
    }

    /// Advance one page. Any fatal error moves straight to `Failed`.
    pub async fn step(&self, state: PipelineState, counters: &mut RunCounters) -> PipelineState {
        match state {
            PipelineState::Fetching {
                mut remaining,
                mut patches,
            } => {
                if remaining.is_empty() {
                    return PipelineState::Flushing {
                        pending: write_pages(patches.into_values(), self.settings.write_page_size),
                    };
                }
                let page = take_page(&mut remaining, self.settings.read_page_size);
                match self.process_page(&page, &mut patches, counters).await {
                    Ok(()) => PipelineState::Fetching { remaining, patches },
                    Err(err) => PipelineState::Failed(err),
                }
            }
            PipelineState::Flushing { mut pending } => {
                let Some(page) = pending.pop_front() else {
                    return PipelineState::Done;
                };
                match self.directory.batch_update(&page).await {
                    Ok(()) => {
                        counters.write_batches += 1;
                        info!(records = page.len(), "patch batch written");
                        PipelineState::Flushing { pending }
                    }
                    Err(err) => PipelineState::Failed(
                        anyhow::Error::new(err)
                            .context(format!("writing patch batch of {} records", page.len())),
                    ),
                }
            }
            terminal => terminal,
        }
    }

    async fn process_page(
        &self,
        page: &[String],
        patches: &mut BTreeMap<String, RecordUpdate>,
        counters: &mut RunCounters,
    ) -> Result<()> {
        let records = self
            .directory
            .batch_get(page)
            .await
            .with_context(|| format!("fetching page of {} records", page.len()))?;
        counters.read_batches += 1;

        for record in &records {
            if let Some(update) = self.reconcile_record(record, counters).await? {
                counters.patched += 1;
                patches.insert(update.remote_id.clone(), update);
            }
        }
        Ok(())
    }

    /// Match or create, import, then diff. `None` means nothing to write back.
    pub async fn reconcile_record(
        &self,
        record: &RemoteRecord,
        counters: &mut RunCounters,
    ) -> Result<Option<RecordUpdate>> {
        let identifiers = build_identifiers(record);
        let agent_id = match match_identity(
            self.registry.as_ref(),
            &identifiers,
            &record.display_name,
        )
        .await?
        {
            MatchOutcome::Matched(agent_id) => {
                counters.matched += 1;
                agent_id
            }
            MatchOutcome::NoMatch => {
                info!(
                    record = %record.remote_id,
                    display_name = %record.display_name,
                    "no registry match, creating agent"
                );
                let agent_id = self
                    .registry
                    .create(&record.display_name)
                    .await
                    .with_context(|| format!("creating agent for {}", record.display_name))?;
                counters.created += 1;
                agent_id
            }
            MatchOutcome::Ambiguous => {
                warn!(
                    record = %record.remote_id,
                    display_name = %record.display_name,
                    "ambiguous registry match, skipping record"
                );
                counters.ambiguous += 1;
                return Ok(None);
            }
        };

        let agent = import_record(self.registry.as_ref(), &agent_id, &identifiers, record).await?;
        let patch = compute_patch(&agent, record, &self.rules);
        Ok(patch.render(record))
    }
}

/// One pipeline plus its run reporter; every run is reported exactly once.
pub struct SyncService {
    pipeline: ReconcilePipeline,
    reporter: Box<dyn RunReporter>,
    system_name: String,
    frequency_secs: u64,
    running: Mutex<()>,
}

impl SyncService {
    pub fn new(
        pipeline: ReconcilePipeline,
        reporter: Box<dyn RunReporter>,
        system_name: impl Into<String>,
        frequency_secs: u64,
    ) -> Self {
        Self {
            pipeline,
            reporter,
            system_name: system_name.into(),
            frequency_secs,
            running: Mutex::new(()),
        }
    }

    pub fn from_config(config: &ReconcileConfig) -> Result<Self> {
        let reporter = ScheduleTracker::new(ScheduleTrackerConfig {
            endpoint: config.tracker_url.clone(),
            http: config.http_client_config(),
        })?;
        Ok(Self::new(
            ReconcilePipeline::from_config(config)?,
            Box::new(reporter),
            config.system_name.clone(),
            config.frequency_secs,
        ))
    }

    pub async fn run_and_report(&self) -> Result<RunSummary> {
        let _running = self.running.lock().await;
        self.run_locked().await
    }

    /// Like `run_and_report`, but returns `None` when a run is already in progress.
    pub async fn run_if_idle(&self) -> Option<Result<RunSummary>> {
        let _running = self.running.try_lock().ok()?;
        Some(self.run_locked().await)
    }

    async fn run_locked(&self) -> Result<RunSummary> {
        let result = self.pipeline.run_once().await;
        let (status, message) = match &result {
            Ok(_) => (RunStatus::Success, None),
            Err(err) => (RunStatus::Error, Some(format!("{err:#}"))),
        };
        let report = RunReport {
            system: self.system_name.clone(),
            frequency_secs: self.frequency_secs,
            status,
            message,
        };
        if let Err(err) = self.reporter.report(&report).await {
            error!(error = %err, "reporting run status failed");
        }
        result
    }
}

pub async fn maybe_build_scheduler(
    service: Arc<SyncService>,
    config: &ReconcileConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let service = Arc::clone(&service);
        Box::pin(async move {
            match service.run_if_idle().await {
                None => warn!("previous reconcile run still in progress; skipping tick"),
                Some(Ok(summary)) => info!(run_id = %summary.run_id, "scheduled run finished"),
                Some(Err(err)) => error!(error = %format!("{err:#}"), "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Run on the configured cron until `shutdown` resolves.
pub async fn run_scheduled(
    mut config: ReconcileConfig,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    config.scheduler_enabled = true;
    let service = Arc::new(SyncService::from_config(&config)?);
    let Some(mut sched) = maybe_build_scheduler(service, &config).await? else {
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler started");

    shutdown.await;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = ReconcileConfig::from_env()?;
    SyncService::from_config(&config)?.run_and_report().await
}
