//! Schedule-tracker heartbeat sink.

use async_trait::async_trait;
use csync_transport::{classify_status, HttpClientConfig, HttpTransport, ResponseSnapshot, StatusClass};

use crate::{AdapterError, RunReport, RunReporter};

#[derive(Debug, Clone)]
pub struct ScheduleTrackerConfig {
    pub endpoint: String,
    pub http: HttpClientConfig,
}

#[derive(Debug)]
pub struct ScheduleTracker {
    endpoint: String,
    http: HttpTransport,
}

impl ScheduleTracker {
    pub fn new(config: ScheduleTrackerConfig) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: config.endpoint,
            http: HttpTransport::new("schedule-tracker", config.http)?,
        })
    }
}

#[async_trait]
impl RunReporter for ScheduleTracker {
    async fn report(&self, report: &RunReport) -> Result<(), AdapterError> {
        const STAGE: &str = "report_status";
        let request = self.http.client().post(&self.endpoint).json(report);
        let resp = self.http.send(STAGE, request).await?;
        if classify_status(resp.status()) == StatusClass::Success {
            return Ok(());
        }
        Err(AdapterError::from_snapshot(
            STAGE,
            ResponseSnapshot::capture(STAGE, resp).await?,
        ))
    }
}
