//! The control surface: trigger, status, reset, cancel, export.
//!
//! Built once at startup and shared by the HTTP handlers and the CLI.

use std::sync::Arc;

use planindex_shared::{JobId, JobKind, PlanIndexError, Result};
use planindex_storage::{DisciplineCounts, PageCounts, ResetCounts, Storage};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::export::{self, ContextTree};
use crate::jobs::{JobHandle, JobRegistry, Registration};
use crate::orchestrator::Orchestrator;
use crate::progress::{AggregationSummary, ProcessingSummary, ProgressBroadcaster, Subscription};

/// Response to a trigger request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerResponse {
    pub job_id: String,
    /// `started` or `already_running`.
    pub status: &'static str,
}

impl From<&Registration> for TriggerResponse {
    fn from(registration: &Registration) -> Self {
        Self {
            job_id: registration.handle().job_id.to_string(),
            status: registration.status(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Idle,
    Processing,
    Complete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageStatusCounts {
    pub total: u64,
    /// Includes pages in `error`.
    pub unprocessed: u64,
    pub pass1_complete: u64,
    pub pass2_complete: u64,
    pub errored: u64,
    pub in_progress: u64,
}

impl From<PageCounts> for PageStatusCounts {
    fn from(c: PageCounts) -> Self {
        Self {
            total: c.total(),
            unprocessed: c.unprocessed + c.error,
            pass1_complete: c.pass1_complete,
            pass2_complete: c.pass2_complete,
            errored: c.error,
            in_progress: c.pass1_processing + c.pass2_processing,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DisciplineStatusCounts {
    pub total: u64,
    pub waiting: u64,
    pub ready: u64,
    pub processing: u64,
    pub complete: u64,
    pub errored: u64,
}

impl From<DisciplineCounts> for DisciplineStatusCounts {
    fn from(c: DisciplineCounts) -> Self {
        Self {
            total: c.total(),
            waiting: c.waiting,
            ready: c.ready,
            processing: c.processing,
            complete: c.complete,
            errored: c.error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveJob {
    pub job_id: String,
    pub kind: JobKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStatus {
    pub project_id: String,
    pub pages: PageStatusCounts,
    pub disciplines: DisciplineStatusCounts,
    pub pages_status: OverallStatus,
    pub disciplines_status: OverallStatus,
    pub active_jobs: Vec<ActiveJob>,
}

/// Derived status of the page side.
pub fn pages_overall(counts: &PageStatusCounts, job_active: bool) -> OverallStatus {
    if job_active {
        OverallStatus::Processing
    } else if counts.total > 0 && counts.pass2_complete == counts.total {
        OverallStatus::Complete
    } else {
        OverallStatus::Idle
    }
}

/// Derived status of the discipline side.
pub fn disciplines_overall(counts: &DisciplineStatusCounts, job_active: bool) -> OverallStatus {
    if job_active || counts.processing > 0 {
        OverallStatus::Processing
    } else if counts.total > 0 && counts.complete == counts.total {
        OverallStatus::Complete
    } else {
        OverallStatus::Idle
    }
}

#[derive(Clone)]
pub struct ControlService {
    orchestrator: Arc<Orchestrator>,
    jobs: Arc<JobRegistry>,
    progress: Arc<ProgressBroadcaster>,
}

impl ControlService {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        jobs: Arc<JobRegistry>,
        progress: Arc<ProgressBroadcaster>,
    ) -> Self {
        Self {
            orchestrator,
            jobs,
            progress,
        }
    }

    fn storage(&self) -> &Storage {
        self.orchestrator.storage()
    }

    /// Start a page run unless one is active. The returned handle resolves
    /// when a newly started run ends.
    pub async fn spawn_pages(
        &self,
        project_id: &str,
    ) -> Result<(TriggerResponse, Option<JoinHandle<Result<ProcessingSummary>>>)> {
        self.storage().require_project(project_id).await?;
        let registration = self.jobs.register(project_id, JobKind::Pages);
        let response = TriggerResponse::from(&registration);
        let Registration::Started(job) = registration else {
            info!(project_id, job_id = %response.job_id, "page run already active");
            return Ok((response, None));
        };

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let result = this
                .orchestrator
                .start_processing(&job.project_id, &job.job_id, &job.cancel)
                .await;
            this.release(&job);
            result
        });
        Ok((response, Some(handle)))
    }

    /// Start a discipline run unless one is active.
    pub async fn spawn_disciplines(
        &self,
        project_id: &str,
    ) -> Result<(TriggerResponse, Option<JoinHandle<Result<AggregationSummary>>>)> {
        self.storage().require_project(project_id).await?;
        let registration = self.jobs.register(project_id, JobKind::Disciplines);
        let response = TriggerResponse::from(&registration);
        let Registration::Started(job) = registration else {
            info!(project_id, job_id = %response.job_id, "discipline run already active");
            return Ok((response, None));
        };

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let result = this
                .orchestrator
                .process_disciplines(&job.project_id, &job.job_id)
                .await;
            this.release(&job);
            result
        });
        Ok((response, Some(handle)))
    }

    pub async fn trigger_pages(&self, project_id: &str) -> Result<TriggerResponse> {
        Ok(self.spawn_pages(project_id).await?.0)
    }

    pub async fn trigger_disciplines(&self, project_id: &str) -> Result<TriggerResponse> {
        Ok(self.spawn_disciplines(project_id).await?.0)
    }

    fn release(&self, job: &JobHandle) {
        self.jobs.finish(&job.project_id, job.kind, &job.job_id);
        self.progress.prune(&job.project_id);
    }

    pub async fn status(&self, project_id: &str) -> Result<ProcessingStatus> {
        self.storage().require_project(project_id).await?;
        let pages = PageStatusCounts::from(self.storage().page_counts(project_id).await?);
        let disciplines =
            DisciplineStatusCounts::from(self.storage().discipline_counts(project_id).await?);

        let active_jobs: Vec<ActiveJob> = [JobKind::Pages, JobKind::Disciplines]
            .into_iter()
            .filter_map(|kind| self.jobs.active(project_id, kind))
            .map(|h| ActiveJob {
                job_id: h.job_id.to_string(),
                kind: h.kind,
            })
            .collect();
        let active = |kind| active_jobs.iter().any(|j| j.kind == kind);

        Ok(ProcessingStatus {
            project_id: project_id.to_string(),
            pages_status: pages_overall(&pages, active(JobKind::Pages)),
            disciplines_status: disciplines_overall(&disciplines, active(JobKind::Disciplines)),
            pages,
            disciplines,
            active_jobs,
        })
    }

    /// Reset every page and discipline of the project. Rejected while any
    /// job of the project is active.
    pub async fn reset(&self, project_id: &str) -> Result<ResetCounts> {
        self.storage().require_project(project_id).await?;
        if self.jobs.any_active(project_id) {
            warn!(project_id, "reset rejected, job active");
            return Err(PlanIndexError::Conflict(format!(
                "project {project_id} has an active processing job"
            )));
        }
        self.storage().reset_project(project_id).await
    }

    pub async fn cancel(&self, project_id: &str) -> Result<Vec<JobId>> {
        self.storage().require_project(project_id).await?;
        Ok(self.jobs.cancel(project_id))
    }

    /// Subscribe to the project's progress. The subscription closes with the
    /// page job running now, else the discipline job, else the first job
    /// that publishes.
    pub async fn subscribe(&self, project_id: &str) -> Result<Subscription> {
        self.storage().require_project(project_id).await?;
        let mut subscription = self.progress.subscribe(project_id);
        if let Some(job) = [JobKind::Pages, JobKind::Disciplines]
            .into_iter()
            .find_map(|kind| self.jobs.active(project_id, kind))
        {
            subscription.follow(job.job_id);
        }
        Ok(subscription)
    }

    pub async fn export(&self, project_id: &str) -> Result<ContextTree> {
        export::export_project(self.storage(), project_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use std::time::Duration;

    #[test]
    fn overall_status_derivation() {
        let mut pages = PageStatusCounts::default();
        assert_eq!(pages_overall(&pages, false), OverallStatus::Idle);
        pages.total = 2;
        pages.pass2_complete = 2;
        assert_eq!(pages_overall(&pages, false), OverallStatus::Complete);
        assert_eq!(pages_overall(&pages, true), OverallStatus::Processing);

        let mut disciplines = DisciplineStatusCounts {
            total: 1,
            processing: 1,
            ..Default::default()
        };
        assert_eq!(disciplines_overall(&disciplines, false), OverallStatus::Processing);
        disciplines.processing = 0;
        disciplines.waiting = 1;
        assert_eq!(disciplines_overall(&disciplines, false), OverallStatus::Idle);
    }

    #[test]
    fn error_pages_count_as_unprocessed() {
        let counts = PageStatusCounts::from(PageCounts {
            unprocessed: 1,
            error: 2,
            pass1_processing: 1,
            pass2_processing: 1,
            ..Default::default()
        });
        assert_eq!(counts.total, 5);
        assert_eq!(counts.unprocessed, 3);
        assert_eq!(counts.errored, 2);
        assert_eq!(counts.in_progress, 2);
    }

    #[tokio::test]
    async fn duplicate_trigger_returns_same_job() {
        let fixture = Fixture::new().await;
        fixture.page("A-101 Plan.pdf", 1).await;
        let gate = fixture.oracle.hold();
        fixture.oracle.respond_with(scripted_plan_set);
        let control = fixture.control();

        let (first, handle) = control.spawn_pages(&fixture.project_id).await.unwrap();
        let second = control.trigger_pages(&fixture.project_id).await.unwrap();
        assert_eq!(first.status, "started");
        assert_eq!(second.status, "already_running");
        assert_eq!(first.job_id, second.job_id);

        let status = control.status(&fixture.project_id).await.unwrap();
        assert_eq!(status.pages_status, OverallStatus::Processing);
        assert!(matches!(
            control.reset(&fixture.project_id).await,
            Err(PlanIndexError::Conflict(_))
        ));

        gate.release();
        let summary = handle.unwrap().await.unwrap().unwrap();
        assert_eq!(summary.pass1_completed, 1);

        let status = control.status(&fixture.project_id).await.unwrap();
        assert!(status.active_jobs.is_empty());
        assert_eq!(status.pages_status, OverallStatus::Complete);
        assert_eq!(status.disciplines_status, OverallStatus::Complete);

        let reset = control.reset(&fixture.project_id).await.unwrap();
        assert_eq!(reset.pages_reset, 1);
        let status = control.status(&fixture.project_id).await.unwrap();
        assert_eq!(status.pages.unprocessed, 1);
        assert_eq!(status.disciplines.waiting, 1);
    }

    #[tokio::test]
    async fn discipline_trigger_runs_ready_disciplines() {
        let fixture = Fixture::new().await;
        fixture.completed_page("M201 HVAC.pdf", "M").await;
        fixture.oracle.respond_with(scripted_plan_set);
        let control = fixture.control();

        let (response, handle) = control.spawn_disciplines(&fixture.project_id).await.unwrap();
        assert_eq!(response.status, "started");
        let summary = handle.unwrap().await.unwrap().unwrap();
        assert_eq!(summary.disciplines_ready, 1);
        assert_eq!(summary.disciplines_completed, 1);
    }

    #[tokio::test]
    async fn cancel_stops_a_held_run() {
        let fixture = Fixture::new().await;
        fixture.page("A-101 Plan.pdf", 1).await;
        let gate = fixture.oracle.hold();
        fixture.oracle.respond_with(scripted_plan_set);
        let control = fixture.control();

        let (_, handle) = control.spawn_pages(&fixture.project_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let cancelled = control.cancel(&fixture.project_id).await.unwrap();
        assert_eq!(cancelled.len(), 1);
        gate.release();

        let summary = handle.unwrap().await.unwrap().unwrap();
        assert_eq!(summary.pass2_completed, 0);
        assert!(control.status(&fixture.project_id).await.unwrap().active_jobs.is_empty());
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let fixture = Fixture::new().await;
        let control = fixture.control();
        assert!(matches!(
            control.trigger_pages("missing").await,
            Err(PlanIndexError::NotFound { .. })
        ));
        assert!(matches!(
            control.status("missing").await,
            Err(PlanIndexError::NotFound { .. })
        ));
    }
}
