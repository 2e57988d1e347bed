//! In-process registry of active jobs, at most one per (project, kind).

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use planindex_shared::{JobId, JobKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A running job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: JobId,
    pub project_id: String,
    pub kind: JobKind,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
}

/// Outcome of a registration attempt.
#[derive(Debug, Clone)]
pub enum Registration {
    /// A new job was registered; the caller must run it and call [`JobRegistry::finish`].
    Started(JobHandle),
    /// A job of that kind is already active for the project.
    AlreadyRunning(JobHandle),
}

impl Registration {
    pub fn handle(&self) -> &JobHandle {
        match self {
            Self::Started(h) | Self::AlreadyRunning(h) => h,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Started(_) => "started",
            Self::AlreadyRunning(_) => "already_running",
        }
    }
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<(String, JobKind), JobHandle>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job unless one of the same kind is active for the project.
    /// Check and insert happen under one lock.
    pub fn register(&self, project_id: &str, kind: JobKind) -> Registration {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let key = (project_id.to_string(), kind);
        if let Some(existing) = jobs.get(&key) {
            return Registration::AlreadyRunning(existing.clone());
        }
        let handle = JobHandle {
            job_id: JobId::new(),
            project_id: project_id.to_string(),
            kind,
            cancel: CancellationToken::new(),
            started_at: Utc::now(),
        };
        info!(project_id, kind = kind.as_str(), job_id = %handle.job_id, "job registered");
        jobs.insert(key, handle.clone());
        Registration::Started(handle)
    }

    /// Remove a finished job. A stale `job_id` leaves a newer job untouched.
    pub fn finish(&self, project_id: &str, kind: JobKind, job_id: &JobId) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let key = (project_id.to_string(), kind);
        if jobs.get(&key).is_some_and(|h| &h.job_id == job_id) {
            jobs.remove(&key);
            info!(project_id, kind = kind.as_str(), job_id = %job_id, "job finished");
        }
    }

    pub fn active(&self, project_id: &str, kind: JobKind) -> Option<JobHandle> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(&(project_id.to_string(), kind)).cloned()
    }

    pub fn any_active(&self, project_id: &str) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.keys().any(|(p, _)| p == project_id)
    }

    /// Signal cancellation to every active job of a project. Returns the ids signalled.
    pub fn cancel(&self, project_id: &str) -> Vec<JobId> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.iter()
            .filter(|((p, _), _)| p == project_id)
            .map(|(_, handle)| {
                handle.cancel.cancel();
                info!(project_id, job_id = %handle.job_id, "job cancellation requested");
                handle.job_id.clone()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_trigger_returns_existing_job() {
        let registry = JobRegistry::new();
        let first = registry.register("p", JobKind::Pages);
        let second = registry.register("p", JobKind::Pages);
        assert_eq!(first.status(), "started");
        assert_eq!(second.status(), "already_running");
        assert_eq!(first.handle().job_id, second.handle().job_id);
    }

    #[test]
    fn kinds_and_projects_are_independent() {
        let registry = JobRegistry::new();
        let pages = registry.register("p", JobKind::Pages);
        let disciplines = registry.register("p", JobKind::Disciplines);
        let other = registry.register("q", JobKind::Pages);
        assert!(matches!(disciplines, Registration::Started(_)));
        assert!(matches!(other, Registration::Started(_)));
        assert_ne!(pages.handle().job_id, disciplines.handle().job_id);
    }

    #[test]
    fn finish_ignores_stale_ids() {
        let registry = JobRegistry::new();
        let job = registry.register("p", JobKind::Pages).handle().clone();
        registry.finish("p", JobKind::Pages, &JobId::new());
        assert!(registry.active("p", JobKind::Pages).is_some());
        registry.finish("p", JobKind::Pages, &job.job_id);
        assert!(!registry.any_active("p"));
    }

    #[test]
    fn cancel_signals_tokens() {
        let registry = JobRegistry::new();
        let job = registry.register("p", JobKind::Pages).handle().clone();
        let cancelled = registry.cancel("p");
        assert_eq!(cancelled, vec![job.job_id.clone()]);
        assert!(job.cancel.is_cancelled());
        assert!(registry.cancel("q").is_empty());
    }
}
