//! Runs the three passes for a project.
//!
//! One page run is a bounded sequence of rounds:
//!
//! 1. Pass 1 over every page still needing it, on a fixed-width worker pool
//! 2. reference resolution
//! 3. Pass 2, one page at a time, against a snapshot of all page summaries
//! 4. context propagation
//! 5. the orphan sweep: unfinished pages under their retry budget go back to
//!    `unprocessed` and the next round starts; the rest are permanently failed
//!
//! At most `max_page_retries + 1` rounds run. Discipline rollups happen once,
//! after the last round.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use planindex_oracle::StructuredOracle;
use planindex_shared::{
    DisciplineCode, JobId, PageRecord, PageStatus, PageSummary, ProcessingConfig, Result,
};
use planindex_storage::Storage;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::cross_ref::CrossReferenceAnnotator;
use crate::discipline::DisciplineAggregator;
use crate::page_analyzer::{PageAnalyzer, Pass1Result};
use crate::progress::{
    AggregationSummary, ProcessingSummary, ProgressBroadcaster, ProgressEvent, RunSummary,
    SweptPage,
};
use crate::propagate::ContextPropagator;
use crate::resolver::ReferenceResolver;

/// Outcome of one pass over a set of pages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassTally {
    pub completed: usize,
    pub errors: usize,
    pub disciplines: Vec<DisciplineCode>,
}

/// Outcome of the orphan sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sweep {
    pub requeued: usize,
    pub permanently_failed: usize,
}

pub struct Orchestrator {
    storage: Arc<Storage>,
    analyzer: PageAnalyzer,
    annotator: CrossReferenceAnnotator,
    aggregator: DisciplineAggregator,
    progress: Arc<ProgressBroadcaster>,
    config: ProcessingConfig,
}

impl Orchestrator {
    pub fn new(
        storage: Arc<Storage>,
        oracle: StructuredOracle,
        progress: Arc<ProgressBroadcaster>,
        config: ProcessingConfig,
    ) -> Self {
        Self {
            analyzer: PageAnalyzer::new(storage.clone(), oracle.clone()),
            annotator: CrossReferenceAnnotator::new(storage.clone(), oracle.clone()),
            aggregator: DisciplineAggregator::new(storage.clone(), oracle, progress.clone()),
            storage,
            progress,
            config,
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Full page run. Publishes `processing_complete` or `processing_error`.
    #[instrument(skip_all, fields(project_id = %project_id, job_id = %job_id))]
    pub async fn start_processing(
        &self,
        project_id: &str,
        job_id: &JobId,
        cancel: &CancellationToken,
    ) -> Result<ProcessingSummary> {
        let result = self.run_pages(project_id, job_id, cancel).await;
        self.finish(project_id, job_id, result.as_ref().map(|s| RunSummary::Pages(*s)));
        result
    }

    /// Discipline run: promote waiting disciplines whose pages are done, then
    /// aggregate every ready one.
    #[instrument(skip_all, fields(project_id = %project_id, job_id = %job_id))]
    pub async fn process_disciplines(
        &self,
        project_id: &str,
        job_id: &JobId,
    ) -> Result<AggregationSummary> {
        let result = async {
            self.storage.require_project(project_id).await?;
            self.aggregator.promote_waiting(project_id, job_id).await?;
            self.aggregator.aggregate_ready(project_id, job_id).await
        }
        .await;
        self.finish(
            project_id,
            job_id,
            result.as_ref().map(|s| RunSummary::Disciplines(*s)),
        );
        result
    }

    fn finish(
        &self,
        project_id: &str,
        job_id: &JobId,
        result: std::result::Result<RunSummary, &planindex_shared::PlanIndexError>,
    ) {
        let event = match result {
            Ok(summary) => ProgressEvent::ProcessingComplete { summary },
            Err(e) => {
                warn!(error = %e, "processing run failed");
                ProgressEvent::ProcessingError {
                    error: e.to_string(),
                }
            }
        };
        self.progress.publish(project_id, job_id, event);
    }

    async fn run_pages(
        &self,
        project_id: &str,
        job_id: &JobId,
        cancel: &CancellationToken,
    ) -> Result<ProcessingSummary> {
        self.storage.require_project(project_id).await?;
        let created = self.storage.materialize_pages(project_id).await?;
        info!(created, "pages materialized");

        let max_retries = self.config.max_page_retries;
        let mut summary = ProcessingSummary::default();

        for round in 0..=max_retries {
            summary.rounds = round + 1;

            let pass1 = self.run_pass1(project_id, job_id, cancel, round).await?;
            summary.pass1_completed += pass1.completed;
            summary.pass1_errors += pass1.errors;
            ReferenceResolver::new(&self.storage).run(project_id).await?;
            if cancel.is_cancelled() {
                info!(round, "run cancelled after pass 1");
                return Ok(summary);
            }

            let pass2 = self.run_pass2(project_id, job_id, cancel).await?;
            summary.pass2_completed += pass2.completed;
            summary.pass2_errors += pass2.errors;
            ContextPropagator::new(&self.storage).run(project_id).await?;
            if cancel.is_cancelled() {
                info!(round, "run cancelled after pass 2");
                return Ok(summary);
            }

            let sweep = self.sweep(project_id, job_id, round < max_retries).await?;
            summary.permanently_failed = sweep.permanently_failed;
            if sweep.requeued == 0 {
                break;
            }
            info!(round, requeued = sweep.requeued, "retrying orphaned pages");
        }

        self.aggregator.promote_waiting(project_id, job_id).await?;
        let disciplines = self.aggregator.aggregate_ready(project_id, job_id).await?;
        summary.disciplines_completed = disciplines.disciplines_completed;

        info!(
            pass1_completed = summary.pass1_completed,
            pass2_completed = summary.pass2_completed,
            permanently_failed = summary.permanently_failed,
            rounds = summary.rounds,
            "page processing complete"
        );
        Ok(summary)
    }

    /// Pass 1 on the worker pool. Cancellation stops new launches; pages
    /// already running finish.
    async fn run_pass1(
        &self,
        project_id: &str,
        job_id: &JobId,
        cancel: &CancellationToken,
        round: u32,
    ) -> Result<PassTally> {
        let max_retries = self.config.max_page_retries;
        let pages: Vec<PageRecord> = self
            .storage
            .list_pages_in(project_id, &PageStatus::PASS1_CANDIDATES)
            .await?
            .into_iter()
            .filter(|p| !(p.processing_status == PageStatus::Error && p.retry_count >= max_retries))
            .collect();
        let total = pages.len();
        let started = if round == 0 {
            ProgressEvent::ProcessingStarted {
                pass1_total: total,
                round,
            }
        } else {
            ProgressEvent::RetryRoundStarted {
                pass1_total: total,
                round,
            }
        };
        self.progress.publish(project_id, job_id, started);

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let finished = Arc::new(AtomicUsize::new(0));
        let mut tasks: JoinSet<Result<Pass1Result>> = JoinSet::new();

        for page in pages {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("cancellation requested, no further pages launched");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let analyzer = self.analyzer.clone();
            let progress = self.progress.clone();
            let finished = finished.clone();
            let project_id = project_id.to_string();
            let job_id = job_id.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = analyzer.analyze(&page.id).await;
                let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                let event = match &result {
                    Ok(r) => ProgressEvent::PagePass1Complete {
                        page_id: r.page_id.clone(),
                        sheet_number: r.sheet_number.clone(),
                        discipline: r.discipline,
                        pass1_progress: done,
                        pass1_total: total,
                    },
                    Err(e) => ProgressEvent::PageError {
                        page_id: page.id.clone(),
                        pass: 1,
                        error: e.to_string(),
                    },
                };
                progress.publish(&project_id, &job_id, event);
                result
            });
        }

        let mut tally = PassTally::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(result)) => {
                    tally.completed += 1;
                    if !tally.disciplines.contains(&result.discipline) {
                        tally.disciplines.push(result.discipline);
                    }
                }
                Ok(Err(_)) => tally.errors += 1,
                Err(e) => {
                    warn!(error = %e, "pass 1 task aborted");
                    tally.errors += 1;
                }
            }
        }

        tally.disciplines.sort_by_key(|c| c.code());
        // Pages checkpointed by an earlier, interrupted run count too.
        let mut disciplines = self.storage.analyzed_discipline_codes(project_id).await?;
        for code in &tally.disciplines {
            if !disciplines.contains(code) {
                disciplines.push(*code);
            }
        }
        self.storage
            .ensure_disciplines(project_id, &disciplines)
            .await?;
        info!(completed = tally.completed, errors = tally.errors, "pass 1 finished");
        self.progress.publish(
            project_id,
            job_id,
            ProgressEvent::Pass1Complete {
                completed: tally.completed,
                errors: tally.errors,
                disciplines: tally.disciplines.clone(),
            },
        );
        Ok(tally)
    }

    /// Pass 2, sequentially, against one snapshot of page summaries.
    async fn run_pass2(
        &self,
        project_id: &str,
        job_id: &JobId,
        cancel: &CancellationToken,
    ) -> Result<PassTally> {
        let pages = self
            .storage
            .list_pages_in(project_id, &PageStatus::PASS2_CANDIDATES)
            .await?;
        let summaries: Vec<PageSummary> = self
            .storage
            .list_pages_in(project_id, &PageStatus::HAS_PASS1_OUTPUT)
            .await?
            .iter()
            .map(|p| PageSummary {
                page_id: p.id.clone(),
                sheet_number: p.sheet_label(),
                summary: p.summary().to_string(),
            })
            .collect();

        let total = pages.len();
        let mut tally = PassTally::default();
        for (i, page) in pages.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("cancellation requested, stopping pass 2");
                break;
            }
            match self.annotator.annotate(page, &summaries).await {
                Ok(_) => {
                    tally.completed += 1;
                    self.progress.publish(
                        project_id,
                        job_id,
                        ProgressEvent::PagePass2Complete {
                            page_id: page.id.clone(),
                            sheet_number: page.sheet_label(),
                            pass2_progress: i + 1,
                            pass2_total: total,
                        },
                    );
                    if let Some(code) = page.discipline_code {
                        if let Err(e) = self.aggregator.check_ready(project_id, job_id, code).await {
                            warn!(discipline = code.code(), error = %e, "readiness check failed");
                        }
                    }
                }
                Err(e) => {
                    tally.errors += 1;
                    self.progress.publish(
                        project_id,
                        job_id,
                        ProgressEvent::PageError {
                            page_id: page.id.clone(),
                            pass: 2,
                            error: e.to_string(),
                        },
                    );
                }
            }
        }

        info!(completed = tally.completed, errors = tally.errors, "pass 2 finished");
        self.progress.publish(
            project_id,
            job_id,
            ProgressEvent::Pass2Complete {
                completed: tally.completed,
                errors: tally.errors,
            },
        );
        Ok(tally)
    }

    /// Requeue unfinished pages under budget; everything else is permanently
    /// failed. With `allow_requeue` false every unfinished page is. Both
    /// lists are published as one `orphans_swept` event.
    async fn sweep(&self, project_id: &str, job_id: &JobId, allow_requeue: bool) -> Result<Sweep> {
        let unfinished: Vec<PageRecord> = self
            .storage
            .list_pages(project_id)
            .await?
            .into_iter()
            .filter(|p| p.processing_status != PageStatus::Pass2Complete)
            .collect();

        let mut requeued = Vec::new();
        let mut failed = Vec::new();
        for page in unfinished {
            if allow_requeue && page.retry_count < self.config.max_page_retries {
                let retries = self.storage.requeue_page(&page.id).await?;
                info!(page_id = %page.id, retries, "orphaned page requeued");
                requeued.push(SweptPage {
                    page_id: page.id.clone(),
                    sheet_number: page.sheet_label(),
                    retry_count: retries,
                });
                continue;
            }

            if matches!(
                page.processing_status,
                PageStatus::Pass1Processing | PageStatus::Pass2Processing
            ) {
                self.storage
                    .fail_page(&page.id, "retry budget exhausted")
                    .await?;
            }
            warn!(
                page_id = %page.id,
                status = %page.processing_status,
                retries = page.retry_count,
                "page permanently failed"
            );
            failed.push(SweptPage {
                page_id: page.id.clone(),
                sheet_number: page.sheet_label(),
                retry_count: page.retry_count,
            });
        }

        let sweep = Sweep {
            requeued: requeued.len(),
            permanently_failed: failed.len(),
        };
        if !requeued.is_empty() || !failed.is_empty() {
            self.progress.publish(
                project_id,
                job_id,
                ProgressEvent::OrphansSwept {
                    requeued,
                    permanently_failed: failed,
                },
            );
        }
        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::progress::StreamItem;
    use crate::test_support::*;
    use planindex_shared::{DisciplineStatus, OracleError};

    #[tokio::test]
    async fn end_to_end_two_disciplines() {
        let fixture = Fixture::new().await;
        let a = fixture.page("A-101 Floor Plan.pdf", 1).await;
        let m = fixture.page("M-201 HVAC.pdf", 1).await;
        fixture.oracle.respond_with(scripted_plan_set);

        let job = JobId::new();
        let mut sub = fixture.progress.subscribe(&fixture.project_id);
        let summary = fixture
            .orchestrator()
            .start_processing(&fixture.project_id, &job, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.pass1_completed, 2);
        assert_eq!(summary.pass2_completed, 2);
        assert_eq!(summary.permanently_failed, 0);
        assert_eq!(summary.disciplines_completed, 2);
        assert_eq!(summary.rounds, 1);

        let page_a = fixture.storage.get_page(&a).await.unwrap();
        assert_eq!(page_a.processing_status, PageStatus::Pass2Complete);
        let page_m = fixture.storage.get_page(&m).await.unwrap();
        assert_eq!(page_m.processing_status, PageStatus::Pass2Complete);
        assert_eq!(page_m.inbound_references.len(), 1);
        assert_eq!(page_m.inbound_references[0].source_sheet, "A-101");
        assert_eq!(
            page_m.inbound_references[0].context.as_deref(),
            Some("Level 2 ductwork layout")
        );

        for code in [DisciplineCode::Architectural, DisciplineCode::Mechanical] {
            let d = fixture
                .storage
                .get_discipline(&fixture.project_id, code)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(d.processing_status, DisciplineStatus::Complete);
        }

        let names = drain_names(&mut sub).await;
        assert_eq!(names.first().map(String::as_str), Some("processing_started"));
        assert_eq!(names.last().map(String::as_str), Some("processing_complete"));
        assert_eq!(names.iter().filter(|n| *n == "discipline_ready").count(), 2);
        assert_eq!(names.iter().filter(|n| *n == "discipline_complete").count(), 2);

        // A second run finds nothing to do and never re-emits readiness.
        let mut sub = fixture.progress.subscribe(&fixture.project_id);
        let again = fixture
            .orchestrator()
            .start_processing(&fixture.project_id, &JobId::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.pass1_completed, 0);
        assert_eq!(again.disciplines_completed, 0);
        let names = drain_names(&mut sub).await;
        assert!(!names.contains(&"discipline_ready".to_string()));
    }

    #[tokio::test]
    async fn orphaned_page_converges_to_permanent_failure() {
        let fixture = Fixture::with_config(ProcessingConfig {
            concurrency: 2,
            max_page_retries: 2,
        })
        .await;
        let page_id = fixture.page("A-101 Plan.pdf", 1).await;
        fixture
            .storage
            .transition_page(&page_id, PageStatus::Pass1Processing)
            .await
            .unwrap();
        fixture.oracle.respond_with(|_| {
            Err(OracleError::Rejected {
                status: 400,
                message: "unsupported".into(),
            })
        });

        let mut sub = fixture.progress.subscribe(&fixture.project_id);
        let summary = fixture
            .orchestrator()
            .start_processing(&fixture.project_id, &JobId::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.rounds, 3);
        assert_eq!(summary.pass1_errors, 3);
        assert_eq!(summary.permanently_failed, 1);
        assert_eq!(fixture.oracle.prompts().len(), 3);

        let page = fixture.storage.get_page(&page_id).await.unwrap();
        assert_eq!(page.processing_status, PageStatus::Error);
        assert_eq!(page.retry_count, 2);

        let mut sweeps = Vec::new();
        while let Some(item) = sub.next().await {
            match item {
                StreamItem::Event(update) => {
                    if let ProgressEvent::OrphansSwept {
                        requeued,
                        permanently_failed,
                    } = update.event
                    {
                        sweeps.push((requeued, permanently_failed));
                    }
                }
                StreamItem::Connected => {}
                StreamItem::KeepAlive => break,
            }
        }
        assert_eq!(sweeps.len(), 3);
        assert_eq!(sweeps[0].0[0].retry_count, 1);
        assert_eq!(sweeps[1].0[0].retry_count, 2);
        let (requeued, failed) = &sweeps[2];
        assert!(requeued.is_empty());
        assert_eq!(
            failed,
            &vec![SweptPage {
                page_id: page_id.clone(),
                sheet_number: page.sheet_label(),
                retry_count: 2,
            }]
        );

        // At budget the page stays failed on later runs.
        let summary = fixture
            .orchestrator()
            .start_processing(&fixture.project_id, &JobId::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.pass1_errors, 0);
        assert_eq!(summary.permanently_failed, 1);
        assert_eq!(fixture.oracle.prompts().len(), 3);
    }

    #[tokio::test]
    async fn transient_orphan_recovers_on_retry() {
        let fixture = Fixture::new().await;
        let page_id = fixture.page("M-201 HVAC.pdf", 1).await;
        fixture.oracle.push_err(OracleError::Rejected {
            status: 422,
            message: "flaky".into(),
        });
        fixture.oracle.respond_with(scripted_plan_set);

        let mut sub = fixture.progress.subscribe(&fixture.project_id);
        let summary = fixture
            .orchestrator()
            .start_processing(&fixture.project_id, &JobId::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.rounds, 2);
        assert_eq!(summary.permanently_failed, 0);
        let page = fixture.storage.get_page(&page_id).await.unwrap();
        assert_eq!(page.processing_status, PageStatus::Pass2Complete);
        assert_eq!(page.retry_count, 1);

        let names = drain_names(&mut sub).await;
        let count = |name: &str| names.iter().filter(|n| *n == name).count();
        assert_eq!(count("processing_started"), 1);
        assert_eq!(count("retry_round_started"), 1);
        assert_eq!(count("orphans_swept"), 1);
        assert_eq!(names.first().map(String::as_str), Some("processing_started"));
    }

    #[tokio::test]
    async fn discipline_rows_recovered_from_pass1_checkpoints() {
        let fixture = Fixture::new().await;
        let page_id = fixture.page("M-201 HVAC.pdf", 1).await;
        // Pass 1 landed but the run died before creating the discipline row.
        fixture
            .storage
            .transition_page(&page_id, PageStatus::Pass1Processing)
            .await
            .unwrap();
        fixture
            .storage
            .complete_pass1(&page_id, &pass1("M", &[]), Some("M-201"))
            .await
            .unwrap();
        assert!(
            fixture
                .storage
                .get_discipline(&fixture.project_id, DisciplineCode::Mechanical)
                .await
                .unwrap()
                .is_none()
        );
        fixture.oracle.respond_with(scripted_plan_set);

        let summary = fixture
            .orchestrator()
            .start_processing(&fixture.project_id, &JobId::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.pass1_completed, 0);
        assert_eq!(summary.pass2_completed, 1);
        assert_eq!(summary.disciplines_completed, 1);

        let discipline = fixture
            .storage
            .get_discipline(&fixture.project_id, DisciplineCode::Mechanical)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(discipline.processing_status, DisciplineStatus::Complete);
    }

    #[tokio::test]
    async fn pass1_pool_never_exceeds_concurrency() {
        let fixture = Fixture::with_config(ProcessingConfig {
            concurrency: 2,
            max_page_retries: 0,
        })
        .await;
        let mut pages = Vec::new();
        for i in 1..=6 {
            pages.push(fixture.page(&format!("G-00{i} Notes.pdf"), 1).await);
        }
        fixture.oracle.set_latency(Duration::from_millis(20));
        fixture.oracle.respond_with(scripted_plan_set);

        let summary = fixture
            .orchestrator()
            .start_processing(&fixture.project_id, &JobId::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fixture.oracle.peak_in_flight(), 2);
        assert_eq!(summary.pass1_completed, 6);
        assert_eq!(summary.pass2_completed, 6);
        assert_eq!(summary.rounds, 1);
        for page_id in &pages {
            let page = fixture.storage.get_page(page_id).await.unwrap();
            assert_eq!(page.processing_status, PageStatus::Pass2Complete);
        }
    }

    #[tokio::test]
    async fn cancelled_run_launches_nothing() {
        let fixture = Fixture::new().await;
        let page_id = fixture.page("A-101 Plan.pdf", 1).await;
        fixture.oracle.respond_with(scripted_plan_set);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = fixture
            .orchestrator()
            .start_processing(&fixture.project_id, &JobId::new(), &cancel)
            .await
            .unwrap();
        assert_eq!(summary.pass1_completed, 0);
        assert!(fixture.oracle.prompts().is_empty());
        let page = fixture.storage.get_page(&page_id).await.unwrap();
        assert_eq!(page.processing_status, PageStatus::Unprocessed);
    }

    #[tokio::test]
    async fn missing_project_publishes_processing_error() {
        let fixture = Fixture::new().await;
        let mut sub = fixture.progress.subscribe("no-such-project");
        let result = fixture
            .orchestrator()
            .start_processing("no-such-project", &JobId::new(), &CancellationToken::new())
            .await;
        assert!(result.is_err());
        let names = drain_names(&mut sub).await;
        assert_eq!(names, vec!["processing_error".to_string()]);
    }
}
