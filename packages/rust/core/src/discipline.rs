//! Pass 3: discipline readiness and rollup.

use std::sync::Arc;

use planindex_oracle::StructuredOracle;
use planindex_shared::{
    DisciplineCode, DisciplineConnection, DisciplineRecord, DisciplineRollup, DisciplineStatus,
    JobId, KeyContent, PageRecord, PageStatus, PlanIndexError, Result,
};
use planindex_storage::Storage;
use serde::Deserialize;
use tracing::{error, info, instrument, warn};

use crate::normalize::normalize;
use crate::progress::{AggregationSummary, ProgressBroadcaster, ProgressEvent};
use crate::prompts::{self, RollupPage};

#[derive(Debug, Deserialize)]
struct Pass3Response {
    #[serde(default)]
    context: String,
    #[serde(default)]
    key_contents: Vec<KeyContent>,
    #[serde(default)]
    connections: Vec<DisciplineConnection>,
}

#[derive(Clone)]
pub struct DisciplineAggregator {
    storage: Arc<Storage>,
    oracle: StructuredOracle,
    progress: Arc<ProgressBroadcaster>,
}

impl DisciplineAggregator {
    pub fn new(
        storage: Arc<Storage>,
        oracle: StructuredOracle,
        progress: Arc<ProgressBroadcaster>,
    ) -> Self {
        Self {
            storage,
            oracle,
            progress,
        }
    }

    /// Promote `code` to `ready` if all its pages are `pass2_complete`.
    /// Emits `discipline_ready` only on the call that performs the promotion.
    pub async fn check_ready(
        &self,
        project_id: &str,
        job_id: &JobId,
        code: DisciplineCode,
    ) -> Result<bool> {
        let promoted = self.storage.mark_discipline_ready(project_id, code).await?;
        if promoted {
            info!(project_id, discipline = code.code(), "discipline ready");
            self.progress.publish(
                project_id,
                job_id,
                ProgressEvent::DisciplineReady {
                    discipline_code: code,
                    discipline_name: code.name().to_string(),
                },
            );
        }
        Ok(promoted)
    }

    /// Check every `waiting` discipline of the project. Returns the codes promoted.
    pub async fn promote_waiting(&self, project_id: &str, job_id: &JobId) -> Result<Vec<DisciplineCode>> {
        let waiting = self
            .storage
            .list_disciplines_in(project_id, &[DisciplineStatus::Waiting])
            .await?;
        let mut promoted = Vec::new();
        for discipline in waiting {
            if self.check_ready(project_id, job_id, discipline.code).await? {
                promoted.push(discipline.code);
            }
        }
        Ok(promoted)
    }

    /// Aggregate every `ready` discipline, one at a time. A failed discipline
    /// is left in `error` and reported; the rest still run.
    #[instrument(skip_all, fields(project_id = %project_id))]
    pub async fn aggregate_ready(&self, project_id: &str, job_id: &JobId) -> Result<AggregationSummary> {
        let ready = self
            .storage
            .list_disciplines_in(project_id, &[DisciplineStatus::Ready])
            .await?;
        let mut summary = AggregationSummary {
            disciplines_ready: ready.len(),
            ..Default::default()
        };

        for discipline in ready {
            match self.aggregate(project_id, job_id, &discipline).await {
                Ok(_) => summary.disciplines_completed += 1,
                Err(e) => {
                    summary.disciplines_failed += 1;
                    self.progress.publish(
                        project_id,
                        job_id,
                        ProgressEvent::DisciplineError {
                            discipline_code: discipline.code,
                            pass: 3,
                            error: e.to_string(),
                        },
                    );
                }
            }
        }
        Ok(summary)
    }

    /// Roll one `ready` discipline up into its context description.
    #[instrument(skip_all, fields(discipline = discipline.code.code()))]
    pub async fn aggregate(
        &self,
        project_id: &str,
        job_id: &JobId,
        discipline: &DisciplineRecord,
    ) -> Result<DisciplineRollup> {
        self.storage
            .transition_discipline(&discipline.id, DisciplineStatus::Processing)
            .await?;

        match self.run(project_id, discipline).await {
            Ok((rollup, page_count)) => {
                info!(
                    pages = page_count,
                    key_contents = rollup.key_contents.len(),
                    "pass 3 complete"
                );
                self.progress.publish(
                    project_id,
                    job_id,
                    ProgressEvent::DisciplineComplete {
                        discipline_code: discipline.code,
                        discipline_name: discipline.name.clone(),
                        page_count,
                        key_contents_count: rollup.key_contents.len(),
                    },
                );
                Ok(rollup)
            }
            Err(e) => {
                error!(error = %e, "pass 3 failed");
                if let Err(mark) = self
                    .storage
                    .transition_discipline(&discipline.id, DisciplineStatus::Error)
                    .await
                {
                    error!(error = %mark, "failed to record pass 3 error");
                }
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        project_id: &str,
        discipline: &DisciplineRecord,
    ) -> Result<(DisciplineRollup, usize)> {
        let pages: Vec<PageRecord> = self
            .storage
            .pages_for_discipline(project_id, discipline.code)
            .await?
            .into_iter()
            .filter(|p| p.processing_status == PageStatus::Pass2Complete)
            .collect();
        if pages.is_empty() {
            return Err(PlanIndexError::validation(format!(
                "discipline {} has no completed pages",
                discipline.code.code()
            )));
        }

        let rollup_pages: Vec<RollupPage> = pages.iter().map(rollup_page).collect();
        let prompt = prompts::pass3(discipline.code, &rollup_pages);
        let response: Pass3Response = self
            .oracle
            .call_json(&prompt.full, &prompt.compact, None)
            .await?;

        let sheets: Vec<String> = rollup_pages.iter().map(|p| p.sheet_number.clone()).collect();
        let rollup = DisciplineRollup {
            context: response.context,
            key_contents: response
                .key_contents
                .into_iter()
                .map(|item| canonical_sheet(item, &sheets))
                .collect(),
            connections: response.connections,
        };

        let page_ids: Vec<String> = pages.iter().map(|p| p.id.clone()).collect();
        self.storage
            .complete_discipline(&discipline.id, &rollup, &page_ids)
            .await?;
        Ok((rollup, pages.len()))
    }
}

fn rollup_page(page: &PageRecord) -> RollupPage {
    let label = page.sheet_label();
    RollupPage {
        page_title: page.page_title.clone().unwrap_or_else(|| label.clone()),
        sheet_number: label,
        context: page
            .updated_context
            .clone()
            .unwrap_or_else(|| page.summary().to_string()),
        cross_refs: page.cross_refs.clone(),
    }
}

/// Rewrite a key content's sheet to the member sheet it names, so `"A101"`
/// and `"a-101"` both come back as `"A-101"`. Unknown sheets are kept.
fn canonical_sheet(mut item: KeyContent, sheets: &[String]) -> KeyContent {
    if item.sheet.is_empty() {
        if let [only] = sheets {
            item.sheet = only.clone();
        }
        return item;
    }
    let key = normalize(&item.sheet);
    match sheets.iter().find(|s| normalize(s) == key) {
        Some(sheet) => item.sheet = sheet.clone(),
        None => warn!(sheet = %item.sheet, item = %item.item, "key content names an unknown sheet"),
    }
    item
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[test]
    fn key_content_sheets_are_canonicalized() {
        let sheets = vec!["A-101".to_string(), "A-501".to_string()];
        let item = |sheet: &str| KeyContent {
            item: "Door schedule".into(),
            kind: "schedule".into(),
            sheet: sheet.into(),
        };
        assert_eq!(canonical_sheet(item("a501"), &sheets).sheet, "A-501");
        assert_eq!(canonical_sheet(item("Z-1"), &sheets).sheet, "Z-1");
        assert_eq!(canonical_sheet(item(""), &sheets).sheet, "");
        assert_eq!(canonical_sheet(item(""), &sheets[..1]).sheet, "A-101");
    }

    #[tokio::test]
    async fn ready_fires_once_and_aggregates() {
        let fixture = Fixture::new().await;
        let page_id = fixture.completed_page("A101 Plan.pdf", "A").await;
        let job = JobId::new();
        let aggregator = fixture.aggregator();
        let mut sub = fixture.progress.subscribe(&fixture.project_id);

        assert!(
            aggregator
                .check_ready(&fixture.project_id, &job, DisciplineCode::Architectural)
                .await
                .unwrap()
        );
        assert!(
            !aggregator
                .check_ready(&fixture.project_id, &job, DisciplineCode::Architectural)
                .await
                .unwrap()
        );
        assert!(aggregator.promote_waiting(&fixture.project_id, &job).await.unwrap().is_empty());

        fixture.oracle.push_ok(
            r#"{"context": "Architectural floor plans.",
                "key_contents": [{"item": "Door schedule", "type": "schedule", "sheet": "a101"}],
                "connections": [{"discipline": "M", "relationship": "ceiling coordination"}]}"#,
        );
        let summary = aggregator.aggregate_ready(&fixture.project_id, &job).await.unwrap();
        assert_eq!(summary.disciplines_completed, 1);

        let discipline = fixture
            .storage
            .get_discipline(&fixture.project_id, DisciplineCode::Architectural)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(discipline.processing_status, DisciplineStatus::Complete);
        assert_eq!(discipline.key_contents[0].sheet, "A101");
        let page = fixture.storage.get_page(&page_id).await.unwrap();
        assert_eq!(page.discipline_id.as_deref(), Some(discipline.id.as_str()));

        let names = drain_names(&mut sub).await;
        assert_eq!(
            names.iter().filter(|n| *n == "discipline_ready").count(),
            1
        );
        assert!(names.contains(&"discipline_complete".to_string()));
    }

    #[tokio::test]
    async fn failed_rollup_leaves_error() {
        let fixture = Fixture::new().await;
        fixture.completed_page("M201 HVAC.pdf", "M").await;
        let job = JobId::new();
        let aggregator = fixture.aggregator();
        aggregator.promote_waiting(&fixture.project_id, &job).await.unwrap();

        fixture.oracle.push_err(planindex_shared::OracleError::Rejected {
            status: 403,
            message: "forbidden".into(),
        });
        let summary = aggregator.aggregate_ready(&fixture.project_id, &job).await.unwrap();
        assert_eq!(summary.disciplines_failed, 1);

        let discipline = fixture
            .storage
            .get_discipline(&fixture.project_id, DisciplineCode::Mechanical)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(discipline.processing_status, DisciplineStatus::Error);
    }
}
