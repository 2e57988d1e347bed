//! Pass 1: per-page analysis.

use std::sync::Arc;

use planindex_oracle::StructuredOracle;
use planindex_shared::{
    AnnotationAnalysis, CURRENT_OUTPUT_VERSION, DisciplineCode, PageStatus, Pass1Output, Result,
    sheet_number_from_filename,
};
use planindex_storage::Storage;
use serde::Deserialize;
use tracing::{error, info, instrument};

use crate::prompts;

/// What the oracle returns for Pass 1. The discipline stays a string so an
/// unknown code degrades to General instead of failing the page.
#[derive(Debug, Deserialize)]
struct Pass1Response {
    #[serde(default)]
    discipline: Option<String>,
    #[serde(default)]
    sheet_number: Option<String>,
    #[serde(default)]
    summary: String,
    #[serde(default, alias = "annotations")]
    pointers: Vec<AnnotationAnalysis>,
}

/// A page that finished Pass 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Pass1Result {
    pub page_id: String,
    pub sheet_number: String,
    pub discipline: DisciplineCode,
}

#[derive(Clone)]
pub struct PageAnalyzer {
    storage: Arc<Storage>,
    oracle: StructuredOracle,
}

impl PageAnalyzer {
    pub fn new(storage: Arc<Storage>, oracle: StructuredOracle) -> Self {
        Self { storage, oracle }
    }

    /// Run Pass 1 on one page. On failure the page is left in `error` with
    /// the message, and the error is returned to the caller.
    #[instrument(skip_all, fields(page_id = %page_id))]
    pub async fn analyze(&self, page_id: &str) -> Result<Pass1Result> {
        let page = self.storage.get_page(page_id).await?;
        self.storage
            .transition_page(page_id, PageStatus::Pass1Processing)
            .await?;

        match self.run(&page).await {
            Ok(result) => {
                info!(
                    sheet = %result.sheet_number,
                    discipline = result.discipline.code(),
                    "pass 1 complete"
                );
                Ok(result)
            }
            Err(e) => {
                error!(error = %e, "pass 1 failed");
                if let Err(mark) = self.storage.fail_page(page_id, &e.to_string()).await {
                    error!(error = %mark, "failed to record pass 1 error");
                }
                Err(e)
            }
        }
    }

    async fn run(&self, page: &planindex_shared::PageRecord) -> Result<Pass1Result> {
        let annotations = self
            .storage
            .annotations_for_page(&page.document_id, page.page_number)
            .await?;

        let label = page.sheet_label();
        let title = page.page_title.clone().unwrap_or_else(|| label.clone());
        let prompt = prompts::pass1(&label, &title, &annotations);

        let response: Pass1Response = self
            .oracle
            .call_json(&prompt.full, &prompt.compact, None)
            .await?;

        let discipline = response
            .discipline
            .as_deref()
            .map(DisciplineCode::from_code_or_general)
            .unwrap_or_default();

        let sheet_number = response
            .sheet_number
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| page.page_title.as_deref().and_then(sheet_number_from_filename));

        let output = Pass1Output {
            version: CURRENT_OUTPUT_VERSION,
            discipline,
            sheet_number: sheet_number.clone(),
            summary: response.summary,
            annotations: response.pointers,
        };

        self.storage
            .complete_pass1(&page.id, &output, sheet_number.as_deref())
            .await?;

        Ok(Pass1Result {
            page_id: page.id.clone(),
            sheet_number: sheet_number.unwrap_or(label),
            discipline,
        })
    }
}
