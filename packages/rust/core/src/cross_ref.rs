//! Pass 2: cross-reference context for one page.

use std::sync::Arc;

use planindex_oracle::StructuredOracle;
use planindex_shared::{
    CURRENT_OUTPUT_VERSION, CrossRef, PageRecord, PageStatus, PageSummary, Pass1Output,
    Pass2Output, PlanIndexError, RefContext, Result,
};
use planindex_storage::Storage;
use serde::Deserialize;
use tracing::{debug, error, info, instrument};

use crate::normalize::normalize;
use crate::prompts;

#[derive(Debug, Deserialize)]
struct Pass2Response {
    #[serde(default)]
    outbound_refs_context: Vec<RefContext>,
}

#[derive(Clone)]
pub struct CrossReferenceAnnotator {
    storage: Arc<Storage>,
    oracle: StructuredOracle,
}

impl CrossReferenceAnnotator {
    pub fn new(storage: Arc<Storage>, oracle: StructuredOracle) -> Self {
        Self { storage, oracle }
    }

    /// Run Pass 2 on one page against the summaries of every page in the
    /// project (the page's own entry is skipped).
    #[instrument(skip_all, fields(page_id = %page.id))]
    pub async fn annotate(&self, page: &PageRecord, summaries: &[PageSummary]) -> Result<Pass2Output> {
        self.storage
            .transition_page(&page.id, PageStatus::Pass2Processing)
            .await?;

        match self.run(page, summaries).await {
            Ok(output) => {
                info!(refs = output.outbound_refs_context.len(), "pass 2 complete");
                Ok(output)
            }
            Err(e) => {
                error!(error = %e, "pass 2 failed");
                if let Err(mark) = self.storage.fail_page(&page.id, &e.to_string()).await {
                    error!(error = %mark, "failed to record pass 2 error");
                }
                Err(e)
            }
        }
    }

    async fn run(&self, page: &PageRecord, summaries: &[PageSummary]) -> Result<Pass2Output> {
        let pass1 = page
            .pass1_output
            .as_ref()
            .ok_or_else(|| PlanIndexError::validation("page has no pass 1 output"))?;

        let contexts = if pass1.outbound_refs().next().is_none() {
            debug!("no outbound references, skipping oracle call");
            Vec::new()
        } else {
            let others: Vec<PageSummary> = summaries
                .iter()
                .filter(|s| s.page_id != page.id)
                .cloned()
                .collect();
            let label = page.sheet_label();
            let title = page.page_title.clone().unwrap_or_else(|| label.clone());
            let prompt = prompts::pass2(&label, &title, pass1, &others);
            let response: Pass2Response = self
                .oracle
                .call_json(&prompt.full, &prompt.compact, None)
                .await?;
            response.outbound_refs_context
        };

        let output = Pass2Output {
            version: CURRENT_OUTPUT_VERSION,
            outbound_refs_context: align_contexts(pass1, contexts),
        };
        let cross_refs = cross_refs(&output);
        let updated_context = updated_context(page.summary(), &output);

        self.storage
            .complete_pass2(&page.id, &output, &cross_refs, &updated_context)
            .await?;
        Ok(output)
    }
}

/// One context per distinct Pass 1 reference, in Pass 1 order. Oracle
/// entries for references Pass 1 never found are discarded; references the
/// oracle skipped get an empty context.
pub fn align_contexts(pass1: &Pass1Output, returned: Vec<RefContext>) -> Vec<RefContext> {
    let mut aligned: Vec<RefContext> = Vec::new();
    for (_, reference) in pass1.outbound_refs() {
        if aligned.iter().any(|r| r.target == reference.target) {
            continue;
        }
        let key = normalize(&reference.target);
        let context = returned
            .iter()
            .find(|r| r.target == reference.target)
            .or_else(|| returned.iter().find(|r| normalize(&r.target) == key))
            .map(|r| r.context.trim().to_string())
            .unwrap_or_default();
        aligned.push(RefContext {
            target: reference.target.clone(),
            context,
        });
    }
    aligned
}

pub fn cross_refs(output: &Pass2Output) -> Vec<CrossRef> {
    output
        .outbound_refs_context
        .iter()
        .map(|r| CrossRef {
            target_sheet: r.target.clone(),
            relationship: r.context.clone(),
        })
        .collect()
}

/// The page summary followed by every non-empty reference context.
pub fn updated_context(summary: &str, output: &Pass2Output) -> String {
    let additions: Vec<String> = output
        .outbound_refs_context
        .iter()
        .filter(|r| !r.target.is_empty() && !r.context.is_empty())
        .map(|r| format!("Reference to {}: {}", r.target, r.context))
        .collect();
    if additions.is_empty() {
        summary.to_string()
    } else {
        format!("{summary} Cross-references: {}", additions.join("; "))
    }
}
