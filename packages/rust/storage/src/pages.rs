//! Page rows: materialization, conditional status transitions, and the
//! per-pass checkpoint writes.

use chrono::Utc;
use libsql::params;
use planindex_shared::{
    CrossRef, DisciplineCode, InboundReference, PageRecord, PageStatus, Pass1Output, Pass2Output,
    PlanIndexError, Result, sheet_number_from_filename, title_from_filename,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{Storage, db_err, from_json_opt, in_list, parse_timestamp, to_json};

const PAGE_COLUMNS: &str = "id, project_id, document_id, page_number, page_title, sheet_number, \
     discipline_code, discipline_id, processing_status, context_description, pass1_output, \
     inbound_references, pass2_output, cross_refs, updated_context, retry_count, error_message, \
     updated_at";

/// A (document, page) pair carrying at least one annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedPage {
    pub document_id: String,
    pub document_name: String,
    pub page_number: u32,
}

/// Raw page counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageCounts {
    pub unprocessed: u64,
    pub pass1_processing: u64,
    pub pass1_complete: u64,
    pub pass2_processing: u64,
    pub pass2_complete: u64,
    pub error: u64,
}

impl PageCounts {
    pub fn total(&self) -> u64 {
        self.unprocessed
            + self.pass1_processing
            + self.pass1_complete
            + self.pass2_processing
            + self.pass2_complete
            + self.error
    }

    fn add(&mut self, status: PageStatus, n: u64) {
        let slot = match status {
            PageStatus::Unprocessed => &mut self.unprocessed,
            PageStatus::Pass1Processing => &mut self.pass1_processing,
            PageStatus::Pass1Complete => &mut self.pass1_complete,
            PageStatus::Pass2Processing => &mut self.pass2_processing,
            PageStatus::Pass2Complete => &mut self.pass2_complete,
            PageStatus::Error => &mut self.error,
        };
        *slot += n;
    }
}

/// Rows touched by an administrative reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetCounts {
    pub pages_reset: u64,
    pub disciplines_reset: u64,
}

impl Storage {
    // -----------------------------------------------------------------------
    // Materialization
    // -----------------------------------------------------------------------

    /// Distinct annotated pages of a project.
    pub async fn annotated_pages(&self, project_id: &str) -> Result<Vec<AnnotatedPage>> {
        let mut rows = self
            .conn
            .query(
                "SELECT DISTINCT a.document_id, d.name, a.page_number
                 FROM annotations a JOIN documents d ON d.id = a.document_id
                 WHERE d.project_id = ?1
                 ORDER BY d.name, a.page_number",
                params![project_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(AnnotatedPage {
                document_id: row.get::<String>(0).map_err(db_err)?,
                document_name: row.get::<String>(1).map_err(db_err)?,
                page_number: row.get::<i64>(2).map_err(db_err)? as u32,
            });
        }
        Ok(results)
    }

    /// Create page rows for every annotated page that lacks one, and back-fill
    /// missing titles and sheet numbers from the document name. Returns the
    /// number of rows created.
    pub async fn materialize_pages(&self, project_id: &str) -> Result<usize> {
        let annotated = self.annotated_pages(project_id).await?;
        if annotated.is_empty() {
            return Ok(0);
        }

        let _guard = self.writer().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;
        let now = Utc::now().to_rfc3339();
        let mut created = 0;

        for page in &annotated {
            let title = title_from_filename(&page.document_name);
            let sheet = sheet_number_from_filename(&page.document_name);

            let inserted = tx
                .execute(
                    "INSERT INTO pages (id, project_id, document_id, page_number, page_title, sheet_number, processing_status, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'unprocessed', ?7)
                     ON CONFLICT(document_id, page_number) DO NOTHING",
                    params![
                        Uuid::now_v7().to_string(),
                        project_id,
                        page.document_id.as_str(),
                        i64::from(page.page_number),
                        title.as_str(),
                        sheet.as_deref(),
                        now.as_str(),
                    ],
                )
                .await
                .map_err(db_err)?;

            if inserted == 0 {
                tx.execute(
                    "UPDATE pages SET
                       page_title = COALESCE(page_title, ?1),
                       sheet_number = COALESCE(sheet_number, ?2)
                     WHERE document_id = ?3 AND page_number = ?4",
                    params![
                        title.as_str(),
                        sheet.as_deref(),
                        page.document_id.as_str(),
                        i64::from(page.page_number),
                    ],
                )
                .await
                .map_err(db_err)?;
            } else {
                created += 1;
            }
        }

        tx.commit().await.map_err(db_err)?;

        if created > 0 {
            tracing::info!(project_id, created, "materialized page rows");
        }
        Ok(created)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Get a page by ID, failing with `NotFound` when it is missing.
    pub async fn get_page(&self, page_id: &str) -> Result<PageRecord> {
        let sql = format!("SELECT {PAGE_COLUMNS} FROM pages WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![page_id])
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => row_to_page(&row),
            None => Err(PlanIndexError::not_found("page", page_id)),
        }
    }

    /// All pages of a project, sheet order.
    pub async fn list_pages(&self, project_id: &str) -> Result<Vec<PageRecord>> {
        let sql = format!(
            "SELECT {PAGE_COLUMNS} FROM pages WHERE project_id = ?1
             ORDER BY sheet_number IS NULL, sheet_number, page_number, id"
        );
        self.query_pages(&sql, params![project_id]).await
    }

    /// Pages of a project whose status is one of `statuses`.
    pub async fn list_pages_in(
        &self,
        project_id: &str,
        statuses: &[PageStatus],
    ) -> Result<Vec<PageRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {PAGE_COLUMNS} FROM pages
             WHERE project_id = ?1 AND processing_status IN ({})
             ORDER BY sheet_number IS NULL, sheet_number, page_number, id",
            in_list(statuses.iter().map(|s| s.as_str()))
        );
        self.query_pages(&sql, params![project_id]).await
    }

    /// Pages currently assigned to a discipline.
    pub async fn pages_for_discipline(
        &self,
        project_id: &str,
        code: DisciplineCode,
    ) -> Result<Vec<PageRecord>> {
        let sql = format!(
            "SELECT {PAGE_COLUMNS} FROM pages
             WHERE project_id = ?1 AND discipline_code = ?2
             ORDER BY sheet_number IS NULL, sheet_number, page_number, id"
        );
        self.query_pages(&sql, params![project_id, code.code()])
            .await
    }

    /// Distinct discipline codes of pages that carry a Pass 1 checkpoint.
    pub async fn analyzed_discipline_codes(&self, project_id: &str) -> Result<Vec<DisciplineCode>> {
        let sql = format!(
            "SELECT DISTINCT discipline_code FROM pages
             WHERE project_id = ?1 AND discipline_code IS NOT NULL
               AND processing_status IN ({})",
            in_list(PageStatus::HAS_PASS1_OUTPUT.iter().map(|s| s.as_str()))
        );
        let mut rows = self
            .conn
            .query(&sql, params![project_id])
            .await
            .map_err(db_err)?;

        let mut codes = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let code = DisciplineCode::from_code_or_general(&row.get::<String>(0).map_err(db_err)?);
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
        codes.sort_by_key(|c| c.code());
        Ok(codes)
    }

    async fn query_pages(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<PageRecord>> {
        let mut rows = self.conn.query(sql, params).await.map_err(db_err)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_page(&row)?);
        }
        Ok(results)
    }

    /// Page counts grouped by status.
    pub async fn page_counts(&self, project_id: &str) -> Result<PageCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT processing_status, COUNT(*) FROM pages WHERE project_id = ?1
                 GROUP BY processing_status",
                params![project_id],
            )
            .await
            .map_err(db_err)?;

        let mut counts = PageCounts::default();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let status: PageStatus = row.get::<String>(0).map_err(db_err)?.parse()?;
            counts.add(status, row.get::<i64>(1).map_err(db_err)? as u64);
        }
        Ok(counts)
    }

    // -----------------------------------------------------------------------
    // Status transitions
    // -----------------------------------------------------------------------

    /// Move a page into `next` if its current status allows it.
    pub async fn transition_page(&self, page_id: &str, next: PageStatus) -> Result<()> {
        let sql = format!(
            "UPDATE pages SET processing_status = ?1, updated_at = ?2
             WHERE id = ?3 AND processing_status IN ({})",
            predecessors_of(next)
        );
        let now = Utc::now().to_rfc3339();

        let _guard = self.writer().await;
        let changed = self
            .conn
            .execute(&sql, params![next.as_str(), now.as_str(), page_id])
            .await
            .map_err(db_err)?;
        drop(_guard);

        self.ensure_page_changed(changed, page_id, next).await
    }

    /// Commit a Pass 1 result: output, discipline, sheet number, summary and
    /// `pass1_complete` in one statement.
    pub async fn complete_pass1(
        &self,
        page_id: &str,
        output: &Pass1Output,
        sheet_number: Option<&str>,
    ) -> Result<()> {
        let next = PageStatus::Pass1Complete;
        let sql = format!(
            "UPDATE pages SET
               pass1_output = ?1,
               discipline_code = ?2,
               sheet_number = COALESCE(?3, sheet_number),
               context_description = ?4,
               processing_status = ?5,
               error_message = NULL,
               updated_at = ?6
             WHERE id = ?7 AND processing_status IN ({})",
            predecessors_of(next)
        );
        let json = to_json(output)?;
        let now = Utc::now().to_rfc3339();

        let _guard = self.writer().await;
        let changed = self
            .conn
            .execute(
                &sql,
                params![
                    json,
                    output.discipline.code(),
                    sheet_number,
                    output.summary.as_str(),
                    next.as_str(),
                    now.as_str(),
                    page_id,
                ],
            )
            .await
            .map_err(db_err)?;
        drop(_guard);

        self.ensure_page_changed(changed, page_id, next).await
    }

    /// Commit a Pass 2 result together with its derived fields and `pass2_complete`.
    pub async fn complete_pass2(
        &self,
        page_id: &str,
        output: &Pass2Output,
        cross_refs: &[CrossRef],
        updated_context: &str,
    ) -> Result<()> {
        let next = PageStatus::Pass2Complete;
        let sql = format!(
            "UPDATE pages SET
               pass2_output = ?1,
               cross_refs = ?2,
               updated_context = ?3,
               processing_status = ?4,
               error_message = NULL,
               updated_at = ?5
             WHERE id = ?6 AND processing_status IN ({})",
            predecessors_of(next)
        );
        let output_json = to_json(output)?;
        let refs_json = to_json(cross_refs)?;
        let now = Utc::now().to_rfc3339();

        let _guard = self.writer().await;
        let changed = self
            .conn
            .execute(
                &sql,
                params![
                    output_json,
                    refs_json,
                    updated_context,
                    next.as_str(),
                    now.as_str(),
                    page_id,
                ],
            )
            .await
            .map_err(db_err)?;
        drop(_guard);

        self.ensure_page_changed(changed, page_id, next).await
    }

    /// Record a failure on a page that is mid-pass.
    pub async fn fail_page(&self, page_id: &str, message: &str) -> Result<()> {
        let next = PageStatus::Error;
        let sql = format!(
            "UPDATE pages SET processing_status = ?1, error_message = ?2, updated_at = ?3
             WHERE id = ?4 AND processing_status IN ({})",
            predecessors_of(next)
        );
        let now = Utc::now().to_rfc3339();

        let _guard = self.writer().await;
        let changed = self
            .conn
            .execute(&sql, params![next.as_str(), message, now.as_str(), page_id])
            .await
            .map_err(db_err)?;
        drop(_guard);

        self.ensure_page_changed(changed, page_id, next).await
    }

    /// Send an orphaned page back to `unprocessed`, consuming one unit of its
    /// retry budget. Returns the new retry count.
    pub async fn requeue_page(&self, page_id: &str) -> Result<u32> {
        let next = PageStatus::Unprocessed;
        let sql = format!(
            "UPDATE pages SET processing_status = ?1, retry_count = retry_count + 1,
               error_message = NULL, updated_at = ?2
             WHERE id = ?3 AND processing_status IN ({})",
            predecessors_of(next)
        );
        let now = Utc::now().to_rfc3339();

        let _guard = self.writer().await;
        let changed = self
            .conn
            .execute(&sql, params![next.as_str(), now.as_str(), page_id])
            .await
            .map_err(db_err)?;
        drop(_guard);

        self.ensure_page_changed(changed, page_id, next).await?;
        Ok(self.get_page(page_id).await?.retry_count)
    }

    /// Turn a zero-row conditional update into the right error.
    async fn ensure_page_changed(&self, changed: u64, page_id: &str, next: PageStatus) -> Result<()> {
        if changed > 0 {
            return Ok(());
        }
        let current = self.get_page(page_id).await?;
        Err(PlanIndexError::invalid_transition(
            "page",
            current.processing_status,
            next,
        ))
    }

    // -----------------------------------------------------------------------
    // Batch writes
    // -----------------------------------------------------------------------

    /// Replace the inbound references of many pages in one transaction.
    pub async fn write_inbound_references(
        &self,
        updates: &[(String, Vec<InboundReference>)],
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let encoded = updates
            .iter()
            .map(|(id, refs)| Ok((id.as_str(), to_json(refs)?)))
            .collect::<Result<Vec<_>>>()?;

        let _guard = self.writer().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;
        for (page_id, json) in encoded {
            tx.execute(
                "UPDATE pages SET inbound_references = ?1 WHERE id = ?2",
                params![json, page_id],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Administrative reset: every page back to `unprocessed` with its
    /// checkpoints cleared, every discipline back to `waiting`.
    pub async fn reset_project(&self, project_id: &str) -> Result<ResetCounts> {
        let now = Utc::now().to_rfc3339();

        let _guard = self.writer().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;
        let pages_reset = tx
            .execute(
                "UPDATE pages SET
                   processing_status = 'unprocessed',
                   discipline_code = NULL,
                   discipline_id = NULL,
                   context_description = NULL,
                   pass1_output = NULL,
                   inbound_references = NULL,
                   pass2_output = NULL,
                   cross_refs = NULL,
                   updated_context = NULL,
                   retry_count = 0,
                   error_message = NULL,
                   updated_at = ?1
                 WHERE project_id = ?2",
                params![now.as_str(), project_id],
            )
            .await
            .map_err(db_err)?;
        let disciplines_reset = tx
            .execute(
                "UPDATE disciplines SET
                   processing_status = 'waiting',
                   context_description = NULL,
                   key_contents = NULL,
                   connections = NULL,
                   updated_at = ?1
                 WHERE project_id = ?2",
                params![now.as_str(), project_id],
            )
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        tracing::info!(project_id, pages_reset, disciplines_reset, "reset page processing");
        Ok(ResetCounts {
            pages_reset,
            disciplines_reset,
        })
    }
}

fn predecessors_of(next: PageStatus) -> String {
    in_list(PageStatus::predecessors(next).iter().map(|s| s.as_str()))
}

/// Convert a database row to a [`PageRecord`].
fn row_to_page(row: &libsql::Row) -> Result<PageRecord> {
    let status: PageStatus = row.get::<String>(8).map_err(db_err)?.parse()?;
    Ok(PageRecord {
        id: row.get::<String>(0).map_err(db_err)?,
        project_id: row.get::<String>(1).map_err(db_err)?,
        document_id: row.get::<String>(2).map_err(db_err)?,
        page_number: row.get::<i64>(3).map_err(db_err)? as u32,
        page_title: row.get::<String>(4).ok(),
        sheet_number: row.get::<String>(5).ok(),
        discipline_code: row
            .get::<String>(6)
            .ok()
            .map(|c| DisciplineCode::from_code_or_general(&c)),
        discipline_id: row.get::<String>(7).ok(),
        processing_status: status,
        context_description: row.get::<String>(9).ok(),
        pass1_output: from_json_opt("pass1_output", row.get::<String>(10).ok())?,
        inbound_references: from_json_opt("inbound_references", row.get::<String>(11).ok())?
            .unwrap_or_default(),
        pass2_output: from_json_opt("pass2_output", row.get::<String>(12).ok())?,
        cross_refs: from_json_opt("cross_refs", row.get::<String>(13).ok())?.unwrap_or_default(),
        updated_context: row.get::<String>(14).ok(),
        retry_count: row.get::<i64>(15).map_err(db_err)? as u32,
        error_message: row.get::<String>(16).ok(),
        updated_at: parse_timestamp(&row.get::<String>(17).map_err(db_err)?)?,
    })
}
