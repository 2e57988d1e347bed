//! Discipline rows: lazy creation, the readiness check, and the rollup commit.

use chrono::Utc;
use libsql::params;
use planindex_shared::{
    DisciplineCode, DisciplineRecord, DisciplineRollup, DisciplineStatus, PageStatus,
    PlanIndexError, Result,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{Storage, db_err, from_json_opt, in_list, parse_timestamp, to_json};

const DISCIPLINE_COLUMNS: &str = "id, project_id, code, name, processing_status, \
     context_description, key_contents, connections, updated_at";

/// Raw discipline counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DisciplineCounts {
    pub waiting: u64,
    pub ready: u64,
    pub processing: u64,
    pub complete: u64,
    pub error: u64,
}

impl DisciplineCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.ready + self.processing + self.complete + self.error
    }

    fn add(&mut self, status: DisciplineStatus, n: u64) {
        let slot = match status {
            DisciplineStatus::Waiting => &mut self.waiting,
            DisciplineStatus::Ready => &mut self.ready,
            DisciplineStatus::Processing => &mut self.processing,
            DisciplineStatus::Complete => &mut self.complete,
            DisciplineStatus::Error => &mut self.error,
        };
        *slot += n;
    }
}

impl Storage {
    /// Create any missing discipline rows for `codes` in one transaction.
    /// Returns the number of rows created.
    pub async fn ensure_disciplines(
        &self,
        project_id: &str,
        codes: &[DisciplineCode],
    ) -> Result<usize> {
        if codes.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().to_rfc3339();

        let _guard = self.writer().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;
        let mut created = 0;
        for code in codes {
            let inserted = tx
                .execute(
                    "INSERT INTO disciplines (id, project_id, code, name, processing_status, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'waiting', ?5)
                     ON CONFLICT(project_id, code) DO NOTHING",
                    params![
                        Uuid::now_v7().to_string(),
                        project_id,
                        code.code(),
                        code.name(),
                        now.as_str(),
                    ],
                )
                .await
                .map_err(db_err)?;
            if inserted > 0 {
                tracing::info!(project_id, discipline = code.code(), "created discipline");
                created += 1;
            }
        }
        tx.commit().await.map_err(db_err)?;
        Ok(created)
    }

    /// Get a discipline by project and code.
    pub async fn get_discipline(
        &self,
        project_id: &str,
        code: DisciplineCode,
    ) -> Result<Option<DisciplineRecord>> {
        let sql =
            format!("SELECT {DISCIPLINE_COLUMNS} FROM disciplines WHERE project_id = ?1 AND code = ?2");
        let mut rows = self
            .conn
            .query(&sql, params![project_id, code.code()])
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_discipline(&row)?)),
            None => Ok(None),
        }
    }

    /// All disciplines of a project, code order.
    pub async fn list_disciplines(&self, project_id: &str) -> Result<Vec<DisciplineRecord>> {
        self.list_disciplines_in(project_id, &DisciplineStatus::ALL)
            .await
    }

    /// Disciplines of a project whose status is one of `statuses`.
    pub async fn list_disciplines_in(
        &self,
        project_id: &str,
        statuses: &[DisciplineStatus],
    ) -> Result<Vec<DisciplineRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {DISCIPLINE_COLUMNS} FROM disciplines
             WHERE project_id = ?1 AND processing_status IN ({})
             ORDER BY code",
            in_list(statuses.iter().map(|s| s.as_str()))
        );
        let mut rows = self
            .conn
            .query(&sql, params![project_id])
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_discipline(&row)?);
        }
        Ok(results)
    }

    /// Discipline counts grouped by status.
    pub async fn discipline_counts(&self, project_id: &str) -> Result<DisciplineCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT processing_status, COUNT(*) FROM disciplines WHERE project_id = ?1
                 GROUP BY processing_status",
                params![project_id],
            )
            .await
            .map_err(db_err)?;

        let mut counts = DisciplineCounts::default();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let status: DisciplineStatus = row.get::<String>(0).map_err(db_err)?.parse()?;
            counts.add(status, row.get::<i64>(1).map_err(db_err)? as u64);
        }
        Ok(counts)
    }

    /// Promote a `waiting` discipline to `ready` when every page assigned to
    /// it is `pass2_complete`. The check and the promotion are one statement,
    /// so exactly one caller ever observes `true` for a given discipline.
    pub async fn mark_discipline_ready(
        &self,
        project_id: &str,
        code: DisciplineCode,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();

        let _guard = self.writer().await;
        let changed = self
            .conn
            .execute(
                "UPDATE disciplines SET processing_status = 'ready', updated_at = ?1
                 WHERE project_id = ?2 AND code = ?3 AND processing_status = 'waiting'
                   AND EXISTS (
                     SELECT 1 FROM pages WHERE project_id = ?2 AND discipline_code = ?3)
                   AND NOT EXISTS (
                     SELECT 1 FROM pages WHERE project_id = ?2 AND discipline_code = ?3
                       AND processing_status != ?4)",
                params![
                    now.as_str(),
                    project_id,
                    code.code(),
                    PageStatus::Pass2Complete.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Move a discipline into `next` if its current status allows it.
    pub async fn transition_discipline(
        &self,
        discipline_id: &str,
        next: DisciplineStatus,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE disciplines SET processing_status = ?1, updated_at = ?2
             WHERE id = ?3 AND processing_status IN ({})",
            predecessors_of(next)
        );
        let now = Utc::now().to_rfc3339();

        let _guard = self.writer().await;
        let changed = self
            .conn
            .execute(&sql, params![next.as_str(), now.as_str(), discipline_id])
            .await
            .map_err(db_err)?;
        drop(_guard);

        self.ensure_discipline_changed(changed, discipline_id, next)
            .await
    }

    /// Commit a Pass 3 rollup: discipline fields, `complete`, and the link from
    /// every member page to the discipline, in one transaction.
    pub async fn complete_discipline(
        &self,
        discipline_id: &str,
        rollup: &DisciplineRollup,
        page_ids: &[String],
    ) -> Result<()> {
        let next = DisciplineStatus::Complete;
        let sql = format!(
            "UPDATE disciplines SET
               context_description = ?1,
               key_contents = ?2,
               connections = ?3,
               processing_status = ?4,
               updated_at = ?5
             WHERE id = ?6 AND processing_status IN ({})",
            predecessors_of(next)
        );
        let key_contents = to_json(&rollup.key_contents)?;
        let connections = to_json(&rollup.connections)?;
        let now = Utc::now().to_rfc3339();

        let _guard = self.writer().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;
        let changed = tx
            .execute(
                &sql,
                params![
                    rollup.context.as_str(),
                    key_contents,
                    connections,
                    next.as_str(),
                    now.as_str(),
                    discipline_id,
                ],
            )
            .await
            .map_err(db_err)?;

        if changed == 0 {
            tx.rollback().await.map_err(db_err)?;
            drop(_guard);
            return self
                .ensure_discipline_changed(changed, discipline_id, next)
                .await;
        }

        for page_id in page_ids {
            tx.execute(
                "UPDATE pages SET discipline_id = ?1 WHERE id = ?2",
                params![discipline_id, page_id.as_str()],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn ensure_discipline_changed(
        &self,
        changed: u64,
        discipline_id: &str,
        next: DisciplineStatus,
    ) -> Result<()> {
        if changed > 0 {
            return Ok(());
        }
        let sql = "SELECT processing_status FROM disciplines WHERE id = ?1";
        let mut rows = self
            .conn
            .query(sql, params![discipline_id])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let current: DisciplineStatus = row.get::<String>(0).map_err(db_err)?.parse()?;
                Err(PlanIndexError::invalid_transition("discipline", current, next))
            }
            None => Err(PlanIndexError::not_found("discipline", discipline_id)),
        }
    }
}

fn predecessors_of(next: DisciplineStatus) -> String {
    in_list(DisciplineStatus::predecessors(next).iter().map(|s| s.as_str()))
}

/// Convert a database row to a [`DisciplineRecord`].
fn row_to_discipline(row: &libsql::Row) -> Result<DisciplineRecord> {
    let code = DisciplineCode::from_code_or_general(&row.get::<String>(2).map_err(db_err)?);
    Ok(DisciplineRecord {
        id: row.get::<String>(0).map_err(db_err)?,
        project_id: row.get::<String>(1).map_err(db_err)?,
        code,
        name: row.get::<String>(3).map_err(db_err)?,
        processing_status: row.get::<String>(4).map_err(db_err)?.parse()?,
        context_description: row.get::<String>(5).ok(),
        key_contents: from_json_opt("key_contents", row.get::<String>(6).ok())?
            .unwrap_or_default(),
        connections: from_json_opt("connections", row.get::<String>(7).ok())?.unwrap_or_default(),
        updated_at: parse_timestamp(&row.get::<String>(8).map_err(db_err)?)?,
    })
}
