//! Turso Embedded / libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database holding the collaborator
//! tables (projects, documents, annotations) and the pipeline's own rows
//! (pages, disciplines).
//!
//! **Write rules:**
//! - every write takes the storage write lock, so concurrent Pass 1 workers
//!   never interleave statements on the shared connection
//! - a status change and the output it certifies are one `UPDATE`
//! - status changes are conditional on the allowed predecessor statuses

mod disciplines;
mod migrations;
mod pages;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use planindex_shared::{Annotation, PlanIndexError, Result, TextFragment};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, MutexGuard};

pub use disciplines::DisciplineCounts;
pub use pages::{AnnotatedPage, PageCounts, ResetCounts};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    write_lock: Mutex<()>,
}

/// A project row.
#[derive(Debug, Clone)]
pub struct ProjectRow {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A document row.
#[derive(Debug, Clone)]
pub struct DocumentRow {
    pub id: String,
    pub project_id: String,
    pub name: String,
}

impl Storage {
    /// Open or create a database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PlanIndexError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        PlanIndexError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Serialize writers on the shared connection.
    async fn writer(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    // -----------------------------------------------------------------------
    // Projects and documents
    // -----------------------------------------------------------------------

    /// Insert a project record.
    pub async fn insert_project(&self, id: &str, name: &str) -> Result<()> {
        let _guard = self.writer().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO projects (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![id, name, now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Get a project by ID.
    pub async fn get_project(&self, id: &str) -> Result<Option<ProjectRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, created_at FROM projects WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(ProjectRow {
                id: row.get::<String>(0).map_err(db_err)?,
                name: row.get::<String>(1).map_err(db_err)?,
                created_at: parse_timestamp(&row.get::<String>(2).map_err(db_err)?)?,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Get a project by ID, failing with `NotFound` when it is missing.
    pub async fn require_project(&self, id: &str) -> Result<ProjectRow> {
        self.get_project(id)
            .await?
            .ok_or_else(|| PlanIndexError::not_found("project", id))
    }

    /// List all projects. Returns `Vec<(id, name)>`.
    pub async fn list_projects(&self) -> Result<Vec<(String, String)>> {
        let mut rows = self
            .conn
            .query("SELECT id, name FROM projects ORDER BY name", params![])
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push((
                row.get::<String>(0).map_err(db_err)?,
                row.get::<String>(1).map_err(db_err)?,
            ));
        }
        Ok(results)
    }

    /// Insert a document record.
    pub async fn insert_document(&self, id: &str, project_id: &str, name: &str) -> Result<()> {
        let _guard = self.writer().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO documents (id, project_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, project_id, name, now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// List documents for a project.
    pub async fn list_documents(&self, project_id: &str) -> Result<Vec<DocumentRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, project_id, name FROM documents WHERE project_id = ?1 ORDER BY name",
                params![project_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(DocumentRow {
                id: row.get::<String>(0).map_err(db_err)?,
                project_id: row.get::<String>(1).map_err(db_err)?,
                name: row.get::<String>(2).map_err(db_err)?,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Annotations
    // -----------------------------------------------------------------------

    /// Insert an annotation record.
    pub async fn insert_annotation(&self, annotation: &Annotation) -> Result<()> {
        let fragments = if annotation.text_fragments.is_empty() {
            None
        } else {
            Some(to_json(&annotation.text_fragments)?)
        };

        let _guard = self.writer().await;
        self.conn
            .execute(
                "INSERT INTO annotations (id, document_id, page_number, title, description, analysis, text_fragments_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    annotation.id.as_str(),
                    annotation.document_id.as_str(),
                    i64::from(annotation.page_number),
                    annotation.title.as_str(),
                    annotation.description.as_deref(),
                    annotation.analysis.as_deref(),
                    fragments,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Annotations on one page, in insertion order.
    pub async fn annotations_for_page(
        &self,
        document_id: &str,
        page_number: u32,
    ) -> Result<Vec<Annotation>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, document_id, page_number, title, description, analysis, text_fragments_json
                 FROM annotations WHERE document_id = ?1 AND page_number = ?2
                 ORDER BY rowid",
                params![document_id, i64::from(page_number)],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_annotation(&row)?);
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

/// Map a libSQL error into the storage variant.
pub(crate) fn db_err(e: libsql::Error) -> PlanIndexError {
    PlanIndexError::Storage(e.to_string())
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| PlanIndexError::Storage(e.to_string()))
}

/// Decode a nullable JSON column.
pub(crate) fn from_json_opt<T: DeserializeOwned>(
    column: &str,
    raw: Option<String>,
) -> Result<Option<T>> {
    match raw {
        Some(text) if !text.is_empty() => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| PlanIndexError::Storage(format!("invalid {column} JSON: {e}"))),
        _ => Ok(None),
    }
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PlanIndexError::Storage(format!("invalid date: {e}")))
}

/// Render a set of enum statuses as a SQL `IN` list. Values come from
/// `as_str()` of closed enums, never from callers.
pub(crate) fn in_list<'a>(values: impl IntoIterator<Item = &'a str>) -> String {
    values
        .into_iter()
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_annotation(row: &libsql::Row) -> Result<Annotation> {
    let fragments: Option<Vec<TextFragment>> =
        from_json_opt("text_fragments_json", row.get::<String>(6).ok())?;
    Ok(Annotation {
        id: row.get::<String>(0).map_err(db_err)?,
        document_id: row.get::<String>(1).map_err(db_err)?,
        page_number: row.get::<i64>(2).map_err(db_err)? as u32,
        title: row.get::<String>(3).map_err(db_err)?,
        description: row.get::<String>(4).ok(),
        analysis: row.get::<String>(5).ok(),
        text_fragments: fragments.unwrap_or_default(),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    pub async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("pi_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    /// Seed a project with one document and return `(project_id, document_id)`.
    pub async fn seed_project(storage: &Storage, document_name: &str) -> (String, String) {
        let project_id = Uuid::now_v7().to_string();
        let document_id = Uuid::now_v7().to_string();
        storage
            .insert_project(&project_id, "test-project")
            .await
            .expect("insert project");
        storage
            .insert_document(&document_id, &project_id, document_name)
            .await
            .expect("insert document");
        (project_id, document_id)
    }

    pub async fn add_document(storage: &Storage, project_id: &str, name: &str) -> String {
        let document_id = Uuid::now_v7().to_string();
        storage
            .insert_document(&document_id, project_id, name)
            .await
            .expect("insert document");
        document_id
    }

    pub async fn annotate(storage: &Storage, document_id: &str, page_number: u32, title: &str) {
        let annotation = Annotation {
            id: Uuid::now_v7().to_string(),
            document_id: document_id.to_string(),
            page_number,
            title: title.to_string(),
            description: None,
            analysis: Some(format!("{title} analysis")),
            text_fragments: vec![],
        };
        storage
            .insert_annotation(&annotation)
            .await
            .expect("insert annotation");
    }
}
