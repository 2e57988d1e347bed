//! SQL migration definitions for the PlanIndex database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: projects, documents, annotations, pages, disciplines",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Projects (owned by the document collaborator)
CREATE TABLE IF NOT EXISTS projects (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Plan documents (one file, many pages)
CREATE TABLE IF NOT EXISTS documents (
    id         TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    name       TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_project ON documents(project_id);

-- User-drawn regions with their prior analysis
CREATE TABLE IF NOT EXISTS annotations (
    id                  TEXT PRIMARY KEY,
    document_id         TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    page_number         INTEGER NOT NULL,
    title               TEXT NOT NULL,
    description         TEXT,
    analysis            TEXT,
    text_fragments_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_annotations_page ON annotations(document_id, page_number);

-- One row per annotated (document, page)
CREATE TABLE IF NOT EXISTS pages (
    id                  TEXT PRIMARY KEY,
    project_id          TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    document_id         TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    page_number         INTEGER NOT NULL,
    page_title          TEXT,
    sheet_number        TEXT,
    discipline_code     TEXT,
    discipline_id       TEXT,
    processing_status   TEXT NOT NULL DEFAULT 'unprocessed',
    context_description TEXT,
    pass1_output        TEXT,
    inbound_references  TEXT,
    pass2_output        TEXT,
    cross_refs          TEXT,
    updated_context     TEXT,
    retry_count         INTEGER NOT NULL DEFAULT 0,
    error_message       TEXT,
    updated_at          TEXT NOT NULL,
    UNIQUE(document_id, page_number)
);

CREATE INDEX IF NOT EXISTS idx_pages_project_status ON pages(project_id, processing_status);
CREATE INDEX IF NOT EXISTS idx_pages_project_discipline ON pages(project_id, discipline_code);

-- Discipline rollups, created lazily by Pass 1
CREATE TABLE IF NOT EXISTS disciplines (
    id                  TEXT PRIMARY KEY,
    project_id          TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    code                TEXT NOT NULL,
    name                TEXT NOT NULL,
    processing_status   TEXT NOT NULL DEFAULT 'waiting',
    context_description TEXT,
    key_contents        TEXT,
    connections         TEXT,
    updated_at          TEXT NOT NULL,
    UNIQUE(project_id, code)
);

CREATE INDEX IF NOT EXISTS idx_disciplines_project ON disciplines(project_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
