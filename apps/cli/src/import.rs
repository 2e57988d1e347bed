//! Load a JSON manifest of projects, documents, and annotations.
//!
//! ```json
//! { "projects": [ { "name": "Tower B", "documents": [
//!     { "name": "A101 Floor Plan.pdf", "annotations": [
//!         { "page_number": 1, "title": "Ceiling note", "analysis": "See M-201" } ] } ] } ] }
//! ```
//!
//! Ids are optional; missing ones are generated (UUID v7). A project id that
//! already exists is reused and the new documents are appended to it.

use std::path::Path;

use planindex_shared::{Annotation, PlanIndexError, Result, TextFragment};
use planindex_storage::Storage;
use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub(crate) struct Manifest {
    pub projects: Vec<ProjectEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProjectEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub documents: Vec<DocumentEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DocumentEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub annotations: Vec<AnnotationEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AnnotationEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub page_number: u32,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub analysis: Option<String>,
    #[serde(default)]
    pub text_fragments: Vec<TextFragment>,
}

/// What an import wrote.
#[derive(Debug, Default)]
pub(crate) struct ImportSummary {
    /// `(id, name)` of every project touched.
    pub projects: Vec<(String, String)>,
    pub documents: usize,
    pub annotations: usize,
}

pub(crate) fn read_manifest(path: &Path) -> Result<Manifest> {
    let content = std::fs::read_to_string(path).map_err(|e| PlanIndexError::io(path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| PlanIndexError::parse(format!("invalid manifest {}: {e}", path.display())))
}

fn id_or_new(id: &Option<String>) -> String {
    id.clone().unwrap_or_else(|| Uuid::now_v7().to_string())
}

#[instrument(skip_all, fields(projects = manifest.projects.len()))]
pub(crate) async fn import_manifest(storage: &Storage, manifest: &Manifest) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();

    for project in &manifest.projects {
        let project_id = id_or_new(&project.id);
        if storage.get_project(&project_id).await?.is_none() {
            storage.insert_project(&project_id, &project.name).await?;
        }

        for document in &project.documents {
            let document_id = id_or_new(&document.id);
            storage
                .insert_document(&document_id, &project_id, &document.name)
                .await?;
            summary.documents += 1;

            for entry in &document.annotations {
                if entry.page_number == 0 {
                    return Err(PlanIndexError::validation(format!(
                        "annotation '{}' in {} has page_number 0 (pages are 1-based)",
                        entry.title, document.name
                    )));
                }
                storage
                    .insert_annotation(&Annotation {
                        id: id_or_new(&entry.id),
                        document_id: document_id.clone(),
                        page_number: entry.page_number,
                        title: entry.title.clone(),
                        description: entry.description.clone(),
                        analysis: entry.analysis.clone(),
                        text_fragments: entry.text_fragments.clone(),
                    })
                    .await?;
                summary.annotations += 1;
            }
        }

        info!(project_id = %project_id, name = %project.name, "project imported");
        summary.projects.push((project_id, project.name.clone()));
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_storage() -> Storage {
        let path = std::env::temp_dir().join(format!("pi_cli_import_{}.db", Uuid::now_v7()));
        Storage::open(&path).await.expect("open test db")
    }

    const MANIFEST: &str = r#"{
        "projects": [{
            "id": "tower-b",
            "name": "Tower B",
            "documents": [
                {"name": "A101 Floor Plan.pdf", "annotations": [
                    {"page_number": 1, "title": "Ceiling note", "analysis": "See M-201",
                     "text_fragments": [{"id": "f1", "text": "SEE M-201"}]},
                    {"page_number": 2, "title": "Door tag"}
                ]},
                {"name": "M201 HVAC.pdf", "annotations": [
                    {"page_number": 1, "title": "Duct note"}
                ]}
            ]
        }]
    }"#;

    #[tokio::test]
    async fn imports_projects_documents_and_annotations() {
        let storage = test_storage().await;
        let manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();

        let summary = import_manifest(&storage, &manifest).await.unwrap();
        assert_eq!(summary.projects, vec![("tower-b".into(), "Tower B".into())]);
        assert_eq!(summary.documents, 2);
        assert_eq!(summary.annotations, 3);

        let documents = storage.list_documents("tower-b").await.unwrap();
        assert_eq!(documents.len(), 2);
        let plan = documents
            .iter()
            .find(|d| d.name == "A101 Floor Plan.pdf")
            .unwrap();
        let annotations = storage.annotations_for_page(&plan.id, 1).await.unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].text_fragments[0].text, "SEE M-201");
    }

    #[tokio::test]
    async fn reimport_appends_to_existing_project() {
        let storage = test_storage().await;
        let manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        import_manifest(&storage, &manifest).await.unwrap();
        import_manifest(&storage, &manifest).await.unwrap();

        assert_eq!(storage.list_projects().await.unwrap().len(), 1);
        assert_eq!(storage.list_documents("tower-b").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn zero_page_number_is_rejected() {
        let storage = test_storage().await;
        let manifest: Manifest = serde_json::from_str(
            r#"{"projects": [{"name": "P", "documents": [
                {"name": "X.pdf", "annotations": [{"page_number": 0, "title": "t"}]}]}]}"#,
        )
        .unwrap();

        let err = import_manifest(&storage, &manifest).await.unwrap_err();
        assert!(matches!(err, PlanIndexError::Validation { .. }));
    }
}
