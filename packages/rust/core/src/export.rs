//! Context-tree export: disciplines on top, pages below, as one JSON document.

use chrono::{DateTime, Utc};
use planindex_shared::{
    DisciplineCode, DisciplineConnection, DisciplineStatus, InboundReference, KeyContent,
    PageRecord, PageStatus, PlanIndexError, ReferenceType, Result,
};
use planindex_storage::Storage;
use serde::Serialize;
use tracing::{info, instrument};

#[derive(Debug, Serialize)]
pub struct ContextTree {
    pub project_id: String,
    pub project_name: String,
    pub exported_at: DateTime<Utc>,
    pub disciplines: Vec<DisciplineNode>,
    pub pages: Vec<PageNode>,
}

#[derive(Debug, Serialize)]
pub struct DisciplineNode {
    pub code: DisciplineCode,
    pub name: String,
    pub status: DisciplineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub key_contents: Vec<KeyContent>,
    pub connections: Vec<DisciplineConnection>,
    /// Sheets of the pages assigned to this discipline.
    pub sheets: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PageNode {
    pub page_id: String,
    pub document_id: String,
    pub page_number: u32,
    pub sheet_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discipline: Option<DisciplineCode>,
    pub status: PageStatus,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_context: Option<String>,
    pub annotations: Vec<AnnotationNode>,
    pub outbound_refs: Vec<OutboundNode>,
    pub inbound_references: Vec<InboundReference>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AnnotationNode {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OutboundNode {
    pub annotation_id: String,
    #[serde(rename = "ref")]
    pub target: String,
    #[serde(rename = "type")]
    pub ref_type: ReferenceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Build the context tree of a project from its current rows.
#[instrument(skip_all, fields(project_id = %project_id))]
pub async fn export_project(storage: &Storage, project_id: &str) -> Result<ContextTree> {
    let project = storage.require_project(project_id).await?;
    let pages = storage.list_pages(project_id).await?;
    let disciplines = storage.list_disciplines(project_id).await?;

    let discipline_nodes = disciplines
        .into_iter()
        .map(|d| DisciplineNode {
            sheets: pages
                .iter()
                .filter(|p| p.discipline_code == Some(d.code))
                .map(PageRecord::sheet_label)
                .collect(),
            code: d.code,
            name: d.name,
            status: d.processing_status,
            context: d.context_description,
            key_contents: d.key_contents,
            connections: d.connections,
        })
        .collect();

    let mut page_nodes = Vec::with_capacity(pages.len());
    for page in &pages {
        let annotations = storage
            .annotations_for_page(&page.document_id, page.page_number)
            .await?;
        page_nodes.push(page_node(page, annotations));
    }

    info!(pages = page_nodes.len(), "context tree exported");
    Ok(ContextTree {
        project_id: project.id,
        project_name: project.name,
        exported_at: Utc::now(),
        disciplines: discipline_nodes,
        pages: page_nodes,
    })
}

pub fn to_pretty_json(tree: &ContextTree) -> Result<String> {
    serde_json::to_string_pretty(tree)
        .map_err(|e| PlanIndexError::parse(format!("failed to encode export: {e}")))
}

fn page_node(page: &PageRecord, annotations: Vec<planindex_shared::Annotation>) -> PageNode {
    let analyses = page
        .pass1_output
        .as_ref()
        .map(|o| o.annotations.as_slice())
        .unwrap_or_default();

    let annotations = annotations
        .into_iter()
        .map(|a| AnnotationNode {
            summary: analyses
                .iter()
                .find(|x| x.annotation_id == a.id)
                .map(|x| x.summary.clone()),
            id: a.id,
            title: a.title,
        })
        .collect();

    let outbound_refs = page
        .pass1_output
        .iter()
        .flat_map(|o| o.outbound_refs())
        .map(|(annotation_id, r)| OutboundNode {
            annotation_id: annotation_id.to_string(),
            target: r.target.clone(),
            ref_type: r.ref_type,
            context: page.pass2_output.as_ref().and_then(|o| {
                o.outbound_refs_context
                    .iter()
                    .find(|c| c.target == r.target)
                    .map(|c| c.context.clone())
            }),
        })
        .collect();

    PageNode {
        page_id: page.id.clone(),
        document_id: page.document_id.clone(),
        page_number: page.page_number,
        sheet_number: page.sheet_label(),
        page_title: page.page_title.clone(),
        discipline: page.discipline_code,
        status: page.processing_status,
        summary: page.summary().to_string(),
        updated_context: page.updated_context.clone(),
        annotations,
        outbound_refs,
        inbound_references: page.inbound_references.clone(),
        retry_count: page.retry_count,
        error_message: page.error_message.clone(),
    }
}
