//! Inverts outbound references into inbound references.

use std::collections::HashMap;

use planindex_shared::{InboundReference, PageRecord, PageStatus, Result};
use planindex_storage::Storage;
use tracing::{debug, info, instrument};

use crate::normalize::normalize;

/// Result of one resolver run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resolution {
    pub pages_updated: usize,
    pub resolved: usize,
    pub unresolved: usize,
}

/// Compute the inbound references of every page that has Pass 1 output.
///
/// Every such page appears in the result, so stale entries from an earlier
/// run are replaced. A context already filled in for the same
/// (source page, annotation, reference) is carried over.
pub fn resolve(pages: &[PageRecord]) -> (Vec<(String, Vec<InboundReference>)>, Resolution) {
    let analyzed: Vec<&PageRecord> = pages.iter().filter(|p| p.pass1_output.is_some()).collect();

    let mut by_sheet: HashMap<String, Vec<&str>> = HashMap::new();
    for page in &analyzed {
        by_sheet
            .entry(normalize(&page.sheet_label()))
            .or_default()
            .push(page.id.as_str());
    }

    let mut inbound: HashMap<&str, Vec<InboundReference>> =
        analyzed.iter().map(|p| (p.id.as_str(), Vec::new())).collect();
    let mut stats = Resolution::default();

    for source in &analyzed {
        let Some(output) = &source.pass1_output else {
            continue;
        };
        let source_sheet = source.sheet_label();
        for (annotation_id, reference) in output.outbound_refs() {
            let Some(targets) = by_sheet.get(&normalize(&reference.target)) else {
                debug!(reference = %reference.target, source = %source_sheet, "unresolved reference");
                stats.unresolved += 1;
                continue;
            };
            stats.resolved += 1;
            for target in targets {
                if let Some(entries) = inbound.get_mut(target) {
                    entries.push(InboundReference {
                        source_sheet: source_sheet.clone(),
                        source_page_id: source.id.clone(),
                        from_annotation: annotation_id.to_string(),
                        ref_type: reference.ref_type,
                        original_ref: reference.target.clone(),
                        source_element_id: reference.source_element_id.clone(),
                        source_text: reference.source_text.clone(),
                        context: None,
                    });
                }
            }
        }
    }

    let mut updates = Vec::with_capacity(analyzed.len());
    for page in &analyzed {
        let mut entries = inbound.remove(page.id.as_str()).unwrap_or_default();
        for entry in &mut entries {
            entry.context = page
                .inbound_references
                .iter()
                .find(|old| {
                    old.source_page_id == entry.source_page_id
                        && old.from_annotation == entry.from_annotation
                        && old.original_ref == entry.original_ref
                })
                .and_then(|old| old.context.clone());
        }
        updates.push((page.id.clone(), entries));
    }
    stats.pages_updated = updates.len();
    (updates, stats)
}

pub struct ReferenceResolver<'a> {
    storage: &'a Storage,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Resolve the whole project and commit it in one transaction.
    #[instrument(skip_all, fields(project_id = %project_id))]
    pub async fn run(&self, project_id: &str) -> Result<Resolution> {
        let pages = self
            .storage
            .list_pages_in(project_id, &PageStatus::HAS_PASS1_OUTPUT)
            .await?;
        let (updates, stats) = resolve(&pages);
        self.storage.write_inbound_references(&updates).await?;
        info!(
            pages = stats.pages_updated,
            resolved = stats.resolved,
            unresolved = stats.unresolved,
            "inbound references resolved"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{page_record, pass1};

    #[test]
    fn inverts_matching_reference() {
        let a = page_record("a", "A-101", Some(pass1("A", &[("ann-1", "B201")])));
        let b = page_record("b", "B-201", Some(pass1("S", &[])));
        let (updates, stats) = resolve(&[a, b]);

        let inbound_b = &updates.iter().find(|(id, _)| id == "b").unwrap().1;
        assert_eq!(inbound_b.len(), 1);
        assert_eq!(inbound_b[0].source_sheet, "A-101");
        assert_eq!(inbound_b[0].source_page_id, "a");
        assert_eq!(inbound_b[0].from_annotation, "ann-1");
        assert_eq!(inbound_b[0].original_ref, "B201");
        assert!(inbound_b[0].context.is_none());

        let inbound_a = &updates.iter().find(|(id, _)| id == "a").unwrap().1;
        assert!(inbound_a.is_empty());
        assert_eq!(stats.resolved, 1);
    }

    #[test]
    fn unknown_targets_are_dropped() {
        let a = page_record("a", "A-101", Some(pass1("A", &[("ann", "Z-999"), ("ann", "3/A.101")])));
        let (updates, stats) = resolve(&[a]);
        assert_eq!(stats.unresolved, 1);
        assert_eq!(stats.resolved, 1);
        assert_eq!(updates[0].1.len(), 1);
    }

    #[test]
    fn pages_without_pass1_are_not_targets() {
        let a = page_record("a", "A-101", Some(pass1("A", &[("ann", "M-201")])));
        let m = page_record("m", "M-201", None);
        let (updates, stats) = resolve(&[a, m]);
        assert_eq!(updates.len(), 1);
        assert_eq!(stats.unresolved, 1);
    }

    #[test]
    fn existing_context_is_kept() {
        let a = page_record("a", "A-101", Some(pass1("A", &[("ann", "M-201")])));
        let mut m = page_record("m", "M-201", Some(pass1("M", &[])));
        m.inbound_references = vec![InboundReference {
            source_sheet: "A-101".into(),
            source_page_id: "a".into(),
            from_annotation: "ann".into(),
            ref_type: Default::default(),
            original_ref: "M-201".into(),
            source_element_id: None,
            source_text: None,
            context: Some("Level 2 ductwork".into()),
        }];
        let (updates, _) = resolve(&[a, m]);
        let inbound_m = &updates.iter().find(|(id, _)| id == "m").unwrap().1;
        assert_eq!(inbound_m[0].context.as_deref(), Some("Level 2 ductwork"));
    }
}
