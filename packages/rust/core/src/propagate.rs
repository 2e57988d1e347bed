//! Copies Pass 2 contexts onto the matching inbound references.

use std::collections::HashMap;

use planindex_shared::{InboundReference, PageRecord, Result};
use planindex_storage::Storage;
use tracing::{info, instrument};

/// Fill `context` on every inbound reference from the source page's Pass 2
/// output, matching on (source sheet, reference as written). Unmatched
/// entries get an empty context. Only pages whose entries changed are returned.
pub fn propagate(pages: &[PageRecord]) -> Vec<(String, Vec<InboundReference>)> {
    let mut contexts: HashMap<(String, &str), &str> = HashMap::new();
    for page in pages {
        let Some(output) = &page.pass2_output else {
            continue;
        };
        let sheet = page.sheet_label();
        for r in &output.outbound_refs_context {
            contexts.insert((sheet.clone(), r.target.as_str()), r.context.as_str());
        }
    }

    let mut updates = Vec::new();
    for page in pages {
        if page.inbound_references.is_empty() {
            continue;
        }
        let mut entries = page.inbound_references.clone();
        for entry in &mut entries {
            let key = (entry.source_sheet.clone(), entry.original_ref.as_str());
            match contexts.get(&key) {
                Some(context) => entry.context = Some((*context).to_string()),
                None if entry.context.is_none() => entry.context = Some(String::new()),
                None => {}
            }
        }
        if entries != page.inbound_references {
            updates.push((page.id.clone(), entries));
        }
    }
    updates
}

pub struct ContextPropagator<'a> {
    storage: &'a Storage,
}

impl<'a> ContextPropagator<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    #[instrument(skip_all, fields(project_id = %project_id))]
    pub async fn run(&self, project_id: &str) -> Result<usize> {
        let pages = self.storage.list_pages(project_id).await?;
        let updates = propagate(&pages);
        self.storage.write_inbound_references(&updates).await?;
        info!(pages = updates.len(), "inbound contexts propagated");
        Ok(updates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{page_record, pass1};
    use planindex_shared::{Pass2Output, RefContext};

    fn inbound(source_sheet: &str, original_ref: &str) -> InboundReference {
        InboundReference {
            source_sheet: source_sheet.into(),
            source_page_id: "src".into(),
            from_annotation: "ann".into(),
            ref_type: Default::default(),
            original_ref: original_ref.into(),
            source_element_id: None,
            source_text: None,
            context: None,
        }
    }

    #[test]
    fn fills_matching_and_blanks_unmatched() {
        let mut a = page_record("a", "A-101", Some(pass1("A", &[("ann", "M-201")])));
        a.pass2_output = Some(Pass2Output {
            version: 1,
            outbound_refs_context: vec![RefContext {
                target: "M-201".into(),
                context: "Level 2 ductwork".into(),
            }],
        });
        let mut m = page_record("m", "M-201", Some(pass1("M", &[])));
        m.inbound_references = vec![inbound("A-101", "M-201"), inbound("S-101", "M201")];

        let updates = propagate(&[a, m]);
        assert_eq!(updates.len(), 1);
        let (id, entries) = &updates[0];
        assert_eq!(id, "m");
        assert_eq!(entries[0].context.as_deref(), Some("Level 2 ductwork"));
        assert_eq!(entries[1].context.as_deref(), Some(""));
    }

    #[test]
    fn unchanged_pages_are_skipped() {
        let mut m = page_record("m", "M-201", Some(pass1("M", &[])));
        let mut entry = inbound("A-101", "M-201");
        entry.context = Some(String::new());
        m.inbound_references = vec![entry];
        assert!(propagate(&[m]).is_empty());
    }
}
