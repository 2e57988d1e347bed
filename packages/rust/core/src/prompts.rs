//! Prompt builders for the three passes.
//!
//! Every builder returns a [`Prompt`]: the full prompt, plus a compact
//! variant sent on the single retry after a truncated response.

use std::fmt::Write as _;

use planindex_shared::{Annotation, CrossRef, DisciplineCode, PageSummary, Pass1Output};

/// A prompt and its terse fallback.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub full: String,
    pub compact: String,
}

const DISCIPLINE_LIST: &str = "A (Architectural), S (Structural), M (Mechanical), \
E (Electrical), P (Plumbing), FP (Fire Protection), C (Civil), L (Landscape), G (General)";

// ---------------------------------------------------------------------------
// Pass 1
// ---------------------------------------------------------------------------

/// Page analysis prompt over the page's annotations.
pub fn pass1(sheet_number: &str, page_title: &str, annotations: &[Annotation]) -> Prompt {
    let mut listing = String::new();
    let mut has_fragments = false;

    for a in annotations {
        let fragments: Vec<String> = a
            .text_fragments
            .iter()
            .filter(|f| !f.id.is_empty() && !f.text.is_empty())
            .map(|f| format!("  [{}]: \"{}\"", f.id, f.text))
            .collect();
        has_fragments |= !fragments.is_empty();

        let _ = write!(
            listing,
            "---\nAnnotation ID: {}\nTitle: {}\nDescription: {}\nAnalysis: {}\nText Fragments:\n{}\n---\n",
            a.id,
            a.title,
            a.description.as_deref().unwrap_or(""),
            a.analysis.as_deref().unwrap_or(""),
            if fragments.is_empty() {
                "(no text fragments)".to_string()
            } else {
                fragments.join("\n")
            }
        );
    }
    if listing.is_empty() {
        listing.push_str("(No annotations on this page)\n");
    }

    let (ref_fields, ref_example) = if has_fragments {
        (
            "     - \"ref\": the target sheet/detail reference (e.g. \"AS2.1\", \"A-501\", \"3/A-401\")\n\
             \x20    - \"type\": one of detail, sheet, section, elevation, schedule\n\
             \x20    - \"source_element_id\": ID of the text fragment containing this reference\n\
             \x20    - \"source_text\": the full text of that fragment\n\
             \x20    Match each reference to the text fragment that contains it.",
            r#"{"ref": "AS2.1", "type": "detail", "source_element_id": "t5", "source_text": "SEE DETAIL AS2.1 FOR FLASHING"}"#,
        )
    } else {
        (
            "     - \"ref\": the target sheet/detail reference (e.g. \"AS2.1\", \"A-501\", \"3/A-401\")\n\
             \x20    - \"type\": one of detail, sheet, section, elevation, schedule",
            r#"{"ref": "AS2.1", "type": "detail"}"#,
        )
    };

    let full = format!(
        r#"You are analyzing a construction plan page to generate a context summary.

PAGE INFO:
- Sheet Number: {sheet_number}
- Page Title: {page_title}

ANNOTATIONS ON THIS PAGE:
{listing}
TASK:
Analyze this page and return a JSON object with:

1. "discipline": the primary discipline code, one of {DISCIPLINE_LIST}.
   If unclear, infer from content rather than the sheet number.

2. "sheet_number": the sheet designation from the title block (e.g. "A401", "M3.2"),
   or null if not clearly identifiable.

3. "summary": a dense 2-3 sentence description of what this page contains: what a
   superintendent would find here, with concrete specs, assembly types, equipment tags.

4. "pointers": for EACH annotation above:
   - "pointer_id": the Annotation ID copied exactly
   - "summary": one sentence about this region
   - "outbound_refs": references TO other sheets found in this region:
{ref_fields}
     Detail callouts like "3/A-501" mean detail 3 on sheet A-501.
     Only include explicit references, not inferred connections.

RESPOND WITH JSON ONLY:
{{
  "discipline": "A",
  "sheet_number": "A-101",
  "summary": "...",
  "pointers": [
    {{"pointer_id": "id-from-input", "summary": "...", "outbound_refs": [{ref_example}]}}
  ]
}}"#
    );

    let ids: Vec<&str> = annotations.iter().map(|a| a.id.as_str()).collect();
    let compact = format!(
        r#"Construction sheet {sheet_number} ("{page_title}"). Annotation IDs: {ids}.
Return compact JSON only, no prose:
{{"discipline": one of A,S,M,E,P,FP,C,L,G, "sheet_number": string or null, "summary": "max 2 sentences",
"pointers": [{{"pointer_id": "...", "summary": "max 1 sentence", "outbound_refs": [{{"ref": "...", "type": "detail|sheet|section|elevation|schedule"}}]}}]}}"#,
        ids = ids.join(", ")
    );

    Prompt { full, compact }
}

// ---------------------------------------------------------------------------
// Pass 2
// ---------------------------------------------------------------------------

/// Cross-reference context prompt for one page against every other page.
pub fn pass2(
    sheet_number: &str,
    page_title: &str,
    pass1: &Pass1Output,
    others: &[PageSummary],
) -> Prompt {
    let mut refs = String::new();
    let mut ref_names = Vec::new();
    for (_, r) in pass1.outbound_refs() {
        let _ = writeln!(refs, "  - {} ({})", r.target, r.ref_type.as_str());
        ref_names.push(r.target.as_str());
    }
    if refs.is_empty() {
        refs.push_str("  (No outbound references found)\n");
    }

    let mut targets = String::new();
    for page in others {
        let _ = write!(
            targets,
            "---\nSheet: {}\nSummary: {}\n---\n",
            page.sheet_number, page.summary
        );
    }
    if targets.is_empty() {
        targets.push_str("(No target page summaries available)\n");
    }

    let summary = &pass1.summary;
    let full = format!(
        r#"You are adding context to cross-references on a construction plan page.

THIS PAGE:
- Sheet Number: {sheet_number}
- Page Title: {page_title}
- Summary: {summary}

OUTBOUND REFERENCES FROM THIS PAGE:
{refs}
TARGET PAGES (where references point):
{targets}
TASK:
For each outbound reference listed above, write a "context" explaining what the
reference points to, using the target page summaries. Help a superintendent understand
what they will find if they follow the reference. Do not add references that are not listed.

RESPOND WITH JSON ONLY:
{{
  "outbound_refs_context": [
    {{"ref": "AS2.1", "context": "Canopy head detail showing flashing and drainage connections"}}
  ]
}}

Include ALL outbound references from the list above."#
    );

    let compact = format!(
        r#"Sheet {sheet_number}: {summary}
References: {list}.
Return compact JSON only: {{"outbound_refs_context": [{{"ref": "...", "context": "max 1 sentence"}}]}}"#,
        list = ref_names.join(", ")
    );

    Prompt { full, compact }
}

// ---------------------------------------------------------------------------
// Pass 3
// ---------------------------------------------------------------------------

/// One member page as seen by the discipline rollup.
#[derive(Debug, Clone)]
pub struct RollupPage {
    pub sheet_number: String,
    pub page_title: String,
    pub context: String,
    pub cross_refs: Vec<CrossRef>,
}

/// Discipline rollup prompt.
pub fn pass3(code: DisciplineCode, pages: &[RollupPage]) -> Prompt {
    let mut listing = String::new();
    for page in pages {
        let cross = page
            .cross_refs
            .iter()
            .map(|c| format!("{} ({})", c.target_sheet, c.relationship))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(
            listing,
            "---\nSheet: {}\nTitle: {}\nContext: {}\nCross-refs: {}\n---\n",
            page.sheet_number,
            page.page_title,
            page.context,
            if cross.is_empty() { "None" } else { cross.as_str() }
        );
    }
    if listing.is_empty() {
        listing.push_str("(No pages in this discipline)\n");
    }

    let name = code.name();
    let code = code.code();
    let full = format!(
        r#"You are creating a discipline-level summary for a construction project.

DISCIPLINE: {name} ({code})

ALL PAGES IN THIS DISCIPLINE:
{listing}
TASK:
Create a discipline context that helps an agent decide whether to search this discipline
for a superintendent's question. Return JSON with:

1. "context": a dense paragraph on what information lives here: key specs, assemblies,
   equipment, systems, and the schedules or details a superintendent would look for.
2. "key_contents": the most important searchable items across all pages, each with the
   sheet it lives on.
3. "connections": dependencies on other disciplines, in either direction.

RESPOND WITH JSON ONLY:
{{
  "context": "...",
  "key_contents": [{{"item": "...", "type": "...", "sheet": "..."}}],
  "connections": [{{"discipline": "...", "relationship": "..."}}]
}}"#
    );

    let sheets: Vec<&str> = pages.iter().map(|p| p.sheet_number.as_str()).collect();
    let compact = format!(
        r#"Discipline {name} ({code}), sheets: {sheets}.
Return compact JSON only: {{"context": "max 3 sentences", "key_contents": [{{"item": "...", "type": "...", "sheet": "..."}}] (max 10), "connections": [{{"discipline": "...", "relationship": "..."}}]}}"#,
        sheets = sheets.join(", ")
    );

    Prompt { full, compact }
}
