//! Core domain types for the plan-sheet context tree.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PlanIndexError;

/// Current version written into every pass checkpoint.
pub const CURRENT_OUTPUT_VERSION: u32 = 1;

fn current_output_version() -> u32 {
    CURRENT_OUTPUT_VERSION
}

// ---------------------------------------------------------------------------
// JobId / JobKind
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for processing job identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The two independent kinds of processing run a project can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Pass 1 + Pass 2 (+ rollup of disciplines that become ready).
    Pages,
    /// Pass 3 over disciplines whose pages are all complete.
    Disciplines,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pages => "pages",
            Self::Disciplines => "disciplines",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Discipline codes
// ---------------------------------------------------------------------------

/// Closed set of trade disciplines a sheet can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DisciplineCode {
    #[serde(rename = "A")]
    Architectural,
    #[serde(rename = "S")]
    Structural,
    #[serde(rename = "M")]
    Mechanical,
    #[serde(rename = "E")]
    Electrical,
    #[serde(rename = "P")]
    Plumbing,
    #[serde(rename = "FP")]
    FireProtection,
    #[serde(rename = "C")]
    Civil,
    #[serde(rename = "L")]
    Landscape,
    #[serde(rename = "G")]
    General,
}

impl DisciplineCode {
    pub const ALL: [DisciplineCode; 9] = [
        Self::Architectural,
        Self::Structural,
        Self::Mechanical,
        Self::Electrical,
        Self::Plumbing,
        Self::FireProtection,
        Self::Civil,
        Self::Landscape,
        Self::General,
    ];

    /// Short code as printed on sheets (`"A"`, `"FP"`, ...).
    pub fn code(&self) -> &'static str {
        match self {
            Self::Architectural => "A",
            Self::Structural => "S",
            Self::Mechanical => "M",
            Self::Electrical => "E",
            Self::Plumbing => "P",
            Self::FireProtection => "FP",
            Self::Civil => "C",
            Self::Landscape => "L",
            Self::General => "G",
        }
    }

    /// Human-readable display name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Architectural => "Architectural",
            Self::Structural => "Structural",
            Self::Mechanical => "Mechanical",
            Self::Electrical => "Electrical",
            Self::Plumbing => "Plumbing",
            Self::FireProtection => "Fire Protection",
            Self::Civil => "Civil",
            Self::Landscape => "Landscape",
            Self::General => "General",
        }
    }

    /// Strict lookup by code, case-insensitive.
    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.trim();
        Self::ALL
            .into_iter()
            .find(|d| d.code().eq_ignore_ascii_case(code))
    }

    /// Lenient lookup used on oracle output: anything unrecognized is General.
    pub fn from_code_or_general(code: &str) -> Self {
        Self::from_code(code).unwrap_or(Self::General)
    }
}

impl Default for DisciplineCode {
    fn default() -> Self {
        Self::General
    }
}

impl fmt::Display for DisciplineCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle of a page through Pass 1 and Pass 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Unprocessed,
    Pass1Processing,
    Pass1Complete,
    Pass2Processing,
    Pass2Complete,
    Error,
}

impl PageStatus {
    pub const ALL: [PageStatus; 6] = [
        Self::Unprocessed,
        Self::Pass1Processing,
        Self::Pass1Complete,
        Self::Pass2Processing,
        Self::Pass2Complete,
        Self::Error,
    ];

    /// Statuses picked up by Pass 1; `pass1_processing` recovers pages
    /// orphaned by a crash.
    pub const PASS1_CANDIDATES: [PageStatus; 3] =
        [Self::Unprocessed, Self::Error, Self::Pass1Processing];

    /// Statuses picked up by Pass 2.
    pub const PASS2_CANDIDATES: [PageStatus; 2] = [Self::Pass1Complete, Self::Pass2Processing];

    /// Statuses whose row carries a valid `pass1_output`.
    pub const HAS_PASS1_OUTPUT: [PageStatus; 3] =
        [Self::Pass1Complete, Self::Pass2Processing, Self::Pass2Complete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Pass1Processing => "pass1_processing",
            Self::Pass1Complete => "pass1_complete",
            Self::Pass2Processing => "pass2_processing",
            Self::Pass2Complete => "pass2_complete",
            Self::Error => "error",
        }
    }

    /// The lifecycle transition table. The sweep may send any page that has
    /// not reached `pass2_complete` back to `unprocessed`.
    pub fn can_transition_to(self, next: PageStatus) -> bool {
        use PageStatus::*;
        matches!(
            (self, next),
            (Unprocessed | Error | Pass1Processing, Pass1Processing)
                | (Pass1Processing, Pass1Complete | Error)
                | (Pass1Complete | Pass2Processing, Pass2Processing)
                | (Pass2Processing, Pass2Complete | Error)
                | (
                    Unprocessed | Pass1Processing | Pass1Complete | Pass2Processing | Error,
                    Unprocessed
                )
        )
    }

    /// Every status allowed to move into `next`.
    pub fn predecessors(next: PageStatus) -> Vec<PageStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }

    /// Validate a transition, returning the new status.
    pub fn transition(self, next: PageStatus) -> crate::Result<PageStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(PlanIndexError::invalid_transition("page", self, next))
        }
    }

    pub fn has_pass1_output(&self) -> bool {
        Self::HAS_PASS1_OUTPUT.contains(self)
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PageStatus {
    type Err = PlanIndexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| PlanIndexError::validation(format!("unknown page status: {s}")))
    }
}

/// Lifecycle of a discipline rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisciplineStatus {
    Waiting,
    Ready,
    Processing,
    Complete,
    Error,
}

impl DisciplineStatus {
    pub const ALL: [DisciplineStatus; 5] = [
        Self::Waiting,
        Self::Ready,
        Self::Processing,
        Self::Complete,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn can_transition_to(self, next: DisciplineStatus) -> bool {
        use DisciplineStatus::*;
        matches!(
            (self, next),
            (Waiting, Ready) | (Ready, Processing) | (Processing, Complete | Error)
        )
    }

    pub fn predecessors(next: DisciplineStatus) -> Vec<DisciplineStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }

    pub fn transition(self, next: DisciplineStatus) -> crate::Result<DisciplineStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(PlanIndexError::invalid_transition("discipline", self, next))
        }
    }
}

impl fmt::Display for DisciplineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisciplineStatus {
    type Err = PlanIndexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| PlanIndexError::validation(format!("unknown discipline status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Annotations (read-only collaborator input)
// ---------------------------------------------------------------------------

/// A text span extracted from the annotated region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextFragment {
    pub id: String,
    pub text: String,
}

/// A user-drawn region on a page, with its prior analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub document_id: String,
    pub page_number: u32,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Earlier free-text analysis of the region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub text_fragments: Vec<TextFragment>,
}

// ---------------------------------------------------------------------------
// Pass 1 checkpoint
// ---------------------------------------------------------------------------

/// Kind of callout a reference represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceType {
    #[default]
    Detail,
    Sheet,
    Section,
    Elevation,
    Schedule,
    #[serde(other)]
    Other,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detail => "detail",
            Self::Sheet => "sheet",
            Self::Section => "section",
            Self::Elevation => "elevation",
            Self::Schedule => "schedule",
            Self::Other => "other",
        }
    }
}

/// A reference from an annotation to another sheet, as authored by Pass 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRef {
    #[serde(rename = "ref")]
    pub target: String,
    #[serde(rename = "type", default)]
    pub ref_type: ReferenceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_text: Option<String>,
}

/// Pass 1 analysis of one annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationAnalysis {
    #[serde(alias = "pointer_id")]
    pub annotation_id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub outbound_refs: Vec<OutboundRef>,
}

/// Durable Pass 1 checkpoint for a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pass1Output {
    #[serde(default = "current_output_version")]
    pub version: u32,
    pub discipline: DisciplineCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_number: Option<String>,
    pub summary: String,
    #[serde(default, alias = "pointers")]
    pub annotations: Vec<AnnotationAnalysis>,
}

impl Pass1Output {
    /// All outbound references across annotations, with the authoring annotation id.
    pub fn outbound_refs(&self) -> impl Iterator<Item = (&str, &OutboundRef)> {
        self.annotations.iter().flat_map(|a| {
            a.outbound_refs
                .iter()
                .map(move |r| (a.annotation_id.as_str(), r))
        })
    }
}

// ---------------------------------------------------------------------------
// Inbound references
// ---------------------------------------------------------------------------

/// A reference pointing at this page, derived by inverting other pages' Pass 1 output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundReference {
    pub source_sheet: String,
    pub source_page_id: String,
    pub from_annotation: String,
    #[serde(rename = "type")]
    pub ref_type: ReferenceType,
    /// The reference string exactly as written on the source page.
    pub original_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_text: Option<String>,
    /// Filled in from the source page's Pass 2 output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

// ---------------------------------------------------------------------------
// Pass 2 checkpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefContext {
    #[serde(rename = "ref")]
    pub target: String,
    #[serde(default)]
    pub context: String,
}

/// Durable Pass 2 checkpoint for a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pass2Output {
    #[serde(default = "current_output_version")]
    pub version: u32,
    #[serde(default)]
    pub outbound_refs_context: Vec<RefContext>,
}

/// Flattened cross reference kept for consumers of the older page shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossRef {
    pub target_sheet: String,
    pub relationship: String,
}

// ---------------------------------------------------------------------------
// Pass 3 checkpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyContent {
    pub item: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub sheet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisciplineConnection {
    pub discipline: String,
    #[serde(default)]
    pub relationship: String,
}

/// Everything Pass 3 writes onto a discipline row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisciplineRollup {
    pub context: String,
    #[serde(default)]
    pub key_contents: Vec<KeyContent>,
    #[serde(default)]
    pub connections: Vec<DisciplineConnection>,
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One materialized (document, page) pair with at least one annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub id: String,
    pub project_id: String,
    pub document_id: String,
    pub page_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discipline_code: Option<DisciplineCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discipline_id: Option<String>,
    pub processing_status: PageStatus,
    /// Page summary from Pass 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass1_output: Option<Pass1Output>,
    #[serde(default)]
    pub inbound_references: Vec<InboundReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass2_output: Option<Pass2Output>,
    #[serde(default)]
    pub cross_refs: Vec<CrossRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_context: Option<String>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PageRecord {
    /// Label used when talking about this page: its sheet number, or `Page {n}`.
    pub fn sheet_label(&self) -> String {
        self.sheet_number
            .clone()
            .unwrap_or_else(|| format!("Page {}", self.page_number))
    }

    /// Summary fed to other pages' prompts.
    pub fn summary(&self) -> &str {
        self.context_description
            .as_deref()
            .or_else(|| self.pass1_output.as_ref().map(|o| o.summary.as_str()))
            .unwrap_or("")
    }

    /// True when the stored outputs agree with the status: a status that
    /// implies a pass has finished always has that pass's checkpoint.
    pub fn checkpoint_consistent(&self) -> bool {
        let pass1_ok = !self.processing_status.has_pass1_output() || self.pass1_output.is_some();
        let pass2_ok =
            self.processing_status != PageStatus::Pass2Complete || self.pass2_output.is_some();
        pass1_ok && pass2_ok
    }
}

/// One discipline rollup row per (project, code).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisciplineRecord {
    pub id: String,
    pub project_id: String,
    pub code: DisciplineCode,
    pub name: String,
    pub processing_status: DisciplineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_description: Option<String>,
    #[serde(default)]
    pub key_contents: Vec<KeyContent>,
    #[serde(default)]
    pub connections: Vec<DisciplineConnection>,
    pub updated_at: DateTime<Utc>,
}

/// `{sheet_number, summary}` handed to Pass 2 for every other page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSummary {
    pub page_id: String,
    pub sheet_number: String,
    pub summary: String,
}

// ---------------------------------------------------------------------------
// Filename helpers
// ---------------------------------------------------------------------------

static SHEET_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^([A-Z]{1,2}\d{2,3}(?:\.\d+)?)").expect("valid regex")
});

/// Page title from a document file name: the name without a `.pdf` suffix.
pub fn title_from_filename(filename: &str) -> String {
    let len = filename.len();
    if len >= 4 && filename[len - 4..].eq_ignore_ascii_case(".pdf") {
        filename[..len - 4].to_string()
    } else {
        filename.to_string()
    }
}

/// Leading sheet designation of a file name (`"A401 Details.pdf"` → `"A401"`).
pub fn sheet_number_from_filename(filename: &str) -> Option<String> {
    SHEET_PREFIX
        .captures(filename)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_uppercase())
}
