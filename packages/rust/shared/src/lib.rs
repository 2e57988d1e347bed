//! Shared types, error model, and configuration for PlanIndex.
//!
//! This crate is the foundation depended on by all other PlanIndex crates.
//! It provides:
//! - [`PlanIndexError`] and [`OracleError`], the unified error types
//! - Domain types ([`PageRecord`], [`DisciplineRecord`], [`PageStatus`], [`Pass1Output`], ...)
//! - Configuration ([`AppConfig`], [`ProcessingConfig`], [`RetryConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DatabaseConfig, OracleConfig, ProcessingConfig, ProcessingSection,
    ProgressSection, RetryConfig, RetrySection, ServerConfig, config_dir, config_file_path,
    expand_home, init_config, load_config, load_config_from, resolve_api_key, validate_api_key,
};
pub use error::{OracleError, PlanIndexError, Result};
pub use types::{
    Annotation, AnnotationAnalysis, CURRENT_OUTPUT_VERSION, CrossRef, DisciplineCode,
    DisciplineConnection, DisciplineRecord, DisciplineRollup, DisciplineStatus, InboundReference,
    JobId, JobKind, KeyContent, OutboundRef, PageRecord, PageStatus, PageSummary, Pass1Output,
    Pass2Output, RefContext, ReferenceType, TextFragment, sheet_number_from_filename,
    title_from_filename,
};
