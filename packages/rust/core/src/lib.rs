//! The PlanIndex context-tree pipeline.
//!
//! Three passes turn annotated plan sheets into a searchable tree: page
//! analysis ([`PageAnalyzer`]), cross-reference context
//! ([`CrossReferenceAnnotator`]) and discipline rollups
//! ([`DisciplineAggregator`]). [`Orchestrator`] sequences them;
//! [`ControlService`] is the surface the CLI and HTTP server talk to.

pub mod control;
pub mod cross_ref;
pub mod discipline;
pub mod export;
pub mod jobs;
pub mod normalize;
pub mod orchestrator;
pub mod page_analyzer;
pub mod progress;
pub mod prompts;
pub mod propagate;
pub mod resolver;

#[cfg(test)]
pub(crate) mod test_support;

pub use control::{ControlService, OverallStatus, ProcessingStatus, TriggerResponse};
pub use cross_ref::CrossReferenceAnnotator;
pub use discipline::DisciplineAggregator;
pub use export::{ContextTree, export_project, to_pretty_json};
pub use jobs::{JobHandle, JobRegistry, Registration};
pub use normalize::normalize;
pub use orchestrator::Orchestrator;
pub use page_analyzer::{PageAnalyzer, Pass1Result};
pub use progress::{
    AggregationSummary, ProcessingSummary, ProgressBroadcaster, ProgressEvent, ProgressUpdate,
    RunSummary, StreamItem, Subscription, SweptPage,
};
pub use propagate::ContextPropagator;
pub use resolver::ReferenceResolver;
