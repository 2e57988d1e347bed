//! Shared fixtures for pipeline tests: a temp database, a scripted oracle,
//! and builders for page rows.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use planindex_oracle::{AnalysisOracle, OracleRequest, OutputBudget, RetryPolicy, StructuredOracle};
use planindex_shared::{
    Annotation, AnnotationAnalysis, DisciplineCode, OracleError, OutboundRef, PageRecord,
    PageStatus, Pass1Output, ProcessingConfig, ReferenceType,
};
use planindex_storage::Storage;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::control::ControlService;
use crate::cross_ref::CrossReferenceAnnotator;
use crate::discipline::DisciplineAggregator;
use crate::jobs::JobRegistry;
use crate::orchestrator::Orchestrator;
use crate::page_analyzer::PageAnalyzer;
use crate::progress::{ProgressBroadcaster, StreamItem, Subscription};

type Responder = Arc<dyn Fn(&str) -> Result<String, OracleError> + Send + Sync>;

/// Oracle double: queued responses first, then the responder, else an error.
/// Tracks how many calls are in flight at once.
#[derive(Default)]
pub struct ScriptedOracle {
    queue: Mutex<VecDeque<Result<String, OracleError>>>,
    responder: Mutex<Option<Responder>>,
    prompts: Mutex<Vec<String>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    latency: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Holds every oracle call until released.
pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn release(&self) {
        self.0.add_permits(1 << 20);
    }
}

impl ScriptedOracle {
    pub fn push_ok(&self, text: &str) {
        self.queue.lock().unwrap().push_back(Ok(text.to_string()));
    }

    pub fn push_err(&self, error: OracleError) {
        self.queue.lock().unwrap().push_back(Err(error));
    }

    pub fn respond_with<F>(&self, f: F)
    where
        F: Fn(&str) -> Result<String, OracleError> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn hold(&self) -> Gate {
        let semaphore = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(semaphore.clone());
        Gate(semaphore)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Every call sleeps this long before answering.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    /// Most calls ever in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn answer(&self, prompt: &str) -> Result<String, OracleError> {
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            return next;
        }
        let responder = self.responder.lock().unwrap().clone();
        match responder {
            Some(f) => f(prompt),
            None => Err(OracleError::NotConfigured("script exhausted".into())),
        }
    }
}

#[async_trait]
impl AnalysisOracle for ScriptedOracle {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &OracleRequest) -> Result<String, OracleError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }
        self.prompts.lock().unwrap().push(request.prompt.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let answer = self.answer(&request.prompt);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        answer
    }
}

/// Answers for a small plan set: A-101 references M-201, M-201 references nothing.
pub fn scripted_plan_set(prompt: &str) -> Result<String, OracleError> {
    let text = if prompt.contains("DISCIPLINE:") || prompt.starts_with("Discipline ") {
        r#"{"context": "Discipline rollup.",
            "key_contents": [{"item": "Schedule", "type": "schedule", "sheet": ""}],
            "connections": []}"#
    } else if prompt.contains("OUTBOUND REFERENCES") || prompt.contains("References:") {
        r#"{"outbound_refs_context": [{"ref": "M-201", "context": "Level 2 ductwork layout"}]}"#
    } else if prompt.contains("A-101") {
        r#"{"discipline": "A", "sheet_number": "A-101", "summary": "Ground floor plan.",
            "pointers": [{"pointer_id": "ann-1", "summary": "Ceiling note",
                "outbound_refs": [{"ref": "M-201", "type": "sheet"}]}]}"#
    } else if prompt.contains("M-201") {
        r#"{"discipline": "M", "sheet_number": "M-201", "summary": "Level 2 HVAC plan.",
            "pointers": []}"#
    } else {
        r#"{"discipline": "G", "summary": "General notes."}"#
    };
    Ok(text.to_string())
}

pub struct Fixture {
    pub storage: Arc<Storage>,
    pub oracle: Arc<ScriptedOracle>,
    pub progress: Arc<ProgressBroadcaster>,
    pub project_id: String,
    pub config: ProcessingConfig,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_config(ProcessingConfig {
            concurrency: 5,
            max_page_retries: 3,
        })
        .await
    }

    pub async fn with_config(config: ProcessingConfig) -> Self {
        let path = std::env::temp_dir().join(format!("pi_core_test_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&path).await.expect("open test db");
        let project_id = Uuid::now_v7().to_string();
        storage
            .insert_project(&project_id, "test-project")
            .await
            .expect("insert project");
        Self {
            storage: Arc::new(storage),
            oracle: Arc::new(ScriptedOracle::default()),
            progress: Arc::new(ProgressBroadcaster::new(64, Duration::from_millis(20))),
            project_id,
            config,
        }
    }

    /// Add a document with one annotation on `page_number`, materialize, and
    /// return the page id.
    pub async fn page(&self, document_name: &str, page_number: u32) -> String {
        let document_id = Uuid::now_v7().to_string();
        self.storage
            .insert_document(&document_id, &self.project_id, document_name)
            .await
            .expect("insert document");
        self.storage
            .insert_annotation(&Annotation {
                id: Uuid::now_v7().to_string(),
                document_id: document_id.clone(),
                page_number,
                title: format!("{document_name} callout"),
                description: None,
                analysis: Some("Detail callout".into()),
                text_fragments: vec![],
            })
            .await
            .expect("insert annotation");
        self.storage
            .materialize_pages(&self.project_id)
            .await
            .expect("materialize");
        self.storage
            .list_pages(&self.project_id)
            .await
            .expect("list pages")
            .into_iter()
            .find(|p| p.document_id == document_id && p.page_number == page_number)
            .expect("materialized page")
            .id
    }

    /// A page taken through Pass 1 and Pass 2 with no references, assigned to `code`.
    pub async fn completed_page(&self, document_name: &str, code: &str) -> String {
        let page_id = self.page(document_name, 1).await;
        self.oracle.push_ok(&format!(
            r#"{{"discipline": "{code}", "summary": "{document_name} summary."}}"#
        ));
        self.analyzer().analyze(&page_id).await.expect("pass 1");
        self.storage
            .ensure_disciplines(&self.project_id, &[DisciplineCode::from_code_or_general(code)])
            .await
            .expect("ensure disciplines");
        let page = self.storage.get_page(&page_id).await.expect("page");
        self.annotator().annotate(&page, &[]).await.expect("pass 2");
        page_id
    }

    pub fn structured(&self) -> StructuredOracle {
        StructuredOracle::new(
            self.oracle.clone(),
            RetryPolicy::new(3, Duration::from_millis(1)),
            OutputBudget::default(),
        )
    }

    pub fn analyzer(&self) -> PageAnalyzer {
        PageAnalyzer::new(self.storage.clone(), self.structured())
    }

    pub fn annotator(&self) -> CrossReferenceAnnotator {
        CrossReferenceAnnotator::new(self.storage.clone(), self.structured())
    }

    pub fn aggregator(&self) -> DisciplineAggregator {
        DisciplineAggregator::new(self.storage.clone(), self.structured(), self.progress.clone())
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.storage.clone(),
            self.structured(),
            self.progress.clone(),
            self.config.clone(),
        )
    }

    pub fn control(&self) -> ControlService {
        ControlService::new(
            Arc::new(self.orchestrator()),
            Arc::new(JobRegistry::new()),
            self.progress.clone(),
        )
    }
}

/// Event names received until the stream goes idle or closes.
pub async fn drain_names(sub: &mut Subscription) -> Vec<String> {
    let mut names = Vec::new();
    while let Some(item) = sub.next().await {
        match item {
            StreamItem::Connected => {}
            StreamItem::Event(update) => names.push(update.name().to_string()),
            StreamItem::KeepAlive => break,
        }
    }
    names
}

/// Pass 1 output with one annotation per `(annotation_id, reference)` pair.
pub fn pass1(code: &str, refs: &[(&str, &str)]) -> Pass1Output {
    Pass1Output {
        version: 1,
        discipline: DisciplineCode::from_code_or_general(code),
        sheet_number: None,
        summary: format!("{code} sheet"),
        annotations: refs
            .iter()
            .map(|(annotation_id, target)| AnnotationAnalysis {
                annotation_id: annotation_id.to_string(),
                summary: String::new(),
                outbound_refs: vec![OutboundRef {
                    target: target.to_string(),
                    ref_type: ReferenceType::Sheet,
                    source_element_id: None,
                    source_text: None,
                }],
            })
            .collect(),
    }
}

/// An in-memory page row; `Some(pass1)` makes it `pass1_complete`.
pub fn page_record(id: &str, sheet: &str, pass1: Option<Pass1Output>) -> PageRecord {
    PageRecord {
        id: id.into(),
        project_id: "project".into(),
        document_id: format!("doc-{id}"),
        page_number: 1,
        page_title: None,
        sheet_number: Some(sheet.into()),
        discipline_code: pass1.as_ref().map(|o| o.discipline),
        discipline_id: None,
        processing_status: if pass1.is_some() {
            PageStatus::Pass1Complete
        } else {
            PageStatus::Unprocessed
        },
        context_description: pass1.as_ref().map(|o| o.summary.clone()),
        pass1_output: pass1,
        inbound_references: vec![],
        pass2_output: None,
        cross_refs: vec![],
        updated_context: None,
        retry_count: 0,
        error_message: None,
        updated_at: Utc::now(),
    }
}
