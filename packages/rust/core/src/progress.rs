//! Per-project progress fan-out.
//!
//! Each project gets one `tokio::sync::broadcast` channel. Publishing never
//! blocks the pipeline: with no subscribers the event is dropped, and a slow
//! subscriber loses the oldest events once the ring is full.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use planindex_shared::{DisciplineCode, JobId, ProgressSection};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Totals reported when a page run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSummary {
    pub pass1_completed: usize,
    pub pass1_errors: usize,
    pub pass2_completed: usize,
    pub pass2_errors: usize,
    pub permanently_failed: usize,
    pub disciplines_completed: usize,
    pub rounds: u32,
}

/// Totals reported when a discipline run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationSummary {
    pub disciplines_ready: usize,
    pub disciplines_completed: usize,
    pub disciplines_failed: usize,
}

/// Payload of `processing_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RunSummary {
    Pages(ProcessingSummary),
    Disciplines(AggregationSummary),
}

/// A page named by the orphan sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweptPage {
    pub page_id: String,
    pub sheet_number: String,
    pub retry_count: u32,
}

/// A typed progress event. Serializes to its camelCase payload; the event
/// name comes from [`ProgressEvent::name`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum ProgressEvent {
    ProcessingStarted {
        pass1_total: usize,
        round: u32,
    },
    RetryRoundStarted {
        pass1_total: usize,
        round: u32,
    },
    PagePass1Complete {
        page_id: String,
        sheet_number: String,
        discipline: DisciplineCode,
        pass1_progress: usize,
        pass1_total: usize,
    },
    Pass1Complete {
        completed: usize,
        errors: usize,
        disciplines: Vec<DisciplineCode>,
    },
    PagePass2Complete {
        page_id: String,
        sheet_number: String,
        pass2_progress: usize,
        pass2_total: usize,
    },
    Pass2Complete {
        completed: usize,
        errors: usize,
    },
    DisciplineReady {
        discipline_code: DisciplineCode,
        discipline_name: String,
    },
    DisciplineComplete {
        discipline_code: DisciplineCode,
        discipline_name: String,
        page_count: usize,
        key_contents_count: usize,
    },
    OrphansSwept {
        requeued: Vec<SweptPage>,
        permanently_failed: Vec<SweptPage>,
    },
    PageError {
        page_id: String,
        pass: u8,
        error: String,
    },
    DisciplineError {
        discipline_code: DisciplineCode,
        pass: u8,
        error: String,
    },
    ProcessingComplete {
        summary: RunSummary,
    },
    ProcessingError {
        error: String,
    },
}

impl ProgressEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProcessingStarted { .. } => "processing_started",
            Self::RetryRoundStarted { .. } => "retry_round_started",
            Self::PagePass1Complete { .. } => "page_pass1_complete",
            Self::Pass1Complete { .. } => "pass1_complete",
            Self::PagePass2Complete { .. } => "page_pass2_complete",
            Self::Pass2Complete { .. } => "pass2_complete",
            Self::DisciplineReady { .. } => "discipline_ready",
            Self::DisciplineComplete { .. } => "discipline_complete",
            Self::OrphansSwept { .. } => "orphans_swept",
            Self::PageError { .. } | Self::DisciplineError { .. } => "error",
            Self::ProcessingComplete { .. } => "processing_complete",
            Self::ProcessingError { .. } => "processing_error",
        }
    }

    /// Events after which a subscription closes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ProcessingComplete { .. } | Self::ProcessingError { .. }
        )
    }
}

/// An event stamped with the job that produced it.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job_id: JobId,
    pub event: ProgressEvent,
}

impl ProgressUpdate {
    pub fn name(&self) -> &'static str {
        self.event.name()
    }

    /// JSON payload with `jobId` merged in.
    pub fn payload(&self) -> Value {
        let mut value = serde_json::to_value(&self.event).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut value {
            map.insert("jobId".into(), Value::String(self.job_id.to_string()));
        }
        value
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Connected,
    Event(ProgressUpdate),
    KeepAlive,
}

/// Owns one broadcast channel per project.
pub struct ProgressBroadcaster {
    channels: Mutex<HashMap<String, broadcast::Sender<ProgressUpdate>>>,
    capacity: usize,
    keepalive: Duration,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize, keepalive: Duration) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            keepalive,
        }
    }

    fn sender(&self, project_id: &str) -> broadcast::Sender<ProgressUpdate> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish an event to every live subscriber of `project_id`.
    pub fn publish(&self, project_id: &str, job_id: &JobId, event: ProgressEvent) {
        debug!(project_id, job_id = %job_id, event = event.name(), "progress");
        let update = ProgressUpdate {
            job_id: job_id.clone(),
            event,
        };
        // No receivers is not an error.
        let _ = self.sender(project_id).send(update);
    }

    /// Subscribe to a project's events from now on.
    pub fn subscribe(&self, project_id: &str) -> Subscription {
        Subscription {
            rx: self.sender(project_id).subscribe(),
            keepalive: self.keepalive,
            job: None,
            connected: false,
            finished: false,
        }
    }

    pub fn subscriber_count(&self, project_id: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .get(project_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop the channel of a project nobody is listening to.
    pub fn prune(&self, project_id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if channels
            .get(project_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(project_id);
        }
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::from(&ProgressSection::default())
    }
}

impl From<&ProgressSection> for ProgressBroadcaster {
    fn from(section: &ProgressSection) -> Self {
        Self::new(
            section.channel_capacity,
            Duration::from_secs(section.keepalive_secs),
        )
    }
}

/// One live subscriber.
pub struct Subscription {
    rx: broadcast::Receiver<ProgressUpdate>,
    keepalive: Duration,
    job: Option<JobId>,
    connected: bool,
    finished: bool,
}

impl Subscription {
    /// Close only on a terminal event of `job_id`. Unbound, the first job
    /// seen is followed.
    pub fn follow(&mut self, job_id: JobId) {
        self.job = Some(job_id);
    }

    pub fn following(&self) -> Option<&JobId> {
        self.job.as_ref()
    }

    /// Next item: `Connected` first, then events, with a keepalive whenever
    /// nothing arrives for the keepalive interval. Returns `None` after a
    /// terminal event or when the channel closes.
    pub async fn next(&mut self) -> Option<StreamItem> {
        if !self.connected {
            self.connected = true;
            return Some(StreamItem::Connected);
        }
        if self.finished {
            return None;
        }
        loop {
            match tokio::time::timeout(self.keepalive, self.rx.recv()).await {
                Err(_) => return Some(StreamItem::KeepAlive),
                Ok(Ok(update)) => {
                    let job = self.job.get_or_insert_with(|| update.job_id.clone());
                    self.finished = update.event.is_terminal() && *job == update.job_id;
                    return Some(StreamItem::Event(update));
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "progress subscriber lagged, events dropped");
                }
                Ok(Err(RecvError::Closed)) => return None,
            }
        }
    }
}
