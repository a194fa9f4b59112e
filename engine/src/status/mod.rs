//! Run status records and the store contract
//!
//! One [`StatusRecord`] per session ID is the only durable trace of a run.
//! Writers send partial [`StatusUpdate`]s; the store merges them with
//! [`StatusRecord::merge`]:
//!
//! - text fields keep their stored value when the incoming one is empty or unset
//! - `status` moves forward only, and terminal statuses are sticky
//! - `error_detail` is replaced together with an accepted status, and only then
//! - a merge that changes nothing writes nothing, so repeating an upsert is a no-op
//!
//! Pollers read the narrower [`StatusView`].

use async_trait::async_trait;
use sdk::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::debug;

pub mod phase;

pub use phase::{ParsePhaseError, Phase};

/// Durable per-session record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub session_id: String,
    pub prompt: String,
    /// JSON-serialized plan
    pub plan: String,
    /// JSON-serialized step records
    pub step_outputs: String,
    pub final_result: String,
    pub status: Phase,
    pub error_detail: String,
    /// Unix milliseconds
    pub created_at: i64,
    /// Unix milliseconds
    pub updated_at: i64,
}

impl StatusRecord {
    /// Fresh record in `PENDING`
    pub fn new(session_id: impl Into<String>, now: i64) -> Self {
        Self {
            session_id: session_id.into(),
            prompt: String::new(),
            plan: String::new(),
            step_outputs: String::new(),
            final_result: String::new(),
            status: Phase::Pending,
            error_detail: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge `update` into this record. Returns whether anything changed.
    pub fn merge(&mut self, update: &StatusUpdate, now: i64) -> bool {
        let mut changed = false;

        changed |= merge_text(&mut self.prompt, update.prompt.as_deref());
        changed |= merge_text(&mut self.plan, update.plan.as_deref());
        changed |= merge_text(&mut self.step_outputs, update.step_outputs.as_deref());
        changed |= merge_text(&mut self.final_result, update.final_result.as_deref());

        // Terminal records keep their status and error detail
        let mut replace_detail = update.error_detail.is_some() && !self.status.is_terminal();

        if let Some(next) = update.status {
            if self.status.can_advance_to(next) {
                if self.status != next {
                    self.status = next;
                    changed = true;
                }
                replace_detail = true;
            } else {
                debug!(
                    session_id = %self.session_id,
                    current = %self.status,
                    rejected = %next,
                    "ignoring non-monotonic status update"
                );
            }
        }

        if replace_detail {
            let detail = update.error_detail.as_deref().unwrap_or_default();
            if self.error_detail != detail {
                self.error_detail = detail.to_string();
                changed = true;
            }
        }

        if changed {
            self.updated_at = now.max(self.updated_at);
        }
        changed
    }

    pub fn view(&self) -> StatusView {
        StatusView::from(self)
    }
}

fn merge_text(field: &mut String, incoming: Option<&str>) -> bool {
    match incoming {
        Some(value) if !value.is_empty() && field != value => {
            *field = value.to_string();
            true
        }
        _ => false,
    }
}

/// Partial record sent by writers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub prompt: Option<String>,
    pub plan: Option<String>,
    pub step_outputs: Option<String>,
    pub final_result: Option<String>,
    pub status: Option<Phase>,
    pub error_detail: Option<String>,
}

impl StatusUpdate {
    /// Update that only moves the status
    pub fn phase(phase: Phase) -> Self {
        Self {
            status: Some(phase),
            ..Default::default()
        }
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    pub fn step_outputs(mut self, outputs: impl Into<String>) -> Self {
        self.step_outputs = Some(outputs.into());
        self
    }

    pub fn final_result(mut self, result: impl Into<String>) -> Self {
        self.final_result = Some(result.into());
        self
    }

    pub fn error_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }
}

/// What a polling caller sees
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusView {
    pub session_id: String,
    pub status: String,
    pub final_result: Option<String>,
    pub error_detail: Option<String>,
}

impl StatusView {
    /// Anything other than COMPLETED or FAILED means keep polling.
    pub fn is_running(&self) -> bool {
        !matches!(
            self.status.parse::<Phase>(),
            Ok(Phase::Completed) | Ok(Phase::Failed)
        )
    }
}

impl From<&StatusRecord> for StatusView {
    fn from(record: &StatusRecord) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            session_id: record.session_id.clone(),
            status: record.status.to_string(),
            final_result: non_empty(&record.final_result),
            error_detail: non_empty(&record.error_detail),
        }
    }
}

/// Durable key-value-by-session store with merge-upsert
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Create the record if absent (in `PENDING`), then merge `update`.
    /// Returns the stored record after the merge.
    async fn upsert(&self, session_id: &str, update: StatusUpdate)
        -> Result<StatusRecord, PipelineError>;

    async fn get(&self, session_id: &str) -> Result<Option<StatusRecord>, PipelineError>;

    /// Most recently updated records first
    async fn recent(&self, limit: usize) -> Result<Vec<StatusRecord>, PipelineError>;
}

/// Non-durable store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: Mutex<HashMap<String, StatusRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn upsert(
        &self,
        session_id: &str,
        update: StatusUpdate,
    ) -> Result<StatusRecord, PipelineError> {
        let now = now_millis();
        let mut records = self.records.lock().await;
        let record = records
            .entry(session_id.to_string())
            .or_insert_with(|| StatusRecord::new(session_id, now));
        record.merge(&update, now);
        Ok(record.clone())
    }

    async fn get(&self, session_id: &str) -> Result<Option<StatusRecord>, PipelineError> {
        Ok(self.records.lock().await.get(session_id).cloned())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StatusRecord>, PipelineError> {
        let records = self.records.lock().await;
        let mut all: Vec<StatusRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        all.truncate(limit);
        Ok(all)
    }
}

/// Current time as Unix milliseconds
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
