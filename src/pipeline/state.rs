//! Stage and pipeline run state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::StageError;
use crate::types::{PipelineProfile, StageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }

    fn can_transition_to(self, next: StageStatus) -> bool {
        matches!(
            (self, next),
            (StageStatus::Pending, StageStatus::Running)
                | (StageStatus::Pending, StageStatus::Skipped)
                | (StageStatus::Running, StageStatus::Completed)
                | (StageStatus::Running, StageStatus::Failed)
                | (StageStatus::Running, StageStatus::Skipped)
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one stage within a run. Terminal states are never reopened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageId,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageResult {
    pub fn pending(stage: StageId) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            payload: None,
            error: None,
            from_cache: false,
            retry_count: 0,
            skip_reason: None,
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, next: StageStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        let now = Utc::now();
        if next == StageStatus::Running {
            self.started_at = Some(now);
        } else {
            self.finished_at = Some(now);
        }
        true
    }

    pub(crate) fn start(&mut self) -> bool {
        self.transition(StageStatus::Running)
    }

    pub(crate) fn complete(&mut self, payload: Value, from_cache: bool) -> bool {
        if !self.transition(StageStatus::Completed) {
            return false;
        }
        self.payload = Some(payload);
        self.from_cache = from_cache;
        true
    }

    pub(crate) fn fail(&mut self, error: StageError, retry_count: u32) -> bool {
        if !self.transition(StageStatus::Failed) {
            return false;
        }
        self.error = Some(error);
        self.retry_count = retry_count;
        true
    }

    pub(crate) fn skip(&mut self, reason: impl Into<String>) -> bool {
        if !self.transition(StageStatus::Skipped) {
            return false;
        }
        self.skip_reason = Some(reason.into());
        true
    }

    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        (finished - started).to_std().ok()
    }
}

/// Terminal state of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Completed,
    Partial,
    Failed,
    Aborted,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Completed => "completed",
            PipelineStatus::Partial => "partial",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Aborted => "aborted",
        }
    }

    /// `completed` when every scheduled stage completed, `failed` when none did,
    /// `partial` otherwise.
    pub fn from_counts(completed: usize, scheduled: usize) -> Self {
        if scheduled > 0 && completed == scheduled {
            PipelineStatus::Completed
        } else if completed == 0 {
            PipelineStatus::Failed
        } else {
            PipelineStatus::Partial
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, PipelineStatus::Completed | PipelineStatus::Partial)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated output of a run: one section per completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub generation_key: String,
    pub product_name: String,
    pub status: PipelineStatus,
    pub sections: BTreeMap<StageId, Value>,
}

impl GenerationResult {
    pub fn section(&self, stage: StageId) -> Option<&Value> {
        self.sections.get(&stage)
    }
}

/// Final state returned by a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub generation_key: String,
    pub product_name: String,
    pub profile: PipelineProfile,
    pub status: PipelineStatus,
    /// Scheduled stages in canonical order.
    pub stages: Vec<StageResult>,
    pub latency_ms: u64,
    /// Last percentage reported to the progress stream.
    pub last_percentage: u8,
    /// Served entirely from the result cache.
    #[serde(default)]
    pub from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GenerationResult>,
}

impl PipelineState {
    pub fn stage(&self, id: StageId) -> Option<&StageResult> {
        self.stages.iter().find(|result| result.stage == id)
    }

    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|result| result.stage).collect()
    }

    pub fn stages_with_status(&self, status: StageStatus) -> Vec<StageId> {
        self.stages
            .iter()
            .filter(|result| result.status == status)
            .map(|result| result.stage)
            .collect()
    }

    pub fn completed_stages(&self) -> Vec<StageId> {
        self.stages_with_status(StageStatus::Completed)
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}
