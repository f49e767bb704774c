//! Event schema for the generation progress stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::ApiError;
use crate::pipeline::state::GenerationResult;
use crate::types::StageId;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Initializing,
    StageStarted,
    StageProgress,
    StageCompleted,
    StageFailed,
    StageSkipped,
    Complete,
    Error,
}

impl ProgressKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressKind::Initializing => "initializing",
            ProgressKind::StageStarted => "stage_started",
            ProgressKind::StageProgress => "stage_progress",
            ProgressKind::StageCompleted => "stage_completed",
            ProgressKind::StageFailed => "stage_failed",
            ProgressKind::StageSkipped => "stage_skipped",
            ProgressKind::Complete => "complete",
            ProgressKind::Error => "error",
        }
    }

    /// `complete` and `error` end the stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressKind::Complete | ProgressKind::Error)
    }
}

impl fmt::Display for ProgressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position in the progress sequence: a real stage or one of the synthetic bookends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressStage {
    Initializing,
    Stage(StageId),
    Complete,
    Error,
}

impl ProgressStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStage::Initializing => "initializing",
            ProgressStage::Stage(stage) => stage.as_str(),
            ProgressStage::Complete => "complete",
            ProgressStage::Error => "error",
        }
    }

    /// Share of the full eight-stage sequence, out of 100.
    pub fn weight(self) -> u32 {
        match self {
            ProgressStage::Initializing | ProgressStage::Error => 0,
            ProgressStage::Stage(StageId::Description) => 15,
            ProgressStage::Stage(StageId::UspExtraction) => 10,
            ProgressStage::Stage(StageId::Chapters) => 10,
            ProgressStage::Stage(StageId::Faq) => 15,
            ProgressStage::Stage(StageId::StepByStep) => 10,
            ProgressStage::Stage(StageId::CaseStudies) => 15,
            ProgressStage::Stage(StageId::Keywords) => 10,
            ProgressStage::Stage(StageId::GroundingAggregation) => 10,
            ProgressStage::Complete => 5,
        }
    }
}

impl fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<StageId> for ProgressStage {
    fn from(stage: StageId) -> Self {
        ProgressStage::Stage(stage)
    }
}

impl FromStr for ProgressStage {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(ProgressStage::Initializing),
            "complete" => Ok(ProgressStage::Complete),
            "error" => Ok(ProgressStage::Error),
            other => other.parse().map(ProgressStage::Stage),
        }
    }
}

impl Serialize for ProgressStage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ProgressStage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One entry of a generation's progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// 1-based position within the stream.
    pub seq: u64,
    pub generation_key: String,
    pub kind: ProgressKind,
    pub stage: ProgressStage,
    /// Cumulative, non-decreasing within one stream.
    pub percentage: u8,
    pub message: String,
    pub completed_stages: Vec<StageId>,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<GenerationResult>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}
