//! Turns orchestrator transitions into an ordered progress stream.
//!
//! Events go out over a bounded tokio channel; a full channel applies back-pressure to the
//! run, and a dropped receiver only disables live delivery.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::pipeline::state::GenerationResult;
use crate::progress::event::{ProgressEvent, ProgressKind, ProgressStage};
use crate::types::StageId;

pub type ProgressSender = mpsc::Sender<ProgressEvent>;
pub type ProgressReceiver = mpsc::Receiver<ProgressEvent>;

/// Bounded channel between a run and its stream writer.
pub fn channel(buffer: usize) -> (ProgressSender, ProgressReceiver) {
    mpsc::channel(buffer.max(1))
}

pub struct ProgressEmitter {
    generation_key: String,
    sender: Option<ProgressSender>,
    /// Stage weights rescaled so the scheduled stages plus `complete` sum to 100.
    weights: BTreeMap<StageId, f64>,
    accumulated: f64,
    percentage: u8,
    seq: u64,
    current: Option<StageId>,
    resolved: BTreeSet<StageId>,
    completed: Vec<StageId>,
    sealed: bool,
}

impl ProgressEmitter {
    pub fn new(
        generation_key: impl Into<String>,
        stages: &[StageId],
        sender: Option<ProgressSender>,
    ) -> Self {
        let total: u32 = stages
            .iter()
            .map(|s| ProgressStage::Stage(*s).weight())
            .sum::<u32>()
            + ProgressStage::Complete.weight();
        let scale = 100.0 / f64::from(total.max(1));
        let weights = stages
            .iter()
            .map(|s| (*s, f64::from(ProgressStage::Stage(*s).weight()) * scale))
            .collect();
        Self {
            generation_key: generation_key.into(),
            sender,
            weights,
            accumulated: 0.0,
            percentage: 0,
            seq: 0,
            current: None,
            resolved: BTreeSet::new(),
            completed: Vec::new(),
            sealed: false,
        }
    }

    /// An emitter that tracks percentages without delivering events.
    pub fn detached(generation_key: impl Into<String>, stages: &[StageId]) -> Self {
        Self::new(generation_key, stages, None)
    }

    pub fn percentage(&self) -> u8 {
        self.percentage
    }

    pub fn completed_stages(&self) -> &[StageId] {
        &self.completed
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub async fn initializing(&mut self, message: impl Into<String>) {
        self.emit(
            ProgressKind::Initializing,
            ProgressStage::Initializing,
            message.into(),
            None,
        )
        .await;
    }

    pub async fn start_stage(&mut self, stage: StageId) {
        if self.sealed {
            return;
        }
        self.current = Some(stage);
        self.emit(
            ProgressKind::StageStarted,
            stage.into(),
            format!("Generating {}", stage),
            None,
        )
        .await;
    }

    /// Progress within the most recently started stage, `pct` in `0..=100`.
    pub async fn update_progress(&mut self, pct: u8, message: impl Into<String>) {
        if self.sealed {
            return;
        }
        let stage = match self.current {
            Some(stage) => stage,
            None => {
                let stage = ProgressStage::Initializing;
                self.emit(ProgressKind::StageProgress, stage, message.into(), None)
                    .await;
                return;
            }
        };
        if !self.resolved.contains(&stage) {
            let within = self.weight(stage) * f64::from(pct.min(100)) / 100.0;
            self.raise_to(self.accumulated + within);
        }
        self.emit(ProgressKind::StageProgress, stage.into(), message.into(), None)
            .await;
    }

    pub async fn complete_stage(&mut self, stage: StageId, message: impl Into<String>) {
        if self.sealed {
            return;
        }
        if self.resolve(stage, true) {
            self.completed.push(stage);
        }
        self.emit(ProgressKind::StageCompleted, stage.into(), message.into(), None)
            .await;
    }

    /// Counts a stage as completed without emitting an event.
    pub fn restore_stage(&mut self, stage: StageId) {
        if !self.sealed && self.resolve(stage, true) {
            self.completed.push(stage);
        }
    }

    pub async fn fail_stage(&mut self, stage: StageId, message: impl Into<String>) {
        if self.sealed {
            return;
        }
        self.resolve(stage, false);
        self.emit(ProgressKind::StageFailed, stage.into(), message.into(), None)
            .await;
    }

    pub async fn skip_stage(&mut self, stage: StageId, message: impl Into<String>) {
        if self.sealed {
            return;
        }
        self.resolve(stage, false);
        self.emit(ProgressKind::StageSkipped, stage.into(), message.into(), None)
            .await;
    }

    /// Terminates the stream with an `error` event at the last reached percentage.
    pub async fn error(&mut self, message: impl Into<String>) {
        self.emit(ProgressKind::Error, ProgressStage::Error, message.into(), None)
            .await;
    }

    /// Terminates the stream with a `complete` event at 100%.
    pub async fn complete(&mut self, result: GenerationResult) {
        if self.sealed {
            return;
        }
        self.accumulated = 100.0;
        self.percentage = 100;
        self.emit(
            ProgressKind::Complete,
            ProgressStage::Complete,
            format!("Generation {}", result.status),
            Some(result),
        )
        .await;
    }

    fn weight(&self, stage: StageId) -> f64 {
        self.weights.get(&stage).copied().unwrap_or(0.0)
    }

    /// Marks a stage as finished. Only completed stages advance the cumulative percentage.
    fn resolve(&mut self, stage: StageId, advance: bool) -> bool {
        if !self.resolved.insert(stage) {
            return false;
        }
        if advance {
            self.accumulated += self.weight(stage);
            self.raise_to(self.accumulated);
        }
        true
    }

    fn raise_to(&mut self, value: f64) {
        let candidate = value.floor().clamp(0.0, 100.0) as u8;
        self.percentage = self.percentage.max(candidate);
    }

    async fn emit(
        &mut self,
        kind: ProgressKind,
        stage: ProgressStage,
        message: String,
        result: Option<GenerationResult>,
    ) {
        if self.sealed {
            debug!(
                generation_key = %self.generation_key,
                kind = %kind,
                "Dropping progress event after terminal event"
            );
            return;
        }
        self.seq += 1;
        if kind.is_terminal() {
            self.sealed = true;
        }
        let event = ProgressEvent {
            seq: self.seq,
            generation_key: self.generation_key.clone(),
            kind,
            stage,
            percentage: self.percentage,
            message,
            completed_stages: self.completed.clone(),
            ts: Utc::now(),
            result,
        };
        debug!(
            generation_key = %event.generation_key,
            seq = event.seq,
            kind = %event.kind,
            stage = %event.stage,
            percentage = event.percentage,
            "Progress"
        );
        if let Some(sender) = &self.sender {
            if sender.send(event).await.is_err() {
                warn!(
                    generation_key = %self.generation_key,
                    "Progress receiver closed; continuing without live updates"
                );
                self.sender = None;
            }
        }
    }
}
