//! Stage dependency graph.
//!
//! The graph is static metadata built into the binary. A [`StagePlan`] is the per-profile
//! view the orchestrator schedules from.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::types::{PipelineProfile, StageId};

/// Static metadata for one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSpec {
    pub id: StageId,
    pub requires_grounding: bool,
    pub depends_on: &'static [StageId],
    pub can_parallelize: bool,
}

// Indexed by `StageId` discriminant.
static STAGE_TABLE: [StageSpec; 8] = [
    StageSpec {
        id: StageId::Description,
        requires_grounding: true,
        depends_on: &[],
        can_parallelize: false,
    },
    StageSpec {
        id: StageId::UspExtraction,
        requires_grounding: true,
        depends_on: &[StageId::Description],
        can_parallelize: false,
    },
    StageSpec {
        id: StageId::Chapters,
        requires_grounding: false,
        depends_on: &[StageId::UspExtraction],
        can_parallelize: true,
    },
    StageSpec {
        id: StageId::Faq,
        requires_grounding: true,
        depends_on: &[StageId::UspExtraction],
        can_parallelize: true,
    },
    StageSpec {
        id: StageId::StepByStep,
        requires_grounding: false,
        depends_on: &[StageId::Faq],
        can_parallelize: true,
    },
    StageSpec {
        id: StageId::CaseStudies,
        requires_grounding: true,
        depends_on: &[StageId::UspExtraction],
        can_parallelize: true,
    },
    StageSpec {
        id: StageId::Keywords,
        requires_grounding: false,
        depends_on: &[StageId::Description],
        can_parallelize: false,
    },
    StageSpec {
        id: StageId::GroundingAggregation,
        requires_grounding: false,
        depends_on: &[StageId::Faq, StageId::CaseStudies],
        can_parallelize: false,
    },
];

static STANDARD_GRAPH: StageGraph = StageGraph {
    specs: &STAGE_TABLE,
};

/// Read-only stage graph.
#[derive(Debug)]
pub struct StageGraph {
    specs: &'static [StageSpec],
}

impl StageGraph {
    /// The process-wide graph of the eight generation stages.
    pub fn standard() -> &'static StageGraph {
        &STANDARD_GRAPH
    }

    pub fn specs(&self) -> &'static [StageSpec] {
        self.specs
    }

    pub fn spec(&self, id: StageId) -> &'static StageSpec {
        &self.specs[id as usize]
    }

    /// Stages that list `id` directly in `depends_on`.
    pub fn dependents(&self, id: StageId) -> Vec<StageId> {
        self.specs
            .iter()
            .filter(|spec| spec.depends_on.contains(&id))
            .map(|spec| spec.id)
            .collect()
    }

    /// Every stage reachable from `id` through dependent edges.
    pub fn transitive_dependents(&self, id: StageId) -> BTreeSet<StageId> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            for dependent in self.dependents(current) {
                if found.insert(dependent) {
                    frontier.push(dependent);
                }
            }
        }
        found
    }

    /// Every stage `id` depends on, directly or indirectly.
    pub fn transitive_dependencies(&self, id: StageId) -> BTreeSet<StageId> {
        let mut found = BTreeSet::new();
        let mut frontier: Vec<StageId> = self.spec(id).depends_on.to_vec();
        while let Some(current) = frontier.pop() {
            if found.insert(current) {
                frontier.extend_from_slice(self.spec(current).depends_on);
            }
        }
        found
    }

    pub fn for_profile(&'static self, profile: PipelineProfile) -> StagePlan {
        let excluded = profile.excluded_stages();
        let stages = self
            .specs
            .iter()
            .filter(|spec| !excluded.contains(&spec.id))
            .collect();
        StagePlan {
            graph: self,
            profile,
            stages,
        }
    }
}

/// The stages scheduled for one profile, in canonical order.
#[derive(Debug, Clone)]
pub struct StagePlan {
    graph: &'static StageGraph,
    profile: PipelineProfile,
    stages: Vec<&'static StageSpec>,
}

impl StagePlan {
    pub fn profile(&self) -> PipelineProfile {
        self.profile
    }

    pub fn graph(&self) -> &'static StageGraph {
        self.graph
    }

    pub fn stages(&self) -> &[&'static StageSpec] {
        &self.stages
    }

    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|spec| spec.id).collect()
    }

    pub fn contains(&self, id: StageId) -> bool {
        self.stages.iter().any(|spec| spec.id == id)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Dependencies of `id` that are part of this plan. Dependencies on stages the
    /// profile excludes are treated as satisfied.
    pub fn effective_dependencies(&self, id: StageId) -> Vec<StageId> {
        self.graph
            .spec(id)
            .depends_on
            .iter()
            .copied()
            .filter(|dep| self.contains(*dep))
            .collect()
    }

    /// Scheduled stages that transitively depend on `id`.
    pub fn downstream_of(&self, id: StageId) -> Vec<StageId> {
        let all = self.graph.transitive_dependents(id);
        self.stages
            .iter()
            .map(|spec| spec.id)
            .filter(|stage| all.contains(stage))
            .collect()
    }

    /// Whether the stage makes a web-grounded call under this profile.
    pub fn uses_grounding(&self, id: StageId) -> bool {
        self.profile.grounding_enabled() && self.graph.spec(id).requires_grounding
    }
}
