//! Pipeline orchestrator: walks the stage graph for one request.
//!
//! The orchestrator is the only coordinator. Each scheduling tick takes the stages whose
//! dependencies have completed; non-parallel stages run one at a time, parallel ones run
//! together in groups of at most `max_parallel_stages`. A group's worker calls and their
//! recovery run in a spawned task, while cache writes and progress emission stay on the
//! orchestrator so events keep a total order.

use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::TieredCache;
use crate::config::CopylineConfig;
use crate::error::{ApiError, StageError};
use crate::fingerprint::Fingerprint;
use crate::pipeline::state::{
    GenerationResult, PipelineState, PipelineStatus, StageResult, StageStatus,
};
use crate::pipeline::worker::{StageContext, StageWorker};
use crate::progress::emitter::{channel, ProgressEmitter, ProgressReceiver, ProgressSender};
use crate::recovery::{BatchErrorItem, RecoveryOptions, RecoveryQueue};
use crate::stage::{StageGraph, StagePlan};
use crate::types::{GenerationRequest, StageId};

const DEFAULT_MAX_PARALLEL_STAGES: usize = 3;
const DEFAULT_PROGRESS_BUFFER: usize = 64;

/// Final outcome of one stage invocation, after recovery.
struct StageOutcome {
    stage: StageId,
    result: Result<Value, StageError>,
    retry_count: u32,
}

/// Mutable bookkeeping for one run.
struct RunState {
    results: BTreeMap<StageId, StageResult>,
    payloads: BTreeMap<StageId, Value>,
}

impl RunState {
    fn new(plan: &StagePlan) -> Self {
        Self {
            results: plan
                .stage_ids()
                .into_iter()
                .map(|stage| (stage, StageResult::pending(stage)))
                .collect(),
            payloads: BTreeMap::new(),
        }
    }

    /// Pending stages whose scheduled dependencies have all completed, in canonical order.
    fn eligible(&self, plan: &StagePlan) -> Vec<StageId> {
        self.results
            .values()
            .filter(|result| result.status == StageStatus::Pending)
            .map(|result| result.stage)
            .filter(|stage| {
                plan.effective_dependencies(*stage).iter().all(|dep| {
                    self.results
                        .get(dep)
                        .is_some_and(|r| r.status == StageStatus::Completed)
                })
            })
            .collect()
    }

    fn count(&self, status: StageStatus) -> usize {
        self.results.values().filter(|r| r.status == status).count()
    }
}

/// Per-run values threaded through the scheduling helpers.
struct RunScope<'a> {
    request: &'a GenerationRequest,
    fingerprint: &'a Fingerprint,
    generation_key: &'a str,
    plan: &'a StagePlan,
    cancel: &'a CancellationToken,
}

/// Handle to a run started with [`PipelineOrchestrator::start`].
pub struct PipelineRun {
    pub generation_key: String,
    cancel: CancellationToken,
    handle: JoinHandle<PipelineState>,
}

impl PipelineRun {
    /// Stops scheduling new stages. In-flight worker calls finish but are discarded.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<PipelineState, ApiError> {
        self.handle
            .await
            .map_err(|e| ApiError::Internal(format!("Pipeline task failed: {}", e)))
    }
}

pub struct PipelineOrchestrator {
    graph: &'static StageGraph,
    worker: Arc<dyn StageWorker>,
    cache: Arc<TieredCache>,
    recovery: RecoveryOptions,
    max_parallel_stages: usize,
    progress_buffer: usize,
}

impl PipelineOrchestrator {
    pub fn new(worker: Arc<dyn StageWorker>, cache: Arc<TieredCache>) -> Self {
        Self {
            graph: StageGraph::standard(),
            worker,
            cache,
            recovery: RecoveryOptions::default(),
            max_parallel_stages: DEFAULT_MAX_PARALLEL_STAGES,
            progress_buffer: DEFAULT_PROGRESS_BUFFER,
        }
    }

    pub fn from_config(
        worker: Arc<dyn StageWorker>,
        cache: Arc<TieredCache>,
        config: &CopylineConfig,
    ) -> Self {
        Self::new(worker, cache)
            .with_recovery(RecoveryOptions::from(&config.recovery))
            .with_max_parallel_stages(config.pipeline.max_parallel_stages)
            .with_progress_buffer(config.pipeline.progress_buffer)
    }

    pub fn with_recovery(mut self, recovery: RecoveryOptions) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_max_parallel_stages(mut self, max_parallel_stages: usize) -> Self {
        self.max_parallel_stages = max_parallel_stages.max(1);
        self
    }

    pub fn with_progress_buffer(mut self, progress_buffer: usize) -> Self {
        self.progress_buffer = progress_buffer.max(1);
        self
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    /// Runs a request to completion without a progress stream.
    pub async fn run(&self, request: &GenerationRequest) -> PipelineState {
        self.run_with(request, None, CancellationToken::new()).await
    }

    /// Spawns a run and returns its handle plus the receiving end of its progress stream.
    pub fn start(self: &Arc<Self>, request: GenerationRequest) -> (PipelineRun, ProgressReceiver) {
        let (sender, receiver) = channel(self.progress_buffer);
        let cancel = CancellationToken::new();
        let generation_key = Fingerprint::of(&request).generation_key();
        let orchestrator = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            orchestrator
                .run_with(&request, Some(sender), token)
                .await
        });
        (
            PipelineRun {
                generation_key,
                cancel,
                handle,
            },
            receiver,
        )
    }

    pub async fn run_with(
        &self,
        request: &GenerationRequest,
        progress: Option<ProgressSender>,
        cancel: CancellationToken,
    ) -> PipelineState {
        let started = Instant::now();
        let fingerprint = Fingerprint::of(request);
        let generation_key = fingerprint.generation_key();
        let plan = self.graph.for_profile(request.profile());
        let mut emitter = ProgressEmitter::new(&generation_key, &plan.stage_ids(), progress);
        let mut run = RunState::new(&plan);

        info!(
            generation_key = %generation_key,
            product = request.product_name(),
            profile = %request.profile(),
            stages = plan.len(),
            "Starting generation"
        );
        emitter
            .initializing(format!(
                "Preparing {} stages for {}",
                plan.len(),
                request.product_name()
            ))
            .await;

        if let Some(cached) = self.cached_result(&fingerprint, &plan) {
            info!(generation_key = %generation_key, "Serving generation from result cache");
            for stage in plan.stage_ids() {
                let payload = cached.sections.get(&stage).cloned().unwrap_or(Value::Null);
                if let Some(result) = run.results.get_mut(&stage) {
                    result.start();
                    result.complete(payload, true);
                }
                emitter.restore_stage(stage);
            }
            emitter.complete(cached.clone()).await;
            return PipelineState {
                generation_key,
                product_name: request.product_name().to_string(),
                profile: request.profile(),
                status: PipelineStatus::Completed,
                stages: run.results.into_values().collect(),
                latency_ms: started.elapsed().as_millis() as u64,
                last_percentage: emitter.percentage(),
                from_cache: true,
                error: None,
                result: Some(cached),
            };
        }

        let scope = RunScope {
            request,
            fingerprint: &fingerprint,
            generation_key: &generation_key,
            plan: &plan,
            cancel: &cancel,
        };
        let aborted = !self.drive(&scope, &mut run, &mut emitter).await;
        self.finish(&scope, run, emitter, aborted, started).await
    }

    fn cached_result(&self, fingerprint: &Fingerprint, plan: &StagePlan) -> Option<GenerationResult> {
        let cached = self.cache.get_result(fingerprint)?;
        let usable = cached.status == PipelineStatus::Completed
            && plan
                .stage_ids()
                .iter()
                .all(|stage| cached.sections.contains_key(stage));
        if !usable {
            debug!(
                generation_key = %cached.generation_key,
                "Ignoring incomplete cached result"
            );
            return None;
        }
        Some(cached)
    }

    /// Schedules ticks until nothing is eligible. Returns `false` when aborted.
    async fn drive(
        &self,
        scope: &RunScope<'_>,
        run: &mut RunState,
        emitter: &mut ProgressEmitter,
    ) -> bool {
        loop {
            if scope.cancel.is_cancelled() {
                return false;
            }
            let eligible = run.eligible(scope.plan);
            if eligible.is_empty() {
                return true;
            }

            let (parallel, serial): (Vec<StageId>, Vec<StageId>) = eligible
                .into_iter()
                .partition(|stage| self.graph.spec(*stage).can_parallelize);
            let mut groups: Vec<Vec<StageId>> = serial.into_iter().map(|s| vec![s]).collect();
            groups.extend(
                parallel
                    .chunks(self.max_parallel_stages)
                    .map(<[StageId]>::to_vec),
            );

            for group in groups {
                if scope.cancel.is_cancelled() {
                    return false;
                }
                if !self.run_group(scope, run, emitter, &group).await {
                    return false;
                }
            }
        }
    }

    /// Runs one group of stages. Returns `false` when aborted while the group was in flight.
    async fn run_group(
        &self,
        scope: &RunScope<'_>,
        run: &mut RunState,
        emitter: &mut ProgressEmitter,
        group: &[StageId],
    ) -> bool {
        let mut contexts = Vec::new();
        for &stage in group {
            let started = run
                .results
                .get_mut(&stage)
                .is_some_and(|result| result.start());
            if !started {
                continue;
            }
            emitter.start_stage(stage).await;

            if let Some(payload) = self.cache.get_stage(scope.fingerprint, stage) {
                debug!(generation_key = %scope.generation_key, stage = %stage, "Stage served from cache");
                if let Some(result) = run.results.get_mut(&stage) {
                    result.complete(payload.clone(), true);
                }
                run.payloads.insert(stage, payload);
                emitter
                    .complete_stage(stage, format!("Loaded {} from cache", stage))
                    .await;
                continue;
            }
            contexts.push(self.stage_context(scope, run, stage));
        }
        if contexts.is_empty() {
            return true;
        }

        let stages: Vec<StageId> = contexts.iter().map(|ctx| ctx.stage).collect();
        debug!(
            generation_key = %scope.generation_key,
            stages = ?stages,
            "Dispatching stage group"
        );
        let mut task = tokio::spawn(invoke_group(
            Arc::clone(&self.worker),
            contexts,
            self.recovery.clone(),
            scope.cancel.child_token(),
        ));
        let outcomes = tokio::select! {
            joined = &mut task => match joined {
                Ok(outcomes) => outcomes,
                Err(err) => {
                    error!(generation_key = %scope.generation_key, error = %err, "Stage group task failed");
                    stages
                        .iter()
                        .map(|stage| StageOutcome {
                            stage: *stage,
                            result: Err(StageError::internal(format!("Stage task failed: {}", err))),
                            retry_count: 0,
                        })
                        .collect()
                }
            },
            _ = scope.cancel.cancelled() => {
                warn!(
                    generation_key = %scope.generation_key,
                    stages = ?stages,
                    "Generation aborted; discarding in-flight stage results"
                );
                return false;
            }
        };

        let mut outcomes = outcomes;
        outcomes.sort_by_key(|outcome| outcome.stage);
        for outcome in outcomes {
            self.apply_outcome(scope, run, emitter, outcome).await;
        }
        true
    }

    async fn apply_outcome(
        &self,
        scope: &RunScope<'_>,
        run: &mut RunState,
        emitter: &mut ProgressEmitter,
        outcome: StageOutcome,
    ) {
        let stage = outcome.stage;
        match outcome.result {
            Ok(payload) => {
                self.cache.set_stage(
                    scope.fingerprint,
                    stage,
                    scope.request.product_name(),
                    &payload,
                );
                if let Some(result) = run.results.get_mut(&stage) {
                    result.complete(payload.clone(), false);
                    result.retry_count = outcome.retry_count;
                }
                run.payloads.insert(stage, payload);
                info!(
                    generation_key = %scope.generation_key,
                    stage = %stage,
                    retry_count = outcome.retry_count,
                    "Stage completed"
                );
                emitter
                    .complete_stage(stage, format!("Completed {}", stage))
                    .await;
            }
            Err(err) => {
                error!(
                    generation_key = %scope.generation_key,
                    stage = %stage,
                    retry_count = outcome.retry_count,
                    error = %err,
                    "Stage failed permanently"
                );
                let message = format!("{} failed: {}", stage, err.message);
                if let Some(result) = run.results.get_mut(&stage) {
                    result.fail(err, outcome.retry_count);
                }
                emitter.fail_stage(stage, message).await;

                for dependent in scope.plan.downstream_of(stage) {
                    let skipped = run
                        .results
                        .get_mut(&dependent)
                        .is_some_and(|result| result.skip(format!("dependency {} failed", stage)));
                    if skipped {
                        debug!(
                            generation_key = %scope.generation_key,
                            stage = %dependent,
                            failed_dependency = %stage,
                            "Skipping stage"
                        );
                        emitter
                            .skip_stage(dependent, format!("Skipped {}: {} failed", dependent, stage))
                            .await;
                    }
                }
            }
        }
    }

    fn stage_context(&self, scope: &RunScope<'_>, run: &RunState, stage: StageId) -> StageContext {
        let use_grounding = scope.plan.uses_grounding(stage);
        let launch_date = if use_grounding && scope.request.profile().forwards_launch_date() {
            scope.request.launch_date()
        } else {
            None
        };
        let dependencies = self
            .graph
            .transitive_dependencies(stage)
            .into_iter()
            .filter_map(|dep| run.payloads.get(&dep).map(|payload| (dep, payload.clone())))
            .collect();
        StageContext {
            generation_key: scope.generation_key.to_string(),
            stage,
            spec: self.graph.spec(stage),
            request: scope.request.clone(),
            use_grounding,
            launch_date,
            dependencies,
            attempt: 1,
        }
    }

    async fn finish(
        &self,
        scope: &RunScope<'_>,
        mut run: RunState,
        mut emitter: ProgressEmitter,
        aborted: bool,
        started: Instant,
    ) -> PipelineState {
        let reason = if aborted { "aborted" } else { "not reachable" };
        for result in run.results.values_mut() {
            if !result.status.is_terminal() {
                result.skip(reason);
            }
        }

        let scheduled = run.results.len();
        let completed = run.count(StageStatus::Completed);
        let status = if aborted {
            PipelineStatus::Aborted
        } else {
            PipelineStatus::from_counts(completed, scheduled)
        };

        let result = status.is_success().then(|| GenerationResult {
            generation_key: scope.generation_key.to_string(),
            product_name: scope.request.product_name().to_string(),
            status,
            sections: run.payloads.clone(),
        });

        let error = match status {
            PipelineStatus::Completed | PipelineStatus::Partial => None,
            PipelineStatus::Aborted => Some(ApiError::Aborted.to_string()),
            PipelineStatus::Failed => Some(failure_summary(&run)),
        };

        match (&result, &error) {
            (Some(result), _) => {
                if status == PipelineStatus::Completed {
                    self.cache.set_result(scope.fingerprint, result);
                }
                emitter.complete(result.clone()).await;
            }
            (None, Some(message)) => emitter.error(message.clone()).await,
            (None, None) => emitter.error("Generation produced no result").await,
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        info!(
            generation_key = %scope.generation_key,
            status = %status,
            completed,
            failed = run.count(StageStatus::Failed),
            skipped = run.count(StageStatus::Skipped),
            latency_ms,
            "Generation finished"
        );

        PipelineState {
            generation_key: scope.generation_key.to_string(),
            product_name: scope.request.product_name().to_string(),
            profile: scope.request.profile(),
            status,
            stages: run.results.into_values().collect(),
            latency_ms,
            last_percentage: emitter.percentage(),
            from_cache: false,
            error,
            result,
        }
    }
}

fn failure_summary(run: &RunState) -> String {
    let failures: Vec<String> = run
        .results
        .values()
        .filter_map(|result| {
            result
                .error
                .as_ref()
                .map(|err| format!("{}: {}", result.stage, err))
        })
        .collect();
    if failures.is_empty() {
        "Generation failed".to_string()
    } else {
        format!("Generation failed: {}", failures.join("; "))
    }
}

async fn invoke_checked(worker: &dyn StageWorker, context: &StageContext) -> Result<Value, StageError> {
    match worker.invoke(context.stage, context).await? {
        Value::Null => Err(StageError::external(format!(
            "Stage {} returned an empty payload",
            context.stage
        ))
        .with_code("E_EMPTY_PAYLOAD")),
        payload => Ok(payload),
    }
}

/// First attempt for every stage of a group concurrently, then one recovery run over the
/// failures. Once `cancel` fires no new attempt is started.
async fn invoke_group(
    worker: Arc<dyn StageWorker>,
    contexts: Vec<StageContext>,
    options: RecoveryOptions,
    cancel: CancellationToken,
) -> Vec<StageOutcome> {
    let first = join_all(
        contexts
            .iter()
            .map(|context| invoke_checked(worker.as_ref(), context)),
    )
    .await;

    let mut outcomes = Vec::with_capacity(contexts.len());
    let mut failed = Vec::new();
    for (context, result) in contexts.iter().zip(first) {
        match result {
            Ok(payload) => outcomes.push(StageOutcome {
                stage: context.stage,
                result: Ok(payload),
                retry_count: 0,
            }),
            Err(err) => {
                warn!(
                    generation_key = %context.generation_key,
                    stage = %context.stage,
                    retryable = err.is_retryable(),
                    error = %err,
                    "Stage attempt failed"
                );
                failed.push(BatchErrorItem::new(context.stage.as_str(), err));
            }
        }
    }
    if failed.is_empty() {
        return outcomes;
    }

    let by_id: BTreeMap<String, &StageContext> = contexts
        .iter()
        .map(|context| (context.stage.as_str().to_string(), context))
        .collect();
    let snapshot = failed.clone();
    let queue = RecoveryQueue::new();
    let recovery = queue
        .recover_until(
            failed,
            |item| {
                let worker = Arc::clone(&worker);
                let context = by_id.get(&item.item_id).map(|context| StageContext {
                    attempt: item.retry_count + 2,
                    ..(*context).clone()
                });
                async move {
                    match context {
                        Some(context) => invoke_checked(worker.as_ref(), &context).await,
                        None => Err(StageError::internal(format!(
                            "No stage context for {}",
                            item.item_id
                        ))),
                    }
                }
            },
            &options,
            &cancel,
        )
        .await;

    match recovery {
        Ok(state) => {
            for recovered in state.recovered {
                if let Some(context) = by_id.get(&recovered.item.item_id) {
                    outcomes.push(StageOutcome {
                        stage: context.stage,
                        result: Ok(recovered.value),
                        // The successful attempt counts as a retry too.
                        retry_count: recovered.item.retry_count + 1,
                    });
                }
            }
            for item in state.failed {
                if let Some(context) = by_id.get(&item.item_id) {
                    outcomes.push(StageOutcome {
                        stage: context.stage,
                        result: Err(item.error),
                        retry_count: item.retry_count,
                    });
                }
            }
        }
        Err(err) => {
            error!(error = %err, "Stage recovery could not run");
            for item in snapshot {
                if let Some(context) = by_id.get(&item.item_id) {
                    outcomes.push(StageOutcome {
                        stage: context.stage,
                        result: Err(item.error),
                        retry_count: item.retry_count,
                    });
                }
            }
        }
    }
    outcomes
}
