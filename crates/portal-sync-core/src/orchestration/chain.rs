use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use time::OffsetDateTime;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::models::{
    ChainRun, ChainStatus, CoreError, CoreErrorKind, CoreResult, StepResult, StepStatus,
    SyncMode, TaskConfig, TaskKind,
};
use crate::orchestration::adapters::TaskOutcome;
use crate::orchestration::executor::TaskExecutor;
use crate::orchestration::registry::ProgressReporter;
use crate::orchestration::sync_context::SyncContext;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChainStep {
    pub name: String,
    pub kind: TaskKind,
    pub depends_on: Vec<String>,
    pub required: bool,
}

impl ChainStep {
    pub fn required(kind: TaskKind) -> Self {
        Self {
            name: kind.as_str().to_string(),
            kind,
            depends_on: Vec::new(),
            required: true,
        }
    }

    pub fn optional(kind: TaskKind) -> Self {
        Self {
            required: false,
            ..Self::required(kind)
        }
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.depends_on = names.iter().map(|name| (*name).to_string()).collect();
        self
    }

    fn unmet_dependencies(&self, completed: &HashSet<String>) -> Vec<&str> {
        self.depends_on
            .iter()
            .filter(|name| !completed.contains(*name))
            .map(String::as_str)
            .collect()
    }
}

/// Parallel tiers run first, in order, each fully settled before the next.
/// Sequential steps follow in declared order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChainPlan {
    pub tiers: Vec<Vec<ChainStep>>,
    pub steps: Vec<ChainStep>,
}

impl ChainPlan {
    pub fn new(tiers: Vec<Vec<ChainStep>>, steps: Vec<ChainStep>) -> CoreResult<Self> {
        let plan = Self { tiers, steps };
        plan.validate()?;
        Ok(plan)
    }

    /// Users and groups gate everything downstream; courses only gate enrollments.
    pub fn daily_sync() -> Self {
        Self {
            tiers: vec![vec![
                ChainStep::required(TaskKind::SyncUsers),
                ChainStep::required(TaskKind::SyncGroups),
                ChainStep::optional(TaskKind::SyncCourses),
            ]],
            steps: vec![
                ChainStep::optional(TaskKind::SyncEnrollments)
                    .depends_on(&["sync_users", "sync_courses"]),
                ChainStep::optional(TaskKind::PushCrm).depends_on(&[
                    "sync_users",
                    "sync_groups",
                    "sync_enrollments",
                ]),
            ],
        }
    }

    pub fn step_count(&self) -> usize {
        self.tiers.iter().map(Vec::len).sum::<usize>() + self.steps.len()
    }

    pub fn all_steps(&self) -> impl Iterator<Item = &ChainStep> {
        self.tiers.iter().flatten().chain(self.steps.iter())
    }

    pub fn step(&self, name: &str) -> Option<&ChainStep> {
        self.all_steps().find(|step| step.name == name)
    }

    pub fn validate(&self) -> CoreResult<()> {
        let mut declared: HashSet<&str> = HashSet::new();

        for tier in &self.tiers {
            let members: HashSet<&str> = tier.iter().map(|step| step.name.as_str()).collect();
            for step in tier {
                if let Some(peer) = step
                    .depends_on
                    .iter()
                    .find(|name| members.contains(name.as_str()))
                {
                    return Err(invalid_plan(format!(
                        "step '{}' depends on '{peer}' in the same parallel tier",
                        step.name
                    )));
                }
                validate_step(step, &declared)?;
            }
            for step in tier {
                if !declared.insert(step.name.as_str()) {
                    return Err(invalid_plan(format!("duplicate step '{}'", step.name)));
                }
            }
        }

        for step in &self.steps {
            validate_step(step, &declared)?;
            if !declared.insert(step.name.as_str()) {
                return Err(invalid_plan(format!("duplicate step '{}'", step.name)));
            }
        }
        Ok(())
    }
}

fn validate_step(step: &ChainStep, declared: &HashSet<&str>) -> CoreResult<()> {
    if step.kind.is_builtin() {
        return Err(invalid_plan(format!(
            "step '{}' uses built-in task '{}'",
            step.name, step.kind
        )));
    }
    if let Some(unknown) = step
        .depends_on
        .iter()
        .find(|name| !declared.contains(name.as_str()) && **name != step.name)
    {
        return Err(invalid_plan(format!(
            "step '{}' depends on unknown or later step '{unknown}'",
            step.name
        )));
    }
    if step.depends_on.contains(&step.name) {
        return Err(invalid_plan(format!("step '{}' depends on itself", step.name)));
    }
    Ok(())
}

fn invalid_plan(message: String) -> CoreError {
    CoreError {
        task: Some(TaskKind::DailySyncChain),
        step: None,
        kind: CoreErrorKind::InvalidInput,
        message,
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChainOptions {
    pub force_full: bool,
    pub skip_steps: BTreeSet<String>,
}

impl ChainOptions {
    pub fn from_config(config: &TaskConfig) -> Self {
        Self {
            force_full: config.sync_mode() == Some(SyncMode::Full),
            skip_steps: BTreeSet::new(),
        }
    }

    pub fn full() -> Self {
        Self {
            force_full: true,
            ..Self::default()
        }
    }

    pub fn skip(mut self, name: impl Into<String>) -> Self {
        self.skip_steps.insert(name.into());
        self
    }
}

pub struct ChainOrchestrator {
    executor: TaskExecutor,
    plan: Arc<ChainPlan>,
    options: ChainOptions,
}

impl ChainOrchestrator {
    pub fn new(executor: TaskExecutor, plan: Arc<ChainPlan>, options: ChainOptions) -> Self {
        Self {
            executor,
            plan,
            options,
        }
    }

    /// Executes the plan and returns the run record. Required-step failures
    /// are reported through [`ChainRun::failure`], never as an `Err`.
    pub async fn run(&self, progress: Option<ProgressReporter>) -> ChainRun {
        let chain_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut run = ChainRun::new(chain_id.clone(), OffsetDateTime::now_utc());

        let context_guard = match self.executor.contexts().begin(chain_id.clone()) {
            Ok(guard) => guard,
            Err(error) => {
                run.status = ChainStatus::Failed;
                run.error = Some(error.message);
                run.completed_at = Some(OffsetDateTime::now_utc());
                return run;
            }
        };
        let context = context_guard.context().clone();

        run.status = ChainStatus::Running;
        let total = u64::try_from(self.plan.step_count()).unwrap_or(u64::MAX);
        tracing::info!(
            chain_id = %chain_id,
            steps = total,
            force_full = self.options.force_full,
            "sync chain started"
        );

        let mut completed: HashSet<String> = HashSet::new();
        let mut tracker = StepTracker {
            progress,
            chain_id: &chain_id,
            settled: 0,
            total,
        };

        for tier in &self.plan.tiers {
            let mut launched = Vec::new();
            for step in tier {
                match self.precheck(step, &completed) {
                    Some(skipped) => {
                        tracker.settle(&skipped);
                        run.steps.push(skipped);
                    }
                    None => launched.push(step.clone()),
                }
            }

            for result in self.run_tier(&launched, &context).await {
                tracker.settle(&result);
                self.absorb(&mut run, &mut completed, result);
            }
            if run.failed_step.is_some() {
                break;
            }
        }

        if run.failed_step.is_none() {
            for step in &self.plan.steps {
                let result = match self.precheck(step, &completed) {
                    Some(skipped) => skipped,
                    None => {
                        execute_step(
                            self.executor.clone(),
                            step.clone(),
                            context.clone(),
                            self.options.force_full,
                        )
                        .await
                    }
                };
                tracker.settle(&result);
                self.absorb(&mut run, &mut completed, result);
                if run.failed_step.is_some() {
                    break;
                }
            }
        }

        drop(context);
        run.cache = context_guard.teardown();
        run.completed_at = Some(OffsetDateTime::now_utc());
        run.duration_seconds = started.elapsed().as_secs_f64();
        if run.failed_step.is_some() {
            run.status = ChainStatus::Failed;
            tracing::error!(
                chain_id = %chain_id,
                failed_step = run.failed_step.as_deref(),
                error = run.error.as_deref(),
                duration_seconds = run.duration_seconds,
                "sync chain failed"
            );
        } else {
            run.status = ChainStatus::Completed;
            tracing::info!(
                chain_id = %chain_id,
                records_processed = run.records_processed(),
                api_calls_avoided = run.cache.api_calls_avoided(),
                duration_seconds = run.duration_seconds,
                "sync chain completed"
            );
        }
        run
    }

    fn precheck(&self, step: &ChainStep, completed: &HashSet<String>) -> Option<StepResult> {
        if self.options.skip_steps.contains(&step.name) {
            tracing::info!(step = %step.name, "chain step skipped by request");
            return Some(StepResult::skipped(
                &step.name,
                step.kind,
                step.required,
                "skipped by request",
            ));
        }
        let unmet = step.unmet_dependencies(completed);
        if unmet.is_empty() {
            return None;
        }
        let reason = format!("unmet dependencies: {}", unmet.join(", "));
        tracing::warn!(step = %step.name, reason = %reason, "chain step skipped");
        Some(StepResult::skipped(&step.name, step.kind, step.required, reason))
    }

    /// Runs every launched step concurrently and returns results in tier order.
    async fn run_tier(&self, steps: &[ChainStep], context: &Arc<SyncContext>) -> Vec<StepResult> {
        let mut join_set = JoinSet::new();
        for (index, step) in steps.iter().cloned().enumerate() {
            let executor = self.executor.clone();
            let context = context.clone();
            let force_full = self.options.force_full;
            join_set.spawn(async move {
                (index, execute_step(executor, step, context, force_full).await)
            });
        }

        let mut results: Vec<Option<StepResult>> = vec![None; steps.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(join_error) => {
                    tracing::error!(error = %join_error, "chain step task terminated abnormally");
                }
            }
        }

        results
            .into_iter()
            .zip(steps)
            .map(|(result, step)| {
                result.unwrap_or_else(|| StepResult {
                    status: StepStatus::Failed,
                    error: Some("step task terminated abnormally".to_string()),
                    ..StepResult::skipped(&step.name, step.kind, step.required, "")
                })
            })
            .collect()
    }

    fn absorb(&self, run: &mut ChainRun, completed: &mut HashSet<String>, result: StepResult) {
        match result.status {
            StepStatus::Completed => {
                completed.insert(result.name.clone());
            }
            StepStatus::Failed if result.required && run.failed_step.is_none() => {
                run.failed_step = Some(result.name.clone());
                run.error = result.error.clone();
            }
            _ => {}
        }
        run.steps.push(result);
    }
}

struct StepTracker<'a> {
    progress: Option<ProgressReporter>,
    chain_id: &'a str,
    settled: u64,
    total: u64,
}

impl StepTracker<'_> {
    fn settle(&mut self, result: &StepResult) {
        self.settled += 1;
        if let Some(progress) = &self.progress {
            progress.report(
                result.name.clone(),
                self.settled,
                self.total,
                Some(json!({ "chain_id": self.chain_id, "status": result.status })),
            );
        }
    }
}

/// Claims the step's mutex before its definition is read.
async fn run_step_task(
    executor: &TaskExecutor,
    kind: TaskKind,
    context: Arc<SyncContext>,
    force_full: bool,
) -> CoreResult<TaskOutcome> {
    let guard = executor.acquire(kind)?;
    let definition = executor.load_definition(kind).await?;
    executor
        .run_chain_step(guard, definition, context, force_full)
        .await
}

async fn execute_step(
    executor: TaskExecutor,
    step: ChainStep,
    context: Arc<SyncContext>,
    force_full: bool,
) -> StepResult {
    let started_at = OffsetDateTime::now_utc();
    let started = Instant::now();
    tracing::info!(
        step = %step.name,
        chain_id = context.chain_id(),
        required = step.required,
        "chain step started"
    );

    let outcome = run_step_task(&executor, step.kind, context, force_full).await;

    let duration_seconds = started.elapsed().as_secs_f64();
    let (status, records_processed, error) = match outcome {
        Ok(outcome) => (StepStatus::Completed, outcome.records_processed, None),
        Err(error) => {
            if step.required {
                tracing::error!(
                    step = %step.name,
                    message = %error.message,
                    "required chain step failed"
                );
            } else {
                tracing::warn!(
                    step = %step.name,
                    message = %error.message,
                    "optional chain step failed"
                );
            }
            (StepStatus::Failed, 0, Some(error.message))
        }
    };

    StepResult {
        name: step.name,
        kind: step.kind,
        required: step.required,
        status,
        started_at: Some(started_at),
        completed_at: Some(OffsetDateTime::now_utc()),
        duration_seconds,
        records_processed,
        error,
    }
}
