use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Config, ConfigLoader, ExecutorSettings};
use crate::domain::{Target, TaskState};
use crate::engine::{Engine, ExecutionOutcome, ExecutionPlan};
use crate::error::CoidbError;
use crate::freshness::{Evaluation, FreshnessEvaluator, StaleReason};
use crate::graph::{GraphBuilder, TaskGraph};
use crate::lock::WorkdirLock;
use crate::registry::Registry;
use crate::stages::StageExecutors;
use crate::stages::download::Fetcher;

pub const DEFAULT_TARGETS: [&str; 2] = [
    "bold_clustered.assignTaxonomy.fasta",
    "bold_clustered.addSpecies.fasta",
];

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub targets: Vec<String>,
    pub workdir: Utf8PathBuf,
    pub dryrun: bool,
    pub cores: usize,
    pub config_file: Vec<Utf8PathBuf>,
    pub cluster_config: Option<Utf8PathBuf>,
    pub printshellcmds: bool,
    pub unlock: bool,
    pub force: bool,
    pub show_failed_logs: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            targets: DEFAULT_TARGETS.iter().map(|target| target.to_string()).collect(),
            workdir: Utf8PathBuf::from("."),
            dryrun: false,
            cores: 1,
            config_file: Vec::new(),
            cluster_config: None,
            printshellcmds: false,
            unlock: false,
            force: false,
            show_failed_logs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub success: bool,
    pub dryrun: bool,
    pub unlocked: bool,
    pub workdir: String,
    pub planned: Vec<PlannedTask>,
    pub tasks: Vec<TaskReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedTask {
    pub id: String,
    pub stage: String,
    pub reason: Option<StaleReason>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub id: String,
    pub stage: String,
    pub state: TaskState,
    pub requested: bool,
    pub elapsed_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub task: Option<String>,
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct Pipeline<F: Fetcher> {
    registry: Registry,
    fetcher: F,
}

impl<F: Fetcher> Pipeline<F> {
    pub fn new(registry: Registry, fetcher: F) -> Self {
        Self { registry, fetcher }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn run(
        &self,
        options: &RunOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, CoidbError> {
        let workdir = options.workdir.as_path();
        if options.unlock {
            let removed = WorkdirLock::clear(workdir)?;
            info!(%workdir, removed, "cleared work directory lock");
            return Ok(RunReport {
                success: true,
                dryrun: options.dryrun,
                unlocked: true,
                workdir: workdir.to_string(),
                planned: Vec::new(),
                tasks: Vec::new(),
            });
        }
        if options.cores == 0 {
            return Err(CoidbError::InvalidConfig(
                "cores must be a positive integer".to_string(),
            ));
        }

        let targets = options
            .targets
            .iter()
            .map(|target| target.parse())
            .collect::<Result<Vec<Target>, CoidbError>>()?;
        let config = ConfigLoader::load(&options.config_file)?;
        let settings = match &options.cluster_config {
            Some(path) => ExecutorSettings::load(path)?,
            None => ExecutorSettings::default(),
        };

        sink.event(ProgressEvent {
            task: None,
            message: format!("phase=Resolve; {} target(s)", targets.len()),
            elapsed: None,
        });
        let graph = self.build_graph(&config, workdir, &targets)?;

        if options.dryrun {
            let evaluation = FreshnessEvaluator::new(options.force).evaluate(&graph)?;
            let plan = ExecutionPlan::new(&graph, &evaluation)?;
            let outcome = ExecutionOutcome::from_evaluation(&graph, &evaluation);
            return Ok(RunReport {
                success: true,
                dryrun: true,
                unlocked: false,
                workdir: workdir.to_string(),
                planned: planned_tasks(&graph, &evaluation, &plan),
                tasks: task_reports(&graph, &outcome, options.show_failed_logs),
            });
        }

        fs::create_dir_all(workdir.as_std_path())
            .map_err(|err| CoidbError::Filesystem(err.to_string()))?;
        let lock = match WorkdirLock::acquire(workdir, &targets) {
            Ok(lock) => lock,
            Err(err) => {
                if let Some(holder) = WorkdirLock::holder(workdir) {
                    warn!(
                        pid = holder.pid,
                        created_at = %holder.created_at,
                        targets = ?holder.targets,
                        "work directory is locked"
                    );
                }
                return Err(err);
            }
        };

        let evaluation = FreshnessEvaluator::new(options.force).evaluate(&graph)?;
        let plan = ExecutionPlan::new(&graph, &evaluation)?;
        sink.event(ProgressEvent {
            task: None,
            message: format!(
                "phase=Plan; {} of {} task(s) to run",
                plan.len(),
                graph.len()
            ),
            elapsed: None,
        });

        let runner = StageExecutors::new(&self.fetcher, settings, options.printshellcmds);
        let engine = Engine::new(options.cores, options.show_failed_logs);
        let outcome = engine.execute(&graph, &evaluation, &plan, &runner, &lock, sink);
        if let Err(err) = lock.release() {
            warn!(%err, "failed to release work directory lock");
        }

        Ok(RunReport {
            success: outcome.success(&graph),
            dryrun: false,
            unlocked: false,
            workdir: workdir.to_string(),
            planned: planned_tasks(&graph, &evaluation, &plan),
            tasks: task_reports(&graph, &outcome, options.show_failed_logs),
        })
    }

    fn build_graph(
        &self,
        config: &Config,
        workdir: &Utf8Path,
        targets: &[Target],
    ) -> Result<TaskGraph, CoidbError> {
        GraphBuilder::new(&self.registry, config, workdir).build(targets)
    }
}

fn planned_tasks(
    graph: &TaskGraph,
    evaluation: &Evaluation,
    plan: &ExecutionPlan,
) -> Vec<PlannedTask> {
    plan.order()
        .iter()
        .map(|index| {
            let task = graph.task(*index);
            PlannedTask {
                id: task.id.clone(),
                stage: task.kind.to_string(),
                reason: evaluation.reason(*index),
                outputs: task.targets.iter().map(Target::to_string).collect(),
            }
        })
        .collect()
}

fn task_reports(
    graph: &TaskGraph,
    outcome: &ExecutionOutcome,
    full_errors: bool,
) -> Vec<TaskReport> {
    graph
        .topological_order()
        .unwrap_or_default()
        .into_iter()
        .map(|index| {
            let task = graph.task(index);
            TaskReport {
                id: task.id.clone(),
                stage: task.kind.to_string(),
                state: outcome.state(index),
                requested: graph.is_requested(index),
                elapsed_ms: outcome.elapsed(index).map(|elapsed| elapsed.as_millis() as u64),
                error: outcome.failure(index).map(|message| {
                    if full_errors {
                        message.to_string()
                    } else {
                        message.lines().next().unwrap_or_default().to_string()
                    }
                }),
            }
        })
        .collect()
}
