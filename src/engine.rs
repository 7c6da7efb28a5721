use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use tracing::{debug, error, info};

use crate::domain::TaskState;
use crate::error::CoidbError;
use crate::freshness::Evaluation;
use crate::graph::{Task, TaskGraph};
use crate::lock::WorkdirLock;
use crate::pipeline::{ProgressEvent, ProgressSink};

/// Runs one task to completion. Called concurrently from worker threads.
pub trait TaskRunner: Sync {
    fn run(&self, task: &Task) -> Result<(), CoidbError>;
}

/// Stale tasks in an order where every prerequisite precedes its dependents.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    order: Vec<NodeIndex>,
}

impl ExecutionPlan {
    pub fn new(graph: &TaskGraph, evaluation: &Evaluation) -> Result<Self, CoidbError> {
        let order = graph
            .topological_order()?
            .into_iter()
            .filter(|index| evaluation.state(*index) == TaskState::Stale)
            .collect();
        Ok(Self { order })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn order(&self) -> &[NodeIndex] {
        &self.order
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    states: HashMap<NodeIndex, TaskState>,
    failures: HashMap<NodeIndex, String>,
    elapsed: HashMap<NodeIndex, Duration>,
}

impl ExecutionOutcome {
    pub fn from_evaluation(graph: &TaskGraph, evaluation: &Evaluation) -> Self {
        let states = graph
            .topological_order()
            .unwrap_or_default()
            .into_iter()
            .map(|index| (index, evaluation.state(index)))
            .collect();
        Self {
            states,
            ..Self::default()
        }
    }

    pub fn state(&self, index: NodeIndex) -> TaskState {
        self.states
            .get(&index)
            .copied()
            .unwrap_or(TaskState::Stale)
    }

    pub fn failure(&self, index: NodeIndex) -> Option<&str> {
        self.failures.get(&index).map(String::as_str)
    }

    pub fn elapsed(&self, index: NodeIndex) -> Option<Duration> {
        self.elapsed.get(&index).copied()
    }

    /// True when every requested target was produced or already up to date.
    pub fn success(&self, graph: &TaskGraph) -> bool {
        graph
            .requested()
            .iter()
            .all(|(_, index)| self.state(*index).is_complete())
    }
}

struct Completion {
    index: NodeIndex,
    result: Result<(), CoidbError>,
    elapsed: Duration,
}

pub struct Engine {
    cores: usize,
    show_failed_logs: bool,
}

impl Engine {
    pub fn new(cores: usize, show_failed_logs: bool) -> Self {
        Self {
            cores: cores.max(1),
            show_failed_logs,
        }
    }

    /// Runs the plan on a pool of at most `cores` workers. A failed task cancels its
    /// unstarted dependents; independent branches keep running.
    pub fn execute(
        &self,
        graph: &TaskGraph,
        evaluation: &Evaluation,
        plan: &ExecutionPlan,
        runner: &dyn TaskRunner,
        lock: &WorkdirLock,
        sink: &dyn ProgressSink,
    ) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::from_evaluation(graph, evaluation);
        if plan.is_empty() {
            return outcome;
        }

        let position: HashMap<NodeIndex, usize> = plan
            .order
            .iter()
            .enumerate()
            .map(|(slot, index)| (*index, slot))
            .collect();
        let mut waiting: HashMap<NodeIndex, usize> = plan
            .order
            .iter()
            .map(|index| {
                let pending = graph
                    .prerequisites(*index)
                    .filter(|prerequisite| position.contains_key(prerequisite))
                    .count();
                (*index, pending)
            })
            .collect();
        let mut ready: BTreeSet<usize> = plan
            .order
            .iter()
            .enumerate()
            .filter(|(_, index)| waiting[*index] == 0)
            .map(|(slot, _)| slot)
            .collect();

        let workers = self.cores.min(plan.len());
        debug!(lock = %lock.path(), workers, tasks = plan.len(), "executing plan");
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<NodeIndex>();
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<Completion>();

        thread::scope(|scope| {
            for worker in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                scope.spawn(move || {
                    for index in job_rx.iter() {
                        let task = graph.task(index);
                        debug!(worker, task = %task.id, "worker picked up task");
                        let started = Instant::now();
                        let result = panic::catch_unwind(AssertUnwindSafe(|| runner.run(task)))
                            .unwrap_or_else(|payload| {
                                Err(CoidbError::TaskPanicked(panic_message(&*payload)))
                            });
                        let completion = Completion {
                            index,
                            result,
                            elapsed: started.elapsed(),
                        };
                        if done_tx.send(completion).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(done_tx);

            let mut in_flight = 0usize;
            loop {
                while in_flight < workers {
                    let Some(slot) = ready.pop_first() else {
                        break;
                    };
                    let index = plan.order[slot];
                    let task = graph.task(index);
                    outcome.states.insert(index, TaskState::Running);
                    info!(task = %task.id, stage = task.kind, "starting task");
                    sink.event(ProgressEvent {
                        task: Some(task.id.clone()),
                        message: format!("phase=Run; {} started", task.id),
                        elapsed: None,
                    });
                    if job_tx.send(index).is_err() {
                        break;
                    }
                    in_flight += 1;
                }
                if in_flight == 0 {
                    break;
                }

                let Ok(completion) = done_rx.recv() else {
                    break;
                };
                in_flight -= 1;
                let index = completion.index;
                let task = graph.task(index);
                outcome.elapsed.insert(index, completion.elapsed);

                match completion.result {
                    Ok(()) => {
                        outcome.states.insert(index, TaskState::Done);
                        info!(
                            task = %task.id,
                            elapsed_ms = completion.elapsed.as_millis() as u64,
                            "task finished"
                        );
                        sink.event(ProgressEvent {
                            task: Some(task.id.clone()),
                            message: format!("phase=Run; {} done", task.id),
                            elapsed: Some(completion.elapsed),
                        });
                        for dependent in graph.dependents(index) {
                            let Some(pending) = waiting.get_mut(&dependent) else {
                                continue;
                            };
                            *pending -= 1;
                            if *pending == 0 && outcome.state(dependent) == TaskState::Stale {
                                ready.insert(position[&dependent]);
                            }
                        }
                    }
                    Err(err) => {
                        let message = err.to_string();
                        if self.show_failed_logs {
                            error!(task = %task.id, error = %message, "task failed");
                        } else {
                            let summary = message.lines().next().unwrap_or_default();
                            error!(task = %task.id, error = %summary, "task failed");
                        }
                        sink.event(ProgressEvent {
                            task: Some(task.id.clone()),
                            message: format!("phase=Run; {} failed", task.id),
                            elapsed: Some(completion.elapsed),
                        });
                        outcome.states.insert(index, TaskState::Failed);
                        outcome.failures.insert(index, message);
                        cancel_dependents(graph, index, &mut outcome, sink);
                    }
                }
            }
            drop(job_tx);
        });

        outcome
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn cancel_dependents(
    graph: &TaskGraph,
    failed: NodeIndex,
    outcome: &mut ExecutionOutcome,
    sink: &dyn ProgressSink,
) {
    let origin = graph.task(failed).id.clone();
    let mut stack: Vec<NodeIndex> = graph.dependents(failed).collect();
    while let Some(index) = stack.pop() {
        if outcome.state(index) != TaskState::Stale {
            continue;
        }
        let task = graph.task(index);
        outcome.states.insert(index, TaskState::Failed);
        outcome
            .failures
            .insert(index, CoidbError::Upstream(origin.clone()).to_string());
        sink.event(ProgressEvent {
            task: Some(task.id.clone()),
            message: format!("phase=Run; {} cancelled", task.id),
            elapsed: None,
        });
        stack.extend(graph.dependents(index));
    }
}
