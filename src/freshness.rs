use std::collections::HashMap;
use std::time::SystemTime;

use petgraph::graph::NodeIndex;
use serde::Serialize;

use crate::domain::TaskState;
use crate::error::CoidbError;
use crate::fs_util::modified;
use crate::graph::{Task, TaskGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    Forced,
    MissingOutput,
    MissingInput,
    NewerInput,
    PrerequisiteStale,
}

#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    states: HashMap<NodeIndex, TaskState>,
    reasons: HashMap<NodeIndex, StaleReason>,
}

impl Evaluation {
    pub fn state(&self, index: NodeIndex) -> TaskState {
        self.states
            .get(&index)
            .copied()
            .unwrap_or(TaskState::Stale)
    }

    pub fn reason(&self, index: NodeIndex) -> Option<StaleReason> {
        self.reasons.get(&index).copied()
    }

    pub fn stale_count(&self) -> usize {
        self.states
            .values()
            .filter(|state| **state == TaskState::Stale)
            .count()
    }
}

pub struct FreshnessEvaluator {
    force: bool,
}

impl FreshnessEvaluator {
    pub fn new(force: bool) -> Self {
        Self { force }
    }

    /// Marks each task `Satisfied` or `Stale`. A task goes stale when forced, when an
    /// output is missing or older than an input, or when any prerequisite is stale.
    pub fn evaluate(&self, graph: &TaskGraph) -> Result<Evaluation, CoidbError> {
        let mut evaluation = Evaluation::default();
        for index in graph.topological_order()? {
            let reason = if self.force && graph.is_requested(index) {
                Some(StaleReason::Forced)
            } else if graph
                .prerequisites(index)
                .any(|prerequisite| evaluation.state(prerequisite) == TaskState::Stale)
            {
                Some(StaleReason::PrerequisiteStale)
            } else {
                file_staleness(graph.task(index))
            };

            match reason {
                Some(reason) => {
                    evaluation.states.insert(index, TaskState::Stale);
                    evaluation.reasons.insert(index, reason);
                }
                None => {
                    evaluation.states.insert(index, TaskState::Satisfied);
                }
            }
        }
        Ok(evaluation)
    }
}

fn file_staleness(task: &Task) -> Option<StaleReason> {
    let mut oldest_output: Option<SystemTime> = None;
    for output in &task.outputs {
        let Some(time) = modified(output) else {
            return Some(StaleReason::MissingOutput);
        };
        oldest_output = Some(oldest_output.map_or(time, |oldest| oldest.min(time)));
    }
    let oldest_output = match oldest_output {
        Some(time) => time,
        None => return Some(StaleReason::MissingOutput),
    };

    for input in &task.inputs {
        match modified(input) {
            None => return Some(StaleReason::MissingInput),
            Some(time) if time > oldest_output => return Some(StaleReason::NewerInput),
            Some(_) => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::fs::{self, File};
    use std::time::Duration;

    use camino::{Utf8Path, Utf8PathBuf};

    use super::*;
    use crate::config::ConfigLoader;
    use crate::domain::Target;
    use crate::graph::GraphBuilder;
    use crate::registry::Registry;

    fn graph(workdir: &Utf8Path, targets: &[&str]) -> TaskGraph {
        let registry = Registry::standard();
        let config = ConfigLoader::defaults().unwrap();
        let targets = targets
            .iter()
            .map(|name| name.parse().unwrap())
            .collect::<Vec<Target>>();
        GraphBuilder::new(&registry, &config, workdir)
            .build(&targets)
            .unwrap()
    }

    fn touch(path: &Utf8Path, age: Duration) {
        fs::write(path, b"x").unwrap();
        let time = SystemTime::now() - age;
        File::options()
            .append(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    fn reason(graph: &TaskGraph, evaluation: &Evaluation, id: &str) -> Option<StaleReason> {
        evaluation.reason(graph.find(id).unwrap())
    }

    #[test]
    fn missing_outputs_make_everything_stale() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let graph = graph(&workdir, &["bold_filtered.fasta"]);
        let evaluation = FreshnessEvaluator::new(false).evaluate(&graph).unwrap();

        assert_eq!(evaluation.stale_count(), graph.len());
        assert_eq!(
            reason(&graph, &evaluation, "download:bold.zip"),
            Some(StaleReason::MissingOutput)
        );
        assert_eq!(
            reason(&graph, &evaluation, "filter"),
            Some(StaleReason::PrerequisiteStale)
        );
    }

    #[test]
    fn older_inputs_are_satisfied_and_newer_inputs_are_not() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let hour = Duration::from_secs(3600);
        for archive in ["bold.zip", "backbone.zip"] {
            touch(&workdir.join(archive), hour * 3);
        }
        for member in ["bold_info.tsv", "bold_seqs.tsv", "backbone_taxon.tsv"] {
            touch(&workdir.join(member), hour * 2);
        }
        touch(&workdir.join("bold_info_filtered.tsv"), hour);
        touch(&workdir.join("bold_filtered.fasta"), hour);

        let graph = graph(&workdir, &["bold_filtered.fasta"]);
        let evaluation = FreshnessEvaluator::new(false).evaluate(&graph).unwrap();
        assert_eq!(evaluation.stale_count(), 0);

        touch(&workdir.join("bold_seqs.tsv"), Duration::ZERO);
        let evaluation = FreshnessEvaluator::new(false).evaluate(&graph).unwrap();
        assert_eq!(evaluation.stale_count(), 1);
        assert_eq!(
            reason(&graph, &evaluation, "filter"),
            Some(StaleReason::NewerInput)
        );
        assert_eq!(
            evaluation.state(graph.find("extract").unwrap()),
            TaskState::Satisfied
        );
    }

    #[test]
    fn one_missing_output_is_enough() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        touch(&workdir.join("bold.zip"), Duration::from_secs(60));
        touch(&workdir.join("backbone.zip"), Duration::from_secs(60));
        touch(&workdir.join("bold_info.tsv"), Duration::ZERO);

        let graph = graph(&workdir, &["extract"]);
        let evaluation = FreshnessEvaluator::new(false).evaluate(&graph).unwrap();
        assert_eq!(
            reason(&graph, &evaluation, "extract"),
            Some(StaleReason::MissingOutput)
        );
        assert_eq!(
            evaluation.state(graph.find("download:bold.zip").unwrap()),
            TaskState::Satisfied
        );
    }

    #[test]
    fn force_only_marks_requested_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        touch(&workdir.join("bold.zip"), Duration::from_secs(60));
        touch(&workdir.join("backbone.zip"), Duration::from_secs(60));

        let graph = graph(&workdir, &["bold.zip"]);
        let evaluation = FreshnessEvaluator::new(true).evaluate(&graph).unwrap();
        assert_eq!(
            reason(&graph, &evaluation, "download:bold.zip"),
            Some(StaleReason::Forced)
        );
        assert_eq!(evaluation.stale_count(), 1);
    }
}
