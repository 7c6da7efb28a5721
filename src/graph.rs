use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::config::Config;
use crate::domain::Target;
use crate::error::CoidbError;
use crate::registry::{Registry, TaskTemplate};
use crate::stages::Job;

/// A task template bound to this run's configuration and work directory.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub kind: &'static str,
    pub job: Job,
    pub inputs: Vec<Utf8PathBuf>,
    pub outputs: Vec<Utf8PathBuf>,
    pub targets: Vec<Target>,
}

impl Task {
    pub fn bind(
        template: TaskTemplate,
        config: &Config,
        workdir: &Utf8Path,
    ) -> Result<Self, CoidbError> {
        let job = Job::bind(&template.stage, config, workdir)?;
        Ok(Self {
            kind: template.stage.kind(),
            inputs: template
                .inputs
                .iter()
                .map(|input| workdir.join(input.as_path()))
                .collect(),
            outputs: template
                .outputs
                .iter()
                .map(|output| workdir.join(output.as_path()))
                .collect(),
            targets: template.outputs,
            id: template.name,
            job,
        })
    }
}

/// Dependency graph of tasks; an edge points from a prerequisite to its dependent.
#[derive(Debug, Default)]
pub struct TaskGraph {
    graph: DiGraph<Task, ()>,
    index: HashMap<String, NodeIndex>,
    requested: Vec<(Target, NodeIndex)>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn task(&self, index: NodeIndex) -> &Task {
        &self.graph[index]
    }

    pub fn find(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub fn requested(&self) -> &[(Target, NodeIndex)] {
        &self.requested
    }

    pub fn is_requested(&self, index: NodeIndex) -> bool {
        self.requested.iter().any(|(_, requested)| *requested == index)
    }

    pub fn prerequisites(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Incoming)
    }

    pub fn dependents(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Outgoing)
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn topological_order(&self) -> Result<Vec<NodeIndex>, CoidbError> {
        toposort(&self.graph, None)
            .map_err(|cycle| CoidbError::CyclicDependency(vec![self.graph[cycle.node_id()].id.clone()]))
    }
}

pub struct GraphBuilder<'a> {
    registry: &'a Registry,
    config: &'a Config,
    workdir: &'a Utf8Path,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a Registry, config: &'a Config, workdir: &'a Utf8Path) -> Self {
        Self {
            registry,
            config,
            workdir,
        }
    }

    /// Resolves `targets` and every prerequisite into the smallest graph producing them.
    /// All requested names are resolved before any node is built.
    pub fn build(&self, targets: &[Target]) -> Result<TaskGraph, CoidbError> {
        let roots = targets
            .iter()
            .map(|target| Ok((target.clone(), self.registry.resolve(target)?)))
            .collect::<Result<Vec<_>, CoidbError>>()?;

        let mut graph = TaskGraph::default();
        for (target, template) in roots {
            let mut trail = Vec::new();
            let index = self.visit(template, &mut graph, &mut trail)?;
            graph.requested.push((target, index));
        }
        Ok(graph)
    }

    fn visit(
        &self,
        template: TaskTemplate,
        graph: &mut TaskGraph,
        trail: &mut Vec<String>,
    ) -> Result<NodeIndex, CoidbError> {
        if let Some(index) = graph.find(&template.name) {
            return Ok(index);
        }
        if let Some(position) = trail.iter().position(|name| *name == template.name) {
            let mut cycle = trail[position..].to_vec();
            cycle.push(template.name);
            return Err(CoidbError::CyclicDependency(cycle));
        }

        trail.push(template.name.clone());
        let mut prerequisites = Vec::new();
        for input in &template.inputs {
            let producer = self.registry.resolve(input)?;
            let index = self.visit(producer, graph, trail)?;
            if !prerequisites.contains(&index) {
                prerequisites.push(index);
            }
        }
        trail.pop();

        let name = template.name.clone();
        let task = Task::bind(template, self.config, self.workdir)?;
        let index = graph.graph.add_node(task);
        graph.index.insert(name, index);
        for prerequisite in prerequisites {
            graph.graph.add_edge(prerequisite, index, ());
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;

    fn build(targets: &[&str]) -> TaskGraph {
        let registry = Registry::standard();
        let config = ConfigLoader::defaults().unwrap();
        let targets = targets
            .iter()
            .map(|name| name.parse().unwrap())
            .collect::<Vec<Target>>();
        GraphBuilder::new(&registry, &config, Utf8Path::new("work"))
            .build(&targets)
            .unwrap()
    }

    #[test]
    fn shared_prerequisites_appear_once() {
        let graph = build(&[
            "bold_clustered.assignTaxonomy.fasta",
            "bold_clustered.addSpecies.fasta",
            "bold_clustered_95.fasta",
        ]);
        // two downloads, extract, filter, two clusterings, one format
        assert_eq!(graph.len(), 7);
        assert_eq!(graph.requested().len(), 3);
        assert_eq!(graph.requested()[0].1, graph.requested()[1].1);
    }

    #[test]
    fn topological_order_puts_prerequisites_first() {
        let graph = build(&["bold_clustered.fasta"]);
        let order = graph.topological_order().unwrap();
        let position = |id: &str| {
            let index = graph.find(id).unwrap();
            order.iter().position(|item| *item == index).unwrap()
        };
        assert!(position("download:bold.zip") < position("extract"));
        assert!(position("extract") < position("filter"));
        assert!(position("filter") < position("cluster"));
    }

    #[test]
    fn paths_are_rooted_in_workdir() {
        let graph = build(&["bold_filtered.fasta"]);
        let filter = graph.task(graph.find("filter").unwrap());
        assert_eq!(filter.inputs[0], Utf8PathBuf::from("work/bold_info.tsv"));
        assert_eq!(filter.outputs[1], Utf8PathBuf::from("work/bold_filtered.fasta"));
    }
}
