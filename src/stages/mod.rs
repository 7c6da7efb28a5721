use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use crate::config::{Config, ExecutorSettings};
use crate::engine::TaskRunner;
use crate::error::CoidbError;
use crate::graph::Task;
use crate::registry::{IdentitySource, Stage};

pub mod cluster;
pub mod download;
pub mod extract;
pub mod filter;
pub mod format;

use cluster::ClusterJob;
use download::{DownloadJob, Fetcher};
use extract::{ExtractJob, ExtractMember};
use filter::FilterJob;
use format::FormatJob;

/// A stage with every configuration value and path resolved for one run.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    Download(DownloadJob),
    Extract(ExtractJob),
    Filter(FilterJob),
    Cluster(ClusterJob),
    Format(FormatJob),
}

impl Job {
    pub fn bind(stage: &Stage, config: &Config, workdir: &Utf8Path) -> Result<Self, CoidbError> {
        let path = |target: &crate::domain::Target| -> Utf8PathBuf { workdir.join(target.as_path()) };
        let job = match stage {
            Stage::Download { archive } => Job::Download(DownloadJob {
                url: config.source_url(archive.as_str())?.to_string(),
                destination: path(archive),
            }),
            Stage::Extract { members } => Job::Extract(ExtractJob {
                members: members
                    .iter()
                    .map(|member| ExtractMember {
                        archive: path(&member.archive),
                        member: member.member.clone(),
                        output: path(&member.output),
                    })
                    .collect(),
            }),
            Stage::Filter {
                info,
                sequences,
                table,
                fasta,
            } => Job::Filter(FilterJob {
                info: path(info),
                sequences: path(sequences),
                table: path(table),
                fasta: path(fasta),
                genes: config.database.gene.clone(),
                phyla: config.database.phyla.clone(),
            }),
            Stage::Cluster {
                input,
                output,
                identity,
            } => Job::Cluster(ClusterJob {
                input: path(input),
                output: path(output),
                identity: match identity {
                    IdentitySource::Configured => config.clustering.identity,
                    IdentitySource::Fixed(identity) => *identity,
                },
                tool: config.clustering.tool,
                executable: config.clustering.executable.clone(),
                threads: config.clustering.threads,
            }),
            Stage::Format {
                clustered,
                info,
                taxonomy,
                assign_taxonomy,
                add_species,
            } => Job::Format(FormatJob {
                clustered: path(clustered),
                info: path(info),
                taxonomy: path(taxonomy),
                assign_taxonomy: path(assign_taxonomy),
                add_species: path(add_species),
            }),
        };
        Ok(job)
    }
}

/// Dispatches each task to the executor for its stage.
pub struct StageExecutors<F: Fetcher> {
    fetcher: F,
    settings: ExecutorSettings,
    printshellcmds: bool,
}

impl<F: Fetcher> StageExecutors<F> {
    pub fn new(fetcher: F, settings: ExecutorSettings, printshellcmds: bool) -> Self {
        Self {
            fetcher,
            settings,
            printshellcmds,
        }
    }
}

impl<F: Fetcher> TaskRunner for StageExecutors<F> {
    fn run(&self, task: &Task) -> Result<(), CoidbError> {
        match &task.job {
            Job::Download(job) => download::run(&self.fetcher, job),
            Job::Extract(job) => extract::run(job),
            Job::Filter(job) => {
                let summary = filter::run(job)?;
                if summary.kept == 0 {
                    warn!(
                        task = %task.id,
                        total = summary.total,
                        "no records passed the gene/phylum filter"
                    );
                } else {
                    info!(task = %task.id, kept = summary.kept, total = summary.total, "filtered records");
                }
                Ok(())
            }
            Job::Cluster(job) => {
                let representatives = cluster::run(job, &self.settings, self.printshellcmds)?;
                info!(task = %task.id, identity = %job.identity, representatives, "clustered sequences");
                Ok(())
            }
            Job::Format(job) => {
                let summary = format::run(job)?;
                info!(
                    task = %task.id,
                    assign_taxonomy = summary.assign_taxonomy,
                    add_species = summary.add_species,
                    "wrote reference files"
                );
                Ok(())
            }
        }
    }
}
