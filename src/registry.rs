use regex::{Captures, Regex};
use serde::Serialize;

use crate::domain::{Identity, Target};
use crate::error::CoidbError;

pub const BOLD_ARCHIVE: &str = "bold.zip";
pub const BACKBONE_ARCHIVE: &str = "backbone.zip";
pub const EXTRACT_ALIAS: &str = "extract";
pub const BOLD_INFO: &str = "bold_info.tsv";
pub const BOLD_SEQS: &str = "bold_seqs.tsv";
pub const BACKBONE_TAXON: &str = "backbone_taxon.tsv";
pub const FILTERED_INFO: &str = "bold_info_filtered.tsv";
pub const FILTERED_FASTA: &str = "bold_filtered.fasta";

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Download {
        archive: Target,
    },
    Extract {
        members: Vec<ArchiveMember>,
    },
    Filter {
        info: Target,
        sequences: Target,
        table: Target,
        fasta: Target,
    },
    Cluster {
        input: Target,
        output: Target,
        identity: IdentitySource,
    },
    Format {
        clustered: Target,
        info: Target,
        taxonomy: Target,
        assign_taxonomy: Target,
        add_species: Target,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IdentitySource {
    Configured,
    Fixed(Identity),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveMember {
    pub archive: Target,
    pub member: String,
    pub output: Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKey {
    DatabaseSource,
    Gene,
    Phyla,
    ClusterIdentity,
    ClusterTool,
}

impl Stage {
    pub fn kind(&self) -> &'static str {
        match self {
            Stage::Download { .. } => "download",
            Stage::Extract { .. } => "extract",
            Stage::Filter { .. } => "filter",
            Stage::Cluster { .. } => "cluster",
            Stage::Format { .. } => "format",
        }
    }

    pub fn inputs(&self) -> Vec<Target> {
        match self {
            Stage::Download { .. } => Vec::new(),
            Stage::Extract { members } => {
                let mut archives: Vec<Target> = Vec::new();
                for member in members {
                    if !archives.contains(&member.archive) {
                        archives.push(member.archive.clone());
                    }
                }
                archives
            }
            Stage::Filter {
                info, sequences, ..
            } => vec![info.clone(), sequences.clone()],
            Stage::Cluster { input, .. } => vec![input.clone()],
            Stage::Format {
                clustered,
                info,
                taxonomy,
                ..
            } => vec![clustered.clone(), info.clone(), taxonomy.clone()],
        }
    }

    pub fn outputs(&self) -> Vec<Target> {
        match self {
            Stage::Download { archive } => vec![archive.clone()],
            Stage::Extract { members } => members.iter().map(|m| m.output.clone()).collect(),
            Stage::Filter { table, fasta, .. } => vec![table.clone(), fasta.clone()],
            Stage::Cluster { output, .. } => vec![output.clone()],
            Stage::Format {
                assign_taxonomy,
                add_species,
                ..
            } => vec![assign_taxonomy.clone(), add_species.clone()],
        }
    }

    pub fn consumes(&self) -> Vec<ConfigKey> {
        match self {
            Stage::Download { .. } => vec![ConfigKey::DatabaseSource],
            Stage::Extract { .. } | Stage::Format { .. } => Vec::new(),
            Stage::Filter { .. } => vec![ConfigKey::Gene, ConfigKey::Phyla],
            Stage::Cluster {
                identity: IdentitySource::Configured,
                ..
            } => vec![ConfigKey::ClusterIdentity, ConfigKey::ClusterTool],
            Stage::Cluster { .. } => vec![ConfigKey::ClusterTool],
        }
    }
}

/// Static description of how one group of targets is produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTemplate {
    pub name: String,
    pub stage: Stage,
    pub inputs: Vec<Target>,
    pub outputs: Vec<Target>,
    pub consumes: Vec<ConfigKey>,
}

impl TaskTemplate {
    pub fn new(name: impl Into<String>, stage: Stage) -> Self {
        Self {
            name: name.into(),
            inputs: stage.inputs(),
            outputs: stage.outputs(),
            consumes: stage.consumes(),
            stage,
        }
    }
}

type Expand = fn(&Captures<'_>) -> Result<TaskTemplate, CoidbError>;

pub struct TargetRule {
    pub usage: &'static str,
    pattern: Regex,
    expand: Expand,
}

impl TargetRule {
    pub fn new(pattern: &'static str, usage: &'static str, expand: Expand) -> Self {
        Self {
            usage,
            pattern: Regex::new(pattern).expect("target rule patterns are static"),
            expand,
        }
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

pub struct Registry {
    rules: Vec<TargetRule>,
}

impl Registry {
    pub fn standard() -> Self {
        Self::with_rules(vec![
            TargetRule::new(
                r"^(bold\.zip|backbone\.zip)$",
                "bold.zip | backbone.zip: download a source archive",
                expand_download,
            ),
            TargetRule::new(
                r"^(extract|bold_info\.tsv|bold_seqs\.tsv|backbone_taxon\.tsv)$",
                "extract | bold_info.tsv | bold_seqs.tsv | backbone_taxon.tsv: unpack the source archives",
                expand_extract,
            ),
            TargetRule::new(
                r"^(bold_info_filtered\.tsv|bold_filtered\.fasta)$",
                "bold_info_filtered.tsv | bold_filtered.fasta: keep records matching the gene and phylum lists",
                expand_filter,
            ),
            TargetRule::new(
                r"^bold_clustered(?:_([5-9]\d|100))?\.fasta$",
                "bold_clustered.fasta | bold_clustered_<NN>.fasta: cluster at the configured or NN% identity",
                expand_cluster,
            ),
            TargetRule::new(
                r"^bold_clustered(?:_([5-9]\d|100))?\.(?:assignTaxonomy|addSpecies)\.fasta$",
                "bold_clustered[_<NN>].assignTaxonomy.fasta | bold_clustered[_<NN>].addSpecies.fasta: DADA2 reference files",
                expand_format,
            ),
        ])
    }

    pub fn with_rules(rules: Vec<TargetRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[TargetRule] {
        &self.rules
    }

    pub fn resolve(&self, target: &Target) -> Result<TaskTemplate, CoidbError> {
        for rule in &self.rules {
            if let Some(captures) = rule.pattern.captures(target.as_str()) {
                return (rule.expand)(&captures);
            }
        }
        Err(CoidbError::UnknownTarget(target.to_string()))
    }
}

fn target(name: &str) -> Target {
    Target::from_str_unchecked(name)
}

fn identity_suffix(captures: &Captures<'_>) -> Result<Option<Identity>, CoidbError> {
    let Some(percent) = captures.get(1) else {
        return Ok(None);
    };
    let unknown = || CoidbError::UnknownTarget(captures[0].to_string());
    let value: u32 = percent.as_str().parse().map_err(|_| unknown())?;
    if !(50..=100).contains(&value) {
        return Err(unknown());
    }
    Identity::from_percent(value).map(Some)
}

fn clustered_stem(identity: Option<Identity>) -> String {
    match identity {
        Some(identity) => format!("bold_clustered_{}", identity.percent()),
        None => "bold_clustered".to_string(),
    }
}

fn expand_download(captures: &Captures<'_>) -> Result<TaskTemplate, CoidbError> {
    let archive = target(&captures[1]);
    Ok(TaskTemplate::new(
        format!("download:{archive}"),
        Stage::Download { archive },
    ))
}

fn expand_extract(_captures: &Captures<'_>) -> Result<TaskTemplate, CoidbError> {
    let member = |archive: &str, member: &str, output: &str| ArchiveMember {
        archive: target(archive),
        member: member.to_string(),
        output: target(output),
    };
    Ok(TaskTemplate::new(
        EXTRACT_ALIAS,
        Stage::Extract {
            members: vec![
                member(BOLD_ARCHIVE, "bold_info.tsv", BOLD_INFO),
                member(BOLD_ARCHIVE, "bold_seqs.tsv", BOLD_SEQS),
                member(BACKBONE_ARCHIVE, "Taxon.tsv", BACKBONE_TAXON),
            ],
        },
    ))
}

fn expand_filter(_captures: &Captures<'_>) -> Result<TaskTemplate, CoidbError> {
    Ok(TaskTemplate::new(
        "filter",
        Stage::Filter {
            info: target(BOLD_INFO),
            sequences: target(BOLD_SEQS),
            table: target(FILTERED_INFO),
            fasta: target(FILTERED_FASTA),
        },
    ))
}

fn expand_cluster(captures: &Captures<'_>) -> Result<TaskTemplate, CoidbError> {
    let identity = identity_suffix(captures)?;
    let name = match identity {
        Some(identity) => format!("cluster:{}", identity.percent()),
        None => "cluster".to_string(),
    };
    Ok(TaskTemplate::new(
        name,
        Stage::Cluster {
            input: target(FILTERED_FASTA),
            output: target(&format!("{}.fasta", clustered_stem(identity))),
            identity: identity.map_or(IdentitySource::Configured, IdentitySource::Fixed),
        },
    ))
}

fn expand_format(captures: &Captures<'_>) -> Result<TaskTemplate, CoidbError> {
    let identity = identity_suffix(captures)?;
    let stem = clustered_stem(identity);
    let name = match identity {
        Some(identity) => format!("format:{}", identity.percent()),
        None => "format".to_string(),
    };
    Ok(TaskTemplate::new(
        name,
        Stage::Format {
            clustered: target(&format!("{stem}.fasta")),
            info: target(FILTERED_INFO),
            taxonomy: target(BACKBONE_TAXON),
            assign_taxonomy: target(&format!("{stem}.assignTaxonomy.fasta")),
            add_species: target(&format!("{stem}.addSpecies.fasta")),
        },
    ))
}
