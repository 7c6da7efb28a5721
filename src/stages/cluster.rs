use std::process::Command;

use camino::Utf8PathBuf;
use tracing::info;

use crate::config::{ClusterTool, ExecutorSettings};
use crate::domain::Identity;
use crate::error::CoidbError;
use crate::fasta::{self, FastaRecord};
use crate::fs_util::{find_in_path, io_error, persist, staging_file, write_atomic};

const IDENTITY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterJob {
    pub input: Utf8PathBuf,
    pub output: Utf8PathBuf,
    pub identity: Identity,
    pub tool: ClusterTool,
    pub executable: String,
    pub threads: usize,
}

/// Clusters the input and writes one representative per cluster. Returns the
/// number of representatives.
pub fn run(
    job: &ClusterJob,
    settings: &ExecutorSettings,
    printshellcmds: bool,
) -> Result<usize, CoidbError> {
    let records = fasta::read(&job.input)?;
    if records.is_empty() {
        write_atomic(&job.output, |_| Ok(()))?;
        return Ok(0);
    }
    match job.tool {
        ClusterTool::Builtin => {
            let centroids = greedy_centroids(&records, job.identity);
            write_atomic(&job.output, |writer| {
                fasta::write(writer, centroids.iter().map(|index| &records[*index]))
                    .map_err(io_error(&job.output))
            })?;
            Ok(centroids.len())
        }
        ClusterTool::Vsearch => run_vsearch(job, settings, printshellcmds),
    }
}

fn run_vsearch(
    job: &ClusterJob,
    settings: &ExecutorSettings,
    printshellcmds: bool,
) -> Result<usize, CoidbError> {
    let program = find_in_path(&job.executable)
        .ok_or_else(|| CoidbError::MissingTool(job.executable.clone()))?;
    let temp = staging_file(&job.output)?;

    let mut args = vec![
        "--cluster_fast".to_string(),
        job.input.to_string(),
        "--id".to_string(),
        job.identity.fraction().to_string(),
        "--centroids".to_string(),
        temp.path().to_string_lossy().to_string(),
        "--threads".to_string(),
        job.threads.to_string(),
        "--notrunclabels".to_string(),
        "--quiet".to_string(),
    ];
    args.extend(settings.extra_args());

    if printshellcmds {
        info!("{} {}", program.display(), args.join(" "));
    }
    let output = Command::new(&program)
        .args(&args)
        .output()
        .map_err(|err| CoidbError::MissingTool(format!("{}: {err}", program.display())))?;
    if !output.status.success() {
        return Err(CoidbError::ClusterTool {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let representatives = fasta::read(
        &Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
            .map_err(|_| CoidbError::Filesystem("non-utf8 staging path".to_string()))?,
    )?
    .len();
    persist(temp, &job.output)?;
    Ok(representatives)
}

/// Greedy centroid clustering: longest sequences seed clusters first (ties keep input
/// order) and each sequence joins the first centroid it matches at `identity`.
pub fn greedy_centroids(records: &[FastaRecord], identity: Identity) -> Vec<usize> {
    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by(|a, b| records[*b].sequence.len().cmp(&records[*a].sequence.len()));

    let threshold = identity.fraction() - IDENTITY_EPSILON;
    let mut centroids: Vec<usize> = Vec::new();
    for index in order {
        let query = records[index].sequence.as_bytes();
        let joined = centroids.iter().any(|centroid| {
            sequence_identity(records[*centroid].sequence.as_bytes(), query, threshold)
                >= threshold
        });
        if !joined {
            centroids.push(index);
        }
    }
    centroids
}

/// Identity as `1 - edit_distance / longer_length`. Returns early with a lower bound
/// when the length difference alone rules out reaching `threshold`.
pub fn sequence_identity(a: &[u8], b: &[u8], threshold: f64) -> f64 {
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    let length_bound = 1.0 - a.len().abs_diff(b.len()) as f64 / longest as f64;
    if length_bound < threshold {
        return length_bound;
    }
    1.0 - edit_distance(a, b) as f64 / longest as f64
}

fn edit_distance(a: &[u8], b: &[u8]) -> usize {
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, left) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, right) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(left != right);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}
