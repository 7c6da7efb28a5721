use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use coidb::domain::TaskState;
use coidb::error::CoidbError;
use coidb::fasta;
use coidb::freshness::StaleReason;
use coidb::lock::WorkdirLock;
use coidb::pipeline::{NoopSink, Pipeline, RunOptions, RunReport};
use coidb::registry::Registry;
use coidb::stages::download::{Fetcher, HttpFetcher};

const INFO: &str = "\
id\tgene\tkingdom\tphylum\tclass\torder\tfamily\tgenus\tspecies
r1\tCOI-5P\tAnimalia\tArthropoda\tInsecta\tDiptera\tCulicidae\tAedes\taegypti
r2\tCOI-5P\tAnimalia\tArthropoda\tInsecta\tDiptera\tCulicidae\tAedes\talbopictus
r3\tCOI-5P\t\tChordata\tActinopteri\tCypriniformes\tCyprinidae\tDanio\tDanio rerio
r4\tCOI-5P\tAnimalia\tArthropoda\tInsecta\tDiptera\tCulicidae\tAedes\t
r5\tITS\tAnimalia\tArthropoda\tInsecta\tDiptera\tCulicidae\tAedes\taegypti
r6\tCOI-3P\tAnimalia\tArthropoda\tInsecta\tDiptera\tCulicidae\tAedes\taegypti
";

const TAXON: &str = "\
taxonID\tscientificName\ttaxonRank\ttaxonomicStatus\tkingdom\tphylum
44\tChordata\tphylum\taccepted\tAnimalia\tChordata
54\tArthropoda\tphylum\taccepted\tAnimalia\tArthropoda
99\tChordata\tphylum\tsynonym\tPlantae\tChordata
";

/// 100 bp reference sequence.
fn base_sequence() -> String {
    "ACGTTGCA".repeat(12) + "ACGT"
}

/// `base_sequence` with two substitutions: 98% identical.
fn near_sequence() -> String {
    let mut bytes = base_sequence().into_bytes();
    bytes[10] = b'A';
    bytes[60] = b'C';
    String::from_utf8(bytes).unwrap()
}

fn distant_sequence() -> String {
    "GGGGGCCCCC".repeat(10)
}

struct Fixture {
    _dir: TempDir,
    root: Utf8PathBuf,
    workdir: Utf8PathBuf,
    config: Utf8PathBuf,
}

impl Fixture {
    fn new() -> Self {
        Self::with_clustering("tool: builtin")
    }

    fn with_clustering(clustering: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let seqs = format!(
            "id\tnucleotides\nr1\t{}\nr2\t{}\nr3\t{}\nr4\t{}\nr5\t{}\nr6\t{}\n",
            base_sequence(),
            near_sequence(),
            distant_sequence(),
            base_sequence().to_lowercase(),
            base_sequence(),
            base_sequence(),
        );
        write_zip(
            &root.join("bold.zip"),
            &[("data/bold_info.tsv", INFO), ("data/bold_seqs.tsv", seqs.as_str())],
        );
        write_zip(&root.join("backbone.zip"), &[("Taxon.tsv", TAXON)]);

        let config = root.join("config.yaml");
        fs::write(
            &config,
            format!(
                "database:\n  bold.zip: file://{}\n  backbone.zip: {}\nclustering:\n  {clustering}\n",
                root.join("bold.zip"),
                root.join("backbone.zip"),
            ),
        )
        .unwrap();

        Self {
            workdir: root.join("work"),
            root,
            config,
            _dir: dir,
        }
    }

    fn options(&self, targets: &[&str]) -> RunOptions {
        RunOptions {
            targets: targets.iter().map(|target| target.to_string()).collect(),
            workdir: self.workdir.clone(),
            config_file: vec![self.config.clone()],
            ..RunOptions::default()
        }
    }

    fn extra_config(&self, name: &str, content: &str) -> Utf8PathBuf {
        let path = self.root.join(name);
        fs::write(&path, content).unwrap();
        path
    }
}

fn write_zip(path: &Utf8Path, entries: &[(&str, &str)]) {
    let file = File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    for (name, content) in entries {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

#[derive(Default)]
struct CountingFetcher {
    calls: AtomicUsize,
}

impl Fetcher for CountingFetcher {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), CoidbError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        HttpFetcher::new()?.fetch(url, destination)
    }
}

/// Removes the work directory lock while the run is still holding it.
struct LockStealingFetcher {
    workdir: Utf8PathBuf,
}

impl Fetcher for LockStealingFetcher {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), CoidbError> {
        WorkdirLock::clear(&self.workdir)?;
        HttpFetcher::new()?.fetch(url, destination)
    }
}

fn run(options: &RunOptions) -> Result<RunReport, CoidbError> {
    Pipeline::new(Registry::standard(), HttpFetcher::new()?).run(options, &NoopSink)
}

fn ids(path: &Utf8Path) -> Vec<String> {
    fasta::read(path)
        .unwrap()
        .into_iter()
        .map(|record| record.id)
        .collect()
}

/// Distinct values of `column` in a tab-separated table with a header row.
fn distinct_column(path: &Utf8Path, column: &str) -> BTreeSet<String> {
    let table = fs::read_to_string(path).unwrap();
    let mut lines = table.lines();
    let header: Vec<&str> = lines.next().unwrap().split('\t').collect();
    let position = header.iter().position(|name| *name == column).unwrap();
    lines
        .map(|line| line.split('\t').nth(position).unwrap_or_default().to_string())
        .collect()
}

fn state_of(report: &RunReport, id: &str) -> TaskState {
    report
        .tasks
        .iter()
        .find(|task| task.id == id)
        .map(|task| task.state)
        .unwrap()
}

#[test]
fn second_run_does_no_work() {
    let fixture = Fixture::new();
    let fetcher = CountingFetcher::default();
    let pipeline = Pipeline::new(Registry::standard(), &fetcher);
    let options = fixture.options(&[
        "bold_clustered.assignTaxonomy.fasta",
        "bold_clustered.addSpecies.fasta",
    ]);

    let first = pipeline.run(&options, &NoopSink).unwrap();
    assert!(first.success);
    assert_eq!(first.planned.len(), 6);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

    let assign = fs::read(fixture.workdir.join("bold_clustered.assignTaxonomy.fasta")).unwrap();
    let second = pipeline.run(&options, &NoopSink).unwrap();
    assert!(second.success);
    assert!(second.planned.is_empty());
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert!(
        second
            .tasks
            .iter()
            .all(|task| task.state == TaskState::Satisfied)
    );
    assert_eq!(
        fs::read(fixture.workdir.join("bold_clustered.assignTaxonomy.fasta")).unwrap(),
        assign
    );
    assert!(!WorkdirLock::is_held(&fixture.workdir));
}

#[test]
fn filter_keeps_requested_genes() {
    let fixture = Fixture::new();
    let report = run(&fixture.options(&["bold_filtered.fasta"])).unwrap();
    assert!(report.success);

    assert_eq!(
        ids(&fixture.workdir.join("bold_filtered.fasta")),
        vec!["r1", "r2", "r3", "r4", "r6"]
    );
    let table = fixture.workdir.join("bold_info_filtered.tsv");
    assert!(fs::read_to_string(&table).unwrap().starts_with("id\tgene\t"));
    assert_eq!(
        distinct_column(&table, "gene"),
        BTreeSet::from(["COI-5P".to_string(), "COI-3P".to_string()])
    );
}

#[test]
fn filter_keeps_requested_phyla() {
    let fixture = Fixture::new();
    let phyla = fixture.extra_config("phyla.yaml", "database:\n  phyla: [Chordata]\n");
    let mut options = fixture.options(&["bold_filtered.fasta"]);
    options.config_file.push(phyla);

    let report = run(&options).unwrap();
    assert!(report.success);
    assert_eq!(ids(&fixture.workdir.join("bold_filtered.fasta")), vec!["r3"]);
    assert_eq!(
        distinct_column(&fixture.workdir.join("bold_info_filtered.tsv"), "phylum"),
        BTreeSet::from(["Chordata".to_string()])
    );
}

#[test]
fn gene_list_narrows_to_exactly_the_listed_genes() {
    let fixture = Fixture::new();
    let genes = fixture.extra_config("genes.yaml", "database:\n  gene: [COI-3P, ITS]\n");
    let mut options = fixture.options(&["bold_filtered.fasta"]);
    options.config_file.push(genes);

    assert!(run(&options).unwrap().success);
    assert_eq!(
        distinct_column(&fixture.workdir.join("bold_info_filtered.tsv"), "gene"),
        BTreeSet::from(["COI-3P".to_string(), "ITS".to_string()])
    );
    assert_eq!(ids(&fixture.workdir.join("bold_filtered.fasta")), vec!["r5", "r6"]);
}

#[test]
fn identity_controls_representative_count() {
    let fixture = Fixture::new();
    let options = fixture.options(&["bold_clustered_100.fasta", "bold_clustered_95.fasta"]);
    let report = run(&options).unwrap();
    assert!(report.success);

    assert_eq!(
        ids(&fixture.workdir.join("bold_clustered_100.fasta")),
        vec!["r1", "r2", "r3"]
    );
    assert_eq!(
        ids(&fixture.workdir.join("bold_clustered_95.fasta")),
        vec!["r1", "r3"]
    );
}

#[test]
fn configured_identity_names_default_target() {
    let fixture = Fixture::with_clustering("tool: builtin\n  identity: 0.95");
    let report = run(&fixture.options(&["bold_clustered.fasta"])).unwrap();
    assert!(report.success);
    assert_eq!(
        ids(&fixture.workdir.join("bold_clustered.fasta")),
        vec!["r1", "r3"]
    );
}

#[test]
fn reference_files_carry_lineages() {
    let fixture = Fixture::new();
    let report = run(&fixture.options(&[
        "bold_clustered.assignTaxonomy.fasta",
        "bold_clustered.addSpecies.fasta",
    ]))
    .unwrap();
    assert!(report.success);

    let assign = fasta::read(&fixture.workdir.join("bold_clustered.assignTaxonomy.fasta")).unwrap();
    let headers: Vec<&str> = assign.iter().map(|record| record.header.as_str()).collect();
    assert_eq!(
        headers,
        vec![
            "Animalia;Arthropoda;Insecta;Diptera;Culicidae;Aedes;",
            "Animalia;Arthropoda;Insecta;Diptera;Culicidae;Aedes;",
            "Animalia;Chordata;Actinopteri;Cypriniformes;Cyprinidae;Danio;",
        ]
    );
    assert_eq!(assign[0].sequence, base_sequence());

    let species = fasta::read(&fixture.workdir.join("bold_clustered.addSpecies.fasta")).unwrap();
    let headers: Vec<&str> = species.iter().map(|record| record.header.as_str()).collect();
    assert_eq!(
        headers,
        vec!["r1 Aedes aegypti", "r2 Aedes albopictus", "r3 Danio rerio"]
    );
}

#[test]
fn dryrun_leaves_workdir_untouched() {
    let fixture = Fixture::new();
    let mut options = fixture.options(&["bold_clustered.fasta"]);
    options.dryrun = true;

    let report = run(&options).unwrap();
    assert!(report.dryrun);
    assert!(report.success);
    let planned: Vec<&str> = report.planned.iter().map(|task| task.id.as_str()).collect();
    assert_eq!(planned.len(), 5);
    assert_eq!(planned.last(), Some(&"cluster"));
    assert!(
        report
            .planned
            .iter()
            .all(|task| task.reason.is_some())
    );
    assert!(!fixture.workdir.exists());
}

fn snapshot(dir: &Utf8Path) -> BTreeMap<String, (SystemTime, Vec<u8>)> {
    let mut files = BTreeMap::new();
    for entry in fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let metadata = entry.metadata().unwrap();
        if metadata.is_file() {
            files.insert(
                entry.file_name().to_string_lossy().into_owned(),
                (metadata.modified().unwrap(), fs::read(entry.path()).unwrap()),
            );
        }
    }
    files
}

#[test]
fn dryrun_leaves_stale_outputs_untouched() {
    let fixture = Fixture::new();
    let mut options = fixture.options(&["bold_clustered.fasta"]);
    assert!(run(&options).unwrap().success);

    let later = SystemTime::now() + Duration::from_secs(120);
    File::options()
        .append(true)
        .open(fixture.workdir.join("bold_info.tsv"))
        .unwrap()
        .set_modified(later)
        .unwrap();
    let before = snapshot(&fixture.workdir);

    options.dryrun = true;
    let report = run(&options).unwrap();
    let planned: Vec<&str> = report.planned.iter().map(|task| task.id.as_str()).collect();
    assert_eq!(planned, vec!["filter", "cluster"]);
    assert_eq!(report.planned[0].reason, Some(StaleReason::NewerInput));

    assert_eq!(snapshot(&fixture.workdir), before);
    assert!(!WorkdirLock::lock_path(&fixture.workdir).exists());
}

#[test]
fn dryrun_after_build_plans_nothing() {
    let fixture = Fixture::new();
    let mut options = fixture.options(&["bold_filtered.fasta"]);
    assert!(run(&options).unwrap().success);

    options.dryrun = true;
    let report = run(&options).unwrap();
    assert!(report.planned.is_empty());
    assert!(!WorkdirLock::is_held(&fixture.workdir));
}

#[test]
fn force_reruns_requested_target_only() {
    let fixture = Fixture::new();
    let mut options = fixture.options(&["bold_filtered.fasta"]);
    assert!(run(&options).unwrap().success);

    options.force = true;
    let report = run(&options).unwrap();
    assert!(report.success);
    assert_eq!(report.planned.len(), 1);
    assert_eq!(report.planned[0].id, "filter");
    assert_eq!(report.planned[0].reason, Some(StaleReason::Forced));
    assert_eq!(state_of(&report, "filter"), TaskState::Done);
    assert_eq!(state_of(&report, "download:bold.zip"), TaskState::Satisfied);
}

#[test]
fn newer_input_invalidates_downstream() {
    let fixture = Fixture::new();
    let options = fixture.options(&["bold_filtered.fasta"]);
    assert!(run(&options).unwrap().success);

    let info = fixture.workdir.join("bold_info.tsv");
    let later = fs::metadata(fixture.workdir.join("bold_filtered.fasta"))
        .unwrap()
        .modified()
        .unwrap()
        + Duration::from_secs(60);
    File::options()
        .append(true)
        .open(&info)
        .unwrap()
        .set_modified(later)
        .unwrap();

    let report = run(&options).unwrap();
    assert_eq!(report.planned.len(), 1);
    assert_eq!(report.planned[0].reason, Some(StaleReason::NewerInput));
}

#[test]
fn held_lock_blocks_until_unlocked() {
    let fixture = Fixture::new();
    fs::create_dir_all(&fixture.workdir).unwrap();
    let stale = WorkdirLock::acquire(&fixture.workdir, &[]).unwrap();
    std::mem::forget(stale);

    let options = fixture.options(&["bold_filtered.fasta"]);
    assert_matches!(run(&options), Err(CoidbError::LockHeld { .. }));
    assert!(!fixture.workdir.join("bold.zip").exists());

    let unlock = RunOptions {
        unlock: true,
        ..options.clone()
    };
    let report = run(&unlock).unwrap();
    assert!(report.unlocked);
    assert!(report.tasks.is_empty());
    assert!(!WorkdirLock::is_held(&fixture.workdir));
    assert!(!fixture.workdir.join("bold.zip").exists());

    assert!(run(&options).unwrap().success);
}

#[test]
fn report_survives_a_lock_that_cannot_be_released() {
    let fixture = Fixture::new();
    let fetcher = LockStealingFetcher {
        workdir: fixture.workdir.clone(),
    };
    let pipeline = Pipeline::new(Registry::standard(), fetcher);

    let report = pipeline
        .run(&fixture.options(&["bold_filtered.fasta"]), &NoopSink)
        .unwrap();
    assert!(report.success);
    assert_eq!(state_of(&report, "filter"), TaskState::Done);
    assert!(fixture.workdir.join("bold_filtered.fasta").exists());
}

#[test]
fn unknown_target_is_rejected_before_any_work() {
    let fixture = Fixture::new();
    let options = fixture.options(&["bold_filtered.fasta", "bold_clustered.txt"]);
    assert_matches!(
        run(&options),
        Err(CoidbError::UnknownTarget(name)) if name == "bold_clustered.txt"
    );
    assert!(!fixture.workdir.exists());
}

#[test]
fn zero_cores_is_a_config_error() {
    let fixture = Fixture::new();
    let mut options = fixture.options(&["bold_filtered.fasta"]);
    options.cores = 0;
    assert_matches!(run(&options), Err(CoidbError::InvalidConfig(_)));
}

#[test]
fn failing_cluster_tool_cancels_formatting() {
    let fixture = Fixture::with_clustering("tool: vsearch\n  executable: \"false\"");
    let options = fixture.options(&["bold_clustered.assignTaxonomy.fasta", "bold_filtered.fasta"]);

    let report = run(&options).unwrap();
    assert!(!report.success);
    assert_eq!(state_of(&report, "filter"), TaskState::Done);
    assert_eq!(state_of(&report, "cluster"), TaskState::Failed);
    assert_eq!(state_of(&report, "format"), TaskState::Failed);

    let format = report.tasks.iter().find(|task| task.id == "format").unwrap();
    assert_eq!(
        format.error.as_deref(),
        Some("not run: prerequisite task cluster failed")
    );
    assert!(!fixture.workdir.join("bold_clustered.fasta").exists());
    assert!(!WorkdirLock::is_held(&fixture.workdir));
}

#[test]
fn missing_cluster_tool_is_reported() {
    let fixture = Fixture::with_clustering("tool: vsearch\n  executable: coidb-no-such-tool");
    let report = run(&fixture.options(&["bold_clustered.fasta"])).unwrap();
    assert!(!report.success);
    let cluster = report.tasks.iter().find(|task| task.id == "cluster").unwrap();
    assert!(cluster.error.as_deref().unwrap().contains("coidb-no-such-tool"));
}

#[test]
fn report_serializes_to_json() {
    let fixture = Fixture::new();
    let mut options = fixture.options(&["bold_filtered.fasta"]);
    options.dryrun = true;
    let report = run(&options).unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["dryrun"], true);
    assert_eq!(json["planned"][0]["reason"], "missing_output");
    assert_eq!(json["tasks"][0]["state"], "stale");
}
