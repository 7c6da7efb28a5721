use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::error::CoidbError;
use crate::fasta;
use crate::fs_util::{io_error, write_atomic};

#[derive(Debug, Clone, PartialEq)]
pub struct FilterJob {
    pub info: Utf8PathBuf,
    pub sequences: Utf8PathBuf,
    pub table: Utf8PathBuf,
    pub fasta: Utf8PathBuf,
    pub genes: Vec<String>,
    pub phyla: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FilterSummary {
    pub total: usize,
    pub kept: usize,
}

/// Header row of a tab-separated table.
pub(crate) struct Header {
    columns: Vec<String>,
}

impl Header {
    pub(crate) fn parse(line: &str) -> Self {
        Self {
            columns: line.split('\t').map(|name| name.trim().to_string()).collect(),
        }
    }

    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub(crate) fn require(&self, name: &str, path: &Utf8Path) -> Result<usize, CoidbError> {
        self.position(name).ok_or_else(|| CoidbError::Format {
            path: path.to_path_buf(),
            message: format!("missing column {name}"),
        })
    }
}

pub(crate) fn field<'a>(fields: &[&'a str], index: usize) -> &'a str {
    fields.get(index).map(|value| value.trim()).unwrap_or_default()
}

pub(crate) fn read_lines(path: &Utf8Path) -> Result<impl Iterator<Item = Result<String, CoidbError>> + '_, CoidbError> {
    let file = File::open(path.as_std_path()).map_err(io_error(path))?;
    Ok(BufReader::new(file)
        .lines()
        .map(move |line| line.map_err(io_error(path))))
}

pub fn run(job: &FilterJob) -> Result<FilterSummary, CoidbError> {
    let sequences = read_sequences(&job.sequences)?;

    let mut lines = read_lines(&job.info)?;
    let header_line = lines.next().transpose()?.ok_or_else(|| CoidbError::Format {
        path: job.info.clone(),
        message: "empty record table".to_string(),
    })?;
    let header = Header::parse(&header_line);
    let id_column = header.require("id", &job.info)?;
    let gene_column = header.require("gene", &job.info)?;
    let phylum_column = header.require("phylum", &job.info)?;

    let genes: HashSet<&str> = job.genes.iter().map(String::as_str).collect();
    let phyla: HashSet<&str> = job.phyla.iter().map(String::as_str).collect();

    let mut total = 0usize;
    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    let mut records = Vec::new();
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        total += 1;
        let fields: Vec<&str> = line.split('\t').collect();
        let id = field(&fields, id_column);
        let gene = field(&fields, gene_column);
        let phylum = field(&fields, phylum_column);
        if !genes.is_empty() && !genes.contains(gene) {
            continue;
        }
        if !phyla.is_empty() && !phyla.contains(phylum) {
            continue;
        }
        let Some(sequence) = sequences.get(id) else {
            continue;
        };
        if !seen.insert(id.to_string()) {
            continue;
        }
        records.push(fasta::FastaRecord::new(id, sequence.as_str()));
        rows.push(line);
    }

    write_atomic(&job.table, |writer| {
        writeln!(writer, "{header_line}").map_err(io_error(&job.table))?;
        for row in &rows {
            writeln!(writer, "{row}").map_err(io_error(&job.table))?;
        }
        Ok(())
    })?;
    write_atomic(&job.fasta, |writer| {
        fasta::write(writer, &records).map_err(io_error(&job.fasta))
    })?;

    Ok(FilterSummary {
        total,
        kept: records.len(),
    })
}

/// Reads `id<TAB>sequence` rows; the first occurrence of an id wins.
fn read_sequences(path: &Utf8Path) -> Result<HashMap<String, String>, CoidbError> {
    let mut sequences = HashMap::new();
    for (number, line) in read_lines(path)?.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let (id, raw) = line.split_once('\t').ok_or_else(|| CoidbError::Format {
            path: path.to_path_buf(),
            message: format!("line {} is not id<TAB>sequence", number + 1),
        })?;
        let id = id.trim();
        if number == 0 && id.eq_ignore_ascii_case("id") {
            continue;
        }
        let sequence = clean_sequence(raw);
        if sequence.is_empty() {
            continue;
        }
        sequences.entry(id.to_string()).or_insert(sequence);
    }
    Ok(sequences)
}

fn clean_sequence(raw: &str) -> String {
    raw.chars()
        .filter(|ch| !ch.is_whitespace() && *ch != '-' && *ch != '.')
        .map(|ch| ch.to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_sequence_strips_gaps() {
        assert_eq!(clean_sequence("ac-gt..n n"), "ACGTNN");
    }
}
