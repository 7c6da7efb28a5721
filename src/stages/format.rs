use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use super::filter::{Header, field, read_lines};
use crate::error::CoidbError;
use crate::fasta;
use crate::fs_util::{io_error, write_atomic};

const UNRESOLVED: &str = "NA";
const RANKS: [&str; 7] = [
    "kingdom", "phylum", "class", "order", "family", "genus", "species",
];

#[derive(Debug, Clone, PartialEq)]
pub struct FormatJob {
    pub clustered: Utf8PathBuf,
    pub info: Utf8PathBuf,
    pub taxonomy: Utf8PathBuf,
    pub assign_taxonomy: Utf8PathBuf,
    pub add_species: Utf8PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FormatSummary {
    pub assign_taxonomy: usize,
    pub add_species: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Lineage {
    ranks: [Option<String>; 7],
}

impl Lineage {
    fn rank(&self, position: usize) -> Option<&str> {
        self.ranks[position].as_deref()
    }
}

/// Writes the DADA2 `assignTaxonomy` and `addSpecies` reference files for the
/// cluster representatives.
pub fn run(job: &FormatJob) -> Result<FormatSummary, CoidbError> {
    let lineages = read_lineages(&job.info)?;
    let kingdoms = read_backbone_kingdoms(&job.taxonomy)?;
    let representatives = fasta::read(&job.clustered)?;
    let unknown = Lineage::default();

    let mut assign = Vec::with_capacity(representatives.len());
    let mut species = Vec::new();
    for record in &representatives {
        let lineage = lineages.get(&record.id).unwrap_or(&unknown);
        let phylum = lineage.rank(1);
        let kingdom = lineage
            .rank(0)
            .or_else(|| phylum.and_then(|phylum| kingdoms.get(phylum).map(String::as_str)));

        let mut header = String::new();
        header.push_str(kingdom.unwrap_or(UNRESOLVED));
        header.push(';');
        for position in 1..6 {
            header.push_str(lineage.rank(position).unwrap_or(UNRESOLVED));
            header.push(';');
        }
        assign.push((header, record.sequence.as_str()));

        if let (Some(genus), Some(name)) = (lineage.rank(5), lineage.rank(6)) {
            let binomial = if name.contains(' ') {
                name.to_string()
            } else {
                format!("{genus} {name}")
            };
            species.push((format!("{} {binomial}", record.id), record.sequence.as_str()));
        }
    }

    write_reference(&job.assign_taxonomy, &assign)?;
    write_reference(&job.add_species, &species)?;
    Ok(FormatSummary {
        assign_taxonomy: assign.len(),
        add_species: species.len(),
    })
}

fn write_reference(path: &Utf8Path, entries: &[(String, &str)]) -> Result<(), CoidbError> {
    write_atomic(path, |writer| {
        for (header, sequence) in entries {
            fasta::write_record(writer, header, sequence).map_err(io_error(path))?;
        }
        Ok(())
    })
}

fn read_lineages(path: &Utf8Path) -> Result<HashMap<String, Lineage>, CoidbError> {
    let mut lines = read_lines(path)?;
    let Some(header) = lines.next().transpose()? else {
        return Ok(HashMap::new());
    };
    let header = Header::parse(&header);
    let id_column = header.require("id", path)?;
    let columns = RANKS.map(|rank| header.position(rank));

    let mut lineages = HashMap::new();
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let ranks = columns.map(|column| {
            column
                .map(|index| sanitize(field(&fields, index)))
                .filter(|value| !value.is_empty())
        });
        lineages
            .entry(field(&fields, id_column).to_string())
            .or_insert(Lineage { ranks });
    }
    Ok(lineages)
}

/// Maps accepted phylum names in the GBIF backbone to their kingdom.
fn read_backbone_kingdoms(path: &Utf8Path) -> Result<HashMap<String, String>, CoidbError> {
    let mut lines = read_lines(path)?;
    let Some(header) = lines.next().transpose()? else {
        return Ok(HashMap::new());
    };
    let header = Header::parse(&header);
    let rank_column = header.require("taxonRank", path)?;
    let status_column = header.require("taxonomicStatus", path)?;
    let kingdom_column = header.require("kingdom", path)?;
    let phylum_column = header.require("phylum", path)?;

    let mut kingdoms = HashMap::new();
    for line in lines {
        let line = line?;
        let fields: Vec<&str> = line.split('\t').collect();
        if !field(&fields, rank_column).eq_ignore_ascii_case("phylum")
            || !field(&fields, status_column).eq_ignore_ascii_case("accepted")
        {
            continue;
        }
        let phylum = field(&fields, phylum_column);
        let kingdom = field(&fields, kingdom_column);
        if !phylum.is_empty() && !kingdom.is_empty() {
            kingdoms
                .entry(phylum.to_string())
                .or_insert_with(|| kingdom.to_string());
        }
    }
    Ok(kingdoms)
}

fn sanitize(value: &str) -> String {
    value.trim().replace(';', ",")
}
