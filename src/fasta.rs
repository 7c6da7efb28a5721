use std::fs::File;
use std::io::{BufRead, BufReader, Write};

use camino::Utf8Path;

use crate::error::CoidbError;
use crate::fs_util::io_error;

const LINE_WIDTH: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastaRecord {
    pub id: String,
    pub header: String,
    pub sequence: String,
}

impl FastaRecord {
    pub fn new(id: impl Into<String>, sequence: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            header: id.clone(),
            id,
            sequence: sequence.into(),
        }
    }
}

pub fn read(path: &Utf8Path) -> Result<Vec<FastaRecord>, CoidbError> {
    let file = File::open(path.as_std_path()).map_err(io_error(path))?;
    parse(BufReader::new(file), path)
}

pub fn parse<R: BufRead>(reader: R, path: &Utf8Path) -> Result<Vec<FastaRecord>, CoidbError> {
    let mut records: Vec<FastaRecord> = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(io_error(path))?;
        let line = line.trim_end();
        if let Some(header) = line.strip_prefix('>') {
            let header = header.trim().to_string();
            let id = header
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string();
            records.push(FastaRecord {
                id,
                header,
                sequence: String::new(),
            });
        } else if !line.is_empty() {
            let record = records.last_mut().ok_or_else(|| CoidbError::Format {
                path: path.to_path_buf(),
                message: "sequence data before the first header".to_string(),
            })?;
            record.sequence.push_str(line.trim());
        }
    }
    Ok(records)
}

pub fn write_record(writer: &mut dyn Write, header: &str, sequence: &str) -> std::io::Result<()> {
    writeln!(writer, ">{header}")?;
    for chunk in sequence.as_bytes().chunks(LINE_WIDTH) {
        writer.write_all(chunk)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

pub fn write<'a, I>(writer: &mut dyn Write, records: I) -> std::io::Result<()>
where
    I: IntoIterator<Item = &'a FastaRecord>,
{
    for record in records {
        write_record(writer, &record.header, &record.sequence)?;
    }
    Ok(())
}
