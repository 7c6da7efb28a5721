use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::CoidbError;
use crate::fs_util::write_atomic;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractJob {
    pub members: Vec<ExtractMember>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractMember {
    pub archive: Utf8PathBuf,
    pub member: String,
    pub output: Utf8PathBuf,
}

pub fn run(job: &ExtractJob) -> Result<(), CoidbError> {
    let mut archives: Vec<&Utf8Path> = Vec::new();
    for member in &job.members {
        if !archives.contains(&member.archive.as_path()) {
            archives.push(&member.archive);
        }
    }
    for archive in archives {
        let members: Vec<&ExtractMember> = job
            .members
            .iter()
            .filter(|member| member.archive.as_path() == archive)
            .collect();
        info!(%archive, members = members.len(), "extracting archive");
        extract_archive(archive, &members)?;
    }
    Ok(())
}

fn extract_archive(archive: &Utf8Path, members: &[&ExtractMember]) -> Result<(), CoidbError> {
    let failure = |message: String| CoidbError::Extract {
        archive: archive.to_path_buf(),
        message,
    };
    let mut file = File::open(archive.as_std_path()).map_err(|err| failure(err.to_string()))?;
    let mut magic = [0u8; 2];
    let is_gzip = file.read_exact(&mut magic).is_ok() && magic == GZIP_MAGIC;
    file.seek(SeekFrom::Start(0))
        .map_err(|err| failure(err.to_string()))?;

    if is_gzip {
        let [member] = members else {
            return Err(failure(format!(
                "gzip source holds a single member but {} are expected",
                members.len()
            )));
        };
        let mut decoder = GzDecoder::new(file);
        return write_atomic(&member.output, |writer| {
            io::copy(&mut decoder, writer)
                .map(|_| ())
                .map_err(|err| failure(format!("corrupt gzip stream: {err}")))
        });
    }

    let mut zip = ZipArchive::new(file).map_err(|err| failure(format!("corrupt archive: {err}")))?;
    let mut by_name = Vec::new();
    for index in 0..zip.len() {
        let entry = zip
            .by_index(index)
            .map_err(|err| failure(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry
            .enclosed_name()
            .and_then(|path| path.file_name().map(|name| name.to_string_lossy().to_string()));
        if let Some(name) = name {
            by_name.push((name, index));
        }
    }

    for member in members {
        let Some((_, index)) = by_name.iter().find(|(name, _)| *name == member.member) else {
            return Err(failure(format!("missing expected member {}", member.member)));
        };
        debug!(member = %member.member, output = %member.output, "writing archive member");
        let mut entry = zip
            .by_index(*index)
            .map_err(|err| failure(err.to_string()))?;
        write_atomic(&member.output, |writer| {
            io::copy(&mut entry, writer)
                .map(|_| ())
                .map_err(|err| failure(format!("corrupt member {}: {err}", member.member)))
        })?;
    }
    Ok(())
}
