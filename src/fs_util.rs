use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::SystemTime;

use camino::Utf8Path;
use tempfile::NamedTempFile;

use crate::error::CoidbError;

pub fn modified(path: &Utf8Path) -> Option<SystemTime> {
    fs::metadata(path.as_std_path())
        .and_then(|meta| meta.modified())
        .ok()
}

pub fn ensure_parent(path: &Utf8Path) -> Result<(), CoidbError> {
    if let Some(parent) = path.parent() {
        if !parent.as_str().is_empty() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| CoidbError::Filesystem(err.to_string()))?;
        }
    }
    Ok(())
}

/// Creates a temporary file next to `dest`, so a later `persist` is a same-device rename.
pub fn staging_file(dest: &Utf8Path) -> Result<NamedTempFile, CoidbError> {
    ensure_parent(dest)?;
    let parent = dest
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    tempfile::Builder::new()
        .prefix(".coidb-partial")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| CoidbError::Filesystem(err.to_string()))
}

pub fn persist(temp: NamedTempFile, dest: &Utf8Path) -> Result<(), CoidbError> {
    temp.persist(dest.as_std_path())
        .map_err(|err| CoidbError::Filesystem(format!("persist {dest}: {}", err.error)))?;
    Ok(())
}

/// Writes `dest` through a staging file; `dest` only appears once `write` succeeded.
pub fn write_atomic<F>(dest: &Utf8Path, write: F) -> Result<(), CoidbError>
where
    F: FnOnce(&mut dyn Write) -> Result<(), CoidbError>,
{
    let mut temp = staging_file(dest)?;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        write(&mut writer)?;
        writer
            .flush()
            .map_err(|err| CoidbError::Filesystem(err.to_string()))?;
    }
    persist(temp, dest)
}

pub fn io_error(path: &Utf8Path) -> impl Fn(io::Error) -> CoidbError + '_ {
    move |err| CoidbError::Filesystem(format!("{path}: {err}"))
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    if name.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(name);
        return path.exists().then_some(path);
    }
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
