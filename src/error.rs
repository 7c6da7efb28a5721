use camino::Utf8PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CoidbError {
    #[error("unknown target: {0}")]
    #[diagnostic(help("run `coidb --list-targets` to see the available targets"))]
    UnknownTarget(String),

    #[error("invalid target name: {0}")]
    InvalidTarget(String),

    #[error("cyclic dependency between targets: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("working directory is locked by another run: {path}")]
    #[diagnostic(help("if no other coidb run is active, clear the stale lock with --unlock"))]
    LockHeld { path: Utf8PathBuf },

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse config {source_name}: {message}")]
    ConfigParse { source_name: String, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("download of {url} failed: {message}")]
    Fetch { url: String, message: String },

    #[error("download of {url} returned status {status}")]
    FetchStatus { url: String, status: u16 },

    #[error("failed to extract {archive}: {message}")]
    Extract { archive: Utf8PathBuf, message: String },

    #[error("clustering tool exited with {status}: {stderr}")]
    ClusterTool { status: String, stderr: String },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("malformed record in {path}: {message}")]
    Format { path: Utf8PathBuf, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    #[error("not run: prerequisite task {0} failed")]
    Upstream(String),
}
