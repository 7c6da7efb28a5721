use std::fmt;
use std::str::FromStr;

use camino::{Utf8Component, Utf8Path};
use serde::{Deserialize, Serialize};

use crate::error::CoidbError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    pub(crate) fn from_str_unchecked(value: &str) -> Self {
        Self(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Utf8Path {
        Utf8Path::new(&self.0)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Target {
    type Err = CoidbError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if normalized.is_empty() {
            return Err(CoidbError::InvalidTarget(value.to_string()));
        }
        let escapes_workdir = Utf8Path::new(normalized)
            .components()
            .any(|part| !matches!(part, Utf8Component::Normal(_) | Utf8Component::CurDir));
        if escapes_workdir {
            return Err(CoidbError::InvalidTarget(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

/// Fraction of identity two sequences must share to fall into one cluster.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Identity(f64);

impl Identity {
    pub const EXACT: Identity = Identity(1.0);

    pub fn new(fraction: f64) -> Result<Self, CoidbError> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(CoidbError::InvalidConfig(format!(
                "identity threshold must be in (0, 1], got {fraction}"
            )));
        }
        Ok(Self(fraction))
    }

    pub fn from_percent(percent: u32) -> Result<Self, CoidbError> {
        Self::new(f64::from(percent) / 100.0)
    }

    pub fn fraction(&self) -> f64 {
        self.0
    }

    pub fn percent(&self) -> u32 {
        (self.0 * 100.0).round() as u32
    }
}

impl TryFrom<f64> for Identity {
    type Error = CoidbError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for f64 {
    fn from(value: Identity) -> Self {
        value.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Stale,
    Satisfied,
    Running,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_complete(&self) -> bool {
        matches!(self, TaskState::Satisfied | TaskState::Done)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Stale => f.pad("stale"),
            TaskState::Satisfied => f.pad("satisfied"),
            TaskState::Running => f.pad("running"),
            TaskState::Done => f.pad("done"),
            TaskState::Failed => f.pad("failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_target_valid() {
        let target: Target = " bold_clustered.fasta ".parse().unwrap();
        assert_eq!(target.as_str(), "bold_clustered.fasta");
    }

    #[test]
    fn parse_target_rejects_escapes() {
        assert_matches!(
            "../bold.zip".parse::<Target>(),
            Err(CoidbError::InvalidTarget(_))
        );
        assert_matches!(
            "/tmp/bold.zip".parse::<Target>(),
            Err(CoidbError::InvalidTarget(_))
        );
        assert_matches!("  ".parse::<Target>(), Err(CoidbError::InvalidTarget(_)));
    }

    #[test]
    fn identity_bounds() {
        assert_eq!(Identity::from_percent(95).unwrap().percent(), 95);
        assert!(Identity::new(0.0).is_err());
        assert!(Identity::new(1.01).is_err());
        assert_eq!(Identity::new(1.0).unwrap(), Identity::EXACT);
    }
}
