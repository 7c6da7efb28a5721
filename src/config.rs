use std::collections::BTreeMap;
use std::fmt;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::Identity;
use crate::error::CoidbError;

const DEFAULT_CONFIG: &str = include_str!("config.yaml");

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub database: DatabaseConfig,
    pub clustering: ClusteringConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub gene: Vec<String>,
    #[serde(default)]
    pub phyla: Vec<String>,
    #[serde(flatten)]
    pub sources: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClusteringConfig {
    pub identity: Identity,
    pub tool: ClusterTool,
    pub executable: String,
    pub threads: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterTool {
    Vsearch,
    Builtin,
}

impl fmt::Display for ClusterTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterTool::Vsearch => write!(f, "vsearch"),
            ClusterTool::Builtin => write!(f, "builtin"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverride {
    #[serde(default)]
    pub database: Option<DatabaseOverride>,
    #[serde(default)]
    pub clustering: Option<ClusteringOverride>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DatabaseOverride {
    #[serde(default)]
    pub gene: Option<Vec<String>>,
    #[serde(default)]
    pub phyla: Option<Vec<String>>,
    #[serde(flatten)]
    pub sources: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusteringOverride {
    #[serde(default)]
    pub identity: Option<f64>,
    #[serde(default)]
    pub tool: Option<ClusterTool>,
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub threads: Option<usize>,
}

impl Config {
    pub fn source_url(&self, archive: &str) -> Result<&str, CoidbError> {
        self.database
            .sources
            .get(archive)
            .map(String::as_str)
            .ok_or_else(|| {
                CoidbError::InvalidConfig(format!("no source URL configured for {archive}"))
            })
    }

    /// Applies `overrides` on top of `self`. Nested maps merge per key; lists and
    /// scalars replace the previous value.
    pub fn merge(&mut self, overrides: ConfigOverride) -> Result<(), CoidbError> {
        if let Some(database) = overrides.database {
            if let Some(gene) = database.gene {
                self.database.gene = gene;
            }
            if let Some(phyla) = database.phyla {
                self.database.phyla = phyla;
            }
            self.database.sources.extend(database.sources);
        }
        if let Some(clustering) = overrides.clustering {
            if let Some(identity) = clustering.identity {
                self.clustering.identity = Identity::new(identity)?;
            }
            if let Some(tool) = clustering.tool {
                self.clustering.tool = tool;
            }
            if let Some(executable) = clustering.executable {
                self.clustering.executable = executable;
            }
            if let Some(threads) = clustering.threads {
                self.clustering.threads = threads;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CoidbError> {
        if self.clustering.threads == 0 {
            return Err(CoidbError::InvalidConfig(
                "clustering.threads must be at least 1".to_string(),
            ));
        }
        if self.clustering.executable.trim().is_empty() {
            return Err(CoidbError::InvalidConfig(
                "clustering.executable must not be empty".to_string(),
            ));
        }
        if let Some((name, _)) = self
            .database
            .sources
            .iter()
            .find(|(_, url)| url.trim().is_empty())
        {
            return Err(CoidbError::InvalidConfig(format!(
                "database.{name} has an empty source URL"
            )));
        }
        Ok(())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn defaults() -> Result<Config, CoidbError> {
        serde_yaml::from_str(DEFAULT_CONFIG).map_err(|err| CoidbError::ConfigParse {
            source_name: "built-in defaults".to_string(),
            message: err.to_string(),
        })
    }

    /// Loads the defaults and merges each override file in order; later files win.
    pub fn load(files: &[Utf8PathBuf]) -> Result<Config, CoidbError> {
        let mut config = Self::defaults()?;
        for path in files {
            debug!(%path, "merging config override");
            config.merge(Self::read_override(path)?)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn read_override(path: &Utf8Path) -> Result<ConfigOverride, CoidbError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| CoidbError::ConfigRead(path.to_path_buf()))?;
        Self::parse_override(&content, path.as_str())
    }

    pub fn parse_override(content: &str, source_name: &str) -> Result<ConfigOverride, CoidbError> {
        if content.trim().is_empty() {
            return Ok(ConfigOverride::default());
        }
        serde_yaml::from_str(content).map_err(|err| CoidbError::ConfigParse {
            source_name: source_name.to_string(),
            message: err.to_string(),
        })
    }
}

/// Settings for the external clustering executor, carried through untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorSettings(serde_yaml::Value);

impl ExecutorSettings {
    pub fn load(path: &Utf8Path) -> Result<Self, CoidbError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| CoidbError::ConfigRead(path.to_path_buf()))?;
        let value = serde_yaml::from_str(&content).map_err(|err| CoidbError::ConfigParse {
            source_name: path.to_string(),
            message: err.to_string(),
        })?;
        Ok(Self(value))
    }

    pub fn value(&self) -> &serde_yaml::Value {
        &self.0
    }

    pub fn extra_args(&self) -> Vec<String> {
        self.0
            .get("args")
            .and_then(|args| args.as_sequence())
            .map(|args| {
                args.iter()
                    .filter_map(|arg| match arg {
                        serde_yaml::Value::String(value) => Some(value.clone()),
                        serde_yaml::Value::Number(value) => Some(value.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
