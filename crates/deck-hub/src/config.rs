use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("service '{category}': {reason}")]
    Invalid { category: String, reason: String },
}

fn default_processes() -> u32 {
    1
}

/// How one category's workers are launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_processes")]
    pub processes: u32,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[cfg(test)]
impl ServiceSpec {
    pub fn shell(script: &str, processes: u32) -> Self {
        Self {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            processes,
            cwd: None,
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServicesFile {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
}

impl ServicesFile {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (category, spec) in &self.services {
            if category.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    category: category.clone(),
                    reason: "category name is empty".to_string(),
                });
            }
            if spec.command.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    category: category.clone(),
                    reason: "command is empty".to_string(),
                });
            }
            if spec.processes == 0 {
                return Err(ConfigError::Invalid {
                    category: category.clone(),
                    reason: "processes must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }
}

pub fn parse_services(contents: &str, path: &Path) -> Result<ServicesFile, ConfigError> {
    let parsed: ServicesFile = toml::from_str(contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    parsed.validate()?;
    Ok(parsed)
}

/// A missing file means "no services", not an error.
pub fn load_services(path: &Path) -> Result<ServicesFile, ConfigError> {
    if !path.exists() {
        return Ok(ServicesFile::default());
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_services(&contents, path)
}
