//! Connection info and configuration file helpers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Parsed connection info for one database
///
/// Parsed from a `key=value;` string with case-insensitive keys. The `name`
/// component is required; `data source` defaults to in-memory when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub data_source: String,
    pub name: String,
}

pub const IN_MEMORY_SOURCE: &str = ":memory:";

impl ConnectionInfo {
    /// Parse a connection string such as
    /// `data source=/var/data;name=MyDb`
    pub fn parse(connection_string: &str) -> Result<Self> {
        let mut data_source = None;
        let mut name = None;

        for pair in connection_string.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let Some((key, value)) = pair.split_once('=') else {
                return Err(Error::Configuration(format!(
                    "malformed connection string segment '{}'",
                    pair
                )));
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "data source" => data_source = Some(value.trim().to_string()),
                "name" => name = Some(value.trim().to_string()),
                // Unknown keys are tolerated so callers can carry
                // provider-specific settings through.
                _ => {}
            }
        }

        let name = name.filter(|n| !n.is_empty()).ok_or_else(|| {
            Error::Configuration("connection info is missing the required name component".into())
        })?;

        Ok(Self {
            data_source: data_source.unwrap_or_else(|| IN_MEMORY_SOURCE.to_string()),
            name,
        })
    }

    /// In-memory database, mainly for tests
    pub fn in_memory(name: &str) -> Self {
        Self {
            data_source: IN_MEMORY_SOURCE.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.data_source == IN_MEMORY_SOURCE
    }

    /// Path of the backing database file; `None` for in-memory databases
    pub fn database_path(&self) -> Option<PathBuf> {
        if self.is_in_memory() {
            return None;
        }
        let source = Path::new(&self.data_source);
        if source.extension().is_some() {
            Some(source.to_path_buf())
        } else {
            Some(source.join(format!("{}.db", self.name)))
        }
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Data Source={};Name={}", self.data_source, self.name)
    }
}

/// On-disk database configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StructdbConfig {
    pub connection: Option<String>,
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("structdb.toml")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<StructdbConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: StructdbConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &StructdbConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normal_connection_string() {
        let info = ConnectionInfo::parse("data source=/var/data;name=StructdbTests.Temp").unwrap();

        assert_eq!(info.name, "StructdbTests.Temp");
        assert_eq!(info.data_source, "/var/data");
        assert_eq!(
            info.to_string(),
            "Data Source=/var/data;Name=StructdbTests.Temp"
        );
        assert_eq!(
            info.database_path().unwrap(),
            PathBuf::from("/var/data/StructdbTests.Temp.db")
        );
    }

    #[test]
    fn test_keys_are_case_insensitive_and_trailing_semicolon_tolerated() {
        let info = ConnectionInfo::parse("Data Source=.;Name=Db;").unwrap();
        assert_eq!(info.name, "Db");
    }

    #[test]
    fn test_missing_name_is_configuration_error() {
        let err = ConnectionInfo::parse("data source=.").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_malformed_segment_is_configuration_error() {
        let err = ConnectionInfo::parse("data source").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_in_memory_has_no_database_path() {
        let info = ConnectionInfo::in_memory("Db");
        assert!(info.database_path().is_none());
        assert!(info.is_in_memory());
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("structdb.toml");

        let config = StructdbConfig {
            connection: Some("data source=.;name=Db".to_string()),
        };
        write_config(&path, &config, false).unwrap();
        let loaded = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.connection, config.connection);

        assert!(write_config(&path, &config, false).is_err());
        write_config(&path, &config, true).unwrap();
    }
}
