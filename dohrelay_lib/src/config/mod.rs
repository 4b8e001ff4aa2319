pub mod def;
pub mod jail;

use std::fs;

use crate::Error;

pub use def::Config;
pub use jail::NamesInJail;

/// Loads and parses a YAML config file.
pub fn read_config_from_file(path: &str) -> Result<Config, Error> {
    let raw = fs::read_to_string(path)?;
    parse_config(&raw)
}

pub fn parse_config(raw: &str) -> Result<Config, Error> {
    serde_yaml::from_str(raw).map_err(|e| Error::InvalidConfig(e.to_string()))
}
