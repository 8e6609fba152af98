use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

use crate::{LogFormat, LogLevel};

pub const DEFAULT_CONFIG: &str = "ls-iommu.toml";

#[derive(Clone, Debug, Deserialize, Default, PartialEq)]
pub struct AppConfig {
    pub format: Option<String>,
    pub legacy: Option<bool>,
    pub kernel: Option<bool>,
    pub related: Option<u8>,
    pub ignore: Option<Vec<String>>,
    pub log_level: Option<LogLevel>,
    pub log_format: Option<LogFormat>,
    pub log_path: Option<String>,
    pub iommu_root: Option<PathBuf>,
    pub pci_root: Option<PathBuf>,
    pub devices_root: Option<PathBuf>,
}

/// Reads the config named on the command line, else `LS_IOMMU_CONFIG`, else
/// `ls-iommu.toml` in the working directory. Only an explicitly named file
/// that cannot be read is an error.
pub fn load_config(path_opt: Option<&str>) -> Result<Option<AppConfig>> {
    let explicit = path_opt.map(|s| s.to_string()).or_else(|| std::env::var("LS_IOMMU_CONFIG").ok());
    let p = match explicit {
        Some(p) => PathBuf::from(p),
        None => {
            let def = PathBuf::from(DEFAULT_CONFIG);
            if !def.is_file() { return Ok(None); }
            def
        }
    };
    let data = std::fs::read_to_string(&p).with_context(|| format!("Failed to read config file {}", p.display()))?;
    let cfg: AppConfig = toml::from_str(&data).with_context(|| format!("Failed to parse config file {}", p.display()))?;
    Ok(Some(cfg))
}
