use crate::units::MachineConstants;
use anyhow::Context;
use register_transport::{SerialParams, StationId, Timeout};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Everything needed to talk to one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub station: StationId,
    #[serde(default)]
    pub timeout: Timeout,
    /// Key presented to the device session before the link is validated.
    #[serde(default)]
    pub license_key: String,
    #[serde(default)]
    pub serial: SerialParams,
    #[serde(default)]
    pub machine: MachineConstants,
}

fn default_name() -> String {
    "axis0".to_string()
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            station: StationId::default(),
            timeout: Timeout::Auto,
            license_key: String::new(),
            serial: SerialParams::default(),
            machine: MachineConstants::default(),
        }
    }
}

/// Axis configurations keyed by name.
#[derive(Debug, Default, Clone)]
pub struct StageRegistry {
    pub axes: HashMap<String, StageConfig>,
}

impl StageRegistry {
    pub fn insert(&mut self, cfg: StageConfig) {
        self.axes.insert(cfg.name.clone(), cfg);
    }
}

pub fn load_config_str(raw: &str) -> anyhow::Result<StageConfig> {
    let cfg: StageConfig = serde_yaml::from_str(raw).context("decoding stage config")?;
    Ok(cfg)
}

pub fn load_config_file(path: impl AsRef<Path>) -> anyhow::Result<StageConfig> {
    let path = path.as_ref();
    let raw =
        fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
    let cfg: StageConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("decoding config: {}", path.display()))?;
    Ok(cfg)
}

pub fn load_configs_dir(dir: impl AsRef<Path>) -> anyhow::Result<StageRegistry> {
    let mut reg = StageRegistry::default();
    let mut entries: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        let path = entry.path();
        if let Some(ext) = path.extension() {
            if ext == "yml" || ext == "yaml" {
                entries.push(path);
            }
        }
    }
    entries.sort();
    for p in entries {
        let cfg = load_config_file(&p)?;
        reg.insert(cfg);
    }
    Ok(reg)
}
