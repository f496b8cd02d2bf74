use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Deserialize)]
pub struct Config {
    // Xline/etcd endpoints backing the registry
    pub xline_config: XlineConfig,
    // number of concurrent reconciliations
    #[serde(default = "default_workers")]
    pub workers: usize,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Deserialize)]
pub struct XlineConfig {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_workers() -> usize {
    4
}

pub fn load_config(path: &str) -> anyhow::Result<&'static Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    let cfg = CONFIG.get_or_init(|| cfg);
    Ok(cfg)
}
