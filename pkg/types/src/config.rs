use serde::{Deserialize, Serialize};

/// Controller configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// data-dir: /var/lib/udm/data
/// resync-interval-secs: 10
/// concurrent-reconciles: 4
/// request-timeout-secs: 30
/// max-revision-name-collisions: 100
/// update-retries: 5
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfigFile {
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    /// Keep all state in memory instead of SlateDB.
    #[serde(default, alias = "in-memory")]
    pub in_memory: Option<bool>,
    #[serde(default, alias = "resync-interval-secs")]
    pub resync_interval_secs: Option<u64>,
    #[serde(default, alias = "concurrent-reconciles")]
    pub concurrent_reconciles: Option<usize>,
    #[serde(default, alias = "request-timeout-secs")]
    pub request_timeout_secs: Option<u64>,
    #[serde(default, alias = "max-revision-name-collisions")]
    pub max_revision_name_collisions: Option<u32>,
    #[serde(default, alias = "update-retries")]
    pub update_retries: Option<usize>,
    #[serde(default, alias = "initial-batch-size")]
    pub initial_batch_size: Option<usize>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
