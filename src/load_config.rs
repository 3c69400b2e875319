use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing::{error, info};

use crate::config::PipelineConfig;

/// Loads the static YAML pipeline config (no secrets). Secrets stay in the
/// environment and are picked up by the API clients at construction time.
///
/// A missing file is not an error: every section has working defaults so a
/// fresh checkout can run `validate`/`group` without any setup.
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<PipelineConfig> {
    let Some(path) = path else {
        info!("No config file given, using built-in defaults");
        return Ok(PipelineConfig::default());
    };
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    let config: PipelineConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => conf,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    config.trace_loaded();
    Ok(config)
}
