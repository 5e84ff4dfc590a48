//! Initialize the configuration directory: create ~/.cadence, a default config.json and the data
//! directory used by the file-backed store.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{self, Config};

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with every section at its default if missing. Credentials are left
///   empty; supply them in the file or through the environment.
/// - Creates the `data` subdirectory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let default_config = serde_json::to_string_pretty(&Config::default())
            .context("serializing default config")?;
        std::fs::write(config_path, default_config)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    } else {
        log::debug!("config already exists at {}, skipping", config_path.display());
    }

    let data = config::data_dir(config_path);
    if !data.exists() {
        std::fs::create_dir_all(&data)
            .with_context(|| format!("creating data directory {}", data.display()))?;
        log::info!("created data directory at {}", data.display());
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_config_and_data_and_is_idempotent() {
        let dir = std::env::temp_dir().join(format!("cadence-init-{}", uuid::Uuid::new_v4()));
        let config_path = dir.join("config.json");

        let created = init_config_dir(&config_path).unwrap();
        assert_eq!(created, dir);
        assert!(dir.join("data").is_dir());
        let written: Config =
            serde_json::from_str(&std::fs::read_to_string(&config_path).unwrap()).unwrap();
        assert_eq!(written.server.webhook_path, "/webhook");

        std::fs::write(&config_path, r#"{"server":{"port":9999}}"#).unwrap();
        init_config_dir(&config_path).unwrap();
        let kept = std::fs::read_to_string(&config_path).unwrap();
        assert!(kept.contains("9999"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
