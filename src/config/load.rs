use std::fs;
use std::path::{Path, PathBuf};

use super::merge::{apply_env_overrides, merge_layers};
use super::{Config, ConfigError, ConfigLayer};

pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("config.toml")
}

/// Per-directory override file, read from the working directory.
pub fn local_config_path(dir: &Path) -> PathBuf {
    dir.join("ingest-loop.toml")
}

pub fn load_user_config() -> Result<Option<ConfigLayer>, ConfigError> {
    read_layer(&config_path())
}

pub fn load_local_config(dir: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    read_layer(&local_config_path(dir))
}

fn read_layer(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&contents)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

pub fn load() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().ok();
    load_for_dir(cwd.as_deref())
}

pub fn load_for_dir(local_dir: Option<&Path>) -> Result<Config, ConfigError> {
    let user = load_user_config()?;
    let local = match local_dir {
        Some(dir) => load_local_config(dir)?,
        None => None,
    };
    let mut config = merge_layers(user, local);
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load the layered config, writing a default user config on first use.
///
/// Load failures are logged and fall back to defaults plus env overrides.
pub fn load_or_init() -> Config {
    let path = config_path();
    let had_user_config = path.exists();

    let config = match load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("config load failed, using defaults: {e}");
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            cfg
        }
    };

    if !had_user_config && let Err(e) = write_config(&path, &Config::default()) {
        tracing::warn!("failed to write default config: {e}");
    }

    config
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    let contents = toml::to_string_pretty(cfg)?;
    crate::daemon::record::write_atomic(path, contents.as_bytes()).map_err(|source| {
        ConfigError::Write {
            path: path.to_path_buf(),
            source,
        }
    })
}
