use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult, ConfigError, ProcessError};

use super::types::ConfigFile;

/// Probed in the working directory when no path is given.
const DEFAULT_CONFIG_FILES: [&str; 2] = ["fleetsim.toml", "fleetsim.json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    fn of(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(ConfigFormat::Toml),
            Some("json") => Ok(ConfigFormat::Json),
            Some(_) | None => Err(ConfigError::UnknownFormat {
                path: path.to_path_buf(),
            }),
        }
    }

    fn parse(self, path: &Path, content: &str) -> Result<ConfigFile, ConfigError> {
        match self {
            ConfigFormat::Toml => toml::from_str(content).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            }),
            ConfigFormat::Json => {
                serde_json::from_str(content).map_err(|source| ConfigError::Json {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
}

/// Loads the fleet config from `path`, or from the first default file found
/// in the working directory. `Ok(None)` means no file exists and built-in
/// defaults apply.
///
/// # Errors
///
/// Returns an error when the chosen file cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> AppResult<Option<ConfigFile>> {
    let chosen = match path {
        Some(explicit) => Some(PathBuf::from(explicit)),
        None => DEFAULT_CONFIG_FILES
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.is_file()),
    };
    chosen
        .map(|found| load_config_file(&found))
        .transpose()
}

/// # Errors
///
/// Returns an error when the file cannot be read, its extension is neither
/// `.toml` nor `.json`, or its content does not parse.
pub fn load_config_file(path: &Path) -> AppResult<ConfigFile> {
    let format = ConfigFormat::of(path).map_err(AppError::config)?;
    let content = std::fs::read_to_string(path).map_err(|source| {
        AppError::config(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
    })?;
    format.parse(path, &content).map_err(AppError::config)
}

/// Writes `config` as TOML; the agent hands spawned workers their settings
/// this way.
///
/// # Errors
///
/// Returns an error when the config cannot be rendered or written.
pub fn write_config_file(path: &Path, config: &ConfigFile) -> AppResult<()> {
    let content = toml::to_string(config)
        .map_err(|source| AppError::config(ConfigError::RenderWorkerConfig { source }))?;
    std::fs::write(path, content).map_err(|source| {
        AppError::process(ProcessError::WriteWorkerConfig {
            path: path.to_path_buf(),
            source,
        })
    })
}
