use crate::error::{EnvelopeError, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "dekwrap";

/// Overrides the settings file location when set.
pub const CONFIG_ENV: &str = "DEKWRAP_CONFIG";

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| EnvelopeError::Settings("cannot determine home directory".into()))
}

pub fn config_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}

pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

pub fn settings_path() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    Ok(config_dir()?.join("settings.json"))
}

pub fn default_token_file() -> Result<PathBuf> {
    Ok(data_dir()?.join("soft-token.dtk"))
}
