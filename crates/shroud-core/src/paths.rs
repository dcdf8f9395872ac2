use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "shroud";
pub const APP_NAME: &str = "shroud";

/// Overrides every well-known directory with a single base (portable installs, tests).
pub const HOME_ENV: &str = "SHROUD_HOME";

fn home_override() -> Option<PathBuf> {
    std::env::var_os(HOME_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn project_dirs() -> anyhow::Result<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))
}

pub fn config_dir() -> anyhow::Result<PathBuf> {
    if let Some(home) = home_override() {
        return Ok(home);
    }
    Ok(project_dirs()?.config_dir().to_path_buf())
}

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Some(home) = home_override() {
        return Ok(home);
    }
    Ok(project_dirs()?.data_dir().to_path_buf())
}

pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

pub fn key_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("keys"))
}

pub fn log_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("logs"))
}
