//! Settings persistence and small helpers for the terminal front end.

use anyhow::{anyhow, Context, Result};
use shared::settings::AppSettings;
use std::path::{Path, PathBuf};

pub const SERVER_URL_ENV: &str = "FOLDER_CHAT_SERVER_URL";
pub const API_KEY_ENV: &str = "FOLDER_CHAT_API_KEY";

/// `<config dir>/folder-chat/settings.json`
pub fn config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("com.local", "Folder Chat", "folder-chat")
        .map(|proj| proj.config_dir().join("settings.json"))
}

/// Load settings from `path`; a missing or unreadable file yields defaults.
/// A saved folder that is not absolute is dropped.
pub fn load_settings_from(path: &Path) -> AppSettings {
    let mut settings = match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            tracing::warn!("ignoring invalid settings file {}: {}", path.display(), e);
            AppSettings::default()
        }),
        Err(_) => AppSettings::default(),
    };
    if let Some(root) = settings.sandbox_root.as_ref().filter(|r| !r.is_absolute()) {
        tracing::warn!("ignoring saved folder {}: not an absolute path", root.display());
        settings.sandbox_root = None;
    }
    settings
}

pub fn load_settings_or_default() -> AppSettings {
    let mut settings = config_path()
        .map(|path| load_settings_from(&path))
        .unwrap_or_default();
    apply_env_overrides(
        &mut settings,
        std::env::var(SERVER_URL_ENV).ok(),
        std::env::var(API_KEY_ENV).ok(),
    );
    settings
}

pub fn apply_env_overrides(
    settings: &mut AppSettings,
    server_url: Option<String>,
    api_key: Option<String>,
) {
    if let Some(url) = server_url.filter(|u| !u.trim().is_empty()) {
        settings.server_url = url;
    }
    if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
        settings.api_key = Some(key);
    }
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub fn save_settings(settings: &AppSettings) {
    if let Some(path) = config_path() {
        if let Err(e) = save_settings_to(&path, settings) {
            tracing::warn!("failed to save settings: {:#}", e);
        }
    }
}

/// Resolve a user-typed folder to an absolute directory.
pub fn resolve_folder(input: &str) -> Result<PathBuf> {
    let trimmed = input.trim();
    let expanded = match trimmed.strip_prefix("~/") {
        Some(rest) => directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(rest))
            .ok_or_else(|| anyhow!("cannot determine home directory"))?,
        None => PathBuf::from(trimmed),
    };
    let absolute = std::fs::canonicalize(&expanded)
        .with_context(|| format!("cannot open folder {}", expanded.display()))?;
    if !absolute.is_dir() {
        return Err(anyhow!("{} is not a directory", absolute.display()));
    }
    Ok(absolute)
}
