// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Atomic write-with-backup for JSON config files, and config-dir
//! resolution.

use std::path::{Path, PathBuf};

use chrono::Utc;
use jack_types::jsonpath::parse_with_location;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::JackError;

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/jack.sock";
pub const DEFAULT_CONFIG_DIR: &str = "/etc/jack/";

/// Resolved filesystem locations, read once at startup.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub socket_path: PathBuf,
}

impl Paths {
    pub fn from_env() -> Self {
        let config_dir = std::env::var("JACK_CONFIG_DIR").unwrap_or_else(|_| DEFAULT_CONFIG_DIR.to_string());
        let socket_path =
            std::env::var("JACK_SOCKET_PATH").unwrap_or_else(|_| DEFAULT_SOCKET_PATH.to_string());
        Self {
            config_dir: PathBuf::from(config_dir),
            socket_path: PathBuf::from(socket_path),
        }
    }

    pub fn jack_json(&self) -> PathBuf {
        self.config_dir.join("jack.json")
    }

    pub fn interfaces_json(&self) -> PathBuf {
        self.config_dir.join("interfaces.json")
    }

    pub fn routes_json(&self) -> PathBuf {
        self.config_dir.join("routes.json")
    }

    pub fn plugin_config(&self, plugin_name: &str) -> PathBuf {
        self.config_dir.join(format!("{plugin_name}.json"))
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.config_dir.join("checkpoints")
    }
}

/// Read and parse a JSON file, surfacing line/column on malformed JSON.
pub async fn load_json(path: &Path) -> Result<Option<Value>, JackError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let value = parse_with_location(&text).map_err(|e| JackError::Persistence {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(JackError::Persistence {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Atomic save: write `NAME.tmp`, rename over `NAME`, move the prior file to
/// `NAME.backup.<UTC-YYYYMMDD-HHMMSS>`. A crash between the write and
/// the rename leaves `NAME` untouched and `NAME.tmp` unreferenced by any
/// loader.
pub async fn save_json(path: &Path, value: &Value) -> Result<(), JackError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| persistence_error(path, e))?;

    let tmp_path = tmp_path_for(path);
    let rendered = serde_json::to_string_pretty(value).expect("Value always serializes");
    tokio::fs::write(&tmp_path, rendered.as_bytes())
        .await
        .map_err(|e| persistence_error(&tmp_path, e))?;

    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let backup_path = backup_path_for(path);
        tokio::fs::rename(path, &backup_path)
            .await
            .map_err(|e| persistence_error(path, e))?;
        debug!(backup = %backup_path.display(), "moved previous config to backup");
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| persistence_error(path, e))?;

    info!(path = %path.display(), "saved config");
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

fn backup_path_for(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".backup.{stamp}"));
    PathBuf::from(os)
}

fn persistence_error(path: &Path, e: std::io::Error) -> JackError {
    warn!(path = %path.display(), error = %e, "persistence error");
    JackError::Persistence {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trips_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jack.json");
        let value = json!({"version": "1"});
        save_json(&path, &value).await.unwrap();
        let loaded = load_json(&path).await.unwrap().unwrap();
        assert_eq!(loaded, value);
    }

    #[tokio::test]
    async fn second_save_creates_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jack.json");
        save_json(&path, &json!({"version": "1"})).await.unwrap();
        save_json(&path, &json!({"version": "2"})).await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut backups = 0;
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_name().to_string_lossy().contains(".backup.") {
                backups += 1;
            }
        }
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(load_json(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_json_reports_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, b"{\n  \"a\": ,\n}").await.unwrap();
        let err = load_json(&path).await.unwrap_err();
        assert!(err.to_string().contains("line"));
    }
}
