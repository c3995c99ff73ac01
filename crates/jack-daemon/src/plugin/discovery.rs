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

//! Plugin discovery: scan a directory for
//! `jack-plugin-*` executables; the suffix is the plugin's name.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

pub const DEFAULT_PLUGIN_DIR: &str = "/usr/lib/jack/plugins/";
const PREFIX: &str = "jack-plugin-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCandidate {
    /// The filename suffix after `jack-plugin-`, e.g. `firewall`.
    pub name: String,
    pub path: PathBuf,
}

/// Scan `dir` for executables named `jack-plugin-<name>`. Missing
/// directories yield an empty list rather than an error — discovery is
/// re-run on demand (`plugin-rescan`) and an absent plugin directory is a
/// legitimate (if unconfigured) daemon state.
pub async fn discover(dir: &Path) -> Vec<PluginCandidate> {
    let mut candidates = Vec::new();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "plugin directory unavailable");
            return candidates;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Some(filename) = path.file_name().and_then(|f| f.to_str()) else {
            continue;
        };
        let Some(name) = filename.strip_prefix(PREFIX) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        match is_executable(&path).await {
            Ok(true) => candidates.push(PluginCandidate {
                name: name.to_string(),
                path,
            }),
            Ok(false) => debug!(path = %path.display(), "skipping non-executable plugin-shaped file"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to stat plugin candidate"),
        }
    }

    candidates.sort_by(|a, b| a.name.cmp(&b.name));
    candidates
}

#[cfg(unix)]
async fn is_executable(path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = tokio::fs::metadata(path).await?;
    Ok(metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
async fn is_executable(path: &Path) -> std::io::Result<bool> {
    let metadata = tokio::fs::metadata(path).await?;
    Ok(metadata.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    async fn touch_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::write(path, b"#!/bin/sh\n").await.unwrap();
        let mut perms = tokio::fs::metadata(path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(path, perms).await.unwrap();
    }

    #[tokio::test]
    async fn finds_prefixed_executables_and_strips_prefix() {
        let dir = tempfile::tempdir().unwrap();
        touch_executable(&dir.path().join("jack-plugin-firewall")).await;
        touch_executable(&dir.path().join("jack-plugin-dhcp")).await;
        tokio::fs::write(dir.path().join("README.md"), b"not a plugin")
            .await
            .unwrap();

        let found = discover(dir.path()).await;
        let names: Vec<&str> = found.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["dhcp", "firewall"]);
    }

    #[tokio::test]
    async fn non_executable_matching_name_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("jack-plugin-stub"), b"not executable")
            .await
            .unwrap();

        let found = discover(dir.path()).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn missing_directory_yields_empty_list() {
        let found = discover(Path::new("/nonexistent/jack/plugins")).await;
        assert!(found.is_empty());
    }
}
