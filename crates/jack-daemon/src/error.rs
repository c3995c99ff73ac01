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

//! The daemon's error taxonomy. One enum, one variant per failure kind,
//! so the IPC layer can render a one-line message and a structured
//! `data` field without re-deriving the kind from a string.

use jack_validate::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JackError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("persistence error for {path}: {reason}")]
    Persistence { path: String, reason: String },

    #[error("kernel error on {target}: {reason}")]
    Kernel { target: String, reason: String },

    #[error("plugin {namespace} rpc error: {reason}")]
    PluginRpc { namespace: String, reason: String },

    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("plugin already enabled: {0}")]
    AlreadyEnabled(String),

    #[error("plugin already disabled: {0}")]
    AlreadyDisabled(String),

    #[error("cannot disable {namespace}: required by {dependent}")]
    Dependency {
        namespace: String,
        dependent: String,
    },

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{original} ({rollback})")]
    RollbackFailed {
        original: Box<JackError>,
        rollback: String,
    },

    #[error("unknown path {0:?}")]
    UnknownPath(String),
}

impl JackError {
    /// Wrap `self` as the original error of a failed apply whose snapshot
    /// restore succeeded.
    pub fn rolled_back(self) -> Self {
        JackError::RollbackFailed {
            original: Box::new(self),
            rollback: "rolled back".to_string(),
        }
    }

    pub fn rollback_failed(self, reason: impl Into<String>) -> Self {
        JackError::RollbackFailed {
            original: Box::new(self),
            rollback: reason.into(),
        }
    }
}
