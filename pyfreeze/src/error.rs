// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {std::path::PathBuf, thiserror::Error, tugger_binary_analysis::BinaryError};

/// Unified error type for freezing applications.
#[derive(Debug, Error)]
pub enum FreezeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("platform error: {0}")]
    Platform(String),

    #[error("file not found: {}: {1}", .0.display())]
    File(PathBuf, String),

    #[error("{program} failed: {message}")]
    Exec { program: String, message: String },

    #[error("unable to parse {}: {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("{0}")]
    Binary(BinaryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl From<BinaryError> for FreezeError {
    fn from(e: BinaryError) -> Self {
        match e {
            BinaryError::MissingTool { .. } | BinaryError::UnsupportedPlatform(_) => {
                Self::Platform(e.to_string())
            }
            BinaryError::ToolFailed { program, message } => Self::Exec { program, message },
            BinaryError::InvalidBinary(path, message) => Self::Parse(path, message),
            BinaryError::Io(e) => Self::Io(e),
            e => Self::Binary(e),
        }
    }
}

impl From<toml::de::Error> for FreezeError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl FreezeError {
    pub fn config(message: impl ToString) -> Self {
        Self::Config(message.to_string())
    }

    pub fn file(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::File(path.into(), message.to_string())
    }
}
