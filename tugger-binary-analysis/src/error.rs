// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {std::path::PathBuf, thiserror::Error};

/// Unified error type for binary analysis and relinking.
#[derive(Debug, Error)]
pub enum BinaryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary parsing error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("binary write error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("invalid binary {}: {1}", .0.display())]
    InvalidBinary(PathBuf, String),

    #[error("malformed binary data: {0}")]
    Malformed(String),

    #[error("{tool} is required but could not be found: {hint}")]
    MissingTool { tool: String, hint: String },

    #[error("{program} failed: {message}")]
    ToolFailed { program: String, message: String },

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("invalid value for {0}: {1}")]
    InvalidEnvironment(String, String),

    #[error("PE image error: {0:#}")]
    Pe(anyhow::Error),
}

impl BinaryError {
    /// Whether the error stems from a binary that could not be parsed.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            Self::Goblin(_) | Self::Scroll(_) | Self::InvalidBinary(..) | Self::Malformed(_)
        )
    }
}
