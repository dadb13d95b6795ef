// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {pyo3::ffi as pyffi, std::ffi::CStr, thiserror::Error};

/// Errors raised while bringing up the embedded interpreter.
#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("unable to resolve launcher location: {0}")]
    Location(#[from] std::io::Error),

    #[error("{0} cannot be passed to Python")]
    Encoding(String),

    #[error("during {context}: {message}")]
    Status { context: String, message: String },

    #[error("during {0}: a Python exception was raised")]
    Python(String),
}

impl LauncherError {
    /// Describe a failed `PyStatus`.
    pub fn from_status(status: &pyffi::PyStatus, context: &str) -> Self {
        let message = if !status.func.is_null() && !status.err_msg.is_null() {
            let func = unsafe { CStr::from_ptr(status.func) };
            let msg = unsafe { CStr::from_ptr(status.err_msg) };
            format!("{}: {}", func.to_string_lossy(), msg.to_string_lossy())
        } else if !status.err_msg.is_null() {
            let msg = unsafe { CStr::from_ptr(status.err_msg) };
            msg.to_string_lossy().to_string()
        } else {
            "could not format PyStatus".to_string()
        };

        Self::Status {
            context: context.to_string(),
            message,
        }
    }
}
