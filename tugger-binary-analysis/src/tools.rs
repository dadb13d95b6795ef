// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Invocation of external platform tools. */

use {
    crate::error::BinaryError,
    log::debug,
    std::{
        ffi::OsString,
        path::{Path, PathBuf},
    },
};

/// Locate a tool, honoring an environment variable override.
pub fn find_tool(name: &str, env_override: Option<&str>, hint: &str) -> Result<PathBuf, BinaryError> {
    if let Some(var) = env_override {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                return Ok(PathBuf::from(value));
            }
        }
    }

    which::which(name).map_err(|_| BinaryError::MissingTool {
        tool: name.to_string(),
        hint: hint.to_string(),
    })
}

/// Run a tool to completion, returning its stdout.
///
/// A non-zero exit becomes an error carrying the first line the tool printed
/// to stderr.
pub fn run_tool<I, S>(program: &Path, args: I) -> Result<String, BinaryError>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    let args = args.into_iter().map(Into::into).collect::<Vec<OsString>>();
    debug!(
        "running {} {}",
        program.display(),
        args.iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    );

    let output = duct::cmd(program, &args)
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stderr.lines() {
        debug!("{}: {}", program.display(), line);
    }

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        let message = stderr
            .lines()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.to_string())
            .unwrap_or_else(|| format!("exited with {}", output.status));

        Err(BinaryError::ToolFailed {
            program: program.display().to_string(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tool() {
        let err = find_tool("pyfreeze-no-such-tool", None, "install it").unwrap_err();
        assert!(matches!(err, BinaryError::MissingTool { .. }));
        assert!(err.to_string().contains("install it"));
    }

    #[cfg(unix)]
    #[test]
    fn failure_carries_first_stderr_line() -> Result<(), BinaryError> {
        let sh = find_tool("sh", None, "")?;
        let out = run_tool(&sh, ["-c", "echo hello"])?;
        assert_eq!(out.trim(), "hello");

        let err = run_tool(&sh, ["-c", "echo first >&2; echo second >&2; exit 3"]).unwrap_err();
        match err {
            BinaryError::ToolFailed { message, .. } => assert_eq!(message, "first"),
            e => panic!("unexpected error: {}", e),
        }

        Ok(())
    }
}
