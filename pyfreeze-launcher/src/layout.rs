// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Where a frozen application keeps its files.

use {
    crate::error::LauncherError,
    std::path::{Path, PathBuf},
};

/// Default name of the bytecode archive.
pub const ARCHIVE_NAME: &str = "library.zip";

/// Paths of a frozen application, derived from the launcher location.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppLayout {
    /// The launcher, with symlinks resolved.
    pub executable: PathBuf,
    /// Directory holding the launcher.
    pub app_dir: PathBuf,
    /// `lib` below the application directory.
    pub lib_dir: PathBuf,
}

impl AppLayout {
    pub fn from_executable(executable: &Path) -> Result<Self, LauncherError> {
        let executable = executable.canonicalize()?;
        let app_dir = executable
            .parent()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} has no parent directory", executable.display()),
                )
            })?
            .to_path_buf();
        let lib_dir = app_dir.join("lib");

        Ok(Self {
            executable,
            app_dir,
            lib_dir,
        })
    }

    /// Layout of the running launcher.
    pub fn current() -> Result<Self, LauncherError> {
        Self::from_executable(&std::env::current_exe()?)
    }

    /// The bytecode archive.
    ///
    /// `library.zip` is preferred. A project may rename it, in which case
    /// the first zip file in `lib` is used.
    pub fn archive(&self) -> Option<PathBuf> {
        let default = self.lib_dir.join(ARCHIVE_NAME);
        if default.is_file() {
            return Some(default);
        }

        let mut zips = std::fs::read_dir(&self.lib_dir)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("zip")
            })
            .collect::<Vec<_>>();
        zips.sort();

        zips.into_iter().next()
    }

    /// `sys.path` of the embedded interpreter.
    pub fn module_search_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![];
        if let Some(archive) = self.archive() {
            paths.push(archive);
        }
        paths.push(self.lib_dir.clone());

        paths
    }
}
