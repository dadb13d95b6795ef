// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resolve details about the pyfreeze execution environment.

use {
    crate::error::FreezeError,
    std::path::{Path, PathBuf},
};

pub const PYFREEZE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable overriding the directory holding launcher bases.
pub const BASES_DIR_ENV: &str = "PYFREEZE_BASES_DIR";

/// Default name of the project file.
pub const DEFAULT_CONFIG_FILE: &str = "pyfreeze.toml";

/// Resolve the directory holding launcher base templates.
///
/// The environment wins over the configured value. Without either, a
/// `bases` directory next to the running executable is used.
pub fn resolve_bases_dir(configured: Option<&Path>) -> Result<PathBuf, FreezeError> {
    if let Some(value) = std::env::var_os(BASES_DIR_ENV) {
        if !value.is_empty() {
            return Ok(PathBuf::from(value));
        }
    }

    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }

    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| FreezeError::Platform("unable to resolve executable directory".into()))?;

    Ok(dir.join("bases"))
}

/// Find the Python interpreter to freeze against.
pub fn resolve_python(configured: Option<&Path>) -> Result<PathBuf, FreezeError> {
    if let Some(path) = configured {
        return if path.components().count() > 1 || path.is_absolute() {
            if path.exists() {
                Ok(path.to_path_buf())
            } else {
                Err(FreezeError::file(path, "Python interpreter does not exist"))
            }
        } else {
            which::which(path)
                .map_err(|_| FreezeError::file(path, "Python interpreter not found on PATH"))
        };
    }

    let candidates: &[&str] = if cfg!(windows) {
        &["python.exe", "python3.exe"]
    } else {
        &["python3", "python"]
    };

    candidates
        .iter()
        .find_map(|name| which::which(name).ok())
        .ok_or_else(|| FreezeError::Platform("unable to find a Python interpreter on PATH".into()))
}

/// Strip the `\\?\` prefix Windows adds to canonical paths.
pub fn canonicalize_path(path: &Path) -> Result<PathBuf, std::io::Error> {
    let p = path.canonicalize()?;

    if cfg!(windows) {
        let s = p.display().to_string();
        if let Some(stripped) = s.strip_prefix(r"\\?\") {
            return Ok(PathBuf::from(stripped));
        }
    }

    Ok(p)
}

#[cfg(test)]
mod tests {
    use {super::*, anyhow::Result};

    #[test]
    fn explicit_python_must_exist() -> Result<()> {
        let td = tempfile::Builder::new().prefix("pyfreeze-test").tempdir()?;
        let missing = td.path().join("bin").join("python3");

        let err = resolve_python(Some(&missing)).unwrap_err();
        assert!(matches!(err, FreezeError::File(..)));

        std::fs::create_dir_all(missing.parent().unwrap())?;
        std::fs::write(&missing, b"")?;
        assert_eq!(resolve_python(Some(&missing))?, missing);

        Ok(())
    }
}
