// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Filesystem helpers for mutating binaries safely. */

use {
    crate::error::BinaryError,
    std::{
        fs::Permissions,
        path::{Component, Path, PathBuf},
    },
};

#[cfg(unix)]
fn writable(permissions: &Permissions) -> Permissions {
    use std::os::unix::fs::PermissionsExt;

    Permissions::from_mode(permissions.mode() | 0o200)
}

#[cfg(not(unix))]
fn writable(permissions: &Permissions) -> Permissions {
    let mut permissions = permissions.clone();
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(false);
    permissions
}

/// Mutate a file through a temporary sibling copy.
///
/// `f` receives the path of a writable copy of `path`. When it succeeds the
/// copy replaces the original with a rename and the original permissions are
/// restored. When it or the rename fails the original file is untouched.
pub fn rewrite_file<F>(path: &Path, f: F) -> Result<(), BinaryError>
where
    F: FnOnce(&Path) -> Result<(), BinaryError>,
{
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let permissions = std::fs::metadata(path)?.permissions();

    let temp = tempfile::Builder::new()
        .prefix(".pyfreeze-")
        .tempfile_in(parent)?;
    std::fs::copy(path, temp.path())?;
    std::fs::set_permissions(temp.path(), writable(&permissions))?;

    f(temp.path())?;

    std::fs::set_permissions(temp.path(), permissions.clone())?;
    // Renaming over a read-only file fails on some platforms.
    std::fs::set_permissions(path, writable(&permissions))?;
    if let Err(e) = temp.persist(path) {
        // The rename error is the one worth reporting.
        std::fs::set_permissions(path, permissions).ok();
        return Err(BinaryError::Io(e.error));
    }

    Ok(())
}

/// Replace the content of a file atomically.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> Result<(), BinaryError> {
    rewrite_file(path, |temp| Ok(std::fs::write(temp, data)?))
}

/// Lexically normalize a path, resolving `.` and `..` components.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            c => out.push(c.as_os_str()),
        }
    }

    out
}

/// Express `path` relative to the directory `base`.
///
/// Both paths are expected to be absolute and normalized.
pub fn relative_path(base: &Path, path: &Path) -> PathBuf {
    let base = base.components().collect::<Vec<_>>();
    let path_components = path.components().collect::<Vec<_>>();

    let common = base
        .iter()
        .zip(path_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..base.len() {
        out.push("..");
    }
    for c in &path_components[common..] {
        out.push(c.as_os_str());
    }

    out
}

/// Obtain the file name of a path as a string.
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_path(Path::new("a/../../b")), PathBuf::from("../b"));
    }

    #[test]
    fn relative() {
        assert_eq!(
            relative_path(Path::new("/dist/lib/pkg"), Path::new("/dist/lib/libfoo.so")),
            PathBuf::from("../libfoo.so")
        );
        assert_eq!(
            relative_path(Path::new("/dist"), Path::new("/dist/lib/libfoo.so")),
            PathBuf::from("lib/libfoo.so")
        );
        assert_eq!(
            relative_path(Path::new("/dist/lib"), Path::new("/dist/lib")),
            PathBuf::new()
        );
    }

    #[cfg(unix)]
    #[test]
    fn rewrite_preserves_permissions() -> Result<(), BinaryError> {
        use std::os::unix::fs::PermissionsExt;

        let td = tempfile::Builder::new()
            .prefix("tugger-binary-analysis-test")
            .tempdir()?;
        let path = td.path().join("libfoo.so");
        std::fs::write(&path, b"before")?;
        std::fs::set_permissions(&path, Permissions::from_mode(0o555))?;

        write_file_atomic(&path, b"after")?;

        assert_eq!(std::fs::read(&path)?, b"after");
        assert_eq!(
            std::fs::metadata(&path)?.permissions().mode() & 0o777,
            0o555
        );

        Ok(())
    }

    #[test]
    fn failed_rewrite_leaves_original() -> Result<(), BinaryError> {
        let td = tempfile::Builder::new()
            .prefix("tugger-binary-analysis-test")
            .tempdir()?;
        let path = td.path().join("libfoo.so");
        std::fs::write(&path, b"before")?;

        let res = rewrite_file(&path, |temp| {
            std::fs::write(temp, b"partial")?;
            Err(BinaryError::Malformed("boom".into()))
        });
        assert!(res.is_err());
        assert_eq!(std::fs::read(&path)?, b"before");
        assert_eq!(std::fs::read_dir(td.path())?.count(), 1);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn failed_replace_restores_permissions() -> Result<(), BinaryError> {
        use std::os::unix::fs::PermissionsExt;

        let td = tempfile::Builder::new()
            .prefix("tugger-binary-analysis-test")
            .tempdir()?;
        let path = td.path().join("libfoo.so");
        std::fs::write(&path, b"before")?;
        std::fs::set_permissions(&path, Permissions::from_mode(0o444))?;

        // A directory in place of the original makes the final rename fail.
        let res = rewrite_file(&path, |_| {
            std::fs::remove_file(&path)?;
            std::fs::create_dir(&path)?;
            std::fs::set_permissions(&path, Permissions::from_mode(0o444))?;
            Ok(())
        });

        assert!(matches!(res, Err(BinaryError::Io(_))));
        assert_eq!(
            std::fs::metadata(&path)?.permissions().mode() & 0o777,
            0o444
        );
        assert_eq!(std::fs::read_dir(td.path())?.count(), 1);

        std::fs::set_permissions(&path, Permissions::from_mode(0o755))?;

        Ok(())
    }
}
