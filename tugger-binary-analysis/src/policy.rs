// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Deciding whether a dependency is bundled. */

use {
    crate::{binary::strip_library_version, util::normalize_path},
    std::path::{Path, PathBuf},
};

/// The rule that produced a copy decision.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CopyRule {
    IncludedPath,
    ExcludedPath,
    IncludedName,
    ExcludedName,
    IncludedStem,
    ExcludedStem,
    IncludedDirectory,
    ExcludedDirectory,
    Default,
}

impl CopyRule {
    pub fn includes(&self) -> bool {
        matches!(
            self,
            Self::IncludedPath
                | Self::IncludedName
                | Self::IncludedStem
                | Self::IncludedDirectory
                | Self::Default
        )
    }
}

/// Include and exclude lists consulted for every resolved dependency.
///
/// Entries of the name lists may be file names or full paths.
#[derive(Clone, Debug, Default)]
pub struct CopyPolicy {
    pub bin_includes: Vec<String>,
    pub bin_excludes: Vec<String>,
    pub bin_path_includes: Vec<PathBuf>,
    pub bin_path_excludes: Vec<PathBuf>,
    /// Compare names and paths ignoring ASCII case.
    pub case_insensitive: bool,
}

impl CopyPolicy {
    fn fold(&self, s: &str) -> String {
        if self.case_insensitive {
            s.to_ascii_lowercase()
        } else {
            s.to_string()
        }
    }

    fn fold_path(&self, path: &Path) -> PathBuf {
        PathBuf::from(self.fold(&normalize_path(path).to_string_lossy()))
    }

    fn name_listed(&self, list: &[String], name: &str) -> bool {
        let name = self.fold(name);
        list.iter().any(|entry| self.fold(entry) == name)
    }

    fn path_listed(&self, list: &[String], path: &Path) -> bool {
        let path = self.fold_path(path);
        list.iter()
            .filter(|entry| entry.contains('/') || entry.contains('\\'))
            .any(|entry| self.fold_path(Path::new(entry)) == path)
    }

    fn under_any(&self, list: &[PathBuf], dir: &Path) -> bool {
        let dir = self.fold_path(dir);
        list.iter().any(|root| dir.starts_with(self.fold_path(root)))
    }

    /// Decide whether the library found at `path` is bundled.
    ///
    /// `real_path` is the canonical location of the same file. Rules are
    /// tried in order and the first match wins: full path, file name,
    /// file name without version suffix, then directory.
    pub fn decide(&self, path: &Path, real_path: &Path) -> CopyRule {
        let paths = [path, real_path];

        if paths.iter().any(|p| self.path_listed(&self.bin_includes, p)) {
            return CopyRule::IncludedPath;
        }
        if paths.iter().any(|p| self.path_listed(&self.bin_excludes, p)) {
            return CopyRule::ExcludedPath;
        }

        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.name_listed(&self.bin_includes, &name) {
            return CopyRule::IncludedName;
        }
        if self.name_listed(&self.bin_excludes, &name) {
            return CopyRule::ExcludedName;
        }

        let stem = strip_library_version(&name);
        if stem != name {
            if self.name_listed(&self.bin_includes, &stem) {
                return CopyRule::IncludedStem;
            }
            if self.name_listed(&self.bin_excludes, &stem) {
                return CopyRule::ExcludedStem;
            }
        }

        let dirs = paths.iter().filter_map(|p| p.parent()).collect::<Vec<_>>();
        if dirs.iter().any(|d| self.under_any(&self.bin_path_includes, d)) {
            return CopyRule::IncludedDirectory;
        }
        if dirs.iter().any(|d| self.under_any(&self.bin_path_excludes, d)) {
            return CopyRule::ExcludedDirectory;
        }

        CopyRule::Default
    }

    pub fn should_copy(&self, path: &Path, real_path: &Path) -> bool {
        self.decide(path, real_path).includes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux_policy() -> CopyPolicy {
        CopyPolicy {
            bin_includes: vec!["libpython3.12.so.1.0".into()],
            bin_excludes: vec!["libc.so".into(), "/opt/vendor/lib/libbad.so.3".into()],
            bin_path_includes: vec!["/opt/python/lib".into()],
            bin_path_excludes: vec!["/lib".into(), "/usr/lib".into(), "/opt/python".into()],
            case_insensitive: false,
        }
    }

    #[test]
    fn rule_order() {
        let p = linux_policy();
        let decide = |path: &str| p.decide(Path::new(path), Path::new(path));

        assert_eq!(decide("/usr/lib/libpython3.12.so.1.0"), CopyRule::IncludedName);
        assert_eq!(decide("/opt/vendor/lib/libbad.so.3"), CopyRule::ExcludedPath);
        assert_eq!(decide("/opt/other/libc.so.6"), CopyRule::ExcludedStem);
        assert_eq!(decide("/opt/python/lib/libffi.so.8"), CopyRule::IncludedDirectory);
        assert_eq!(decide("/opt/python/share/libx.so"), CopyRule::ExcludedDirectory);
        assert_eq!(
            decide("/usr/lib/x86_64-linux-gnu/libssl.so.3"),
            CopyRule::ExcludedDirectory
        );
        assert_eq!(decide("/home/u/venv/lib/libfoo.so"), CopyRule::Default);
        assert!(p.should_copy(Path::new("/srv/libfoo.so"), Path::new("/srv/libfoo.so")));
    }

    #[test]
    fn directory_match_is_by_component() {
        let p = linux_policy();
        // /library is not under /lib.
        assert_eq!(
            p.decide(Path::new("/library/libz.so"), Path::new("/library/libz.so")),
            CopyRule::Default
        );
    }

    #[test]
    fn real_path_is_consulted() {
        let p = linux_policy();
        assert_eq!(
            p.decide(
                Path::new("/home/u/lib/libssl.so.3"),
                Path::new("/usr/lib/libssl.so.3")
            ),
            CopyRule::ExcludedDirectory
        );
    }

    #[test]
    fn case_folding() {
        let p = CopyPolicy {
            bin_excludes: vec!["KERNEL32.dll".into()],
            case_insensitive: true,
            ..Default::default()
        };
        let path = PathBuf::from("app").join("kernel32.DLL");
        assert_eq!(p.decide(&path, &path), CopyRule::ExcludedName);

        let p = CopyPolicy {
            case_insensitive: false,
            ..p
        };
        assert_eq!(p.decide(&path, &path), CopyRule::Default);
    }
}
