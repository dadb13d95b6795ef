// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Resolve module names to files on a search path.

Resolution follows the semantics of CPython's path based finder: for each
search root in order, a directory with an `__init__` wins, then extension
modules, then source, then bytecode. Directories without `__init__` are
remembered as namespace package portions and only used when no root
provides a real module.
*/

use {
    crate::module_util::is_valid_module_name,
    std::{
        cell::RefCell,
        collections::{BTreeSet, HashMap},
        path::{Component, Path, PathBuf},
    },
};

/// The result of resolving a module name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResolvedModule {
    /// Directory with an `__init__` file.
    Package { init: PathBuf, dir: PathBuf },
    /// Directories contributing to a namespace package, in search order.
    NamespacePackage { dirs: Vec<PathBuf> },
    Source(PathBuf),
    Bytecode(PathBuf),
    Extension(PathBuf),
}

/// Normalize a path lexically, making it absolute.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut result = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            c => result.push(c.as_os_str()),
        }
    }

    result
}

/// Normalize paths and drop duplicates, preserving first-seen order.
pub fn normalize_search_path<I, P>(paths: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut seen = BTreeSet::new();
    let mut result = vec![];

    for path in paths {
        let path = normalize_path(path.as_ref());
        if seen.insert(path.clone()) {
            result.push(path);
        }
    }

    result
}

/// Resolves module names against ordered search roots.
#[derive(Debug)]
pub struct PathResolver {
    roots: Vec<PathBuf>,
    source_suffixes: Vec<String>,
    bytecode_suffixes: Vec<String>,
    extension_suffixes: Vec<String>,
    cache: RefCell<HashMap<(Vec<PathBuf>, String), Option<ResolvedModule>>>,
}

impl PathResolver {
    pub fn new<I, P>(roots: I, extension_suffixes: Vec<String>) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            roots: normalize_search_path(roots),
            source_suffixes: vec![".py".to_string()],
            bytecode_suffixes: vec![".pyc".to_string()],
            extension_suffixes,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// The top-level search roots.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn extension_suffixes(&self) -> &[String] {
        &self.extension_suffixes
    }

    fn find_uncached(&self, leaf: &str, roots: &[PathBuf]) -> Option<ResolvedModule> {
        let mut portions = vec![];

        for root in roots {
            let dir = root.join(leaf);
            if dir.is_dir() {
                let init = self
                    .source_suffixes
                    .iter()
                    .chain(self.bytecode_suffixes.iter())
                    .map(|suffix| dir.join(format!("__init__{}", suffix)))
                    .find(|p| p.is_file());

                if let Some(init) = init {
                    return Some(ResolvedModule::Package { init, dir });
                }

                portions.push(dir);
            }

            for suffix in &self.extension_suffixes {
                let path = root.join(format!("{}{}", leaf, suffix));
                if path.is_file() {
                    return Some(ResolvedModule::Extension(path));
                }
            }

            for suffix in &self.source_suffixes {
                let path = root.join(format!("{}{}", leaf, suffix));
                if path.is_file() {
                    return Some(ResolvedModule::Source(path));
                }
            }

            for suffix in &self.bytecode_suffixes {
                let path = root.join(format!("{}{}", leaf, suffix));
                if path.is_file() {
                    return Some(ResolvedModule::Bytecode(path));
                }
            }
        }

        if portions.is_empty() {
            None
        } else {
            Some(ResolvedModule::NamespacePackage { dirs: portions })
        }
    }

    /// Find a module by its final name component.
    ///
    /// `roots` are the parent package's search roots, or `None` for
    /// top-level modules.
    pub fn find_module(&self, leaf: &str, roots: Option<&[PathBuf]>) -> Option<ResolvedModule> {
        let roots = roots.unwrap_or(&self.roots);
        let key = (roots.to_vec(), leaf.to_string());

        if let Some(cached) = self.cache.borrow().get(&key) {
            return cached.clone();
        }

        let resolved = self.find_uncached(leaf, roots);
        self.cache.borrow_mut().insert(key, resolved.clone());

        resolved
    }

    /// Names of modules directly inside package directories.
    pub fn iter_submodule_names(&self, roots: &[PathBuf]) -> BTreeSet<String> {
        let mut names = BTreeSet::new();

        for root in roots {
            let entries = match std::fs::read_dir(root) {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                let file_name = match path.file_name().and_then(|s| s.to_str()) {
                    Some(s) => s.to_string(),
                    None => continue,
                };

                let candidate = if path.is_dir() {
                    Some(file_name.as_str())
                } else {
                    self.extension_suffixes
                        .iter()
                        .chain(self.source_suffixes.iter())
                        .chain(self.bytecode_suffixes.iter())
                        .find_map(|suffix| file_name.strip_suffix(suffix.as_str()))
                };

                if let Some(name) = candidate {
                    if name != "__init__" && name != "__pycache__" && is_valid_module_name(name) {
                        names.insert(name.to_string());
                    }
                }
            }
        }

        names
    }

    fn is_code_file(&self, file_name: &str) -> bool {
        self.source_suffixes
            .iter()
            .chain(self.bytecode_suffixes.iter())
            .chain(self.extension_suffixes.iter())
            .any(|suffix| file_name.ends_with(suffix.as_str()))
    }

    fn has_init(&self, dir: &Path) -> bool {
        self.source_suffixes
            .iter()
            .chain(self.bytecode_suffixes.iter())
            .any(|suffix| dir.join(format!("__init__{}", suffix)).is_file())
    }

    /// Non-code files belonging to a package directory.
    ///
    /// Subpackages are skipped; they carry their own data. Paths are
    /// returned relative to `dir`, sorted.
    pub fn package_data_files(&self, dir: &Path) -> Vec<PathBuf> {
        let mut files = vec![];

        let walker = walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                entry.file_name() != "__pycache__" && !self.has_init(entry.path())
            });

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            if self.is_code_file(&name) {
                continue;
            }

            if let Ok(rel) = entry.path().strip_prefix(dir) {
                files.push(rel.to_path_buf());
            }
        }

        files
    }
}

#[cfg(test)]
mod tests {
    use {super::*, anyhow::Result};

    fn touch(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, b"")?;
        Ok(())
    }

    #[test]
    fn normalization() {
        assert_eq!(
            normalize_search_path(vec!["/a/b/../c", "/a/c", "/a/./d"]),
            vec![PathBuf::from("/a/c"), PathBuf::from("/a/d")]
        );
    }

    #[test]
    fn resolution_order() -> Result<()> {
        let td = tempfile::Builder::new()
            .prefix("python-packaging-test")
            .tempdir()?;
        let first = td.path().join("first");
        let second = td.path().join("second");

        touch(&first.join("mod.py"))?;
        touch(&first.join("mod.so"))?;
        touch(&first.join("pkg").join("__init__.py"))?;
        touch(&second.join("pkg").join("__init__.py"))?;
        touch(&second.join("only.pyc"))?;
        touch(&first.join("ns").join("a.py"))?;
        touch(&second.join("ns").join("b.py"))?;
        touch(&first.join("shadow").join("x.py"))?;
        touch(&second.join("shadow.py"))?;

        let resolver = PathResolver::new(vec![&first, &second], vec![".so".to_string()]);

        assert_eq!(
            resolver.find_module("mod", None),
            Some(ResolvedModule::Extension(first.join("mod.so")))
        );
        assert_eq!(
            resolver.find_module("pkg", None),
            Some(ResolvedModule::Package {
                init: first.join("pkg").join("__init__.py"),
                dir: first.join("pkg"),
            })
        );
        assert_eq!(
            resolver.find_module("only", None),
            Some(ResolvedModule::Bytecode(second.join("only.pyc")))
        );
        assert_eq!(
            resolver.find_module("ns", None),
            Some(ResolvedModule::NamespacePackage {
                dirs: vec![first.join("ns"), second.join("ns")]
            })
        );
        // A real module in a later root beats a namespace portion.
        assert_eq!(
            resolver.find_module("shadow", None),
            Some(ResolvedModule::Source(second.join("shadow.py")))
        );
        assert_eq!(resolver.find_module("absent", None), None);

        let ns_roots = vec![first.join("ns"), second.join("ns")];
        assert_eq!(
            resolver.iter_submodule_names(&ns_roots),
            ["a", "b"].iter().map(|s| s.to_string()).collect()
        );

        Ok(())
    }

    #[test]
    fn data_files() -> Result<()> {
        let td = tempfile::Builder::new()
            .prefix("python-packaging-test")
            .tempdir()?;
        let pkg = td.path().join("pkg");

        touch(&pkg.join("__init__.py"))?;
        touch(&pkg.join("data.json"))?;
        touch(&pkg.join("templates").join("index.html"))?;
        touch(&pkg.join("__pycache__").join("x.cpython-312.pyc"))?;
        touch(&pkg.join("sub").join("__init__.py"))?;
        touch(&pkg.join("sub").join("sub.txt"))?;

        let resolver = PathResolver::new(vec![td.path()], vec![]);
        assert_eq!(
            resolver.package_data_files(&pkg),
            vec![
                PathBuf::from("data.json"),
                PathBuf::from("templates").join("index.html")
            ]
        );

        Ok(())
    }
}
