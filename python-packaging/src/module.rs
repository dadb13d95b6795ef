// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Records describing discovered Python modules. */

use {
    crate::marshal::CodeObject,
    std::{
        collections::{BTreeMap, BTreeSet},
        fmt::{Display, Formatter},
        path::PathBuf,
    },
};

/// How a module is provided.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ModuleKind {
    /// A `.py` file.
    Source,
    /// A `.pyc` file without accompanying source.
    Bytecode,
    /// A native extension module.
    Extension,
    /// A directory with an `__init__` module.
    Package,
    /// A directory without `__init__`, possibly spread over several roots.
    NamespacePackage,
    /// Compiled into the interpreter.
    Builtin,
    /// Frozen into the interpreter.
    Frozen,
    /// Another name for an existing module.
    Alias,
    /// Referenced but not found.
    Missing,
}

impl Display for ModuleKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Source => "source",
            Self::Bytecode => "bytecode",
            Self::Extension => "extension",
            Self::Package => "package",
            Self::NamespacePackage => "namespace-package",
            Self::Builtin => "builtin",
            Self::Frozen => "frozen",
            Self::Alias => "alias",
            Self::Missing => "missing",
        })
    }
}

/// Where a module's code comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ModuleSource {
    /// A file on disk.
    Path(PathBuf),
    /// Source code generated in memory.
    Generated(Vec<u8>),
}

/// A discovered Python module.
#[derive(Clone, Debug)]
pub struct Module {
    /// Fully qualified dotted name.
    pub name: String,
    pub kind: ModuleKind,
    /// File providing the module. `__init__` file for packages.
    pub file: Option<PathBuf>,
    /// Source text for generated modules.
    pub generated_source: Option<Vec<u8>>,
    /// Compiled code.
    pub code: Option<CodeObject>,
    /// Directories searched for submodules. Only set for packages.
    pub search_roots: Vec<PathBuf>,
    /// For aliases, the real module name.
    pub alias_of: Option<String>,
    /// Normalized name of the distribution the module was installed by.
    pub distribution: Option<String>,
    /// Keep the module as a file on disk instead of in the archive.
    pub in_filesystem: bool,
    /// Names whose absence is not worth reporting.
    pub ignored_names: BTreeSet<String>,
    /// Names this module must not pull in.
    pub exclude_names: BTreeSet<String>,
    /// Names bound at module scope.
    pub global_names: BTreeSet<String>,
    /// Find/replace patches applied to source before compilation.
    pub source_patches: Vec<(String, String)>,
}

impl Module {
    pub fn new(name: &str, kind: ModuleKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            file: None,
            generated_source: None,
            code: None,
            search_roots: vec![],
            alias_of: None,
            distribution: None,
            in_filesystem: false,
            ignored_names: BTreeSet::new(),
            exclude_names: BTreeSet::new(),
            global_names: BTreeSet::new(),
            source_patches: vec![],
        }
    }

    pub fn is_package(&self) -> bool {
        matches!(self.kind, ModuleKind::Package | ModuleKind::NamespacePackage)
    }

    /// Whether the module can be stored as bytecode in an archive.
    pub fn is_code_only(&self) -> bool {
        matches!(
            self.kind,
            ModuleKind::Source | ModuleKind::Bytecode | ModuleKind::Package | ModuleKind::NamespacePackage
        ) && self.code.is_some()
    }

    /// Whether nothing needs to be emitted for the module.
    pub fn is_provided_by_interpreter(&self) -> bool {
        matches!(self.kind, ModuleKind::Builtin | ModuleKind::Frozen)
    }

    pub fn source(&self) -> Option<ModuleSource> {
        if let Some(source) = &self.generated_source {
            Some(ModuleSource::Generated(source.clone()))
        } else {
            self.file.clone().map(ModuleSource::Path)
        }
    }

    /// Name of the top-level package.
    pub fn top_level_name(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    /// Directory a package lives in on disk.
    pub fn package_dir(&self) -> Option<PathBuf> {
        if !self.is_package() {
            return None;
        }

        self.search_roots.first().cloned()
    }
}

/// How bad it is that an import could not be resolved.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MissingSeverity {
    /// Unconditional module level import.
    Missing,
    /// Import inside a function, `try` block or other conditional context.
    MaybeMissing,
}

/// Missing modules and who asked for them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MissingModules {
    pub missing: BTreeMap<String, BTreeSet<String>>,
    pub maybe_missing: BTreeMap<String, BTreeSet<String>>,
}

impl MissingModules {
    pub fn record(&mut self, name: &str, importer: &str, severity: MissingSeverity) {
        match severity {
            MissingSeverity::Missing => {
                self.maybe_missing.remove(name).into_iter().flatten().for_each(|i| {
                    self.missing
                        .entry(name.to_string())
                        .or_default()
                        .insert(i);
                });
                self.missing
                    .entry(name.to_string())
                    .or_default()
                    .insert(importer.to_string());
            }
            MissingSeverity::MaybeMissing => {
                if let Some(importers) = self.missing.get_mut(name) {
                    importers.insert(importer.to_string());
                } else {
                    self.maybe_missing
                        .entry(name.to_string())
                        .or_default()
                        .insert(importer.to_string());
                }
            }
        }
    }

    /// Forget a name that turned out to exist.
    pub fn resolve(&mut self, name: &str) {
        self.missing.remove(name);
        self.maybe_missing.remove(name);
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.maybe_missing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_escalation() {
        let mut missing = MissingModules::default();
        missing.record("foo", "a", MissingSeverity::MaybeMissing);
        assert!(missing.maybe_missing.contains_key("foo"));

        missing.record("foo", "b", MissingSeverity::Missing);
        assert!(!missing.maybe_missing.contains_key("foo"));
        assert_eq!(
            missing.missing.get("foo").map(|s| s.len()),
            Some(2)
        );

        missing.record("foo", "c", MissingSeverity::MaybeMissing);
        assert_eq!(missing.missing.get("foo").map(|s| s.len()), Some(3));
        assert!(missing.maybe_missing.is_empty());

        missing.resolve("foo");
        assert!(missing.is_empty());
    }

    #[test]
    fn code_only() {
        let mut m = Module::new("a", ModuleKind::Source);
        assert!(!m.is_code_only());
        m.code = Some(crate::testutil::empty_module_code(
            crate::bytecode::PythonVersion::new(3, 12),
            "a.py",
        ));
        assert!(m.is_code_only());

        assert!(!Module::new("ns", ModuleKind::NamespacePackage).is_code_only());
        assert!(!Module::new("ext", ModuleKind::Extension).is_code_only());
        assert_eq!(Module::new("a.b.c", ModuleKind::Source).top_level_name(), "a");
    }
}
