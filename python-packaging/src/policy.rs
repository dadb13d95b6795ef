// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Deciding where discovered modules end up.

A frozen application stores pure Python modules either inside the bytecode
archive or as `.pyc` files under the `lib` directory. The decision is made
per top-level package by a [ZipPolicy].
*/

use {
    crate::module::{Module, ModuleKind},
    anyhow::{anyhow, Result},
    std::collections::BTreeSet,
};

/// A set of top-level package names, or all of them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PackageSet {
    All,
    Names(BTreeSet<String>),
}

impl PackageSet {
    /// Build a set from configured names. `*` means all packages.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        if names.iter().any(|n| n.as_ref() == "*") {
            Self::All
        } else {
            Self::Names(names.iter().map(|n| n.as_ref().to_string()).collect())
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Names(names) => names.contains(name),
        }
    }
}

/// Where a module is emitted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModulePlacement {
    /// Stored in the bytecode archive.
    Archive,
    /// Written below the `lib` directory.
    Filesystem,
    /// Nothing to emit.
    None,
}

/// The `zip_include_packages` / `zip_exclude_packages` policy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ZipPolicy {
    include: PackageSet,
    exclude: PackageSet,
}

impl Default for ZipPolicy {
    fn default() -> Self {
        Self {
            include: PackageSet::Names(BTreeSet::new()),
            exclude: PackageSet::All,
        }
    }
}

impl ZipPolicy {
    /// Construct a policy from configuration.
    ///
    /// `exclude_packages` of `None` means "not configured": it defaults to
    /// everything unless `include_packages` contains `*`, in which case it
    /// defaults to nothing.
    pub fn new<S: AsRef<str>>(include_packages: &[S], exclude_packages: Option<&[S]>) -> Result<Self> {
        let include = PackageSet::from_names(include_packages);
        let exclude = match exclude_packages {
            Some(names) => PackageSet::from_names(names),
            None if include == PackageSet::All => PackageSet::Names(BTreeSet::new()),
            None => PackageSet::All,
        };

        match (&include, &exclude) {
            (PackageSet::All, PackageSet::All) => {
                return Err(anyhow!(
                    "zip_include_packages and zip_exclude_packages cannot both be *"
                ));
            }
            (PackageSet::Names(include), PackageSet::Names(exclude)) => {
                let overlap = include.intersection(exclude).cloned().collect::<Vec<_>>();
                if !overlap.is_empty() {
                    return Err(anyhow!(
                        "packages in both zip_include_packages and zip_exclude_packages: {}",
                        overlap.join(", ")
                    ));
                }
            }
            _ => {}
        }

        Ok(Self { include, exclude })
    }

    /// Whether modules of a top-level package go into the archive.
    pub fn archives_package(&self, top_level: &str) -> bool {
        match (&self.include, &self.exclude) {
            (PackageSet::All, exclude) => !exclude.contains(top_level),
            (include, PackageSet::All) => include.contains(top_level),
            (include, exclude) => include.contains(top_level) && !exclude.contains(top_level),
        }
    }

    /// Decide where a module goes.
    ///
    /// `in_filesystem` holds the names of modules flagged to stay on disk;
    /// the flag covers their submodules too.
    pub fn placement(&self, module: &Module, in_filesystem: &BTreeSet<String>) -> ModulePlacement {
        match module.kind {
            ModuleKind::Builtin | ModuleKind::Frozen | ModuleKind::Alias | ModuleKind::Missing => {
                return ModulePlacement::None;
            }
            ModuleKind::Extension => return ModulePlacement::Filesystem,
            _ => {}
        }

        let pinned = in_filesystem
            .iter()
            .any(|n| crate::module_util::is_module_or_submodule(&module.name, n));

        if pinned || !module.is_code_only() {
            return ModulePlacement::Filesystem;
        }

        // Plain top-level modules have no package to keep data next to.
        if !module.name.contains('.') && !module.is_package() {
            return ModulePlacement::Archive;
        }

        if self.archives_package(module.top_level_name()) {
            ModulePlacement::Archive
        } else {
            ModulePlacement::Filesystem
        }
    }
}
