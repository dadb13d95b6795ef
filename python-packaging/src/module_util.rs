// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Utility functions related to Python module names. */

use std::{collections::BTreeSet, path::PathBuf};

/// Resolve the set of packages present in a fully qualified module name.
pub fn packages_from_module_name(module: &str) -> BTreeSet<String> {
    let mut package_names = BTreeSet::new();

    let mut search: &str = module;

    while let Some(idx) = search.rfind('.') {
        package_names.insert(search[0..idx].to_string());
        search = &search[0..idx];
    }

    package_names
}

/// The parent package of a module, if any.
pub fn parent_module_name(module: &str) -> Option<&str> {
    module.rfind('.').map(|idx| &module[0..idx])
}

/// The final component of a dotted name.
pub fn leaf_module_name(module: &str) -> &str {
    match module.rfind('.') {
        Some(idx) => &module[idx + 1..],
        None => module,
    }
}

/// Whether `name` is `prefix` or a submodule of it.
pub fn is_module_or_submodule(name: &str, prefix: &str) -> bool {
    name == prefix
        || (name.len() > prefix.len()
            && name.starts_with(prefix)
            && name.as_bytes()[prefix.len()] == b'.')
}

/// Whether a string is usable as a dotted module name.
pub fn is_valid_module_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(c) if c == '_' || c.is_alphabetic() => {
                    chars.all(|c| c == '_' || c.is_alphanumeric())
                }
                _ => false,
            }
        })
}

/// Relative path of a module inside an archive or directory tree.
///
/// Packages map to `<pkg>/__init__<suffix>`.
pub fn module_relative_path(name: &str, is_package: bool, suffix: &str) -> PathBuf {
    let mut path: PathBuf = name.split('.').collect();

    if is_package {
        path.push(format!("__init__{}", suffix));
    } else {
        let leaf = format!("{}{}", leaf_module_name(name), suffix);
        path.set_file_name(leaf);
    }

    path
}
