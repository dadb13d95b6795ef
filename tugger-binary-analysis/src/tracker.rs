// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{binary::BinaryFile, policy::CopyRule},
    std::{
        collections::{BTreeMap, HashMap},
        path::{Path, PathBuf},
    },
};

/// Binaries discovered for an application, keyed by real path.
///
/// Iteration follows discovery order, so a binary always comes after the
/// first binary that referenced it.
#[derive(Clone, Debug, Default)]
pub struct BinaryTracker {
    files: HashMap<PathBuf, BinaryFile>,
    order: Vec<PathBuf>,
    excluded: BTreeMap<PathBuf, CopyRule>,
    missing: BTreeMap<String, Vec<PathBuf>>,
}

impl BinaryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, key: &Path) -> bool {
        self.files.contains_key(key)
    }

    pub fn get(&self, key: &Path) -> Option<&BinaryFile> {
        self.files.get(key)
    }

    pub fn get_mut(&mut self, key: &Path) -> Option<&mut BinaryFile> {
        self.files.get_mut(key)
    }

    /// Track a file. An already tracked file is left as is.
    pub fn insert(&mut self, file: BinaryFile) -> &mut BinaryFile {
        let key = file.real_path.clone();
        if !self.files.contains_key(&key) {
            self.order.push(key.clone());
        }

        self.files.entry(key).or_insert(file)
    }

    pub fn keys(&self) -> impl Iterator<Item = &PathBuf> {
        self.order.iter()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BinaryFile> {
        self.order.iter().filter_map(|k| self.files.get(k))
    }

    /// Libraries that resolved but were not bundled, with the deciding rule.
    pub fn excluded(&self) -> &BTreeMap<PathBuf, CopyRule> {
        &self.excluded
    }

    pub(crate) fn record_excluded(&mut self, path: PathBuf, rule: CopyRule) {
        self.excluded.insert(path, rule);
    }

    /// Library names no binary could resolve, with their referrers.
    pub fn missing(&self) -> &BTreeMap<String, Vec<PathBuf>> {
        &self.missing
    }

    pub(crate) fn set_missing(&mut self, missing: BTreeMap<String, Vec<PathBuf>>) {
        self.missing = missing;
    }
}
