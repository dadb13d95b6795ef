// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Relinking placed binaries against their placed dependencies. */

use {
    crate::{
        backend::{OsBackend, PlannedReference, RewritePlan},
        error::BinaryError,
        tracker::BinaryTracker,
    },
    log::info,
    std::{
        collections::HashSet,
        path::{Path, PathBuf},
    },
};

/// Order tracked binaries so dependencies precede their dependents.
pub fn bottom_up_order(tracker: &BinaryTracker) -> Vec<PathBuf> {
    fn visit(
        tracker: &BinaryTracker,
        key: &Path,
        visited: &mut HashSet<PathBuf>,
        order: &mut Vec<PathBuf>,
    ) {
        if !visited.insert(key.to_path_buf()) {
            return;
        }

        if let Some(file) = tracker.get(key) {
            for reference in file.references.iter().filter(|r| r.copied) {
                if let Some(target) = &reference.target {
                    visit(tracker, target, visited, order);
                }
            }
            order.push(key.to_path_buf());
        }
    }

    let mut visited = HashSet::new();
    let mut order = vec![];
    for key in tracker.keys() {
        visit(tracker, key, &mut visited, &mut order);
    }

    order
}

/// Build the relink plan of a tracked binary, if it has been placed.
pub fn plan_for(tracker: &BinaryTracker, key: &Path, executable_dir: &Path) -> Option<RewritePlan> {
    let file = tracker.get(key)?;
    let path = file.target.clone()?;

    let references = file
        .references
        .iter()
        .filter(|r| r.copied)
        .filter_map(|r| {
            let target = tracker.get(r.target.as_deref()?)?.target.clone()?;
            Some(PlannedReference {
                raw: r.raw.clone(),
                target,
            })
        })
        .collect();

    Some(RewritePlan {
        path,
        kind: file.kind,
        references,
        new_soname: file.new_soname.clone(),
        executable_dir: executable_dir.to_path_buf(),
    })
}

pub struct BinaryRewriter<'a> {
    backend: &'a dyn OsBackend,
    executable_dir: PathBuf,
}

impl<'a> BinaryRewriter<'a> {
    pub fn new(backend: &'a dyn OsBackend, executable_dir: &Path) -> Self {
        Self {
            backend,
            executable_dir: executable_dir.to_path_buf(),
        }
    }

    /// Relink every placed binary, dependencies first.
    ///
    /// Returns the files that changed. Running this again over the same
    /// output changes nothing.
    pub fn rewrite_all(&self, tracker: &BinaryTracker) -> Result<Vec<PathBuf>, BinaryError> {
        let mut modified = vec![];

        for key in bottom_up_order(tracker) {
            let plan = match plan_for(tracker, &key, &self.executable_dir) {
                Some(plan) if plan.path.exists() => plan,
                _ => continue,
            };

            let changed = self.backend.rewrite_references(&plan)?;
            self.backend.finalize(&plan.path, changed)?;

            if changed {
                info!("relinked {}", plan.path.display());
                modified.push(plan.path);
            }
        }

        Ok(modified)
    }
}
