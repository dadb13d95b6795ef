// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Recursive discovery of shared library dependencies.

Starting from launchers and extension modules, every library reference is
resolved against the referrer's search paths, the referrer's directory, the
configured include directories and finally the system library directories.
Libraries the copy policy accepts are tracked and walked in turn.
*/

use {
    crate::{
        backend::{LoadContext, OsBackend},
        binary::{reference_basename, BinaryFile, BinaryFormat, BinaryKind, ParsedBinary, Reference},
        error::BinaryError,
        policy::{CopyPolicy, CopyRule},
        tracker::BinaryTracker,
    },
    log::{debug, warn},
    std::{
        collections::{btree_map::Entry, BTreeMap, HashSet},
        path::{Path, PathBuf},
    },
};

/// Whether a library name has been located anywhere.
#[derive(Clone, Debug, Eq, PartialEq)]
enum Resolution {
    /// Not found yet, with the binaries that asked for it.
    Missing(Vec<PathBuf>),
    /// Found for some referrer.
    Resolved,
}

#[derive(Clone, Debug, Default)]
pub struct WalkerOptions {
    pub policy: CopyPolicy,
    /// Directories searched in addition to the policy's include directories.
    pub search_paths: Vec<PathBuf>,
    /// Directory of the executable that loads extension modules.
    pub executable_dir: Option<PathBuf>,
    pub silent: u8,
}

pub struct BinaryWalker<'a> {
    backend: &'a dyn OsBackend,
    options: WalkerOptions,
    tracker: BinaryTracker,
    seen: HashSet<PathBuf>,
    resolution: BTreeMap<String, Resolution>,
}

impl<'a> BinaryWalker<'a> {
    pub fn new(backend: &'a dyn OsBackend, options: WalkerOptions) -> Self {
        Self {
            backend,
            options,
            tracker: BinaryTracker::new(),
            seen: HashSet::new(),
            resolution: BTreeMap::new(),
        }
    }

    pub fn tracker(&self) -> &BinaryTracker {
        &self.tracker
    }

    /// Finish walking, recording the libraries that never resolved.
    pub fn into_tracker(mut self) -> BinaryTracker {
        let missing = self
            .resolution
            .into_iter()
            .filter_map(|(name, r)| match r {
                Resolution::Missing(referrers) => Some((name, referrers)),
                Resolution::Resolved => None,
            })
            .collect::<BTreeMap<_, _>>();

        if self.options.silent <= 2 {
            for (name, referrers) in &missing {
                warn!(
                    "unable to locate {} (needed by {})",
                    name,
                    referrers
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
        }

        self.tracker.set_missing(missing);
        self.tracker
    }

    /// Register a launcher or extension placed at `target` and walk it.
    ///
    /// Returns the key the binary is tracked under.
    pub fn add_binary(
        &mut self,
        source: &Path,
        target: &Path,
        kind: BinaryKind,
    ) -> Result<PathBuf, BinaryError> {
        let real_path = std::fs::canonicalize(source)?;
        let file = self.tracker.insert(BinaryFile::new(
            source,
            &real_path,
            kind,
            self.backend.format(),
        ));
        if file.target.is_none() {
            file.target = Some(target.to_path_buf());
        }
        if file.kind == BinaryKind::Dependency {
            file.kind = kind;
        }

        let executable_dir = match (kind, &self.options.executable_dir) {
            (BinaryKind::Launcher, _) | (_, None) => {
                source.parent().map(|p| p.to_path_buf()).unwrap_or_default()
            }
            (_, Some(dir)) => dir.clone(),
        };

        self.walk(&real_path, &[], &executable_dir)?;

        Ok(real_path)
    }

    fn parse(&self, source: &Path) -> Result<ParsedBinary, BinaryError> {
        match self.backend.parse(source) {
            Ok(parsed) => Ok(parsed),
            Err(e) if e.is_parse_error() || matches!(e, BinaryError::ToolFailed { .. }) => {
                if self.options.silent <= 2 {
                    warn!("unable to read dependencies of {}: {}", source.display(), e);
                }
                Ok(ParsedBinary::default())
            }
            Err(e) => Err(e),
        }
    }

    fn walk(
        &mut self,
        key: &Path,
        inherited: &[PathBuf],
        executable_dir: &Path,
    ) -> Result<(), BinaryError> {
        if !self.seen.insert(key.to_path_buf()) {
            return Ok(());
        }

        let source = match self.tracker.get(key) {
            Some(file) => file.source.clone(),
            None => return Ok(()),
        };
        debug!("walking {}", source.display());

        let parsed = self.parse(&source)?;
        let context = LoadContext {
            origin: source.parent().map(|p| p.to_path_buf()).unwrap_or_default(),
            executable_dir: executable_dir.to_path_buf(),
        };

        let own_rpaths = parsed
            .rpaths
            .iter()
            .filter_map(|raw| self.backend.expand_search_path(raw, &context))
            .collect::<Vec<_>>();
        let mut search = own_rpaths.clone();
        if self.backend.format() == BinaryFormat::MachO {
            search.extend(inherited.iter().cloned());
        }

        let mut references = vec![];
        let mut children = vec![];

        for raw in &parsed.references {
            if self.backend.is_virtual_reference(raw) {
                continue;
            }

            let found = match self.resolve(raw, &parsed, &context, &search) {
                Some(found) => found,
                None => {
                    self.note_missing(raw, &source);
                    references.push(Reference::unresolved(raw));
                    continue;
                }
            };

            let real = std::fs::canonicalize(&found)?;
            self.resolution
                .insert(reference_basename(raw).to_string(), Resolution::Resolved);

            let rule = self.options.policy.decide(&found, &real);
            if rule.includes() {
                if !self.tracker.contains(&real) {
                    debug!("{} needs {} ({:?})", source.display(), found.display(), rule);
                    self.tracker.insert(BinaryFile::new(
                        &found,
                        &real,
                        BinaryKind::Dependency,
                        self.backend.format(),
                    ));
                }
                references.push(Reference {
                    raw: raw.clone(),
                    resolved: Some(real.clone()),
                    target: Some(real.clone()),
                    copied: true,
                });
                children.push(real);
            } else {
                debug!("not bundling {} ({:?})", found.display(), rule);
                self.tracker.record_excluded(real.clone(), rule);
                references.push(Reference {
                    raw: raw.clone(),
                    resolved: Some(real),
                    target: None,
                    copied: false,
                });
            }
        }

        if let Some(file) = self.tracker.get_mut(key) {
            file.references = references;
            file.rpaths = own_rpaths;
            file.soname = parsed.soname.clone();
        }

        let inherited = if self.backend.format() == BinaryFormat::MachO {
            search
        } else {
            vec![]
        };
        for child in children {
            self.walk(&child, &inherited, executable_dir)?;
        }

        Ok(())
    }

    fn resolve(
        &self,
        raw: &str,
        parsed: &ParsedBinary,
        context: &LoadContext,
        search: &[PathBuf],
    ) -> Option<PathBuf> {
        let name = reference_basename(raw);

        if let Some(hint) = parsed.hints.get(raw).or_else(|| parsed.hints.get(name)) {
            if hint.is_file() {
                return Some(hint.clone());
            }
        }

        if let Some(found) = self
            .backend
            .reference_candidates(raw, context, search)
            .into_iter()
            .find(|p| p.is_file())
        {
            return Some(found);
        }

        std::iter::once(context.origin.clone())
            .chain(self.options.policy.bin_path_includes.iter().cloned())
            .chain(self.options.search_paths.iter().cloned())
            .chain(self.backend.system_search_paths())
            .map(|dir| dir.join(name))
            .find(|p| p.is_file())
    }

    fn note_missing(&mut self, raw: &str, referrer: &Path) {
        let name = reference_basename(raw);

        // Libraries excluded by name are expected to come from the system.
        if matches!(
            self.options.policy.decide(Path::new(name), Path::new(name)),
            CopyRule::ExcludedName | CopyRule::ExcludedStem
        ) {
            return;
        }

        match self.resolution.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if let Resolution::Missing(referrers) = entry.get_mut() {
                    referrers.push(referrer.to_path_buf());
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Resolution::Missing(vec![referrer.to_path_buf()]));
            }
        }
    }
}
