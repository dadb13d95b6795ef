// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Placement of bundled binaries in the output directory. */

use {
    crate::{
        binary::{BinaryFormat, BinaryKind},
        error::BinaryError,
        tracker::BinaryTracker,
        util::file_name,
    },
    log::{debug, warn},
    sha2::{Digest, Sha256},
    std::{
        collections::{HashMap, HashSet},
        path::{Path, PathBuf},
    },
};

#[derive(Clone, Debug)]
pub struct LayoutOptions {
    /// Directory launchers are placed in.
    pub target_dir: PathBuf,
    /// Directory shared libraries are placed in on ELF and Mach-O.
    pub lib_dir: PathBuf,
}

/// Two distinct sources that wanted the same target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Collision {
    pub target: PathBuf,
    pub kept: PathBuf,
    pub dropped: PathBuf,
}

#[derive(Clone, Debug, Default)]
pub struct LayoutReport {
    pub collisions: Vec<Collision>,
    /// Libraries placed under a new name, by key.
    pub renamed: Vec<(PathBuf, String)>,
}

/// Insert a short content hash into a library file name.
///
/// `libfoo.so.1` becomes `libfoo-<hash>.so.1`.
pub fn hashed_name(name: &str, content: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(content));
    let hash = &digest[0..8];

    match name.find('.') {
        Some(pos) if pos > 0 => format!("{}-{}{}", &name[0..pos], hash, &name[pos..]),
        _ => format!("{}-{}", name, hash),
    }
}

fn target_key(format: BinaryFormat, path: &Path) -> PathBuf {
    if format == BinaryFormat::Pe {
        PathBuf::from(path.to_string_lossy().to_ascii_lowercase())
    } else {
        path.to_path_buf()
    }
}

/// Assign targets to tracked dependencies.
///
/// Launchers and extension modules keep the targets they were registered
/// with. Dependencies go to the application directory on PE, where the
/// loader always looks, and to the library directory elsewhere. When two
/// distinct files want the same target, ELF libraries are renamed and
/// relinked by their new name. On other formats the first file wins and
/// references to the second are redirected to it.
pub fn assign_targets(
    tracker: &mut BinaryTracker,
    format: BinaryFormat,
    options: &LayoutOptions,
) -> Result<LayoutReport, BinaryError> {
    let mut report = LayoutReport::default();
    let mut claimed: HashMap<PathBuf, PathBuf> = HashMap::new();
    let mut redirects: HashMap<PathBuf, PathBuf> = HashMap::new();
    let keys = tracker.keys().cloned().collect::<Vec<_>>();

    // A bundled library sharing its name with a system library the process
    // may also load would clash with it, so such libraries get unique names.
    let excluded_names = tracker
        .excluded()
        .keys()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .collect::<HashSet<_>>();

    for key in &keys {
        let file = match tracker.get_mut(key) {
            Some(f) if f.kind != BinaryKind::Dependency => f,
            _ => continue,
        };
        if let Some(target) = &file.target {
            let k = target_key(format, target);
            if let Some(kept) = claimed.get(&k) {
                warn!(
                    "{} and {} both map to {}; keeping the first",
                    kept.display(),
                    key.display(),
                    target.display()
                );
                report.collisions.push(Collision {
                    target: target.clone(),
                    kept: kept.clone(),
                    dropped: key.clone(),
                });
                file.target = None;
            } else {
                claimed.insert(k, key.clone());
            }
        }
    }

    for key in &keys {
        let file = match tracker.get_mut(key) {
            Some(f) if f.kind == BinaryKind::Dependency && f.target.is_none() => f,
            _ => continue,
        };

        let dir = if format == BinaryFormat::Pe {
            &options.target_dir
        } else {
            &options.lib_dir
        };
        let name = file_name(&file.source);
        let mut target = dir.join(&name);

        let clashes_with_system = format == BinaryFormat::Elf && excluded_names.contains(&name);
        if let Some(kept) = claimed.get(&target_key(format, &target)).cloned() {
            if format != BinaryFormat::Elf {
                warn!(
                    "{} and {} both map to {}; keeping the first",
                    kept.display(),
                    key.display(),
                    target.display()
                );
                report.collisions.push(Collision {
                    target,
                    kept: kept.clone(),
                    dropped: key.clone(),
                });
                redirects.insert(key.clone(), kept);
                continue;
            }
        } else if !clashes_with_system {
            debug!("placing {} at {}", file.source.display(), target.display());
            claimed.insert(target_key(format, &target), key.clone());
            file.target = Some(target);
            continue;
        }

        let new_name = hashed_name(&name, &std::fs::read(&file.real_path)?);
        target = dir.join(&new_name);
        if let Some(kept) = claimed.get(&target_key(format, &target)).cloned() {
            // Same name and same content hash: the first copy serves both.
            redirects.insert(key.clone(), kept);
            continue;
        }

        debug!("placing {} at {}", file.source.display(), target.display());
        claimed.insert(target_key(format, &target), key.clone());
        file.target = Some(target);
        file.new_soname = Some(new_name.clone());
        report.renamed.push((key.clone(), new_name));
    }

    for key in &keys {
        if let Some(file) = tracker.get_mut(key) {
            for reference in file.references.iter_mut().filter(|r| r.copied) {
                if let Some(redirect) = reference.target.as_ref().and_then(|t| redirects.get(t)) {
                    reference.target = Some(redirect.clone());
                }
            }
        }
    }

    Ok(report)
}

/// Copy every placed binary whose target does not exist yet.
///
/// Returns the targets written.
pub fn copy_binaries(tracker: &BinaryTracker) -> Result<Vec<PathBuf>, BinaryError> {
    let mut copied = vec![];

    for file in tracker.iter() {
        let target = match &file.target {
            Some(t) if !t.exists() => t,
            _ => continue,
        };

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!("copying {} to {}", file.source.display(), target.display());
        std::fs::copy(&file.real_path, target)?;
        copied.push(target.clone());
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::binary::{BinaryFile, Reference},
    };

    fn dependency(tracker: &mut BinaryTracker, source: &Path) {
        tracker.insert(BinaryFile::new(
            source,
            source,
            BinaryKind::Dependency,
            BinaryFormat::Elf,
        ));
    }

    fn copied_reference(raw: &str, key: &Path) -> Reference {
        Reference {
            raw: raw.to_string(),
            resolved: Some(key.to_path_buf()),
            target: Some(key.to_path_buf()),
            copied: true,
        }
    }

    #[test]
    fn hashed_names() {
        let name = hashed_name("libfoo.so.1", b"content");
        assert!(name.starts_with("libfoo-"));
        assert!(name.ends_with(".so.1"));
        assert_eq!(name.len(), "libfoo-.so.1".len() + 8);
        assert_eq!(hashed_name("libfoo.so.1", b"content"), name);
        assert_ne!(hashed_name("libfoo.so.1", b"other"), name);
    }

    #[test]
    fn elf_collisions_are_renamed() -> Result<(), BinaryError> {
        let td = tempfile::Builder::new()
            .prefix("tugger-binary-analysis-test")
            .tempdir()?;
        let a = td.path().join("a").join("libfoo.so.1");
        let b = td.path().join("b").join("libfoo.so.1");
        for (p, content) in [(&a, "a"), (&b, "b")] {
            std::fs::create_dir_all(p.parent().expect("parent"))?;
            std::fs::write(p, content)?;
        }

        let ext = td.path().join("_ext.so");
        let mut tracker = BinaryTracker::new();
        let file = tracker.insert(BinaryFile::new(&ext, &ext, BinaryKind::Extension, BinaryFormat::Elf));
        file.target = Some(td.path().join("dist/lib/_ext.so"));
        file.references = vec![copied_reference("libfoo.so.1", &a), copied_reference("libfoo.so.1", &b)];
        dependency(&mut tracker, &a);
        dependency(&mut tracker, &b);

        let options = LayoutOptions {
            target_dir: td.path().join("dist"),
            lib_dir: td.path().join("dist/lib"),
        };
        let report = assign_targets(&mut tracker, BinaryFormat::Elf, &options)?;

        assert!(report.collisions.is_empty());
        assert_eq!(report.renamed.len(), 1);
        assert_eq!(
            tracker.get(&a).and_then(|f| f.target.clone()),
            Some(options.lib_dir.join("libfoo.so.1"))
        );
        let renamed = tracker.get(&b).expect("tracked");
        let new_name = renamed.new_soname.clone().expect("renamed");
        assert_eq!(renamed.target, Some(options.lib_dir.join(&new_name)));

        Ok(())
    }

    #[test]
    fn pe_collisions_keep_the_first() -> Result<(), BinaryError> {
        let td = tempfile::Builder::new()
            .prefix("tugger-binary-analysis-test")
            .tempdir()?;
        let a = td.path().join("a").join("zlib1.dll");
        let b = td.path().join("b").join("ZLIB1.dll");
        let pyd = td.path().join("_ext.pyd");

        let mut tracker = BinaryTracker::new();
        let file = tracker.insert(BinaryFile::new(&pyd, &pyd, BinaryKind::Extension, BinaryFormat::Pe));
        file.target = Some(td.path().join("dist/lib/_ext.pyd"));
        file.references = vec![copied_reference("zlib1.dll", &b)];
        for p in [&a, &b] {
            tracker.insert(BinaryFile::new(p, p, BinaryKind::Dependency, BinaryFormat::Pe));
        }

        let options = LayoutOptions {
            target_dir: td.path().join("dist"),
            lib_dir: td.path().join("dist/lib"),
        };
        let report = assign_targets(&mut tracker, BinaryFormat::Pe, &options)?;

        assert_eq!(report.collisions.len(), 1);
        assert_eq!(report.collisions[0].kept, a);
        assert_eq!(
            tracker.get(&a).and_then(|f| f.target.clone()),
            Some(options.target_dir.join("zlib1.dll"))
        );
        assert!(tracker.get(&b).expect("tracked").target.is_none());
        assert_eq!(
            tracker.get(&pyd).expect("tracked").references[0].target,
            Some(a.clone())
        );

        Ok(())
    }

    #[test]
    fn copies_missing_targets_only() -> Result<(), BinaryError> {
        let td = tempfile::Builder::new()
            .prefix("tugger-binary-analysis-test")
            .tempdir()?;
        let source = td.path().join("libfoo.so.1");
        std::fs::write(&source, "library")?;

        let mut tracker = BinaryTracker::new();
        dependency(&mut tracker, &source);
        let target = td.path().join("dist/lib/libfoo.so.1");
        if let Some(f) = tracker.get_mut(&source) {
            f.target = Some(target.clone());
        }

        assert_eq!(copy_binaries(&tracker)?, vec![target.clone()]);
        assert_eq!(std::fs::read(&target)?, b"library");
        assert!(copy_binaries(&tracker)?.is_empty());

        Ok(())
    }
}
