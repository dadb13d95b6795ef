// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Installed distributions (`.dist-info` and `.egg-info` directories). */

use {
    anyhow::{anyhow, Context, Result},
    log::warn,
    mailparse::parse_mail,
    once_cell::sync::Lazy,
    regex::Regex,
    std::{
        collections::BTreeMap,
        path::{Component, Path, PathBuf},
    },
};

static RE_NAME_SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-_.]+").expect("static regex should compile"));

/// Normalize a distribution name so differently spelled names compare equal.
pub fn normalize_distribution_name(name: &str) -> String {
    RE_NAME_SEPARATORS
        .replace_all(&name.to_lowercase(), "_")
        .to_string()
}

/// Represents a Python METADATA or PKG-INFO file.
pub struct PythonPackageMetadata {
    headers: Vec<(String, String)>,
}

impl PythonPackageMetadata {
    /// Create an instance from data in a METADATA file.
    pub fn from_metadata(data: &[u8]) -> Result<PythonPackageMetadata> {
        let message = parse_mail(data).context("parsing metadata file")?;

        let headers = message
            .headers
            .iter()
            .map(|header| (header.get_key(), header.get_value()))
            .collect::<Vec<_>>();

        Ok(PythonPackageMetadata { headers })
    }

    /// Find the first value of a specified header.
    pub fn find_first_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.find_first_header("Name")
    }

    pub fn version(&self) -> Option<&str> {
        self.find_first_header("Version")
    }
}

/// An installed Python distribution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Distribution {
    pub name: String,
    pub version: String,
    /// The `.dist-info` or `.egg-info` directory.
    pub metadata_path: PathBuf,
    /// Tool that installed the distribution (contents of `INSTALLER`).
    pub installer: Option<String>,
    /// Installed files, relative to the directory holding `metadata_path`.
    pub files: Vec<PathBuf>,
    /// Top-level import names provided by the distribution.
    pub top_level: Vec<String>,
}

impl Distribution {
    pub fn normalized_name(&self) -> String {
        normalize_distribution_name(&self.name)
    }

    /// Load a distribution from its metadata directory.
    pub fn from_metadata_dir(path: &Path) -> Result<Self> {
        let dir_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("invalid metadata directory {}", path.display()))?;

        let metadata_file = if dir_name.ends_with(".dist-info") {
            path.join("METADATA")
        } else {
            path.join("PKG-INFO")
        };

        let data = std::fs::read(&metadata_file)
            .with_context(|| format!("reading {}", metadata_file.display()))?;
        let metadata = PythonPackageMetadata::from_metadata(&data)?;

        let name = metadata
            .name()
            .ok_or_else(|| anyhow!("{} lacks a Name", metadata_file.display()))?
            .to_string();
        let version = metadata
            .version()
            .ok_or_else(|| anyhow!("{} lacks a Version", metadata_file.display()))?
            .to_string();

        let installer = std::fs::read_to_string(path.join("INSTALLER"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let files = match std::fs::read_to_string(path.join("RECORD")) {
            Ok(record) => parse_record(&record),
            Err(_) => match std::fs::read_to_string(path.join("installed-files.txt")) {
                // installed-files.txt paths are relative to the egg-info directory.
                Ok(listing) => listing
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .filter_map(|l| normalize_relative(&Path::new(dir_name).join(l.trim())))
                    .collect(),
                Err(_) => vec![],
            },
        };

        let top_level = match std::fs::read_to_string(path.join("top_level.txt")) {
            Ok(data) => data
                .lines()
                .map(|l| l.trim().replace('/', "."))
                .filter(|l| !l.is_empty())
                .collect(),
            Err(_) => top_level_from_files(&files),
        };

        Ok(Self {
            name,
            version,
            metadata_path: path.to_path_buf(),
            installer,
            files,
            top_level,
        })
    }

    /// Metadata files to preserve in a frozen application.
    ///
    /// Returns `(absolute path, path relative to the search root)`.
    pub fn metadata_files(&self) -> Result<Vec<(PathBuf, PathBuf)>> {
        let dir_name = self
            .metadata_path
            .file_name()
            .ok_or_else(|| anyhow!("invalid metadata directory"))?;

        let mut files = vec![];
        for entry in walkdir::WalkDir::new(&self.metadata_path).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() || entry.file_name() == "RECORD" {
                continue;
            }

            let rel = entry.path().strip_prefix(&self.metadata_path)?;
            files.push((entry.path().to_path_buf(), Path::new(dir_name).join(rel)));
        }

        Ok(files)
    }
}

/// Parse a `RECORD` file into the list of installed paths.
fn parse_record(data: &str) -> Vec<PathBuf> {
    data.lines()
        .filter_map(|line| {
            // path,hash,size where path may itself contain commas.
            let mut parts = line.rsplitn(3, ',');
            let _size = parts.next()?;
            let _hash = parts.next()?;
            let path = parts.next()?.trim_matches('"');
            if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            }
        })
        .collect()
}

/// Resolve `..` components without touching the filesystem.
fn normalize_relative(path: &Path) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = vec![];
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::CurDir => {}
            _ => return None,
        }
    }

    Some(parts.iter().collect())
}

fn top_level_from_files(files: &[PathBuf]) -> Vec<String> {
    let mut names = files
        .iter()
        .filter_map(|p| {
            let mut components = p.components();
            let first = components.next()?.as_os_str().to_str()?;
            let is_file = components.next().is_none();

            if first.ends_with(".dist-info")
                || first.ends_with(".egg-info")
                || first.ends_with(".data")
                || first == ".."
                || first == "__pycache__"
            {
                None
            } else if is_file {
                if let Some(stem) = first.strip_suffix(".py") {
                    Some(stem.to_string())
                } else if first.contains(".so") || first.ends_with(".pyd") {
                    first.split('.').next().map(|s| s.to_string())
                } else {
                    None
                }
            } else {
                Some(first.to_string())
            }
        })
        .collect::<Vec<_>>();

    names.sort();
    names.dedup();
    names
}

/// Index of distributions installed in a set of search roots.
#[derive(Clone, Debug, Default)]
pub struct DistributionIndex {
    distributions: BTreeMap<String, Distribution>,
    by_top_level: BTreeMap<String, String>,
}

impl DistributionIndex {
    /// Discover distributions in directories.
    ///
    /// Earlier roots take precedence when a distribution is installed twice.
    /// Unreadable metadata is logged and skipped.
    pub fn from_search_roots(roots: &[PathBuf]) -> Self {
        let mut index = Self::default();

        for root in roots {
            let mut entries = match std::fs::read_dir(root) {
                Ok(entries) => entries.filter_map(|e| e.ok()).collect::<Vec<_>>(),
                Err(_) => continue,
            };
            entries.sort_by_key(|e| e.file_name());

            for entry in entries {
                let path = entry.path();
                let is_metadata = path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .map(|s| s.ends_with(".dist-info") || s.ends_with(".egg-info"))
                    .unwrap_or(false);

                if !is_metadata || !path.is_dir() {
                    continue;
                }

                match Distribution::from_metadata_dir(&path) {
                    Ok(dist) => index.add(dist),
                    Err(e) => warn!("ignoring distribution at {}: {:#}", path.display(), e),
                }
            }
        }

        index
    }

    pub fn add(&mut self, dist: Distribution) {
        let key = dist.normalized_name();
        if self.distributions.contains_key(&key) {
            return;
        }

        for name in &dist.top_level {
            self.by_top_level
                .entry(name.clone())
                .or_insert_with(|| key.clone());
        }
        self.distributions.insert(key, dist);
    }

    pub fn get(&self, name: &str) -> Option<&Distribution> {
        self.distributions.get(&normalize_distribution_name(name))
    }

    /// The distribution providing a module, looked up by top-level name.
    pub fn for_module(&self, module: &str) -> Option<&Distribution> {
        let top = module.split('.').next()?;
        self.by_top_level
            .get(top)
            .and_then(|key| self.distributions.get(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Distribution> {
        self.distributions.values()
    }
}
