// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Writing the bytecode archive of a frozen application.

The archive is a zip file importable by `zipimport`. Each module is stored
as `a/b.pyc` (or `a/b/__init__.pyc` for packages) holding a standard `.pyc`
header followed by the marshalled code object. Entries are written in sorted
order with a fixed timestamp so identical inputs produce identical archives.
*/

use {
    crate::{
        bytecode::{compute_bytecode_header, BytecodeHeaderMode, PythonVersion},
        marshal::{dumps_code, CodeObject},
        module::Module,
        module_util::module_relative_path,
        package_metadata::Distribution,
    },
    anyhow::{anyhow, Context, Result},
    log::debug,
    std::{
        collections::BTreeMap,
        io::{Seek, Write},
        path::Path,
    },
    zip::CompressionMethod,
};

/// Header values for a module's `.pyc`: source modification time and size.
fn module_header_fields(module: &Module) -> (u32, u32) {
    if let Some(source) = &module.generated_source {
        return (0, source.len() as u32);
    }

    module
        .file
        .as_ref()
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|md| {
            let mtime = md
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0);
            (mtime, md.len() as u32)
        })
        .unwrap_or((0, 0))
}

/// Serialize a code object as `.pyc` file content.
pub fn pyc_data(code: &CodeObject, version: PythonVersion, mtime: u32, source_size: u32) -> Result<Vec<u8>> {
    let mut data = compute_bytecode_header(
        version.magic_number()?,
        BytecodeHeaderMode::ModifiedTimeAndSourceSize((mtime, source_size)),
    )?;
    data.extend(dumps_code(code, version)?);

    Ok(data)
}

/// `.pyc` file content for a discovered module.
pub fn module_pyc_data(module: &Module, version: PythonVersion) -> Result<Vec<u8>> {
    let code = module
        .code
        .as_ref()
        .ok_or_else(|| anyhow!("module {} has no code", module.name))?;
    let (mtime, size) = module_header_fields(module);

    pyc_data(code, version, mtime, size)
}

/// Relative path of a module's `.pyc` inside the archive or `lib` directory.
pub fn module_pyc_path(module: &Module) -> String {
    module_relative_path(&module.name, module.is_package(), ".pyc")
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Collects archive members and writes them out.
pub struct ArchiveBuilder {
    version: PythonVersion,
    compression_method: CompressionMethod,
    modified_time: time::OffsetDateTime,
    entries: BTreeMap<String, Vec<u8>>,
}

impl ArchiveBuilder {
    pub fn new(version: PythonVersion, compress: bool) -> Self {
        Self {
            version,
            compression_method: if compress {
                CompressionMethod::Deflated
            } else {
                CompressionMethod::Stored
            },
            modified_time: time::macros::datetime!(1980-01-01 0:00 UTC),
            entries: BTreeMap::new(),
        }
    }

    /// Obtain the modified time written for archive members.
    pub fn modified_time(&self) -> &time::OffsetDateTime {
        &self.modified_time
    }

    pub fn set_modified_time(&mut self, value: time::OffsetDateTime) {
        self.modified_time = value;
    }

    /// Names of archive members, sorted.
    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, name: String, data: Vec<u8>) {
        if self.entries.contains_key(&name) {
            debug!("archive member {} already present; keeping the first", name);
            return;
        }
        self.entries.insert(name, data);
    }

    /// Add a module's compiled code.
    pub fn add_module(&mut self, module: &Module) -> Result<()> {
        let data = module_pyc_data(module, self.version)?;
        self.insert(module_pyc_path(module), data);

        Ok(())
    }

    /// Add a file, or every file below a directory, under `target`.
    pub fn add_path(&mut self, source: &Path, target: &str) -> Result<()> {
        let target = target.trim_matches('/');

        if source.is_dir() {
            for entry in walkdir::WalkDir::new(source).sort_by_file_name() {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }

                let rel = entry.path().strip_prefix(source)?;
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/");
                let data = std::fs::read(entry.path())
                    .with_context(|| format!("reading {}", entry.path().display()))?;
                self.insert(format!("{}/{}", target, rel), data);
            }
        } else {
            let data =
                std::fs::read(source).with_context(|| format!("reading {}", source.display()))?;
            self.insert(target.to_string(), data);
        }

        Ok(())
    }

    /// Add raw data.
    pub fn add_data(&mut self, target: &str, data: Vec<u8>) {
        self.insert(target.trim_matches('/').to_string(), data);
    }

    /// Preserve a distribution's metadata directory.
    pub fn add_distribution(&mut self, dist: &Distribution) -> Result<()> {
        for (source, rel) in dist.metadata_files()? {
            let target = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");
            self.add_path(&source, &target)?;
        }

        Ok(())
    }

    /// Write the archive to a writer.
    pub fn write_to(&self, writer: &mut (impl Write + Seek)) -> Result<()> {
        let mut zf = zip::ZipWriter::new(writer);

        let modified_time = zip::DateTime::from_date_and_time(
            self.modified_time.year() as u16,
            self.modified_time.month() as u8,
            self.modified_time.day(),
            self.modified_time.hour(),
            self.modified_time.minute(),
            self.modified_time.second(),
        )
        .map_err(|_| anyhow!("could not convert time to zip::DateTime"))?;

        for (name, data) in &self.entries {
            let options = zip::write::FileOptions::default()
                .compression_method(self.compression_method)
                .unix_permissions(0o644)
                .last_modified_time(modified_time);

            zf.start_file(name.as_str(), options)?;
            zf.write_all(data)
                .with_context(|| format!("writing zip member {}", name))?;
        }

        zf.finish().context("finishing zip file")?;

        Ok(())
    }

    /// Write the archive to a filesystem path.
    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("creating parent directory")?;
        }

        let mut fh = std::fs::File::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        self.write_to(&mut fh)
            .with_context(|| format!("writing {}", path.display()))?;

        Ok(())
    }
}
