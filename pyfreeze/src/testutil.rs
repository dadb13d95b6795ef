// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixtures for freezing against a fake Linux interpreter.

use {
    crate::{
        config::{Executable, FreezerConfig, Metadata, ProjectConfig},
        freezer::FreezeContext,
    },
    anyhow::Result,
    python_packaging::{interpreter::PythonInterpreterInfo, testutil::FakeBytecodeCompiler},
    std::path::{Path, PathBuf},
    tugger_binary_analysis::{testutil::ElfBuilder, ElfBackend, ElfDependencies},
};

pub const LIBPYTHON: &str = "libpython3.12.so.1.0";
pub const CONSOLE_BASE: &str = "console-cpython-312-linux_x86_64";

fn json_path(path: &Path) -> String {
    format!("{:?}", path.display().to_string())
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}

/// A CPython 3.12 installation rooted at `<root>/py`.
///
/// The installation holds a shared libpython and a tiny standard library.
pub fn linux_interpreter(root: &Path) -> Result<PythonInterpreterInfo> {
    let prefix = root.join("py");
    let libdir = prefix.join("lib");
    let stdlib = prefix.join("stdlib");

    write_file(
        &libdir.join(LIBPYTHON),
        &ElfBuilder::new().soname(LIBPYTHON).build(),
    )?;
    write_file(&stdlib.join("encodings").join("__init__.py"), b"import codecs\n")?;
    write_file(&stdlib.join("os.py"), b"import sys\n")?;

    let json = format!(
        r#"{{
        "version": "3.12.1", "major": 3, "minor": 12,
        "implementation": "cpython", "cache_tag": "cpython-312",
        "magic_number": 168627659,
        "executable": {executable},
        "prefix": {prefix}, "base_prefix": {prefix}, "exec_prefix": {prefix},
        "libdir": {libdir}, "destlib": {stdlib},
        "ldlibrary": "libpython3.12.so", "instsoname": "{libpython}",
        "stdlib": {stdlib}, "platstdlib": {stdlib},
        "purelib": null, "platlib": null,
        "sys_path": [{stdlib}],
        "source_suffixes": [".py"],
        "bytecode_suffixes": [".pyc"],
        "extension_suffixes": [".cpython-312-x86_64-linux-gnu.so", ".abi3.so", ".so"],
        "builtin_module_names": ["_imp", "builtins", "sys"],
        "frozen_module_names": ["_frozen_importlib", "zipimport"],
        "platform": "linux-x86_64",
        "soabi": "cpython-312-x86_64-linux-gnu",
        "abiflags": "",
        "dll_name": null
    }}"#,
        executable = json_path(&prefix.join("bin").join("python3.12")),
        prefix = json_path(&prefix),
        libdir = json_path(&libdir),
        stdlib = json_path(&stdlib),
        libpython = LIBPYTHON,
    );

    PythonInterpreterInfo::from_json(json.as_bytes())
}

/// A scratch tree with a fake interpreter, a bases directory and a project.
pub struct Fixture {
    _td: tempfile::TempDir,
    pub root: PathBuf,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        let td = tempfile::Builder::new().prefix("pyfreeze-test").tempdir()?;
        let root = td.path().to_path_buf();

        linux_interpreter(&root)?;
        write_file(
            &root.join("bases").join(CONSOLE_BASE),
            &ElfBuilder::new()
                .needed(LIBPYTHON)
                .runpath("$ORIGIN/lib")
                .build(),
        )?;
        std::fs::create_dir_all(root.join("project"))?;

        Ok(Self { _td: td, root })
    }

    pub fn write(&self, rel: &str, content: &str) -> Result<()> {
        self.write_bytes(rel, content.as_bytes())
    }

    pub fn write_bytes(&self, rel: &str, data: &[u8]) -> Result<()> {
        write_file(&self.root.join(rel), data)
    }

    pub fn stdlib(&self) -> PathBuf {
        self.root.join("py").join("stdlib")
    }

    pub fn context(&self) -> Result<FreezeContext> {
        Ok(FreezeContext {
            interpreter: linux_interpreter(&self.root)?,
            compiler: Box::new(FakeBytecodeCompiler::default()),
            backend: Box::new(ElfBackend::new(ElfDependencies::Parse)),
        })
    }

    /// A project in `<root>/project` building into `<root>/dist`.
    ///
    /// Scripts are resolved against the project directory.
    pub fn project(&self, mut config: FreezerConfig, executables: Vec<Executable>) -> ProjectConfig {
        let project_dir = self.root.join("project");

        if config.target_dir.is_none() {
            config.target_dir = Some(self.root.join("dist"));
        }
        if config.bases_dir.is_none() {
            config.bases_dir = Some(self.root.join("bases"));
        }

        let executables = executables
            .into_iter()
            .map(|mut exe| {
                exe.script = project_dir.join(&exe.script);
                exe
            })
            .collect();

        ProjectConfig {
            project_dir,
            metadata: Metadata::default(),
            build_exe: config,
            executables,
        }
    }
}

/// Names of the members of a zip file.
pub fn read_zip_names(path: &Path) -> Result<Vec<String>> {
    let archive = zip::ZipArchive::new(std::fs::File::open(path)?)?;
    Ok(archive.file_names().map(|s| s.to_string()).collect())
}
