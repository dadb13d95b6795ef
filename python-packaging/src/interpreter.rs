// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Functionality related to inspecting the Python interpreter being frozen. */

use {
    crate::bytecode::PythonVersion,
    anyhow::{anyhow, Context, Result},
    serde::Deserialize,
    std::{
        path::{Path, PathBuf},
        process,
    },
};

const INTERPRETER_INFO_SCRIPT: &str = include_str!("interpreter_info.py");

/// Facts about a Python interpreter, as reported by the interpreter itself.
#[derive(Clone, Debug, Deserialize)]
pub struct PythonInterpreterInfo {
    pub version: String,
    pub major: u8,
    pub minor: u8,
    pub implementation: String,
    /// e.g. `cpython-312`.
    pub cache_tag: String,
    pub magic_number: u32,
    pub executable: PathBuf,
    pub prefix: PathBuf,
    pub base_prefix: PathBuf,
    pub exec_prefix: PathBuf,
    pub libdir: Option<PathBuf>,
    pub destlib: Option<PathBuf>,
    /// Name of the library libpython is linked as.
    pub ldlibrary: Option<String>,
    pub instsoname: Option<String>,
    pub stdlib: Option<PathBuf>,
    pub platstdlib: Option<PathBuf>,
    pub purelib: Option<PathBuf>,
    pub platlib: Option<PathBuf>,
    pub sys_path: Vec<PathBuf>,
    pub source_suffixes: Vec<String>,
    pub bytecode_suffixes: Vec<String>,
    pub extension_suffixes: Vec<String>,
    pub builtin_module_names: Vec<String>,
    pub frozen_module_names: Vec<String>,
    /// `sysconfig.get_platform()`, e.g. `linux-x86_64`.
    pub platform: String,
    pub soabi: String,
    pub abiflags: String,
    pub dll_name: Option<String>,
}

impl PythonInterpreterInfo {
    /// Obtain information by running an interpreter.
    pub fn from_interpreter(python: &Path) -> Result<Self> {
        let output = process::Command::new(python)
            .arg("-c")
            .arg(INTERPRETER_INFO_SCRIPT)
            .stdin(process::Stdio::null())
            .output()
            .with_context(|| format!("running {}", python.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "{} exited with {}: {}",
                python.display(),
                output.status,
                stderr.lines().last().unwrap_or_default()
            ));
        }

        Self::from_json(&output.stdout)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let info: Self =
            serde_json::from_slice(data).context("parsing interpreter information JSON")?;

        if info.implementation != "cpython" {
            return Err(anyhow!(
                "only CPython can be frozen; found {}",
                info.implementation
            ));
        }

        Ok(info)
    }

    pub fn python_version(&self) -> PythonVersion {
        PythonVersion::new(self.major, self.minor)
    }

    /// Tag identifying the interpreter ABI in launcher base names.
    pub fn abi_tag(&self) -> String {
        self.cache_tag.clone()
    }

    /// Platform tag usable in file names.
    pub fn platform_tag(&self) -> String {
        self.platform.replace(['-', '.'], "_")
    }

    pub fn is_windows(&self) -> bool {
        self.platform.starts_with("win")
    }

    pub fn is_macos(&self) -> bool {
        self.platform.starts_with("macosx")
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtin_module_names.iter().any(|n| n == name)
    }

    pub fn is_frozen(&self, name: &str) -> bool {
        self.frozen_module_names.iter().any(|n| n == name)
    }

    /// File name of the shared library holding the interpreter, if any.
    pub fn libpython_name(&self) -> Option<String> {
        if let Some(dll) = &self.dll_name {
            return Some(dll.clone());
        }

        self.instsoname
            .clone()
            .or_else(|| self.ldlibrary.clone())
            .filter(|name| !name.ends_with(".a"))
    }

    /// Directories the module finder searches by default.
    ///
    /// Ordering follows `sys.path`. Entries that do not exist are dropped.
    pub fn module_search_path(&self) -> Vec<PathBuf> {
        self.sys_path
            .iter()
            .filter(|p| p.is_dir())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const LINUX_INFO: &str = r#"{
        "version": "3.12.1", "major": 3, "minor": 12,
        "implementation": "cpython", "cache_tag": "cpython-312",
        "magic_number": 168627659,
        "executable": "/usr/bin/python3.12",
        "prefix": "/usr", "base_prefix": "/usr", "exec_prefix": "/usr",
        "libdir": "/usr/lib", "destlib": "/usr/lib/python3.12",
        "ldlibrary": "libpython3.12.so", "instsoname": "libpython3.12.so.1.0",
        "stdlib": "/usr/lib/python3.12", "platstdlib": "/usr/lib/python3.12",
        "purelib": "/usr/lib/python3.12/site-packages",
        "platlib": "/usr/lib/python3.12/site-packages",
        "sys_path": ["/usr/lib/python312.zip", "/usr/lib/python3.12"],
        "source_suffixes": [".py"], "bytecode_suffixes": [".pyc"],
        "extension_suffixes": [".cpython-312-x86_64-linux-gnu.so", ".abi3.so", ".so"],
        "builtin_module_names": ["_imp", "builtins", "sys"],
        "frozen_module_names": ["_frozen_importlib", "zipimport"],
        "platform": "linux-x86_64", "soabi": "cpython-312-x86_64-linux-gnu",
        "abiflags": "", "dll_name": null
    }"#;

    #[test]
    fn parse_json() -> Result<()> {
        let info = PythonInterpreterInfo::from_json(LINUX_INFO.as_bytes())?;

        assert_eq!(info.python_version(), PythonVersion::new(3, 12));
        assert_eq!(
            PythonVersion::from_magic_number(info.magic_number)?,
            info.python_version()
        );
        assert_eq!(info.platform_tag(), "linux_x86_64");
        assert_eq!(info.abi_tag(), "cpython-312");
        assert_eq!(info.libpython_name(), Some("libpython3.12.so.1.0".to_string()));
        assert!(info.is_builtin("sys"));
        assert!(info.is_frozen("zipimport"));
        assert!(!info.is_windows());

        let pypy = LINUX_INFO.replace("\"cpython\"", "\"pypy\"");
        assert!(PythonInterpreterInfo::from_json(pypy.as_bytes()).is_err());

        Ok(())
    }
}
