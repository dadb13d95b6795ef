// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Launcher base templates.

Bases are prebuilt launcher executables installed in a bases directory as
`<kind>-<abi>-<platform>[.exe]`, e.g. `console-cpython-312-linux_x86_64`.
*/

use {
    crate::error::FreezeError,
    python_packaging::interpreter::PythonInterpreterInfo,
    std::{
        fmt::{Display, Formatter},
        path::{Path, PathBuf},
    },
};

/// Flavor of launcher.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BaseKind {
    /// Attached to a console.
    Console,
    /// Windows GUI subsystem; no console window.
    Gui,
    /// Windows service.
    Service,
}

impl Display for BaseKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Console => "console",
            Self::Gui => "gui",
            Self::Service => "service",
        })
    }
}

impl BaseKind {
    pub fn from_name(name: &str) -> Result<Self, FreezeError> {
        match name.to_ascii_lowercase().as_str() {
            "console" => Ok(Self::Console),
            "gui" | "win32gui" => Ok(Self::Gui),
            "service" | "win32service" => Ok(Self::Service),
            _ => Err(FreezeError::config(format!(
                "unknown base {}; use console, gui or service",
                name
            ))),
        }
    }

    /// The kind actually used on a platform.
    ///
    /// GUI launchers only differ from console launchers on Windows.
    pub fn for_platform(self, windows: bool) -> Result<Self, FreezeError> {
        match (self, windows) {
            (Self::Gui, false) => Ok(Self::Console),
            (Self::Service, false) => Err(FreezeError::config(
                "the service base is only available on Windows",
            )),
            (kind, _) => Ok(kind),
        }
    }
}

/// File name of the base template for an interpreter.
pub fn template_name(kind: BaseKind, interpreter: &PythonInterpreterInfo) -> String {
    let name = format!(
        "{}-{}-{}",
        kind,
        interpreter.abi_tag(),
        interpreter.platform_tag()
    );

    if interpreter.is_windows() {
        format!("{}.exe", name)
    } else {
        name
    }
}

/// Locate the base template for a launcher.
pub fn find_base(
    bases_dir: &Path,
    kind: BaseKind,
    interpreter: &PythonInterpreterInfo,
) -> Result<PathBuf, FreezeError> {
    let kind = kind.for_platform(interpreter.is_windows())?;
    let path = bases_dir.join(template_name(kind, interpreter));

    if path.is_file() {
        Ok(path)
    } else {
        Err(FreezeError::file(&path, "launcher base not found"))
    }
}

/// File name of a launcher in the target directory.
pub fn executable_file_name(stem: &str, interpreter: &PythonInterpreterInfo) -> String {
    if interpreter.is_windows() {
        format!("{}.exe", stem)
    } else {
        stem.to_string()
    }
}
