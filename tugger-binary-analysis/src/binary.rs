// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Core binary data model. */

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    io::Read,
    path::{Path, PathBuf},
};

/// Object file formats we know how to walk.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BinaryFormat {
    Elf,
    MachO,
    Pe,
}

impl Display for BinaryFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Elf => "ELF",
            Self::MachO => "Mach-O",
            Self::Pe => "PE",
        })
    }
}

impl BinaryFormat {
    /// The format native to the platform we were compiled for.
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::Pe
        } else if cfg!(target_os = "macos") {
            Self::MachO
        } else {
            Self::Elf
        }
    }

    /// Detect the format of binary data from its magic bytes.
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }

        let magic = [data[0], data[1], data[2], data[3]];
        match magic {
            [0x7f, b'E', b'L', b'F'] => Some(Self::Elf),
            [0xfe, 0xed, 0xfa, 0xce]
            | [0xce, 0xfa, 0xed, 0xfe]
            | [0xfe, 0xed, 0xfa, 0xcf]
            | [0xcf, 0xfa, 0xed, 0xfe] => Some(Self::MachO),
            // Universal binaries share this magic with Java class files, which
            // carry a major version of at least 45 where a fat header would
            // carry a small architecture count.
            [0xca, 0xfe, 0xba, 0xbe] if data.len() >= 8 => {
                let count = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
                if count > 0 && count < 45 {
                    Some(Self::MachO)
                } else {
                    None
                }
            }
            _ if tugger_windows::is_pe_header(data) => Some(Self::Pe),
            _ => None,
        }
    }

    /// Detect the format of a file by reading its header.
    pub fn detect_path(path: &Path) -> Option<Self> {
        let mut header = [0u8; 64];
        let mut fh = std::fs::File::open(path).ok()?;
        let mut read = 0;
        while read < header.len() {
            match fh.read(&mut header[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(_) => return None,
            }
        }

        Self::detect(&header[0..read])
    }
}

/// Why a binary is part of an application.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BinaryKind {
    Launcher,
    Extension,
    Dependency,
}

/// The load-relevant content of a parsed binary.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ParsedBinary {
    /// Library references in load table order, as written in the binary.
    pub references: Vec<String>,
    /// Raw search path entries (RUNPATH/RPATH or `LC_RPATH`), tokens unexpanded.
    pub rpaths: Vec<String>,
    /// Name the binary identifies itself by, if any.
    pub soname: Option<String>,
    /// Locations an external resolver already found for references.
    pub hints: BTreeMap<String, PathBuf>,
    /// Whether the binary carries a code signature.
    pub code_signature: bool,
}

/// An edge from a binary to a library it loads.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reference {
    /// The string stored in the binary.
    pub raw: String,
    /// Real path of the file the reference resolved to.
    pub resolved: Option<PathBuf>,
    /// Key of the tracked file the reference points at after layout.
    pub target: Option<PathBuf>,
    /// Whether the referenced file is bundled.
    pub copied: bool,
}

impl Reference {
    pub fn unresolved(raw: impl ToString) -> Self {
        Self {
            raw: raw.to_string(),
            resolved: None,
            target: None,
            copied: false,
        }
    }

    /// The file name portion of the raw reference.
    pub fn basename(&self) -> &str {
        reference_basename(&self.raw)
    }
}

/// File name portion of a reference string, handling both separators.
pub fn reference_basename(raw: &str) -> &str {
    raw.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(raw)
}

/// A binary tracked for bundling.
#[derive(Clone, Debug)]
pub struct BinaryFile {
    /// Path the binary was found at.
    pub source: PathBuf,
    /// Canonical path of the binary. Tracked files are keyed by this.
    pub real_path: PathBuf,
    /// Where the binary is placed in the output directory.
    pub target: Option<PathBuf>,
    pub kind: BinaryKind,
    pub format: BinaryFormat,
    pub references: Vec<Reference>,
    /// Search path entries with tokens expanded.
    pub rpaths: Vec<PathBuf>,
    /// Name the binary identifies itself by.
    pub soname: Option<String>,
    /// Replacement identity assigned when the binary was renamed on copy.
    pub new_soname: Option<String>,
}

impl BinaryFile {
    pub fn new(source: &Path, real_path: &Path, kind: BinaryKind, format: BinaryFormat) -> Self {
        Self {
            source: source.to_path_buf(),
            real_path: real_path.to_path_buf(),
            target: None,
            kind,
            format,
            references: vec![],
            rpaths: vec![],
            soname: None,
            new_soname: None,
        }
    }

    /// File name the binary is known by in the output.
    pub fn target_name(&self) -> Option<String> {
        self.target.as_deref().map(crate::util::file_name)
    }
}

/// Strip version components from a shared library file name.
///
/// `libfoo.so.1.2` becomes `libfoo.so` and `libfoo.1.2.dylib` becomes
/// `libfoo.dylib`. Other names are returned unchanged.
pub fn strip_library_version(name: &str) -> String {
    if let Some(pos) = name.find(".so.") {
        return name[0..pos + 3].to_string();
    }

    if let Some(stem) = name.strip_suffix(".dylib") {
        let mut parts = stem.split('.').collect::<Vec<_>>();
        while parts.len() > 1
            && parts
                .last()
                .map(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false)
        {
            parts.pop();
        }
        return format!("{}.dylib", parts.join("."));
    }

    name.to_string()
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testutil::ElfBuilder};

    #[test]
    fn detect_formats() {
        let elf = ElfBuilder::new().needed("libc.so.6").build();
        assert_eq!(BinaryFormat::detect(&elf), Some(BinaryFormat::Elf));

        let pe = tugger_windows::testutil::PeBuilder::new().build();
        assert_eq!(BinaryFormat::detect(&pe), Some(BinaryFormat::Pe));

        assert_eq!(
            BinaryFormat::detect(&[0xcf, 0xfa, 0xed, 0xfe, 0, 0, 0, 0]),
            Some(BinaryFormat::MachO)
        );
        assert_eq!(
            BinaryFormat::detect(&[0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 2]),
            Some(BinaryFormat::MachO)
        );
        // Java class file, major version 52.
        assert_eq!(
            BinaryFormat::detect(&[0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 52]),
            None
        );
        assert_eq!(BinaryFormat::detect(b"#!/bin/sh\n"), None);
        assert_eq!(BinaryFormat::detect(b"ab"), None);
    }

    #[test]
    fn version_stripping() {
        assert_eq!(strip_library_version("libfoo.so.1.2.3"), "libfoo.so");
        assert_eq!(strip_library_version("libfoo.so"), "libfoo.so");
        assert_eq!(strip_library_version("libfoo.1.2.dylib"), "libfoo.dylib");
        assert_eq!(strip_library_version("libssl.1.1.dylib"), "libssl.dylib");
        assert_eq!(strip_library_version("python312.dll"), "python312.dll");
    }

    #[test]
    fn basenames() {
        assert_eq!(reference_basename("@rpath/libfoo.dylib"), "libfoo.dylib");
        assert_eq!(reference_basename("libc.so.6"), "libc.so.6");
        assert_eq!(reference_basename("C:\\x\\foo.dll"), "foo.dll");
    }
}
