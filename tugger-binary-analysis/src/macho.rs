// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Mach-O load command reading and editing.

Universal binaries are handled by visiting every architecture slice. A
reference present in any slice is a reference of the file.
*/

use {
    crate::{
        binary::ParsedBinary,
        error::BinaryError,
        tools::{find_tool, run_tool},
        util::rewrite_file,
    },
    goblin::mach::{load_command::CommandVariant, Mach, MachO},
    log::debug,
    std::path::Path,
};

/// Offset and size of each Mach-O image within a file.
fn image_ranges(data: &[u8]) -> Result<Vec<(usize, usize)>, BinaryError> {
    match Mach::parse(data)? {
        Mach::Binary(_) => Ok(vec![(0, data.len())]),
        Mach::Fat(multiarch) => {
            let mut ranges = vec![];
            for arch in multiarch.iter_arches() {
                let arch = arch?;
                let (offset, size) = (arch.offset as usize, arch.size as usize);
                if offset + size > data.len() {
                    return Err(BinaryError::Malformed(
                        "universal binary slice out of bounds".into(),
                    ));
                }
                ranges.push((offset, size));
            }
            Ok(ranges)
        }
    }
}

fn read_c_string(data: &[u8], offset: usize) -> Result<String, BinaryError> {
    let region = data
        .get(offset..)
        .ok_or_else(|| BinaryError::Malformed("load command string out of bounds".into()))?;
    let len = region
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(region.len());

    Ok(String::from_utf8_lossy(&region[0..len]).to_string())
}

/// A load command string we may rewrite.
#[derive(Debug)]
struct LoadString {
    /// Absolute file offset of the string.
    offset: usize,
    /// Absolute file offset of the end of its load command.
    end: usize,
    value: String,
    is_id: bool,
}

fn dylib_strings(data: &[u8]) -> Result<Vec<LoadString>, BinaryError> {
    let mut strings = vec![];

    for (base, size) in image_ranges(data)? {
        let image = &data[base..base + size];
        let macho = MachO::parse(image, 0)?;

        for lc in &macho.load_commands {
            let (command, is_id) = match &lc.command {
                CommandVariant::LoadDylib(c)
                | CommandVariant::LoadWeakDylib(c)
                | CommandVariant::ReexportDylib(c)
                | CommandVariant::LazyLoadDylib(c)
                | CommandVariant::LoadUpwardDylib(c) => (c, false),
                CommandVariant::IdDylib(c) => (c, true),
                _ => continue,
            };

            let offset = lc.offset + command.dylib.name as usize;
            strings.push(LoadString {
                offset: base + offset,
                end: base + lc.offset + command.cmdsize as usize,
                value: read_c_string(image, offset)?,
                is_id,
            });
        }
    }

    Ok(strings)
}

/// Parse the load commands of a Mach-O or universal binary.
pub fn parse_macho(data: &[u8]) -> Result<ParsedBinary, BinaryError> {
    let mut parsed = ParsedBinary::default();

    for (base, size) in image_ranges(data)? {
        let image = &data[base..base + size];
        let macho = MachO::parse(image, 0)?;

        for lc in &macho.load_commands {
            match &lc.command {
                CommandVariant::LoadDylib(c)
                | CommandVariant::LoadWeakDylib(c)
                | CommandVariant::ReexportDylib(c)
                | CommandVariant::LazyLoadDylib(c)
                | CommandVariant::LoadUpwardDylib(c) => {
                    let name = read_c_string(image, lc.offset + c.dylib.name as usize)?;
                    if !parsed.references.contains(&name) {
                        parsed.references.push(name);
                    }
                }
                CommandVariant::IdDylib(c) => {
                    parsed.soname = Some(read_c_string(image, lc.offset + c.dylib.name as usize)?);
                }
                CommandVariant::Rpath(c) => {
                    let path = read_c_string(image, lc.offset + c.path as usize)?;
                    if !parsed.rpaths.contains(&path) {
                        parsed.rpaths.push(path);
                    }
                }
                CommandVariant::CodeSignature(_) => {
                    parsed.code_signature = true;
                }
                _ => {}
            }
        }
    }

    Ok(parsed)
}

/// Changes to make to the load commands of a Mach-O binary.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MachOEdits {
    /// Library references to change, old to new.
    pub changes: Vec<(String, String)>,
    /// New install name.
    pub id: Option<String>,
}

impl MachOEdits {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.id.is_none()
    }

    /// Arguments to make `install_name_tool` perform these edits.
    pub fn install_name_tool_args(&self) -> Vec<String> {
        let mut args = vec![];

        for (old, new) in &self.changes {
            args.push("-change".to_string());
            args.push(old.clone());
            args.push(new.clone());
        }
        if let Some(id) = &self.id {
            args.push("-id".to_string());
            args.push(id.clone());
        }

        args
    }
}

/// Apply edits to Mach-O data without changing its size.
///
/// Returns `false` without modifying anything if a new string does not fit
/// in its load command.
pub fn edit_in_place(data: &mut [u8], edits: &MachOEdits) -> Result<bool, BinaryError> {
    let strings = dylib_strings(data)?;
    let mut writes = vec![];

    for s in &strings {
        let new = if s.is_id {
            edits.id.as_deref()
        } else {
            edits
                .changes
                .iter()
                .find(|(old, _)| *old == s.value)
                .map(|(_, new)| new.as_str())
        };

        if let Some(new) = new {
            if s.offset + new.len() + 1 > s.end {
                return Ok(false);
            }
            writes.push((s.offset, s.end, new));
        }
    }

    for (offset, end, new) in writes {
        data[offset..end].fill(0);
        data[offset..offset + new.len()].copy_from_slice(new.as_bytes());
    }

    Ok(true)
}

/// Apply edits to a Mach-O file, atomically.
///
/// Edits that do not fit are delegated to `install_name_tool`.
pub fn apply_edits(path: &Path, edits: &MachOEdits) -> Result<(), BinaryError> {
    if edits.is_empty() {
        return Ok(());
    }

    rewrite_file(path, |temp| {
        let mut data = std::fs::read(temp)?;
        if edit_in_place(&mut data, edits)? {
            debug!("rewrote {} in place", path.display());
            std::fs::write(temp, &data)?;
            Ok(())
        } else {
            let tool = find_tool(
                "install_name_tool",
                None,
                "install the Xcode command line tools",
            )?;
            let mut args = edits.install_name_tool_args();
            args.push(temp.display().to_string());
            run_tool(&tool, args)?;
            Ok(())
        }
    })
}

/// Apply an ad-hoc code signature to a file.
///
/// Modifying a Mach-O binary invalidates its signature and unsigned code does
/// not run on Apple silicon, so a missing `codesign` is an error.
pub fn adhoc_sign(path: &Path) -> Result<(), BinaryError> {
    let codesign = find_tool(
        "codesign",
        None,
        "modified Mach-O binaries must be re-signed; install the Xcode command line tools",
    )?;

    run_tool(
        &codesign,
        [
            "--sign".into(),
            "-".into(),
            "--force".into(),
            path.as_os_str().to_os_string(),
        ],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testutil::{fat_macho, MachOBuilder, CPU_TYPE_ARM64},
    };

    #[test]
    fn parse_thin() -> Result<(), BinaryError> {
        let data = MachOBuilder::new()
            .id("/usr/local/lib/libfoo.1.dylib")
            .load("@rpath/libbar.dylib")
            .load_weak("/usr/lib/libSystem.B.dylib")
            .reexport("@loader_path/libbaz.dylib")
            .rpath("@loader_path/../lib")
            .code_signature()
            .build();

        let parsed = parse_macho(&data)?;
        assert_eq!(
            parsed.references,
            vec![
                "@rpath/libbar.dylib",
                "/usr/lib/libSystem.B.dylib",
                "@loader_path/libbaz.dylib"
            ]
        );
        assert_eq!(parsed.rpaths, vec!["@loader_path/../lib"]);
        assert_eq!(parsed.soname.as_deref(), Some("/usr/local/lib/libfoo.1.dylib"));
        assert!(parsed.code_signature);

        Ok(())
    }

    #[test]
    fn parse_universal() -> Result<(), BinaryError> {
        let x86 = MachOBuilder::new()
            .load("@rpath/libcommon.dylib")
            .load("/opt/x86/libonly.dylib")
            .build();
        let arm = MachOBuilder::new()
            .cputype(CPU_TYPE_ARM64)
            .load("@rpath/libcommon.dylib")
            .load("/opt/arm/libonly.dylib")
            .build();

        let parsed = parse_macho(&fat_macho(&[x86, arm]))?;
        assert_eq!(
            parsed.references,
            vec![
                "@rpath/libcommon.dylib",
                "/opt/x86/libonly.dylib",
                "/opt/arm/libonly.dylib"
            ]
        );
        assert!(!parsed.code_signature);

        Ok(())
    }

    #[test]
    fn in_place_change() -> Result<(), BinaryError> {
        let mut data = MachOBuilder::new()
            .executable()
            .spare(16)
            .load("/opt/homebrew/lib/libfoo.dylib")
            .load("/usr/lib/libSystem.B.dylib")
            .build();

        let edits = MachOEdits {
            changes: vec![(
                "/opt/homebrew/lib/libfoo.dylib".to_string(),
                "@executable_path/lib/libfoo.dylib".to_string(),
            )],
            id: None,
        };
        assert!(edit_in_place(&mut data, &edits)?);

        let parsed = parse_macho(&data)?;
        assert_eq!(
            parsed.references,
            vec!["@executable_path/lib/libfoo.dylib", "/usr/lib/libSystem.B.dylib"]
        );

        Ok(())
    }

    #[test]
    fn in_place_universal() -> Result<(), BinaryError> {
        let slice = |cpu| {
            MachOBuilder::new()
                .cputype(cpu)
                .spare(32)
                .load("libfoo.dylib")
                .build()
        };
        let mut data = fat_macho(&[slice(0x0100_0007), slice(CPU_TYPE_ARM64)]);

        let edits = MachOEdits {
            changes: vec![(
                "libfoo.dylib".to_string(),
                "@executable_path/lib/libfoo.dylib".to_string(),
            )],
            id: None,
        };
        assert!(edit_in_place(&mut data, &edits)?);
        assert_eq!(
            parse_macho(&data)?.references,
            vec!["@executable_path/lib/libfoo.dylib"]
        );

        Ok(())
    }

    #[test]
    fn oversized_change_is_refused() -> Result<(), BinaryError> {
        let mut data = MachOBuilder::new().load("libfoo.dylib").build();
        let snapshot = data.clone();

        let edits = MachOEdits {
            changes: vec![(
                "libfoo.dylib".to_string(),
                "@executable_path/a/very/long/path/libfoo.dylib".to_string(),
            )],
            id: None,
        };
        assert!(!edit_in_place(&mut data, &edits)?);
        assert_eq!(data, snapshot);
        assert_eq!(
            edits.install_name_tool_args(),
            vec![
                "-change",
                "libfoo.dylib",
                "@executable_path/a/very/long/path/libfoo.dylib"
            ]
        );

        Ok(())
    }
}
