// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! ELF dynamic section reading and editing.

References come from `DT_NEEDED` entries and search paths from
`DT_RUNPATH` (or `DT_RPATH` when no `DT_RUNPATH` is present). Edits that fit
within the existing dynamic string table are applied in place. Everything
else is delegated to `patchelf`.
*/

use {
    crate::{
        binary::ParsedBinary,
        error::BinaryError,
        tools::{find_tool, run_tool},
        util::rewrite_file,
    },
    goblin::elf::{
        dynamic::{DT_NEEDED, DT_RPATH, DT_RUNPATH, DT_SONAME},
        program_header::PT_DYNAMIC,
        Elf,
    },
    log::debug,
    once_cell::sync::Lazy,
    regex::Regex,
    scroll::Pwrite,
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
    },
};

/// Environment variable naming the `patchelf` executable to use.
pub const PATCHELF_ENV: &str = "PYFREEZE_PATCHELF";

/// Environment variable selecting how ELF dependencies are discovered.
pub const ELF_DEPENDENCIES_ENV: &str = "PYFREEZE_ELF_DEPENDENCIES";

static LDD_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\S+)\s+=>\s+(.+?)(?:\s+\(0x[0-9a-fA-F]+\))?\s*$")
        .expect("static regex should compile")
});

/// Parse the dynamic section of an ELF binary.
pub fn parse_elf(data: &[u8]) -> Result<ParsedBinary, BinaryError> {
    let elf = Elf::parse(data)?;

    let search = if elf.runpaths.is_empty() {
        &elf.rpaths
    } else {
        &elf.runpaths
    };

    Ok(ParsedBinary {
        references: elf.libraries.iter().map(|s| s.to_string()).collect(),
        rpaths: search
            .iter()
            .flat_map(|s| s.split(':'))
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect(),
        soname: elf.soname.map(|s| s.to_string()),
        ..Default::default()
    })
}

/// Parse `ldd` output into a map of library name to resolved path.
///
/// Libraries `ldd` could not find are omitted.
pub fn parse_ldd_output(output: &str) -> BTreeMap<String, PathBuf> {
    output
        .lines()
        .filter_map(|line| {
            let caps = LDD_LINE.captures(line)?;
            let path = caps.get(2)?.as_str();
            if path == "not found" || !path.starts_with('/') {
                None
            } else {
                Some((caps[1].to_string(), PathBuf::from(path)))
            }
        })
        .collect()
}

/// Resolve the dependencies of an ELF file by running `ldd`.
pub fn ldd_dependencies(path: &Path) -> Result<BTreeMap<String, PathBuf>, BinaryError> {
    let ldd = find_tool("ldd", None, "ldd ships with the C library")?;
    Ok(parse_ldd_output(&run_tool(&ldd, [path.as_os_str()])?))
}

/// Changes to make to the dynamic section of an ELF binary.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ElfEdits {
    /// New `DT_RUNPATH` value.
    pub runpath: Option<String>,
    /// `DT_NEEDED` values to replace, old to new.
    pub replace_needed: Vec<(String, String)>,
    pub soname: Option<String>,
}

impl ElfEdits {
    pub fn is_empty(&self) -> bool {
        self.runpath.is_none() && self.replace_needed.is_empty() && self.soname.is_none()
    }

    /// Arguments to make `patchelf` perform these edits.
    pub fn patchelf_args(&self) -> Vec<String> {
        let mut args = vec![];

        if let Some(runpath) = &self.runpath {
            args.push("--set-rpath".to_string());
            args.push(runpath.clone());
        }
        for (old, new) in &self.replace_needed {
            args.push("--replace-needed".to_string());
            args.push(old.clone());
            args.push(new.clone());
        }
        if let Some(soname) = &self.soname {
            args.push("--set-soname".to_string());
            args.push(soname.clone());
        }

        args
    }
}

/// Location of the dynamic array and string table within a file.
struct DynamicLayout {
    is_64: bool,
    endian: scroll::Endian,
    dynamic_offset: usize,
    entries: Vec<(u64, u64)>,
    strtab_offset: usize,
    strtab_size: usize,
    /// String table offsets referenced by dynamic entries and symbols.
    string_refs: Vec<usize>,
}

impl DynamicLayout {
    fn parse(data: &[u8]) -> Result<Self, BinaryError> {
        let elf = Elf::parse(data)?;
        let dynamic = elf
            .dynamic
            .as_ref()
            .ok_or_else(|| BinaryError::Malformed("ELF file has no dynamic section".into()))?;
        let header = elf
            .program_headers
            .iter()
            .find(|ph| ph.p_type == PT_DYNAMIC)
            .ok_or_else(|| BinaryError::Malformed("ELF file has no PT_DYNAMIC segment".into()))?;

        let entries = dynamic
            .dyns
            .iter()
            .map(|d| (d.d_tag, d.d_val))
            .collect::<Vec<_>>();

        let mut string_refs = entries
            .iter()
            .filter(|(tag, _)| matches!(*tag, DT_NEEDED | DT_SONAME | DT_RPATH | DT_RUNPATH))
            .map(|(_, value)| *value as usize)
            .collect::<Vec<_>>();
        string_refs.extend(elf.dynsyms.iter().map(|sym| sym.st_name));

        Ok(Self {
            is_64: elf.is_64,
            endian: if elf.little_endian {
                scroll::Endian::Little
            } else {
                scroll::Endian::Big
            },
            dynamic_offset: header.p_offset as usize,
            entries,
            strtab_offset: dynamic.info.strtab,
            strtab_size: dynamic.info.strsz,
            string_refs,
        })
    }

    fn string_at<'a>(&self, data: &'a [u8], offset: usize) -> Option<&'a [u8]> {
        let start = self.strtab_offset.checked_add(offset)?;
        let end = (self.strtab_offset + self.strtab_size).min(data.len());
        let region = data.get(start..end)?;
        let len = region.iter().position(|b| *b == 0)?;

        Some(&region[0..len])
    }

    fn find(&self, tag: u64) -> Option<usize> {
        self.entries.iter().position(|(t, _)| *t == tag)
    }

    /// Whether the string at `offset` can be overwritten with `new`.
    fn can_overwrite(&self, data: &[u8], offset: usize, new: &str) -> bool {
        let old_len = match self.string_at(data, offset) {
            Some(s) => s.len(),
            None => return false,
        };

        // Another string sharing our bytes through suffix merging would be
        // clobbered.
        let shared = self
            .string_refs
            .iter()
            .any(|o| *o > offset && *o < offset + old_len);

        new.len() <= old_len && !new.as_bytes().contains(&0) && !shared
    }

    fn overwrite(&self, data: &mut [u8], offset: usize, new: &str) {
        let start = self.strtab_offset + offset;
        let old_len = self
            .string_at(data, offset)
            .map(|s| s.len())
            .unwrap_or_default();

        data[start..start + old_len].fill(0);
        data[start..start + new.len()].copy_from_slice(new.as_bytes());
    }

    fn set_tag(&self, data: &mut [u8], index: usize, tag: u64) -> Result<(), BinaryError> {
        if self.is_64 {
            data.pwrite_with::<u64>(tag, self.dynamic_offset + index * 16, self.endian)?;
        } else {
            data.pwrite_with::<u32>(tag as u32, self.dynamic_offset + index * 8, self.endian)?;
        }

        Ok(())
    }
}

/// Apply edits to ELF data without changing its size.
///
/// Returns `false` without modifying anything if some edit does not fit.
/// Replacements of libraries the binary does not reference are ignored.
pub fn edit_in_place(data: &mut [u8], edits: &ElfEdits) -> Result<bool, BinaryError> {
    let layout = DynamicLayout::parse(data)?;

    let mut writes: Vec<(usize, &str)> = vec![];
    let mut retag = None;

    if let Some(runpath) = &edits.runpath {
        let index = match layout.find(DT_RUNPATH).or_else(|| layout.find(DT_RPATH)) {
            Some(i) => i,
            None => return Ok(false),
        };
        let (tag, offset) = layout.entries[index];
        if tag == DT_RPATH {
            retag = Some(index);
        }
        writes.push((offset as usize, runpath.as_str()));
    }

    for (old, new) in &edits.replace_needed {
        if let Some((_, offset)) = layout.entries.iter().find(|(tag, value)| {
            *tag == DT_NEEDED && layout.string_at(data, *value as usize) == Some(old.as_bytes())
        }) {
            writes.push((*offset as usize, new.as_str()));
        }
    }

    if let Some(soname) = &edits.soname {
        match layout.find(DT_SONAME) {
            Some(i) => writes.push((layout.entries[i].1 as usize, soname.as_str())),
            None => return Ok(false),
        }
    }

    for (i, (offset, new)) in writes.iter().enumerate() {
        if !layout.can_overwrite(data, *offset, new) {
            return Ok(false);
        }
        if writes[i + 1..].iter().any(|(o, _)| o == offset) {
            return Ok(false);
        }
        // A symbol name sharing this exact string would change too.
        let uses = layout.string_refs.iter().filter(|o| *o == offset).count();
        if uses > 1 {
            return Ok(false);
        }
    }

    for (offset, new) in &writes {
        layout.overwrite(data, *offset, new);
    }
    if let Some(index) = retag {
        layout.set_tag(data, index, DT_RUNPATH)?;
    }

    Ok(true)
}

/// Run `patchelf` against a file.
pub fn run_patchelf(path: &Path, edits: &ElfEdits) -> Result<(), BinaryError> {
    let patchelf = find_tool(
        "patchelf",
        Some(PATCHELF_ENV),
        "install patchelf or point PYFREEZE_PATCHELF at it",
    )?;

    let mut args = edits.patchelf_args();
    args.push(path.display().to_string());
    run_tool(&patchelf, args)?;

    Ok(())
}

/// Apply edits to an ELF file, atomically.
pub fn apply_edits(path: &Path, edits: &ElfEdits) -> Result<(), BinaryError> {
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
            debug!("{} needs patchelf for {:?}", path.display(), edits);
            run_patchelf(temp, edits)
        }
    })
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testutil::ElfBuilder};

    #[test]
    fn parse_dynamic_section() -> Result<(), BinaryError> {
        let data = ElfBuilder::new()
            .needed("libfoo.so.1")
            .needed("libc.so.6")
            .runpath("$ORIGIN:/opt/lib")
            .soname("libbar.so.2")
            .build();

        let parsed = parse_elf(&data)?;
        assert_eq!(parsed.references, vec!["libfoo.so.1", "libc.so.6"]);
        assert_eq!(parsed.rpaths, vec!["$ORIGIN", "/opt/lib"]);
        assert_eq!(parsed.soname.as_deref(), Some("libbar.so.2"));

        Ok(())
    }

    #[test]
    fn runpath_shadows_rpath() -> Result<(), BinaryError> {
        let data = ElfBuilder::new()
            .rpath("/old")
            .runpath("/new")
            .build();
        assert_eq!(parse_elf(&data)?.rpaths, vec!["/new"]);

        let data = ElfBuilder::new().rpath("/old").build();
        assert_eq!(parse_elf(&data)?.rpaths, vec!["/old"]);

        Ok(())
    }

    #[test]
    fn ldd_output() {
        let output = "\tlinux-vdso.so.1 (0x00007ffd3b5f2000)
\tlibfoo.so.1 => /opt/foo/lib/libfoo.so.1 (0x00007f0c1c000000)
\tlibmissing.so => not found
\tlibc.so.6 => /lib/x86_64-linux-gnu/libc.so.6 (0x00007f0c1be00000)
\t/lib64/ld-linux-x86-64.so.2 (0x00007f0c1c23a000)
";
        let deps = parse_ldd_output(output);
        assert_eq!(deps.len(), 2);
        assert_eq!(
            deps.get("libfoo.so.1"),
            Some(&PathBuf::from("/opt/foo/lib/libfoo.so.1"))
        );
        assert!(!deps.contains_key("libmissing.so"));
    }

    #[test]
    fn in_place_runpath() -> Result<(), BinaryError> {
        let mut data = ElfBuilder::new()
            .needed("libfoo.so.1")
            .rpath("/build/tree/lib")
            .build();
        let before_len = data.len();

        let edits = ElfEdits {
            runpath: Some("$ORIGIN".to_string()),
            ..Default::default()
        };
        assert!(edit_in_place(&mut data, &edits)?);
        assert_eq!(data.len(), before_len);

        let elf = Elf::parse(&data)?;
        assert_eq!(elf.runpaths, vec!["$ORIGIN"]);
        assert!(elf.rpaths.is_empty());

        // Applying the same edit again leaves the bytes alone.
        let snapshot = data.clone();
        assert!(edit_in_place(&mut data, &edits)?);
        assert_eq!(data, snapshot);

        Ok(())
    }

    #[test]
    fn in_place_needed_and_soname() -> Result<(), BinaryError> {
        let mut data = ElfBuilder::new()
            .needed("libfoo-0123abcd.so.1")
            .needed("libc.so.6")
            .soname("libbar-0123abcd.so")
            .build();

        let edits = ElfEdits {
            replace_needed: vec![
                ("libfoo-0123abcd.so.1".to_string(), "libfoo.so.1".to_string()),
                ("libnotthere.so".to_string(), "libx.so".to_string()),
            ],
            soname: Some("libbar.so".to_string()),
            ..Default::default()
        };
        assert!(edit_in_place(&mut data, &edits)?);

        let parsed = parse_elf(&data)?;
        assert_eq!(parsed.references, vec!["libfoo.so.1", "libc.so.6"]);
        assert_eq!(parsed.soname.as_deref(), Some("libbar.so"));

        Ok(())
    }

    #[test]
    fn oversized_edits_need_patchelf() -> Result<(), BinaryError> {
        let mut data = ElfBuilder::new().needed("libfoo.so").runpath("/x").build();
        let snapshot = data.clone();

        let edits = ElfEdits {
            runpath: Some("$ORIGIN/../lib".to_string()),
            ..Default::default()
        };
        assert!(!edit_in_place(&mut data, &edits)?);
        assert_eq!(data, snapshot);

        // No search path entry to reuse.
        let mut data = ElfBuilder::new().needed("libfoo.so").build();
        assert!(!edit_in_place(&mut data, &edits)?);

        assert_eq!(
            edits.patchelf_args(),
            vec!["--set-rpath".to_string(), "$ORIGIN/../lib".to_string()]
        );

        Ok(())
    }

    #[test]
    fn apply_edits_to_file() -> Result<(), BinaryError> {
        let td = tempfile::Builder::new()
            .prefix("tugger-binary-analysis-test")
            .tempdir()?;
        let path = td.path().join("ext.so");
        std::fs::write(
            &path,
            ElfBuilder::new()
                .needed("libfoo.so.1")
                .runpath("/usr/local/lib")
                .build(),
        )?;

        apply_edits(
            &path,
            &ElfEdits {
                runpath: Some("$ORIGIN".to_string()),
                ..Default::default()
            },
        )?;

        assert_eq!(parse_elf(&std::fs::read(&path)?)?.rpaths, vec!["$ORIGIN"]);

        Ok(())
    }
}
