// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! PE import reading.

References are the union of the import and delay-import tables. PE binaries
are never relinked: Windows searches the directory of the loading module, so
placement alone makes references resolve.
*/

use {
    crate::{
        binary::ParsedBinary,
        error::BinaryError,
        tools::{find_tool, run_tool},
    },
    once_cell::sync::Lazy,
    regex::Regex,
    scroll::Pread,
    std::path::Path,
    tugger_windows::image::{read_c_string, PeLayout, IMAGE_DIRECTORY_ENTRY_DELAY_IMPORT},
};

/// Environment variable selecting how PE imports are read.
pub const PE_PARSER_ENV: &str = "PYFREEZE_PE_PARSER";

const SIZEOF_DELAY_DESCRIPTOR: usize = 32;

static DLL_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*DLL Name:\s*(\S.*?)\s*$").expect("static regex should compile")
});

/// How PE imports are read.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeParser {
    /// Parse import tables in process.
    Native,
    /// Run `objdump -p` and scrape its output.
    Objdump,
}

impl PeParser {
    pub fn from_name(name: &str) -> Result<Self, BinaryError> {
        match name {
            "" | "native" | "goblin" => Ok(Self::Native),
            "objdump" => Ok(Self::Objdump),
            _ => Err(BinaryError::InvalidEnvironment(
                PE_PARSER_ENV.to_string(),
                format!("{} is not one of native, objdump", name),
            )),
        }
    }

    pub fn from_env() -> Result<Self, BinaryError> {
        match std::env::var(PE_PARSER_ENV) {
            Ok(value) => Self::from_name(&value),
            Err(_) => Ok(Self::Native),
        }
    }
}

/// Names of the libraries a PE image delay-loads.
pub fn delay_imports(data: &[u8]) -> Result<Vec<String>, BinaryError> {
    let layout = PeLayout::parse(data).map_err(BinaryError::Pe)?;
    let (rva, size) = match layout.data_directory(data, IMAGE_DIRECTORY_ENTRY_DELAY_IMPORT) {
        Some(entry) => entry,
        None => return Ok(vec![]),
    };
    let mut offset = layout
        .rva_to_offset(rva)
        .ok_or_else(|| BinaryError::Malformed("delay import directory not in a section".into()))?;

    let mut names = vec![];
    for _ in 0..size as usize / SIZEOF_DELAY_DESCRIPTOR {
        let attributes = data.pread_with::<u32>(offset, scroll::LE)?;
        let name = data.pread_with::<u32>(offset + 4, scroll::LE)?;
        offset += SIZEOF_DELAY_DESCRIPTOR;

        if name == 0 {
            break;
        }

        // Old style descriptors store virtual addresses instead of RVAs.
        let name_rva = if attributes & 1 == 1 {
            name
        } else {
            (name as u64)
                .checked_sub(layout.image_base)
                .map(|v| v as u32)
                .ok_or_else(|| BinaryError::Malformed("bad delay import name address".into()))?
        };

        let name_offset = layout
            .rva_to_offset(name_rva)
            .ok_or_else(|| BinaryError::Malformed("delay import name not in a section".into()))?;
        names.push(read_c_string(data, name_offset).map_err(BinaryError::Pe)?);
    }

    Ok(names)
}

fn push_unique(references: &mut Vec<String>, name: String) {
    if !references.iter().any(|r| r.eq_ignore_ascii_case(&name)) {
        references.push(name);
    }
}

/// Parse the import tables of a PE image.
pub fn parse_pe(data: &[u8]) -> Result<ParsedBinary, BinaryError> {
    let pe = goblin::pe::PE::parse(data)?;

    let mut references = vec![];
    for name in &pe.libraries {
        push_unique(&mut references, name.to_string());
    }
    for name in delay_imports(data)? {
        push_unique(&mut references, name);
    }

    Ok(ParsedBinary {
        references,
        ..Default::default()
    })
}

/// Extract library names from `objdump -p` output.
pub fn parse_objdump_output(output: &str) -> Vec<String> {
    let mut references = vec![];

    for line in output.lines() {
        if let Some(caps) = DLL_NAME.captures(line) {
            push_unique(&mut references, caps[1].to_string());
        }
    }

    references
}

/// Read the imports of a PE file with `objdump`.
pub fn parse_pe_objdump(path: &Path) -> Result<ParsedBinary, BinaryError> {
    let objdump = find_tool("objdump", None, "install binutils or unset PYFREEZE_PE_PARSER")?;
    let output = run_tool(&objdump, ["-p".into(), path.as_os_str().to_os_string()])?;

    Ok(ParsedBinary {
        references: parse_objdump_output(&output),
        ..Default::default()
    })
}

/// Read the application manifest embedded in a PE image.
pub fn embedded_manifest(data: &[u8]) -> Result<Option<String>, BinaryError> {
    tugger_windows::read_manifest(data).map_err(BinaryError::Pe)
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testutil::PeBuilder};

    #[test]
    fn imports_and_delay_imports() -> Result<(), BinaryError> {
        let data = PeBuilder::new()
            .import("python312.dll")
            .import("KERNEL32.dll")
            .delay_import("libffi-8.dll")
            .delay_import("kernel32.dll")
            .build();

        let parsed = parse_pe(&data)?;
        assert_eq!(parsed.references.len(), 3);
        assert!(parsed.references.contains(&"python312.dll".to_string()));
        assert!(parsed.references.contains(&"libffi-8.dll".to_string()));
        assert!(parsed.rpaths.is_empty());

        assert_eq!(delay_imports(&data)?, vec!["libffi-8.dll", "kernel32.dll"]);

        Ok(())
    }

    #[test]
    fn pe32_delay_imports() -> Result<(), BinaryError> {
        let data = PeBuilder::new().pe32().delay_import("zlib1.dll").build();
        assert_eq!(delay_imports(&data)?, vec!["zlib1.dll"]);

        let data = PeBuilder::new().import("KERNEL32.dll").build();
        assert!(delay_imports(&data)?.is_empty());

        Ok(())
    }

    #[test]
    fn objdump_output() {
        let output = "
The Import Tables (interpreted .idata section contents)
 vma:            Hint    Time      Forward  DLL       First
                 Table   Stamp     Chain    Name      Thunk
 0001a000       0001a050 00000000 00000000 0001a3d0 0001a0f0

\tDLL Name: KERNEL32.dll
\tvma:  Hint/Ord Member-Name Bound-To
\tDLL Name: python312.dll
\tDLL Name: kernel32.dll
";
        assert_eq!(
            parse_objdump_output(output),
            vec!["KERNEL32.dll", "python312.dll"]
        );
    }

    #[test]
    fn parser_names() -> Result<(), BinaryError> {
        assert_eq!(PeParser::from_name("objdump")?, PeParser::Objdump);
        assert_eq!(PeParser::from_name("goblin")?, PeParser::Native);
        assert!(PeParser::from_name("lief").is_err());

        Ok(())
    }
}
