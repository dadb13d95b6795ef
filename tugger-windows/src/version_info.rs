// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `VS_VERSION_INFO` version resources.

The resource is a tree of length-prefixed blocks, each carrying a UTF-16
key, an optional value and children aligned to 32 bits. The root holds a
`VS_FIXEDFILEINFO` structure with the numeric file and product versions,
then a `StringFileInfo` block with one US-English / Windows-1252 string
table, then a `VarFileInfo` block declaring that translation.
*/

use {
    anyhow::{anyhow, Context, Result},
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
    once_cell::sync::Lazy,
    regex::Regex,
    std::collections::BTreeMap,
};

pub const VS_FFI_SIGNATURE: u32 = 0xfeef_04bd;
pub const VS_FFI_STRUCVERSION: u32 = 0x0001_0000;
pub const VS_FFI_FILEFLAGSMASK: u32 = 0x0000_003f;

pub const VS_FF_DEBUG: u32 = 0x01;
pub const VS_FF_PRERELEASE: u32 = 0x02;
pub const VS_FF_PATCHED: u32 = 0x04;
pub const VS_FF_PRIVATEBUILD: u32 = 0x08;

pub const VOS_NT_WINDOWS32: u32 = 0x0004_0004;
pub const VFT_APP: u32 = 0x1;
pub const VFT_DLL: u32 = 0x2;

/// Key of the single string table we write: US English, Windows-1252.
pub const STRING_TABLE_KEY: &str = "040904E4";
/// `Translation` value matching [STRING_TABLE_KEY].
pub const TRANSLATION: u32 = 0x04e4_0409;

const TEXT_TYPE: u16 = 1;
const BINARY_TYPE: u16 = 0;

static PEP440_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)^\s*v?
        (?P<release>[0-9]+(?:\.[0-9]+)*)
        (?P<pre>[-_.]?(?:a|b|c|rc|alpha|beta|pre|preview)[-_.]?[0-9]*)?
        (?P<post>-[0-9]+|[-_.]?(?:post|rev|r)[-_.]?[0-9]*)?
        (?P<dev>[-_.]?dev[-_.]?[0-9]*)?
        (?P<local>\+[a-z0-9]+(?:[-_.][a-z0-9]+)*)?
        \s*$",
    )
    .expect("static regex should compile")
});

/// A version normalized to four 16-bit components plus file flags
/// describing what the numeric form cannot express.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NormalizedVersion {
    pub parts: [u16; 4],
    pub flags: u32,
}

impl NormalizedVersion {
    pub fn ms(&self) -> u32 {
        (self.parts[0] as u32) << 16 | self.parts[1] as u32
    }

    pub fn ls(&self) -> u32 {
        (self.parts[2] as u32) << 16 | self.parts[3] as u32
    }

    fn from_ms_ls(ms: u32, ls: u32, flags: u32) -> Self {
        Self {
            parts: [
                (ms >> 16) as u16,
                (ms & 0xffff) as u16,
                (ls >> 16) as u16,
                (ls & 0xffff) as u16,
            ],
            flags,
        }
    }
}

impl std::fmt::Display for NormalizedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.parts[0], self.parts[1], self.parts[2], self.parts[3]
        )
    }
}

fn release_parts<'a>(components: impl Iterator<Item = &'a str>, version: &str) -> Result<[u16; 4]> {
    let mut parts = [0u16; 4];

    for (i, component) in components.enumerate() {
        if i >= 4 {
            return Err(anyhow!("version {} has more than four components", version));
        }
        parts[i] = component
            .parse::<u16>()
            .with_context(|| format!("version component {} of {} is out of range", component, version))?;
    }

    Ok(parts)
}

/// Normalize a version string to the four-part form used by version resources.
///
/// Semantic versions and PEP 440 versions are accepted. Pre-release and dev
/// segments set `VS_FF_PRERELEASE`, post-release segments `VS_FF_PATCHED`
/// and local or build metadata `VS_FF_PRIVATEBUILD`.
pub fn normalize_version(version: &str) -> Result<NormalizedVersion> {
    if let Ok(v) = semver::Version::parse(version.trim().trim_start_matches('v')) {
        let mut flags = 0;
        if !v.pre.is_empty() {
            flags |= VS_FF_PRERELEASE;
        }
        if !v.build.is_empty() {
            flags |= VS_FF_PRIVATEBUILD;
        }

        let parts = [v.major, v.minor, v.patch]
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>();

        return Ok(NormalizedVersion {
            parts: release_parts(parts.iter().map(|s| s.as_str()), version)?,
            flags,
        });
    }

    let caps = PEP440_VERSION
        .captures(version)
        .ok_or_else(|| anyhow!("{} is not a valid version", version))?;

    let release = caps
        .name("release")
        .map(|m| m.as_str())
        .unwrap_or_default();

    let mut flags = 0;
    if caps.name("pre").is_some() || caps.name("dev").is_some() {
        flags |= VS_FF_PRERELEASE;
    }
    if caps.name("post").is_some() {
        flags |= VS_FF_PATCHED;
    }
    if caps.name("local").is_some() {
        flags |= VS_FF_PRIVATEBUILD;
    }

    Ok(NormalizedVersion {
        parts: release_parts(release.split('.'), version)?,
        flags,
    })
}

/// The content of a version resource.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionInfo {
    pub file_version: NormalizedVersion,
    pub product_version: NormalizedVersion,
    pub file_type: u32,
    /// `StringFileInfo` values keyed by name (`FileVersion`, `CompanyName`, ...).
    pub strings: BTreeMap<String, String>,
}

impl VersionInfo {
    /// Construct version info for an application of the given version.
    ///
    /// `FileVersion` holds the normalized form and `ProductVersion` the
    /// version as given.
    pub fn new(version: &str) -> Result<Self> {
        let normalized = normalize_version(version)?;

        let mut strings = BTreeMap::new();
        strings.insert("FileVersion".to_string(), normalized.to_string());
        strings.insert("ProductVersion".to_string(), version.to_string());

        Ok(Self {
            file_version: normalized,
            product_version: normalized,
            file_type: VFT_APP,
            strings,
        })
    }

    /// Set a string value. Empty values remove the key.
    pub fn set_string(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            self.strings.remove(key);
        } else {
            self.strings.insert(key.to_string(), value.to_string());
        }
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.strings.get(key).map(|s| s.as_str())
    }

    /// Serialize to the `VS_VERSION_INFO` binary layout.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut fixed = vec![];
        for value in [
            VS_FFI_SIGNATURE,
            VS_FFI_STRUCVERSION,
            self.file_version.ms(),
            self.file_version.ls(),
            self.product_version.ms(),
            self.product_version.ls(),
            VS_FFI_FILEFLAGSMASK,
            self.file_version.flags & VS_FFI_FILEFLAGSMASK,
            VOS_NT_WINDOWS32,
            self.file_type,
            0,
            0,
            0,
        ] {
            fixed.write_u32::<LittleEndian>(value)?;
        }

        let strings = self
            .strings
            .iter()
            .map(|(key, value)| {
                let encoded = utf16z(value);
                let units = (encoded.len() / 2) as u16;
                encode_block(key, TEXT_TYPE, encoded, units, vec![])
            })
            .collect::<Result<Vec<_>>>()?;

        let string_table = encode_block(STRING_TABLE_KEY, TEXT_TYPE, vec![], 0, strings)?;
        let string_file_info = encode_block("StringFileInfo", TEXT_TYPE, vec![], 0, vec![string_table])?;

        let mut translation = vec![];
        translation.write_u32::<LittleEndian>(TRANSLATION)?;
        let var = encode_block("Translation", BINARY_TYPE, translation, 4, vec![])?;
        let var_file_info = encode_block("VarFileInfo", TEXT_TYPE, vec![], 0, vec![var])?;

        encode_block(
            "VS_VERSION_INFO",
            BINARY_TYPE,
            fixed,
            52,
            vec![string_file_info, var_file_info],
        )
    }

    /// Parse a `VS_VERSION_INFO` resource.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let root = ParsedBlock::parse(data).context("parsing VS_VERSION_INFO")?;
        if root.key != "VS_VERSION_INFO" {
            return Err(anyhow!("unexpected root block {}", root.key));
        }
        if root.value.len() < 52 || LittleEndian::read_u32(&root.value[0..4]) != VS_FFI_SIGNATURE {
            return Err(anyhow!("VS_FIXEDFILEINFO signature mismatch"));
        }

        let field = |i: usize| LittleEndian::read_u32(&root.value[i * 4..i * 4 + 4]);
        let flags = field(7);

        let mut strings = BTreeMap::new();
        for block in root.children.iter().filter(|b| b.key == "StringFileInfo") {
            for table in &block.children {
                for entry in &table.children {
                    strings.insert(entry.key.clone(), utf16_value(&entry.value));
                }
            }
        }

        Ok(Self {
            file_version: NormalizedVersion::from_ms_ls(field(2), field(3), flags),
            product_version: NormalizedVersion::from_ms_ls(field(4), field(5), flags),
            file_type: field(9),
            strings,
        })
    }
}

fn utf16z(s: &str) -> Vec<u8> {
    let mut out = vec![];
    for unit in s.encode_utf16().chain(std::iter::once(0)) {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

fn utf16_value(data: &[u8]) -> String {
    let units = data
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .take_while(|u| *u != 0)
        .collect::<Vec<_>>();
    String::from_utf16_lossy(&units)
}

fn pad32(data: &mut Vec<u8>) {
    while data.len() % 4 != 0 {
        data.push(0);
    }
}

/// Encode a block. `value_length` is in bytes for binary values and in
/// UTF-16 units for text values.
fn encode_block(
    key: &str,
    value_type: u16,
    value: Vec<u8>,
    value_length: u16,
    children: Vec<Vec<u8>>,
) -> Result<Vec<u8>> {
    let mut out = vec![0, 0];
    out.write_u16::<LittleEndian>(value_length)?;
    out.write_u16::<LittleEndian>(value_type)?;
    out.extend(utf16z(key));
    pad32(&mut out);
    out.extend(value);

    for child in children {
        pad32(&mut out);
        out.extend(child);
    }

    let len = u16::try_from(out.len()).context("version resource block too large")?;
    LittleEndian::write_u16(&mut out[0..2], len);

    Ok(out)
}

struct ParsedBlock {
    key: String,
    value: Vec<u8>,
    children: Vec<ParsedBlock>,
}

impl ParsedBlock {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 6 {
            return Err(anyhow!("version block truncated"));
        }

        let len = (LittleEndian::read_u16(&data[0..2]) as usize).min(data.len());
        let value_length = LittleEndian::read_u16(&data[2..4]) as usize;
        let value_type = LittleEndian::read_u16(&data[4..6]);

        let mut offset = 6;
        let mut key_units = vec![];
        loop {
            let unit = data
                .get(offset..offset + 2)
                .map(LittleEndian::read_u16)
                .ok_or_else(|| anyhow!("unterminated version block key"))?;
            offset += 2;
            if unit == 0 {
                break;
            }
            key_units.push(unit);
        }
        offset = (offset + 3) & !3;

        let value_bytes = if value_type == TEXT_TYPE {
            value_length * 2
        } else {
            value_length
        };
        let value = data
            .get(offset..(offset + value_bytes).min(len))
            .unwrap_or_default()
            .to_vec();
        offset += value_bytes;

        let mut children = vec![];
        loop {
            offset = (offset + 3) & !3;
            if offset + 6 > len {
                break;
            }
            let child_len = LittleEndian::read_u16(&data[offset..offset + 2]) as usize;
            if child_len == 0 {
                break;
            }
            let end = (offset + child_len).min(len);
            children.push(Self::parse(&data[offset..end])?);
            offset += child_len;
        }

        Ok(Self {
            key: String::from_utf16_lossy(&key_units),
            value,
            children,
        })
    }
}
