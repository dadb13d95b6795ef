// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! PE resource section reading and writing.

Resources form a three level tree: type, then name, then language. This
module parses the `.rsrc` tree into a [ResourceTable], lets callers edit it
and serializes it back into an image.

When writing, the existing `.rsrc` section is overwritten in place if it is
the last section of the file. Otherwise a new `.rsrc` section is appended
and the resource data directory repointed at it.
*/

use {
    crate::image::{
        align_up, PeLayout, SectionHeader, IMAGE_DIRECTORY_ENTRY_RESOURCE,
        IMAGE_DIRECTORY_ENTRY_SECURITY, IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_READ,
    },
    anyhow::{anyhow, Context, Result},
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
    log::debug,
    std::collections::BTreeMap,
};

pub const RT_ICON: u16 = 3;
pub const RT_GROUP_ICON: u16 = 14;
pub const RT_VERSION: u16 = 16;
pub const RT_MANIFEST: u16 = 24;

/// Language used for resources we write: US English.
pub const LANG_EN_US: u16 = 0x0409;

/// Maximum directory nesting we accept when parsing.
const MAX_DEPTH: usize = 3;

/// Identifies a resource type or name.
///
/// Named entries sort before numeric ones, which is the order the
/// resource directory format requires.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ResourceId {
    Name(String),
    Id(u16),
}

impl From<u16> for ResourceId {
    fn from(v: u16) -> Self {
        Self::Id(v)
    }
}

impl From<&str> for ResourceId {
    fn from(v: &str) -> Self {
        Self::Name(v.to_string())
    }
}

/// Resource payload with its code page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceData {
    pub data: Vec<u8>,
    pub code_page: u32,
}

impl ResourceData {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, code_page: 0 }
    }
}

type Languages = BTreeMap<u16, ResourceData>;

/// An editable resource tree.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResourceTable {
    entries: BTreeMap<ResourceId, BTreeMap<ResourceId, Languages>>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the resource tree of a PE image. Images without resources
    /// produce an empty table.
    pub fn from_pe(data: &[u8]) -> Result<Self> {
        let layout = PeLayout::parse(data)?;

        let (rva, _) = match layout.data_directory(data, IMAGE_DIRECTORY_ENTRY_RESOURCE) {
            Some(v) => v,
            None => return Ok(Self::new()),
        };
        let base = layout
            .rva_to_offset(rva)
            .ok_or_else(|| anyhow!("resource directory rva {:#x} not in any section", rva))?;

        let mut table = Self::new();
        let reader = TreeReader {
            data,
            layout: &layout,
            base,
        };

        for (type_id, type_entry) in reader.directory(0, 0)? {
            let names = match type_entry {
                TreeEntry::Directory(offset) => reader.directory(offset, 1)?,
                TreeEntry::Data(_) => continue,
            };

            for (name_id, name_entry) in names {
                let languages = match name_entry {
                    TreeEntry::Directory(offset) => reader.directory(offset, 2)?,
                    TreeEntry::Data(_) => continue,
                };

                for (lang_id, lang_entry) in languages {
                    let lang = match lang_id {
                        ResourceId::Id(v) => v,
                        ResourceId::Name(_) => continue,
                    };

                    if let TreeEntry::Data(offset) = lang_entry {
                        table.set(type_id.clone(), name_id.clone(), lang, reader.data_entry(offset)?);
                    }
                }
            }
        }

        Ok(table)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(type, name, language, data)`.
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, &ResourceId, u16, &ResourceData)> {
        self.entries.iter().flat_map(|(t, names)| {
            names
                .iter()
                .flat_map(move |(n, langs)| langs.iter().map(move |(l, d)| (t, n, *l, d)))
        })
    }

    pub fn set(
        &mut self,
        type_id: impl Into<ResourceId>,
        name: impl Into<ResourceId>,
        lang: u16,
        data: ResourceData,
    ) {
        self.entries
            .entry(type_id.into())
            .or_default()
            .entry(name.into())
            .or_default()
            .insert(lang, data);
    }

    /// Obtain a resource, preferring the requested language and falling back
    /// to any language.
    pub fn get(&self, type_id: &ResourceId, name: &ResourceId, lang: u16) -> Option<&ResourceData> {
        let langs = self.entries.get(type_id)?.get(name)?;
        langs.get(&lang).or_else(|| langs.values().next())
    }

    /// First resource of a type in tree order.
    pub fn first_of_type(&self, type_id: &ResourceId) -> Option<&ResourceData> {
        self.entries
            .get(type_id)?
            .values()
            .flat_map(|langs| langs.values())
            .next()
    }

    /// Remove every resource of a type.
    pub fn remove_type(&mut self, type_id: &ResourceId) {
        self.entries.remove(type_id);
    }

    /// Serialize the tree for placement at relative virtual address `rva`.
    pub fn encode(&self, rva: u32) -> Result<Vec<u8>> {
        let mut offset = 16 + 8 * self.entries.len();

        let mut type_dirs = vec![];
        for names in self.entries.values() {
            type_dirs.push(offset);
            offset += 16 + 8 * names.len();
        }

        let mut name_dirs = vec![];
        for names in self.entries.values() {
            for langs in names.values() {
                name_dirs.push(offset);
                offset += 16 + 8 * langs.len();
            }
        }

        let mut data_entries = vec![];
        for (_, _, _, _) in self.iter() {
            data_entries.push(offset);
            offset += 16;
        }

        let mut strings = BTreeMap::new();
        for (type_id, names) in &self.entries {
            for id in std::iter::once(type_id).chain(names.keys()) {
                if let ResourceId::Name(name) = id {
                    if !strings.contains_key(name) {
                        strings.insert(name.clone(), offset);
                        offset += 2 + 2 * name.encode_utf16().count();
                    }
                }
            }
        }

        let mut blobs = vec![];
        for (_, _, _, data) in self.iter() {
            offset = (offset + 7) & !7;
            blobs.push(offset);
            offset += data.data.len();
        }
        offset = (offset + 7) & !7;

        let mut out = vec![0u8; offset];

        let id_field = |id: &ResourceId| -> Result<u32> {
            Ok(match id {
                ResourceId::Id(v) => *v as u32,
                ResourceId::Name(name) => {
                    0x8000_0000
                        | *strings
                            .get(name)
                            .ok_or_else(|| anyhow!("missing string offset for {}", name))?
                            as u32
                }
            })
        };

        write_directory(
            &mut out[0..],
            self.entries
                .keys()
                .zip(type_dirs.iter())
                .map(|(id, dir)| Ok((id, id_field(id)?, 0x8000_0000 | *dir as u32)))
                .collect::<Result<Vec<_>>>()?,
        );

        let mut name_index = 0;
        for (names, type_dir) in self.entries.values().zip(type_dirs.iter()) {
            let mut fields = vec![];
            for id in names.keys() {
                fields.push((id, id_field(id)?, 0x8000_0000 | name_dirs[name_index] as u32));
                name_index += 1;
            }
            write_directory(&mut out[*type_dir..], fields);
        }

        name_index = 0;
        let mut data_index = 0;
        for names in self.entries.values() {
            for langs in names.values() {
                let mut fields = vec![];
                let lang_ids = langs.keys().map(|l| ResourceId::Id(*l)).collect::<Vec<_>>();
                for (lang, data) in lang_ids.iter().zip(langs.values()) {
                    let entry = data_entries[data_index];
                    let blob = blobs[data_index];

                    let e = &mut out[entry..entry + 16];
                    LittleEndian::write_u32(&mut e[0..4], rva + blob as u32);
                    LittleEndian::write_u32(&mut e[4..8], data.data.len() as u32);
                    LittleEndian::write_u32(&mut e[8..12], data.code_page);
                    out[blob..blob + data.data.len()].copy_from_slice(&data.data);

                    fields.push((lang, id_field(lang)?, entry as u32));
                    data_index += 1;
                }
                write_directory(&mut out[name_dirs[name_index]..], fields);
                name_index += 1;
            }
        }

        for (name, string_offset) in &strings {
            let mut encoded = vec![];
            let units = name.encode_utf16().collect::<Vec<_>>();
            encoded.write_u16::<LittleEndian>(units.len() as u16)?;
            for unit in units {
                encoded.write_u16::<LittleEndian>(unit)?;
            }
            out[*string_offset..*string_offset + encoded.len()].copy_from_slice(&encoded);
        }

        Ok(out)
    }

    /// Produce a copy of `image` carrying this resource table.
    pub fn apply_to_pe(&self, image: &[u8]) -> Result<Vec<u8>> {
        let mut layout = PeLayout::parse(image)?;
        let mut data = image.to_vec();

        if layout
            .data_directory(&data, IMAGE_DIRECTORY_ENTRY_SECURITY)
            .is_some()
        {
            debug!("image carries an Authenticode signature; it will no longer be valid");
        }

        let end_of_sections = layout.end_of_sections();
        let existing = layout
            .data_directory(&data, IMAGE_DIRECTORY_ENTRY_RESOURCE)
            .and_then(|(rva, _)| layout.sections.iter().position(|s| s.contains_rva(rva)));

        // Reuse the current section when nothing follows it.
        let reuse = existing.filter(|index| {
            let s = &layout.sections[*index];
            (s.pointer_to_raw_data + s.size_of_raw_data) as usize == end_of_sections
                && data.len() == end_of_sections
                && layout.next_virtual_address()
                    == align_up(
                        s.virtual_address + s.virtual_size.max(s.size_of_raw_data),
                        layout.section_alignment,
                    )
        });

        let (index, rva, raw_offset) = match reuse {
            Some(index) => {
                let s = &layout.sections[index];
                (index, s.virtual_address, s.pointer_to_raw_data)
            }
            None => {
                let raw_offset = align_up(data.len() as u32, layout.file_alignment);
                let rva = layout.next_virtual_address();
                layout.sections.push(SectionHeader {
                    name: *b".rsrc\0\0\0",
                    virtual_size: 0,
                    virtual_address: rva,
                    size_of_raw_data: 0,
                    pointer_to_raw_data: raw_offset,
                    characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ,
                });
                (layout.sections.len() - 1, rva, raw_offset)
            }
        };

        let encoded = self.encode(rva)?;
        let raw_size = align_up(encoded.len() as u32, layout.file_alignment);

        data.resize(raw_offset as usize, 0);
        data.extend_from_slice(&encoded);
        data.resize((raw_offset + raw_size) as usize, 0);

        let section = &mut layout.sections[index];
        section.virtual_size = encoded.len() as u32;
        section.size_of_raw_data = raw_size;

        layout
            .write_sections(&mut data)
            .context("updating section table")?;
        layout.set_data_directory(
            &mut data,
            IMAGE_DIRECTORY_ENTRY_RESOURCE,
            rva,
            encoded.len() as u32,
        )?;

        Ok(data)
    }
}

enum TreeEntry {
    Directory(usize),
    Data(usize),
}

struct TreeReader<'a> {
    data: &'a [u8],
    layout: &'a PeLayout,
    base: usize,
}

impl<'a> TreeReader<'a> {
    fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        self.data
            .get(self.base + offset..self.base + offset + len)
            .ok_or_else(|| anyhow!("resource tree offset {:#x} out of bounds", offset))
    }

    fn directory(&self, offset: usize, depth: usize) -> Result<Vec<(ResourceId, TreeEntry)>> {
        if depth >= MAX_DEPTH {
            return Err(anyhow!("resource tree nested too deeply"));
        }

        let header = self.slice(offset, 16)?;
        let count = LittleEndian::read_u16(&header[12..14]) as usize
            + LittleEndian::read_u16(&header[14..16]) as usize;

        let mut entries = vec![];
        for i in 0..count {
            let entry = self.slice(offset + 16 + i * 8, 8)?;
            let name = LittleEndian::read_u32(&entry[0..4]);
            let target = LittleEndian::read_u32(&entry[4..8]);

            let id = if name & 0x8000_0000 != 0 {
                ResourceId::Name(self.string((name & 0x7fff_ffff) as usize)?)
            } else {
                ResourceId::Id(name as u16)
            };

            let entry = if target & 0x8000_0000 != 0 {
                TreeEntry::Directory((target & 0x7fff_ffff) as usize)
            } else {
                TreeEntry::Data(target as usize)
            };

            entries.push((id, entry));
        }

        Ok(entries)
    }

    fn string(&self, offset: usize) -> Result<String> {
        let len = LittleEndian::read_u16(self.slice(offset, 2)?) as usize;
        let raw = self.slice(offset + 2, len * 2)?;
        let units = raw
            .chunks_exact(2)
            .map(LittleEndian::read_u16)
            .collect::<Vec<_>>();

        Ok(String::from_utf16_lossy(&units))
    }

    fn data_entry(&self, offset: usize) -> Result<ResourceData> {
        let entry = self.slice(offset, 16)?;
        let rva = LittleEndian::read_u32(&entry[0..4]);
        let size = LittleEndian::read_u32(&entry[4..8]) as usize;
        let code_page = LittleEndian::read_u32(&entry[8..12]);

        let start = self
            .layout
            .rva_to_offset(rva)
            .ok_or_else(|| anyhow!("resource data rva {:#x} not in any section", rva))?;
        let data = self
            .data
            .get(start..start + size)
            .ok_or_else(|| anyhow!("resource data at {:#x} out of bounds", start))?;

        Ok(ResourceData {
            data: data.to_vec(),
            code_page,
        })
    }
}

fn write_directory(dest: &mut [u8], entries: Vec<(&ResourceId, u32, u32)>) {
    let named = entries
        .iter()
        .filter(|(id, _, _)| matches!(id, ResourceId::Name(_)))
        .count();

    LittleEndian::write_u16(&mut dest[12..14], named as u16);
    LittleEndian::write_u16(&mut dest[14..16], (entries.len() - named) as u16);

    for (i, (_, name, target)) in entries.iter().enumerate() {
        let start = 16 + i * 8;
        LittleEndian::write_u32(&mut dest[start..start + 4], *name);
        LittleEndian::write_u32(&mut dest[start + 4..start + 8], *target);
    }
}

/// Read the application manifest embedded in a PE image.
pub fn read_manifest(image: &[u8]) -> Result<Option<String>> {
    let table = ResourceTable::from_pe(image)?;

    Ok(table
        .first_of_type(&ResourceId::Id(RT_MANIFEST))
        .map(|r| String::from_utf8_lossy(&r.data).trim_start_matches('\u{feff}').to_string()))
}
