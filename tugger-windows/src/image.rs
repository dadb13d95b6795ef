// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Low-level PE image layout.

Resource stamping needs to know where the optional header fields and the
section table live so it can rewrite them in place. goblin parses PE files
but does not expose the file offsets of the fields we mutate, so we track
them here.
*/

use {
    anyhow::{anyhow, Context, Result},
    byteorder::{ByteOrder, LittleEndian},
};

pub const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
pub const IMAGE_DIRECTORY_ENTRY_RESOURCE: usize = 2;
pub const IMAGE_DIRECTORY_ENTRY_SECURITY: usize = 4;
pub const IMAGE_DIRECTORY_ENTRY_DELAY_IMPORT: usize = 13;

pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;

const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;
const SIZEOF_COFF_HEADER: usize = 20;
pub const SIZEOF_SECTION_HEADER: usize = 40;

/// Whether data starts like a DOS/PE image.
pub fn is_pe_header(data: &[u8]) -> bool {
    data.len() >= 64 && data[0] == b'M' && data[1] == b'Z'
}

/// Round `value` up to a multiple of `alignment`.
pub fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        value
    } else {
        (value + alignment - 1) / alignment * alignment
    }
}

/// An entry of the PE section table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl SectionHeader {
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.name[0..end]).to_string()
    }

    /// Whether a relative virtual address falls inside this section.
    pub fn contains_rva(&self, rva: u32) -> bool {
        let size = self.virtual_size.max(self.size_of_raw_data);
        rva >= self.virtual_address && rva < self.virtual_address + size
    }

    fn parse(data: &[u8]) -> Self {
        let mut name = [0u8; 8];
        name.copy_from_slice(&data[0..8]);

        Self {
            name,
            virtual_size: LittleEndian::read_u32(&data[8..12]),
            virtual_address: LittleEndian::read_u32(&data[12..16]),
            size_of_raw_data: LittleEndian::read_u32(&data[16..20]),
            pointer_to_raw_data: LittleEndian::read_u32(&data[20..24]),
            characteristics: LittleEndian::read_u32(&data[36..40]),
        }
    }

    fn write(&self, dest: &mut [u8]) {
        dest[0..SIZEOF_SECTION_HEADER].fill(0);
        dest[0..8].copy_from_slice(&self.name);
        LittleEndian::write_u32(&mut dest[8..12], self.virtual_size);
        LittleEndian::write_u32(&mut dest[12..16], self.virtual_address);
        LittleEndian::write_u32(&mut dest[16..20], self.size_of_raw_data);
        LittleEndian::write_u32(&mut dest[20..24], self.pointer_to_raw_data);
        LittleEndian::write_u32(&mut dest[36..40], self.characteristics);
    }
}

/// File offsets of the PE header fields we read and mutate.
#[derive(Clone, Debug)]
pub struct PeLayout {
    pub pe_offset: usize,
    pub is_64: bool,
    pub optional_header_offset: usize,
    pub section_table_offset: usize,
    pub number_of_data_directories: usize,
    pub image_base: u64,
    pub file_alignment: u32,
    pub section_alignment: u32,
    pub size_of_headers: u32,
    pub sections: Vec<SectionHeader>,
}

impl PeLayout {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if !is_pe_header(data) {
            return Err(anyhow!("data does not have a DOS header"));
        }

        let pe_offset = LittleEndian::read_u32(&data[0x3c..0x40]) as usize;
        if data.len() < pe_offset + 4 + SIZEOF_COFF_HEADER || &data[pe_offset..pe_offset + 4] != b"PE\0\0"
        {
            return Err(anyhow!("PE signature not found"));
        }

        let coff = pe_offset + 4;
        let number_of_sections = LittleEndian::read_u16(&data[coff + 2..coff + 4]) as usize;
        let size_of_optional_header = LittleEndian::read_u16(&data[coff + 16..coff + 18]) as usize;

        let optional_header_offset = coff + SIZEOF_COFF_HEADER;
        let section_table_offset = optional_header_offset + size_of_optional_header;

        if size_of_optional_header < 2
            || data.len() < section_table_offset + number_of_sections * SIZEOF_SECTION_HEADER
        {
            return Err(anyhow!("PE section table is truncated"));
        }

        let is_64 = match LittleEndian::read_u16(&data[optional_header_offset..optional_header_offset + 2])
        {
            PE32_MAGIC => false,
            PE32_PLUS_MAGIC => true,
            magic => return Err(anyhow!("unknown optional header magic {:#x}", magic)),
        };

        if size_of_optional_header < if is_64 { 112 } else { 96 } {
            return Err(anyhow!("PE optional header is truncated"));
        }

        let read = |offset: usize| LittleEndian::read_u32(&data[optional_header_offset + offset..]);

        let mut layout = Self {
            pe_offset,
            is_64,
            optional_header_offset,
            section_table_offset,
            number_of_data_directories: 0,
            image_base: if is_64 {
                LittleEndian::read_u64(&data[optional_header_offset + 24..])
            } else {
                read(28) as u64
            },
            section_alignment: read(32),
            file_alignment: read(36),
            size_of_headers: read(60),
            sections: vec![],
        };

        let directories_base = layout.data_directories_offset() - optional_header_offset;
        layout.number_of_data_directories = (read(directories_base - 4) as usize)
            .min((size_of_optional_header - directories_base) / 8);

        for i in 0..number_of_sections {
            let offset = section_table_offset + i * SIZEOF_SECTION_HEADER;
            layout
                .sections
                .push(SectionHeader::parse(&data[offset..offset + SIZEOF_SECTION_HEADER]));
        }

        Ok(layout)
    }

    fn data_directories_offset(&self) -> usize {
        self.optional_header_offset + if self.is_64 { 112 } else { 96 }
    }

    /// Offset of the `CheckSum` field.
    pub fn checksum_offset(&self) -> usize {
        self.optional_header_offset + 64
    }

    fn size_of_image_offset(&self) -> usize {
        self.optional_header_offset + 56
    }

    /// Read a data directory entry as `(rva, size)`.
    pub fn data_directory(&self, data: &[u8], index: usize) -> Option<(u32, u32)> {
        if index >= self.number_of_data_directories {
            return None;
        }

        let offset = self.data_directories_offset() + index * 8;
        let rva = LittleEndian::read_u32(&data[offset..offset + 4]);
        let size = LittleEndian::read_u32(&data[offset + 4..offset + 8]);

        if rva == 0 {
            None
        } else {
            Some((rva, size))
        }
    }

    pub fn set_data_directory(&self, data: &mut [u8], index: usize, rva: u32, size: u32) -> Result<()> {
        if index >= self.number_of_data_directories {
            return Err(anyhow!("image has no data directory {}", index));
        }

        let offset = self.data_directories_offset() + index * 8;
        LittleEndian::write_u32(&mut data[offset..offset + 4], rva);
        LittleEndian::write_u32(&mut data[offset + 4..offset + 8], size);

        Ok(())
    }

    /// Convert a relative virtual address to a file offset.
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        self.sections
            .iter()
            .find(|s| s.contains_rva(rva))
            .map(|s| (rva - s.virtual_address + s.pointer_to_raw_data) as usize)
    }

    /// Write the section table and `NumberOfSections` back to the image.
    pub fn write_sections(&self, data: &mut [u8]) -> Result<()> {
        let end = self.section_table_offset + self.sections.len() * SIZEOF_SECTION_HEADER;
        let first_raw = self
            .sections
            .iter()
            .filter(|s| s.size_of_raw_data > 0)
            .map(|s| s.pointer_to_raw_data as usize)
            .min()
            .unwrap_or(self.size_of_headers as usize);

        if end > self.size_of_headers as usize || end > first_raw {
            return Err(anyhow!("no room in PE headers for another section header"));
        }

        let coff = self.pe_offset + 4;
        LittleEndian::write_u16(&mut data[coff + 2..coff + 4], self.sections.len() as u16);

        for (i, section) in self.sections.iter().enumerate() {
            let offset = self.section_table_offset + i * SIZEOF_SECTION_HEADER;
            section.write(&mut data[offset..offset + SIZEOF_SECTION_HEADER]);
        }

        let size_of_image = self
            .sections
            .iter()
            .map(|s| align_up(s.virtual_address + s.virtual_size.max(1), self.section_alignment))
            .max()
            .unwrap_or_else(|| align_up(self.size_of_headers, self.section_alignment));
        let offset = self.size_of_image_offset();
        LittleEndian::write_u32(&mut data[offset..offset + 4], size_of_image);

        Ok(())
    }

    /// End of the last section's raw data in the file.
    pub fn end_of_sections(&self) -> usize {
        self.sections
            .iter()
            .map(|s| (s.pointer_to_raw_data + s.size_of_raw_data) as usize)
            .max()
            .unwrap_or(self.size_of_headers as usize)
    }

    /// Next free relative virtual address after every section.
    pub fn next_virtual_address(&self) -> u32 {
        self.sections
            .iter()
            .map(|s| align_up(s.virtual_address + s.virtual_size.max(s.size_of_raw_data), self.section_alignment))
            .max()
            .unwrap_or_else(|| align_up(self.size_of_headers, self.section_alignment))
    }
}

/// Read a NUL terminated ASCII string at a file offset.
pub fn read_c_string(data: &[u8], offset: usize) -> Result<String> {
    let tail = data
        .get(offset..)
        .ok_or_else(|| anyhow!("string offset {:#x} out of bounds", offset))?;
    let end = tail
        .iter()
        .position(|b| *b == 0)
        .context("unterminated string")?;

    Ok(String::from_utf8_lossy(&tail[0..end]).to_string())
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testutil::PeBuilder};

    #[test]
    fn layout_fields() -> Result<()> {
        let data = PeBuilder::new().import("KERNEL32.dll").build();
        let layout = PeLayout::parse(&data)?;

        assert!(layout.is_64);
        assert_eq!(layout.number_of_data_directories, 16);
        assert_eq!(layout.file_alignment, 0x200);
        assert_eq!(layout.sections.len(), 1);
        assert_eq!(layout.sections[0].name(), ".idata");

        let (rva, _) = layout
            .data_directory(&data, IMAGE_DIRECTORY_ENTRY_IMPORT)
            .context("import directory")?;
        let offset = layout.rva_to_offset(rva).context("mapping rva")?;
        assert_eq!(offset, 0x400);
        assert_eq!(layout.image_base, 0x1_4000_0000);
        assert!(layout.data_directory(&data, IMAGE_DIRECTORY_ENTRY_RESOURCE).is_none());

        Ok(())
    }

    #[test]
    fn pe32_images() -> Result<()> {
        let data = PeBuilder::new().pe32().build();
        let layout = PeLayout::parse(&data)?;
        assert!(!layout.is_64);
        assert_eq!(layout.number_of_data_directories, 16);

        Ok(())
    }

    #[test]
    fn rejects_non_pe() {
        assert!(PeLayout::parse(b"\x7fELF").is_err());
        assert!(PeLayout::parse(&[b'M', b'Z', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert_eq!(align_up(0x201, 0x200), 0x400);
    }
}
