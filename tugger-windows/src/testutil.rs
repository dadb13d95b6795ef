// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Builders of minimal PE images for tests. */

use {
    crate::image::align_up,
    byteorder::{ByteOrder, LittleEndian},
};

const PE_OFFSET: usize = 0x80;
const SIZE_OF_HEADERS: u32 = 0x400;
const FILE_ALIGNMENT: u32 = 0x200;
const SECTION_ALIGNMENT: u32 = 0x1000;
const SECTION_RVA: u32 = 0x1000;

/// Builds a PE image with a single `.idata` section holding import and
/// delay-import descriptors.
#[derive(Clone, Debug, Default)]
pub struct PeBuilder {
    pe32: bool,
    dll: bool,
    imports: Vec<String>,
    delay_imports: Vec<String>,
}

impl PeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a 32-bit image instead of PE32+.
    pub fn pe32(mut self) -> Self {
        self.pe32 = true;
        self
    }

    pub fn dll(mut self) -> Self {
        self.dll = true;
        self
    }

    pub fn import(mut self, name: &str) -> Self {
        self.imports.push(name.to_string());
        self
    }

    pub fn delay_import(mut self, name: &str) -> Self {
        self.delay_imports.push(name.to_string());
        self
    }

    fn section_data(&self) -> (Vec<u8>, usize) {
        let imports_size = (self.imports.len() + 1) * 20;
        let delay_offset = (imports_size + 7) & !7;
        let zero_offset = delay_offset + (self.delay_imports.len() + 1) * 32;
        let mut names_offset = zero_offset + 16;

        let mut data = vec![0u8; names_offset];
        let zero_rva = SECTION_RVA + zero_offset as u32;

        let mut add_name = |data: &mut Vec<u8>, name: &str| -> u32 {
            let rva = SECTION_RVA + names_offset as u32;
            data.extend_from_slice(name.as_bytes());
            data.push(0);
            names_offset += name.len() + 1;
            rva
        };

        for (i, name) in self.imports.iter().enumerate() {
            let name_rva = add_name(&mut data, name);
            let entry = &mut data[i * 20..(i + 1) * 20];
            LittleEndian::write_u32(&mut entry[0..4], zero_rva);
            LittleEndian::write_u32(&mut entry[12..16], name_rva);
            LittleEndian::write_u32(&mut entry[16..20], zero_rva);
        }

        for (i, name) in self.delay_imports.iter().enumerate() {
            let name_rva = add_name(&mut data, name);
            let start = delay_offset + i * 32;
            let entry = &mut data[start..start + 32];
            LittleEndian::write_u32(&mut entry[0..4], 1);
            LittleEndian::write_u32(&mut entry[4..8], name_rva);
            LittleEndian::write_u32(&mut entry[8..12], zero_rva);
            LittleEndian::write_u32(&mut entry[12..16], zero_rva);
            LittleEndian::write_u32(&mut entry[16..20], zero_rva);
        }

        (data, delay_offset)
    }

    pub fn build(&self) -> Vec<u8> {
        let (section, delay_offset) = self.section_data();
        let virtual_size = section.len() as u32;
        let raw_size = align_up(virtual_size, FILE_ALIGNMENT);

        let mut data = vec![0u8; (SIZE_OF_HEADERS + raw_size) as usize];
        data[SIZE_OF_HEADERS as usize..SIZE_OF_HEADERS as usize + section.len()]
            .copy_from_slice(&section);

        data[0] = b'M';
        data[1] = b'Z';
        LittleEndian::write_u32(&mut data[0x3c..0x40], PE_OFFSET as u32);
        data[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

        let coff = PE_OFFSET + 4;
        let optional_size: u16 = if self.pe32 { 224 } else { 240 };
        LittleEndian::write_u16(
            &mut data[coff..coff + 2],
            if self.pe32 { 0x14c } else { 0x8664 },
        );
        LittleEndian::write_u16(&mut data[coff + 2..coff + 4], 1);
        LittleEndian::write_u16(&mut data[coff + 16..coff + 18], optional_size);
        LittleEndian::write_u16(
            &mut data[coff + 18..coff + 20],
            if self.dll { 0x2022 } else { 0x0022 },
        );

        let opt = coff + 20;
        let o = &mut data[opt..opt + optional_size as usize];
        LittleEndian::write_u16(&mut o[0..2], if self.pe32 { 0x10b } else { 0x20b });
        o[2] = 14;
        LittleEndian::write_u32(&mut o[8..12], raw_size);
        LittleEndian::write_u32(&mut o[20..24], SECTION_RVA);

        if self.pe32 {
            LittleEndian::write_u32(&mut o[28..32], 0x40_0000);
        } else {
            LittleEndian::write_u64(&mut o[24..32], 0x1_4000_0000);
        }
        LittleEndian::write_u32(&mut o[32..36], SECTION_ALIGNMENT);
        LittleEndian::write_u32(&mut o[36..40], FILE_ALIGNMENT);
        LittleEndian::write_u16(&mut o[40..42], 6);
        LittleEndian::write_u16(&mut o[48..50], 6);
        LittleEndian::write_u32(
            &mut o[56..60],
            align_up(SECTION_RVA + virtual_size, SECTION_ALIGNMENT),
        );
        LittleEndian::write_u32(&mut o[60..64], SIZE_OF_HEADERS);
        LittleEndian::write_u16(&mut o[68..70], 3);
        LittleEndian::write_u16(&mut o[70..72], 0x8160);

        let (stack_heap, directories) = if self.pe32 { (72, 96) } else { (72, 112) };
        if self.pe32 {
            for (i, value) in [0x10_0000u32, 0x1000, 0x10_0000, 0x1000].iter().enumerate() {
                LittleEndian::write_u32(&mut o[stack_heap + i * 4..stack_heap + i * 4 + 4], *value);
            }
        } else {
            for (i, value) in [0x10_0000u64, 0x1000, 0x10_0000, 0x1000].iter().enumerate() {
                LittleEndian::write_u64(&mut o[stack_heap + i * 8..stack_heap + i * 8 + 8], *value);
            }
        }
        LittleEndian::write_u32(&mut o[directories - 4..directories], 16);

        if !self.imports.is_empty() {
            let entry = directories + 8;
            LittleEndian::write_u32(&mut o[entry..entry + 4], SECTION_RVA);
            LittleEndian::write_u32(
                &mut o[entry + 4..entry + 8],
                ((self.imports.len() + 1) * 20) as u32,
            );
        }
        if !self.delay_imports.is_empty() {
            let entry = directories + 13 * 8;
            LittleEndian::write_u32(&mut o[entry..entry + 4], SECTION_RVA + delay_offset as u32);
            LittleEndian::write_u32(
                &mut o[entry + 4..entry + 8],
                ((self.delay_imports.len() + 1) * 32) as u32,
            );
        }

        let section_header = opt + optional_size as usize;
        let s = &mut data[section_header..section_header + 40];
        s[0..6].copy_from_slice(b".idata");
        LittleEndian::write_u32(&mut s[8..12], virtual_size);
        LittleEndian::write_u32(&mut s[12..16], SECTION_RVA);
        LittleEndian::write_u32(&mut s[16..20], raw_size);
        LittleEndian::write_u32(&mut s[20..24], SIZE_OF_HEADERS);
        LittleEndian::write_u32(&mut s[36..40], 0xc000_0040);

        data
    }
}

/// A single 1x1 32-bit icon in `.ico` container format.
pub fn sample_ico() -> Vec<u8> {
    let image = vec![0x11u8; 48];
    let mut data = vec![0u8; 6 + 16];
    LittleEndian::write_u16(&mut data[2..4], 1);
    LittleEndian::write_u16(&mut data[4..6], 1);
    data[6] = 1;
    data[7] = 1;
    LittleEndian::write_u16(&mut data[10..12], 1);
    LittleEndian::write_u16(&mut data[12..14], 32);
    LittleEndian::write_u32(&mut data[14..18], image.len() as u32);
    LittleEndian::write_u32(&mut data[18..22], 22);
    data.extend(image);

    data
}
