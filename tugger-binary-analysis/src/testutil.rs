// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Builders of minimal binaries for tests.

The images carry just enough structure for their load tables to parse: no
code, no symbols and no section headers.
*/

pub use tugger_windows::testutil::PeBuilder;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const DT_NULL: u64 = 0;
const DT_NEEDED: u64 = 1;
const DT_STRTAB: u64 = 5;
const DT_STRSZ: u64 = 10;
const DT_SONAME: u64 = 14;
const DT_RPATH: u64 = 15;
const DT_RUNPATH: u64 = 29;

const ELF_HEADER_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const DYN_SIZE: usize = 16;

fn put_u16(data: &mut [u8], offset: usize, v: u16) {
    data[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(data: &mut [u8], offset: usize, v: u32) {
    data[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(data: &mut [u8], offset: usize, v: u64) {
    data[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

/// Builds a 64-bit little-endian ELF shared object.
#[derive(Clone, Debug, Default)]
pub struct ElfBuilder {
    needed: Vec<String>,
    runpath: Option<String>,
    rpath: Option<String>,
    soname: Option<String>,
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn needed(mut self, name: &str) -> Self {
        self.needed.push(name.to_string());
        self
    }

    pub fn runpath(mut self, value: &str) -> Self {
        self.runpath = Some(value.to_string());
        self
    }

    pub fn rpath(mut self, value: &str) -> Self {
        self.rpath = Some(value.to_string());
        self
    }

    pub fn soname(mut self, value: &str) -> Self {
        self.soname = Some(value.to_string());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut strings = vec![0u8];
        let mut add_string = |s: &str| -> u64 {
            let offset = strings.len() as u64;
            strings.extend_from_slice(s.as_bytes());
            strings.push(0);
            offset
        };

        let mut entries = vec![];
        for name in &self.needed {
            entries.push((DT_NEEDED, add_string(name)));
        }
        if let Some(v) = &self.runpath {
            entries.push((DT_RUNPATH, add_string(v)));
        }
        if let Some(v) = &self.rpath {
            entries.push((DT_RPATH, add_string(v)));
        }
        if let Some(v) = &self.soname {
            entries.push((DT_SONAME, add_string(v)));
        }

        let dynamic_offset = ELF_HEADER_SIZE + 2 * PHDR_SIZE;
        let dynamic_size = (entries.len() + 3) * DYN_SIZE;
        let strtab_offset = dynamic_offset + dynamic_size;
        entries.push((DT_STRTAB, strtab_offset as u64));
        entries.push((DT_STRSZ, strings.len() as u64));
        entries.push((DT_NULL, 0));

        let total = strtab_offset + strings.len();
        let mut data = vec![0u8; total];

        data[0..4].copy_from_slice(b"\x7fELF");
        data[4] = 2;
        data[5] = 1;
        data[6] = 1;
        put_u16(&mut data, 16, 3);
        put_u16(&mut data, 18, 62);
        put_u32(&mut data, 20, 1);
        put_u64(&mut data, 32, ELF_HEADER_SIZE as u64);
        put_u16(&mut data, 52, ELF_HEADER_SIZE as u16);
        put_u16(&mut data, 54, PHDR_SIZE as u16);
        put_u16(&mut data, 56, 2);
        put_u16(&mut data, 58, 64);

        let load = ELF_HEADER_SIZE;
        put_u32(&mut data, load, PT_LOAD);
        put_u32(&mut data, load + 4, 6);
        put_u64(&mut data, load + 32, total as u64);
        put_u64(&mut data, load + 40, total as u64);
        put_u64(&mut data, load + 48, 0x1000);

        let dynamic = ELF_HEADER_SIZE + PHDR_SIZE;
        put_u32(&mut data, dynamic, PT_DYNAMIC);
        put_u32(&mut data, dynamic + 4, 6);
        put_u64(&mut data, dynamic + 8, dynamic_offset as u64);
        put_u64(&mut data, dynamic + 16, dynamic_offset as u64);
        put_u64(&mut data, dynamic + 24, dynamic_offset as u64);
        put_u64(&mut data, dynamic + 32, dynamic_size as u64);
        put_u64(&mut data, dynamic + 40, dynamic_size as u64);
        put_u64(&mut data, dynamic + 48, 8);

        for (i, (tag, value)) in entries.iter().enumerate() {
            put_u64(&mut data, dynamic_offset + i * DYN_SIZE, *tag);
            put_u64(&mut data, dynamic_offset + i * DYN_SIZE + 8, *value);
        }

        data[strtab_offset..].copy_from_slice(&strings);

        data
    }
}

const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_EXECUTE: u32 = 2;
const MH_DYLIB: u32 = 6;
const CPU_TYPE_X86_64: u32 = 0x0100_0007;
pub const CPU_TYPE_ARM64: u32 = 0x0100_000c;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_ID_DYLIB: u32 = 0xd;
const LC_CODE_SIGNATURE: u32 = 0x1d;
const LC_LOAD_WEAK_DYLIB: u32 = 0x8000_0018;
const LC_RPATH: u32 = 0x8000_001c;
const LC_REEXPORT_DYLIB: u32 = 0x8000_001f;

fn align8(v: usize) -> usize {
    (v + 7) & !7
}

/// Builds a 64-bit little-endian Mach-O image.
#[derive(Clone, Debug)]
pub struct MachOBuilder {
    filetype: u32,
    cputype: u32,
    id: Option<String>,
    dylibs: Vec<(u32, String)>,
    rpaths: Vec<String>,
    spare: usize,
    code_signature: bool,
}

impl Default for MachOBuilder {
    fn default() -> Self {
        Self {
            filetype: MH_DYLIB,
            cputype: CPU_TYPE_X86_64,
            id: None,
            dylibs: vec![],
            rpaths: vec![],
            spare: 0,
            code_signature: false,
        }
    }
}

impl MachOBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executable(mut self) -> Self {
        self.filetype = MH_EXECUTE;
        self
    }

    pub fn cputype(mut self, cputype: u32) -> Self {
        self.cputype = cputype;
        self
    }

    pub fn id(mut self, name: &str) -> Self {
        self.id = Some(name.to_string());
        self
    }

    pub fn load(mut self, name: &str) -> Self {
        self.dylibs.push((LC_LOAD_DYLIB, name.to_string()));
        self
    }

    pub fn load_weak(mut self, name: &str) -> Self {
        self.dylibs.push((LC_LOAD_WEAK_DYLIB, name.to_string()));
        self
    }

    pub fn reexport(mut self, name: &str) -> Self {
        self.dylibs.push((LC_REEXPORT_DYLIB, name.to_string()));
        self
    }

    pub fn rpath(mut self, path: &str) -> Self {
        self.rpaths.push(path.to_string());
        self
    }

    /// Reserve extra bytes after each string, as `-headerpad` would.
    pub fn spare(mut self, bytes: usize) -> Self {
        self.spare = bytes;
        self
    }

    pub fn code_signature(mut self) -> Self {
        self.code_signature = true;
        self
    }

    fn dylib_command(&self, cmd: u32, name: &str) -> Vec<u8> {
        let size = align8(24 + name.len() + 1 + self.spare);
        let mut data = vec![0u8; size];
        put_u32(&mut data, 0, cmd);
        put_u32(&mut data, 4, size as u32);
        put_u32(&mut data, 8, 24);
        put_u32(&mut data, 12, 2);
        put_u32(&mut data, 16, 0x10000);
        put_u32(&mut data, 20, 0x10000);
        data[24..24 + name.len()].copy_from_slice(name.as_bytes());
        data
    }

    pub fn build(&self) -> Vec<u8> {
        let mut commands = vec![];

        if let Some(id) = &self.id {
            commands.push(self.dylib_command(LC_ID_DYLIB, id));
        }
        for (cmd, name) in &self.dylibs {
            commands.push(self.dylib_command(*cmd, name));
        }
        for path in &self.rpaths {
            let size = align8(12 + path.len() + 1 + self.spare);
            let mut data = vec![0u8; size];
            put_u32(&mut data, 0, LC_RPATH);
            put_u32(&mut data, 4, size as u32);
            put_u32(&mut data, 8, 12);
            data[12..12 + path.len()].copy_from_slice(path.as_bytes());
            commands.push(data);
        }
        if self.code_signature {
            let mut data = vec![0u8; 16];
            put_u32(&mut data, 0, LC_CODE_SIGNATURE);
            put_u32(&mut data, 4, 16);
            commands.push(data);
        }

        let sizeofcmds = commands.iter().map(|c| c.len()).sum::<usize>();
        let mut data = vec![0u8; 32];
        put_u32(&mut data, 0, MH_MAGIC_64);
        put_u32(&mut data, 4, self.cputype);
        put_u32(&mut data, 8, 3);
        put_u32(&mut data, 12, self.filetype);
        put_u32(&mut data, 16, commands.len() as u32);
        put_u32(&mut data, 20, sizeofcmds as u32);

        for command in commands {
            data.extend(command);
        }
        // Trailing room so the image is not just load commands.
        data.resize(data.len() + 64, 0);

        data
    }
}

/// Combine Mach-O images into a universal binary.
pub fn fat_macho(slices: &[Vec<u8>]) -> Vec<u8> {
    const ALIGN: usize = 0x1000;

    let mut data = vec![0u8; 8 + slices.len() * 20];
    data[0..4].copy_from_slice(&0xcafe_babe_u32.to_be_bytes());
    data[4..8].copy_from_slice(&(slices.len() as u32).to_be_bytes());

    let mut offset = ALIGN;
    let mut arches = vec![];
    for slice in slices {
        arches.push((offset, slice));
        offset = (offset + slice.len() + ALIGN - 1) & !(ALIGN - 1);
    }

    for (i, (offset, slice)) in arches.iter().enumerate() {
        let entry = 8 + i * 20;
        // cputype and cpusubtype come from the slice's own header.
        data[entry..entry + 4].copy_from_slice(&slice[4..8].iter().rev().copied().collect::<Vec<_>>());
        data[entry + 4..entry + 8].copy_from_slice(&slice[8..12].iter().rev().copied().collect::<Vec<_>>());
        data[entry + 8..entry + 12].copy_from_slice(&(*offset as u32).to_be_bytes());
        data[entry + 12..entry + 16].copy_from_slice(&(slice.len() as u32).to_be_bytes());
        data[entry + 16..entry + 20].copy_from_slice(&12u32.to_be_bytes());
    }

    for (offset, slice) in arches {
        data.resize(offset, 0);
        data.extend_from_slice(slice);
    }

    data
}
