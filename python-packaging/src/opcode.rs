// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! CPython opcode numbering and instruction decoding.

Only the opcodes needed to find imports, module level assignments and
exception handler ranges are described. Everything else is decoded as an
opaque instruction.
*/

use {
    crate::bytecode::PythonVersion,
    anyhow::{anyhow, Result},
    std::ops::Range,
};

/// Argument to `CALL_INTRINSIC_1` performing `from x import *`.
pub const INTRINSIC_IMPORT_STAR: u32 = 2;

/// Opcode numbers for one interpreter version.
#[derive(Clone, Copy, Debug)]
pub struct OpcodeTable {
    pub version: PythonVersion,
    pub cache: Option<u8>,
    pub extended_arg: u8,
    pub pop_top: u8,
    pub push_null: Option<u8>,
    pub return_value: u8,
    pub load_const: u8,
    pub load_name: u8,
    pub load_global: u8,
    pub load_attr: u8,
    pub load_method: Option<u8>,
    pub store_name: u8,
    pub store_global: u8,
    pub import_name: u8,
    pub import_from: u8,
    /// `IMPORT_STAR` before 3.12.
    pub import_star: Option<u8>,
    /// `CALL_INTRINSIC_1` from 3.12.
    pub call_intrinsic_1: Option<u8>,
    pub make_function: u8,
    /// Opcodes that invoke a callable.
    pub calls: &'static [u8],
    /// `SETUP_FINALLY` before 3.11. Later versions use an exception table.
    pub setup_finally: Option<u8>,
    /// First instruction of a `try` handler from 3.11.
    pub push_exc_info: Option<u8>,
    /// Start of a `with` block's exit handler from 3.11.
    pub with_except_start: Option<u8>,
    /// Bytes per unit of a relative jump argument.
    pub jump_unit: usize,
    /// `LOAD_GLOBAL` carries a push-null flag in its low bit from 3.11.
    pub load_global_shift: u32,
    /// `LOAD_ATTR` carries a method flag in its low bit from 3.12.
    pub load_attr_shift: u32,
}

const PY38: OpcodeTable = OpcodeTable {
    version: PythonVersion::new(3, 8),
    cache: None,
    extended_arg: 144,
    pop_top: 1,
    push_null: None,
    return_value: 83,
    load_const: 100,
    load_name: 101,
    load_global: 116,
    load_attr: 106,
    load_method: Some(160),
    store_name: 90,
    store_global: 97,
    import_name: 108,
    import_from: 109,
    import_star: Some(84),
    call_intrinsic_1: None,
    make_function: 132,
    calls: &[131, 141, 142, 161],
    setup_finally: Some(122),
    push_exc_info: None,
    with_except_start: None,
    jump_unit: 1,
    load_global_shift: 0,
    load_attr_shift: 0,
};

const PY39: OpcodeTable = OpcodeTable {
    version: PythonVersion::new(3, 9),
    ..PY38
};

const PY310: OpcodeTable = OpcodeTable {
    version: PythonVersion::new(3, 10),
    jump_unit: 2,
    ..PY38
};

const PY311: OpcodeTable = OpcodeTable {
    version: PythonVersion::new(3, 11),
    cache: Some(0),
    push_null: Some(2),
    calls: &[166, 171, 142],
    setup_finally: None,
    push_exc_info: Some(35),
    with_except_start: Some(49),
    jump_unit: 2,
    load_global_shift: 1,
    ..PY38
};

const PY312: OpcodeTable = OpcodeTable {
    version: PythonVersion::new(3, 12),
    import_star: None,
    call_intrinsic_1: Some(173),
    load_method: None,
    calls: &[171, 142],
    load_attr_shift: 1,
    ..PY311
};

const PY313: OpcodeTable = OpcodeTable {
    version: PythonVersion::new(3, 13),
    cache: Some(0),
    extended_arg: 71,
    pop_top: 32,
    push_null: Some(34),
    return_value: 36,
    load_const: 83,
    load_name: 92,
    load_global: 91,
    load_attr: 82,
    load_method: None,
    store_name: 114,
    store_global: 113,
    import_name: 75,
    import_from: 74,
    import_star: None,
    call_intrinsic_1: Some(55),
    make_function: 26,
    calls: &[53, 54, 57],
    setup_finally: None,
    push_exc_info: Some(33),
    with_except_start: Some(44),
    jump_unit: 2,
    load_global_shift: 1,
    load_attr_shift: 1,
};

impl OpcodeTable {
    /// Obtain the table for an interpreter version.
    pub fn for_version(version: PythonVersion) -> Result<&'static OpcodeTable> {
        match (version.major, version.minor) {
            (3, 8) => Ok(&PY38),
            (3, 9) => Ok(&PY39),
            (3, 10) => Ok(&PY310),
            (3, 11) => Ok(&PY311),
            (3, 12) => Ok(&PY312),
            (3, 13) => Ok(&PY313),
            _ => Err(anyhow!("no opcode table for Python {}", version)),
        }
    }

    pub fn is_call(&self, opcode: u8) -> bool {
        self.calls.contains(&opcode)
    }

    /// Whether the opcode is a `co_names` lookup and the index it refers to.
    pub fn name_load_index(&self, opcode: u8, arg: u32) -> Option<usize> {
        if opcode == self.load_name {
            Some(arg as usize)
        } else if opcode == self.load_global {
            Some((arg >> self.load_global_shift) as usize)
        } else if opcode == self.load_attr {
            Some((arg >> self.load_attr_shift) as usize)
        } else if Some(opcode) == self.load_method {
            Some(arg as usize)
        } else {
            None
        }
    }
}

/// A decoded instruction with `EXTENDED_ARG` prefixes folded in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Instruction {
    /// Byte offset of the instruction itself, not of its prefixes.
    pub offset: usize,
    pub opcode: u8,
    pub arg: u32,
}

/// Decode wordcode into instructions.
///
/// Inline cache entries are skipped.
pub fn decode_instructions(code: &[u8], table: &OpcodeTable) -> Vec<Instruction> {
    let mut instructions = vec![];
    let mut extended: u32 = 0;

    for (index, word) in code.chunks_exact(2).enumerate() {
        let (opcode, arg) = (word[0], word[1] as u32);

        if opcode == table.extended_arg {
            extended = (extended | arg) << 8;
            continue;
        }

        if Some(opcode) == table.cache {
            extended = 0;
            continue;
        }

        instructions.push(Instruction {
            offset: index * 2,
            opcode,
            arg: extended | arg,
        });
        extended = 0;
    }

    instructions
}

/// An entry in a 3.11+ exception table, in byte offsets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExceptionTableEntry {
    pub start: usize,
    pub end: usize,
    pub target: usize,
    pub depth: u32,
    pub lasti: bool,
}

fn read_varint(data: &[u8], pos: &mut usize) -> Option<u32> {
    let mut byte = *data.get(*pos)?;
    *pos += 1;
    let mut value = (byte & 0x3f) as u32;

    while byte & 0x40 != 0 {
        byte = *data.get(*pos)?;
        *pos += 1;
        value = (value << 6) | (byte & 0x3f) as u32;
    }

    Some(value)
}

/// Parse a 3.11+ `co_exceptiontable`.
///
/// Parsing stops at the first malformed entry.
pub fn parse_exception_table(data: &[u8]) -> Vec<ExceptionTableEntry> {
    let mut entries = vec![];
    let mut pos = 0;

    while pos < data.len() {
        if data[pos] & 0x80 == 0 {
            break;
        }

        let parsed = (|| {
            let start = read_varint(data, &mut pos)? as usize;
            let length = read_varint(data, &mut pos)? as usize;
            let target = read_varint(data, &mut pos)? as usize;
            let depth_lasti = read_varint(data, &mut pos)?;
            Some(ExceptionTableEntry {
                start: start * 2,
                end: (start + length) * 2,
                target: target * 2,
                depth: depth_lasti >> 1,
                lasti: depth_lasti & 1 != 0,
            })
        })();

        match parsed {
            Some(entry) => entries.push(entry),
            None => break,
        }
    }

    entries
}

/// Encode an exception table. Offsets are in bytes.
pub fn encode_exception_table(entries: &[ExceptionTableEntry]) -> Vec<u8> {
    fn write_varint(out: &mut Vec<u8>, value: u32, start: bool) {
        let mut chunks = vec![(value & 0x3f) as u8];
        let mut rest = value >> 6;
        while rest != 0 {
            chunks.push((rest & 0x3f) as u8 | 0x40);
            rest >>= 6;
        }
        chunks.reverse();
        if start {
            chunks[0] |= 0x80;
        }
        out.extend(chunks);
    }

    let mut out = vec![];
    for entry in entries {
        write_varint(&mut out, (entry.start / 2) as u32, true);
        write_varint(&mut out, ((entry.end - entry.start) / 2) as u32, false);
        write_varint(&mut out, (entry.target / 2) as u32, false);
        write_varint(
            &mut out,
            (entry.depth << 1) | if entry.lasti { 1 } else { 0 },
            false,
        );
    }

    out
}

/// Byte ranges of instructions protected by a `try` statement.
///
/// From 3.11 the exception table also covers `with` bodies, inlined
/// comprehensions and the cleanup of handlers themselves. Only entries whose
/// handler pushes the exception for an `except` or `finally` clause count.
pub fn guarded_ranges(
    instructions: &[Instruction],
    exception_table: Option<&[u8]>,
    table: &OpcodeTable,
) -> Vec<Range<usize>> {
    if let Some(data) = exception_table {
        let opcode_at = |offset: usize| {
            instructions
                .binary_search_by_key(&offset, |i| i.offset)
                .ok()
                .map(|index| (index, instructions[index].opcode))
        };

        return parse_exception_table(data)
            .into_iter()
            .filter(|entry| !entry.lasti)
            .filter(|entry| match opcode_at(entry.target) {
                Some((index, opcode)) if Some(opcode) == table.push_exc_info => {
                    instructions.get(index + 1).map(|i| i.opcode) != table.with_except_start
                }
                _ => false,
            })
            .map(|entry| entry.start..entry.end)
            .collect();
    }

    let setup_finally = match table.setup_finally {
        Some(op) => op,
        None => return vec![],
    };

    instructions
        .iter()
        .filter(|i| i.opcode == setup_finally)
        .map(|i| {
            let body_start = i.offset + 2;
            body_start..body_start + i.arg as usize * table.jump_unit
        })
        .collect()
}
