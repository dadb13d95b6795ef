// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Read and write CPython's marshal serialization format.

Only marshal version 4 (the format used by every supported interpreter) is
handled. Code object field layout differs between 3.8-3.10 and 3.11+, so the
reader and writer are parameterized by [PythonVersion].

The writer never emits back-references. Interpreters accept such streams;
they are merely larger than what `marshal.dumps()` would produce.
*/

use {
    crate::bytecode::PythonVersion,
    anyhow::{anyhow, Result},
    byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt},
    std::io::{Cursor, Read},
};

const TYPE_NULL: u8 = b'0';
const TYPE_NONE: u8 = b'N';
const TYPE_FALSE: u8 = b'F';
const TYPE_TRUE: u8 = b'T';
const TYPE_STOPITER: u8 = b'S';
const TYPE_ELLIPSIS: u8 = b'.';
const TYPE_INT: u8 = b'i';
const TYPE_INT64: u8 = b'I';
const TYPE_FLOAT: u8 = b'f';
const TYPE_BINARY_FLOAT: u8 = b'g';
const TYPE_COMPLEX: u8 = b'x';
const TYPE_BINARY_COMPLEX: u8 = b'y';
const TYPE_LONG: u8 = b'l';
const TYPE_STRING: u8 = b's';
const TYPE_INTERNED: u8 = b't';
const TYPE_REF: u8 = b'r';
const TYPE_TUPLE: u8 = b'(';
const TYPE_LIST: u8 = b'[';
const TYPE_DICT: u8 = b'{';
const TYPE_CODE: u8 = b'c';
const TYPE_UNICODE: u8 = b'u';
const TYPE_SET: u8 = b'<';
const TYPE_FROZENSET: u8 = b'>';
const TYPE_ASCII: u8 = b'a';
const TYPE_ASCII_INTERNED: u8 = b'A';
const TYPE_SMALL_TUPLE: u8 = b')';
const TYPE_SHORT_ASCII: u8 = b'z';
const TYPE_SHORT_ASCII_INTERNED: u8 = b'Z';

const FLAG_REF: u8 = 0x80;

/// Digits of marshalled longs hold 15 bits.
const LONG_SHIFT: u32 = 15;

/// Refuse absurd lengths before allocating.
const MAX_LENGTH: usize = 0x7fff_ffff;

/// A Python string as stored in a marshal stream.
///
/// The payload is kept as raw bytes because marshal encodes str values with
/// `surrogatepass`, which can produce byte sequences that are not valid
/// UTF-8.
#[derive(Clone, Debug, PartialEq)]
pub struct PyString {
    pub data: Vec<u8>,
    pub interned: bool,
}

impl PyString {
    pub fn new(value: &str) -> Self {
        Self {
            data: value.as_bytes().to_vec(),
            interned: false,
        }
    }

    pub fn interned(value: &str) -> Self {
        Self {
            data: value.as_bytes().to_vec(),
            interned: true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).to_string()
    }
}

/// A value in a marshal stream.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    None,
    False,
    True,
    StopIteration,
    Ellipsis,
    Int(i64),
    /// An integer too large for `i64`, as sign plus 15-bit digits.
    Long {
        negative: bool,
        digits: Vec<u16>,
    },
    Float(f64),
    Complex(f64, f64),
    Bytes(Vec<u8>),
    Str(PyString),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    FrozenSet(Vec<Value>),
    Code(Box<CodeObject>),
}

impl Value {
    pub fn str(value: &str) -> Self {
        Self::Str(PyString::new(value))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => s.as_str(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::False => Some(0),
            Self::True => Some(1),
            _ => None,
        }
    }

    pub fn as_code(&self) -> Option<&CodeObject> {
        match self {
            Self::Code(code) => Some(code),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Self::Tuple(items) => Some(items),
            _ => None,
        }
    }
}

/// Variable name tables, which changed shape in 3.11.
#[derive(Clone, Debug, PartialEq)]
pub enum CodeLocals {
    /// `co_varnames`, `co_freevars` and `co_cellvars` (3.8 - 3.10).
    Split {
        nlocals: i32,
        varnames: Vec<Value>,
        freevars: Vec<Value>,
        cellvars: Vec<Value>,
    },
    /// `co_localsplusnames` and `co_localspluskinds` (3.11+).
    LocalsPlus { names: Vec<Value>, kinds: Vec<u8> },
}

/// A Python code object.
#[derive(Clone, Debug, PartialEq)]
pub struct CodeObject {
    pub argcount: i32,
    pub posonlyargcount: i32,
    pub kwonlyargcount: i32,
    pub stacksize: i32,
    pub flags: i32,
    pub code: Vec<u8>,
    pub consts: Vec<Value>,
    pub names: Vec<Value>,
    pub locals: CodeLocals,
    pub filename: Value,
    pub name: Value,
    /// Only present on 3.11+.
    pub qualname: Option<Value>,
    pub firstlineno: i32,
    /// `co_lnotab` before 3.10, `co_linetable` after.
    pub linetable: Vec<u8>,
    /// Only present on 3.11+.
    pub exceptiontable: Option<Vec<u8>>,
}

impl CodeObject {
    /// Obtain the name in `co_names` at an index.
    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).and_then(|v| v.as_str())
    }

    pub fn const_at(&self, index: usize) -> Option<&Value> {
        self.consts.get(index)
    }

    /// Nested code objects stored as constants.
    pub fn nested_code(&self) -> impl Iterator<Item = &CodeObject> {
        self.consts.iter().filter_map(|v| v.as_code())
    }

    pub fn filename_lossy(&self) -> String {
        match &self.filename {
            Value::Str(s) => s.to_string_lossy(),
            _ => String::new(),
        }
    }

    /// Replace `co_filename` here and in every nested code object.
    pub fn rewrite_filename(&mut self, filename: &str) {
        self.filename = Value::str(filename);

        for value in self.consts.iter_mut() {
            if let Value::Code(code) = value {
                code.rewrite_filename(filename);
            }
        }
    }
}

/// Apply `(from_prefix, to_prefix)` substitutions to a source filename.
///
/// The first matching prefix wins. A `from_prefix` of `*` matches the
/// directory containing the file.
pub fn substitute_path_prefix(filename: &str, replace_paths: &[(String, String)]) -> String {
    for (from, to) in replace_paths {
        if from == "*" {
            let (dir, base) = match filename.rfind(|c| c == '/' || c == '\\') {
                Some(idx) => (&filename[..idx], &filename[idx + 1..]),
                None => ("", filename),
            };
            if dir.is_empty() {
                return filename.to_string();
            }
            return if to.is_empty() {
                base.to_string()
            } else {
                format!("{}/{}", to.trim_end_matches(['/', '\\']), base)
            };
        }

        if let Some(rest) = filename.strip_prefix(from.as_str()) {
            return format!("{}{}", to, rest);
        }
    }

    filename.to_string()
}

struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
    version: PythonVersion,
    refs: Vec<Value>,
}

impl<'a> Reader<'a> {
    fn read_i32(&mut self) -> Result<i32> {
        Ok(self.cursor.read_i32::<LittleEndian>()?)
    }

    fn read_length(&mut self) -> Result<usize> {
        let len = self.read_i32()?;
        if len < 0 || len as usize > MAX_LENGTH {
            return Err(anyhow!("invalid marshal length {}", len));
        }
        Ok(len as usize)
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let remaining = self.cursor.get_ref().len() - self.cursor.position() as usize;
        if len > remaining {
            return Err(anyhow!(
                "marshal data truncated: wanted {} bytes, {} remain",
                len,
                remaining
            ));
        }

        let mut buf = vec![0; len];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_items(&mut self, count: usize) -> Result<Vec<Value>> {
        (0..count).map(|_| self.read_value()).collect()
    }

    fn read_tuple(&mut self) -> Result<Vec<Value>> {
        match self.read_value()? {
            Value::Tuple(items) => Ok(items),
            v => Err(anyhow!("expected tuple in code object; got {:?}", v)),
        }
    }

    fn read_byte_string(&mut self) -> Result<Vec<u8>> {
        match self.read_value()? {
            Value::Bytes(data) => Ok(data),
            v => Err(anyhow!("expected bytes in code object; got {:?}", v)),
        }
    }

    fn read_text_float(&mut self) -> Result<f64> {
        let len = self.cursor.read_u8()? as usize;
        let raw = self.read_bytes(len)?;
        let text = String::from_utf8(raw)?;
        Ok(text.parse::<f64>()?)
    }

    fn read_long(&mut self) -> Result<Value> {
        let n = self.read_i32()?;
        let negative = n < 0;
        let count = n.unsigned_abs() as usize;
        if count > MAX_LENGTH / 2 {
            return Err(anyhow!("invalid long digit count {}", n));
        }

        let digits = (0..count)
            .map(|_| self.cursor.read_u16::<LittleEndian>())
            .collect::<std::io::Result<Vec<_>>>()?;

        if digits.len() <= 4 {
            let mut value: i64 = 0;
            for (i, digit) in digits.iter().enumerate() {
                value |= (*digit as i64) << (LONG_SHIFT * i as u32);
            }
            Ok(Value::Int(if negative { -value } else { value }))
        } else {
            Ok(Value::Long { negative, digits })
        }
    }

    fn read_code(&mut self) -> Result<CodeObject> {
        let argcount = self.read_i32()?;
        let posonlyargcount = self.read_i32()?;
        let kwonlyargcount = self.read_i32()?;

        if self.version.has_locals_plus() {
            let stacksize = self.read_i32()?;
            let flags = self.read_i32()?;
            let code = self.read_byte_string()?;
            let consts = self.read_tuple()?;
            let names = self.read_tuple()?;
            let localsplusnames = self.read_tuple()?;
            let kinds = self.read_byte_string()?;
            let filename = self.read_value()?;
            let name = self.read_value()?;
            let qualname = self.read_value()?;
            let firstlineno = self.read_i32()?;
            let linetable = self.read_byte_string()?;
            let exceptiontable = self.read_byte_string()?;

            Ok(CodeObject {
                argcount,
                posonlyargcount,
                kwonlyargcount,
                stacksize,
                flags,
                code,
                consts,
                names,
                locals: CodeLocals::LocalsPlus {
                    names: localsplusnames,
                    kinds,
                },
                filename,
                name,
                qualname: Some(qualname),
                firstlineno,
                linetable,
                exceptiontable: Some(exceptiontable),
            })
        } else {
            let nlocals = self.read_i32()?;
            let stacksize = self.read_i32()?;
            let flags = self.read_i32()?;
            let code = self.read_byte_string()?;
            let consts = self.read_tuple()?;
            let names = self.read_tuple()?;
            let varnames = self.read_tuple()?;
            let freevars = self.read_tuple()?;
            let cellvars = self.read_tuple()?;
            let filename = self.read_value()?;
            let name = self.read_value()?;
            let firstlineno = self.read_i32()?;
            let linetable = self.read_byte_string()?;

            Ok(CodeObject {
                argcount,
                posonlyargcount,
                kwonlyargcount,
                stacksize,
                flags,
                code,
                consts,
                names,
                locals: CodeLocals::Split {
                    nlocals,
                    varnames,
                    freevars,
                    cellvars,
                },
                filename,
                name,
                qualname: None,
                firstlineno,
                linetable,
                exceptiontable: None,
            })
        }
    }

    fn read_value(&mut self) -> Result<Value> {
        let raw = self.cursor.read_u8()?;
        let flag = raw & FLAG_REF != 0;
        let typ = raw & !FLAG_REF;

        if typ == TYPE_REF {
            let index = self.read_length()?;
            return self
                .refs
                .get(index)
                .cloned()
                .ok_or_else(|| anyhow!("invalid marshal back-reference {}", index));
        }

        // The slot is reserved before children are read so indices match the
        // order the writer assigned them in.
        let slot = if flag {
            self.refs.push(Value::None);
            Some(self.refs.len() - 1)
        } else {
            None
        };

        let value = match typ {
            TYPE_NULL => Value::Null,
            TYPE_NONE => Value::None,
            TYPE_FALSE => Value::False,
            TYPE_TRUE => Value::True,
            TYPE_STOPITER => Value::StopIteration,
            TYPE_ELLIPSIS => Value::Ellipsis,
            TYPE_INT => Value::Int(self.read_i32()? as i64),
            TYPE_INT64 => Value::Int(self.cursor.read_i64::<LittleEndian>()?),
            TYPE_LONG => self.read_long()?,
            TYPE_BINARY_FLOAT => Value::Float(self.cursor.read_f64::<LittleEndian>()?),
            TYPE_FLOAT => Value::Float(self.read_text_float()?),
            TYPE_BINARY_COMPLEX => {
                let real = self.cursor.read_f64::<LittleEndian>()?;
                let imag = self.cursor.read_f64::<LittleEndian>()?;
                Value::Complex(real, imag)
            }
            TYPE_COMPLEX => {
                let real = self.read_text_float()?;
                let imag = self.read_text_float()?;
                Value::Complex(real, imag)
            }
            TYPE_STRING => {
                let len = self.read_length()?;
                Value::Bytes(self.read_bytes(len)?)
            }
            TYPE_UNICODE | TYPE_INTERNED | TYPE_ASCII | TYPE_ASCII_INTERNED => {
                let len = self.read_length()?;
                Value::Str(PyString {
                    data: self.read_bytes(len)?,
                    interned: matches!(typ, TYPE_INTERNED | TYPE_ASCII_INTERNED),
                })
            }
            TYPE_SHORT_ASCII | TYPE_SHORT_ASCII_INTERNED => {
                let len = self.cursor.read_u8()? as usize;
                Value::Str(PyString {
                    data: self.read_bytes(len)?,
                    interned: typ == TYPE_SHORT_ASCII_INTERNED,
                })
            }
            TYPE_SMALL_TUPLE => {
                let len = self.cursor.read_u8()? as usize;
                Value::Tuple(self.read_items(len)?)
            }
            TYPE_TUPLE => {
                let len = self.read_length()?;
                Value::Tuple(self.read_items(len)?)
            }
            TYPE_LIST => {
                let len = self.read_length()?;
                Value::List(self.read_items(len)?)
            }
            TYPE_SET => {
                let len = self.read_length()?;
                Value::Set(self.read_items(len)?)
            }
            TYPE_FROZENSET => {
                let len = self.read_length()?;
                Value::FrozenSet(self.read_items(len)?)
            }
            TYPE_DICT => {
                let mut entries = vec![];
                loop {
                    let key = self.read_value()?;
                    if key == Value::Null {
                        break;
                    }
                    let value = self.read_value()?;
                    entries.push((key, value));
                }
                Value::Dict(entries)
            }
            TYPE_CODE => Value::Code(Box::new(self.read_code()?)),
            _ => {
                return Err(anyhow!(
                    "unknown marshal type {:#04x} at offset {}",
                    typ,
                    self.cursor.position() - 1
                ))
            }
        };

        if let Some(slot) = slot {
            self.refs[slot] = value.clone();
        }

        Ok(value)
    }
}

/// Parse a marshalled value.
pub fn loads(data: &[u8], version: PythonVersion) -> Result<Value> {
    let mut reader = Reader {
        cursor: Cursor::new(data),
        version,
        refs: vec![],
    };

    reader.read_value()
}

/// Parse a marshalled code object.
pub fn loads_code(data: &[u8], version: PythonVersion) -> Result<CodeObject> {
    match loads(data, version)? {
        Value::Code(code) => Ok(*code),
        v => Err(anyhow!("marshal data is not a code object: {:?}", v)),
    }
}

struct Writer {
    out: Vec<u8>,
    version: PythonVersion,
}

impl Writer {
    fn write_length(&mut self, len: usize) -> Result<()> {
        if len > MAX_LENGTH {
            return Err(anyhow!("value too large to marshal: {} items", len));
        }
        self.out.write_i32::<LittleEndian>(len as i32)?;
        Ok(())
    }

    fn write_sequence(&mut self, typ: u8, items: &[Value]) -> Result<()> {
        self.out.push(typ);
        self.write_length(items.len())?;
        for item in items {
            self.write_value(item)?;
        }
        Ok(())
    }

    fn write_tuple(&mut self, items: &[Value]) -> Result<()> {
        if items.len() < 256 {
            self.out.push(TYPE_SMALL_TUPLE);
            self.out.push(items.len() as u8);
            for item in items {
                self.write_value(item)?;
            }
            Ok(())
        } else {
            self.write_sequence(TYPE_TUPLE, items)
        }
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.out.push(TYPE_STRING);
        self.write_length(data.len())?;
        self.out.extend_from_slice(data);
        Ok(())
    }

    fn write_long(&mut self, negative: bool, digits: &[u16]) -> Result<()> {
        self.out.push(TYPE_LONG);
        let count = digits.len() as i32;
        self.out
            .write_i32::<LittleEndian>(if negative { -count } else { count })?;
        for digit in digits {
            self.out.write_u16::<LittleEndian>(*digit)?;
        }
        Ok(())
    }

    fn write_code(&mut self, code: &CodeObject) -> Result<()> {
        self.out.push(TYPE_CODE);
        self.out.write_i32::<LittleEndian>(code.argcount)?;
        self.out.write_i32::<LittleEndian>(code.posonlyargcount)?;
        self.out.write_i32::<LittleEndian>(code.kwonlyargcount)?;

        match (&code.locals, self.version.has_locals_plus()) {
            (CodeLocals::LocalsPlus { names, kinds }, true) => {
                self.out.write_i32::<LittleEndian>(code.stacksize)?;
                self.out.write_i32::<LittleEndian>(code.flags)?;
                self.write_bytes(&code.code)?;
                self.write_tuple(&code.consts)?;
                self.write_tuple(&code.names)?;
                self.write_tuple(names)?;
                self.write_bytes(kinds)?;
                self.write_value(&code.filename)?;
                self.write_value(&code.name)?;
                self.write_value(code.qualname.as_ref().unwrap_or(&code.name))?;
                self.out.write_i32::<LittleEndian>(code.firstlineno)?;
                self.write_bytes(&code.linetable)?;
                self.write_bytes(code.exceptiontable.as_deref().unwrap_or(&[]))?;
            }
            (
                CodeLocals::Split {
                    nlocals,
                    varnames,
                    freevars,
                    cellvars,
                },
                false,
            ) => {
                self.out.write_i32::<LittleEndian>(*nlocals)?;
                self.out.write_i32::<LittleEndian>(code.stacksize)?;
                self.out.write_i32::<LittleEndian>(code.flags)?;
                self.write_bytes(&code.code)?;
                self.write_tuple(&code.consts)?;
                self.write_tuple(&code.names)?;
                self.write_tuple(varnames)?;
                self.write_tuple(freevars)?;
                self.write_tuple(cellvars)?;
                self.write_value(&code.filename)?;
                self.write_value(&code.name)?;
                self.out.write_i32::<LittleEndian>(code.firstlineno)?;
                self.write_bytes(&code.linetable)?;
            }
            _ => {
                return Err(anyhow!(
                    "code object layout does not match Python {}",
                    self.version
                ))
            }
        }

        Ok(())
    }

    fn write_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.out.push(TYPE_NULL),
            Value::None => self.out.push(TYPE_NONE),
            Value::False => self.out.push(TYPE_FALSE),
            Value::True => self.out.push(TYPE_TRUE),
            Value::StopIteration => self.out.push(TYPE_STOPITER),
            Value::Ellipsis => self.out.push(TYPE_ELLIPSIS),
            Value::Int(v) => {
                if let Ok(small) = i32::try_from(*v) {
                    self.out.push(TYPE_INT);
                    self.out.write_i32::<LittleEndian>(small)?;
                } else {
                    let mut magnitude = v.unsigned_abs();
                    let mut digits = vec![];
                    while magnitude != 0 {
                        digits.push((magnitude & 0x7fff) as u16);
                        magnitude >>= LONG_SHIFT;
                    }
                    self.write_long(*v < 0, &digits)?;
                }
            }
            Value::Long { negative, digits } => self.write_long(*negative, digits)?,
            Value::Float(v) => {
                self.out.push(TYPE_BINARY_FLOAT);
                self.out.write_f64::<LittleEndian>(*v)?;
            }
            Value::Complex(real, imag) => {
                self.out.push(TYPE_BINARY_COMPLEX);
                self.out.write_f64::<LittleEndian>(*real)?;
                self.out.write_f64::<LittleEndian>(*imag)?;
            }
            Value::Bytes(data) => self.write_bytes(data)?,
            Value::Str(s) => {
                if s.data.is_ascii() && s.data.len() < 256 {
                    self.out.push(if s.interned {
                        TYPE_SHORT_ASCII_INTERNED
                    } else {
                        TYPE_SHORT_ASCII
                    });
                    self.out.push(s.data.len() as u8);
                } else if s.data.is_ascii() {
                    self.out.push(if s.interned {
                        TYPE_ASCII_INTERNED
                    } else {
                        TYPE_ASCII
                    });
                    self.write_length(s.data.len())?;
                } else {
                    self.out
                        .push(if s.interned { TYPE_INTERNED } else { TYPE_UNICODE });
                    self.write_length(s.data.len())?;
                }
                self.out.extend_from_slice(&s.data);
            }
            Value::Tuple(items) => self.write_tuple(items)?,
            Value::List(items) => self.write_sequence(TYPE_LIST, items)?,
            Value::Set(items) => self.write_sequence(TYPE_SET, items)?,
            Value::FrozenSet(items) => self.write_sequence(TYPE_FROZENSET, items)?,
            Value::Dict(entries) => {
                self.out.push(TYPE_DICT);
                for (key, value) in entries {
                    self.write_value(key)?;
                    self.write_value(value)?;
                }
                self.out.push(TYPE_NULL);
            }
            Value::Code(code) => self.write_code(code)?,
        }

        Ok(())
    }
}

/// Serialize a value.
pub fn dumps(value: &Value, version: PythonVersion) -> Result<Vec<u8>> {
    let mut writer = Writer {
        out: vec![],
        version,
    };
    writer.write_value(value)?;

    Ok(writer.out)
}

/// Serialize a code object.
pub fn dumps_code(code: &CodeObject, version: PythonVersion) -> Result<Vec<u8>> {
    dumps(&Value::Code(Box::new(code.clone())), version)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PY310: PythonVersion = PythonVersion::new(3, 10);
    const PY312: PythonVersion = PythonVersion::new(3, 12);

    #[test]
    fn scalars() -> Result<()> {
        assert_eq!(loads(b"N", PY312)?, Value::None);
        assert_eq!(loads(b"i\x05\x00\x00\x00", PY312)?, Value::Int(5));
        assert_eq!(loads(b"i\xff\xff\xff\xff", PY312)?, Value::Int(-1));
        assert_eq!(loads(b"z\x03abc", PY312)?, Value::str("abc"));
        assert_eq!(
            loads(b"\xda\x03abc", PY312)?,
            Value::Str(PyString::interned("abc"))
        );
        assert_eq!(loads(b"s\x02\x00\x00\x00hi", PY312)?, Value::Bytes(b"hi".to_vec()));

        // 2**40 as three 15-bit digits.
        assert_eq!(
            loads(b"l\x03\x00\x00\x00\x00\x00\x00\x00\x00\x04", PY312)?,
            Value::Int(1 << 40)
        );

        Ok(())
    }

    #[test]
    fn back_references() -> Result<()> {
        // ('abc', 'abc') where the second element references the first.
        let data = b"\xa9\x02\xda\x03abcr\x01\x00\x00\x00";
        assert_eq!(
            loads(data, PY312)?,
            Value::Tuple(vec![
                Value::Str(PyString::interned("abc")),
                Value::Str(PyString::interned("abc"))
            ])
        );

        assert!(loads(b"r\x05\x00\x00\x00", PY312).is_err());

        Ok(())
    }

    #[test]
    fn truncated() {
        assert!(loads(b"s\x10\x00\x00\x00abc", PY312).is_err());
        assert!(loads(b"", PY312).is_err());
        assert!(loads(b"?", PY312).is_err());
    }

    fn sample_code(version: PythonVersion) -> CodeObject {
        let locals = if version.has_locals_plus() {
            CodeLocals::LocalsPlus {
                names: vec![],
                kinds: vec![],
            }
        } else {
            CodeLocals::Split {
                nlocals: 0,
                varnames: vec![],
                freevars: vec![],
                cellvars: vec![],
            }
        };

        CodeObject {
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            stacksize: 2,
            flags: 0,
            code: vec![100, 0, 83, 0],
            consts: vec![Value::None, Value::Int(1 << 40), Value::Float(1.5)],
            names: vec![Value::Str(PyString::interned("os"))],
            locals,
            filename: Value::str("/src/app/mod.py"),
            name: Value::str("<module>"),
            qualname: if version.has_locals_plus() {
                Some(Value::str("<module>"))
            } else {
                None
            },
            firstlineno: 1,
            linetable: vec![],
            exceptiontable: if version.has_locals_plus() {
                Some(vec![])
            } else {
                None
            },
        }
    }

    #[test]
    fn code_objects_survive_writing() -> Result<()> {
        for version in [PY310, PY312] {
            let mut code = sample_code(version);
            let mut inner = sample_code(version);
            inner.name = Value::str("inner");
            code.consts.push(Value::Code(Box::new(inner)));

            let data = dumps_code(&code, version)?;
            assert_eq!(loads_code(&data, version)?, code);
        }

        Ok(())
    }

    #[test]
    fn layout_mismatch() {
        let code = sample_code(PY310);
        assert!(dumps_code(&code, PY312).is_err());
    }

    #[test]
    fn rewrite_filename_recurses() {
        let mut code = sample_code(PY312);
        code.consts
            .push(Value::Code(Box::new(sample_code(PY312))));
        code.rewrite_filename("app/mod.py");

        assert_eq!(code.filename_lossy(), "app/mod.py");
        assert_eq!(
            code.nested_code().next().map(|c| c.filename_lossy()),
            Some("app/mod.py".to_string())
        );
    }

    #[test]
    fn path_prefix_substitution() {
        let replace = vec![
            ("/home/me/src/".to_string(), "".to_string()),
            ("/usr/lib/python3.12".to_string(), "stdlib".to_string()),
        ];
        assert_eq!(
            substitute_path_prefix("/home/me/src/app/main.py", &replace),
            "app/main.py"
        );
        assert_eq!(
            substitute_path_prefix("/usr/lib/python3.12/os.py", &replace),
            "stdlib/os.py"
        );
        assert_eq!(substitute_path_prefix("/opt/x.py", &replace), "/opt/x.py");

        let star = vec![("*".to_string(), "".to_string())];
        assert_eq!(substitute_path_prefix("/opt/pkg/x.py", &star), "x.py");
    }

    #[test]
    fn stdlib_round_trip_with_interpreter() -> Result<()> {
        use crate::{
            bytecode::{BytecodeCompiler, BytecodeOptimizationLevel, PythonBytecodeCompiler},
            testutil::test_interpreter,
        };

        let Some((python, info)) = test_interpreter() else {
            return Ok(());
        };
        let Some(stdlib) = info.stdlib.clone() else {
            return Ok(());
        };
        let version = info.python_version();

        let td = tempfile::Builder::new()
            .prefix("python-packaging-test")
            .tempdir()?;
        let mut compiler = BytecodeCompiler::new(&python)?;
        let mut stems = vec![];

        for rel in [
            "argparse.py",
            "ast.py",
            "contextlib.py",
            "dataclasses.py",
            "enum.py",
            "json/decoder.py",
            "tokenize.py",
            "typing.py",
        ] {
            let path = stdlib.join(rel);
            let source = std::fs::read(&path)?;
            let data = compiler.compile(
                &source,
                &path.to_string_lossy(),
                BytecodeOptimizationLevel::Zero,
            )?;
            let rewritten = dumps_code(&loads_code(&data, version)?, version)?;

            let stem = rel.replace('/', "_");
            std::fs::write(td.path().join(format!("{}.orig", stem)), &data)?;
            std::fs::write(td.path().join(format!("{}.ours", stem)), &rewritten)?;
            stems.push(stem);
        }

        let output = std::process::Command::new(&python)
            .arg("-c")
            .arg(
                "import marshal, os, sys\n\
                 for stem in sys.argv[2:]:\n\
                 \x20   read = lambda ext: open(os.path.join(sys.argv[1], stem + ext), 'rb').read()\n\
                 \x20   print(stem, marshal.loads(read('.orig')) == marshal.loads(read('.ours')))\n",
            )
            .arg(td.path())
            .args(&stems)
            .output()?;
        assert!(
            output.status.success(),
            "{}",
            String::from_utf8_lossy(&output.stderr)
        );

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert_eq!(stdout.lines().count(), stems.len());
        for line in stdout.lines() {
            assert!(line.ends_with(" True"), "{}", line);
        }

        Ok(())
    }
}
