// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Work with Python bytecode.

Compiled modules are handled as raw marshalled code objects. The 16 byte
`.pyc` header is computed separately, when an archive entry is written, so
the same compiled payload can be emitted with any header mode.
*/

use {
    anyhow::{anyhow, Context, Result},
    byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt},
    std::{
        convert::TryFrom,
        fmt::{Display, Formatter},
        fs::File,
        io::{BufRead, BufReader, Read, Write},
        path::Path,
        process,
    },
};

pub const BYTECODE_COMPILER: &[u8] = include_bytes!("bytecodecompiler.py");

/// Size in bytes of a `.pyc` header.
pub const PYC_HEADER_LEN: usize = 16;

/// An optimization level for Python bytecode.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum BytecodeOptimizationLevel {
    Zero,
    One,
    Two,
}

impl Default for BytecodeOptimizationLevel {
    fn default() -> Self {
        Self::Zero
    }
}

impl Display for BytecodeOptimizationLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", i32::from(*self))
    }
}

impl TryFrom<i32> for BytecodeOptimizationLevel {
    type Error = &'static str;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BytecodeOptimizationLevel::Zero),
            1 => Ok(BytecodeOptimizationLevel::One),
            2 => Ok(BytecodeOptimizationLevel::Two),
            _ => Err("unsupported bytecode optimization level"),
        }
    }
}

impl From<BytecodeOptimizationLevel> for i32 {
    fn from(level: BytecodeOptimizationLevel) -> Self {
        match level {
            BytecodeOptimizationLevel::Zero => 0,
            BytecodeOptimizationLevel::One => 1,
            BytecodeOptimizationLevel::Two => 2,
        }
    }
}

/// A CPython release whose bytecode formats we understand.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PythonVersion {
    pub major: u8,
    pub minor: u8,
}

/// Bytecode magic numbers (low 16 bits) of the final release of each version.
const MAGIC_NUMBERS: &[(u8, u16)] = &[
    (8, 3413),
    (9, 3425),
    (10, 3439),
    (11, 3495),
    (12, 3531),
    (13, 3571),
];

impl PythonVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Resolve the version a bytecode magic number belongs to.
    ///
    /// Alpha and beta magic numbers map to the release they precede.
    pub fn from_magic_number(magic: u32) -> Result<Self> {
        if magic >> 16 != 0x0A0D {
            return Err(anyhow!("{:#x} is not a bytecode magic number", magic));
        }

        let number = (magic & 0xffff) as u16;

        let mut previous = 3400u16;
        for (minor, last) in MAGIC_NUMBERS {
            if number > previous && number <= *last {
                return Ok(Self::new(3, *minor));
            }
            previous = *last;
        }

        Err(anyhow!(
            "bytecode magic number {} belongs to an unsupported Python version",
            number
        ))
    }

    /// The magic number of the final release of this version.
    pub fn magic_number(&self) -> Result<u32> {
        MAGIC_NUMBERS
            .iter()
            .find(|(minor, _)| self.major == 3 && *minor == self.minor)
            .map(|(_, number)| *number as u32 | 0x0A0D_0000)
            .ok_or_else(|| anyhow!("Python {} is not supported", self))
    }

    /// Whether code objects use the 3.11+ "locals plus" layout.
    pub fn has_locals_plus(&self) -> bool {
        *self >= Self::new(3, 11)
    }
}

impl Display for PythonVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Something that turns Python source into marshalled code objects.
pub trait PythonBytecodeCompiler {
    /// The magic number written into `.pyc` headers for this compiler.
    fn get_magic_number(&self) -> u32;

    /// Compile source code and return the marshalled code object.
    fn compile(
        &mut self,
        source: &[u8],
        filename: &str,
        optimize: BytecodeOptimizationLevel,
    ) -> Result<Vec<u8>>;
}

/// An entity to perform Python bytecode compilation.
#[derive(Debug)]
pub struct BytecodeCompiler {
    _temp_dir: tempfile::TempDir,
    command: process::Child,

    /// Magic number for bytecode header.
    pub magic_number: u32,
}

impl BytecodeCompiler {
    /// Create a bytecode compiler using a Python executable.
    ///
    /// A Python process will be started and it will start executing a Python
    /// source file embedded in this crate. That process interacts with this
    /// object via a pipe, which is used to send bytecode compilation
    /// requests and receive the compiled bytecode. The process is terminated
    /// when this object is dropped.
    pub fn new(python: &Path) -> Result<BytecodeCompiler> {
        let temp_dir = tempfile::Builder::new()
            .prefix("bytecode-compiler")
            .tempdir()?;

        let script_path = temp_dir.path().join("bytecodecompiler.py");

        {
            let mut fh = File::create(&script_path)?;
            fh.write_all(BYTECODE_COMPILER)?;
        }

        let mut command = process::Command::new(python)
            .arg(script_path)
            .stdin(process::Stdio::piped())
            .stdout(process::Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning {}", python.display()))?;

        let stdin = command
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("unable to get stdin"))?;

        stdin.write_all(b"magic_number\n")?;
        stdin.flush()?;

        let stdout = command
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("unable to get stdout"))?;
        let magic_number = stdout.read_u32::<LittleEndian>()?;

        Ok(BytecodeCompiler {
            _temp_dir: temp_dir,
            command,
            magic_number,
        })
    }
}

impl PythonBytecodeCompiler for BytecodeCompiler {
    fn get_magic_number(&self) -> u32 {
        self.magic_number
    }

    fn compile(
        &mut self,
        source: &[u8],
        filename: &str,
        optimize: BytecodeOptimizationLevel,
    ) -> Result<Vec<u8>> {
        let stdin = self
            .command
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("unable to get stdin"))?;
        let stdout = self
            .command
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("unable to get stdout"))?;

        let mut reader = BufReader::new(stdout);

        stdin.write_all(b"compile\n")?;
        stdin.write_all(filename.len().to_string().as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.write_all(source.len().to_string().as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.write_all(i32::from(optimize).to_string().as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.write_all(filename.as_bytes())?;
        stdin.write_all(source)?;
        stdin.flush()?;

        let mut status = String::new();
        reader.read_line(&mut status)?;

        let mut len_s = String::new();
        reader.read_line(&mut len_s)?;
        let payload_len = len_s
            .trim_end()
            .parse::<u64>()
            .with_context(|| format!("parsing compiler response length {:?}", len_s))?;

        let mut payload: Vec<u8> = Vec::new();
        reader.take(payload_len).read_to_end(&mut payload)?;

        match status.trim_end() {
            "ok" => Ok(payload),
            "error" => Err(anyhow!(
                "compiling {}: {}",
                filename,
                String::from_utf8_lossy(&payload)
            )),
            other => Err(anyhow!("unexpected compiler response: {}", other)),
        }
    }
}

impl Drop for BytecodeCompiler {
    fn drop(&mut self) {
        if let Some(stdin) = self.command.stdin.as_mut() {
            if stdin.write_all(b"exit\n").and_then(|_| stdin.flush()).is_err() {
                let _ = self.command.kill();
            }
        }

        let _ = self.command.wait();
    }
}

/// How to write out a .pyc bytecode header.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BytecodeHeaderMode {
    /// Use a file modified time plus source size.
    ModifiedTimeAndSourceSize((u32, u32)),
    /// Check the hash against the hash of a source file.
    CheckedHash(u64),
    /// Do not check the hash, but embed it anyway.
    UncheckedHash(u64),
}

/// Compute the header for a .pyc file.
pub fn compute_bytecode_header(magic_number: u32, mode: BytecodeHeaderMode) -> Result<Vec<u8>> {
    let mut header: Vec<u8> = Vec::with_capacity(PYC_HEADER_LEN);

    header.write_u32::<LittleEndian>(magic_number)?;

    match mode {
        BytecodeHeaderMode::ModifiedTimeAndSourceSize((mtime, source_size)) => {
            header.write_u32::<LittleEndian>(0)?;
            header.write_u32::<LittleEndian>(mtime)?;
            header.write_u32::<LittleEndian>(source_size)?;
        }
        BytecodeHeaderMode::CheckedHash(hash) => {
            header.write_u32::<LittleEndian>(3)?;
            header.write_u64::<LittleEndian>(hash)?;
        }
        BytecodeHeaderMode::UncheckedHash(hash) => {
            header.write_u32::<LittleEndian>(1)?;
            header.write_u64::<LittleEndian>(hash)?;
        }
    }

    Ok(header)
}

/// Split a `.pyc` file into its magic number, header mode and code payload.
pub fn parse_bytecode_header(data: &[u8]) -> Result<(u32, BytecodeHeaderMode, &[u8])> {
    if data.len() < PYC_HEADER_LEN {
        return Err(anyhow!("pyc data too short: {} bytes", data.len()));
    }

    let mut reader = &data[0..PYC_HEADER_LEN];
    let magic = reader.read_u32::<LittleEndian>()?;
    let flags = reader.read_u32::<LittleEndian>()?;

    let mode = match flags {
        0 => {
            let mtime = reader.read_u32::<LittleEndian>()?;
            let size = reader.read_u32::<LittleEndian>()?;
            BytecodeHeaderMode::ModifiedTimeAndSourceSize((mtime, size))
        }
        1 => BytecodeHeaderMode::UncheckedHash(reader.read_u64::<LittleEndian>()?),
        3 => BytecodeHeaderMode::CheckedHash(reader.read_u64::<LittleEndian>()?),
        _ => return Err(anyhow!("invalid pyc flags: {}", flags)),
    };

    Ok((magic, mode, &data[PYC_HEADER_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header() -> Result<()> {
        assert_eq!(
            compute_bytecode_header(
                168627541,
                BytecodeHeaderMode::ModifiedTimeAndSourceSize((5, 10))
            )?,
            b"U\r\r\n\x00\x00\x00\x00\x05\x00\x00\x00\x0a\x00\x00\x00"
        );

        assert_eq!(
            compute_bytecode_header(168627541, BytecodeHeaderMode::CheckedHash(0))?,
            b"U\r\r\n\x03\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"
        );
        assert_eq!(
            compute_bytecode_header(168627541, BytecodeHeaderMode::UncheckedHash(0))?,
            b"U\r\r\n\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"
        );

        Ok(())
    }

    #[test]
    fn parse_header() -> Result<()> {
        let mut data = compute_bytecode_header(
            0x0A0D_0DCB,
            BytecodeHeaderMode::ModifiedTimeAndSourceSize((7, 42)),
        )?;
        data.extend(b"payload");

        let (magic, mode, body) = parse_bytecode_header(&data)?;
        assert_eq!(magic, 0x0A0D_0DCB);
        assert_eq!(mode, BytecodeHeaderMode::ModifiedTimeAndSourceSize((7, 42)));
        assert_eq!(body, b"payload");

        assert!(parse_bytecode_header(b"short").is_err());

        Ok(())
    }

    #[test]
    fn version_from_magic() -> Result<()> {
        assert_eq!(
            PythonVersion::from_magic_number(3413 | 0x0A0D_0000)?,
            PythonVersion::new(3, 8)
        );
        assert_eq!(
            PythonVersion::from_magic_number(3531 | 0x0A0D_0000)?,
            PythonVersion::new(3, 12)
        );
        // A 3.13 pre-release magic.
        assert_eq!(
            PythonVersion::from_magic_number(3550 | 0x0A0D_0000)?,
            PythonVersion::new(3, 13)
        );
        assert!(PythonVersion::from_magic_number(3600 | 0x0A0D_0000).is_err());
        assert!(PythonVersion::from_magic_number(3413).is_err());

        assert_eq!(PythonVersion::new(3, 11).magic_number()?, 0x0A0D_0DA7);
        assert!(PythonVersion::new(3, 11).has_locals_plus());
        assert!(!PythonVersion::new(3, 10).has_locals_plus());

        Ok(())
    }
}
