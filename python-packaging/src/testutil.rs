// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Test helpers.

[FakeBytecodeCompiler] understands a tiny subset of Python: `import` and
`from ... import` statements, module level assignments, `def`/`class` blocks
(compiled to nested code objects), `try:` blocks (which guard the imports in
their body), `with` blocks (which do not) and `__import__("x")` / `importlib.import_module("x")` calls.
Everything else is ignored. The emitted code objects use the real marshal
layout and opcode numbering of the chosen interpreter version, so they can be
fed through the scanner and archive writer unchanged.
*/

use {
    crate::{
        bytecode::{BytecodeOptimizationLevel, PythonBytecodeCompiler, PythonVersion},
        marshal::{dumps_code, CodeLocals, CodeObject, PyString, Value},
        opcode::{encode_exception_table, ExceptionTableEntry, OpcodeTable, INTRINSIC_IMPORT_STAR},
    },
    anyhow::{anyhow, Result},
};

/// Environment variable naming the interpreter tests compile real bytecode with.
#[cfg(test)]
pub const TEST_PYTHON_ENV: &str = "PYFREEZE_TEST_PYTHON";

/// Find an interpreter of a supported version to test against.
///
/// `PYFREEZE_TEST_PYTHON` wins over `python3` on `PATH`. Tests needing an
/// interpreter pass without doing anything when there is none.
#[cfg(test)]
pub fn test_interpreter() -> Option<(std::path::PathBuf, crate::interpreter::PythonInterpreterInfo)>
{
    let python = match std::env::var_os(TEST_PYTHON_ENV) {
        Some(value) if !value.is_empty() => std::path::PathBuf::from(value),
        _ => which::which("python3").ok()?,
    };

    let info = crate::interpreter::PythonInterpreterInfo::from_interpreter(&python).ok()?;
    OpcodeTable::for_version(info.python_version()).ok()?;

    Some((python, info))
}

/// A compiler producing code objects without running Python.
pub struct FakeBytecodeCompiler {
    pub version: PythonVersion,
    /// `(filename, optimization level)` of every compile request.
    pub compiled: Vec<(String, BytecodeOptimizationLevel)>,
}

impl FakeBytecodeCompiler {
    pub fn new(version: PythonVersion) -> Self {
        Self {
            version,
            compiled: vec![],
        }
    }
}

impl Default for FakeBytecodeCompiler {
    fn default() -> Self {
        Self::new(PythonVersion::new(3, 12))
    }
}

impl PythonBytecodeCompiler for FakeBytecodeCompiler {
    fn get_magic_number(&self) -> u32 {
        self.version.magic_number().unwrap_or_default()
    }

    fn compile(
        &mut self,
        source: &[u8],
        filename: &str,
        optimize: BytecodeOptimizationLevel,
    ) -> Result<Vec<u8>> {
        self.compiled.push((filename.to_string(), optimize));

        let text = std::str::from_utf8(source)?;
        if text.contains("<syntax error>") {
            return Err(anyhow!("SyntaxError: invalid syntax ({})", filename));
        }

        let code = compile_source(text, filename, self.version)?;
        dumps_code(&code, self.version)
    }
}

/// An empty module code object.
pub fn empty_module_code(version: PythonVersion, filename: &str) -> CodeObject {
    CodeBuilder::new(version, OpcodeTable::for_version(version).ok())
        .finish(filename, "<module>")
}

/// Compile a source snippet into a code object.
pub fn compile_source(source: &str, filename: &str, version: PythonVersion) -> Result<CodeObject> {
    let table = OpcodeTable::for_version(version)?;
    let lines = parse_blocks(source);

    let mut builder = CodeBuilder::new(version, Some(table));
    builder.compile_block(&lines, true, filename)?;

    Ok(builder.finish(filename, "<module>"))
}

struct Line {
    text: String,
    children: Vec<Line>,
}

fn indentation(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn parse_blocks(source: &str) -> Vec<Line> {
    let raw = source
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .collect::<Vec<_>>();

    fn build(raw: &[&str], pos: &mut usize, indent: usize) -> Vec<Line> {
        let mut result = vec![];

        while *pos < raw.len() {
            let current = indentation(raw[*pos]);
            if current < indent {
                break;
            }

            let text = raw[*pos].trim().to_string();
            *pos += 1;

            let children = if text.ends_with(':') && *pos < raw.len() && indentation(raw[*pos]) > current {
                let child_indent = indentation(raw[*pos]);
                build(raw, pos, child_indent)
            } else {
                vec![]
            };

            result.push(Line { text, children });
        }

        result
    }

    let mut pos = 0;
    build(&raw, &mut pos, 0)
}

struct CodeBuilder {
    version: PythonVersion,
    table: Option<&'static OpcodeTable>,
    code: Vec<u8>,
    consts: Vec<Value>,
    names: Vec<Value>,
    guarded: Vec<ExceptionTableEntry>,
    globals_declared: Vec<String>,
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_alphabetic())
        && chars.all(|c| c == '_' || c.is_alphanumeric())
}

impl CodeBuilder {
    fn new(version: PythonVersion, table: Option<&'static OpcodeTable>) -> Self {
        Self {
            version,
            table,
            code: vec![],
            consts: vec![Value::None],
            names: vec![],
            guarded: vec![],
            globals_declared: vec![],
        }
    }

    fn table(&self) -> Result<&'static OpcodeTable> {
        self.table
            .ok_or_else(|| anyhow!("no opcode table for Python {}", self.version))
    }

    fn emit(&mut self, opcode: u8, arg: u32) -> Result<()> {
        let table = self.table()?;
        if arg > 0xff {
            self.code.push(table.extended_arg);
            self.code.push((arg >> 8) as u8);
        }
        self.code.push(opcode);
        self.code.push((arg & 0xff) as u8);
        Ok(())
    }

    fn add_const(&mut self, value: Value) -> u32 {
        if !matches!(value, Value::Code(_)) {
            if let Some(idx) = self.consts.iter().position(|v| v == &value) {
                return idx as u32;
            }
        }
        self.consts.push(value);
        (self.consts.len() - 1) as u32
    }

    fn add_name(&mut self, name: &str) -> u32 {
        let value = Value::Str(PyString::interned(name));
        if let Some(idx) = self.names.iter().position(|v| v == &value) {
            return idx as u32;
        }
        self.names.push(value);
        (self.names.len() - 1) as u32
    }

    fn emit_store(&mut self, name: &str, top_level: bool) -> Result<()> {
        let table = self.table()?;
        if top_level {
            let idx = self.add_name(name);
            self.emit(table.store_name, idx)
        } else if self.globals_declared.iter().any(|n| n == name) {
            let idx = self.add_name(name);
            self.emit(table.store_global, idx)
        } else {
            self.emit(table.pop_top, 0)
        }
    }

    fn emit_import(&mut self, level: u32, fromlist: Value, module: &str) -> Result<()> {
        let table = self.table()?;
        let level = self.add_const(Value::Int(level as i64));
        let fromlist = self.add_const(fromlist);
        let name = self.add_name(module);
        self.emit(table.load_const, level)?;
        self.emit(table.load_const, fromlist)?;
        self.emit(table.import_name, name)
    }

    fn compile_import(&mut self, rest: &str, top_level: bool) -> Result<()> {
        for part in rest.split(',') {
            let mut words = part.split_whitespace();
            let module = words.next().ok_or_else(|| anyhow!("empty import"))?;
            let alias = match (words.next(), words.next()) {
                (Some("as"), Some(alias)) => alias.to_string(),
                _ => module.split('.').next().unwrap_or(module).to_string(),
            };

            self.emit_import(0, Value::None, module)?;
            self.emit_store(&alias, top_level)?;
        }
        Ok(())
    }

    fn compile_from(&mut self, rest: &str, top_level: bool) -> Result<()> {
        let (module, names) = rest
            .split_once(" import ")
            .ok_or_else(|| anyhow!("malformed from import: {}", rest))?;
        let module = module.trim();
        let level = module.chars().take_while(|c| *c == '.').count() as u32;
        let module = &module[level as usize..];

        let names = names
            .trim()
            .trim_start_matches('(')
            .trim_end_matches(')')
            .split(',')
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map(|n| match n.split_once(" as ") {
                Some((name, alias)) => (name.trim().to_string(), alias.trim().to_string()),
                None => (n.to_string(), n.to_string()),
            })
            .collect::<Vec<_>>();

        let table = self.table()?;
        let fromlist = Value::Tuple(names.iter().map(|(n, _)| Value::str(n)).collect());
        self.emit_import(level, fromlist, module)?;

        if names.len() == 1 && names[0].0 == "*" {
            if let Some(op) = table.import_star {
                self.emit(op, 0)?;
            } else if let Some(op) = table.call_intrinsic_1 {
                self.emit(op, INTRINSIC_IMPORT_STAR)?;
                self.emit(table.pop_top, 0)?;
            }
            return Ok(());
        }

        for (name, alias) in names {
            let idx = self.add_name(&name);
            self.emit(table.import_from, idx)?;
            self.emit_store(&alias, top_level)?;
        }
        self.emit(table.pop_top, 0)
    }

    fn compile_dynamic_import(&mut self, line: &str) -> Result<bool> {
        let table = self.table()?;

        let (callee, attribute_of, rest) = if let Some(idx) = line.find("importlib.import_module(") {
            (
                "import_module",
                Some("importlib"),
                &line[idx + "importlib.import_module(".len()..],
            )
        } else if let Some(idx) = line.find("__import__(") {
            ("__import__", None, &line[idx + "__import__(".len()..])
        } else {
            return Ok(false);
        };

        let quote = match rest.chars().next() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Ok(false),
        };
        let module = match rest[1..].split(quote).next() {
            Some(module) => module.to_string(),
            None => return Ok(false),
        };

        if let Some(push_null) = table.push_null {
            self.emit(push_null, 0)?;
        }
        if let Some(object) = attribute_of {
            let idx = self.add_name(object);
            self.emit(table.load_name, idx)?;
            let idx = self.add_name(callee);
            self.emit(table.load_attr, idx << table.load_attr_shift)?;
        } else {
            let idx = self.add_name(callee);
            self.emit(table.load_name, idx)?;
        }
        let idx = self.add_const(Value::str(&module));
        self.emit(table.load_const, idx)?;
        self.emit(table.calls[0], 1)?;
        self.emit(table.pop_top, 0)?;

        Ok(true)
    }

    fn compile_nested(&mut self, line: &Line, filename: &str, top_level: bool) -> Result<()> {
        let header = line.text.trim_end_matches(':');
        let name = header
            .split(|c: char| c == '(' || c.is_whitespace())
            .nth(1)
            .unwrap_or("<lambda>")
            .to_string();

        let mut nested = CodeBuilder::new(self.version, self.table);
        nested.compile_block(&line.children, false, filename)?;
        let code = nested.finish(filename, &name);

        let table = self.table()?;
        let idx = self.add_const(Value::Code(Box::new(code)));
        self.emit(table.load_const, idx)?;
        self.emit(table.make_function, 0)?;
        self.emit_store(&name, top_level)
    }

    fn compile_try(&mut self, body: &[Line], top_level: bool, filename: &str) -> Result<()> {
        let table = self.table()?;

        if let Some(setup) = table.setup_finally {
            let setup_pos = self.code.len();
            self.emit(setup, 0)?;
            let body_start = self.code.len();
            self.compile_block(body, top_level, filename)?;
            let units = (self.code.len() - body_start) / table.jump_unit;
            if units > 0xff {
                return Err(anyhow!("try block too large for test compiler"));
            }
            self.code[setup_pos + 1] = units as u8;
        } else {
            self.compile_handled(body, top_level, filename, false)?;
        }

        Ok(())
    }

    /// Compile a block covered by an exception table entry, followed by its
    /// handler. `with` blocks get an exit handler instead of an `except`.
    fn compile_handled(
        &mut self,
        body: &[Line],
        top_level: bool,
        filename: &str,
        with: bool,
    ) -> Result<()> {
        let table = self.table()?;
        let (Some(push_exc_info), Some(with_except_start)) =
            (table.push_exc_info, table.with_except_start)
        else {
            return self.compile_block(body, top_level, filename);
        };

        let start = self.code.len();
        self.compile_block(body, top_level, filename)?;
        let end = self.code.len();

        if end > start {
            self.guarded.push(ExceptionTableEntry {
                start,
                end,
                target: end,
                depth: if with { 1 } else { 0 },
                lasti: with,
            });
            self.emit(push_exc_info, 0)?;
            if with {
                self.emit(with_except_start, 0)?;
            }
            self.emit(table.pop_top, 0)?;
        }

        Ok(())
    }

    fn compile_block(&mut self, lines: &[Line], top_level: bool, filename: &str) -> Result<()> {
        for line in lines {
            let text = line.text.as_str();

            if text.starts_with("def ") || text.starts_with("class ") {
                self.compile_nested(line, filename, top_level)?;
            } else if text == "try:" {
                self.compile_try(&line.children, top_level, filename)?;
            } else if text.starts_with("with ") && text.ends_with(':') {
                self.compile_handled(&line.children, top_level, filename, true)?;
            } else if text.ends_with(':') {
                // if/else/except/finally/for/while bodies run unguarded.
                self.compile_block(&line.children, top_level, filename)?;
            } else if let Some(rest) = text.strip_prefix("import ") {
                self.compile_import(rest, top_level)?;
            } else if let Some(rest) = text.strip_prefix("from ") {
                self.compile_from(rest, top_level)?;
            } else if let Some(rest) = text.strip_prefix("global ") {
                self.globals_declared
                    .extend(rest.split(',').map(|s| s.trim().to_string()));
            } else {
                self.compile_dynamic_import(text)?;

                if let Some((target, _)) = text.split_once('=') {
                    let target = target.trim().split(':').next().unwrap_or("").trim();
                    if is_identifier(target) && !text.contains("==") {
                        let idx = self.add_const(Value::None);
                        let table = self.table()?;
                        self.emit(table.load_const, idx)?;
                        self.emit_store(target, top_level)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn finish(mut self, filename: &str, name: &str) -> CodeObject {
        if let Some(table) = self.table {
            self.code.push(table.load_const);
            self.code.push(0);
            self.code.push(table.return_value);
            self.code.push(0);
        }

        let locals_plus = self.version.has_locals_plus();

        CodeObject {
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            stacksize: 4,
            flags: if name == "<module>" { 0 } else { 3 },
            code: self.code,
            consts: self.consts,
            names: self.names,
            locals: if locals_plus {
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
            },
            filename: Value::str(filename),
            name: Value::Str(PyString::interned(name)),
            qualname: if locals_plus {
                Some(Value::Str(PyString::interned(name)))
            } else {
                None
            },
            firstlineno: 1,
            linetable: vec![],
            exceptiontable: if locals_plus {
                Some(encode_exception_table(&self.guarded))
            } else {
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{import_scanner::ImportScanner, marshal::loads_code},
    };

    const SOURCE: &str = "\
import os, a.b as ab
from .sibling import (x, y as z)
from star import *
VALUE = 1
try:
    import fast
except ImportError:
    fast = None
with open(\"x\") as fh:
    import ctx
def helper():
    global CACHE
    import lazy
    CACHE = importlib.import_module(\"plugin\")
";

    #[test]
    fn fake_code_scans_like_real_code() -> Result<()> {
        for minor in 8..=13 {
            let version = PythonVersion::new(3, minor);
            let mut compiler = FakeBytecodeCompiler::new(version);
            let data = compiler.compile(SOURCE.as_bytes(), "m.py", BytecodeOptimizationLevel::Zero)?;
            let code = loads_code(&data, version)?;

            let result = ImportScanner::new(version)?.scan(&code);
            let names = result
                .imports
                .iter()
                .map(|i| i.name.as_str())
                .collect::<Vec<_>>();
            assert_eq!(
                names,
                vec!["os", "a.b", "sibling", "star", "fast", "ctx", "lazy", "plugin"],
                "Python {}",
                version
            );

            assert_eq!(result.imports[2].level, 1);
            assert_eq!(result.imports[2].fromlist, vec!["x", "y"]);
            assert!(result.imports[3].is_star());
            assert!(result.imports[4].guarded, "Python {}", version);
            assert!(!result.imports[5].is_conditional(), "Python {}", version);
            assert!(!result.imports[6].top_level);
            assert!(result.imports[7].dynamic);

            for name in ["os", "a", "ab", "x", "z", "VALUE", "fast", "helper", "CACHE"] {
                if name == "a" {
                    assert!(!result.global_names.contains(name));
                } else {
                    assert!(result.global_names.contains(name), "{} in {}", name, version);
                }
            }
        }

        Ok(())
    }

    #[test]
    fn syntax_errors() {
        let mut compiler = FakeBytecodeCompiler::default();
        assert!(compiler
            .compile(b"<syntax error>", "bad.py", BytecodeOptimizationLevel::Zero)
            .is_err());
    }
}
