// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Discover imports by inspecting compiled code objects.

Code is never executed. Instead the instruction stream is walked looking for
the `LOAD_CONST level; LOAD_CONST fromlist; IMPORT_NAME name` sequence every
`import` statement compiles to, plus calls of `__import__()` and
`importlib.import_module()` with a literal string argument.
*/

use {
    crate::{
        bytecode::PythonVersion,
        marshal::{CodeObject, Value},
        opcode::{decode_instructions, guarded_ranges, Instruction, OpcodeTable},
    },
    anyhow::Result,
    std::collections::BTreeSet,
};

/// Functions whose first string argument names a module to import.
const DYNAMIC_IMPORT_FUNCTIONS: &[&str] = &["__import__", "import_module"];

/// A single import found in a code object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImportRecord {
    /// The name passed to `IMPORT_NAME`. Empty for `from . import x`.
    pub name: String,
    /// Names after `from X import`. Empty for plain `import X`.
    pub fromlist: Vec<String>,
    /// Relative import level. 0 for absolute imports.
    pub level: u32,
    /// Whether the import executes as part of the module body.
    pub top_level: bool,
    /// Whether the import sits inside a `try` block.
    pub guarded: bool,
    /// Whether the import came from a call like `__import__("x")`.
    pub dynamic: bool,
}

impl ImportRecord {
    pub fn is_star(&self) -> bool {
        self.fromlist.iter().any(|name| name == "*")
    }

    pub fn is_relative(&self) -> bool {
        self.level > 0
    }

    /// Whether failing to resolve this import is only a maybe-missing.
    pub fn is_conditional(&self) -> bool {
        !self.top_level || self.guarded || self.dynamic
    }
}

/// Everything learned from scanning a module's code.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanResult {
    pub imports: Vec<ImportRecord>,
    /// Names bound at module scope.
    pub global_names: BTreeSet<String>,
}

/// Resolve an absolute module name for an import found in `importer`.
///
/// `importer_is_package` controls whether `importer` itself is the anchor
/// package for level 1 imports.
pub fn resolve_relative_name(
    importer: &str,
    importer_is_package: bool,
    name: &str,
    level: u32,
) -> Option<String> {
    if level == 0 {
        return Some(name.to_string());
    }

    let mut parts: Vec<&str> = importer.split('.').collect();
    if !importer_is_package {
        parts.pop();
    }

    for _ in 1..level {
        parts.pop()?;
    }

    if parts.is_empty() {
        return None;
    }

    let base = parts.join(".");

    Some(if name.is_empty() {
        base
    } else {
        format!("{}.{}", base, name)
    })
}

/// Scans code objects of one interpreter version.
pub struct ImportScanner {
    table: &'static OpcodeTable,
}

impl ImportScanner {
    pub fn new(version: PythonVersion) -> Result<Self> {
        Ok(Self {
            table: OpcodeTable::for_version(version)?,
        })
    }

    pub fn version(&self) -> PythonVersion {
        self.table.version
    }

    /// Scan a module code object and everything nested in it.
    pub fn scan(&self, code: &CodeObject) -> ScanResult {
        let mut result = ScanResult::default();
        self.scan_code(code, true, &mut result);
        result
    }

    fn fromlist(value: Option<&Value>) -> Vec<String> {
        match value {
            Some(Value::Tuple(items)) | Some(Value::List(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            _ => vec![],
        }
    }

    fn const_arg<'a>(
        code: &'a CodeObject,
        instruction: Option<&Instruction>,
        load_const: u8,
    ) -> Option<&'a Value> {
        instruction
            .filter(|i| i.opcode == load_const)
            .and_then(|i| code.const_at(i.arg as usize))
    }

    fn scan_code(&self, code: &CodeObject, top_level: bool, result: &mut ScanResult) {
        let table = self.table;
        let instructions = decode_instructions(&code.code, table);
        let guarded = guarded_ranges(&instructions, code.exceptiontable.as_deref(), table);
        let is_guarded = |offset: usize| guarded.iter().any(|r| r.contains(&offset));

        let mut pending_dynamic: Option<(&str, usize)> = None;

        for (index, instruction) in instructions.iter().enumerate() {
            let previous = index.checked_sub(1).and_then(|i| instructions.get(i));
            let op = instruction.opcode;

            if op == table.import_name {
                let Some(name) = code.name_at(instruction.arg as usize) else {
                    continue;
                };

                let before = index.checked_sub(2).and_then(|i| instructions.get(i));
                let fromlist = Self::fromlist(Self::const_arg(code, previous, table.load_const));
                let level = Self::const_arg(code, before, table.load_const)
                    .and_then(|v| v.as_int())
                    .unwrap_or(0)
                    .max(0) as u32;

                result.imports.push(ImportRecord {
                    name: name.to_string(),
                    fromlist,
                    level,
                    top_level,
                    guarded: is_guarded(instruction.offset),
                    dynamic: false,
                });
            } else if top_level && (op == table.store_name || op == table.store_global) {
                if let Some(name) = code.name_at(instruction.arg as usize) {
                    result.global_names.insert(name.to_string());
                }
            } else if op == table.store_global {
                if let Some(name) = code.name_at(instruction.arg as usize) {
                    result.global_names.insert(name.to_string());
                }
            } else if op == table.load_const {
                let callee = previous
                    .and_then(|p| table.name_load_index(p.opcode, p.arg))
                    .and_then(|idx| code.name_at(idx));

                if let (Some(callee), Some(Value::Str(module))) =
                    (callee, code.const_at(instruction.arg as usize))
                {
                    if DYNAMIC_IMPORT_FUNCTIONS.contains(&callee) {
                        if let Some(module) = module.as_str() {
                            pending_dynamic = Some((module, instruction.offset));
                            continue;
                        }
                    }
                }
            } else if table.is_call(op) {
                if let Some((module, offset)) = pending_dynamic {
                    result.imports.push(ImportRecord {
                        name: module.to_string(),
                        fromlist: vec![],
                        level: 0,
                        top_level,
                        guarded: is_guarded(offset),
                        dynamic: true,
                    });
                }
            }

            pending_dynamic = None;
        }

        for nested in code.nested_code() {
            self.scan_code(nested, false, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::marshal::{CodeLocals, PyString},
    };

    fn code_310(code: Vec<u8>, consts: Vec<Value>, names: &[&str]) -> CodeObject {
        CodeObject {
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            stacksize: 4,
            flags: 0,
            code,
            consts,
            names: names
                .iter()
                .map(|n| Value::Str(PyString::interned(n)))
                .collect(),
            locals: CodeLocals::Split {
                nlocals: 0,
                varnames: vec![],
                freevars: vec![],
                cellvars: vec![],
            },
            filename: Value::str("m.py"),
            name: Value::str("<module>"),
            qualname: None,
            firstlineno: 1,
            linetable: vec![],
            exceptiontable: None,
        }
    }

    #[test]
    fn relative_names() {
        assert_eq!(
            resolve_relative_name("a.b.c", false, "x", 1),
            Some("a.b.x".to_string())
        );
        assert_eq!(
            resolve_relative_name("a.b", true, "x", 1),
            Some("a.b.x".to_string())
        );
        assert_eq!(
            resolve_relative_name("a.b.c", false, "", 2),
            Some("a".to_string())
        );
        assert_eq!(resolve_relative_name("a", false, "x", 1), None);
        assert_eq!(resolve_relative_name("a.b", true, "x", 3), None);
        assert_eq!(
            resolve_relative_name("a", false, "os.path", 0),
            Some("os.path".to_string())
        );
    }

    #[test]
    fn plain_and_from_imports_310() -> Result<()> {
        // import os
        // from .sub import a, b
        let code = code_310(
            vec![
                100, 0, 100, 1, 108, 0, 90, 0, // import os
                100, 2, 100, 3, 108, 1, 109, 2, 90, 2, 109, 3, 90, 3, 1, 0, // from .sub
                100, 1, 83, 0,
            ],
            vec![
                Value::Int(0),
                Value::None,
                Value::Int(1),
                Value::Tuple(vec![Value::str("a"), Value::str("b")]),
            ],
            &["os", "sub", "a", "b"],
        );

        let scanner = ImportScanner::new(PythonVersion::new(3, 10))?;
        let result = scanner.scan(&code);

        assert_eq!(result.imports.len(), 2);
        assert_eq!(result.imports[0].name, "os");
        assert!(result.imports[0].fromlist.is_empty());
        assert!(!result.imports[0].is_conditional());
        assert_eq!(result.imports[1].name, "sub");
        assert_eq!(result.imports[1].level, 1);
        assert_eq!(result.imports[1].fromlist, vec!["a", "b"]);
        assert_eq!(
            result.global_names,
            ["a", "b", "os"].iter().map(|s| s.to_string()).collect()
        );

        Ok(())
    }

    #[test]
    fn guarded_and_nested_310() -> Result<()> {
        // try:
        //     import fast
        // except ImportError:
        //     pass
        let code = code_310(
            vec![
                122, 4, // SETUP_FINALLY covering the next 4 units
                100, 0, 100, 1, 108, 0, 90, 0, //
                100, 2, 83, 0,
            ],
            vec![Value::Int(0), Value::None, Value::None],
            &["fast"],
        );

        let nested = code_310(
            vec![100, 0, 100, 1, 108, 0, 1, 0, 100, 1, 83, 0],
            vec![Value::Int(0), Value::None],
            &["lazy"],
        );
        let mut outer = code_310(vec![100, 0, 83, 0], vec![Value::None], &[]);
        outer.consts.push(Value::Code(Box::new(nested)));

        let scanner = ImportScanner::new(PythonVersion::new(3, 10))?;

        let result = scanner.scan(&code);
        assert!(result.imports[0].guarded);
        assert!(result.imports[0].is_conditional());

        let result = scanner.scan(&outer);
        assert_eq!(result.imports.len(), 1);
        assert_eq!(result.imports[0].name, "lazy");
        assert!(!result.imports[0].top_level);

        Ok(())
    }

    #[test]
    fn star_and_dynamic_313() -> Result<()> {
        // from pkg import *
        // __import__("plugin")
        let code = CodeObject {
            locals: CodeLocals::LocalsPlus {
                names: vec![],
                kinds: vec![],
            },
            qualname: Some(Value::str("<module>")),
            exceptiontable: Some(vec![]),
            ..code_310(
                vec![
                    83, 0, 83, 1, 75, 0, 55, 2, 32, 0, // from pkg import *
                    34, 0, 92, 1, 83, 2, 53, 1, 0, 0, 0, 0, 0, 0, 32, 0, //
                    103, 3,
                ],
                vec![
                    Value::Int(0),
                    Value::Tuple(vec![Value::str("*")]),
                    Value::str("plugin"),
                    Value::None,
                ],
                &["pkg", "__import__"],
            )
        };

        let scanner = ImportScanner::new(PythonVersion::new(3, 13))?;
        let result = scanner.scan(&code);

        assert_eq!(result.imports.len(), 2);
        assert!(result.imports[0].is_star());
        assert_eq!(result.imports[1].name, "plugin");
        assert!(result.imports[1].dynamic);
        assert!(result.imports[1].is_conditional());

        Ok(())
    }

    #[test]
    fn with_body_is_not_guarded_311() -> Result<()> {
        use crate::opcode::{encode_exception_table, ExceptionTableEntry};

        // try:
        //     import fast
        // except:
        //     pass
        // with cm:
        //     import ctx
        let code = CodeObject {
            locals: CodeLocals::LocalsPlus {
                names: vec![],
                kinds: vec![],
            },
            qualname: Some(Value::str("<module>")),
            exceptiontable: Some(encode_exception_table(&[
                ExceptionTableEntry {
                    start: 4,
                    end: 12,
                    target: 12,
                    depth: 0,
                    lasti: false,
                },
                ExceptionTableEntry {
                    start: 12,
                    end: 20,
                    target: 20,
                    depth: 1,
                    lasti: true,
                },
                ExceptionTableEntry {
                    start: 26,
                    end: 36,
                    target: 40,
                    depth: 1,
                    lasti: true,
                },
            ])),
            ..code_310(
                vec![
                    151, 0, 9, 0, // RESUME, NOP
                    100, 0, 100, 1, 108, 0, 90, 0, // import fast
                    35, 0, 1, 0, 89, 0, 110, 5, // except: pass
                    119, 0, 101, 2, 53, 0, // RERAISE, LOAD_NAME cm, BEFORE_WITH
                    1, 0, 100, 0, 100, 1, 108, 1, 90, 1, // import ctx
                    100, 1, 83, 0, //
                    35, 0, 49, 0, 119, 2, // exit handler
                ],
                vec![Value::Int(0), Value::None],
                &["fast", "ctx", "cm"],
            )
        };

        let scanner = ImportScanner::new(PythonVersion::new(3, 11))?;
        let result = scanner.scan(&code);

        assert_eq!(result.imports.len(), 2);
        assert_eq!(result.imports[0].name, "fast");
        assert!(result.imports[0].guarded);
        assert_eq!(result.imports[1].name, "ctx");
        assert!(!result.imports[1].guarded);
        assert!(!result.imports[1].is_conditional());

        Ok(())
    }
}
