// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Python modules generated for frozen applications.

Launchers import `__startup__` and call its `run()`. It maps the stem of
the running executable to a module prefix, imports `<prefix>__init__` and
hands it `<prefix>__main__`, the frozen entry script. `BUILD_CONSTANTS`
exposes values fixed at build time.
*/

use {
    crate::error::FreezeError,
    std::{fmt::Write, time::SystemTime},
};

/// Name of the module launchers run.
pub const STARTUP_MODULE: &str = "__startup__";

/// Name of the module holding build constants.
pub const CONSTANTS_MODULE: &str = "BUILD_CONSTANTS";

/// Initializer running the entry script as `__main__`.
pub const CONSOLE_INIT_SOURCE: &str = r#"import sys
import importlib.util

def run(name):
    spec = importlib.util.find_spec(name)
    code = spec.loader.get_code(name)
    module = sys.modules["__main__"]
    module.__file__ = code.co_filename
    exec(code, module.__dict__)
"#;

/// Turn an executable stem into a valid module name prefix.
pub fn module_prefix(stem: &str) -> String {
    let mut prefix = stem
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect::<String>();

    if prefix.chars().next().map_or(true, |c| c.is_numeric()) {
        prefix.insert(0, '_');
    }

    prefix
}

/// Name of an executable's initializer module.
pub fn init_module_name(prefix: &str) -> String {
    format!("{}__init__", prefix)
}

/// Name of an executable's entry module.
pub fn main_module_name(prefix: &str) -> String {
    format!("{}__main__", prefix)
}

/// Source of the `__startup__` module.
///
/// `executables` holds `(stem, prefix)` pairs. Stems are lowercased on
/// Windows, where file names are case insensitive.
pub fn startup_source(executables: &[(String, String)], windows: bool) -> String {
    let mut source = String::from("import os\nimport sys\n\nEXECUTABLES = {\n");
    for (stem, prefix) in executables {
        let stem = if windows {
            stem.to_lowercase()
        } else {
            stem.clone()
        };
        let _ = writeln!(
            source,
            "    {}: {},",
            python_string_literal(&stem),
            python_string_literal(prefix)
        );
    }
    source.push_str("}\n");

    source.push_str(
        r#"
def run():
    stem = os.path.splitext(os.path.basename(sys.executable))[0]
    name = EXECUTABLES.get(os.path.normcase(stem))
    if name is None:
        raise RuntimeError("no frozen entry point for executable %r" % stem)
    sys.frozen = True
    module = __import__(name + "__init__")
    module.run(name + "__main__")
"#,
    );

    source
}

/// Render a string as a Python string literal.
pub fn python_string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');

    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c == '\x7f' => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }

    out.push('\'');
    out
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_alphabetic())
        && chars.all(|c| c == '_' || c.is_alphanumeric())
}

/// Whether a value is already a simple Python literal.
fn is_literal(value: &str) -> bool {
    if matches!(value, "True" | "False" | "None") {
        return true;
    }

    // Rust also parses "inf" and "nan" as floats.
    let numeric = value
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'));
    if numeric && value.parse::<f64>().is_ok() {
        return true;
    }

    let bytes = value.as_bytes();
    bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0]
        && !value.contains('\n')
}

/// Parse `NAME=VALUE` constants.
///
/// Values that are Python literals are kept as written. Anything else is
/// treated as a string. A bare `NAME` is `None`.
pub fn parse_constants(constants: &[String]) -> Result<Vec<(String, String)>, FreezeError> {
    constants
        .iter()
        .map(|constant| {
            let (name, value) = match constant.split_once('=') {
                Some((name, value)) => (name.trim(), value.trim()),
                None => (constant.trim(), "None"),
            };

            if !is_identifier(name) {
                return Err(FreezeError::config(format!(
                    "invalid constant name {:?}; must be a Python identifier",
                    name
                )));
            }

            let value = if is_literal(value) {
                value.to_string()
            } else {
                python_string_literal(value)
            };

            Ok((name.to_string(), value))
        })
        .collect()
}

fn build_timestamp() -> u64 {
    if let Some(epoch) = std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    {
        return epoch;
    }

    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Source of the `BUILD_CONSTANTS` module.
pub fn constants_source(
    constants: &[String],
    release: Option<&str>,
) -> Result<String, FreezeError> {
    let mut source = String::new();
    let _ = writeln!(source, "BUILD_TIMESTAMP = {}", build_timestamp());
    if let Some(release) = release {
        let _ = writeln!(
            source,
            "BUILD_RELEASE_STRING = {}",
            python_string_literal(release)
        );
    }

    for (name, value) in parse_constants(constants)? {
        let _ = writeln!(source, "{} = {}", name, value);
    }

    Ok(source)
}

#[cfg(test)]
mod tests {
    use {super::*, anyhow::Result};

    #[test]
    fn prefixes() {
        assert_eq!(module_prefix("hello"), "hello");
        assert_eq!(module_prefix("my-app.v2"), "my_app_v2");
        assert_eq!(module_prefix("7zip"), "_7zip");
        assert_eq!(init_module_name("hello"), "hello__init__");
        assert_eq!(main_module_name("hello"), "hello__main__");
    }

    #[test]
    fn string_literals() {
        assert_eq!(python_string_literal("plain"), "'plain'");
        assert_eq!(python_string_literal("it's"), r"'it\'s'");
        assert_eq!(python_string_literal("C:\\app\n"), r"'C:\\app\n'");
        assert_eq!(python_string_literal("\x01"), r"'\x01'");
    }

    #[test]
    fn startup_maps_stems() {
        let source = startup_source(
            &[
                ("Hello".to_string(), "Hello".to_string()),
                ("my-app".to_string(), "my_app".to_string()),
            ],
            true,
        );
        assert!(source.contains("    'hello': 'Hello',\n"));
        assert!(source.contains("    'my-app': 'my_app',\n"));
        assert!(source.contains("module.run(name + \"__main__\")"));

        let source = startup_source(&[("Hello".to_string(), "Hello".to_string())], false);
        assert!(source.contains("    'Hello': 'Hello',\n"));
    }

    #[test]
    fn constants() -> Result<()> {
        let parsed = parse_constants(&[
            "TOKEN='x'".to_string(),
            "COUNT=3".to_string(),
            "MODE=fast".to_string(),
            "FLAG".to_string(),
        ])?;
        assert_eq!(
            parsed,
            vec![
                ("TOKEN".to_string(), "'x'".to_string()),
                ("COUNT".to_string(), "3".to_string()),
                ("MODE".to_string(), "'fast'".to_string()),
                ("FLAG".to_string(), "None".to_string()),
            ]
        );

        assert!(matches!(
            parse_constants(&["not valid=1".to_string()]),
            Err(FreezeError::Config(_))
        ));

        let source = constants_source(&["MODE=fast".to_string()], Some("1.0"))?;
        assert!(source.starts_with("BUILD_TIMESTAMP = "));
        assert!(source.contains("BUILD_RELEASE_STRING = '1.0'\n"));
        assert!(source.ends_with("MODE = 'fast'\n"));

        Ok(())
    }
}
