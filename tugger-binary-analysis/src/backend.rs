// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Per-format behavior behind a common interface.

Each object format gets a backend that knows how to recognize and parse
binaries, what a platform bundles by default, how load references are
resolved and how they are rewritten once files are placed.
*/

use {
    crate::{
        binary::{BinaryFormat, BinaryKind, ParsedBinary},
        elf::{self, ElfEdits, ELF_DEPENDENCIES_ENV},
        error::BinaryError,
        macho::{self, MachOEdits},
        pe::{self, PeParser},
        policy::CopyPolicy,
        util::{file_name, normalize_path, relative_path, rewrite_file},
    },
    log::debug,
    std::path::{Path, PathBuf},
    tugger_windows::{stamp_pe_file, ResourceStamp, StamperBackend},
};

/// Interpreter locations that feed platform defaults.
#[derive(Clone, Debug, Default)]
pub struct InterpreterPaths {
    pub prefix: PathBuf,
    pub libdir: Option<PathBuf>,
    pub destlib: Option<PathBuf>,
    /// File name of the interpreter's shared library.
    pub shared_library: Option<String>,
}

/// Names and directories a platform includes or excludes by default.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DefaultList {
    pub names: Vec<String>,
    pub paths: Vec<PathBuf>,
}

/// Directories a loader consults and their context.
#[derive(Clone, Debug)]
pub struct LoadContext {
    /// Directory of the referring binary.
    pub origin: PathBuf,
    /// Directory of the main executable of the process.
    pub executable_dir: PathBuf,
}

/// A bundled reference of a binary being rewritten.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlannedReference {
    pub raw: String,
    /// Final location of the referenced file.
    pub target: PathBuf,
}

/// Everything a backend needs to relink one placed binary.
#[derive(Clone, Debug)]
pub struct RewritePlan {
    /// The placed file to edit.
    pub path: PathBuf,
    pub kind: BinaryKind,
    pub references: Vec<PlannedReference>,
    /// Identity to assign when the file was renamed.
    pub new_soname: Option<String>,
    /// Directory the launcher is placed in.
    pub executable_dir: PathBuf,
}

/// Format specific operations.
pub trait OsBackend {
    fn format(&self) -> BinaryFormat;

    /// Whether a file is a binary of this format.
    fn is_binary(&self, path: &Path) -> bool {
        BinaryFormat::detect_path(path) == Some(self.format())
    }

    fn parse(&self, path: &Path) -> Result<ParsedBinary, BinaryError>;

    /// Libraries and directories bundled unless excluded by name.
    fn default_includes(&self, interpreter: &InterpreterPaths) -> DefaultList;

    /// Libraries and directories the platform provides.
    fn default_excludes(&self) -> DefaultList;

    /// Directories the loader searches when nothing else matches.
    fn system_search_paths(&self) -> Vec<PathBuf>;

    fn case_insensitive(&self) -> bool {
        false
    }

    /// Whether a reference never maps to a file on disk.
    fn is_virtual_reference(&self, _raw: &str) -> bool {
        false
    }

    /// Expand tokens of a search path entry.
    fn expand_search_path(&self, raw: &str, context: &LoadContext) -> Option<PathBuf>;

    /// Candidate locations of a reference from tokens and search paths.
    fn reference_candidates(
        &self,
        raw: &str,
        context: &LoadContext,
        search_paths: &[PathBuf],
    ) -> Vec<PathBuf> {
        if raw.contains('/') || raw.contains('\\') {
            vec![normalize_path(&context.origin.join(raw))]
        } else {
            search_paths.iter().map(|dir| dir.join(raw)).collect()
        }
    }

    /// Write resources into a placed binary.
    ///
    /// Returns whether the file changed.
    fn stamp_resources(&self, path: &Path, stamp: &ResourceStamp) -> Result<bool, BinaryError> {
        if !stamp.is_empty() {
            debug!(
                "{} binaries carry no resources; not stamping {}",
                self.format(),
                path.display()
            );
        }
        Ok(false)
    }

    /// Point the references of a placed binary at their placed targets.
    ///
    /// Returns whether the file changed.
    fn rewrite_references(&self, plan: &RewritePlan) -> Result<bool, BinaryError>;

    /// Work required after a binary was modified.
    fn finalize(&self, _path: &Path, _modified: bool) -> Result<(), BinaryError> {
        Ok(())
    }

    /// The combined copy policy for this platform.
    fn default_policy(&self, interpreter: &InterpreterPaths) -> CopyPolicy {
        let includes = self.default_includes(interpreter);
        let excludes = self.default_excludes();

        CopyPolicy {
            bin_includes: includes.names,
            bin_excludes: excludes.names,
            bin_path_includes: includes.paths,
            bin_path_excludes: excludes.paths,
            case_insensitive: self.case_insensitive(),
        }
    }
}

/// Drop include directories that lie inside excluded system directories.
///
/// A system interpreter has its library directory in e.g. `/usr/lib`, and
/// including that directory would bundle the whole system.
fn outside_system(paths: Vec<PathBuf>, excludes: &[PathBuf]) -> Vec<PathBuf> {
    paths
        .into_iter()
        .map(|p| normalize_path(&p))
        .filter(|p| !excludes.iter().any(|e| p.starts_with(e)))
        .collect()
}

fn interpreter_dirs(interpreter: &InterpreterPaths) -> Vec<PathBuf> {
    let mut dirs = vec![];
    for dir in [&interpreter.libdir, &interpreter.destlib].into_iter().flatten() {
        if !dirs.contains(dir) {
            dirs.push(dir.clone());
        }
    }
    dirs
}

const LINUX_EXCLUDED_NAMES: &[&str] = &[
    "ld-linux.so",
    "ld-linux-x86-64.so",
    "ld-linux-aarch64.so",
    "libc.so",
    "libdl.so",
    "libm.so",
    "libpthread.so",
    "librt.so",
    "libutil.so",
    "libresolv.so",
    "libgcc_s.so",
    "libstdc++.so",
];

const LINUX_EXCLUDED_DIRS: &[&str] = &[
    "/lib",
    "/lib32",
    "/lib64",
    "/usr/lib",
    "/usr/lib32",
    "/usr/lib64",
];

/// How ELF dependencies are discovered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ElfDependencies {
    /// Read `DT_NEEDED` entries and resolve them ourselves.
    Parse,
    /// Additionally use `ldd` to locate libraries.
    Ldd,
}

impl ElfDependencies {
    pub fn from_env() -> Result<Self, BinaryError> {
        match std::env::var(ELF_DEPENDENCIES_ENV).as_deref() {
            Err(_) | Ok("") | Ok("parse") => Ok(Self::Parse),
            Ok("ldd") => Ok(Self::Ldd),
            Ok(other) => Err(BinaryError::InvalidEnvironment(
                ELF_DEPENDENCIES_ENV.to_string(),
                format!("{} is not one of parse, ldd", other),
            )),
        }
    }
}

pub struct ElfBackend {
    pub dependencies: ElfDependencies,
}

impl ElfBackend {
    pub fn new(dependencies: ElfDependencies) -> Self {
        Self { dependencies }
    }
}

/// Express a directory relative to `$ORIGIN`.
fn origin_relative(origin: &Path, dir: &Path) -> String {
    let rel = relative_path(origin, dir);
    if rel.as_os_str().is_empty() {
        "$ORIGIN".to_string()
    } else {
        format!(
            "$ORIGIN/{}",
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/")
        )
    }
}

impl OsBackend for ElfBackend {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::Elf
    }

    fn parse(&self, path: &Path) -> Result<ParsedBinary, BinaryError> {
        let data = std::fs::read(path)?;
        let mut parsed = elf::parse_elf(&data)?;

        if self.dependencies == ElfDependencies::Ldd {
            parsed.hints = elf::ldd_dependencies(path)?;
        }

        Ok(parsed)
    }

    fn default_includes(&self, interpreter: &InterpreterPaths) -> DefaultList {
        DefaultList {
            names: interpreter.shared_library.iter().cloned().collect(),
            paths: outside_system(interpreter_dirs(interpreter), &self.default_excludes().paths),
        }
    }

    fn default_excludes(&self) -> DefaultList {
        DefaultList {
            names: LINUX_EXCLUDED_NAMES.iter().map(|s| s.to_string()).collect(),
            paths: LINUX_EXCLUDED_DIRS.iter().map(PathBuf::from).collect(),
        }
    }

    fn system_search_paths(&self) -> Vec<PathBuf> {
        let triplet = format!("{}-linux-gnu", std::env::consts::ARCH);
        vec![
            PathBuf::from("/lib").join(&triplet),
            PathBuf::from("/usr/lib").join(&triplet),
            PathBuf::from("/lib64"),
            PathBuf::from("/usr/lib64"),
            PathBuf::from("/lib"),
            PathBuf::from("/usr/lib"),
            PathBuf::from("/usr/local/lib"),
        ]
    }

    fn expand_search_path(&self, raw: &str, context: &LoadContext) -> Option<PathBuf> {
        let origin = context.origin.to_string_lossy();
        let expanded = raw.replace("${ORIGIN}", &origin).replace("$ORIGIN", &origin);

        // $LIB and $PLATFORM depend on the loader and are not expanded.
        if expanded.contains('$') || !Path::new(&expanded).is_absolute() {
            None
        } else {
            Some(normalize_path(Path::new(&expanded)))
        }
    }

    fn rewrite_references(&self, plan: &RewritePlan) -> Result<bool, BinaryError> {
        let origin = plan.path.parent().unwrap_or_else(|| Path::new(""));
        let current = elf::parse_elf(&std::fs::read(&plan.path)?)?;

        let mut entries = vec![];
        for r in &plan.references {
            if let Some(dir) = r.target.parent() {
                let entry = origin_relative(origin, dir);
                if !entries.contains(&entry) {
                    entries.push(entry);
                }
            }
        }
        // Without bundled dependencies only `$ORIGIN` relative entries may
        // survive. Build machine paths must not leak into the output.
        if entries.is_empty() {
            entries = current
                .rpaths
                .iter()
                .filter(|entry| entry.starts_with("$ORIGIN") || entry.starts_with("${ORIGIN}"))
                .cloned()
                .collect();
            if entries.is_empty() && !current.rpaths.is_empty() {
                entries.push("$ORIGIN".to_string());
            }
        }
        let runpath = entries.join(":");

        let mut edits = ElfEdits::default();
        if !entries.is_empty() && current.rpaths.join(":") != runpath {
            edits.runpath = Some(runpath);
        }
        for r in &plan.references {
            let name = file_name(&r.target);
            if name != r.raw
                && current.references.contains(&r.raw)
                && !edits.replace_needed.iter().any(|(old, _)| *old == r.raw)
            {
                edits.replace_needed.push((r.raw.clone(), name));
            }
        }
        if let Some(soname) = &plan.new_soname {
            if current.soname.as_ref() != Some(soname) {
                edits.soname = Some(soname.clone());
            }
        }

        if edits.is_empty() {
            return Ok(false);
        }

        debug!("relinking {}: {:?}", plan.path.display(), edits);
        elf::apply_edits(&plan.path, &edits)?;

        Ok(true)
    }
}

pub struct MachOBackend;

const EXECUTABLE_PATH: &str = "@executable_path";
const LOADER_PATH: &str = "@loader_path";
const RPATH: &str = "@rpath";

fn expand_token(raw: &str, token: &str, dir: &Path) -> Option<PathBuf> {
    let rest = raw.strip_prefix(token)?;
    let rest = rest.trim_start_matches('/');

    Some(normalize_path(&dir.join(rest)))
}

impl OsBackend for MachOBackend {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::MachO
    }

    fn parse(&self, path: &Path) -> Result<ParsedBinary, BinaryError> {
        macho::parse_macho(&std::fs::read(path)?)
    }

    fn default_includes(&self, interpreter: &InterpreterPaths) -> DefaultList {
        DefaultList {
            names: interpreter.shared_library.iter().cloned().collect(),
            paths: outside_system(interpreter_dirs(interpreter), &self.default_excludes().paths),
        }
    }

    fn default_excludes(&self) -> DefaultList {
        DefaultList {
            names: vec![],
            paths: vec![
                PathBuf::from("/usr/lib"),
                PathBuf::from("/System/Library/Frameworks"),
            ],
        }
    }

    fn system_search_paths(&self) -> Vec<PathBuf> {
        vec![PathBuf::from("/usr/local/lib"), PathBuf::from("/usr/lib")]
    }

    fn expand_search_path(&self, raw: &str, context: &LoadContext) -> Option<PathBuf> {
        if let Some(p) = expand_token(raw, LOADER_PATH, &context.origin) {
            Some(p)
        } else if let Some(p) = expand_token(raw, EXECUTABLE_PATH, &context.executable_dir) {
            Some(p)
        } else if Path::new(raw).is_absolute() {
            Some(normalize_path(Path::new(raw)))
        } else {
            None
        }
    }

    fn reference_candidates(
        &self,
        raw: &str,
        context: &LoadContext,
        search_paths: &[PathBuf],
    ) -> Vec<PathBuf> {
        if let Some(rest) = raw.strip_prefix(RPATH) {
            let rest = rest.trim_start_matches('/');
            search_paths
                .iter()
                .map(|dir| normalize_path(&dir.join(rest)))
                .collect()
        } else if raw.starts_with('@') {
            self.expand_search_path(raw, context).into_iter().collect()
        } else if Path::new(raw).is_absolute() {
            vec![PathBuf::from(raw)]
        } else {
            search_paths.iter().map(|dir| dir.join(raw)).collect()
        }
    }

    fn rewrite_references(&self, plan: &RewritePlan) -> Result<bool, BinaryError> {
        if plan.references.is_empty() {
            return Ok(false);
        }

        let current = macho::parse_macho(&std::fs::read(&plan.path)?)?;

        let mut edits = MachOEdits::default();
        for r in &plan.references {
            let rel = relative_path(&plan.executable_dir, &r.target);
            let new = format!(
                "{}/{}",
                EXECUTABLE_PATH,
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/")
            );

            if new != r.raw
                && current.references.contains(&r.raw)
                && !edits.changes.iter().any(|(old, _)| *old == r.raw)
            {
                edits.changes.push((r.raw.clone(), new));
            }
        }

        if edits.is_empty() {
            return Ok(false);
        }

        debug!("relinking {}: {:?}", plan.path.display(), edits);
        macho::apply_edits(&plan.path, &edits)?;

        Ok(true)
    }

    fn finalize(&self, path: &Path, modified: bool) -> Result<(), BinaryError> {
        if modified {
            macho::adhoc_sign(path)?;
        }

        Ok(())
    }
}

const WINDOWS_EXCLUDED_NAMES: &[&str] = &[
    "advapi32.dll",
    "bcrypt.dll",
    "comctl32.dll",
    "comdlg32.dll",
    "crypt32.dll",
    "gdi32.dll",
    "imm32.dll",
    "iphlpapi.dll",
    "kernel32.dll",
    "msvcrt.dll",
    "ntdll.dll",
    "oci.dll",
    "ole32.dll",
    "oleaut32.dll",
    "rpcrt4.dll",
    "secur32.dll",
    "setupapi.dll",
    "shell32.dll",
    "shlwapi.dll",
    "user32.dll",
    "version.dll",
    "winmm.dll",
    "ws2_32.dll",
];

pub struct PeBackend {
    pub parser: PeParser,
    pub stamper: StamperBackend,
}

impl PeBackend {
    pub fn new(parser: PeParser, stamper: StamperBackend) -> Self {
        Self { parser, stamper }
    }

    fn windows_dir() -> PathBuf {
        std::env::var_os("SystemRoot")
            .or_else(|| std::env::var_os("WINDIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("C:\\Windows"))
    }
}

impl OsBackend for PeBackend {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::Pe
    }

    fn is_binary(&self, path: &Path) -> bool {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        matches!(extension.as_str(), "exe" | "dll" | "pyd")
            && BinaryFormat::detect_path(path) == Some(BinaryFormat::Pe)
    }

    fn parse(&self, path: &Path) -> Result<ParsedBinary, BinaryError> {
        match self.parser {
            PeParser::Native => pe::parse_pe(&std::fs::read(path)?),
            PeParser::Objdump => pe::parse_pe_objdump(path),
        }
    }

    fn default_includes(&self, interpreter: &InterpreterPaths) -> DefaultList {
        DefaultList {
            names: interpreter.shared_library.iter().cloned().collect(),
            paths: vec![interpreter.prefix.clone(), interpreter.prefix.join("DLLs")],
        }
    }

    fn default_excludes(&self) -> DefaultList {
        let windows = Self::windows_dir();

        DefaultList {
            names: WINDOWS_EXCLUDED_NAMES.iter().map(|s| s.to_string()).collect(),
            paths: vec![windows.join("System32"), windows],
        }
    }

    fn system_search_paths(&self) -> Vec<PathBuf> {
        let windows = Self::windows_dir();
        vec![windows.join("System32"), windows]
    }

    fn case_insensitive(&self) -> bool {
        true
    }

    fn is_virtual_reference(&self, raw: &str) -> bool {
        let raw = raw.to_ascii_lowercase();
        raw.starts_with("api-ms-win-") || raw.starts_with("ext-ms-")
    }

    fn expand_search_path(&self, _raw: &str, _context: &LoadContext) -> Option<PathBuf> {
        None
    }

    fn stamp_resources(&self, path: &Path, stamp: &ResourceStamp) -> Result<bool, BinaryError> {
        if stamp.is_empty() {
            return Ok(false);
        }

        rewrite_file(path, |temp| {
            stamp_pe_file(temp, stamp, self.stamper).map_err(BinaryError::Pe)
        })?;

        Ok(true)
    }

    fn rewrite_references(&self, _plan: &RewritePlan) -> Result<bool, BinaryError> {
        Ok(false)
    }
}

/// Obtain the backend for a format, configured from the environment.
pub fn backend_for(format: BinaryFormat) -> Result<Box<dyn OsBackend>, BinaryError> {
    Ok(match format {
        BinaryFormat::Elf => Box::new(ElfBackend::new(ElfDependencies::from_env()?)),
        BinaryFormat::MachO => Box::new(MachOBackend),
        BinaryFormat::Pe => Box::new(PeBackend::new(
            PeParser::from_env()?,
            StamperBackend::from_env().map_err(BinaryError::Pe)?,
        )),
    })
}

/// Obtain the backend for the platform we run on.
pub fn host_backend() -> Result<Box<dyn OsBackend>, BinaryError> {
    backend_for(BinaryFormat::host())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testutil::{ElfBuilder, MachOBuilder, PeBuilder},
    };

    fn context(origin: &str) -> LoadContext {
        LoadContext {
            origin: PathBuf::from(origin),
            executable_dir: PathBuf::from("/app"),
        }
    }

    #[test]
    fn elf_search_path_tokens() {
        let backend = ElfBackend::new(ElfDependencies::Parse);
        let ctx = context("/opt/pkg/lib");

        assert_eq!(
            backend.expand_search_path("$ORIGIN/../deps", &ctx),
            Some(PathBuf::from("/opt/pkg/deps"))
        );
        assert_eq!(
            backend.expand_search_path("${ORIGIN}", &ctx),
            Some(PathBuf::from("/opt/pkg/lib"))
        );
        assert_eq!(backend.expand_search_path("$LIB/x", &ctx), None);
        assert_eq!(backend.expand_search_path("relative", &ctx), None);
    }

    #[test]
    fn macho_reference_candidates() {
        let backend = MachOBackend;
        let ctx = context("/opt/pkg/lib");
        let rpaths = vec![PathBuf::from("/r1"), PathBuf::from("/r2")];

        assert_eq!(
            backend.reference_candidates("@rpath/libfoo.dylib", &ctx, &rpaths),
            vec![PathBuf::from("/r1/libfoo.dylib"), PathBuf::from("/r2/libfoo.dylib")]
        );
        assert_eq!(
            backend.reference_candidates("@loader_path/../x/libbar.dylib", &ctx, &rpaths),
            vec![PathBuf::from("/opt/pkg/x/libbar.dylib")]
        );
        assert_eq!(
            backend.reference_candidates("@executable_path/libbaz.dylib", &ctx, &rpaths),
            vec![PathBuf::from("/app/libbaz.dylib")]
        );
        assert_eq!(
            backend.reference_candidates("/usr/lib/libSystem.B.dylib", &ctx, &rpaths),
            vec![PathBuf::from("/usr/lib/libSystem.B.dylib")]
        );
    }

    #[test]
    fn system_interpreter_dirs_are_not_included() {
        let backend = ElfBackend::new(ElfDependencies::Parse);
        let includes = backend.default_includes(&InterpreterPaths {
            prefix: "/usr".into(),
            libdir: Some("/usr/lib/x86_64-linux-gnu".into()),
            destlib: Some("/usr/lib/python3.12".into()),
            shared_library: Some("libpython3.12.so.1.0".into()),
        });
        assert!(includes.paths.is_empty());
        assert_eq!(includes.names, vec!["libpython3.12.so.1.0"]);

        let includes = backend.default_includes(&InterpreterPaths {
            prefix: "/opt/python".into(),
            libdir: Some("/opt/python/lib".into()),
            destlib: Some("/opt/python/lib/python3.12".into()),
            shared_library: None,
        });
        assert_eq!(
            includes.paths,
            vec![
                PathBuf::from("/opt/python/lib"),
                PathBuf::from("/opt/python/lib/python3.12")
            ]
        );
    }

    #[test]
    fn windows_defaults() {
        let backend = PeBackend::new(PeParser::Native, StamperBackend::Native);
        let policy = backend.default_policy(&InterpreterPaths {
            prefix: "C:\\Python312".into(),
            shared_library: Some("python312.dll".into()),
            ..Default::default()
        });

        assert!(policy.case_insensitive);
        assert!(policy.bin_excludes.contains(&"kernel32.dll".to_string()));
        assert_eq!(policy.bin_path_includes.len(), 2);
        assert!(backend.is_virtual_reference("API-MS-WIN-CRT-runtime-l1-1-0.dll"));
        assert!(!backend.is_virtual_reference("python312.dll"));
    }

    #[test]
    fn elf_relink_plan() -> Result<(), BinaryError> {
        let td = tempfile::Builder::new()
            .prefix("tugger-binary-analysis-test")
            .tempdir()?;
        let lib = td.path().join("lib");
        std::fs::create_dir_all(lib.join("pkg"))?;

        let ext = lib.join("pkg").join("_ext.so");
        std::fs::write(
            &ext,
            ElfBuilder::new()
                .needed("libfoo.so.1")
                .needed("libc.so.6")
                .runpath("/build/some/long/directory")
                .build(),
        )?;

        let backend = ElfBackend::new(ElfDependencies::Parse);
        let plan = RewritePlan {
            path: ext.clone(),
            kind: BinaryKind::Extension,
            references: vec![PlannedReference {
                raw: "libfoo.so.1".into(),
                target: lib.join("libfoo.so.1"),
            }],
            new_soname: None,
            executable_dir: td.path().to_path_buf(),
        };

        assert!(backend.rewrite_references(&plan)?);
        let parsed = elf::parse_elf(&std::fs::read(&ext)?)?;
        assert_eq!(parsed.rpaths, vec!["$ORIGIN/.."]);
        assert_eq!(parsed.references, vec!["libfoo.so.1", "libc.so.6"]);

        // Nothing left to do the second time around.
        let snapshot = std::fs::read(&ext)?;
        assert!(!backend.rewrite_references(&plan)?);
        assert_eq!(std::fs::read(&ext)?, snapshot);

        Ok(())
    }

    #[test]
    fn macho_relink_plan() -> Result<(), BinaryError> {
        let td = tempfile::Builder::new()
            .prefix("tugger-binary-analysis-test")
            .tempdir()?;
        let lib = td.path().join("lib");
        std::fs::create_dir_all(&lib)?;

        let ext = lib.join("_ext.so");
        std::fs::write(
            &ext,
            MachOBuilder::new()
                .spare(32)
                .load("/opt/homebrew/lib/libfoo.dylib")
                .load("/usr/lib/libSystem.B.dylib")
                .build(),
        )?;

        let plan = RewritePlan {
            path: ext.clone(),
            kind: BinaryKind::Extension,
            references: vec![PlannedReference {
                raw: "/opt/homebrew/lib/libfoo.dylib".into(),
                target: lib.join("libfoo.dylib"),
            }],
            new_soname: None,
            executable_dir: td.path().to_path_buf(),
        };

        assert!(MachOBackend.rewrite_references(&plan)?);
        assert_eq!(
            macho::parse_macho(&std::fs::read(&ext)?)?.references,
            vec!["@executable_path/lib/libfoo.dylib", "/usr/lib/libSystem.B.dylib"]
        );
        assert!(!MachOBackend.rewrite_references(&plan)?);

        Ok(())
    }

    #[test]
    fn pe_detection_requires_extension() -> Result<(), BinaryError> {
        let td = tempfile::Builder::new()
            .prefix("tugger-binary-analysis-test")
            .tempdir()?;
        let dll = td.path().join("foo.DLL");
        let other = td.path().join("foo.bin");
        let data = PeBuilder::new().dll().build();
        std::fs::write(&dll, &data)?;
        std::fs::write(&other, &data)?;

        let backend = PeBackend::new(PeParser::Native, StamperBackend::Native);
        assert!(backend.is_binary(&dll));
        assert!(!backend.is_binary(&other));

        Ok(())
    }
}
