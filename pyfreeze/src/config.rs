// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Project file parsing.

A project file is TOML with a `[build_exe]` table holding freezer options,
an optional `[metadata]` table and one `[[executables]]` entry per launcher
to produce. Relative paths are resolved against the directory holding the
project file.
*/

use {
    crate::{error::FreezeError, launcher::BaseKind, startup::parse_constants},
    python_packaging::{bytecode::BytecodeOptimizationLevel, hooks::Hook, policy::ZipPolicy},
    serde::Deserialize,
    std::path::{Path, PathBuf},
};

#[allow(non_snake_case)]
fn TRUE() -> bool {
    true
}

fn default_zip_filename() -> String {
    "library.zip".to_string()
}

fn default_base() -> String {
    "console".to_string()
}

/// A file to copy, with an optional destination.
///
/// A lone path keeps its file name. A `[source, target]` pair places the
/// source at `target`, which must be relative. Lists must not mix the two
/// forms.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum PathSpec {
    Source(PathBuf),
    Pair(PathBuf, PathBuf),
}

impl PathSpec {
    pub fn source(&self) -> &Path {
        match self {
            Self::Source(source) | Self::Pair(source, _) => source,
        }
    }

    /// The destination, relative to the directory the file is copied into.
    pub fn target(&self) -> Result<PathBuf, FreezeError> {
        match self {
            Self::Source(source) => source.file_name().map(PathBuf::from).ok_or_else(|| {
                FreezeError::config(format!("{} has no file name", source.display()))
            }),
            Self::Pair(_, target) => {
                if target.is_absolute() || target.has_root() {
                    Err(FreezeError::config(format!(
                        "target path {} must be relative",
                        target.display()
                    )))
                } else {
                    Ok(target.clone())
                }
            }
        }
    }

    fn resolve(&mut self, base: &Path) {
        match self {
            Self::Source(source) | Self::Pair(source, _) => *source = base.join(&*source),
        }
    }
}

/// Values feeding the version resource of launchers.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct Metadata {
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub company: Option<String>,
    pub copyright: Option<String>,
    pub trademarks: Option<String>,
}

/// A launcher to produce.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Executable {
    /// Entry script.
    pub script: PathBuf,
    /// Script run before the entry script. Defaults to the console initializer.
    #[serde(default)]
    pub init_script: Option<PathBuf>,
    /// Launcher base: `console`, `gui` or `service`.
    #[serde(default = "default_base")]
    pub base: String,
    /// File name of the launcher, without the platform suffix.
    #[serde(default)]
    pub target_name: Option<String>,
    #[serde(default)]
    pub icon: Option<PathBuf>,
    #[serde(default)]
    pub manifest: Option<PathBuf>,
    #[serde(default)]
    pub uac_admin: bool,
    #[serde(default)]
    pub uac_uiaccess: bool,
    #[serde(default)]
    pub shortcut_name: Option<String>,
    #[serde(default)]
    pub shortcut_dir: Option<String>,
    #[serde(default)]
    pub copyright: Option<String>,
    #[serde(default)]
    pub trademarks: Option<String>,
}

impl Executable {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            init_script: None,
            base: default_base(),
            target_name: None,
            icon: None,
            manifest: None,
            uac_admin: false,
            uac_uiaccess: false,
            shortcut_name: None,
            shortcut_dir: None,
            copyright: None,
            trademarks: None,
        }
    }

    /// Launcher file name stem.
    pub fn target_stem(&self) -> Result<String, FreezeError> {
        if let Some(name) = &self.target_name {
            let path = Path::new(name);
            if name.is_empty() || path.components().count() != 1 {
                return Err(FreezeError::config(format!(
                    "target_name {} must be a plain file name",
                    name
                )));
            }

            return Ok(match name.strip_suffix(".exe") {
                Some(stem) => stem.to_string(),
                None => name.clone(),
            });
        }

        self.script
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                FreezeError::config(format!("unable to derive a name from {}", self.script.display()))
            })
    }

    pub fn base_kind(&self) -> Result<BaseKind, FreezeError> {
        BaseKind::from_name(&self.base)
    }
}

/// Options of the `build_exe` command.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct FreezerConfig {
    pub target_dir: Option<PathBuf>,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub packages: Vec<String>,
    pub replace_paths: Vec<(String, String)>,
    #[serde(default = "TRUE")]
    pub compress: bool,
    pub optimize: i32,
    pub path: Vec<PathBuf>,
    pub bin_includes: Vec<String>,
    pub bin_excludes: Vec<String>,
    pub bin_path_includes: Vec<PathBuf>,
    pub bin_path_excludes: Vec<PathBuf>,
    pub include_files: Vec<PathSpec>,
    pub zip_includes: Vec<PathSpec>,
    pub zip_include_packages: Vec<String>,
    /// `None` when not configured.
    pub zip_exclude_packages: Option<Vec<String>>,
    pub silent: u8,
    pub include_msvcr: bool,
    #[serde(default = "default_zip_filename")]
    pub zip_filename: String,
    pub bases_dir: Option<PathBuf>,
    pub python: Option<PathBuf>,
    pub constants: Vec<String>,
    /// Extra directories searched for shared libraries.
    pub include_path: Vec<PathBuf>,
    pub license_path: Option<PathBuf>,
    pub hooks: Vec<Hook>,
}

impl Default for FreezerConfig {
    fn default() -> Self {
        Self {
            target_dir: None,
            includes: vec![],
            excludes: vec![],
            packages: vec![],
            replace_paths: vec![],
            compress: true,
            optimize: 0,
            path: vec![],
            bin_includes: vec![],
            bin_excludes: vec![],
            bin_path_includes: vec![],
            bin_path_excludes: vec![],
            include_files: vec![],
            zip_includes: vec![],
            zip_include_packages: vec![],
            zip_exclude_packages: None,
            silent: 0,
            include_msvcr: false,
            zip_filename: default_zip_filename(),
            bases_dir: None,
            python: None,
            constants: vec![],
            include_path: vec![],
            license_path: None,
            hooks: vec![],
        }
    }
}

impl FreezerConfig {
    pub fn optimization_level(&self) -> Result<BytecodeOptimizationLevel, FreezeError> {
        BytecodeOptimizationLevel::try_from(self.optimize).map_err(|_| {
            FreezeError::config(format!(
                "illegal optimize value {}; value must be 0, 1, or 2",
                self.optimize
            ))
        })
    }

    pub fn zip_policy(&self) -> Result<ZipPolicy, FreezeError> {
        ZipPolicy::new(
            &self.zip_include_packages,
            self.zip_exclude_packages.as_deref(),
        )
        .map_err(|e| FreezeError::config(format!("{:#}", e)))
    }

    /// Check options for contradictions before any work is done.
    pub fn validate(&self) -> Result<(), FreezeError> {
        self.optimization_level()?;
        self.zip_policy()?;

        if self.silent > 3 {
            return Err(FreezeError::config(format!(
                "illegal silent value {}; value must be between 0 and 3",
                self.silent
            )));
        }

        let zip_filename = Path::new(&self.zip_filename);
        if zip_filename.components().count() != 1
            || zip_filename.extension().and_then(|s| s.to_str()) != Some("zip")
        {
            return Err(FreezeError::config(format!(
                "zip_filename {} must be a file name ending in .zip",
                self.zip_filename
            )));
        }

        for spec in self.include_files.iter().chain(self.zip_includes.iter()) {
            spec.target()?;
        }

        parse_constants(&self.constants)?;

        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| *p = base.join(&*p);

        self.target_dir.iter_mut().for_each(join);
        self.path.iter_mut().for_each(join);
        self.bin_path_includes.iter_mut().for_each(join);
        self.bin_path_excludes.iter_mut().for_each(join);
        self.bases_dir.iter_mut().for_each(join);
        self.include_path.iter_mut().for_each(join);
        self.license_path.iter_mut().for_each(join);
        for spec in self.include_files.iter_mut().chain(self.zip_includes.iter_mut()) {
            spec.resolve(base);
        }

        // A bare interpreter name is looked up on PATH.
        if let Some(python) = &mut self.python {
            if python.components().count() > 1 {
                *python = base.join(&*python);
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ParsedProject {
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    build_exe: FreezerConfig,
    #[serde(default)]
    executables: Vec<Executable>,
}

/// A validated project.
#[derive(Clone, Debug)]
pub struct ProjectConfig {
    /// Directory relative paths were resolved against.
    pub project_dir: PathBuf,
    pub metadata: Metadata,
    pub build_exe: FreezerConfig,
    pub executables: Vec<Executable>,
}

/// Parse a project file's content.
pub fn parse_config(data: &[u8], project_dir: &Path) -> Result<ProjectConfig, FreezeError> {
    let parsed: ParsedProject = toml::from_slice(data)?;

    let mut config = ProjectConfig {
        project_dir: project_dir.to_path_buf(),
        metadata: parsed.metadata,
        build_exe: parsed.build_exe,
        executables: parsed.executables,
    };

    config.build_exe.resolve_paths(project_dir);
    for exe in config.executables.iter_mut() {
        exe.script = project_dir.join(&exe.script);
        for path in [&mut exe.init_script, &mut exe.icon, &mut exe.manifest]
            .into_iter()
            .flatten()
        {
            *path = project_dir.join(&*path);
        }
    }

    config.validate()?;

    Ok(config)
}

impl ProjectConfig {
    /// Read and validate a project file.
    pub fn load(path: &Path) -> Result<Self, FreezeError> {
        let data = std::fs::read(path)
            .map_err(|e| FreezeError::file(path, format!("unable to read project file: {}", e)))?;
        let project_dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::env::current_dir()?,
        };

        parse_config(&data, &project_dir)
    }

    pub fn validate(&self) -> Result<(), FreezeError> {
        self.build_exe.validate()?;

        if self.executables.is_empty() {
            return Err(FreezeError::config("no executables defined"));
        }

        let mut stems = vec![];
        for exe in &self.executables {
            exe.base_kind()?;
            let stem = exe.target_stem()?;
            if stems.contains(&stem) {
                return Err(FreezeError::config(format!(
                    "multiple executables named {}",
                    stem
                )));
            }
            stems.push(stem);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, anyhow::Result, indoc::indoc};

    fn parse(s: &str) -> Result<ProjectConfig, FreezeError> {
        parse_config(s.as_bytes(), Path::new("/project"))
    }

    #[test]
    fn minimal_project() -> Result<()> {
        let config = parse(indoc! {r#"
            [[executables]]
            script = "hello.py"
        "#})?;

        assert_eq!(config.build_exe, FreezerConfig::default());
        assert!(config.build_exe.compress);
        assert_eq!(config.build_exe.zip_filename, "library.zip");
        assert_eq!(config.executables.len(), 1);

        let exe = &config.executables[0];
        assert_eq!(exe.script, Path::new("/project/hello.py"));
        assert_eq!(exe.base, "console");
        assert_eq!(exe.target_stem()?, "hello");

        Ok(())
    }

    #[test]
    fn full_project() -> Result<()> {
        let config = parse(indoc! {r#"
            [metadata]
            name = "hello"
            version = "0.1"
            company = "Example"

            [build_exe]
            target_dir = "dist"
            includes = ["json"]
            packages = ["email"]
            replace_paths = [["*", ""]]
            optimize = 1
            compress = false
            path = ["src"]
            include_files = ["README.txt"]
            zip_includes = [["data/config.ini", "etc/config.ini"]]
            zip_include_packages = ["*"]
            zip_exclude_packages = ["p"]
            silent = 2
            constants = ["TOKEN='x'"]
            unknown_key = "ignored"

            [[build_exe.hooks]]
            module = "app"
            effects = [{ effect = "include_module", name = "extra" }, { effect = "in_filesystem" }]

            [[executables]]
            script = "hello.py"
            target_name = "Hello.exe"
            base = "gui"
            icon = "hello.ico"
            uac_admin = true
        "#})?;

        let build = &config.build_exe;
        assert_eq!(build.target_dir.as_deref(), Some(Path::new("/project/dist")));
        assert_eq!(build.replace_paths, vec![("*".to_string(), "".to_string())]);
        assert_eq!(build.optimization_level()?, BytecodeOptimizationLevel::One);
        assert!(!build.compress);
        assert_eq!(build.path, vec![PathBuf::from("/project/src")]);
        assert_eq!(
            build.zip_includes[0],
            PathSpec::Pair("/project/data/config.ini".into(), "etc/config.ini".into())
        );
        assert_eq!(build.include_files[0].target()?, PathBuf::from("README.txt"));
        assert_eq!(build.zip_exclude_packages, Some(vec!["p".to_string()]));
        assert_eq!(build.hooks.len(), 1);
        assert_eq!(build.hooks[0].effects.len(), 2);

        assert_eq!(config.metadata.version.as_deref(), Some("0.1"));

        let exe = &config.executables[0];
        assert_eq!(exe.target_stem()?, "Hello");
        assert_eq!(exe.icon.as_deref(), Some(Path::new("/project/hello.ico")));
        assert!(exe.uac_admin);

        Ok(())
    }

    #[test]
    fn contradictions_are_config_errors() {
        let cases = [
            indoc! {r#"
                [build_exe]
                zip_include_packages = ["a", "b"]
                zip_exclude_packages = ["b"]
                [[executables]]
                script = "hello.py"
            "#},
            indoc! {r#"
                [build_exe]
                include_files = [["a.txt", "/etc/a.txt"]]
                [[executables]]
                script = "hello.py"
            "#},
            indoc! {r#"
                [build_exe]
                optimize = 3
                [[executables]]
                script = "hello.py"
            "#},
            indoc! {r#"
                [build_exe]
                silent = 4
                [[executables]]
                script = "hello.py"
            "#},
            indoc! {r#"
                [build_exe]
                zip_filename = "library.tar"
                [[executables]]
                script = "hello.py"
            "#},
            indoc! {r#"
                [[executables]]
                script = "hello.py"
                base = "daemon"
            "#},
            indoc! {r#"
                [[executables]]
                script = "hello.py"
                [[executables]]
                script = "other/hello.py"
            "#},
            "[build_exe]\n",
        ];

        for case in cases {
            match parse(case) {
                Err(FreezeError::Config(_)) => {}
                other => panic!("expected configuration error for {:?}, got {:?}", case, other),
            }
        }
    }

    #[test]
    fn missing_project_file() {
        let err = ProjectConfig::load(Path::new("/nonexistent/pyfreeze.toml")).unwrap_err();
        assert!(matches!(err, FreezeError::File(..)));
    }
}
