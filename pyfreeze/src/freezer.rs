// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Freezing applications.

A [Freezer] runs the `build_exe` pipeline: discover modules, partition them
between the bytecode archive and the `lib` directory, write both, copy
launchers and data files, walk and bundle native dependencies, relink the
bundled binaries and finally stamp launcher resources.
*/

use {
    crate::{
        config::{Executable, FreezerConfig, Metadata, ProjectConfig},
        environment::{canonicalize_path, resolve_bases_dir},
        error::FreezeError,
        launcher::{executable_file_name, find_base},
        licensing::write_license_file,
        startup::{
            constants_source, init_module_name, main_module_name, module_prefix, startup_source,
            CONSOLE_INIT_SOURCE, CONSTANTS_MODULE, STARTUP_MODULE,
        },
    },
    log::{debug, info, warn},
    python_packaging::{
        archive::{module_pyc_data, module_pyc_path, ArchiveBuilder},
        bytecode::{BytecodeCompiler, PythonBytecodeCompiler},
        finder::{FinderOptions, FinderReport, ModuleFinder},
        hooks::{HookFileKind, HookPlatform, HookRegistry},
        interpreter::PythonInterpreterInfo,
        module::{MissingModules, Module, ModuleKind},
        package_metadata::DistributionIndex,
        path_resolver::{normalize_path, normalize_search_path, PathResolver},
        policy::ModulePlacement,
    },
    std::{
        collections::{BTreeMap, BTreeSet},
        fmt::{Display, Formatter},
        path::{Path, PathBuf},
    },
    tugger_binary_analysis::{
        assign_targets, backend_for, copy_binaries, BinaryFormat, BinaryKind, BinaryRewriter,
        BinaryTracker, BinaryWalker, InterpreterPaths, LayoutOptions, OsBackend, WalkerOptions,
    },
    tugger_windows::{application_manifest, set_execution_level, ExecutionLevel, ResourceStamp, VersionInfo},
};

/// MSVC runtime libraries an interpreter build may link against.
const MSVC_RUNTIME_NAMES: &[&str] = &[
    "concrt140.dll",
    "msvcp140.dll",
    "msvcp140_1.dll",
    "msvcp140_2.dll",
    "vcruntime140.dll",
    "vcruntime140_1.dll",
];

/// Stages of a freeze run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FreezeState {
    Init,
    Discover,
    Partition,
    Archive,
    Copy,
    CollectBinaries,
    WalkDependencies,
    Layout,
    Rewrite,
    Stamp,
    Done,
}

impl Display for FreezeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::Discover => "discovering modules",
            Self::Partition => "partitioning modules",
            Self::Archive => "writing archive",
            Self::Copy => "copying files",
            Self::CollectBinaries => "collecting binaries",
            Self::WalkDependencies => "walking binary dependencies",
            Self::Layout => "laying out binaries",
            Self::Rewrite => "relinking binaries",
            Self::Stamp => "stamping launchers",
            Self::Done => "done",
        })
    }
}

/// The interpreter being frozen and the tools bound to it.
pub struct FreezeContext {
    pub interpreter: PythonInterpreterInfo,
    pub compiler: Box<dyn PythonBytecodeCompiler>,
    pub backend: Box<dyn OsBackend>,
}

impl FreezeContext {
    /// Introspect an interpreter and start a bytecode compiler for it.
    pub fn from_python(python: &Path) -> Result<Self, FreezeError> {
        let interpreter = PythonInterpreterInfo::from_interpreter(python)?;
        info!(
            "freezing against Python {} ({})",
            interpreter.version,
            interpreter.executable.display()
        );

        let format = binary_format(&interpreter);
        if format != BinaryFormat::host() {
            return Err(FreezeError::Platform(format!(
                "cannot freeze for {} on this platform",
                interpreter.platform
            )));
        }

        let compiler = BytecodeCompiler::new(&interpreter.executable)?;
        let backend = backend_for(format)?;

        Ok(Self {
            interpreter,
            compiler: Box::new(compiler),
            backend,
        })
    }
}

/// The native binary format of an interpreter's platform.
pub fn binary_format(interpreter: &PythonInterpreterInfo) -> BinaryFormat {
    if interpreter.is_windows() {
        BinaryFormat::Pe
    } else if interpreter.is_macos() {
        BinaryFormat::MachO
    } else {
        BinaryFormat::Elf
    }
}

fn hook_platform(interpreter: &PythonInterpreterInfo) -> HookPlatform {
    if interpreter.is_windows() {
        HookPlatform::Windows
    } else if interpreter.is_macos() {
        HookPlatform::MacOs
    } else {
        HookPlatform::Linux
    }
}

/// What a freeze run produced.
#[derive(Clone, Debug, Default)]
pub struct FreezeSummary {
    pub target_dir: PathBuf,
    pub executables: Vec<PathBuf>,
    /// Modules stored in the bytecode archive.
    pub archived: Vec<String>,
    /// Modules written below `lib`.
    pub filesystem: Vec<String>,
    /// Native binaries copied during layout.
    pub binaries: Vec<PathBuf>,
    /// Binaries whose load paths were rewritten.
    pub relinked: Vec<PathBuf>,
    pub missing: MissingModules,
    /// Libraries that could not be located, with the binaries needing them.
    pub missing_libraries: BTreeMap<String, Vec<PathBuf>>,
}

/// A launcher placed in the target directory.
#[derive(Clone, Debug)]
struct PlacedLauncher {
    exe: Executable,
    path: PathBuf,
}

/// A native binary to register with the dependency walker.
#[derive(Clone, Debug)]
struct PendingBinary {
    source: PathBuf,
    target: PathBuf,
    kind: BinaryKind,
}

/// Runs the `build_exe` pipeline for a project.
pub struct Freezer {
    config: FreezerConfig,
    metadata: Metadata,
    executables: Vec<Executable>,
    context: FreezeContext,
    search_path: Vec<PathBuf>,
    target_dir: PathBuf,
    lib_dir: PathBuf,
    state: FreezeState,
}

impl Freezer {
    /// Validate a project and prepare a fresh target directory.
    ///
    /// An existing target directory is removed.
    pub fn new(project: &ProjectConfig, context: FreezeContext) -> Result<Self, FreezeError> {
        project.validate()?;
        let config = project.build_exe.clone();
        let interpreter = &context.interpreter;

        let mut roots = project
            .executables
            .iter()
            .filter_map(|exe| exe.script.parent().map(|p| p.to_path_buf()))
            .collect::<Vec<_>>();
        if config.path.is_empty() {
            roots.extend(interpreter.module_search_path());
        } else {
            roots.extend(config.path.iter().cloned());
        }
        let search_path = normalize_search_path(roots);

        let target_dir = match &config.target_dir {
            Some(dir) => dir.clone(),
            None => project.project_dir.join("build").join(format!(
                "exe.{}-{}.{}",
                interpreter.platform, interpreter.major, interpreter.minor
            )),
        };
        let target_dir = normalize_path(&target_dir);

        if search_path.iter().any(|p| p == &target_dir) {
            return Err(FreezeError::config(format!(
                "the target directory {} cannot be one of the module search paths",
                target_dir.display()
            )));
        }
        if normalize_path(&project.project_dir).starts_with(&target_dir) {
            return Err(FreezeError::config(format!(
                "the target directory {} contains the project",
                target_dir.display()
            )));
        }

        if target_dir.exists() {
            info!("removing {}", target_dir.display());
            remove_dir_all::remove_dir_all(&target_dir).map_err(|e| {
                FreezeError::file(&target_dir, format!("unable to remove target directory: {}", e))
            })?;
        }
        std::fs::create_dir_all(&target_dir)?;
        let target_dir = canonicalize_path(&target_dir)?;
        let lib_dir = target_dir.join("lib");
        std::fs::create_dir_all(&lib_dir)?;

        Ok(Self {
            config,
            metadata: project.metadata.clone(),
            executables: project.executables.clone(),
            context,
            search_path,
            target_dir,
            lib_dir,
            state: FreezeState::Init,
        })
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    pub fn state(&self) -> FreezeState {
        self.state
    }

    fn transition(&mut self, state: FreezeState) {
        debug!("{} -> {}", self.state, state);
        info!("{}", state);
        self.state = state;
    }

    /// Run the whole pipeline.
    pub fn freeze(&mut self) -> Result<FreezeSummary, FreezeError> {
        let mut summary = FreezeSummary {
            target_dir: self.target_dir.clone(),
            ..Default::default()
        };

        self.transition(FreezeState::Discover);
        let report = self.discover()?;
        self.report_missing(&report.missing);
        summary.missing = report.missing.clone();

        self.transition(FreezeState::Partition);
        let (archived, filesystem) = self.partition(&report)?;
        summary.archived = archived.iter().map(|m| m.name.clone()).collect();
        summary.filesystem = filesystem.iter().map(|m| m.name.clone()).collect();

        self.transition(FreezeState::Archive);
        self.write_archive(&archived, &report)?;

        self.transition(FreezeState::Copy);
        let mut pending = self.write_filesystem_modules(&filesystem)?;
        self.copy_package_data(&report.modules)?;
        pending.extend(self.copy_include_files()?);
        pending.extend(self.copy_hook_files(&report)?);
        write_license_file(&self.target_dir, self.config.license_path.as_deref())?;
        let launchers = self.copy_launchers()?;
        summary.executables = launchers.iter().map(|l| l.path.clone()).collect();

        self.transition(FreezeState::CollectBinaries);
        let mut binaries = launchers
            .iter()
            .map(|l| PendingBinary {
                source: l.path.clone(),
                target: l.path.clone(),
                kind: BinaryKind::Launcher,
            })
            .collect::<Vec<_>>();
        binaries.extend(pending);

        self.transition(FreezeState::WalkDependencies);
        let mut tracker = self.walk_binaries(&binaries)?;
        summary.missing_libraries = tracker.missing().clone();

        self.transition(FreezeState::Layout);
        let layout = assign_targets(
            &mut tracker,
            self.context.backend.format(),
            &LayoutOptions {
                target_dir: self.target_dir.clone(),
                lib_dir: self.lib_dir.clone(),
            },
        )?;
        for (path, name) in &layout.renamed {
            info!("bundling {} as {}", path.display(), name);
        }
        summary.binaries = copy_binaries(&tracker)?;

        self.transition(FreezeState::Rewrite);
        summary.relinked =
            BinaryRewriter::new(self.context.backend.as_ref(), &self.target_dir)
                .rewrite_all(&tracker)?;

        self.transition(FreezeState::Stamp);
        for launcher in &launchers {
            self.stamp_launcher(launcher)?;
        }

        self.transition(FreezeState::Done);

        Ok(summary)
    }

    fn discover(&mut self) -> Result<FinderReport, FreezeError> {
        let interpreter = &self.context.interpreter;

        let resolver = PathResolver::new(
            self.search_path.iter(),
            interpreter.extension_suffixes.clone(),
        );

        let mut hooks = HookRegistry::builtin(hook_platform(interpreter));
        hooks.prepend(self.config.hooks.iter().cloned());

        let options = FinderOptions {
            excludes: self.config.excludes.clone(),
            replace_paths: self.config.replace_paths.clone(),
            optimize: self.config.optimization_level()?,
            builtin_modules: interpreter.builtin_module_names.iter().cloned().collect(),
            frozen_modules: interpreter.frozen_module_names.iter().cloned().collect(),
        };

        let mut prefixes = vec![];
        let mut seen_prefixes = BTreeSet::new();
        for exe in &self.executables {
            let stem = exe.target_stem()?;
            let prefix = module_prefix(&stem);
            if !seen_prefixes.insert(prefix.clone()) {
                return Err(FreezeError::config(format!(
                    "executable {} maps to module prefix {} which is already in use",
                    stem, prefix
                )));
            }
            prefixes.push((stem, prefix));
        }

        let startup = startup_source(&prefixes, interpreter.is_windows());
        let constants = constants_source(&self.config.constants, self.metadata.version.as_deref())?;

        let mut finder = ModuleFinder::new(
            self.context.compiler.as_mut(),
            resolver,
            hooks,
            DistributionIndex::from_search_roots(&self.search_path),
            options,
        )?;

        finder.include_base_modules();
        finder.add_generated_module(STARTUP_MODULE, startup.into_bytes());
        finder.add_generated_module(CONSTANTS_MODULE, constants.into_bytes());

        for (exe, (_, prefix)) in self.executables.iter().zip(prefixes.iter()) {
            match &exe.init_script {
                Some(path) => {
                    if !path.is_file() {
                        return Err(FreezeError::file(path, "init script does not exist"));
                    }
                    finder.include_file_as_module(path, &init_module_name(prefix));
                }
                None => finder.add_generated_module(
                    &init_module_name(prefix),
                    CONSOLE_INIT_SOURCE.as_bytes().to_vec(),
                ),
            }

            if !exe.script.is_file() {
                return Err(FreezeError::file(&exe.script, "script does not exist"));
            }
            finder.include_file_as_module(&exe.script, &main_module_name(prefix));
        }

        for name in &self.config.includes {
            finder.include_module(name);
        }
        for name in &self.config.packages {
            finder.include_package(name);
        }

        let report = finder.finish()?;
        info!("discovered {} modules", report.modules.len());

        Ok(report)
    }

    fn report_missing(&self, missing: &MissingModules) {
        let silent = self.config.silent;

        if silent <= 1 && !missing.missing.is_empty() {
            warn!("missing modules:");
            for (name, importers) in &missing.missing {
                warn!(
                    "? {} imported from {}",
                    name,
                    importers.iter().cloned().collect::<Vec<_>>().join(", ")
                );
            }
        }

        if silent <= 2 && !missing.maybe_missing.is_empty() {
            warn!("modules possibly missing:");
            for (name, importers) in &missing.maybe_missing {
                warn!(
                    "? {} conditionally imported from {}",
                    name,
                    importers.iter().cloned().collect::<Vec<_>>().join(", ")
                );
            }
        }

        if silent <= 1 && !missing.is_empty() {
            warn!("this is not necessarily a problem; the modules may not be needed on this platform");
        }
    }

    fn partition<'r>(
        &self,
        report: &'r FinderReport,
    ) -> Result<(Vec<&'r Module>, Vec<&'r Module>), FreezeError> {
        let policy = self.config.zip_policy()?;
        let in_filesystem = report
            .modules
            .iter()
            .filter(|m| m.in_filesystem)
            .map(|m| m.name.clone())
            .collect::<BTreeSet<_>>();

        let mut archived = vec![];
        let mut filesystem = vec![];
        for module in &report.modules {
            match policy.placement(module, &in_filesystem) {
                ModulePlacement::Archive => archived.push(module),
                ModulePlacement::Filesystem => filesystem.push(module),
                ModulePlacement::None => {}
            }
        }

        archived.sort_by(|a, b| a.name.cmp(&b.name));
        filesystem.sort_by(|a, b| a.name.cmp(&b.name));

        Ok((archived, filesystem))
    }

    fn write_archive(&self, archived: &[&Module], report: &FinderReport) -> Result<(), FreezeError> {
        let mut archive = ArchiveBuilder::new(
            self.context.interpreter.python_version(),
            self.config.compress,
        );

        for module in archived {
            archive.add_module(module)?;
        }

        for dist in &report.distributions {
            archive.add_distribution(dist)?;
        }

        for spec in &self.config.zip_includes {
            let source = spec.source();
            if !source.exists() {
                return Err(FreezeError::file(source, "zip include does not exist"));
            }
            archive.add_path(source, &path_to_slashes(&spec.target()?))?;
        }

        let path = self.lib_dir.join(&self.config.zip_filename);
        info!("writing {} ({} entries)", path.display(), archive.len());
        archive.write_to_path(&path)?;

        Ok(())
    }

    /// Write on-disk modules. Extensions are returned for the walker to copy.
    fn write_filesystem_modules(
        &self,
        modules: &[&Module],
    ) -> Result<Vec<PendingBinary>, FreezeError> {
        let version = self.context.interpreter.python_version();
        let mut extensions = vec![];

        for module in modules {
            if module.kind == ModuleKind::Extension {
                let source = module.file.clone().ok_or_else(|| {
                    FreezeError::file(PathBuf::from(&module.name), "extension module has no file")
                })?;
                let file_name = source
                    .file_name()
                    .ok_or_else(|| FreezeError::file(&source, "extension module has no file name"))?;

                let mut target = self.lib_dir.clone();
                if let Some((parent, _)) = module.name.rsplit_once('.') {
                    target.extend(parent.split('.'));
                }
                target.push(file_name);

                extensions.push(PendingBinary {
                    source,
                    target,
                    kind: BinaryKind::Extension,
                });
                continue;
            }

            if module.code.is_none() {
                continue;
            }

            let path = self.lib_dir.join(module_pyc_path(module));
            debug!("writing {}", path.display());
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, module_pyc_data(module, version)?)?;
        }

        Ok(extensions)
    }

    /// Copy non-code files of every package next to where it loads from.
    fn copy_package_data(&self, modules: &[Module]) -> Result<(), FreezeError> {
        let resolver = PathResolver::new(
            self.search_path.iter(),
            self.context.interpreter.extension_suffixes.clone(),
        );

        for module in modules.iter().filter(|m| m.is_package()) {
            let roots = match module.kind {
                ModuleKind::NamespacePackage => module.search_roots.clone(),
                _ => module.package_dir().into_iter().collect(),
            };
            let package_dir = module
                .name
                .split('.')
                .fold(self.lib_dir.clone(), |p, part| p.join(part));

            for root in roots {
                for rel in resolver.package_data_files(&root) {
                    let dest = package_dir.join(&rel);
                    if dest.exists() {
                        debug!("{} already present", dest.display());
                        continue;
                    }
                    copy_file(&root.join(&rel), &dest)?;
                }
            }
        }

        Ok(())
    }

    /// Copy `include_files`. Native binaries among them are walked.
    fn copy_include_files(&self) -> Result<Vec<PendingBinary>, FreezeError> {
        let mut binaries = vec![];

        for spec in &self.config.include_files {
            let source = spec.source();
            if !source.exists() {
                return Err(FreezeError::file(source, "include file does not exist"));
            }
            let target = self.target_dir.join(spec.target()?);

            for (src, dest) in copy_tree(source, &target)? {
                if self.context.backend.is_binary(&src) {
                    binaries.push(PendingBinary {
                        source: dest.clone(),
                        target: dest,
                        kind: BinaryKind::Extension,
                    });
                }
            }
        }

        Ok(binaries)
    }

    /// Copy files registered by hooks into `lib`.
    fn copy_hook_files(&self, report: &FinderReport) -> Result<Vec<PendingBinary>, FreezeError> {
        let mut binaries = vec![];

        for file in &report.included_files {
            if !file.source.exists() {
                warn!(
                    "{} (registered for {}) does not exist; skipping",
                    file.source.display(),
                    file.module
                );
                continue;
            }

            let target = self.lib_dir.join(&file.target);
            for (_, dest) in copy_tree(&file.source, &target)? {
                if file.kind == HookFileKind::SharedLibrary {
                    binaries.push(PendingBinary {
                        source: dest.clone(),
                        target: dest,
                        kind: BinaryKind::Extension,
                    });
                }
            }
        }

        Ok(binaries)
    }

    /// Copy each executable's launcher base into the target directory.
    fn copy_launchers(&self) -> Result<Vec<PlacedLauncher>, FreezeError> {
        let interpreter = &self.context.interpreter;
        let bases_dir = resolve_bases_dir(self.config.bases_dir.as_deref())?;

        let mut launchers = vec![];
        for exe in &self.executables {
            let base = find_base(&bases_dir, exe.base_kind()?, interpreter)?;
            let path = self
                .target_dir
                .join(executable_file_name(&exe.target_stem()?, interpreter));

            info!("copying {} to {}", base.display(), path.display());
            std::fs::copy(&base, &path)?;
            launchers.push(PlacedLauncher {
                exe: exe.clone(),
                path,
            });
        }

        Ok(launchers)
    }

    fn walker_options(&self) -> WalkerOptions {
        let interpreter = &self.context.interpreter;
        let backend = self.context.backend.as_ref();

        let paths = InterpreterPaths {
            prefix: interpreter.base_prefix.clone(),
            libdir: interpreter.libdir.clone(),
            destlib: interpreter.destlib.clone(),
            shared_library: interpreter.libpython_name(),
        };

        let mut policy = backend.default_policy(&paths);
        policy.bin_includes.extend(self.config.bin_includes.iter().cloned());
        policy.bin_excludes.extend(self.config.bin_excludes.iter().cloned());
        policy
            .bin_path_includes
            .extend(self.config.bin_path_includes.iter().cloned());
        policy
            .bin_path_excludes
            .extend(self.config.bin_path_excludes.iter().cloned());

        let mut search_paths = self.config.include_path.clone();

        if backend.format() == BinaryFormat::Pe {
            let names = MSVC_RUNTIME_NAMES.iter().map(|s| s.to_string());
            if self.config.include_msvcr {
                policy.bin_includes.extend(names);
                search_paths.push(interpreter.base_prefix.clone());
            } else {
                policy.bin_excludes.extend(names);
            }
        }

        WalkerOptions {
            policy,
            search_paths,
            executable_dir: interpreter.executable.parent().map(|p| p.to_path_buf()),
            silent: self.config.silent,
        }
    }

    fn walk_binaries(&self, binaries: &[PendingBinary]) -> Result<BinaryTracker, FreezeError> {
        let mut walker = BinaryWalker::new(self.context.backend.as_ref(), self.walker_options());

        for binary in binaries {
            debug!("registering {} ({:?})", binary.source.display(), binary.kind);
            walker.add_binary(&binary.source, &binary.target, binary.kind)?;
        }

        Ok(walker.into_tracker())
    }

    fn stamp_launcher(&self, launcher: &PlacedLauncher) -> Result<(), FreezeError> {
        let exe = &launcher.exe;

        if let Some(icon) = &exe.icon {
            if !icon.is_file() {
                return Err(FreezeError::file(icon, "icon does not exist"));
            }
        }

        if self.context.backend.format() != BinaryFormat::Pe {
            if let Some(icon) = &exe.icon {
                if let Some(name) = icon.file_name() {
                    let dest = self.target_dir.join(name);
                    if !dest.exists() {
                        debug!("copying icon {} to {}", icon.display(), dest.display());
                        std::fs::copy(icon, &dest)?;
                    }
                }
            }
            return Ok(());
        }

        let stamp = ResourceStamp {
            icon: exe.icon.clone(),
            manifest: Some(self.launcher_manifest(exe)?),
            version: Some(self.version_info(launcher)?),
        };

        if self
            .context
            .backend
            .stamp_resources(&launcher.path, &stamp)?
        {
            info!("stamped resources into {}", launcher.path.display());
        }

        Ok(())
    }

    fn launcher_manifest(&self, exe: &Executable) -> Result<String, FreezeError> {
        let level = ExecutionLevel::from_uac_admin(exe.uac_admin);

        match &exe.manifest {
            Some(path) => {
                let manifest = std::fs::read_to_string(path)
                    .map_err(|e| FreezeError::file(path, format!("unable to read manifest: {}", e)))?;
                if exe.uac_admin || exe.uac_uiaccess {
                    Ok(set_execution_level(&manifest, level, exe.uac_uiaccess)?)
                } else {
                    Ok(manifest)
                }
            }
            None => Ok(application_manifest(
                &exe.target_stem()?,
                level,
                exe.uac_uiaccess,
            )),
        }
    }

    fn version_info(&self, launcher: &PlacedLauncher) -> Result<VersionInfo, FreezeError> {
        let exe = &launcher.exe;
        let metadata = &self.metadata;
        let mut version = VersionInfo::new(metadata.version.as_deref().unwrap_or("0.0"))?;

        let file_name = launcher
            .path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let stem = exe.target_stem()?;

        let strings = [
            ("CompanyName", metadata.company.clone()),
            ("FileDescription", metadata.description.clone()),
            (
                "LegalCopyright",
                exe.copyright.clone().or_else(|| metadata.copyright.clone()),
            ),
            (
                "LegalTrademarks",
                exe.trademarks.clone().or_else(|| metadata.trademarks.clone()),
            ),
            ("OriginalFilename", Some(file_name)),
            ("InternalName", Some(stem)),
            ("ProductName", metadata.name.clone()),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                version.set_string(key, &value);
            }
        }

        Ok(version)
    }
}

fn path_to_slashes(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn copy_file(source: &Path, dest: &Path) -> Result<(), FreezeError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    debug!("copying {} to {}", source.display(), dest.display());
    std::fs::copy(source, dest)?;

    Ok(())
}

/// Copy a file, or every file below a directory, returning the pairs copied.
fn copy_tree(source: &Path, dest: &Path) -> Result<Vec<(PathBuf, PathBuf)>, FreezeError> {
    let mut copied = vec![];

    if source.is_dir() {
        for entry in walkdir::WalkDir::new(source).sort_by_file_name() {
            let entry = entry.map_err(|e| FreezeError::Other(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| FreezeError::Other(e.into()))?;
            let target = dest.join(rel);
            copy_file(entry.path(), &target)?;
            copied.push((entry.path().to_path_buf(), target));
        }
    } else {
        copy_file(source, dest)?;
        copied.push((source.to_path_buf(), dest.to_path_buf()));
    }

    Ok(copied)
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use {
        super::*,
        crate::{
            config::{PathSpec, ProjectConfig},
            testutil::{read_zip_names, Fixture},
        },
        anyhow::Result,
        tugger_binary_analysis::{elf::parse_elf, testutil::ElfBuilder},
    };

    #[test]
    fn hello_world_layout() -> Result<()> {
        let f = Fixture::new()?;
        f.write("project/hello.py", "import greeting\n")?;
        f.write("project/greeting.py", "import os\n")?;

        let project = f.project(FreezerConfig::default(), vec![Executable::new("hello.py")]);
        let mut freezer = Freezer::new(&project, f.context()?)?;
        let summary = freezer.freeze()?;
        assert_eq!(freezer.state(), FreezeState::Done);

        let target = summary.target_dir.clone();
        assert_eq!(target, canonicalize_path(&f.root.join("dist"))?);
        assert_eq!(summary.executables, vec![target.join("hello")]);
        assert!(target.join("hello").is_file());
        assert!(target.join("frozen_application_license.txt").is_file());
        assert!(target.join("lib/libpython3.12.so.1.0").is_file());

        let names = read_zip_names(&target.join("lib/library.zip"))?;
        for name in [
            "__startup__.pyc",
            "BUILD_CONSTANTS.pyc",
            "hello__init__.pyc",
            "hello__main__.pyc",
            "greeting.pyc",
            "os.pyc",
        ] {
            assert!(names.contains(&name.to_string()), "{} in archive", name);
        }

        // Packages stay on disk unless zip_include_packages says otherwise.
        assert!(target.join("lib/encodings/__init__.pyc").is_file());
        assert!(summary.filesystem.contains(&"encodings".to_string()));

        // The launcher already loads libpython from lib/.
        let launcher = parse_elf(&std::fs::read(target.join("hello"))?)?;
        assert_eq!(launcher.rpaths, vec!["$ORIGIN/lib".to_string()]);

        Ok(())
    }

    #[test]
    fn extension_dependencies_are_bundled() -> Result<()> {
        let f = Fixture::new()?;
        f.write("project/hello.py", "import _speedups\n")?;
        f.write_bytes(
            "site/_speedups.cpython-312-x86_64-linux-gnu.so",
            &ElfBuilder::new()
                .needed("libfoo.so.1")
                .runpath("$ORIGIN/deps")
                .build(),
        )?;
        f.write_bytes(
            "site/deps/libfoo.so.1",
            &ElfBuilder::new().soname("libfoo.so.1").build(),
        )?;

        let config = FreezerConfig {
            path: vec![f.root.join("site"), f.stdlib()],
            ..Default::default()
        };
        let project = f.project(config, vec![Executable::new("hello.py")]);
        let summary = Freezer::new(&project, f.context()?)?.freeze()?;
        let lib = summary.target_dir.join("lib");

        let ext = lib.join("_speedups.cpython-312-x86_64-linux-gnu.so");
        assert!(ext.is_file());
        assert!(lib.join("libfoo.so.1").is_file());
        assert!(summary.filesystem.contains(&"_speedups".to_string()));

        let parsed = parse_elf(&std::fs::read(&ext)?)?;
        assert_eq!(parsed.rpaths, vec!["$ORIGIN".to_string()]);
        assert!(summary.relinked.contains(&ext));

        Ok(())
    }

    #[test]
    fn zip_partition() -> Result<()> {
        let f = Fixture::new()?;
        f.write("project/hello.py", "import p.helper\nimport q\n")?;
        f.write("project/p/__init__.py", "")?;
        f.write("project/p/helper.py", "")?;
        f.write("project/p/data.txt", "payload")?;
        f.write("project/q/__init__.py", "")?;
        f.write("project/q/q.json", "{}")?;

        let config = FreezerConfig {
            zip_include_packages: vec!["*".to_string()],
            zip_exclude_packages: Some(vec!["p".to_string()]),
            include_files: vec![PathSpec::Pair(
                f.root.join("project/p/data.txt"),
                PathBuf::from("share/data.txt"),
            )],
            zip_includes: vec![PathSpec::Source(f.root.join("project/q/q.json"))],
            ..Default::default()
        };
        let project = f.project(config, vec![Executable::new("hello.py")]);
        let summary = Freezer::new(&project, f.context()?)?.freeze()?;
        let target = &summary.target_dir;

        assert!(target.join("lib/p/__init__.pyc").is_file());
        assert!(target.join("lib/p/helper.pyc").is_file());
        assert!(target.join("lib/p/data.txt").is_file());
        assert!(target.join("share/data.txt").is_file());

        let names = read_zip_names(&target.join("lib/library.zip"))?;
        assert!(names.contains(&"q/__init__.pyc".to_string()));
        assert!(names.contains(&"encodings/__init__.pyc".to_string()));
        assert!(names.contains(&"q.json".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("p/")));

        // Data of archived packages is still copied to disk.
        assert!(target.join("lib/q/q.json").is_file());

        Ok(())
    }

    #[test]
    fn stale_target_is_removed() -> Result<()> {
        let f = Fixture::new()?;
        f.write("project/hello.py", "")?;
        f.write("dist/stale.txt", "old")?;

        let project = f.project(FreezerConfig::default(), vec![Executable::new("hello.py")]);
        let freezer = Freezer::new(&project, f.context()?)?;
        assert!(!freezer.target_dir().join("stale.txt").exists());
        assert!(freezer.target_dir().join("lib").is_dir());

        Ok(())
    }

    #[test]
    fn target_dir_conflicts() -> Result<()> {
        let f = Fixture::new()?;
        f.write("project/hello.py", "")?;

        let config = FreezerConfig {
            target_dir: Some(f.root.join("project")),
            ..Default::default()
        };
        let project = f.project(config, vec![Executable::new("hello.py")]);
        assert!(matches!(
            Freezer::new(&project, f.context()?),
            Err(FreezeError::Config(_))
        ));

        let config = FreezerConfig {
            target_dir: Some(f.root.clone()),
            ..Default::default()
        };
        let project = f.project(config, vec![Executable::new("hello.py")]);
        assert!(matches!(
            Freezer::new(&project, f.context()?),
            Err(FreezeError::Config(_))
        ));
        assert!(f.root.join("project/hello.py").is_file());

        Ok(())
    }

    #[test]
    fn missing_inputs_are_file_errors() -> Result<()> {
        let f = Fixture::new()?;
        f.write("project/hello.py", "")?;

        let project = f.project(FreezerConfig::default(), vec![Executable::new("missing.py")]);
        let err = Freezer::new(&project, f.context()?)?.freeze().unwrap_err();
        assert!(matches!(err, FreezeError::File(..)));

        let mut exe = Executable::new("hello.py");
        exe.init_script = Some(f.root.join("project/init.py"));
        let project = f.project(FreezerConfig::default(), vec![exe]);
        let err = Freezer::new(&project, f.context()?)?.freeze().unwrap_err();
        assert!(matches!(err, FreezeError::File(..)));

        let config = FreezerConfig {
            bases_dir: Some(f.root.join("nobases")),
            ..Default::default()
        };
        let project = f.project(config, vec![Executable::new("hello.py")]);
        let err = Freezer::new(&project, f.context()?)?.freeze().unwrap_err();
        assert!(matches!(err, FreezeError::File(..)));

        Ok(())
    }

    #[test]
    fn project_loaded_from_file() -> Result<()> {
        let f = Fixture::new()?;
        f.write("project/hello.py", "")?;
        f.write(
            "project/pyfreeze.toml",
            &format!(
                "[build_exe]\ntarget_dir = \"../out\"\nbases_dir = {:?}\npath = [\".\", {:?}]\n\n[[executables]]\nscript = \"hello.py\"\ntarget_name = \"greeter\"\n",
                f.root.join("bases").display().to_string(),
                f.stdlib().display().to_string(),
            ),
        )?;

        let project = ProjectConfig::load(&f.root.join("project/pyfreeze.toml"))?;
        let summary = Freezer::new(&project, f.context()?)?.freeze()?;
        assert!(summary.target_dir.ends_with("out"));
        assert!(summary.target_dir.join("greeter").is_file());

        Ok(())
    }
}
