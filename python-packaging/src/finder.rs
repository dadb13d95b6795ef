// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Static discovery of the modules an application needs.

[ModuleFinder] starts from a set of requested names and follows every import
found by the [ImportScanner] until no new module turns up. Work is queued
and processed in FIFO order, so results are deterministic for a given search
path and request order.

`from P import n` is satisfied either by a name bound in `P` or by a
submodule `P.n`. Because star imports can bind names in `P` after `P` was
scanned, names not satisfied by either are only reported once star imports
have been propagated to a fixpoint.
*/

use {
    crate::{
        bytecode::{
            parse_bytecode_header, BytecodeOptimizationLevel, PythonBytecodeCompiler,
            PythonVersion,
        },
        hooks::{HookEffect, HookFileKind, HookRegistry},
        import_scanner::{resolve_relative_name, ImportRecord, ImportScanner},
        marshal::{loads_code, substitute_path_prefix, CodeObject},
        module::{MissingModules, MissingSeverity, Module, ModuleKind},
        module_util::{is_module_or_submodule, leaf_module_name, parent_module_name},
        package_metadata::{Distribution, DistributionIndex},
        path_resolver::{PathResolver, ResolvedModule},
        python_source::patch_source,
    },
    anyhow::{Context, Result},
    log::{debug, warn},
    std::{
        collections::{BTreeMap, BTreeSet, VecDeque},
        path::{Path, PathBuf},
    },
};

/// Importer recorded for names requested directly rather than by a module.
pub const REQUESTED_BY_CONFIG: &str = "<config>";

/// Modules every frozen application needs to start the interpreter.
pub const BASE_MODULES: &[&str] = &[
    "codecs",
    "collections.abc",
    "importlib.abc",
    "importlib.machinery",
    "io",
    "os",
    "sys",
    "traceback",
    "warnings",
    "zipimport",
    "zlib",
];

/// Packages every frozen application needs in full.
pub const BASE_PACKAGES: &[&str] = &["encodings"];

/// A file registered for inclusion by a hook.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IncludedFile {
    pub source: PathBuf,
    /// Destination relative to the `lib` directory.
    pub target: PathBuf,
    pub kind: HookFileKind,
    /// Module whose hook registered the file.
    pub module: String,
}

/// Options influencing discovery.
#[derive(Clone, Debug, Default)]
pub struct FinderOptions {
    /// Modules (and their submodules) never to include.
    pub excludes: Vec<String>,
    /// `(from_prefix, to_prefix)` substitutions applied to code filenames.
    pub replace_paths: Vec<(String, String)>,
    pub optimize: BytecodeOptimizationLevel,
    /// Modules compiled into the interpreter.
    pub builtin_modules: BTreeSet<String>,
    /// Modules frozen into the interpreter.
    pub frozen_modules: BTreeSet<String>,
}

#[derive(Clone, Debug)]
enum Request {
    Import {
        name: String,
        importer: Option<String>,
        severity: MissingSeverity,
        /// Set when importing `package.leaf` on behalf of `from package import leaf`.
        from: Option<(String, String)>,
    },
    FromList {
        package: String,
        names: Vec<String>,
        importer: String,
        severity: MissingSeverity,
    },
    Package {
        name: String,
        importer: Option<String>,
        severity: MissingSeverity,
    },
    Star {
        importer: String,
        target: String,
    },
}

#[derive(Clone, Debug)]
struct DeferredName {
    package: String,
    name: String,
    importer: Option<String>,
    severity: MissingSeverity,
}

/// Everything discovery produced.
#[derive(Clone, Debug, Default)]
pub struct FinderReport {
    /// Modules in discovery order.
    pub modules: Vec<Module>,
    pub missing: MissingModules,
    /// Unresolved names suppressed by an importer's ignored names.
    pub ignored: BTreeMap<String, BTreeSet<String>>,
    /// Names that were requested but excluded.
    pub excluded: BTreeSet<String>,
    pub included_files: Vec<IncludedFile>,
    /// Distributions providing at least one discovered module.
    pub distributions: Vec<Distribution>,
}

impl FinderReport {
    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn module_names(&self) -> BTreeSet<String> {
        self.modules.iter().map(|m| m.name.clone()).collect()
    }
}

/// Drives module discovery to a fixpoint.
pub struct ModuleFinder<'a> {
    compiler: &'a mut dyn PythonBytecodeCompiler,
    version: PythonVersion,
    scanner: ImportScanner,
    resolver: PathResolver,
    hooks: HookRegistry,
    distributions: DistributionIndex,
    options: FinderOptions,

    modules: BTreeMap<String, Module>,
    order: Vec<String>,
    aliases: BTreeMap<String, String>,
    generated: BTreeMap<String, Vec<u8>>,
    scripts: BTreeMap<String, PathBuf>,
    failed: BTreeSet<String>,
    missing: MissingModules,
    ignored: BTreeMap<String, BTreeSet<String>>,
    excluded_found: BTreeSet<String>,
    included_files: Vec<IncludedFile>,
    recursive_done: BTreeSet<String>,
    star_edges: Vec<(String, String)>,
    deferred: Vec<DeferredName>,
    queue: VecDeque<Request>,
}

impl<'a> ModuleFinder<'a> {
    pub fn new(
        compiler: &'a mut dyn PythonBytecodeCompiler,
        resolver: PathResolver,
        hooks: HookRegistry,
        distributions: DistributionIndex,
        options: FinderOptions,
    ) -> Result<Self> {
        let version = PythonVersion::from_magic_number(compiler.get_magic_number())?;
        let scanner = ImportScanner::new(version)?;

        Ok(Self {
            compiler,
            version,
            scanner,
            resolver,
            hooks,
            distributions,
            options,
            modules: BTreeMap::new(),
            order: vec![],
            aliases: BTreeMap::new(),
            generated: BTreeMap::new(),
            scripts: BTreeMap::new(),
            failed: BTreeSet::new(),
            missing: MissingModules::default(),
            ignored: BTreeMap::new(),
            excluded_found: BTreeSet::new(),
            included_files: vec![],
            recursive_done: BTreeSet::new(),
            star_edges: vec![],
            deferred: vec![],
            queue: VecDeque::new(),
        })
    }

    pub fn python_version(&self) -> PythonVersion {
        self.version
    }

    /// Request a module by name.
    pub fn include_module(&mut self, name: &str) {
        self.queue.push_back(Request::Import {
            name: name.to_string(),
            importer: None,
            severity: MissingSeverity::Missing,
            from: None,
        });
    }

    /// Request a package and, recursively, all of its submodules.
    pub fn include_package(&mut self, name: &str) {
        self.queue.push_back(Request::Package {
            name: name.to_string(),
            importer: None,
            severity: MissingSeverity::Missing,
        });
    }

    /// Request the modules the interpreter needs at startup.
    pub fn include_base_modules(&mut self) {
        for name in BASE_PACKAGES {
            self.include_package(name);
        }
        for name in BASE_MODULES {
            self.include_module(name);
        }
    }

    /// Register in-memory source for a module and request it.
    pub fn add_generated_module(&mut self, name: &str, source: Vec<u8>) {
        self.generated.insert(name.to_string(), source);
        self.include_module(name);
    }

    /// Load a script file under a module name and request it.
    pub fn include_file_as_module(&mut self, path: &Path, name: &str) {
        self.scripts.insert(name.to_string(), path.to_path_buf());
        self.include_module(name);
    }

    pub fn exclude_module(&mut self, name: &str) {
        self.options.excludes.push(name.to_string());
    }

    /// Make `alias` resolve to `target`.
    pub fn add_alias(&mut self, alias: &str, target: &str) {
        self.aliases.insert(alias.to_string(), target.to_string());
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    fn is_excluded(&self, name: &str, importer: Option<&str>) -> bool {
        if self
            .options
            .excludes
            .iter()
            .any(|e| is_module_or_submodule(name, e))
        {
            return true;
        }

        importer
            .and_then(|i| self.modules.get(i))
            .map(|m| m.exclude_names.iter().any(|e| is_module_or_submodule(name, e)))
            .unwrap_or(false)
    }

    fn is_ignored_by(&self, name: &str, importer: Option<&str>) -> bool {
        importer
            .and_then(|i| self.modules.get(i))
            .map(|m| m.ignored_names.iter().any(|n| is_module_or_submodule(name, n)))
            .unwrap_or(false)
    }

    fn report_missing(
        &mut self,
        name: &str,
        importer: Option<&str>,
        severity: MissingSeverity,
        from: Option<&(String, String)>,
    ) {
        if let Some((package, leaf)) = from {
            self.deferred.push(DeferredName {
                package: package.clone(),
                name: leaf.clone(),
                importer: importer.map(|s| s.to_string()),
                severity,
            });
            return;
        }

        let importer_name = importer.unwrap_or(REQUESTED_BY_CONFIG);

        if self.is_ignored_by(name, importer) {
            self.ignored
                .entry(name.to_string())
                .or_default()
                .insert(importer_name.to_string());
        } else {
            self.missing.record(name, importer_name, severity);
        }
    }

    /// Import a module and its parents. Returns whether the module exists.
    fn import_module(
        &mut self,
        name: &str,
        importer: Option<&str>,
        severity: MissingSeverity,
        from: Option<&(String, String)>,
    ) -> Result<bool> {
        if self.modules.contains_key(name) {
            return Ok(true);
        }

        if let Some(target) = self.aliases.get(name).cloned() {
            return self.import_alias(name, &target, importer, severity);
        }

        if self.is_excluded(name, importer) {
            self.excluded_found.insert(name.to_string());
            return Ok(false);
        }

        if self.failed.contains(name) {
            self.report_missing(name, importer, severity, from);
            return Ok(false);
        }

        let roots = match parent_module_name(name) {
            Some(parent) => {
                if !self.import_module(parent, importer, severity, None)? {
                    return Ok(false);
                }

                // Loading the parent may have run a hook registering the alias.
                if let Some(target) = self.aliases.get(name).cloned() {
                    return self.import_alias(name, &target, importer, severity);
                }

                let parent = match self.modules.get(parent) {
                    Some(parent) => parent,
                    None => return Ok(false),
                };

                match parent.kind {
                    ModuleKind::Alias => {
                        if let Some(real_parent) = parent.alias_of.clone() {
                            let target = format!("{}.{}", real_parent, leaf_module_name(name));
                            return self.import_alias(name, &target, importer, severity);
                        }
                        return Ok(false);
                    }
                    ModuleKind::Package | ModuleKind::NamespacePackage => {
                        Some(parent.search_roots.clone())
                    }
                    _ => {
                        self.failed.insert(name.to_string());
                        self.report_missing(name, importer, severity, from);
                        return Ok(false);
                    }
                }
            }
            None => None,
        };

        match self.load_module(name, roots.as_deref())? {
            Some(module) => {
                self.add_module(module)?;
                Ok(true)
            }
            None => {
                self.failed.insert(name.to_string());
                self.report_missing(name, importer, severity, from);
                Ok(false)
            }
        }
    }

    fn import_alias(
        &mut self,
        alias: &str,
        target: &str,
        importer: Option<&str>,
        severity: MissingSeverity,
    ) -> Result<bool> {
        if !self.import_module(target, importer, severity, None)? {
            return Ok(false);
        }

        let mut module = Module::new(alias, ModuleKind::Alias);
        module.alias_of = Some(target.to_string());
        if let Some(real) = self.modules.get(target) {
            module.global_names = real.global_names.clone();
        }

        debug!("{} is an alias of {}", alias, target);
        self.order.push(alias.to_string());
        self.modules.insert(alias.to_string(), module);

        Ok(true)
    }

    /// Locate a module and create its record. `None` if it can't be found.
    fn load_module(&mut self, name: &str, roots: Option<&[PathBuf]>) -> Result<Option<Module>> {
        let is_top_level = roots.is_none();

        let mut module = if let Some(source) = self.generated.get(name) {
            let mut module = Module::new(name, ModuleKind::Source);
            module.generated_source = Some(source.clone());
            module
        } else if let Some(path) = self.scripts.get(name) {
            let mut module = Module::new(name, ModuleKind::Source);
            module.file = Some(path.clone());
            module
        } else if is_top_level && self.options.builtin_modules.contains(name) {
            Module::new(name, ModuleKind::Builtin)
        } else {
            match self.resolver.find_module(leaf_module_name(name), roots) {
                Some(ResolvedModule::Package { init, dir }) => {
                    let mut module = Module::new(name, ModuleKind::Package);
                    module.file = Some(init);
                    module.search_roots = vec![dir];
                    module
                }
                Some(ResolvedModule::NamespacePackage { dirs }) => {
                    let mut module = Module::new(name, ModuleKind::NamespacePackage);
                    module.search_roots = dirs;
                    module
                }
                Some(ResolvedModule::Source(path)) => {
                    let mut module = Module::new(name, ModuleKind::Source);
                    module.file = Some(path);
                    module
                }
                Some(ResolvedModule::Bytecode(path)) => {
                    let mut module = Module::new(name, ModuleKind::Bytecode);
                    module.file = Some(path);
                    module
                }
                Some(ResolvedModule::Extension(path)) => {
                    let mut module = Module::new(name, ModuleKind::Extension);
                    module.file = Some(path);
                    module
                }
                None if self.options.frozen_modules.contains(name) => {
                    Module::new(name, ModuleKind::Frozen)
                }
                None => return Ok(None),
            }
        };

        if module.file.is_some() || module.kind == ModuleKind::NamespacePackage {
            module.distribution = self
                .distributions
                .for_module(name)
                .map(|d| d.normalized_name());
        }

        self.apply_hook(&mut module);

        if !self.compile_module(&mut module)? {
            return Ok(None);
        }

        Ok(Some(module))
    }

    fn apply_hook(&mut self, module: &mut Module) {
        let dist = self.distributions.for_module(&module.name);
        let hook = match self.hooks.resolve(&module.name, dist) {
            Some(hook) => hook.clone(),
            None => return,
        };

        debug!("applying hook for {} to {}", hook.module, module.name);

        for effect in hook.effects {
            match effect {
                HookEffect::IncludeModule { name } => {
                    self.queue.push_back(Request::Import {
                        name,
                        importer: Some(module.name.clone()),
                        severity: MissingSeverity::MaybeMissing,
                        from: None,
                    });
                }
                HookEffect::IncludePackage { name } => {
                    self.queue.push_back(Request::Package {
                        name,
                        importer: Some(module.name.clone()),
                        severity: MissingSeverity::MaybeMissing,
                    });
                }
                HookEffect::ExcludeModule { name } => {
                    self.options.excludes.push(name);
                }
                HookEffect::IgnoreNames { names } => {
                    module.ignored_names.extend(names);
                }
                HookEffect::GlobalNames { names } => {
                    module.global_names.extend(names);
                }
                HookEffect::ExcludeNames { names } => {
                    module.exclude_names.extend(names);
                }
                HookEffect::Alias { alias, target } => {
                    self.aliases.insert(alias, target);
                }
                HookEffect::PatchSource { find, replace } => {
                    if Self::is_sourceless(module) {
                        warn!(
                            "hook {} cannot patch {}: the module has no source",
                            hook.module, module.name
                        );
                    } else {
                        module.source_patches.push((find, replace));
                    }
                }
                HookEffect::IncludeFiles {
                    source,
                    target,
                    kind,
                } => self.include_hook_files(module, &source, target.as_deref(), kind),
                HookEffect::InFilesystem => {
                    module.in_filesystem = true;
                }
            }
        }
    }

    fn include_hook_files(
        &mut self,
        module: &Module,
        source: &Path,
        target: Option<&Path>,
        kind: HookFileKind,
    ) {
        let (base_dir, package_path) = if module.is_package() {
            (
                module.package_dir(),
                module.name.split('.').collect::<PathBuf>(),
            )
        } else {
            (
                module.file.as_ref().and_then(|f| f.parent()).map(|p| p.to_path_buf()),
                parent_module_name(&module.name)
                    .map(|p| p.split('.').collect::<PathBuf>())
                    .unwrap_or_default(),
            )
        };

        let base_dir = match base_dir {
            Some(dir) => dir,
            None => return,
        };

        let source_path = base_dir.join(source);
        let target_path = target
            .map(|t| t.to_path_buf())
            .unwrap_or_else(|| package_path.join(source));

        if !source_path.exists() {
            debug!(
                "{} does not exist; not including it for {}",
                source_path.display(),
                module.name
            );
            return;
        }

        let files = if source_path.is_dir() {
            walkdir::WalkDir::new(&source_path)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| {
                    let rel = e.path().strip_prefix(&source_path).ok()?.to_path_buf();
                    Some((e.path().to_path_buf(), target_path.join(rel)))
                })
                .collect::<Vec<_>>()
        } else {
            vec![(source_path, target_path)]
        };

        for (source, target) in files {
            if self.included_files.iter().any(|f| f.target == target) {
                continue;
            }
            self.included_files.push(IncludedFile {
                source,
                target,
                kind,
                module: module.name.clone(),
            });
        }
    }

    fn code_filename(&self, path: &str) -> String {
        substitute_path_prefix(path, &self.options.replace_paths)
    }

    /// Obtain the code object of a module. Returns false if the module turns
    /// out to be unusable.
    /// Whether a module is loaded from a `.pyc` file without source.
    fn is_sourceless(module: &Module) -> bool {
        module.kind == ModuleKind::Bytecode
            || module
                .file
                .as_ref()
                .and_then(|p| p.extension())
                .map(|ext| ext == "pyc")
                .unwrap_or(false)
    }

    fn compile_module(&mut self, module: &mut Module) -> Result<bool> {
        let is_bytecode_file = Self::is_sourceless(module);

        match module.kind {
            ModuleKind::Source | ModuleKind::Package if !is_bytecode_file => {
                let (source, filename) = if let Some(source) = &module.generated_source {
                    (source.clone(), format!("{}.py", module.name))
                } else if let Some(path) = &module.file {
                    let source = std::fs::read(path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    (source, self.code_filename(&path.display().to_string()))
                } else {
                    return Ok(true);
                };

                let source = if module.source_patches.is_empty() {
                    source
                } else {
                    patch_source(&source, &module.source_patches)
                        .with_context(|| format!("patching source of {}", module.name))?
                };

                let data = self
                    .compiler
                    .compile(&source, &filename, self.options.optimize)
                    .with_context(|| format!("compiling {}", module.name))?;
                module.code = Some(
                    loads_code(&data, self.version)
                        .with_context(|| format!("parsing code of {}", module.name))?,
                );
            }
            ModuleKind::Bytecode | ModuleKind::Package => {
                let path = match &module.file {
                    Some(path) => path.clone(),
                    None => return Ok(true),
                };
                match self.load_bytecode(&path)? {
                    Some(code) => module.code = Some(code),
                    None => return Ok(false),
                }
            }
            ModuleKind::NamespacePackage => {
                let filename = format!("{}/__init__.py", module.name.replace('.', "/"));
                let data = self
                    .compiler
                    .compile(b"", &filename, self.options.optimize)
                    .with_context(|| format!("compiling {}", module.name))?;
                module.code = Some(loads_code(&data, self.version)?);
            }
            _ => {}
        }

        Ok(true)
    }

    fn load_bytecode(&self, path: &Path) -> Result<Option<CodeObject>> {
        let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let (magic, _, body) =
            parse_bytecode_header(&data).with_context(|| format!("parsing {}", path.display()))?;

        if magic != self.compiler.get_magic_number() {
            warn!(
                "{} was compiled by a different Python version; ignoring it",
                path.display()
            );
            return Ok(None);
        }

        let mut code = loads_code(body, self.version)
            .with_context(|| format!("parsing code in {}", path.display()))?;

        let original = code.filename_lossy();
        let replaced = self.code_filename(&original);
        if replaced != original {
            code.rewrite_filename(&replaced);
        }

        Ok(Some(code))
    }

    fn add_module(&mut self, mut module: Module) -> Result<()> {
        let scan = module.code.as_ref().map(|code| self.scanner.scan(code));

        if let Some(scan) = &scan {
            module.global_names.extend(scan.global_names.iter().cloned());
        }

        debug!("found {} module {}", module.kind, module.name);
        let name = module.name.clone();
        self.missing.resolve(&name);
        self.order.push(name.clone());
        self.modules.insert(name.clone(), module);

        if let Some(scan) = scan {
            for record in scan.imports {
                self.queue_import(&name, &record);
            }
        }

        Ok(())
    }

    fn queue_import(&mut self, importer: &str, record: &ImportRecord) {
        let (is_package, exclude_names) = match self.modules.get(importer) {
            Some(m) => (m.is_package(), m.exclude_names.clone()),
            None => return,
        };

        let severity = if record.is_conditional() {
            MissingSeverity::MaybeMissing
        } else {
            MissingSeverity::Missing
        };

        let name = match resolve_relative_name(importer, is_package, &record.name, record.level) {
            Some(name) => name,
            None => {
                let shown = format!("{}{}", ".".repeat(record.level as usize), record.name);
                self.report_missing(&shown, Some(importer), severity, None);
                return;
            }
        };

        if name.is_empty() || exclude_names.iter().any(|e| is_module_or_submodule(&name, e)) {
            return;
        }

        self.queue.push_back(Request::Import {
            name: name.clone(),
            importer: Some(importer.to_string()),
            severity,
            from: None,
        });

        if record.is_star() {
            self.queue.push_back(Request::Star {
                importer: importer.to_string(),
                target: name,
            });
        } else if !record.fromlist.is_empty() {
            self.queue.push_back(Request::FromList {
                package: name,
                names: record.fromlist.clone(),
                importer: importer.to_string(),
                severity,
            });
        }
    }

    fn process_from_list(
        &mut self,
        package: &str,
        names: &[String],
        importer: &str,
        severity: MissingSeverity,
    ) {
        let (kind, alias_of) = match self.modules.get(package) {
            Some(m) => (m.kind, m.alias_of.clone()),
            None => return,
        };

        if kind == ModuleKind::Alias {
            // Only names registered as aliases are known below an alias. The
            // rest are looked up in the real package, if it is one.
            let mut remaining = vec![];
            for name in names {
                let full = format!("{}.{}", package, name);
                if self.aliases.contains_key(&full) {
                    self.queue.push_back(Request::Import {
                        name: full,
                        importer: Some(importer.to_string()),
                        severity,
                        from: None,
                    });
                } else {
                    remaining.push(name.clone());
                }
            }

            if let Some(target) = alias_of {
                if !remaining.is_empty() {
                    self.queue.push_back(Request::FromList {
                        package: target,
                        names: remaining,
                        importer: importer.to_string(),
                        severity,
                    });
                }
            }
            return;
        }

        if !matches!(kind, ModuleKind::Package | ModuleKind::NamespacePackage) {
            return;
        }

        for name in names {
            self.queue.push_back(Request::Import {
                name: format!("{}.{}", package, name),
                importer: Some(importer.to_string()),
                severity,
                from: Some((package.to_string(), name.clone())),
            });
        }
    }

    fn process_package(
        &mut self,
        name: &str,
        importer: Option<&str>,
        severity: MissingSeverity,
    ) -> Result<()> {
        if !self.import_module(name, importer, severity, None)? {
            return Ok(());
        }

        let roots = match self.modules.get(name) {
            Some(m) if m.is_package() => m.search_roots.clone(),
            _ => return Ok(()),
        };

        if !self.recursive_done.insert(name.to_string()) {
            return Ok(());
        }

        for leaf in self.resolver.iter_submodule_names(&roots) {
            self.queue.push_back(Request::Package {
                name: format!("{}.{}", name, leaf),
                importer: Some(name.to_string()),
                severity: MissingSeverity::MaybeMissing,
            });
        }

        Ok(())
    }

    /// Copy public names through star imports until nothing changes.
    fn propagate_star_imports(&mut self) {
        loop {
            let mut changed = false;

            for (importer, target) in &self.star_edges {
                let names = match self.modules.get(target) {
                    Some(m) => m
                        .global_names
                        .iter()
                        .filter(|n| !n.starts_with('_'))
                        .cloned()
                        .collect::<Vec<_>>(),
                    None => continue,
                };

                if let Some(m) = self.modules.get_mut(importer) {
                    for name in names {
                        changed |= m.global_names.insert(name);
                    }
                }
            }

            if !changed {
                break;
            }
        }
    }

    fn check_deferred_names(&mut self) {
        for deferred in std::mem::take(&mut self.deferred) {
            let full = format!("{}.{}", deferred.package, deferred.name);
            let satisfied = self.modules.contains_key(&full)
                || self
                    .modules
                    .get(&deferred.package)
                    .map(|p| p.global_names.contains(&deferred.name))
                    .unwrap_or(true);

            if !satisfied {
                self.report_missing(&full, deferred.importer.as_deref(), deferred.severity, None);
            }
        }
    }

    fn prune_excluded(&mut self) {
        let excluded = self
            .modules
            .keys()
            .filter(|name| self.is_excluded(name, None))
            .cloned()
            .collect::<Vec<_>>();

        for name in excluded {
            debug!("dropping excluded module {}", name);
            self.modules.remove(&name);
            self.excluded_found.insert(name);
        }

        let modules = &self.modules;
        self.order.retain(|name| modules.contains_key(name));
    }

    /// Process queued requests until discovery reaches a fixpoint.
    pub fn run(&mut self) -> Result<()> {
        while let Some(request) = self.queue.pop_front() {
            match request {
                Request::Import {
                    name,
                    importer,
                    severity,
                    from,
                } => {
                    self.import_module(&name, importer.as_deref(), severity, from.as_ref())?;
                }
                Request::FromList {
                    package,
                    names,
                    importer,
                    severity,
                } => self.process_from_list(&package, &names, &importer, severity),
                Request::Package {
                    name,
                    importer,
                    severity,
                } => self.process_package(&name, importer.as_deref(), severity)?,
                Request::Star { importer, target } => {
                    self.star_edges.push((importer, target));
                }
            }
        }

        self.propagate_star_imports();
        self.check_deferred_names();
        self.prune_excluded();

        Ok(())
    }

    /// Run discovery and return its results.
    pub fn finish(mut self) -> Result<FinderReport> {
        self.run()?;

        let mut distributions = BTreeMap::new();
        for module in self.modules.values() {
            if let Some(dist) = module
                .distribution
                .as_ref()
                .and_then(|name| self.distributions.get(name))
            {
                distributions
                    .entry(dist.normalized_name())
                    .or_insert_with(|| dist.clone());
            }
        }

        let mut modules = self.modules;
        let report_modules = self
            .order
            .iter()
            .filter_map(|name| modules.remove(name))
            .collect();

        Ok(FinderReport {
            modules: report_modules,
            missing: self.missing,
            ignored: self.ignored,
            excluded: self.excluded_found,
            included_files: self.included_files,
            distributions: distributions.into_values().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            bytecode::BytecodeCompiler,
            hooks::Hook,
            testutil::{test_interpreter, FakeBytecodeCompiler},
        },
    };

    fn write(root: &Path, rel: &str, content: &str) -> Result<()> {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    fn options() -> FinderOptions {
        FinderOptions {
            builtin_modules: ["gc", "sys"].iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn write_relative_import_tree(root: &Path) -> Result<()> {
        write(root, "__future__.py", "all_feature_names = []\n")?;
        write(root, "a/__init__.py", "")?;
        write(
            root,
            "a/module.py",
            "from __future__ import absolute_import\nimport gc\nfrom .b import y, z\n",
        )?;
        write(root, "a/b/__init__.py", "from . import x\n")?;
        write(root, "a/b/x.py", "from .c import moduleC\n")?;
        write(root, "a/b/y.py", "from .c import d\n")?;
        write(root, "a/b/z.py", "from .c.e import VALUE\n")?;
        write(root, "a/b/c/__init__.py", "")?;
        write(root, "a/b/c/moduleC.py", "from .. import y\n")?;
        write(root, "a/b/c/d.py", "from ...b.c import e\n")?;
        write(root, "a/b/c/e.py", "VALUE = 1\n")?;

        Ok(())
    }

    fn relative_import_tree_names() -> BTreeSet<String> {
        names(&[
            "a",
            "a.module",
            "a.b",
            "a.b.x",
            "a.b.y",
            "a.b.z",
            "a.b.c",
            "a.b.c.moduleC",
            "a.b.c.d",
            "a.b.c.e",
            "__future__",
            "gc",
        ])
    }

    #[test]
    fn relative_import_fixpoint() -> Result<()> {
        let td = tempfile::Builder::new()
            .prefix("python-packaging-test")
            .tempdir()?;
        let root = td.path();
        write_relative_import_tree(root)?;

        let mut compiler = FakeBytecodeCompiler::default();
        let mut finder = ModuleFinder::new(
            &mut compiler,
            PathResolver::new(vec![root], vec![]),
            HookRegistry::new(),
            DistributionIndex::default(),
            options(),
        )?;
        finder.include_module("a.module");
        let report = finder.finish()?;

        assert_eq!(report.module_names(), relative_import_tree_names());
        assert!(report.missing.is_empty(), "{:?}", report.missing);
        assert_eq!(report.modules[0].name, "a");
        assert_eq!(report.modules[1].name, "a.module");

        Ok(())
    }

    #[test]
    fn relative_import_fixpoint_with_interpreter() -> Result<()> {
        let Some((python, _)) = test_interpreter() else {
            return Ok(());
        };

        let td = tempfile::Builder::new()
            .prefix("python-packaging-test")
            .tempdir()?;
        let root = td.path();
        write_relative_import_tree(root)?;

        let mut compiler = BytecodeCompiler::new(&python)?;
        let mut finder = ModuleFinder::new(
            &mut compiler,
            PathResolver::new(vec![root], vec![]),
            HookRegistry::new(),
            DistributionIndex::default(),
            options(),
        )?;
        finder.include_module("a.module");
        let report = finder.finish()?;

        assert_eq!(report.module_names(), relative_import_tree_names());
        assert!(report.missing.is_empty(), "{:?}", report.missing);

        Ok(())
    }

    #[test]
    fn missing_severity_with_interpreter() -> Result<()> {
        let Some((python, _)) = test_interpreter() else {
            return Ok(());
        };

        let td = tempfile::Builder::new()
            .prefix("python-packaging-test")
            .tempdir()?;
        let root = td.path();
        write(
            root,
            "app.py",
            "with open('x') as fh:\n    import nope_with\n\
             import nope_top\n\
             try:\n    import nope_try\nexcept ImportError:\n    pass\n\
             def later():\n    import nope_nested\n",
        )?;

        let mut compiler = BytecodeCompiler::new(&python)?;
        let mut finder = ModuleFinder::new(
            &mut compiler,
            PathResolver::new(vec![root], vec![]),
            HookRegistry::new(),
            DistributionIndex::default(),
            options(),
        )?;
        finder.include_module("app");
        let report = finder.finish()?;

        let missing = &report.missing;
        assert!(missing.missing.contains_key("nope_with"), "{:?}", missing);
        assert!(missing.missing.contains_key("nope_top"), "{:?}", missing);
        assert!(missing.maybe_missing.contains_key("nope_try"), "{:?}", missing);
        assert!(missing.maybe_missing.contains_key("nope_nested"), "{:?}", missing);

        Ok(())
    }

    #[test]
    fn missing_severity() -> Result<()> {
        let td = tempfile::Builder::new()
            .prefix("python-packaging-test")
            .tempdir()?;
        let root = td.path();

        write(
            root,
            "app.py",
            "import absent\ntry:\n    import optional\nexcept ImportError:\n    optional = None\ndef f():\n    import lazy\nimport win32api\n",
        )?;

        let mut hooks = HookRegistry::new();
        hooks.register(Hook::new(
            "app",
            vec![HookEffect::IgnoreNames {
                names: vec!["win32api".to_string()],
            }],
        ));

        let mut compiler = FakeBytecodeCompiler::default();
        let mut finder = ModuleFinder::new(
            &mut compiler,
            PathResolver::new(vec![root], vec![]),
            hooks,
            DistributionIndex::default(),
            options(),
        )?;
        finder.include_module("app");
        let report = finder.finish()?;

        assert_eq!(
            report.missing.missing.keys().cloned().collect::<BTreeSet<_>>(),
            names(&["absent"])
        );
        assert_eq!(
            report
                .missing
                .maybe_missing
                .keys()
                .cloned()
                .collect::<BTreeSet<_>>(),
            names(&["lazy", "optional"])
        );
        assert!(report.ignored.contains_key("win32api"));

        Ok(())
    }

    #[test]
    fn from_import_of_attribute_vs_submodule() -> Result<()> {
        let td = tempfile::Builder::new()
            .prefix("python-packaging-test")
            .tempdir()?;
        let root = td.path();

        write(root, "pkg/__init__.py", "from pkg.impl import *\nDEFINED = 1\n")?;
        write(root, "pkg/impl.py", "exported = 1\n_private = 2\n")?;
        write(root, "pkg/sub.py", "")?;
        write(
            root,
            "app.py",
            "from pkg import DEFINED, exported, sub, nothing\n",
        )?;

        let mut compiler = FakeBytecodeCompiler::default();
        let mut finder = ModuleFinder::new(
            &mut compiler,
            PathResolver::new(vec![root], vec![]),
            HookRegistry::new(),
            DistributionIndex::default(),
            options(),
        )?;
        finder.include_module("app");
        let report = finder.finish()?;

        assert!(report.module("pkg.sub").is_some());
        assert!(report.module("pkg.impl").is_some());
        assert_eq!(
            report.missing.missing.keys().cloned().collect::<BTreeSet<_>>(),
            names(&["pkg.nothing"])
        );
        assert!(report
            .module("pkg")
            .map(|m| m.global_names.contains("exported") && !m.global_names.contains("_private"))
            .unwrap_or(false));

        Ok(())
    }

    #[test]
    fn excludes_aliases_and_packages() -> Result<()> {
        let td = tempfile::Builder::new()
            .prefix("python-packaging-test")
            .tempdir()?;
        let root = td.path();

        write(root, "six.py", "")?;
        write(root, "queue.py", "")?;
        write(root, "tests/__init__.py", "import heavy\n")?;
        write(root, "heavy.py", "")?;
        write(root, "plugins/__init__.py", "")?;
        write(root, "plugins/one.py", "")?;
        write(root, "plugins/more/__init__.py", "")?;
        write(root, "plugins/more/two.py", "")?;
        write(
            root,
            "app.py",
            "import six\nfrom six.moves import queue\nimport tests\n",
        )?;

        let mut compiler = FakeBytecodeCompiler::default();
        let mut finder = ModuleFinder::new(
            &mut compiler,
            PathResolver::new(vec![root], vec![]),
            HookRegistry::builtin(crate::hooks::HookPlatform::Linux),
            DistributionIndex::default(),
            FinderOptions {
                excludes: vec!["tests".to_string()],
                ..options()
            },
        )?;
        finder.include_module("app");
        finder.include_package("plugins");
        let report = finder.finish()?;

        let found = report.module_names();
        assert!(found.contains("six.moves"));
        assert!(found.contains("six.moves.queue"));
        assert_eq!(
            report.module("six.moves.queue").and_then(|m| m.alias_of.as_deref()),
            Some("queue")
        );
        assert!(!found.contains("tests"));
        assert!(!found.contains("heavy"));
        assert!(report.excluded.contains("tests"));
        for name in ["plugins", "plugins.one", "plugins.more", "plugins.more.two"] {
            assert!(found.contains(name), "{}", name);
        }
        assert!(report.missing.is_empty(), "{:?}", report.missing);

        Ok(())
    }

    #[test]
    fn runtime_globals_from_builtin_hooks() -> Result<()> {
        let td = tempfile::Builder::new()
            .prefix("python-packaging-test")
            .tempdir()?;
        let root = td.path();

        write(root, "re/__init__.py", "")?;
        write(root, "multiprocessing/__init__.py", "")?;
        write(
            root,
            "app.py",
            "from re import IGNORECASE, nonexistent\nfrom multiprocessing import get_context\n",
        )?;

        let mut compiler = FakeBytecodeCompiler::default();
        let mut finder = ModuleFinder::new(
            &mut compiler,
            PathResolver::new(vec![root], vec![]),
            HookRegistry::builtin(crate::hooks::HookPlatform::Linux),
            DistributionIndex::default(),
            options(),
        )?;
        finder.include_module("app");
        let report = finder.finish()?;

        assert!(!report.missing.missing.contains_key("re.IGNORECASE"));
        assert!(!report
            .missing
            .missing
            .contains_key("multiprocessing.get_context"));
        assert!(report.missing.missing.contains_key("re.nonexistent"));

        Ok(())
    }

    #[test]
    fn namespace_packages_and_generated_modules() -> Result<()> {
        let td = tempfile::Builder::new()
            .prefix("python-packaging-test")
            .tempdir()?;
        let first = td.path().join("first");
        let second = td.path().join("second");

        write(&first, "namespacepack/firstchildpack/__init__.py", "")?;
        write(&second, "namespacepack/secondchildpack/__init__.py", "")?;

        let mut compiler = FakeBytecodeCompiler::default();
        let mut finder = ModuleFinder::new(
            &mut compiler,
            PathResolver::new(vec![&first, &second], vec![]),
            HookRegistry::new(),
            DistributionIndex::default(),
            options(),
        )?;
        finder.add_generated_module(
            "BUILD_CONSTANTS",
            b"import namespacepack.firstchildpack\nimport namespacepack.secondchildpack\n".to_vec(),
        );
        let report = finder.finish()?;

        let ns = report
            .module("namespacepack")
            .ok_or_else(|| anyhow::anyhow!("namespace package not found"))?;
        assert_eq!(ns.kind, ModuleKind::NamespacePackage);
        assert_eq!(ns.search_roots.len(), 2);
        assert!(ns.code.is_some());
        assert!(report.module("namespacepack.secondchildpack").is_some());
        assert!(report
            .module("BUILD_CONSTANTS")
            .map(|m| m.generated_source.is_some())
            .unwrap_or(false));

        Ok(())
    }

    #[test]
    fn sourceless_bytecode_and_replace_paths() -> Result<()> {
        let td = tempfile::Builder::new()
            .prefix("python-packaging-test")
            .tempdir()?;
        let root = td.path();
        let version = PythonVersion::new(3, 12);

        let mut helper = FakeBytecodeCompiler::new(version);
        let body = helper.compile(
            b"import dep\n",
            "/build/src/compiled.py",
            BytecodeOptimizationLevel::Zero,
        )?;
        let mut pyc = crate::bytecode::compute_bytecode_header(
            version.magic_number()?,
            crate::bytecode::BytecodeHeaderMode::UncheckedHash(0),
        )?;
        pyc.extend(body);
        std::fs::write(root.join("compiled.pyc"), pyc)?;
        write(root, "dep.py", "")?;

        let mut hooks = HookRegistry::new();
        hooks.register(Hook::new(
            "compiled",
            vec![HookEffect::PatchSource {
                find: "dep".to_string(),
                replace: "other".to_string(),
            }],
        ));

        let mut compiler = FakeBytecodeCompiler::new(version);
        let mut finder = ModuleFinder::new(
            &mut compiler,
            PathResolver::new(vec![root], vec![]),
            hooks,
            DistributionIndex::default(),
            FinderOptions {
                replace_paths: vec![("/build/src".to_string(), "src".to_string())],
                ..options()
            },
        )?;
        finder.include_module("compiled");
        let report = finder.finish()?;

        let compiled = report
            .module("compiled")
            .ok_or_else(|| anyhow::anyhow!("module not found"))?;
        assert_eq!(compiled.kind, ModuleKind::Bytecode);
        assert_eq!(
            compiled.code.as_ref().map(|c| c.filename_lossy()),
            Some("src/compiled.py".to_string())
        );
        // The patch cannot apply without source and is dropped.
        assert!(compiled.source_patches.is_empty());
        assert!(report.module("dep").is_some());

        Ok(())
    }
}
