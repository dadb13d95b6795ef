// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Per-module adjustments to module discovery.

A [Hook] pairs a predicate (module name, optionally submodules, optionally a
guard on the installed distribution) with a list of [HookEffect]s. The
module finder applies the effects of the single best matching hook when a
module is first loaded.
*/

use {
    crate::package_metadata::{normalize_distribution_name, Distribution},
    serde::Deserialize,
    std::path::PathBuf,
    version_compare::Cmp,
};

/// What a file registered by a hook is.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum HookFileKind {
    /// Copied verbatim.
    Data,
    /// Copied and then walked for native dependencies.
    SharedLibrary,
}

impl Default for HookFileKind {
    fn default() -> Self {
        Self::Data
    }
}

/// An adjustment a hook makes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum HookEffect {
    /// Pull in a module.
    IncludeModule { name: String },
    /// Pull in a package and all of its submodules.
    IncludePackage { name: String },
    /// Exclude a module and its submodules from the build.
    ExcludeModule { name: String },
    /// Names whose absence should not be reported for this module.
    IgnoreNames { names: Vec<String> },
    /// Names the module binds dynamically.
    GlobalNames { names: Vec<String> },
    /// Names this module must not pull in.
    ExcludeNames { names: Vec<String> },
    /// Make `alias` another name for module `target`.
    Alias { alias: String, target: String },
    /// Literal find/replace in the module source before compilation.
    PatchSource { find: String, replace: String },
    /// Files relative to the module's directory to copy into the build.
    ///
    /// `target` is relative to the `lib` directory and defaults to the
    /// package's own path.
    IncludeFiles {
        source: PathBuf,
        #[serde(default)]
        target: Option<PathBuf>,
        #[serde(default)]
        kind: HookFileKind,
    },
    /// Keep the module as a file on disk.
    InFilesystem,
}

/// A constraint on the distribution that installed a module.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct DistributionGuard {
    /// Distribution name. Defaults to whatever provides the module.
    #[serde(default)]
    pub distribution: Option<String>,
    /// Inclusive lower bound.
    #[serde(default)]
    pub min_version: Option<String>,
    /// Exclusive upper bound.
    #[serde(default)]
    pub max_version: Option<String>,
    /// Required `INSTALLER` value, e.g. `pip` or `conda`.
    #[serde(default)]
    pub installer: Option<String>,
}

impl DistributionGuard {
    /// Whether an installed distribution satisfies the guard.
    ///
    /// Guards never pass without a distribution.
    pub fn matches(&self, dist: Option<&Distribution>) -> bool {
        let dist = match dist {
            Some(dist) => dist,
            None => return false,
        };

        if let Some(name) = &self.distribution {
            if normalize_distribution_name(name) != dist.normalized_name() {
                return false;
            }
        }

        if let Some(min) = &self.min_version {
            if !version_compare::compare_to(&dist.version, min, Cmp::Ge).unwrap_or(false) {
                return false;
            }
        }

        if let Some(max) = &self.max_version {
            if !version_compare::compare_to(&dist.version, max, Cmp::Lt).unwrap_or(false) {
                return false;
            }
        }

        if let Some(installer) = &self.installer {
            if dist.installer.as_deref() != Some(installer.as_str()) {
                return false;
            }
        }

        true
    }
}

/// A rule applied to a module when it is first loaded.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Hook {
    /// Module the hook targets.
    pub module: String,
    /// Also match submodules of `module`.
    #[serde(default)]
    pub prefix: bool,
    #[serde(default)]
    pub guard: Option<DistributionGuard>,
    pub effects: Vec<HookEffect>,
}

impl Hook {
    pub fn new(module: &str, effects: Vec<HookEffect>) -> Self {
        Self {
            module: module.to_string(),
            prefix: false,
            guard: None,
            effects,
        }
    }

    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    pub fn with_guard(mut self, guard: DistributionGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    fn matches_name(&self, name: &str) -> bool {
        self.module == name
            || (self.prefix && crate::module_util::is_module_or_submodule(name, &self.module))
    }
}

/// Platform family built-in hooks are generated for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HookPlatform {
    Linux,
    MacOs,
    Windows,
}

impl HookPlatform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Linux
        }
    }
}

/// Modules that only exist on Windows.
const WINDOWS_ONLY_MODULES: &[&str] = &[
    "_overlapped",
    "_winapi",
    "_winreg",
    "msvcrt",
    "nt",
    "pywintypes",
    "win32api",
    "win32con",
    "win32pipe",
    "winreg",
];

/// Modules that never exist on Windows.
const POSIX_ONLY_MODULES: &[&str] = &[
    "_posixshmem",
    "_posixsubprocess",
    "fcntl",
    "grp",
    "posix",
    "pwd",
    "resource",
    "termios",
];

/// Stdlib modules importing platform-specific modules behind runtime checks.
const PLATFORM_CONDITIONAL_MODULES: &[&str] = &[
    "_pyio",
    "asyncio",
    "ctypes",
    "encodings",
    "getpass",
    "importlib",
    "mimetypes",
    "multiprocessing",
    "ntpath",
    "os",
    "pathlib",
    "platform",
    "posixpath",
    "shutil",
    "site",
    "subprocess",
    "sysconfig",
    "tempfile",
    "urllib",
    "uuid",
];

/// Flags `re` copies from `RegexFlag` into its namespace at import time.
const RE_FLAG_NAMES: &[&str] = &[
    "A",
    "ASCII",
    "DEBUG",
    "DOTALL",
    "I",
    "IGNORECASE",
    "L",
    "LOCALE",
    "M",
    "MULTILINE",
    "NOFLAG",
    "S",
    "T",
    "TEMPLATE",
    "U",
    "UNICODE",
    "VERBOSE",
    "X",
];

/// Public attributes of the default context `multiprocessing` re-exports.
const MULTIPROCESSING_CONTEXT_NAMES: &[&str] = &[
    "Array",
    "AuthenticationError",
    "Barrier",
    "BoundedSemaphore",
    "BufferTooShort",
    "Condition",
    "Event",
    "JoinableQueue",
    "Lock",
    "Manager",
    "Pipe",
    "Pool",
    "Process",
    "ProcessError",
    "Queue",
    "RLock",
    "RawArray",
    "RawValue",
    "Semaphore",
    "SimpleQueue",
    "TimeoutError",
    "Value",
    "active_children",
    "allow_connection_pickling",
    "cpu_count",
    "current_process",
    "freeze_support",
    "get_all_start_methods",
    "get_context",
    "get_logger",
    "get_start_method",
    "log_to_stderr",
    "parent_process",
    "reducer",
    "set_executable",
    "set_forkserver_preload",
    "set_start_method",
];

const SIX_MOVES: &[(&str, &str)] = &[
    ("six.moves.builtins", "builtins"),
    ("six.moves.configparser", "configparser"),
    ("six.moves.copyreg", "copyreg"),
    ("six.moves.cPickle", "pickle"),
    ("six.moves.http_client", "http.client"),
    ("six.moves.queue", "queue"),
    ("six.moves.urllib", "urllib"),
    ("six.moves.urllib.parse", "urllib.parse"),
    ("six.moves.urllib.request", "urllib.request"),
    ("six.moves.urllib.error", "urllib.error"),
];

fn names(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// Resolves which hook applies to a module.
#[derive(Clone, Debug, Default)]
pub struct HookRegistry {
    hooks: Vec<Hook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The hooks shipped with the freezer.
    pub fn builtin(platform: HookPlatform) -> Self {
        let mut registry = Self::new();

        let foreign_modules = if platform == HookPlatform::Windows {
            POSIX_ONLY_MODULES
        } else {
            WINDOWS_ONLY_MODULES
        };

        for module in PLATFORM_CONDITIONAL_MODULES {
            let mut effects = vec![HookEffect::IgnoreNames {
                names: names(foreign_modules),
            }];

            if *module == "multiprocessing" {
                effects.push(HookEffect::GlobalNames {
                    names: names(MULTIPROCESSING_CONTEXT_NAMES),
                });
            }

            match (*module, platform) {
                ("multiprocessing", HookPlatform::Windows) => {
                    effects.push(HookEffect::IncludeModule {
                        name: "multiprocessing.popen_spawn_win32".to_string(),
                    });
                }
                ("multiprocessing", _) => {
                    for name in [
                        "multiprocessing.popen_fork",
                        "multiprocessing.popen_forkserver",
                        "multiprocessing.popen_spawn_posix",
                    ] {
                        effects.push(HookEffect::IncludeModule {
                            name: name.to_string(),
                        });
                    }
                }
                ("os", _) => {
                    effects.push(HookEffect::Alias {
                        alias: "os.path".to_string(),
                        target: if platform == HookPlatform::Windows {
                            "ntpath".to_string()
                        } else {
                            "posixpath".to_string()
                        },
                    });
                }
                ("ctypes", HookPlatform::MacOs) => {
                    effects.push(HookEffect::IncludeModule {
                        name: "ctypes.macholib.dyld".to_string(),
                    });
                }
                _ => {}
            }

            registry.register(Hook::new(module, effects).with_prefix());
        }

        registry.register(Hook::new(
            "re",
            vec![HookEffect::GlobalNames {
                names: names(RE_FLAG_NAMES),
            }],
        ));

        let mut six_effects = SIX_MOVES
            .iter()
            .map(|(alias, target)| HookEffect::Alias {
                alias: alias.to_string(),
                target: target.to_string(),
            })
            .collect::<Vec<_>>();
        six_effects.push(HookEffect::Alias {
            alias: "six.moves".to_string(),
            target: "six".to_string(),
        });
        registry.register(Hook::new("six", six_effects));

        registry.register(Hook::new("certifi", vec![HookEffect::InFilesystem]));
        registry.register(Hook::new("pytz", vec![HookEffect::InFilesystem]));

        registry.register(Hook::new(
            "zoneinfo",
            vec![HookEffect::IncludePackage {
                name: "tzdata".to_string(),
            }],
        ));

        registry.register(Hook::new(
            "xml.etree.cElementTree",
            vec![HookEffect::IncludeModule {
                name: "xml.etree.ElementTree".to_string(),
            }],
        ));

        registry.register(
            Hook::new(
                "numpy",
                vec![
                    HookEffect::IncludePackage {
                        name: "numpy._core".to_string(),
                    },
                    HookEffect::IgnoreNames {
                        names: names(&["numpy.core._dotblas", "numpy.distutils"]),
                    },
                ],
            )
            .with_guard(DistributionGuard {
                distribution: Some("numpy".to_string()),
                min_version: Some("2.0".to_string()),
                ..Default::default()
            }),
        );
        registry.register(
            Hook::new(
                "numpy",
                vec![
                    HookEffect::IncludePackage {
                        name: "numpy.core".to_string(),
                    },
                    HookEffect::IgnoreNames {
                        names: names(&["numpy.core._dotblas", "numpy.distutils"]),
                    },
                ],
            )
            .with_guard(DistributionGuard {
                distribution: Some("numpy".to_string()),
                max_version: Some("2.0".to_string()),
                ..Default::default()
            }),
        );

        registry
    }

    /// Add a hook. Earlier registrations win ties.
    pub fn register(&mut self, hook: Hook) {
        self.hooks.push(hook);
    }

    /// Add hooks that take precedence over everything registered so far.
    pub fn prepend<I: IntoIterator<Item = Hook>>(&mut self, hooks: I) {
        let mut new = hooks.into_iter().collect::<Vec<_>>();
        new.append(&mut self.hooks);
        self.hooks = new;
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Find the hook applying to a module.
    ///
    /// A hook naming the module exactly wins. Otherwise the hook with the
    /// longest matching prefix wins. Remaining ties go to the earliest
    /// registration. Hooks whose guard fails are not candidates.
    pub fn resolve(&self, module: &str, dist: Option<&Distribution>) -> Option<&Hook> {
        let candidates = self.hooks.iter().filter(|hook| {
            hook.matches_name(module)
                && hook
                    .guard
                    .as_ref()
                    .map(|guard| guard.matches(dist))
                    .unwrap_or(true)
        });

        let mut best: Option<&Hook> = None;
        for hook in candidates {
            if hook.module == module {
                return Some(hook);
            }

            match best {
                Some(current) if current.module.len() >= hook.module.len() => {}
                _ => best = Some(hook),
            }
        }

        best
    }
}
