// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{
        config::ProjectConfig,
        environment::{resolve_python, DEFAULT_CONFIG_FILE, PYFREEZE_VERSION},
        error::FreezeError,
        freezer::{FreezeContext, Freezer},
        logging::init_logging,
    },
    clap::{value_parser, Arg, ArgAction, ArgMatches, Command},
    log::{info, warn},
    std::path::PathBuf,
};

const BUILD_EXE_ABOUT: &str = "\
Freeze the executables of a project.

The project file is a TOML document with a [build_exe] table holding
freezer options, an optional [metadata] table and one [[executables]]
entry per launcher to produce.

Modules reachable from each executable's script are compiled to bytecode
and stored in lib/library.zip or below lib/. Launchers, native extension
modules and the shared libraries they depend on are copied into the target
directory and relinked so the result runs without a Python installation.
";

fn list_values(args: &ArgMatches, name: &str) -> Vec<String> {
    args.get_many::<String>(name)
        .map(|values| {
            values
                .flat_map(|v| v.split(','))
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn command() -> Command {
    Command::new("pyfreeze")
        .version(PYFREEZE_VERSION)
        .about("Freeze Python applications into standalone directories")
        .arg_required_else_help(true)
        .subcommand_required(true)
        .subcommand(
            Command::new("build_exe")
                .about("Freeze the executables of a project")
                .long_about(BUILD_EXE_ABOUT)
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .default_value(DEFAULT_CONFIG_FILE)
                        .value_parser(value_parser!(PathBuf))
                        .help("Project file to read"),
                )
                .arg(
                    Arg::new("target_dir")
                        .long("target-dir")
                        .value_name("DIR")
                        .value_parser(value_parser!(PathBuf))
                        .help("Directory to write the frozen application to"),
                )
                .arg(
                    Arg::new("python")
                        .long("python")
                        .value_name("PATH")
                        .value_parser(value_parser!(PathBuf))
                        .help("Python interpreter to freeze against"),
                )
                .arg(
                    Arg::new("silent")
                        .short('s')
                        .long("silent")
                        .value_name("LEVEL")
                        .value_parser(value_parser!(u8).range(0..=3))
                        .help("Reduce output (0 reports everything, 3 only errors)"),
                )
                .arg(
                    Arg::new("includes")
                        .long("includes")
                        .value_name("NAMES")
                        .action(ArgAction::Append)
                        .help("Comma separated modules to include"),
                )
                .arg(
                    Arg::new("excludes")
                        .long("excludes")
                        .value_name("NAMES")
                        .action(ArgAction::Append)
                        .help("Comma separated modules to exclude"),
                )
                .arg(
                    Arg::new("packages")
                        .long("packages")
                        .value_name("NAMES")
                        .action(ArgAction::Append)
                        .help("Comma separated packages to include with all submodules"),
                ),
        )
}

fn build_exe(args: &ArgMatches) -> Result<(), FreezeError> {
    let config_path = args
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut project = ProjectConfig::load(&config_path)?;
    let options = &mut project.build_exe;

    if let Some(silent) = args.get_one::<u8>("silent") {
        options.silent = *silent;
    }
    init_logging(options.silent);

    if let Some(dir) = args.get_one::<PathBuf>("target_dir") {
        options.target_dir = Some(dir.clone());
    }
    if let Some(python) = args.get_one::<PathBuf>("python") {
        options.python = Some(python.clone());
    }
    options.includes.extend(list_values(args, "includes"));
    options.excludes.extend(list_values(args, "excludes"));
    options.packages.extend(list_values(args, "packages"));
    project.validate()?;

    let python = resolve_python(project.build_exe.python.as_deref())?;
    let context = FreezeContext::from_python(&python)?;

    let mut freezer = Freezer::new(&project, context)?;
    let summary = freezer.freeze()?;

    if !summary.missing_libraries.is_empty() && project.build_exe.silent <= 2 {
        warn!(
            "{} shared libraries could not be found",
            summary.missing_libraries.len()
        );
    }
    info!(
        "froze {} executables into {} ({} archived modules, {} on disk, {} binaries)",
        summary.executables.len(),
        summary.target_dir.display(),
        summary.archived.len(),
        summary.filesystem.len(),
        summary.binaries.len()
    );

    Ok(())
}

pub fn run_cli() -> Result<(), FreezeError> {
    let matches = command().get_matches();

    match matches.subcommand() {
        Some(("build_exe", args)) => build_exe(args),
        _ => Err(FreezeError::config("invalid sub-command")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_is_consistent() {
        command().debug_assert();
    }

    #[test]
    fn comma_lists() {
        let matches = command().get_matches_from([
            "pyfreeze",
            "build_exe",
            "--includes",
            "a,b",
            "--includes",
            " c ,",
            "-s",
            "2",
        ]);
        let (_, args) = matches.subcommand().unwrap();

        assert_eq!(list_values(args, "includes"), vec!["a", "b", "c"]);
        assert!(list_values(args, "packages").is_empty());
        assert_eq!(args.get_one::<u8>("silent"), Some(&2));
        assert_eq!(
            args.get_one::<PathBuf>("config"),
            Some(&PathBuf::from("pyfreeze.toml"))
        );
    }
}
