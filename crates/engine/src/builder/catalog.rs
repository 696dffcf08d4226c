use protocol::{ExecutionMode, Operation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    Query,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// `true` emits the flag, `false` emits nothing.
    Switch,
    Value,
    Choice(&'static [&'static str]),
    EnvName,
    /// Repeated `flag value` pairs.
    Values,
    Path { must_exist: bool },
    Integer { min: i64, max: i64 },
    /// Repeated `flag key=value` pairs.
    KeyValues,
    Operand,
    PathOperand { must_exist: bool },
    Operands,
    /// Executable plus arguments; only the first token is checked for a leading dash.
    Command,
    /// Subcommand words placed right after the argv prefix.
    Subcommand,
    /// Environment overrides for the child, never part of argv.
    EnvVars,
    /// Routes the operation through `run -n <env>`.
    BuildEnv,
}

impl ParamKind {
    pub fn is_positional(self) -> bool {
        matches!(
            self,
            ParamKind::Operand
                | ParamKind::PathOperand { .. }
                | ParamKind::Operands
                | ParamKind::Command
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub flag: &'static str,
    pub required: bool,
    pub description: &'static str,
}

impl ParamSpec {
    const fn new(
        name: &'static str,
        kind: ParamKind,
        flag: &'static str,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            kind,
            flag,
            required: false,
            description,
        }
    }

    const fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

const fn switch(name: &'static str, flag: &'static str, description: &'static str) -> ParamSpec {
    ParamSpec::new(name, ParamKind::Switch, flag, description)
}

const fn value(name: &'static str, flag: &'static str, description: &'static str) -> ParamSpec {
    ParamSpec::new(name, ParamKind::Value, flag, description)
}

const fn values(name: &'static str, flag: &'static str, description: &'static str) -> ParamSpec {
    ParamSpec::new(name, ParamKind::Values, flag, description)
}

const fn path(name: &'static str, flag: &'static str, description: &'static str) -> ParamSpec {
    ParamSpec::new(name, ParamKind::Path { must_exist: false }, flag, description)
}

const fn existing_path(
    name: &'static str,
    flag: &'static str,
    description: &'static str,
) -> ParamSpec {
    ParamSpec::new(name, ParamKind::Path { must_exist: true }, flag, description)
}

const NAME: ParamSpec = ParamSpec::new("name", ParamKind::EnvName, "--name", "Name of the environment.");
const PREFIX: ParamSpec = path("prefix", "--prefix", "Full path to the environment location.");
const CHANNELS: ParamSpec = values("channels", "--channel", "Additional channels to search for packages.");
const OVERRIDE_CHANNELS: ParamSpec = switch(
    "override_channels",
    "--override-channels",
    "Do not search default or .condarc channels.",
);
const USE_LOCAL: ParamSpec = switch("use_local", "--use-local", "Use locally built packages.");
const OFFLINE: ParamSpec = switch("offline", "--offline", "Offline mode, do not connect to the Internet.");
const DRY_RUN: ParamSpec = switch("dry_run", "--dry-run", "Only display what would have been done.");
const QUIET: ParamSpec = switch("quiet", "--quiet", "Do not display progress bars.");
const VERBOSE: ParamSpec = switch("verbose", "--verbose", "Show additional output details.");
const SOLVER: ParamSpec = ParamSpec::new(
    "solver",
    ParamKind::Choice(&["classic", "libmamba"]),
    "--solver",
    "Solver backend.",
);
const PACKAGES: ParamSpec = ParamSpec::new("packages", ParamKind::Operands, "", "Package specs, e.g. `numpy>=1.26`.");

const ENV_FILE: ParamSpec = existing_path(
    "file",
    "--file",
    "Environment definition file, e.g. environment.yml.",
)
.required();

const ENV_SELECTOR: &[&[&str]] = &[&["name", "prefix"]];

pub struct OperationSpec {
    pub operation: Operation,
    pub prefix: &'static [&'static str],
    pub suffix: &'static [&'static str],
    pub class: OperationClass,
    pub json: bool,
    pub auto_yes: bool,
    pub default_mode: ExecutionMode,
    /// Each group needs at least one member present.
    pub one_of: &'static [&'static [&'static str]],
    /// Members of each group may not be combined.
    pub exclusive: &'static [&'static [&'static str]],
    pub params: &'static [ParamSpec],
    pub description: &'static str,
}

impl OperationSpec {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|spec| spec.name == name)
    }
}

pub static OPERATIONS: &[OperationSpec] = &[
    OperationSpec {
        operation: Operation::Create,
        prefix: &["create"],
        suffix: &[],
        class: OperationClass::Long,
        json: true,
        auto_yes: true,
        default_mode: ExecutionMode::Foreground,
        one_of: &[&["name", "prefix"]],
        exclusive: ENV_SELECTOR,
        params: &[
            NAME,
            PREFIX,
            value("clone", "--clone", "Create the environment as a copy of an existing one."),
            existing_path("file", "--file", "Read package versions from the given file."),
            CHANNELS,
            OVERRIDE_CHANNELS,
            USE_LOCAL,
            switch(
                "no_default_packages",
                "--no-default-packages",
                "Ignore create_default_packages in .condarc.",
            ),
            SOLVER,
            OFFLINE,
            DRY_RUN,
            QUIET,
            PACKAGES,
        ],
        description: "Create a new environment from a list of package specs.",
    },
    OperationSpec {
        operation: Operation::Install,
        prefix: &["install"],
        suffix: &[],
        class: OperationClass::Long,
        json: true,
        auto_yes: true,
        default_mode: ExecutionMode::Foreground,
        one_of: &[&["packages", "file", "revision"]],
        exclusive: ENV_SELECTOR,
        params: &[
            NAME,
            PREFIX,
            existing_path("file", "--file", "Read package versions from the given file."),
            value("revision", "--revision", "Revert to the specified revision."),
            CHANNELS,
            OVERRIDE_CHANNELS,
            USE_LOCAL,
            switch("no_deps", "--no-deps", "Do not install dependencies."),
            switch("only_deps", "--only-deps", "Only install dependencies."),
            switch("force_reinstall", "--force-reinstall", "Reinstall even if already installed."),
            switch("freeze_installed", "--freeze-installed", "Do not update or change already-installed dependencies."),
            switch("update_deps", "--update-deps", "Update dependencies."),
            SOLVER,
            OFFLINE,
            DRY_RUN,
            QUIET,
            PACKAGES,
        ],
        description: "Install packages into an environment.",
    },
    OperationSpec {
        operation: Operation::Remove,
        prefix: &["remove"],
        suffix: &[],
        class: OperationClass::Long,
        json: true,
        auto_yes: true,
        default_mode: ExecutionMode::Foreground,
        one_of: &[&["name", "prefix"], &["packages", "all"]],
        exclusive: ENV_SELECTOR,
        params: &[
            NAME,
            PREFIX,
            switch("all", "--all", "Remove all packages, i.e. the entire environment."),
            switch("force", "--force", "Remove without resolving dependents."),
            DRY_RUN,
            QUIET,
            PACKAGES,
        ],
        description: "Remove packages, or an entire environment with `all`.",
    },
    OperationSpec {
        operation: Operation::Update,
        prefix: &["update"],
        suffix: &[],
        class: OperationClass::Long,
        json: true,
        auto_yes: true,
        default_mode: ExecutionMode::Foreground,
        one_of: &[&["packages", "all"]],
        exclusive: ENV_SELECTOR,
        params: &[
            NAME,
            PREFIX,
            switch("all", "--all", "Update all installed packages."),
            CHANNELS,
            OVERRIDE_CHANNELS,
            switch("update_deps", "--update-deps", "Update dependencies."),
            SOLVER,
            OFFLINE,
            DRY_RUN,
            QUIET,
            PACKAGES,
        ],
        description: "Update packages to the latest compatible versions.",
    },
    OperationSpec {
        operation: Operation::List,
        prefix: &["list"],
        suffix: &[],
        class: OperationClass::Query,
        json: true,
        auto_yes: false,
        default_mode: ExecutionMode::Foreground,
        one_of: &[],
        exclusive: ENV_SELECTOR,
        params: &[
            NAME,
            PREFIX,
            switch("show_channel_urls", "--show-channel-urls", "Show channel urls."),
            switch("full_name", "--full-name", "Only match packages with exactly this name."),
            switch("explicit", "--explicit", "List explicitly all installed packages with URL."),
            switch("export", "--export", "Output explicit, machine-readable requirement strings."),
            switch("revisions", "--revisions", "List the revision history."),
            switch("no_pip", "--no-pip", "Do not include pip-only installed packages."),
            ParamSpec::new("regex", ParamKind::Operand, "", "List only packages matching this regular expression."),
        ],
        description: "List installed packages in an environment.",
    },
    OperationSpec {
        operation: Operation::Search,
        prefix: &["search"],
        suffix: &[],
        class: OperationClass::Query,
        json: true,
        auto_yes: false,
        default_mode: ExecutionMode::Foreground,
        one_of: &[],
        exclusive: &[],
        params: &[
            CHANNELS,
            OVERRIDE_CHANNELS,
            switch("info", "--info", "Provide detailed information about each package."),
            value("subdir", "--subdir", "Search the given subdir, e.g. linux-64."),
            OFFLINE,
            ParamSpec::new("query", ParamKind::Operand, "", "Package match spec to search for.").required(),
        ],
        description: "Search channels for packages.",
    },
    OperationSpec {
        operation: Operation::Info,
        prefix: &["info"],
        suffix: &[],
        class: OperationClass::Query,
        json: true,
        auto_yes: false,
        default_mode: ExecutionMode::Foreground,
        one_of: &[],
        exclusive: &[],
        params: &[
            switch("all", "--all", "Show all information."),
            switch("base", "--base", "Display base environment path."),
            switch("envs", "--envs", "List all known environments."),
            switch("system", "--system", "List environment variables."),
            switch("unsafe_channels", "--unsafe-channels", "Display list of channels with tokens exposed."),
        ],
        description: "Show information about the package-manager installation.",
    },
    OperationSpec {
        operation: Operation::Export,
        prefix: &["env", "export"],
        suffix: &[],
        class: OperationClass::Query,
        json: true,
        auto_yes: false,
        default_mode: ExecutionMode::Foreground,
        one_of: &[],
        exclusive: ENV_SELECTOR,
        params: &[
            NAME,
            PREFIX,
            path("file", "--file", "Write the specification to this file."),
            CHANNELS,
            OVERRIDE_CHANNELS,
            switch("no_builds", "--no-builds", "Remove build specification from dependencies."),
            switch("ignore_channels", "--ignore-channels", "Do not include channel names with package names."),
            switch("from_history", "--from-history", "Build the specification from explicitly requested packages."),
        ],
        description: "Export an environment specification.",
    },
    OperationSpec {
        operation: Operation::EnvList,
        prefix: &["env", "list"],
        suffix: &[],
        class: OperationClass::Query,
        json: true,
        auto_yes: false,
        default_mode: ExecutionMode::Foreground,
        one_of: &[],
        exclusive: &[],
        params: &[VERBOSE],
        description: "List all known environments.",
    },
    OperationSpec {
        operation: Operation::EnvCreate,
        prefix: &["env", "create"],
        suffix: &[],
        class: OperationClass::Long,
        json: true,
        auto_yes: true,
        default_mode: ExecutionMode::Foreground,
        one_of: &[],
        exclusive: ENV_SELECTOR,
        params: &[
            NAME,
            PREFIX,
            ENV_FILE,
            SOLVER,
            DRY_RUN,
            QUIET,
            VERBOSE,
        ],
        description: "Create an environment from an environment file such as environment.yml. \
The name and prefix default to the ones in the file.",
    },
    OperationSpec {
        operation: Operation::EnvUpdate,
        prefix: &["env", "update"],
        suffix: &[],
        class: OperationClass::Long,
        json: true,
        auto_yes: false,
        default_mode: ExecutionMode::Foreground,
        one_of: &[],
        exclusive: ENV_SELECTOR,
        params: &[
            NAME,
            PREFIX,
            ENV_FILE,
            switch("prune", "--prune", "Remove installed packages not defined in the file."),
            SOLVER,
            QUIET,
            VERBOSE,
        ],
        description: "Update an environment to match an environment file.",
    },
    OperationSpec {
        operation: Operation::EnvRemove,
        prefix: &["env", "remove"],
        suffix: &[],
        class: OperationClass::Long,
        json: true,
        auto_yes: true,
        default_mode: ExecutionMode::Foreground,
        one_of: &[&["name", "prefix"]],
        exclusive: ENV_SELECTOR,
        params: &[NAME, PREFIX, DRY_RUN, QUIET, VERBOSE],
        description: "Remove an entire environment.",
    },
    OperationSpec {
        operation: Operation::Clean,
        prefix: &["clean"],
        suffix: &[],
        class: OperationClass::Long,
        json: true,
        auto_yes: true,
        default_mode: ExecutionMode::Foreground,
        one_of: &[&["all", "index_cache", "packages", "tarballs", "logfiles", "force_pkgs_dirs"]],
        exclusive: &[],
        params: &[
            switch("all", "--all", "Remove index cache, lock files, unused packages and tarballs."),
            switch("index_cache", "--index-cache", "Remove index cache."),
            switch("packages", "--packages", "Remove unused packages from writable package caches."),
            switch("tarballs", "--tarballs", "Remove cached package tarballs."),
            switch("logfiles", "--logfiles", "Remove log files."),
            switch("force_pkgs_dirs", "--force-pkgs-dirs", "Remove all writable package caches."),
            DRY_RUN,
            QUIET,
        ],
        description: "Remove unused packages and caches.",
    },
    OperationSpec {
        operation: Operation::Compare,
        prefix: &["compare"],
        suffix: &[],
        class: OperationClass::Query,
        json: true,
        auto_yes: false,
        default_mode: ExecutionMode::Foreground,
        one_of: &[],
        exclusive: ENV_SELECTOR,
        params: &[
            NAME,
            PREFIX,
            ParamSpec::new(
                "file",
                ParamKind::PathOperand { must_exist: true },
                "",
                "Environment file to compare against.",
            )
            .required(),
        ],
        description: "Compare an environment against an environment file.",
    },
    OperationSpec {
        operation: Operation::Run,
        prefix: &["run"],
        suffix: &[],
        class: OperationClass::Long,
        json: false,
        auto_yes: false,
        default_mode: ExecutionMode::Foreground,
        one_of: &[&["name", "prefix"]],
        exclusive: ENV_SELECTOR,
        params: &[
            NAME,
            PREFIX,
            path("cwd", "--cwd", "Working directory for the executable."),
            switch("no_capture_output", "--no-capture-output", "Do not capture stdout/stderr inside the package manager."),
            ParamSpec::new("env", ParamKind::EnvVars, "", "Extra environment variables."),
            ParamSpec::new("executable_call", ParamKind::Command, "", "Executable followed by its arguments.").required(),
        ],
        description: "Run an executable inside an environment.",
    },
    OperationSpec {
        operation: Operation::Help,
        prefix: &[],
        suffix: &["--help"],
        class: OperationClass::Query,
        json: false,
        auto_yes: false,
        default_mode: ExecutionMode::Foreground,
        one_of: &[],
        exclusive: &[],
        params: &[ParamSpec::new(
            "command",
            ParamKind::Subcommand,
            "",
            "Subcommand to describe, e.g. `env create`. Omit for general help.",
        )],
        description: "Show help for the package manager or one of its subcommands.",
    },
    OperationSpec {
        operation: Operation::Build,
        prefix: &["build"],
        suffix: &["--no-anaconda-upload"],
        class: OperationClass::Long,
        json: false,
        auto_yes: false,
        default_mode: ExecutionMode::Background,
        one_of: &[],
        exclusive: &[&["test", "no_test"]],
        params: &[
            ParamSpec::new("build_env", ParamKind::BuildEnv, "", "Environment that provides the build tool."),
            existing_path("config_file", "--config-file", "Build config file; its directory becomes the working directory."),
            existing_path("croot", "--croot", "Build root directory."),
            CHANNELS,
            values("variant_config_files", "--variant-config-file", "Additional variant config files."),
            value("python", "--python", "Python version to build for."),
            value("numpy", "--numpy", "NumPy version to build for."),
            path("output_folder", "--output-folder", "Directory for the built packages."),
            switch("test", "--test", "Only test an already built package."),
            switch("no_test", "--no-test", "Do not run package tests."),
            switch("skip_existing", "--skip-existing", "Skip recipes whose packages already exist."),
            switch("keep_going", "--keep-going", "Keep building other outputs after a failure."),
            switch("dirty", "--dirty", "Do not remove work directories after the build."),
            switch("debug", "--debug", "Show debug output."),
            switch("error_overlinking", "--error-overlinking", "Fail when overlinking is detected."),
            ParamSpec::new(
                "zstd_compression_level",
                ParamKind::Integer { min: 1, max: 22 },
                "--zstd-compression-level",
                "Compression level for .conda packages.",
            ),
            ParamSpec::new("extra_meta", ParamKind::KeyValues, "--extra-meta", "Extra key/value pairs for the package metadata."),
            USE_LOCAL,
            OVERRIDE_CHANNELS,
            QUIET,
            ParamSpec::new("env", ParamKind::EnvVars, "", "Extra environment variables for the build."),
            ParamSpec::new(
                "recipe_path",
                ParamKind::PathOperand { must_exist: true },
                "",
                "Path to the recipe directory.",
            )
            .required(),
        ],
        description: "Build a package from a recipe. Runs in the background by default.",
    },
];

pub fn spec_for(operation: Operation) -> &'static OperationSpec {
    OPERATIONS
        .iter()
        .find(|spec| spec.operation == operation)
        .unwrap_or_else(|| unreachable!("operation {operation} missing from catalogue"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_operation_has_exactly_one_spec() {
        for op in Operation::ALL {
            let count = OPERATIONS.iter().filter(|spec| spec.operation == op).count();
            assert_eq!(count, 1, "{op}");
        }
    }

    #[test]
    fn param_names_are_unique_and_groups_resolve() {
        for spec in OPERATIONS {
            let mut seen = HashSet::new();
            for param in spec.params {
                assert!(seen.insert(param.name), "{} repeats {}", spec.operation, param.name);
                let needs_flag = !param.kind.is_positional()
                    && !matches!(
                        param.kind,
                        ParamKind::EnvVars | ParamKind::BuildEnv | ParamKind::Subcommand
                    );
                assert_eq!(needs_flag, !param.flag.is_empty(), "{}", param.name);
            }
            for group in spec.one_of.iter().chain(spec.exclusive.iter()) {
                for name in group.iter() {
                    assert!(spec.param(name).is_some(), "{} group names {name}", spec.operation);
                }
            }
        }
    }
}
