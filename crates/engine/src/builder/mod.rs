pub mod catalog;
mod params;

use crate::error::{EngineError, Result};
use catalog::{OperationClass, OperationSpec, ParamKind};
use params::Resolved;
use protocol::{Operation, OperationRequest, OutputFormat};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub use params::{is_absent, Patterns, ENV_NAME_PATTERN, ENV_VAR_PATTERN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub query: Duration,
    pub long: Duration,
    pub max: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            query: Duration::from_secs(120),
            long: Duration::from_secs(60 * 60),
            max: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl TimeoutPolicy {
    fn resolve(&self, class: OperationClass, override_ms: Option<u64>) -> Result<Duration> {
        match override_ms {
            Some(0) => Err(EngineError::invalid("`timeout_ms` must be positive")),
            Some(ms) => Ok(Duration::from_millis(ms).min(self.max)),
            None => Ok(match class {
                OperationClass::Query => self.query,
                OperationClass::Long => self.long,
            }),
        }
    }
}

/// Everything the runner needs to start one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub operation: Operation,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub format: OutputFormat,
}

impl CommandDescriptor {
    /// Full argv as it would be executed, program first.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.display().to_string());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: PathBuf,
    build_env: Option<String>,
    timeouts: TimeoutPolicy,
    patterns: Patterns,
}

impl CommandBuilder {
    pub fn new(
        program: PathBuf,
        build_env: Option<String>,
        timeouts: TimeoutPolicy,
    ) -> Result<Self> {
        let patterns = Patterns::compile()?;
        if let Some(env) = build_env.as_deref() {
            patterns.check_env_name("build_env", env)?;
        }
        Ok(Self {
            program,
            build_env,
            timeouts,
            patterns,
        })
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Validates `request` and turns it into a descriptor. Pure; the same
    /// request always yields the same descriptor.
    pub fn build(&self, request: &OperationRequest) -> Result<CommandDescriptor> {
        let spec = catalog::spec_for(request.operation);
        if request.format == OutputFormat::Structured && !spec.json {
            return Err(EngineError::UnsupportedOperation(format!(
                "{} has no structured output",
                spec.operation
            )));
        }
        for name in request.params.keys() {
            if spec.param(name).is_none() {
                return Err(EngineError::invalid(format!(
                    "unknown parameter `{name}` for {}",
                    spec.operation
                )));
            }
        }
        check_presence(spec, request)?;

        let mut subcommand = Vec::new();
        let mut flags = Vec::new();
        let mut operands = Vec::new();
        let mut env = BTreeMap::new();
        let mut build_env = self.build_env.clone();
        let mut config_dir = None;

        for param in spec.params {
            let Some(value) = request.params.get(param.name) else {
                continue;
            };
            if is_absent(value) {
                continue;
            }
            let resolved = params::resolve(param, value, &self.patterns)?;
            match (param.kind, resolved) {
                (ParamKind::Subcommand, Resolved::List(tokens)) => subcommand = tokens,
                (ParamKind::BuildEnv, Resolved::Text(name)) => build_env = Some(name),
                (ParamKind::EnvVars, Resolved::Pairs(pairs)) => env.extend(pairs),
                (kind, Resolved::Text(text)) if kind.is_positional() => operands.push(text),
                (kind, Resolved::Path(path)) if kind.is_positional() => {
                    operands.push(path.display().to_string())
                }
                (kind, Resolved::List(items)) if kind.is_positional() => operands.extend(items),
                (_, Resolved::Flag) => flags.push(param.flag.to_string()),
                (_, Resolved::Text(text)) => {
                    flags.push(param.flag.to_string());
                    flags.push(text);
                }
                (_, Resolved::Path(path)) => {
                    if param.name == "config_file" {
                        config_dir = path
                            .parent()
                            .filter(|dir| !dir.as_os_str().is_empty())
                            .map(PathBuf::from);
                    }
                    flags.push(param.flag.to_string());
                    flags.push(path.display().to_string());
                }
                (_, Resolved::List(items)) => {
                    for item in items {
                        flags.push(param.flag.to_string());
                        flags.push(item);
                    }
                }
                (_, Resolved::Pairs(pairs)) => {
                    for (key, value) in pairs {
                        flags.push(param.flag.to_string());
                        flags.push(format!("{key}={value}"));
                    }
                }
            }
        }

        let mut args: Vec<String> = Vec::new();
        match (spec.operation, build_env) {
            (Operation::Build, Some(env_name)) => {
                args.extend(["run", "-n"].map(String::from));
                args.push(env_name);
                args.extend(["conda", "build"].map(String::from));
            }
            _ => args.extend(spec.prefix.iter().map(|token| token.to_string())),
        }
        args.extend(subcommand);
        args.extend(flags);
        args.extend(spec.suffix.iter().map(|token| token.to_string()));
        if spec.json && request.format == OutputFormat::Structured {
            args.push("--json".to_string());
        }
        if spec.auto_yes {
            args.push("--yes".to_string());
        }
        args.extend(operands);

        Ok(CommandDescriptor {
            operation: spec.operation,
            program: self.program.clone(),
            args,
            cwd: config_dir,
            env,
            timeout: self.timeouts.resolve(spec.class, request.timeout_ms)?,
            format: request.format,
        })
    }
}

fn check_presence(spec: &OperationSpec, request: &OperationRequest) -> Result<()> {
    let present = |name: &str| request.params.get(name).is_some_and(|v| !is_absent(v));

    for param in spec.params.iter().filter(|param| param.required) {
        if !present(param.name) {
            return Err(EngineError::invalid(format!(
                "missing required parameter `{}` for {}",
                param.name, spec.operation
            )));
        }
    }
    for group in spec.one_of {
        if !group.iter().any(|name| present(name)) {
            return Err(EngineError::invalid(format!(
                "{} needs one of: {}",
                spec.operation,
                group.join(", ")
            )));
        }
    }
    for group in spec.exclusive {
        let given: Vec<&str> = group.iter().copied().filter(|name| present(name)).collect();
        if given.len() > 1 {
            return Err(EngineError::invalid(format!(
                "{} accepts only one of: {}",
                spec.operation,
                given.join(", ")
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;
    use protocol::ErrorKind;
    use serde_json::json;

    fn builder() -> CommandBuilder {
        CommandBuilder::new(PathBuf::from("/opt/conda/bin/conda"), None, TimeoutPolicy::default())
            .expect("builder")
    }

    fn kind_of(result: Result<CommandDescriptor>) -> ErrorKind {
        result.expect_err("should fail").kind()
    }

    #[test]
    fn install_orders_flags_then_operands() {
        let request = OperationRequest::new(Operation::Install)
            .param("name", "science")
            .param("packages", json!(["numpy>=1.26", "pandas"]))
            .param("channels", json!(["conda-forge", "bioconda"]))
            .param("dry_run", true)
            .structured();
        let desc = builder().build(&request).expect("build");
        assert_eq!(
            desc.args,
            vec![
                "install",
                "--name",
                "science",
                "--channel",
                "conda-forge",
                "--channel",
                "bioconda",
                "--dry-run",
                "--json",
                "--yes",
                "numpy>=1.26",
                "pandas",
            ]
        );
        assert_eq!(desc.timeout, TimeoutPolicy::default().long);
        assert_eq!(desc.argv()[0], "/opt/conda/bin/conda");
    }

    #[test]
    fn build_is_deterministic_regardless_of_param_insertion_order() {
        let a = OperationRequest::new(Operation::Create)
            .param("packages", json!(["python=3.12"]))
            .param("name", "py312")
            .param("quiet", true);
        let b = OperationRequest::new(Operation::Create)
            .param("quiet", true)
            .param("name", "py312")
            .param("packages", json!(["python=3.12"]));
        let builder = builder();
        assert_eq!(builder.build(&a).expect("a"), builder.build(&b).expect("b"));
        assert_eq!(builder.build(&a).expect("a"), builder.build(&a).expect("again"));
    }

    #[test]
    fn export_uses_two_token_prefix_and_query_timeout() {
        let request = OperationRequest::new(Operation::Export)
            .param("name", "base")
            .param("from_history", true)
            .structured();
        let desc = builder().build(&request).expect("build");
        assert_eq!(desc.args, vec!["env", "export", "--name", "base", "--from-history", "--json"]);
        assert_eq!(desc.timeout, TimeoutPolicy::default().query);
    }

    #[test]
    fn env_file_operations() {
        let root = temp_dir("builder-env-file");
        let file = root.join("environment.yml");
        std::fs::write(&file, "name: science\ndependencies:\n  - python=3.12\n").expect("env file");
        let file_arg = file.display().to_string();
        let builder = builder();

        let create = builder
            .build(
                &OperationRequest::new(Operation::EnvCreate)
                    .param("file", file_arg.as_str())
                    .param("name", "science")
                    .structured(),
            )
            .expect("create");
        assert_eq!(
            create.args,
            vec!["env", "create", "--name", "science", "--file", file_arg.as_str(), "--json", "--yes"]
        );
        assert_eq!(create.timeout, TimeoutPolicy::default().long);

        let update = builder
            .build(
                &OperationRequest::new(Operation::EnvUpdate)
                    .param("prefix", "/opt/envs/science")
                    .param("file", file_arg.as_str())
                    .param("prune", true),
            )
            .expect("update");
        assert_eq!(
            update.args,
            vec![
                "env",
                "update",
                "--prefix",
                "/opt/envs/science",
                "--file",
                file_arg.as_str(),
                "--prune",
            ]
        );

        let remove = builder
            .build(&OperationRequest::new(Operation::EnvRemove).param("name", "science"))
            .expect("remove");
        assert_eq!(remove.args, vec!["env", "remove", "--name", "science", "--yes"]);

        let cases = [
            OperationRequest::new(Operation::EnvCreate).param("name", "science"),
            OperationRequest::new(Operation::EnvCreate).param("file", "/nope/environment.yml"),
            OperationRequest::new(Operation::EnvUpdate)
                .param("file", file_arg.as_str())
                .param("name", "a")
                .param("prefix", "/tmp/a"),
            OperationRequest::new(Operation::EnvRemove),
        ];
        for request in cases {
            assert_eq!(
                kind_of(builder.build(&request)),
                ErrorKind::InvalidParameter,
                "{request:?}"
            );
        }
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn plain_query_has_no_json_flag() {
        let desc = builder()
            .build(&OperationRequest::new(Operation::EnvList))
            .expect("build");
        assert_eq!(desc.args, vec!["env", "list"]);
    }

    #[test]
    fn structured_output_on_plain_operation_is_unsupported() {
        let request = OperationRequest::new(Operation::Run)
            .param("name", "base")
            .param("executable_call", "python --version")
            .structured();
        assert_eq!(kind_of(builder().build(&request)), ErrorKind::UnsupportedOperation);
    }

    #[test]
    fn validation_failures_are_invalid_parameter() {
        let builder = builder();
        let cases = [
            OperationRequest::new(Operation::List).param("colour", "blue"),
            OperationRequest::new(Operation::Search),
            OperationRequest::new(Operation::Create).param("packages", json!(["python"])),
            OperationRequest::new(Operation::Create)
                .param("name", "a")
                .param("prefix", "/tmp/a"),
            OperationRequest::new(Operation::Install).param("name", "base"),
            OperationRequest::new(Operation::Remove)
                .param("name", "base")
                .param("packages", json!(["--all"])),
            OperationRequest::new(Operation::List).param("name", "bad name"),
            OperationRequest::new(Operation::List).param("name", 7),
            OperationRequest::new(Operation::Info).param("envs", "yes"),
            OperationRequest::new(Operation::Clean),
            OperationRequest::new(Operation::List).timeout_ms(0),
        ];
        for request in cases {
            assert_eq!(
                kind_of(builder.build(&request)),
                ErrorKind::InvalidParameter,
                "{request:?}"
            );
        }
    }

    #[test]
    fn timeout_override_is_clamped() {
        let builder = builder();
        let short = builder
            .build(&OperationRequest::new(Operation::Info).timeout_ms(1500))
            .expect("build");
        assert_eq!(short.timeout, Duration::from_millis(1500));
        let huge = builder
            .build(&OperationRequest::new(Operation::Info).timeout_ms(u64::MAX / 4))
            .expect("build");
        assert_eq!(huge.timeout, TimeoutPolicy::default().max);
    }

    #[test]
    fn run_places_command_last() {
        let request = OperationRequest::new(Operation::Run)
            .param("name", "tools")
            .param("executable_call", json!(["python", "-m", "pip", "list"]))
            .param("env", json!({"PIP_NO_COLOR": "1"}))
            .param("no_capture_output", true);
        let desc = builder().build(&request).expect("build");
        assert_eq!(
            desc.args,
            vec!["run", "--name", "tools", "--no-capture-output", "python", "-m", "pip", "list"]
        );
        assert_eq!(desc.env.get("PIP_NO_COLOR").map(String::as_str), Some("1"));
    }

    #[test]
    fn help_splits_subcommand() {
        let desc = builder()
            .build(&OperationRequest::new(Operation::Help).param("command", "env create"))
            .expect("build");
        assert_eq!(desc.args, vec!["env", "create", "--help"]);
        let general = builder()
            .build(&OperationRequest::new(Operation::Help))
            .expect("build");
        assert_eq!(general.args, vec!["--help"]);
    }

    #[test]
    fn build_runs_through_build_env_and_config_dir() {
        let root = temp_dir("builder-recipe");
        let recipe = root.join("recipe");
        std::fs::create_dir_all(&recipe).expect("recipe dir");
        let config = root.join("conda_build_config.yaml");
        std::fs::write(&config, "python:\n  - 3.12\n").expect("config");

        let builder = CommandBuilder::new(
            PathBuf::from("conda"),
            Some("builder".to_string()),
            TimeoutPolicy::default(),
        )
        .expect("builder");
        let request = OperationRequest::new(Operation::Build)
            .param("recipe_path", recipe.display().to_string())
            .param("config_file", config.display().to_string())
            .param("extra_meta", json!({"team": "infra", "build": 3}))
            .param("no_test", true);
        let desc = builder.build(&request).expect("build");
        let recipe_arg = recipe.display().to_string();
        let config_arg = config.display().to_string();
        assert_eq!(
            desc.args,
            vec![
                "run",
                "-n",
                "builder",
                "conda",
                "build",
                "--config-file",
                config_arg.as_str(),
                "--no-test",
                "--extra-meta",
                "build=3",
                "--extra-meta",
                "team=infra",
                "--no-anaconda-upload",
                recipe_arg.as_str(),
            ]
        );
        assert_eq!(desc.cwd.as_deref(), Some(root.as_path()));

        let direct = builder
            .build(
                &OperationRequest::new(Operation::Build)
                    .param("recipe_path", recipe.display().to_string())
                    .param("build_env", "other"),
            )
            .expect("build");
        assert_eq!(&direct.args[..3], &["run", "-n", "other"]);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn build_without_env_calls_build_directly() {
        let root = temp_dir("builder-direct");
        let desc = builder()
            .build(
                &OperationRequest::new(Operation::Build)
                    .param("recipe_path", root.display().to_string()),
            )
            .expect("build");
        assert_eq!(desc.args[0], "build");
        assert_eq!(desc.args[1], "--no-anaconda-upload");
        assert!(desc.cwd.is_none());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_recipe_is_rejected() {
        let request = OperationRequest::new(Operation::Build)
            .param("recipe_path", "/nope/not/a/recipe");
        assert_eq!(kind_of(builder().build(&request)), ErrorKind::InvalidParameter);
    }

    #[test]
    fn invalid_default_build_env_fails_construction() {
        let result = CommandBuilder::new(
            PathBuf::from("conda"),
            Some("no spaces allowed".to_string()),
            TimeoutPolicy::default(),
        );
        assert!(result.is_err());
    }
}
