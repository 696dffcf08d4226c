use crate::builder::catalog::{ParamKind, ParamSpec};
use crate::error::{EngineError, Result};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

pub const ENV_NAME_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]*$";
pub const ENV_VAR_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";
const SUBCOMMAND_PATTERN: &str = r"^[a-z][a-z0-9_-]*$";

#[derive(Debug, Clone)]
pub struct Patterns {
    env_name: Regex,
    env_var: Regex,
    subcommand: Regex,
}

impl Patterns {
    pub fn compile() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|err| EngineError::Internal(format!("invalid pattern {pattern}: {err}")))
        };
        Ok(Self {
            env_name: compile(ENV_NAME_PATTERN)?,
            env_var: compile(ENV_VAR_PATTERN)?,
            subcommand: compile(SUBCOMMAND_PATTERN)?,
        })
    }

    pub fn check_env_name(&self, param: &str, name: &str) -> Result<()> {
        if self.env_name.is_match(name) {
            Ok(())
        } else {
            Err(EngineError::invalid(format!(
                "`{param}` is not a valid environment name: {name:?}"
            )))
        }
    }
}

/// Parameter value after type checking, before it becomes argv.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Flag,
    Text(String),
    List(Vec<String>),
    Path(PathBuf),
    Pairs(BTreeMap<String, String>),
}

/// `null`, `false`, `[]` and `{}` mean "not supplied". An empty string is
/// a supplied value and is rejected by the text checks.
pub fn is_absent(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

pub fn resolve(spec: &ParamSpec, value: &Value, patterns: &Patterns) -> Result<Resolved> {
    let name = spec.name;
    match spec.kind {
        ParamKind::Switch => match value {
            Value::Bool(true) => Ok(Resolved::Flag),
            _ => Err(type_error(name, "a boolean")),
        },
        ParamKind::Value => Ok(Resolved::Text(flag_value(name, value)?)),
        ParamKind::Choice(allowed) => {
            let text = text(name, value)?;
            if allowed.contains(&text.as_str()) {
                Ok(Resolved::Text(text))
            } else {
                Err(EngineError::invalid(format!(
                    "`{name}` must be one of {}",
                    allowed.join(", ")
                )))
            }
        }
        ParamKind::EnvName | ParamKind::BuildEnv => {
            let text = text(name, value)?;
            patterns.check_env_name(name, &text)?;
            Ok(Resolved::Text(text))
        }
        ParamKind::Values => {
            let items = string_list(name, value)?;
            for item in &items {
                no_leading_dash(name, item)?;
            }
            Ok(Resolved::List(items))
        }
        ParamKind::Path { must_exist } | ParamKind::PathOperand { must_exist } => {
            Ok(Resolved::Path(path(name, value, must_exist)?))
        }
        ParamKind::Integer { min, max } => {
            let number = value
                .as_i64()
                .ok_or_else(|| type_error(name, "an integer"))?;
            if number < min || number > max {
                return Err(EngineError::invalid(format!(
                    "`{name}` must be between {min} and {max}"
                )));
            }
            Ok(Resolved::Text(number.to_string()))
        }
        ParamKind::KeyValues => {
            let pairs = pairs(name, value)?;
            for key in pairs.keys() {
                if key.contains('=') {
                    return Err(EngineError::invalid(format!(
                        "`{name}` key may not contain '=': {key:?}"
                    )));
                }
                no_leading_dash(name, key)?;
            }
            Ok(Resolved::Pairs(pairs))
        }
        ParamKind::EnvVars => {
            let pairs = pairs(name, value)?;
            for key in pairs.keys() {
                if !patterns.env_var.is_match(key) {
                    return Err(EngineError::invalid(format!(
                        "`{name}` has an invalid variable name: {key:?}"
                    )));
                }
            }
            Ok(Resolved::Pairs(pairs))
        }
        ParamKind::Operand => Ok(Resolved::Text(flag_value(name, value)?)),
        ParamKind::Operands => {
            let items = string_list(name, value)?;
            for item in &items {
                no_leading_dash(name, item)?;
            }
            Ok(Resolved::List(items))
        }
        ParamKind::Command => {
            let tokens = match value {
                Value::String(line) => split_words(name, line)?,
                _ => string_list(name, value)?,
            };
            let Some(first) = tokens.first() else {
                return Err(EngineError::invalid(format!("`{name}` is empty")));
            };
            no_leading_dash(name, first)?;
            for token in &tokens {
                check_text(name, token)?;
            }
            Ok(Resolved::List(tokens))
        }
        ParamKind::Subcommand => {
            let line = text(name, value)?;
            let tokens = split_words(name, &line)?;
            for token in &tokens {
                if !patterns.subcommand.is_match(token) {
                    return Err(EngineError::invalid(format!(
                        "`{name}` must name subcommands only, got {token:?}"
                    )));
                }
            }
            Ok(Resolved::List(tokens))
        }
    }
}

fn type_error(name: &str, expected: &str) -> EngineError {
    EngineError::invalid(format!("`{name}` must be {expected}"))
}

fn check_text(name: &str, text: &str) -> Result<()> {
    if text.is_empty() {
        return Err(EngineError::invalid(format!("`{name}` may not be empty")));
    }
    if text.contains('\0') {
        return Err(EngineError::invalid(format!(
            "`{name}` may not contain NUL bytes"
        )));
    }
    Ok(())
}

fn no_leading_dash(name: &str, text: &str) -> Result<()> {
    if text.starts_with('-') {
        return Err(EngineError::invalid(format!(
            "`{name}` value may not start with '-': {text:?}"
        )));
    }
    Ok(())
}

fn text(name: &str, value: &Value) -> Result<String> {
    let text = value.as_str().ok_or_else(|| type_error(name, "a string"))?;
    check_text(name, text)?;
    Ok(text.to_string())
}

fn flag_value(name: &str, value: &Value) -> Result<String> {
    let text = text(name, value)?;
    no_leading_dash(name, &text)?;
    Ok(text)
}

fn string_list(name: &str, value: &Value) -> Result<Vec<String>> {
    let items = value
        .as_array()
        .ok_or_else(|| type_error(name, "an array of strings"))?;
    items
        .iter()
        .map(|item| {
            let text = item
                .as_str()
                .ok_or_else(|| type_error(name, "an array of strings"))?;
            check_text(name, text)?;
            Ok(text.to_string())
        })
        .collect()
}

fn pairs(name: &str, value: &Value) -> Result<BTreeMap<String, String>> {
    let object = value
        .as_object()
        .ok_or_else(|| type_error(name, "an object"))?;
    let mut out = BTreeMap::new();
    for (key, raw) in object {
        check_text(name, key)?;
        let rendered = match raw {
            Value::String(text) => text.clone(),
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            _ => return Err(type_error(name, "an object of scalar values")),
        };
        if rendered.contains('\0') {
            return Err(EngineError::invalid(format!(
                "`{name}` may not contain NUL bytes"
            )));
        }
        out.insert(key.clone(), rendered);
    }
    Ok(out)
}

fn path(name: &str, value: &Value, must_exist: bool) -> Result<PathBuf> {
    let text = flag_value(name, value)?;
    let path = PathBuf::from(&text);
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(EngineError::invalid(format!(
            "`{name}` may not contain '..': {text}"
        )));
    }
    if must_exist && !Path::new(&path).exists() {
        return Err(EngineError::invalid(format!(
            "`{name}` does not exist: {text}"
        )));
    }
    Ok(path)
}

fn split_words(name: &str, line: &str) -> Result<Vec<String>> {
    shell_words::split(line)
        .map_err(|err| EngineError::invalid(format!("`{name}` could not be parsed: {err}")))
}
