use engine::builder::catalog::{OperationClass, OperationSpec, ParamKind, ParamSpec, OPERATIONS};
use engine::builder::{ENV_NAME_PATTERN, ENV_VAR_PATTERN};
use engine::facade::{
    ARG_MODE, ARG_OUTPUT_FORMAT, ARG_TIMEOUT_MS, JOB_CANCEL, JOB_CLEANUP, JOB_STATUS, JOB_TAIL,
    LIST_JOBS, SYSTEM_INFO,
};
use protocol::{ExecutionMode, Operation};
use rmcp::model::{Tool, ToolAnnotations};
use serde_json::{json, Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct Hints {
    read_only: bool,
    destructive: bool,
    idempotent: bool,
    open_world: bool,
}

/// Every tool the server exposes: one per catalogue operation, then the job
/// and host tools.
pub(crate) fn all_tools() -> Vec<Tool> {
    let mut tools: Vec<Tool> = OPERATIONS.iter().map(operation_tool).collect();
    tools.extend(job_tools());
    tools
}

fn operation_tool(spec: &OperationSpec) -> Tool {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in spec.params {
        properties.insert(param.name.to_string(), param_schema(param));
        if param.required {
            required.push(param.name);
        }
    }

    let formats: &[&str] = if spec.json {
        &["structured", "plain"]
    } else {
        &["plain"]
    };
    properties.insert(
        ARG_OUTPUT_FORMAT.to_string(),
        json!({
            "type": "string",
            "enum": formats,
            "default": "plain",
            "description": "`structured` adds --json and parses the output."
        }),
    );
    let default_mode = match spec.default_mode {
        ExecutionMode::Foreground => "foreground",
        ExecutionMode::Background => "background",
    };
    properties.insert(
        ARG_MODE.to_string(),
        json!({
            "type": "string",
            "enum": ["foreground", "background"],
            "default": default_mode,
            "description": "background returns a job_id immediately; follow it with job_status and job_tail."
        }),
    );
    properties.insert(
        ARG_TIMEOUT_MS.to_string(),
        json!({
            "type": "integer",
            "minimum": 1,
            "description": "Override the operation timeout in milliseconds."
        }),
    );

    let mut description = spec.description.to_string();
    for group in spec.one_of {
        description.push_str(&format!(" Requires one of: {}.", group.join(", ")));
    }
    for group in spec.exclusive {
        description.push_str(&format!(" Mutually exclusive: {}.", group.join(", ")));
    }

    let title = operation_title(spec.operation);
    tool(
        spec.operation.as_str(),
        title,
        description,
        object_schema(properties, &required),
        operation_hints(spec),
    )
}

fn param_schema(param: &ParamSpec) -> Value {
    let mut schema = match param.kind {
        ParamKind::Switch => json!({ "type": "boolean" }),
        ParamKind::Value | ParamKind::Operand | ParamKind::Path { .. } | ParamKind::PathOperand { .. } => {
            json!({ "type": "string" })
        }
        ParamKind::Choice(choices) => json!({ "type": "string", "enum": choices }),
        ParamKind::EnvName | ParamKind::BuildEnv => {
            json!({ "type": "string", "pattern": ENV_NAME_PATTERN })
        }
        ParamKind::Values | ParamKind::Operands => {
            json!({ "type": "array", "items": { "type": "string" } })
        }
        ParamKind::Integer { min, max } => {
            json!({ "type": "integer", "minimum": min, "maximum": max })
        }
        ParamKind::KeyValues => {
            json!({ "type": "object", "additionalProperties": { "type": "string" } })
        }
        ParamKind::EnvVars => json!({
            "type": "object",
            "propertyNames": { "pattern": ENV_VAR_PATTERN },
            "additionalProperties": { "type": "string" }
        }),
        ParamKind::Command => json!({
            "type": ["string", "array"],
            "items": { "type": "string" }
        }),
        ParamKind::Subcommand => json!({ "type": "string" }),
    };
    schema["description"] = json!(param.description);
    schema
}

fn operation_title(operation: Operation) -> &'static str {
    match operation {
        Operation::Create => "Create Environment",
        Operation::Install => "Install Packages",
        Operation::Remove => "Remove Packages",
        Operation::Update => "Update Packages",
        Operation::List => "List Packages",
        Operation::Search => "Search Packages",
        Operation::Info => "Conda Info",
        Operation::Export => "Export Environment",
        Operation::EnvList => "List Environments",
        Operation::EnvCreate => "Create Environment From File",
        Operation::EnvUpdate => "Update Environment From File",
        Operation::EnvRemove => "Remove Environment",
        Operation::Clean => "Clean Caches",
        Operation::Compare => "Compare Environment",
        Operation::Run => "Run In Environment",
        Operation::Help => "Conda Help",
        Operation::Build => "Build Package",
    }
}

fn operation_hints(spec: &OperationSpec) -> Hints {
    let operation = spec.operation;
    let read_only = spec.class == OperationClass::Query && operation != Operation::Export;
    Hints {
        read_only,
        destructive: matches!(
            operation,
            Operation::Remove
                | Operation::Update
                | Operation::Install
                | Operation::Clean
                | Operation::EnvUpdate
                | Operation::EnvRemove
        ),
        idempotent: read_only,
        open_world: matches!(
            operation,
            Operation::Create
                | Operation::EnvCreate
                | Operation::EnvUpdate
                | Operation::Install
                | Operation::Update
                | Operation::Search
                | Operation::Build
                | Operation::Run
        ),
    }
}

fn job_tools() -> Vec<Tool> {
    let read = Hints {
        read_only: true,
        destructive: false,
        idempotent: true,
        open_world: false,
    };
    let job_id = || {
        json!({
            "type": "string",
            "description": "Identifier returned by a background operation."
        })
    };

    let mut status = Map::new();
    status.insert("job_id".to_string(), job_id());

    let mut tail = Map::new();
    tail.insert("job_id".to_string(), job_id());
    tail.insert(
        "since_offset".to_string(),
        json!({
            "type": "integer",
            "minimum": 0,
            "description": "Return output after this byte offset; pass the previous chunk's offset."
        }),
    );
    tail.insert(
        "lines".to_string(),
        json!({
            "type": "integer",
            "minimum": 0,
            "description": "Return only the last N lines instead. Cannot be combined with since_offset."
        }),
    );

    let mut cancel = Map::new();
    cancel.insert("job_id".to_string(), job_id());
    let mut cleanup = Map::new();
    cleanup.insert("job_id".to_string(), job_id());

    vec![
        tool(
            JOB_STATUS,
            "Job Status",
            "State, timing and final result of a background job.".to_string(),
            object_schema(status, &["job_id"]),
            read,
        ),
        tool(
            JOB_TAIL,
            "Job Output",
            "Incremental combined output of a background job.".to_string(),
            object_schema(tail, &["job_id"]),
            read,
        ),
        tool(
            JOB_CANCEL,
            "Cancel Job",
            "Request cancellation of a running job. Cancelling a finished job is a no-op.".to_string(),
            object_schema(cancel, &["job_id"]),
            Hints {
                read_only: false,
                destructive: true,
                idempotent: true,
                open_world: false,
            },
        ),
        tool(
            JOB_CLEANUP,
            "Clean Up Job",
            "Forget a finished job and release its retained output.".to_string(),
            object_schema(cleanup, &["job_id"]),
            Hints {
                read_only: false,
                destructive: false,
                idempotent: false,
                open_world: false,
            },
        ),
        tool(
            LIST_JOBS,
            "List Jobs",
            "Summaries of all retained jobs, newest first.".to_string(),
            object_schema(Map::new(), &[]),
            read,
        ),
        tool(
            SYSTEM_INFO,
            "System Info",
            "Operating system, architecture, CPU count and memory of the host.".to_string(),
            object_schema(Map::new(), &[]),
            read,
        ),
    ]
}

fn object_schema(properties: Map<String, Value>, required: &[&str]) -> Map<String, Value> {
    let mut input_schema = Map::new();
    input_schema.insert("type".to_string(), Value::String("object".to_string()));
    if !required.is_empty() {
        input_schema.insert("required".to_string(), json!(required));
    }
    input_schema.insert("properties".to_string(), Value::Object(properties));
    input_schema.insert("additionalProperties".to_string(), Value::Bool(false));
    input_schema
}

fn tool(
    name: &'static str,
    title: &str,
    description: String,
    input_schema: Map<String, Value>,
    hints: Hints,
) -> Tool {
    Tool {
        name: name.into(),
        description: Some(description.into()),
        input_schema: Arc::new(input_schema),
        output_schema: None,
        title: Some(title.to_string()),
        annotations: Some(ToolAnnotations {
            read_only_hint: Some(hints.read_only),
            destructive_hint: Some(hints.destructive),
            open_world_hint: Some(hints.open_world),
            idempotent_hint: Some(hints.idempotent),
            title: Some(title.to_string()),
        }),
        icons: None,
    }
}
