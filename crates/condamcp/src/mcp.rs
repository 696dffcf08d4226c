use engine::Engine;
use protocol::{ErrorKind, ExecutionResult, Payload, ToolError, ToolResponse};
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Content, Implementation, ListToolsResult,
        PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo, Tool,
        ToolsCapability,
    },
    ErrorData as McpError, RoleServer, ServerHandler,
};
use serde_json::json;

const INSTRUCTIONS: &str = "Manage conda environments and packages. Every conda subcommand is a tool; \
pass output_format=structured for parsed JSON where supported. `build` runs in the background and \
returns a job_id: poll job_status, follow output with job_tail using the returned offset, stop it \
with job_cancel and release it with job_cleanup.";

pub(crate) struct CondaHandler {
    engine: Engine,
    tools: Vec<Tool>,
    server_info: ServerInfo,
}

impl CondaHandler {
    pub(crate) fn new(engine: Engine, tools: Vec<Tool>) -> Self {
        Self {
            engine,
            tools,
            server_info: server_info(),
        }
    }
}

fn server_info() -> ServerInfo {
    ServerInfo {
        protocol_version: ProtocolVersion::default(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability::default()),
            ..Default::default()
        },
        server_info: Implementation {
            name: "condamcp".to_string(),
            title: Some("Conda MCP Server".to_string()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            icons: None,
            website_url: None,
        },
        instructions: Some(INSTRUCTIONS.to_string()),
    }
}

impl ServerHandler for CondaHandler {
    fn get_info(&self) -> ServerInfo {
        self.server_info.clone()
    }

    fn list_tools(
        &self,
        _: Option<PaginatedRequestParam>,
        _: rmcp::service::RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        async move { Ok(ListToolsResult::with_all_items(self.tools.clone())) }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParam,
        _: rmcp::service::RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move {
            let args = request.arguments.unwrap_or_default();
            tracing::debug!(tool = %request.name, "tool call");
            let response = self.engine.invoke(&request.name, args).await;
            to_call_result(response)
        }
    }
}

/// Caller mistakes become protocol errors; everything else, failed
/// processes included, is a tool result the model can read.
pub(crate) fn to_call_result(response: ToolResponse) -> Result<CallToolResult, McpError> {
    if let ToolResponse::Error { error } = &response {
        if matches!(
            error.kind,
            ErrorKind::InvalidParameter | ErrorKind::UnsupportedOperation
        ) {
            return Err(McpError::invalid_params(
                error.message.clone(),
                Some(json!({ "kind": error.kind })),
            ));
        }
    }
    let structured = serde_json::to_value(&response)
        .map_err(|err| McpError::internal_error(format!("encode response: {err}"), None))?;
    Ok(CallToolResult {
        content: vec![Content::text(render(&response))],
        is_error: Some(response.is_error()),
        meta: None,
        structured_content: Some(structured),
    })
}

fn render(response: &ToolResponse) -> String {
    let mut lines = Vec::new();
    match response {
        ToolResponse::Result {
            operation,
            result,
            error,
        } => {
            lines.push(format!("operation: {operation}"));
            render_result(&mut lines, result);
            if let Some(error) = error {
                render_error(&mut lines, error);
            }
        }
        ToolResponse::Job { job } => {
            lines.push(format!("job_id: {}", job.job_id));
            lines.push(format!("operation: {}", job.operation));
            lines.push(format!("state: {}", job.state));
            lines.push(format!("started_at: {}", job.started_at));
            if let Some(pid) = job.pid {
                lines.push(format!("pid: {pid}"));
            }
        }
        ToolResponse::Status { job } => {
            lines.push(format!("job_id: {}", job.job_id));
            lines.push(format!("operation: {}", job.operation));
            lines.push(format!("state: {}", job.state));
            lines.push(format!("command: {}", job.command.join(" ")));
            lines.push(format!("started_at: {}", job.started_at));
            if let Some(finished) = &job.finished_at {
                lines.push(format!("finished_at: {finished}"));
            }
            lines.push(format!("elapsed_ms: {}", job.elapsed_ms));
            lines.push(format!("output_offset: {}", job.output_offset));
            if job.cancel_requested {
                lines.push("cancel_requested: true".to_string());
            }
            if let Some(result) = &job.result {
                render_result(&mut lines, result);
            }
            if let Some(error) = &job.error {
                render_error(&mut lines, error);
            }
        }
        ToolResponse::Tail { chunk } => {
            lines.push(format!("job_id: {}", chunk.job_id));
            lines.push(format!("state: {}", chunk.state));
            lines.push(format!("offset: {}", chunk.offset));
            if chunk.dropped > 0 {
                lines.push(format!("dropped_bytes: {}", chunk.dropped));
            }
            lines.push(format!("output: {}", chunk.data));
        }
        ToolResponse::Cancel {
            job_id,
            outcome,
            state,
        } => {
            lines.push(format!("job_id: {job_id}"));
            lines.push(format!("cancel: {}", outcome.as_str()));
            lines.push(format!("state: {state}"));
        }
        ToolResponse::Cleanup { job_id } => {
            lines.push(format!("job_id: {job_id}"));
            lines.push("removed: true".to_string());
        }
        ToolResponse::Jobs { jobs } => {
            lines.push(format!("jobs: {}", jobs.len()));
            for job in jobs {
                lines.push(format!(
                    "- {} {} {} {}",
                    job.job_id, job.operation, job.state, job.started_at
                ));
            }
        }
        ToolResponse::SystemInfo { info } => {
            lines.push(format!("os: {} ({})", info.os, info.family));
            lines.push(format!("arch: {}", info.arch));
            lines.push(format!("cpus: {}", info.cpus));
            if let Some(hostname) = &info.hostname {
                lines.push(format!("hostname: {hostname}"));
            }
            if let Some(bytes) = info.total_memory_bytes {
                lines.push(format!("total_memory_bytes: {bytes}"));
            }
        }
        ToolResponse::Error { error } => render_error(&mut lines, error),
    }
    lines.join("\n")
}

fn render_result(lines: &mut Vec<String>, result: &ExecutionResult) {
    lines.push(format!("termination: {}", result.termination.as_str()));
    if let Some(code) = result.exit_code {
        lines.push(format!("exit_code: {code}"));
    }
    lines.push(format!("duration_ms: {}", result.duration_ms));
    match &result.payload {
        Payload::Structured(value) => {
            let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
            lines.push(format!("output: {text}"));
        }
        Payload::Plain(text) => lines.push(format!("output: {text}")),
        Payload::PartialOutput(text) => {
            lines.push("partial_output: true".to_string());
            lines.push(format!("output: {text}"));
        }
    }
    if result.stdout_truncated {
        lines.push("stdout_truncated: true".to_string());
    }
    if !result.stderr.trim().is_empty() {
        lines.push(format!("stderr: {}", result.stderr));
    }
}

fn render_error(lines: &mut Vec<String>, error: &ToolError) {
    lines.push(format!("error: {}", error.kind));
    lines.push(format!("message: {}", error.message));
    if let Some(code) = error.exit_code {
        lines.push(format!("exit_code: {code}"));
    }
    if let Some(tail) = &error.stderr_tail {
        lines.push(format!("stderr_tail: {tail}"));
    }
}
