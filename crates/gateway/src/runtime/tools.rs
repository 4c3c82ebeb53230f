//! Tool registry for the runtime — builds tool definitions for the LLM and
//! dispatches tool calls to local handlers or stubs.
//!
//! Layering follows policy (allow/deny, checked against the sub-agent's
//! [`sa_domain::config::ToolPolicy`]) → circuit breaker (per-tool, see
//! [`crate::runtime::breaker`]) → base executor. A tool whose breaker is
//! open is short-circuited with a degraded "tool temporarily unavailable"
//! response instead of being dispatched; see [`crate::runtime::quota`] for
//! the separate per-agent cost/token budget side.

use serde_json::Value;

use sa_domain::config::ToolPolicy;
use sa_domain::tool::ToolDefinition;
use sa_tools::exec::{self, ExecRequest};
use sa_tools::file_ops::{
    self, FileAppendRequest, FileDeleteRequest, FileListRequest, FileMoveRequest,
    FileReadRequest, FileWriteRequest,
};
use sa_tools::process::{self, ProcessRequest};

use crate::runtime::agent::AgentContext;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the set of tool definitions exposed to the LLM.
///
/// When `tool_policy` is `Some`, definitions are filtered through it so that
/// sub-agents only see tools their config permits.
pub fn build_tool_definitions(
    state: &AppState,
    tool_policy: Option<&ToolPolicy>,
) -> Vec<ToolDefinition> {
    let mut defs = Vec::new();

    // ── Built-in local tools ──────────────────────────────────────
    defs.push(ToolDefinition {
        name: "exec".into(),
        description: "Run a shell command. Returns output or a background session ID.".into(),
        read_only: false,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command to execute" },
                "background": { "type": "boolean", "description": "Run in background" },
                "workdir": { "type": "string", "description": "Working directory" },
                "timeout_sec": { "type": "integer", "description": "Hard timeout in seconds" }
            },
            "required": ["command"]
        }),
    });

    defs.push(ToolDefinition {
        name: "process".into(),
        description: "Manage background processes: list, poll, log, write, kill, remove.".into(),
        read_only: false,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["list", "poll", "log", "write", "kill", "clear", "remove"],
                    "description": "Action to perform"
                },
                "session_id": { "type": "string", "description": "Process session ID" },
                "data": { "type": "string", "description": "Data to write to stdin" }
            },
            "required": ["action"]
        }),
    });

    // ── File tools (constrained to the workspace root) ─────────────
    defs.push(ToolDefinition {
        name: "file_read".into(),
        description: "Read a file within the workspace, optionally by line range.".into(),
        read_only: true,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace root" },
                "offset": { "type": "integer", "description": "0-indexed line to start from" },
                "limit": { "type": "integer", "description": "Maximum number of lines to return" }
            },
            "required": ["path"]
        }),
    });

    defs.push(ToolDefinition {
        name: "file_write".into(),
        description: "Write (overwrite) a file within the workspace.".into(),
        read_only: false,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace root" },
                "content": { "type": "string", "description": "Full file content" }
            },
            "required": ["path", "content"]
        }),
    });

    defs.push(ToolDefinition {
        name: "file_append".into(),
        description: "Append content to a file within the workspace.".into(),
        read_only: false,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace root" },
                "content": { "type": "string", "description": "Content to append" }
            },
            "required": ["path", "content"]
        }),
    });

    defs.push(ToolDefinition {
        name: "file_move".into(),
        description: "Move or rename a file within the workspace.".into(),
        read_only: false,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "source": { "type": "string", "description": "Source path relative to the workspace root" },
                "destination": { "type": "string", "description": "Destination path relative to the workspace root" }
            },
            "required": ["source", "destination"]
        }),
    });

    defs.push(ToolDefinition {
        name: "file_delete".into(),
        description: "Delete a file within the workspace.".into(),
        read_only: false,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace root" }
            },
            "required": ["path"]
        }),
    });

    defs.push(ToolDefinition {
        name: "file_list".into(),
        description: "List directory entries within the workspace.".into(),
        read_only: true,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory path relative to the workspace root (default '.')" }
            },
            "required": []
        }),
    });

    // ── Skill tools ───────────────────────────────────────────────
    defs.push(ToolDefinition {
        name: "skill.read_doc".into(),
        description: "Read the full documentation (SKILL.md) for a skill.".into(),
        read_only: true,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Skill name (e.g. 'apple-notes')" }
            },
            "required": ["name"]
        }),
    });

    defs.push(ToolDefinition {
        name: "skill.read_resource".into(),
        description: "Read a bundled resource from a skill (references/, scripts/, assets/).".into(),
        read_only: true,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Skill name" },
                "path": { "type": "string", "description": "Resource path (e.g. 'references/api.md')" }
            },
            "required": ["name", "path"]
        }),
    });

    // ── SerialMemory tools ────────────────────────────────────────
    defs.push(ToolDefinition {
        name: "memory.search".into(),
        description: "Search long-term memory for relevant facts, notes, and session history.".into(),
        read_only: true,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "limit": { "type": "integer", "description": "Max results (default 10)" }
            },
            "required": ["query"]
        }),
    });

    defs.push(ToolDefinition {
        name: "memory.ingest".into(),
        description: "Store a fact or note in long-term memory.".into(),
        read_only: false,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "Content to store" },
                "source": { "type": "string", "description": "Source label (e.g. 'user', 'agent')" }
            },
            "required": ["content"]
        }),
    });

    // ── Stub tools (common aliases that aren't wired yet) ─────────
    defs.push(ToolDefinition {
        name: "web.search".into(),
        description: "Search the web (SERP). Currently unavailable — returns an error with alternatives.".into(),
        read_only: true,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" }
            },
            "required": ["query"]
        }),
    });

    defs.push(ToolDefinition {
        name: "http.request".into(),
        description: "Make an HTTP request. Currently unavailable — returns an error with alternatives.".into(),
        read_only: false,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "URL to fetch" },
                "method": { "type": "string", "description": "HTTP method (GET, POST, etc.)" }
            },
            "required": ["url"]
        }),
    });

    // ── Agent delegation tools ──────────────────────────────────────
    // Only expose these if agents are configured.
    if let Some(ref agents) = state.agents {
        if !agents.is_empty() {
            defs.push(ToolDefinition {
                name: "agent.run".into(),
                description: "Delegate a task to a specialist sub-agent. The sub-agent runs in its own session with scoped tools and skills. Returns the agent's final answer.".into(),
                read_only: false,
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "agent_id": { "type": "string", "description": "ID of the agent to run (from agent.list)" },
                        "task": { "type": "string", "description": "The task or question to give the agent" },
                        "model": { "type": "string", "description": "Optional model override (e.g. 'openai/gpt-4o')" }
                    },
                    "required": ["agent_id", "task"]
                }),
            });

            defs.push(ToolDefinition {
                name: "agent.list".into(),
                description: "List all available sub-agents and their capabilities.".into(),
                read_only: true,
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {}
                }),
            });
        }
    }

    // ── Background-task / sub-agent tools ──────────────────────────
    defs.push(ToolDefinition {
        name: "bg_dispatch".into(),
        description: "Dispatch a long-running child task and return immediately with a task_id. Poll with bg_status/bg_collect.".into(),
        read_only: false,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "agent_kind": { "type": "string", "description": "Kind of background worker to run" },
                "prompt": { "type": "string", "description": "Task prompt for the child" },
                "task_id": { "type": "string", "description": "Optional explicit task id; auto-generated from the prompt if omitted" }
            },
            "required": ["agent_kind", "prompt"]
        }),
    });
    defs.push(ToolDefinition {
        name: "bg_status".into(),
        description: "Check the status of a dispatched background task.".into(),
        read_only: true,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string" }
            },
            "required": ["task_id"]
        }),
    });
    defs.push(ToolDefinition {
        name: "bg_collect".into(),
        description: "Collect the result of a completed background task.".into(),
        read_only: true,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string" }
            },
            "required": ["task_id"]
        }),
    });

    // ── Apply tool policy filter ─────────────────────────────────
    if let Some(policy) = tool_policy {
        defs.retain(|d| policy.allows(&d.name));
    }

    defs
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dispatch a single tool call. Returns (result_content, is_error).
///
/// `agent` is `Some` when the call originates from a sub-agent run; it is
/// checked against the sub-agent's tool policy so e.g. `agent.run` (nested
/// delegation) and other core-only tools can be withheld from children.
#[allow(clippy::too_many_arguments)]
pub async fn dispatch_tool(
    state: &AppState,
    tool_name: &str,
    arguments: &Value,
    session_key: Option<&str>,
    agent: Option<&AgentContext>,
    call_id: &str,
    parent_run_id: uuid::Uuid,
    correlation_id: uuid::Uuid,
) -> (String, bool) {
    if let Some(ctx) = agent {
        if !ctx.tool_policy.allows(tool_name) {
            return (
                serde_json::json!({
                    "error": format!("Tool '{tool_name}' is not permitted for this sub-agent"),
                })
                .to_string(),
                true,
            );
        }
    }

    if !state.tool_breaker.allow(tool_name) {
        return (
            serde_json::json!({
                "error": format!("Tool '{tool_name}' is temporarily unavailable"),
                "degraded": true,
                "reason": "circuit_open",
                "message": "This tool failed repeatedly and is cooling down. Try a different \
                             approach or retry shortly.",
            })
            .to_string(),
            true,
        );
    }

    let (content, is_error) = dispatch_tool_inner(
        state,
        tool_name,
        arguments,
        session_key,
        call_id,
        parent_run_id,
        correlation_id,
    )
    .await;
    state.tool_breaker.record(tool_name, !is_error);
    (content, is_error)
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_tool_inner(
    state: &AppState,
    tool_name: &str,
    arguments: &Value,
    session_key: Option<&str>,
    call_id: &str,
    parent_run_id: uuid::Uuid,
    correlation_id: uuid::Uuid,
) -> (String, bool) {
    // Handle our built-in tools first.
    match tool_name {
        "exec" => dispatch_exec(state, arguments).await,
        "process" => dispatch_process(state, arguments).await,
        "file_read" => dispatch_file_read(state, arguments).await,
        "file_write" => dispatch_file_write(state, arguments).await,
        "file_append" => dispatch_file_append(state, arguments).await,
        "file_move" => dispatch_file_move(state, arguments).await,
        "file_delete" => dispatch_file_delete(state, arguments).await,
        "file_list" => dispatch_file_list(state, arguments).await,
        "skill.read_doc" => dispatch_skill_read_doc(state, arguments),
        "skill.read_resource" => dispatch_skill_read_resource(state, arguments),
        "memory.search" => dispatch_memory_search(state, arguments).await,
        "memory.ingest" => dispatch_memory_ingest(state, arguments).await,
        "agent.run" => {
            dispatch_agent_run(
                state,
                arguments,
                session_key,
                call_id,
                parent_run_id,
                correlation_id,
            )
            .await
        }
        "agent.list" => dispatch_agent_list(state),
        "bg_dispatch" => dispatch_bg_dispatch(state, arguments, session_key).await,
        "bg_status" => dispatch_bg_status(state, arguments),
        "bg_collect" => dispatch_bg_collect(state, arguments),
        "web.search" => stub_tool("web.search", "Web search is not yet configured. Use exec with curl or a search CLI tool as an alternative."),
        "http.request" => stub_tool("http.request", "HTTP requests are not yet configured. Use exec with curl as an alternative."),
        _ => (
            serde_json::json!({
                "error": format!("Unknown tool: '{tool_name}'"),
                "message": "This tool is not registered. Check available tools.",
            })
            .to_string(),
            true,
        ),
    }
}

async fn dispatch_bg_dispatch(
    state: &AppState,
    arguments: &Value,
    session_key: Option<&str>,
) -> (String, bool) {
    let agent_kind = arguments
        .get("agent_kind")
        .and_then(|v| v.as_str())
        .unwrap_or("generic")
        .to_string();
    let prompt = match arguments.get("prompt").and_then(|v| v.as_str()) {
        Some(p) => p.to_string(),
        None => return ("missing required argument: prompt".into(), true),
    };
    let task_id = arguments
        .get("task_id")
        .and_then(|v| v.as_str())
        .map(String::from);

    let task = state.background_tasks.dispatch(
        task_id,
        agent_kind,
        prompt,
        session_key.map(String::from),
    );
    (
        serde_json::json!({ "task_id": task.task_id, "status": task.status }).to_string(),
        false,
    )
}

fn dispatch_bg_status(state: &AppState, arguments: &Value) -> (String, bool) {
    let task_id = arguments.get("task_id").and_then(|v| v.as_str()).unwrap_or("");
    match state.background_tasks.get(task_id) {
        Some(task) => (serde_json::to_string_pretty(&task).unwrap_or_default(), false),
        None => (format!("no such background task: {task_id}"), true),
    }
}

fn dispatch_bg_collect(state: &AppState, arguments: &Value) -> (String, bool) {
    let task_id = arguments.get("task_id").and_then(|v| v.as_str()).unwrap_or("");
    match state.background_tasks.get(task_id) {
        Some(task) if task.status.is_terminal() => {
            (task.output.clone().unwrap_or_default(), task.status == crate::runtime::background::BackgroundTaskStatus::Failed)
        }
        Some(task) => (
            format!("task {task_id} is still {:?}", task.status),
            true,
        ),
        None => (format!("no such background task: {task_id}"), true),
    }
}

async fn dispatch_exec(state: &AppState, arguments: &Value) -> (String, bool) {
    let req: ExecRequest = match serde_json::from_value(arguments.clone()) {
        Ok(r) => r,
        Err(e) => return (format!("invalid exec arguments: {e}"), true),
    };
    let resp = exec::exec(&state.processes, req).await;
    let json = serde_json::to_string_pretty(&resp).unwrap_or_default();
    (json, false)
}

async fn dispatch_process(state: &AppState, arguments: &Value) -> (String, bool) {
    let req: ProcessRequest = match serde_json::from_value(arguments.clone()) {
        Ok(r) => r,
        Err(e) => return (format!("invalid process arguments: {e}"), true),
    };
    let resp = process::handle_process(&state.processes, req).await;
    let json = serde_json::to_string_pretty(&resp).unwrap_or_default();
    (json, false)
}

async fn dispatch_file_read(state: &AppState, arguments: &Value) -> (String, bool) {
    let req: FileReadRequest = match serde_json::from_value(arguments.clone()) {
        Ok(r) => r,
        Err(e) => return (format!("invalid file_read arguments: {e}"), true),
    };
    match file_ops::file_read(&state.config.workspace.path, req).await {
        Ok(v) => (v.to_string(), false),
        Err(e) => (e, true),
    }
}

async fn dispatch_file_write(state: &AppState, arguments: &Value) -> (String, bool) {
    let req: FileWriteRequest = match serde_json::from_value(arguments.clone()) {
        Ok(r) => r,
        Err(e) => return (format!("invalid file_write arguments: {e}"), true),
    };
    match file_ops::file_write(&state.config.workspace.path, req).await {
        Ok(v) => (v.to_string(), false),
        Err(e) => (e, true),
    }
}

async fn dispatch_file_append(state: &AppState, arguments: &Value) -> (String, bool) {
    let req: FileAppendRequest = match serde_json::from_value(arguments.clone()) {
        Ok(r) => r,
        Err(e) => return (format!("invalid file_append arguments: {e}"), true),
    };
    match file_ops::file_append(&state.config.workspace.path, req).await {
        Ok(v) => (v.to_string(), false),
        Err(e) => (e, true),
    }
}

async fn dispatch_file_move(state: &AppState, arguments: &Value) -> (String, bool) {
    let req: FileMoveRequest = match serde_json::from_value(arguments.clone()) {
        Ok(r) => r,
        Err(e) => return (format!("invalid file_move arguments: {e}"), true),
    };
    match file_ops::file_move(&state.config.workspace.path, req).await {
        Ok(v) => (v.to_string(), false),
        Err(e) => (e, true),
    }
}

async fn dispatch_file_delete(state: &AppState, arguments: &Value) -> (String, bool) {
    let req: FileDeleteRequest = match serde_json::from_value(arguments.clone()) {
        Ok(r) => r,
        Err(e) => return (format!("invalid file_delete arguments: {e}"), true),
    };
    match file_ops::file_delete(&state.config.workspace.path, req).await {
        Ok(v) => (v.to_string(), false),
        Err(e) => (e, true),
    }
}

async fn dispatch_file_list(state: &AppState, arguments: &Value) -> (String, bool) {
    let req: FileListRequest = match serde_json::from_value(arguments.clone()) {
        Ok(r) => r,
        Err(e) => return (format!("invalid file_list arguments: {e}"), true),
    };
    match file_ops::file_list(&state.config.workspace.path, req).await {
        Ok(v) => (v.to_string(), false),
        Err(e) => (e, true),
    }
}

fn dispatch_skill_read_doc(state: &AppState, arguments: &Value) -> (String, bool) {
    let name = arguments
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    match state.skills.read_doc(name) {
        Ok(doc) => (doc, false),
        Err(e) => (format!("skill doc error: {e}"), true),
    }
}

fn dispatch_skill_read_resource(state: &AppState, arguments: &Value) -> (String, bool) {
    let name = arguments
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let path = arguments
        .get("path")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    match state.skills.read_resource(name, path) {
        Ok(content) => (content, false),
        Err(e) => (format!("resource error: {e}"), true),
    }
}

async fn dispatch_memory_search(state: &AppState, arguments: &Value) -> (String, bool) {
    let query = arguments
        .get("query")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let limit = arguments
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);

    let req = sa_memory::RagSearchRequest { query, limit };

    match state.memory.search(req).await {
        Ok(results) => {
            let json = serde_json::to_string_pretty(&results).unwrap_or_default();
            (json, false)
        }
        Err(e) => (format!("memory search error: {e}"), true),
    }
}

async fn dispatch_memory_ingest(state: &AppState, arguments: &Value) -> (String, bool) {
    let content = arguments
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let source = arguments
        .get("source")
        .and_then(|v| v.as_str())
        .map(String::from);

    let req = sa_memory::MemoryIngestRequest {
        content,
        source,
        session_id: None,
        metadata: None,
        extract_entities: None,
    };

    match state.memory.ingest(req).await {
        Ok(resp) => {
            let json = serde_json::to_string_pretty(&resp).unwrap_or_default();
            (json, false)
        }
        Err(e) => (format!("memory ingest error: {e}"), true),
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_agent_run(
    state: &AppState,
    arguments: &Value,
    session_key: Option<&str>,
    call_id: &str,
    parent_run_id: uuid::Uuid,
    correlation_id: uuid::Uuid,
) -> (String, bool) {
    let agent_id = match arguments.get("agent_id").and_then(|v| v.as_str()) {
        Some(id) => id,
        None => return ("missing required argument: agent_id".into(), true),
    };
    let task = match arguments.get("task").and_then(|v| v.as_str()) {
        Some(t) => t,
        None => return ("missing required argument: task".into(), true),
    };
    let model = arguments
        .get("model")
        .and_then(|v| v.as_str())
        .map(String::from);

    let parent_key = session_key.unwrap_or("anonymous");

    super::agent::run_agent(
        state,
        agent_id,
        task,
        model,
        parent_key,
        parent_run_id,
        correlation_id,
        call_id,
    )
    .await
}

fn dispatch_agent_list(state: &AppState) -> (String, bool) {
    let manager = match &state.agents {
        Some(m) => m,
        None => {
            return (
                serde_json::json!({ "agents": [], "count": 0 }).to_string(),
                false,
            );
        }
    };

    let agents: Vec<_> = manager
        .list()
        .into_iter()
        .map(|id| {
            let runtime = manager.get(&id);
            match runtime {
                Some(r) => serde_json::json!({
                    "id": id,
                    "tools_allow": r.config.tool_policy.allow,
                    "tools_deny": r.config.tool_policy.deny,
                    "models": r.config.models,
                    "memory_mode": r.config.memory_mode,
                }),
                None => serde_json::json!({ "id": id }),
            }
        })
        .collect();

    (
        serde_json::json!({
            "agents": agents,
            "count": agents.len(),
        })
        .to_string(),
        false,
    )
}

fn stub_tool(name: &str, message: &str) -> (String, bool) {
    (
        serde_json::json!({
            "error": format!("Tool '{name}' is not available"),
            "message": message,
            "suggestion": "Use the 'exec' tool with appropriate CLI commands as a workaround."
        })
        .to_string(),
        true,
    )
}

