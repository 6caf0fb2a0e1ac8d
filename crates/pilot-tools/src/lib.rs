use anyhow::{Result, anyhow};
use pilot_core::{ToolDefinition, ToolOutcome};
use pilot_policy::PolicyEngine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

const MAX_OUTPUT_BYTES: usize = 48 * 1024;
const MAX_MATCHES: usize = 200;

/// One capability the model can invoke. Arguments arrive as a JSON object
/// and are parsed into the handler's own parameter struct before anything
/// touches the filesystem; parse errors go back to the model as text.
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    fn read_only(&self) -> bool;
    fn run(&self, workspace: &Path, policy: &PolicyEngine, arguments: &Value) -> Result<String>;
}

/// Name-keyed capability map. Unknown tools and handler failures are
/// reported as failed outcomes, never panics.
pub struct ToolRegistry {
    workspace: PathBuf,
    policy: PolicyEngine,
    handlers: BTreeMap<String, Box<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new(workspace: impl Into<PathBuf>, policy: PolicyEngine) -> Self {
        Self {
            workspace: workspace.into(),
            policy,
            handlers: BTreeMap::new(),
        }
    }

    /// Registry preloaded with the local filesystem and shell tools.
    pub fn with_local_tools(workspace: impl Into<PathBuf>, policy: PolicyEngine) -> Self {
        let mut registry = Self::new(workspace, policy);
        registry.register(Box::new(ListTool));
        registry.register(Box::new(ReadTool));
        registry.register(Box::new(GlobTool));
        registry.register(Box::new(GrepTool));
        registry.register(Box::new(WriteTool));
        registry.register(Box::new(EditTool));
        registry.register(Box::new(ShellTool));
        registry
    }

    pub fn register(&mut self, handler: Box<dyn ToolHandler>) {
        self.handlers
            .insert(handler.definition().function.name.clone(), handler);
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.handlers.values().map(|h| h.definition()).collect()
    }

    pub fn is_read_only(&self, name: &str) -> bool {
        self.handlers.get(name).is_some_and(|h| h.read_only())
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn execute(&self, name: &str, arguments: &Value) -> ToolOutcome {
        let Some(handler) = self.handlers.get(name) else {
            return ToolOutcome::err(format!("unknown tool: {name}"));
        };
        match handler.run(&self.workspace, &self.policy, arguments) {
            Ok(output) => ToolOutcome::ok(self.policy.redact(&truncate_output(&output))),
            Err(e) => ToolOutcome::err(e.to_string()),
        }
    }
}

fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_OUTPUT_BYTES {
        return output.to_string();
    }
    let end = output.floor_char_boundary(MAX_OUTPUT_BYTES);
    format!("{}\n[output truncated at {MAX_OUTPUT_BYTES} bytes]", &output[..end])
}

fn parse_args<T: DeserializeOwned>(tool: &str, arguments: &Value) -> Result<T> {
    serde_json::from_value(arguments.clone())
        .map_err(|e| anyhow!("{tool}: invalid arguments: {e}"))
}

fn checked_path(workspace: &Path, policy: &PolicyEngine, path: &str) -> Result<PathBuf> {
    policy.check_path(path).map_err(|e| anyhow!("{path}: {e}"))?;
    Ok(workspace.join(path))
}

// ── fs.list ───────────────────────────────────────────────────────

struct ListTool;

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default = "default_dot")]
    path: String,
}

fn default_dot() -> String {
    ".".to_string()
}

impl ToolHandler for ListTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            "fs.list",
            "List directory entries. Directories carry a trailing slash.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory to list, relative to the workspace. Defaults to the workspace root."}
                }
            }),
        )
    }

    fn read_only(&self) -> bool {
        true
    }

    fn run(&self, workspace: &Path, policy: &PolicyEngine, arguments: &Value) -> Result<String> {
        let args: ListArgs = parse_args("fs.list", arguments)?;
        let dir = checked_path(workspace, policy, &args.path)?;
        let mut entries: Vec<String> = std::fs::read_dir(&dir)
            .map_err(|e| anyhow!("{}: {e}", args.path))?
            .filter_map(|entry| entry.ok())
            .map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.path().is_dir() { format!("{name}/") } else { name }
            })
            .collect();
        entries.sort();
        Ok(entries.join("\n"))
    }
}

// ── fs.read ───────────────────────────────────────────────────────

struct ReadTool;

#[derive(Deserialize)]
struct ReadArgs {
    path: String,
    #[serde(default)]
    start_line: Option<usize>,
    #[serde(default)]
    end_line: Option<usize>,
}

impl ToolHandler for ReadTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            "fs.read",
            "Read a file, optionally limited to a 1-based line range.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "start_line": {"type": "integer"},
                    "end_line": {"type": "integer"}
                },
                "required": ["path"]
            }),
        )
    }

    fn read_only(&self) -> bool {
        true
    }

    fn run(&self, workspace: &Path, policy: &PolicyEngine, arguments: &Value) -> Result<String> {
        let args: ReadArgs = parse_args("fs.read", arguments)?;
        // Each bound is 1-based on its own; a partial range still has to be
        // valid.
        if args.start_line == Some(0)
            || args.end_line == Some(0)
            || args
                .start_line
                .zip(args.end_line)
                .is_some_and(|(start, end)| end < start)
        {
            return Err(anyhow!("fs.read: line range must be 1-based and ordered"));
        }
        let file = checked_path(workspace, policy, &args.path)?;
        let contents =
            std::fs::read_to_string(&file).map_err(|e| anyhow!("{}: {e}", args.path))?;
        match (args.start_line, args.end_line) {
            (None, None) => Ok(contents),
            (start, end) => {
                let start = start.unwrap_or(1);
                let selected: Vec<&str> = contents
                    .lines()
                    .skip(start - 1)
                    .take(end.map_or(usize::MAX, |e| e - start + 1))
                    .collect();
                Ok(selected.join("\n"))
            }
        }
    }
}

// ── fs.glob ───────────────────────────────────────────────────────

struct GlobTool;

#[derive(Deserialize)]
struct GlobArgs {
    pattern: String,
}

impl ToolHandler for GlobTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            "fs.glob",
            "Find files matching a glob pattern, e.g. src/**/*.rs.",
            json!({
                "type": "object",
                "properties": {"pattern": {"type": "string"}},
                "required": ["pattern"]
            }),
        )
    }

    fn read_only(&self) -> bool {
        true
    }

    fn run(&self, workspace: &Path, policy: &PolicyEngine, arguments: &Value) -> Result<String> {
        let args: GlobArgs = parse_args("fs.glob", arguments)?;
        policy
            .check_path(&args.pattern)
            .map_err(|e| anyhow!("{}: {e}", args.pattern))?;
        let full = workspace.join(&args.pattern);
        let pattern = full.to_string_lossy();
        let mut matches: Vec<String> = glob::glob(&pattern)
            .map_err(|e| anyhow!("fs.glob: bad pattern: {e}"))?
            .filter_map(|entry| entry.ok())
            .filter_map(|path| {
                path.strip_prefix(workspace)
                    .map(|p| p.to_string_lossy().to_string())
                    .ok()
            })
            .take(MAX_MATCHES)
            .collect();
        matches.sort();
        Ok(matches.join("\n"))
    }
}

// ── fs.grep ───────────────────────────────────────────────────────

struct GrepTool;

#[derive(Deserialize)]
struct GrepArgs {
    pattern: String,
    #[serde(default = "default_dot")]
    path: String,
}

impl ToolHandler for GrepTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            "fs.grep",
            "Search file contents with a regex; respects .gitignore.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string", "description": "Directory to search under. Defaults to the workspace root."}
                },
                "required": ["pattern"]
            }),
        )
    }

    fn read_only(&self) -> bool {
        true
    }

    fn run(&self, workspace: &Path, policy: &PolicyEngine, arguments: &Value) -> Result<String> {
        let args: GrepArgs = parse_args("fs.grep", arguments)?;
        let root = checked_path(workspace, policy, &args.path)?;
        let regex =
            regex::Regex::new(&args.pattern).map_err(|e| anyhow!("fs.grep: bad pattern: {e}"))?;

        let mut hits: Vec<String> = Vec::new();
        for entry in ignore::WalkBuilder::new(&root).build().filter_map(|e| e.ok()) {
            if hits.len() >= MAX_MATCHES {
                break;
            }
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let Ok(contents) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let rel = entry
                .path()
                .strip_prefix(workspace)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            for (line_no, line) in contents.lines().enumerate() {
                if regex.is_match(line) {
                    hits.push(format!("{rel}:{}: {}", line_no + 1, line.trim_end()));
                    if hits.len() >= MAX_MATCHES {
                        break;
                    }
                }
            }
        }
        Ok(hits.join("\n"))
    }
}

// ── fs.write ──────────────────────────────────────────────────────

struct WriteTool;

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

impl ToolHandler for WriteTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            "fs.write",
            "Create or overwrite a file with the given content.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        )
    }

    fn read_only(&self) -> bool {
        false
    }

    fn run(&self, workspace: &Path, policy: &PolicyEngine, arguments: &Value) -> Result<String> {
        let args: WriteArgs = parse_args("fs.write", arguments)?;
        let file = checked_path(workspace, policy, &args.path)?;
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| anyhow!("{}: {e}", args.path))?;
        }
        std::fs::write(&file, &args.content).map_err(|e| anyhow!("{}: {e}", args.path))?;
        Ok(format!("wrote {} bytes to {}", args.content.len(), args.path))
    }
}

// ── fs.edit ───────────────────────────────────────────────────────

struct EditTool;

#[derive(Deserialize)]
struct EditArgs {
    path: String,
    search: String,
    replace: String,
}

impl ToolHandler for EditTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            "fs.edit",
            "Replace an exact string in a file. The search string must occur exactly once.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "search": {"type": "string"},
                    "replace": {"type": "string"}
                },
                "required": ["path", "search", "replace"]
            }),
        )
    }

    fn read_only(&self) -> bool {
        false
    }

    fn run(&self, workspace: &Path, policy: &PolicyEngine, arguments: &Value) -> Result<String> {
        let args: EditArgs = parse_args("fs.edit", arguments)?;
        let file = checked_path(workspace, policy, &args.path)?;
        let contents =
            std::fs::read_to_string(&file).map_err(|e| anyhow!("{}: {e}", args.path))?;
        let occurrences = contents.matches(&args.search).count();
        if occurrences == 0 {
            return Err(anyhow!("{}: search string not found", args.path));
        }
        if occurrences > 1 {
            return Err(anyhow!(
                "{}: search string occurs {occurrences} times; add context to make it unique",
                args.path
            ));
        }
        let updated = contents.replacen(&args.search, &args.replace, 1);
        std::fs::write(&file, updated).map_err(|e| anyhow!("{}: {e}", args.path))?;
        Ok(format!("edited {}", args.path))
    }
}

// ── shell.run ─────────────────────────────────────────────────────

struct ShellTool;

const SHELL_TIMEOUT_SECS: u64 = 120;

#[derive(Deserialize)]
struct ShellArgs {
    command: String,
    #[serde(default = "default_shell_timeout")]
    timeout_secs: u64,
}

fn default_shell_timeout() -> u64 {
    SHELL_TIMEOUT_SECS
}

impl ToolHandler for ShellTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            "shell.run",
            "Run a shell command in the workspace and capture its output.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout_secs": {"type": "integer", "description": "Kill the command after this many seconds. Defaults to 120."}
                },
                "required": ["command"]
            }),
        )
    }

    fn read_only(&self) -> bool {
        false
    }

    fn run(&self, workspace: &Path, _policy: &PolicyEngine, arguments: &Value) -> Result<String> {
        let args: ShellArgs = parse_args("shell.run", arguments)?;
        if args.command.trim().is_empty() {
            return Err(anyhow!("shell.run: empty command"));
        }
        // Approval gating happened before execution; here we only run. The
        // deadline also bounds the child when the supervising thread is
        // abandoned on interrupt.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&args.command)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow!("shell.run: {e}"))?;
        let status = child
            .wait_timeout(Duration::from_secs(args.timeout_secs))
            .map_err(|e| anyhow!("shell.run: {e}"))?;
        if status.is_none() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow!(
                "shell.run: command timed out after {}s",
                args.timeout_secs
            ));
        }
        let output = child
            .wait_with_output()
            .map_err(|e| anyhow!("shell.run: {e}"))?;
        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            combined.push_str(&stderr);
        }
        if output.status.success() {
            Ok(combined)
        } else {
            Err(anyhow!(
                "command exited with {}: {}",
                output.status,
                truncate_output(&combined)
            ))
        }
    }
}
