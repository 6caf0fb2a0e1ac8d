use anyhow::Context;
use chrono::{DateTime, Utc};
use pilot_playbook::{Playbook, SelectionWeights};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

/// Per-workspace runtime directory holding config, logs and sessions.
pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".pilot")
}

// ── messages ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model. Results are carried by the
/// tool-role message that answers this call's id, not mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            at: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Tool-result message answering the given call id.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// Rough token estimate: four characters per token, counting tool-call
/// arguments. Cheap enough to run every iteration.
pub fn estimate_message_tokens(messages: &[Message]) -> u64 {
    let chars: usize = messages
        .iter()
        .map(|m| {
            m.content.len()
                + m.tool_calls
                    .iter()
                    .map(|c| c.name.len() + c.arguments.to_string().len())
                    .sum::<usize>()
        })
        .sum();
    (chars / 4) as u64
}

// ── tool interface ────────────────────────────────────────────────

/// Result shape every tool handler produces; unknown tools and handler
/// failures become `success=false`, never a panic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }

    /// Text fed back to the model as the tool message content.
    pub fn render(&self) -> String {
        if self.success {
            self.output.clone().unwrap_or_default()
        } else {
            format!(
                "error: {}",
                self.error.as_deref().unwrap_or("unknown failure")
            )
        }
    }
}

/// JSON-schema description of one tool, sent to the model verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            r#type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

// ── approvals ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// Operation kind, normally the tool name; auto-approve scope is keyed
    /// on this value.
    pub operation: String,
    pub preview: String,
    pub allow_edit: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub approved: bool,
    /// Approve future requests with the same operation kind without asking.
    pub auto_approve_scope: bool,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            auto_approve_scope: false,
        }
    }

    pub fn deny() -> Self {
        Self {
            approved: false,
            auto_approve_scope: false,
        }
    }
}

pub trait ApprovalManager: Send + Sync {
    fn request_approval(&self, request: &ApprovalRequest) -> Result<ApprovalDecision>;
}

// ── usage & cancellation ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Cooperative interrupt flag checked at every engine checkpoint. Cloning
/// shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Shared flag, for wiring into signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

// ── session ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub working_directory: PathBuf,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub playbook: Playbook,
    #[serde(default)]
    pub usage: TokenUsage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            working_directory: working_directory.into(),
            messages: Vec::new(),
            playbook: Playbook::new(),
            usage: TokenUsage::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }
}

// ── events ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq_no: u64,
    pub at: DateTime<Utc>,
    pub session_id: Uuid,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    QueryStartedV1 { query: String },
    IterationStartedV1 { iteration: u32 },
    ToolProposedV1 { call_id: String, name: String },
    ToolResultV1 { call_id: String, name: String, success: bool },
    ApprovalDeniedV1 { name: String },
    NudgeInjectedV1 { consecutive_reads: u32 },
    ContextCompactedV1 { before_tokens: u64, after_tokens: u64 },
    StrategyLearnedV1 { id: String, category: String },
    QueryFinishedV1 { status: String, iterations: u32 },
}

pub type EventCallback = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

// ── configuration ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub reflector: ReflectorConfig,
    #[serde(default)]
    pub playbook: PlaybookConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl AppConfig {
    pub fn config_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    /// Reads `.pilot/config.toml`, falling back to defaults when absent.
    pub fn load(workspace: &Path) -> Result<Self> {
        let path = Self::config_path(workspace);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::config_path(workspace);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(self).context("serializing config")?;
        std::fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable holding the API key; never stored in config.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f64,
}

fn default_base_url() -> String {
    "https://api.deepseek.com".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_api_key_env() -> String {
    "PILOT_API_KEY".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard iteration cap per query.
    #[serde(default = "default_safety_limit")]
    pub safety_limit: u32,
    /// Consecutive all-read-only batches before a summarize nudge.
    #[serde(default = "default_nudge_threshold")]
    pub consecutive_read_nudge_threshold: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_safety_limit() -> u32 {
    30
}

fn default_nudge_threshold() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            safety_limit: default_safety_limit(),
            consecutive_read_nudge_threshold: default_nudge_threshold(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_context_window_tokens")]
    pub context_window_tokens: u64,
    #[serde(default = "default_compaction_threshold_fraction")]
    pub compaction_threshold_fraction: f64,
    /// Tail messages always preserved verbatim by compaction.
    #[serde(default = "default_keep_recent_messages")]
    pub keep_recent_messages: usize,
}

fn default_context_window_tokens() -> u64 {
    128_000
}

fn default_compaction_threshold_fraction() -> f64 {
    0.8
}

fn default_keep_recent_messages() -> usize {
    6
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: default_context_window_tokens(),
            compaction_threshold_fraction: default_compaction_threshold_fraction(),
            keep_recent_messages: default_keep_recent_messages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectorConfig {
    #[serde(default = "default_min_tool_calls")]
    pub min_tool_calls: usize,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

fn default_min_tool_calls() -> usize {
    2
}

fn default_min_confidence() -> f64 {
    0.65
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            min_tool_calls: default_min_tool_calls(),
            min_confidence: default_min_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookConfig {
    #[serde(default = "default_max_strategies")]
    pub max_strategies: usize,
    #[serde(default = "default_prune_threshold")]
    pub prune_threshold: f64,
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
}

fn default_max_strategies() -> usize {
    30
}

fn default_prune_threshold() -> f64 {
    -0.2
}

fn default_min_samples() -> u64 {
    3
}

impl Default for PlaybookConfig {
    fn default() -> Self {
        Self {
            max_strategies: default_max_strategies(),
            prune_threshold: default_prune_threshold(),
            min_samples: default_min_samples(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(default = "default_effectiveness_weight")]
    pub effectiveness_weight: f64,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
}

fn default_effectiveness_weight() -> f64 {
    0.5
}

fn default_recency_weight() -> f64 {
    0.3
}

fn default_semantic_weight() -> f64 {
    0.2
}

fn default_decay_rate() -> f64 {
    0.1
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            effectiveness_weight: default_effectiveness_weight(),
            recency_weight: default_recency_weight(),
            semantic_weight: default_semantic_weight(),
            decay_rate: default_decay_rate(),
        }
    }
}

impl SelectorConfig {
    pub fn weights(&self) -> SelectionWeights {
        SelectionWeights {
            effectiveness: self.effectiveness_weight,
            recency: self.recency_weight,
            semantic: self.semantic_weight,
            decay_rate: self.decay_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_true")]
    pub approve_edits: bool,
    #[serde(default = "default_true")]
    pub approve_shell: bool,
    #[serde(default = "default_allowlist")]
    pub allowlist: Vec<String>,
    #[serde(default = "default_denied_secret_paths")]
    pub denied_secret_paths: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_allowlist() -> Vec<String> {
    [
        "rg",
        "ls",
        "cat",
        "git status",
        "git diff",
        "git log",
        "cargo check",
        "cargo test",
        "cargo build",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_denied_secret_paths() -> Vec<String> {
    [".env", "*.pem", "*.key", "id_rsa", "credentials*"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            approve_edits: default_true(),
            approve_shell: default_true(),
            allowlist: default_allowlist(),
            denied_secret_paths: default_denied_secret_paths(),
        }
    }
}
