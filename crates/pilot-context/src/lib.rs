use anyhow::{Result, anyhow};
use pilot_core::{ContextConfig, Message, Role, estimate_message_tokens};
use pilot_llm::{ChatRequest, LlmClient, ToolChoice};
use std::sync::Arc;

/// Template for LLM-based compaction; the model fills in the sections.
const COMPACTION_TEMPLATE: &str = "Summarize this conversation into the following sections. \
Be precise and factual — include file paths, function names, and error messages. \
Keep each section to 2-5 bullet points. Output ONLY the filled template:\n\n\
## Goal\n(What the user asked for)\n\n\
## Completed\n(What was done successfully — include file paths)\n\n\
## In Progress\n(What's partially done or pending)\n\n\
## Key Facts\n(Paths discussed, decisions made, corrections given)\n\n\
## Modified Files\n(Files created, edited, or deleted)";

const SUMMARY_MARKER: &str = "[Earlier conversation summarized]";

pub trait TokenEstimator: Send + Sync {
    fn count(&self, messages: &[Message]) -> u64;
}

/// Default estimator: roughly four characters per token.
pub struct CharEstimator;

impl TokenEstimator for CharEstimator {
    fn count(&self, messages: &[Message]) -> u64 {
        estimate_message_tokens(messages)
    }
}

/// Decides, every iteration, whether the conversation has grown close enough
/// to the context window to warrant compaction. Pure and cheap.
pub struct ContextMonitor {
    estimator: Box<dyn TokenEstimator>,
    limit: u64,
    threshold_fraction: f64,
}

impl ContextMonitor {
    pub fn new(cfg: &ContextConfig) -> Self {
        Self::with_estimator(cfg, Box::new(CharEstimator))
    }

    pub fn with_estimator(cfg: &ContextConfig, estimator: Box<dyn TokenEstimator>) -> Self {
        Self {
            estimator,
            limit: cfg.context_window_tokens,
            threshold_fraction: cfg.compaction_threshold_fraction,
        }
    }

    pub fn count_tokens(&self, messages: &[Message]) -> u64 {
        self.estimator.count(messages)
    }

    pub fn needs_compaction(&self, messages: &[Message]) -> bool {
        needs_compaction(self.count_tokens(messages), self.limit, self.threshold_fraction)
    }
}

pub fn needs_compaction(total: u64, limit: u64, threshold_fraction: f64) -> bool {
    total as f64 >= limit as f64 * threshold_fraction
}

/// Rewrites a message list into a smaller one: system messages and the tail
/// from the last user request survive verbatim, the middle is replaced by a
/// summary. LLM summarization falls back to code-based extraction.
pub struct ContextCompactor {
    llm: Option<Arc<dyn LlmClient>>,
    keep_recent: usize,
}

impl ContextCompactor {
    pub fn new(cfg: &ContextConfig, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            llm,
            keep_recent: cfg.keep_recent_messages,
        }
    }

    /// Never increases the token count; compacting an already-compact list
    /// is a no-op, not an error.
    pub fn compact(&self, messages: &[Message]) -> Result<Vec<Message>> {
        let tail_start = self.tail_start(messages);
        let middle: Vec<&Message> = messages[..tail_start]
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();
        if middle.is_empty() {
            return Ok(messages.to_vec());
        }

        let summary = match &self.llm {
            Some(llm) => summarize_with_llm(llm.as_ref(), &middle)
                .unwrap_or_else(|_| fallback_summary(&middle)),
            None => fallback_summary(&middle),
        };

        let mut compacted: Vec<Message> = messages[..tail_start]
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();
        compacted.push(Message::user(format!("{SUMMARY_MARKER}\n{summary}")));
        compacted.extend_from_slice(&messages[tail_start..]);

        if estimate_message_tokens(&compacted) >= estimate_message_tokens(messages) {
            // The summary did not pay for itself; keep the original.
            return Ok(messages.to_vec());
        }
        Ok(compacted)
    }

    /// First index of the verbatim tail: at least the last user message and
    /// everything after it, widened so a tool result is never separated from
    /// the assistant message that requested it.
    fn tail_start(&self, messages: &[Message]) -> usize {
        let last_user = messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(0);
        let mut start = last_user.min(messages.len().saturating_sub(self.keep_recent));
        while start > 0 && messages[start].role == Role::Tool {
            start -= 1;
        }
        start
    }
}

fn summarize_with_llm(llm: &dyn LlmClient, middle: &[&Message]) -> Result<String> {
    let mut conversation = String::new();
    for message in middle {
        let label = match message.role {
            Role::System => "SYSTEM",
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
            Role::Tool => "TOOL_RESULT",
        };
        if !message.content.is_empty() {
            conversation.push_str(&format!("{label}: {}\n", truncate_line(&message.content, 500)));
        }
        for call in &message.tool_calls {
            conversation.push_str(&format!(
                "TOOL_CALL: {}({})\n",
                call.name,
                truncate_line(&call.arguments.to_string(), 200)
            ));
        }
    }
    if conversation.len() < 200 {
        return Err(anyhow!("conversation too short for LLM compaction"));
    }

    let request = ChatRequest {
        messages: vec![
            Message::system(COMPACTION_TEMPLATE),
            Message::user(conversation),
        ],
        tools: vec![],
        tool_choice: ToolChoice::None,
        max_tokens: 2048,
        temperature: 0.0,
    };
    let response = llm.complete_chat(&request)?;
    let text = response.content.trim().to_string();
    if text.len() > 50 {
        Ok(text)
    } else {
        Err(anyhow!("LLM compaction produced an empty summary"))
    }
}

/// Code-based summary of the dropped middle: files touched, errors seen,
/// tool usage counts. Used when no LLM is available or the call fails.
fn fallback_summary(middle: &[&Message]) -> String {
    let mut files_read: Vec<String> = Vec::new();
    let mut files_modified: Vec<String> = Vec::new();
    let mut tools_used: Vec<String> = Vec::new();
    let mut errors_hit: Vec<String> = Vec::new();

    for message in middle {
        match message.role {
            Role::Assistant => {
                for call in &message.tool_calls {
                    tools_used.push(call.name.clone());
                    if let Some(path) = call
                        .arguments
                        .get("path")
                        .or_else(|| call.arguments.get("file_path"))
                        .and_then(|v| v.as_str())
                    {
                        if call.name.contains("read")
                            || call.name.contains("list")
                            || call.name.contains("glob")
                            || call.name.contains("grep")
                        {
                            files_read.push(path.to_string());
                        } else {
                            files_modified.push(path.to_string());
                        }
                    }
                }
            }
            Role::Tool => {
                let lower = message.content.to_ascii_lowercase();
                if lower.contains("error") || lower.contains("failed") || lower.contains("not found")
                {
                    errors_hit.push(truncate_line(&message.content, 100));
                }
            }
            _ => {}
        }
    }

    files_read.sort();
    files_read.dedup();
    files_modified.sort();
    files_modified.dedup();

    let mut summary = String::new();
    if !files_modified.is_empty() {
        summary.push_str(&format!("Files modified: {}\n", files_modified.join(", ")));
    }
    if !files_read.is_empty() {
        summary.push_str(&format!("Files read: {}\n", files_read.join(", ")));
    }
    if !errors_hit.is_empty() {
        summary.push_str(&format!("Errors encountered: {}\n", errors_hit.join("; ")));
    }
    summary.push_str(&format!("Tools used: {}\n", count_tool_usage(&tools_used)));
    summary
}

fn truncate_line(text: &str, max_len: usize) -> String {
    let first_line = text.lines().next().unwrap_or(text);
    if first_line.len() <= max_len {
        first_line.to_string()
    } else {
        let safe_end = first_line.floor_char_boundary(max_len);
        format!("{}...", &first_line[..safe_end])
    }
}

fn count_tool_usage(tools: &[String]) -> String {
    let mut counts: std::collections::BTreeMap<&str, usize> = std::collections::BTreeMap::new();
    for name in tools {
        *counts.entry(name.as_str()).or_default() += 1;
    }
    if counts.is_empty() {
        return "none".to_string();
    }
    counts
        .iter()
        .map(|(name, count)| format!("{name}×{count}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_core::ToolCall;
    use serde_json::json;

    fn long_exchange() -> Vec<Message> {
        let mut messages = vec![Message::system("you are a coding agent")];
        for i in 0..20 {
            messages.push(Message::user(format!("step {i}: {}", "x".repeat(300))));
            let call = ToolCall {
                id: format!("call_{i}"),
                name: "fs.read".to_string(),
                arguments: json!({"path": format!("src/file_{i}.rs")}),
            };
            messages.push(Message::assistant_with_tools("looking", vec![call]));
            messages.push(Message::tool(format!("call_{i}"), "y".repeat(400)));
        }
        messages.push(Message::user("final question"));
        messages
    }

    #[test]
    fn monitor_flags_compaction_at_the_threshold() {
        assert!(!needs_compaction(799, 1000, 0.8));
        assert!(needs_compaction(800, 1000, 0.8));
        assert!(needs_compaction(801, 1000, 0.8));
    }

    #[test]
    fn monitor_counts_through_the_pluggable_estimator() {
        struct Fixed;
        impl TokenEstimator for Fixed {
            fn count(&self, _messages: &[Message]) -> u64 {
                999
            }
        }
        let cfg = ContextConfig {
            context_window_tokens: 1000,
            compaction_threshold_fraction: 0.8,
            keep_recent_messages: 6,
        };
        let monitor = ContextMonitor::with_estimator(&cfg, Box::new(Fixed));
        assert_eq!(monitor.count_tokens(&[]), 999);
        assert!(monitor.needs_compaction(&[]));
    }

    #[test]
    fn compaction_never_increases_token_count() {
        let messages = long_exchange();
        let compactor = ContextCompactor::new(&ContextConfig::default(), None);
        let compacted = compactor.compact(&messages).unwrap();
        assert!(estimate_message_tokens(&compacted) <= estimate_message_tokens(&messages));
        assert!(compacted.len() < messages.len());
    }

    #[test]
    fn system_message_survives_compaction_unchanged() {
        let messages = long_exchange();
        let compactor = ContextCompactor::new(&ContextConfig::default(), None);
        let compacted = compactor.compact(&messages).unwrap();
        assert_eq!(compacted[0], messages[0]);
    }

    #[test]
    fn tail_from_last_user_message_is_preserved_verbatim() {
        let messages = long_exchange();
        let compactor = ContextCompactor::new(&ContextConfig::default(), None);
        let compacted = compactor.compact(&messages).unwrap();
        assert_eq!(
            compacted.last().unwrap().content,
            messages.last().unwrap().content
        );
    }

    #[test]
    fn compacting_a_compact_history_is_a_no_op() {
        let messages = vec![
            Message::system("sys"),
            Message::user("hello"),
            Message::assistant("hi"),
        ];
        let compactor = ContextCompactor::new(&ContextConfig::default(), None);
        let compacted = compactor.compact(&messages).unwrap();
        assert_eq!(compacted, messages);
    }

    #[test]
    fn tool_results_stay_with_their_assistant_message() {
        // Force a small keep_recent so the naive tail would start on a tool
        // message; the compactor must widen it to the assistant anchor.
        let mut messages = vec![Message::system("sys"), Message::user("go")];
        for i in 0..10 {
            messages.push(Message::user(format!("more {i}: {}", "x".repeat(200))));
        }
        let call = ToolCall {
            id: "call_a".to_string(),
            name: "fs.read".to_string(),
            arguments: json!({"path": "a"}),
        };
        messages.push(Message::assistant_with_tools("", vec![call]));
        messages.push(Message::tool("call_a", "z".repeat(300)));
        messages.push(Message::tool("call_a", "z".repeat(300)));
        let cfg = ContextConfig {
            keep_recent_messages: 2,
            ..ContextConfig::default()
        };
        let compactor = ContextCompactor::new(&cfg, None);
        let compacted = compactor.compact(&messages).unwrap();
        for (idx, message) in compacted.iter().enumerate() {
            if message.role == Role::Tool && idx > 0 {
                let anchored = compacted[..idx]
                    .iter()
                    .any(|m| m.tool_calls.iter().any(|c| Some(&c.id) == message.tool_call_id.as_ref()));
                assert!(anchored, "tool result without its assistant call");
            }
        }
    }

    #[test]
    fn fallback_summary_extracts_files_and_errors() {
        let call = ToolCall {
            id: "c".to_string(),
            name: "fs.edit".to_string(),
            arguments: json!({"path": "src/lib.rs"}),
        };
        let assistant = Message::assistant_with_tools("", vec![call]);
        let failure = Message::tool("c", "error: compile failed");
        let summary = fallback_summary(&[&assistant, &failure]);
        assert!(summary.contains("Files modified: src/lib.rs"));
        assert!(summary.contains("Errors encountered"));
        assert!(summary.contains("fs.edit×1"));
    }
}
