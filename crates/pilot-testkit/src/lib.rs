use anyhow::Result;
use pilot_core::{AppConfig, Session, TokenUsage, ToolCall};
use pilot_engine::{QueryOutcome, ReactEngine};
use pilot_llm::{ChatRequest, LlmClient, LlmError, LlmResponse};
use pilot_policy::{PolicyEngine, StaticApprovalManager};
use pilot_tools::ToolRegistry;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Offline stand-in for the chat endpoint: pops one canned response per
/// call, errors when the script runs dry.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<LlmResponse>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    pub fn text(content: &str) -> LlmResponse {
        LlmResponse {
            content: content.to_string(),
            tool_calls: vec![],
            finish_reason: "stop".to_string(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> LlmResponse {
        LlmResponse {
            content: String::new(),
            tool_calls: calls,
            finish_reason: "tool_calls".to_string(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
        }
    }
}

impl LlmClient for ScriptedLlm {
    fn complete_chat(&self, _req: &ChatRequest) -> Result<LlmResponse, LlmError> {
        self.responses
            .lock()
            .map_err(|_| LlmError::Transport("script mutex poisoned".to_string()))?
            .pop_front()
            .ok_or(LlmError::Empty)
    }
}

/// Drives a full engine pass over a real workspace with the local tools
/// registered and every approval granted.
pub fn run_engine_smoke(
    workspace: &Path,
    script: Vec<LlmResponse>,
    query: &str,
) -> Result<(Session, QueryOutcome)> {
    let mut config = AppConfig::default();
    config.engine.poll_interval_ms = 5;
    let registry = ToolRegistry::with_local_tools(workspace, PolicyEngine::default());
    let engine = ReactEngine::new(
        config,
        Arc::new(ScriptedLlm::new(script)),
        Arc::new(registry),
        Arc::new(StaticApprovalManager::approving()),
    );
    let mut session = Session::new(workspace);
    let outcome = engine.process_query(&mut session, query)?;
    Ok((session, outcome))
}
