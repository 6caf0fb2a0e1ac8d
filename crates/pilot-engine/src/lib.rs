use anyhow::{Result, anyhow};
use chrono::Utc;
use pilot_context::{ContextCompactor, ContextMonitor};
use pilot_core::{
    AppConfig, ApprovalManager, CancellationToken, EventCallback, EventEnvelope, EventKind,
    Message, Role, Session, TokenUsage,
};
use pilot_llm::{ChatRequest, LlmClient, LlmResponse, ToolChoice};
use pilot_playbook::Reflector;
use pilot_tools::ToolRegistry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

mod executor;
mod safety;

pub use executor::{BatchResult, ToolCallRecord, ToolExecutor};
pub use safety::DoomLoopTracker;

const SYSTEM_PROMPT: &str = "You are a coding agent working in the user's workspace. \
Use the available tools to inspect and modify the project; prefer reading before editing. \
When the task is complete, answer without requesting further tools.";

const READ_NUDGE: &str = "You have made several consecutive rounds of read-only tool calls. \
Summarize what you have learned and either conclude or take a concrete next step.";

const DOOM_LOOP_NOTICE: &str = "You are repeating the same tool call with the same arguments. \
Change approach instead of retrying.";

const SAFETY_LIMIT_PROMPT: &str = "The iteration limit for this task has been reached. \
Summarize what was accomplished, what remains, and any recommended next steps. Do not request tools.";

/// How one query ended. `SafetyLimitHit` and `Interrupted` are deliberate
/// terminal outcomes, never folded into `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Done,
    Interrupted,
    SafetyLimitHit,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Done => "done",
            QueryStatus::Interrupted => "interrupted",
            QueryStatus::SafetyLimitHit => "safety_limit_hit",
        }
    }
}

#[derive(Debug)]
pub struct QueryOutcome {
    pub status: QueryStatus,
    pub response: String,
    pub iterations: u32,
    pub tool_calls: Vec<ToolCallRecord>,
    pub usage: TokenUsage,
}

/// The reason→act→observe loop driving one user query to completion or
/// controlled termination. Borrows the session exclusively for the duration
/// of the query; callers serialize queries per session.
pub struct ReactEngine {
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    approvals: Arc<dyn ApprovalManager>,
    monitor: ContextMonitor,
    compactor: ContextCompactor,
    reflector: Reflector,
    cancel: CancellationToken,
    events: Option<EventCallback>,
    seq_no: AtomicU64,
}

impl ReactEngine {
    pub fn new(
        config: AppConfig,
        llm: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        approvals: Arc<dyn ApprovalManager>,
    ) -> Self {
        let monitor = ContextMonitor::new(&config.context);
        let compactor = ContextCompactor::new(&config.context, Some(Arc::clone(&llm)));
        let reflector = Reflector::new(
            config.reflector.min_tool_calls,
            config.reflector.min_confidence,
        );
        Self {
            config,
            llm,
            registry,
            approvals,
            monitor,
            compactor,
            reflector,
            cancel: CancellationToken::new(),
            events: None,
            seq_no: AtomicU64::new(0),
        }
    }

    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        self.events = Some(callback);
        self
    }

    /// Use a caller-owned interrupt flag, e.g. one already wired to SIGINT.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Shared interrupt flag; wire this into signal handlers or a UI.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn process_query(&self, session: &mut Session, query: &str) -> Result<QueryOutcome> {
        self.emit(
            session.id,
            EventKind::QueryStartedV1 {
                query: query.to_string(),
            },
        );
        self.refresh_system_prompt(session, query);
        session.push_message(Message::user(query));

        let poll = Duration::from_millis(self.config.engine.poll_interval_ms);
        let mut executor = ToolExecutor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.approvals),
            self.cancel.clone(),
            poll,
        );
        let mut doom = DoomLoopTracker::new();
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut usage = TokenUsage::default();
        let mut consecutive_reads: u32 = 0;
        let safety_limit = self.config.engine.safety_limit;

        for iteration in 1..=safety_limit {
            self.emit(session.id, EventKind::IterationStartedV1 { iteration });

            if iteration > 1 && self.monitor.needs_compaction(&session.messages) {
                self.compact_session(session);
            }

            if self.cancel.is_cancelled() {
                return Ok(self.finish(
                    session,
                    QueryStatus::Interrupted,
                    String::new(),
                    iteration,
                    records,
                    usage,
                ));
            }

            let request = ChatRequest {
                messages: session.messages.clone(),
                tools: self.registry.definitions(),
                tool_choice: ToolChoice::Auto,
                max_tokens: self.config.llm.max_tokens,
                temperature: self.config.llm.temperature,
            };
            let response = match self.supervised_completion(&request)? {
                Some(response) => response,
                None => {
                    // Cancelled while the call was outstanding; nothing was
                    // appended, so the message list is already well-formed.
                    return Ok(self.finish(
                        session,
                        QueryStatus::Interrupted,
                        String::new(),
                        iteration,
                        records,
                        usage,
                    ));
                }
            };
            usage.add(&response.usage);
            session.usage.add(&response.usage);

            if self.cancel.is_cancelled() {
                // Stop before committing to the batch; keep the text only.
                if !response.content.is_empty() {
                    session.push_message(Message::assistant(&response.content));
                }
                return Ok(self.finish(
                    session,
                    QueryStatus::Interrupted,
                    response.content,
                    iteration,
                    records,
                    usage,
                ));
            }

            if response.tool_calls.is_empty() {
                session.push_message(Message::assistant(&response.content));
                return Ok(self.finish(
                    session,
                    QueryStatus::Done,
                    response.content,
                    iteration,
                    records,
                    usage,
                ));
            }

            for call in &response.tool_calls {
                self.emit(
                    session.id,
                    EventKind::ToolProposedV1 {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                    },
                );
            }
            session.push_message(Message::assistant_with_tools(
                &response.content,
                response.tool_calls.clone(),
            ));

            let batch = executor.execute_batch(session, &response.tool_calls);
            for record in &batch.records {
                self.emit(
                    session.id,
                    EventKind::ToolResultV1 {
                        call_id: record.tool_call_id.clone(),
                        name: record.tool_name.clone(),
                        success: record.success,
                    },
                );
            }
            if let Some(name) = &batch.denied_operation {
                self.emit(session.id, EventKind::ApprovalDeniedV1 { name: name.clone() });
            }
            records.extend(batch.records.iter().cloned());

            if batch.interrupted {
                return Ok(self.finish(
                    session,
                    QueryStatus::Interrupted,
                    response.content,
                    iteration,
                    records,
                    usage,
                ));
            }

            if batch.all_read_only {
                consecutive_reads += 1;
            } else {
                consecutive_reads = 0;
            }
            if consecutive_reads >= self.config.engine.consecutive_read_nudge_threshold {
                self.emit(session.id, EventKind::NudgeInjectedV1 { consecutive_reads });
                session.push_message(Message::user(READ_NUDGE));
                consecutive_reads = 0;
            }

            if doom.observe_batch(&response.tool_calls) {
                session.push_message(Message::user(DOOM_LOOP_NOTICE));
            }

            // Best-effort; a reflection problem never aborts the loop.
            self.reflect_into_playbook(session, query, &batch);
        }

        let response = self.safety_limit_summary(session);
        session.push_message(Message::assistant(&response));
        Ok(self.finish(
            session,
            QueryStatus::SafetyLimitHit,
            response,
            safety_limit,
            records,
            usage,
        ))
    }

    /// System prompt carries the playbook rendering; it is rebuilt per query
    /// because the playbook evolves between queries.
    fn refresh_system_prompt(&self, session: &mut Session, query: &str) {
        let playbook_context = session.playbook.as_context(
            query,
            self.config.playbook.max_strategies,
            true,
            &self.config.selector.weights(),
        );
        let mut content = SYSTEM_PROMPT.to_string();
        if !playbook_context.is_empty() {
            content.push_str("\n\nStrategies learned from previous work:\n");
            content.push_str(&playbook_context);
        }
        match session.messages.first_mut() {
            Some(first) if first.role == Role::System => first.content = content,
            _ => session.messages.insert(0, Message::system(content)),
        }
        session.updated_at = Utc::now();
    }

    fn compact_session(&self, session: &mut Session) {
        let before = self.monitor.count_tokens(&session.messages);
        // Compaction is advisory; on failure the query proceeds with the
        // full history.
        let Ok(compacted) = self.compactor.compact(&session.messages) else {
            return;
        };
        session.messages = compacted;
        session.updated_at = Utc::now();
        let after = self.monitor.count_tokens(&session.messages);
        self.emit(
            session.id,
            EventKind::ContextCompactedV1 {
                before_tokens: before,
                after_tokens: after,
            },
        );
    }

    /// Runs the blocking model call on a worker thread, polling the interrupt
    /// flag. `Ok(None)` means cancelled; the abandoned worker finishes into a
    /// dead channel.
    fn supervised_completion(&self, request: &ChatRequest) -> Result<Option<LlmResponse>> {
        let (tx, rx) = mpsc::channel();
        let llm = Arc::clone(&self.llm);
        let request = request.clone();
        thread::spawn(move || {
            let _ = tx.send(llm.complete_chat(&request));
        });
        let poll = Duration::from_millis(self.config.engine.poll_interval_ms);
        loop {
            match rx.recv_timeout(poll) {
                Ok(result) => return result.map(Some).map_err(anyhow::Error::from),
                Err(RecvTimeoutError::Timeout) => {
                    if self.cancel.is_cancelled() {
                        return Ok(None);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("model call worker disappeared"));
                }
            }
        }
    }

    fn reflect_into_playbook(&self, session: &mut Session, query: &str, batch: &BatchResult) {
        let success = !batch.observed.is_empty() && batch.observed.iter().all(|c| c.success);
        let Some(candidate) = self.reflector.reflect(query, &batch.observed, success) else {
            return;
        };
        if session
            .playbook
            .has_content(candidate.category, &candidate.content)
        {
            return;
        }
        let id = session
            .playbook
            .add_strategy(candidate.category, candidate.content)
            .id
            .clone();
        self.emit(
            session.id,
            EventKind::StrategyLearnedV1 {
                id,
                category: candidate.category.to_string(),
            },
        );
    }

    /// One last completion with tools disabled so the user gets a coherent
    /// stopping point; any failure degrades to a fixed notice.
    fn safety_limit_summary(&self, session: &Session) -> String {
        let mut messages = session.messages.clone();
        messages.push(Message::user(SAFETY_LIMIT_PROMPT));
        let request = ChatRequest {
            messages,
            tools: vec![],
            tool_choice: ToolChoice::None,
            max_tokens: self.config.llm.max_tokens,
            temperature: self.config.llm.temperature,
        };
        match self.supervised_completion(&request) {
            Ok(Some(response)) if !response.content.is_empty() => response.content,
            _ => "Stopped at the iteration limit before the task completed.".to_string(),
        }
    }

    fn finish(
        &self,
        session: &Session,
        status: QueryStatus,
        response: String,
        iterations: u32,
        tool_calls: Vec<ToolCallRecord>,
        usage: TokenUsage,
    ) -> QueryOutcome {
        self.emit(
            session.id,
            EventKind::QueryFinishedV1 {
                status: status.as_str().to_string(),
                iterations,
            },
        );
        QueryOutcome {
            status,
            response,
            iterations,
            tool_calls,
            usage,
        }
    }

    fn emit(&self, session_id: Uuid, kind: EventKind) {
        if let Some(callback) = &self.events {
            let envelope = EventEnvelope {
                seq_no: self.seq_no.fetch_add(1, Ordering::SeqCst),
                at: Utc::now(),
                session_id,
                kind,
            };
            callback(&envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_core::{ToolCall, ToolDefinition};
    use pilot_llm::LlmError;
    use pilot_policy::{PolicyEngine, StaticApprovalManager};
    use pilot_tools::ToolHandler;
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedLlm {
        responses: Mutex<VecDeque<LlmResponse>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<LlmResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    impl LlmClient for ScriptedLlm {
        fn complete_chat(&self, _req: &ChatRequest) -> Result<LlmResponse, LlmError> {
            self.responses
                .lock()
                .expect("lock")
                .pop_front()
                .ok_or(LlmError::Empty)
        }
    }

    fn text_response(content: &str) -> LlmResponse {
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

    fn tool_response(calls: Vec<(&str, &str, Value)>) -> LlmResponse {
        LlmResponse {
            content: String::new(),
            tool_calls: calls
                .into_iter()
                .map(|(id, name, arguments)| ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments,
                })
                .collect(),
            finish_reason: "tool_calls".to_string(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
        }
    }

    /// Registerable stub: fixed output, optional cancellation side effect.
    struct StubTool {
        name: &'static str,
        read_only: bool,
        output: &'static str,
        cancel_on_run: Option<CancellationToken>,
    }

    impl StubTool {
        fn boxed(name: &'static str, read_only: bool, output: &'static str) -> Box<Self> {
            Box::new(Self {
                name,
                read_only,
                output,
                cancel_on_run: None,
            })
        }
    }

    impl ToolHandler for StubTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::function(self.name, "stub", json!({"type": "object"}))
        }

        fn read_only(&self) -> bool {
            self.read_only
        }

        fn run(
            &self,
            _workspace: &std::path::Path,
            _policy: &PolicyEngine,
            _arguments: &Value,
        ) -> Result<String> {
            if let Some(token) = &self.cancel_on_run {
                token.cancel();
            }
            Ok(self.output.to_string())
        }
    }

    fn engine_with(
        llm: Arc<dyn LlmClient>,
        registry: ToolRegistry,
        approvals: Arc<dyn ApprovalManager>,
        tune: impl FnOnce(&mut AppConfig),
    ) -> ReactEngine {
        let mut config = AppConfig::default();
        config.engine.poll_interval_ms = 5;
        tune(&mut config);
        ReactEngine::new(config, llm, Arc::new(registry), approvals)
    }

    fn stub_registry(dir: &std::path::Path) -> ToolRegistry {
        let mut registry = ToolRegistry::new(dir, PolicyEngine::default());
        registry.register(StubTool::boxed("fs.list", true, "src/\nREADME.md"));
        registry.register(StubTool::boxed("fs.read", true, "fn main() {}"));
        registry.register(StubTool::boxed("fs.write", false, "wrote"));
        registry
    }

    #[test]
    fn completes_without_tool_calls() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(vec![text_response("all done")]);
        let engine = engine_with(
            llm,
            stub_registry(dir.path()),
            Arc::new(StaticApprovalManager::approving()),
            |_| {},
        );
        let mut session = Session::new(dir.path());
        let outcome = engine.process_query(&mut session, "say hi").unwrap();
        assert_eq!(outcome.status, QueryStatus::Done);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.response, "all done");
        assert_eq!(session.messages.last().unwrap().role, Role::Assistant);
        assert_eq!(outcome.usage.total(), 15);
    }

    #[test]
    fn tool_results_feed_the_next_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![("c1", "fs.list", json!({"path": "."}))]),
            text_response("found it"),
        ]);
        let engine = engine_with(
            llm,
            stub_registry(dir.path()),
            Arc::new(StaticApprovalManager::approving()),
            |_| {},
        );
        let mut session = Session::new(dir.path());
        let outcome = engine.process_query(&mut session, "look around").unwrap();
        assert_eq!(outcome.status, QueryStatus::Done);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tool_calls.len(), 1);
        let tool_message = session
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert_eq!(tool_message.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(tool_message.content, "src/\nREADME.md");
    }

    #[test]
    fn safety_limit_forces_a_distinct_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let mut responses: Vec<LlmResponse> = (0..3)
            .map(|i| tool_response(vec![("c1", "fs.list", json!({"path": format!("dir_{i}")}))]))
            .collect();
        responses.push(text_response("ran out of budget"));
        let llm = ScriptedLlm::new(responses);
        let engine = engine_with(
            llm,
            stub_registry(dir.path()),
            Arc::new(StaticApprovalManager::approving()),
            |config| config.engine.safety_limit = 3,
        );
        let mut session = Session::new(dir.path());
        let outcome = engine.process_query(&mut session, "loop forever").unwrap();
        assert_eq!(outcome.status, QueryStatus::SafetyLimitHit);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.response, "ran out of budget");
        assert_eq!(session.messages.last().unwrap().content, "ran out of budget");
    }

    #[test]
    fn denied_batch_lets_the_model_react() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![
                ("c1", "fs.write", json!({"path": "a", "content": "x"})),
                ("c2", "fs.read", json!({"path": "a"})),
            ]),
            text_response("understood, stopping"),
        ]);
        let registry = stub_registry(dir.path());
        let engine = engine_with(
            llm,
            registry,
            Arc::new(StaticApprovalManager::denying()),
            |_| {},
        );
        let mut session = Session::new(dir.path());
        let outcome = engine.process_query(&mut session, "edit something").unwrap();
        // The loop continued after the denial and finished normally.
        assert_eq!(outcome.status, QueryStatus::Done);
        let denials = session
            .messages
            .iter()
            .filter(|m| m.content.contains("approval denied"))
            .count();
        let skips = session
            .messages
            .iter()
            .filter(|m| m.content.contains("skipped: batch aborted"))
            .count();
        assert_eq!(denials, 1);
        assert_eq!(skips, 1);
    }

    #[test]
    fn interrupt_before_the_first_call_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(vec![text_response("never used")]);
        let engine = engine_with(
            llm,
            stub_registry(dir.path()),
            Arc::new(StaticApprovalManager::approving()),
            |_| {},
        );
        engine.cancellation_token().cancel();
        let mut session = Session::new(dir.path());
        let outcome = engine.process_query(&mut session, "anything").unwrap();
        assert_eq!(outcome.status, QueryStatus::Interrupted);
        // System + user only; no dangling assistant tool calls.
        assert!(session.messages.iter().all(|m| m.tool_calls.is_empty()));
    }

    #[test]
    fn interrupt_mid_batch_keeps_partial_results_and_stays_well_formed() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(vec![tool_response(vec![
            ("c1", "fs.list", json!({"path": "."})),
            ("c2", "fs.read", json!({"path": "a"})),
        ])]);
        // The first tool trips the interrupt flag while it runs, so the
        // second call in the batch must be skipped.
        let token = CancellationToken::new();
        let mut registry = ToolRegistry::new(dir.path(), PolicyEngine::default());
        registry.register(Box::new(StubTool {
            name: "fs.list",
            read_only: true,
            output: "src/",
            cancel_on_run: Some(token.clone()),
        }));
        registry.register(StubTool::boxed("fs.read", true, "contents"));
        let engine = engine_with(
            llm,
            registry,
            Arc::new(StaticApprovalManager::approving()),
            |_| {},
        )
        .with_cancellation_token(token);
        let mut session = Session::new(dir.path());
        let outcome = engine.process_query(&mut session, "inspect").unwrap();
        assert_eq!(outcome.status, QueryStatus::Interrupted);
        // Every tool call id has a matching tool message.
        let assistant = session
            .messages
            .iter()
            .find(|m| !m.tool_calls.is_empty())
            .unwrap();
        for call in &assistant.tool_calls {
            assert!(
                session
                    .messages
                    .iter()
                    .any(|m| m.tool_call_id.as_deref() == Some(call.id.as_str()))
            );
        }
    }

    #[test]
    fn consecutive_read_only_batches_inject_a_nudge() {
        let dir = tempfile::tempdir().unwrap();
        let mut responses: Vec<LlmResponse> = (0..5)
            .map(|i| tool_response(vec![("c1", "fs.read", json!({"path": format!("f_{i}")}))]))
            .collect();
        responses.push(text_response("summary"));
        let llm = ScriptedLlm::new(responses);
        let engine = engine_with(
            llm,
            stub_registry(dir.path()),
            Arc::new(StaticApprovalManager::approving()),
            |_| {},
        );
        let mut session = Session::new(dir.path());
        let outcome = engine.process_query(&mut session, "read everything").unwrap();
        assert_eq!(outcome.status, QueryStatus::Done);
        let nudges = session
            .messages
            .iter()
            .filter(|m| m.role == Role::User && m.content == READ_NUDGE)
            .count();
        assert_eq!(nudges, 1);
        // The nudge landed after the fifth read-only batch, before the final
        // model call.
        let nudge_pos = session
            .messages
            .iter()
            .position(|m| m.content == READ_NUDGE)
            .unwrap();
        assert_eq!(nudge_pos, session.messages.len() - 2);
    }

    #[test]
    fn successful_sequences_are_reflected_into_the_playbook() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![
                ("c1", "fs.list", json!({"path": "."})),
                ("c2", "fs.read", json!({"path": "README.md"})),
            ]),
            text_response("done"),
        ]);
        let engine = engine_with(
            llm,
            stub_registry(dir.path()),
            Arc::new(StaticApprovalManager::approving()),
            |_| {},
        );
        let mut session = Session::new(dir.path());
        engine.process_query(&mut session, "check the test file").unwrap();
        assert_eq!(session.playbook.len(), 1);
        let strategy = session.playbook.strategies.values().next().unwrap();
        assert_eq!(strategy.category.as_str(), "file_operations");
        assert!(strategy.id.starts_with("fil-"));
    }

    #[test]
    fn learned_strategies_appear_in_the_next_system_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(vec![text_response("ok")]);
        let engine = engine_with(
            llm,
            stub_registry(dir.path()),
            Arc::new(StaticApprovalManager::approving()),
            |_| {},
        );
        let mut session = Session::new(dir.path());
        session
            .playbook
            .add_strategy(pilot_playbook::StrategyCategory::Testing, "run the suite");
        engine.process_query(&mut session, "next task").unwrap();
        let system = &session.messages[0];
        assert_eq!(system.role, Role::System);
        assert!(system.content.contains("run the suite"));
        assert!(system.content.contains("## testing"));
    }

    #[test]
    fn usage_accumulates_across_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![("c1", "fs.list", json!({"path": "."}))]),
            text_response("done"),
        ]);
        let engine = engine_with(
            llm,
            stub_registry(dir.path()),
            Arc::new(StaticApprovalManager::approving()),
            |_| {},
        );
        let mut session = Session::new(dir.path());
        let outcome = engine.process_query(&mut session, "go").unwrap();
        assert_eq!(outcome.usage.prompt_tokens, 20);
        assert_eq!(outcome.usage.completion_tokens, 10);
        assert_eq!(session.usage.total(), 30);
    }

    #[test]
    fn repeated_identical_calls_get_a_steering_notice() {
        let dir = tempfile::tempdir().unwrap();
        let mut responses: Vec<LlmResponse> = (0..3)
            .map(|_| tool_response(vec![("c", "fs.read", json!({"path": "same"}))]))
            .collect();
        responses.push(text_response("stopping"));
        let llm = ScriptedLlm::new(responses);
        let engine = engine_with(
            llm,
            stub_registry(dir.path()),
            Arc::new(StaticApprovalManager::approving()),
            |_| {},
        );
        let mut session = Session::new(dir.path());
        engine.process_query(&mut session, "retry loop").unwrap();
        assert!(session.messages.iter().any(|m| m.content == DOOM_LOOP_NOTICE));
    }
}
