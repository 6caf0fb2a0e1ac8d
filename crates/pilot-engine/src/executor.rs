use pilot_core::{
    ApprovalDecision, ApprovalManager, ApprovalRequest, CancellationToken, Message, Session,
    ToolCall, ToolOutcome,
};
use pilot_playbook::ObservedCall;
use pilot_tools::ToolRegistry;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

const DENIAL_RESULT: &str = "approval denied by the user";
const SKIP_AFTER_DENIAL: &str = "skipped: batch aborted after denial";
const SKIP_ON_INTERRUPT: &str = "skipped: interrupted before execution";
const INTERRUPTED_WHILE_RUNNING: &str = "interrupted while running";

#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub tool_call_id: String,
    pub args_summary: String,
    pub success: bool,
    pub duration_ms: u64,
}

/// What happened to one assistant batch. Every call id always ends up with a
/// matching tool message, whatever the path taken.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub records: Vec<ToolCallRecord>,
    pub observed: Vec<ObservedCall>,
    pub all_read_only: bool,
    pub denied: bool,
    /// Name of the operation whose approval was refused, when `denied`.
    pub denied_operation: Option<String>,
    pub interrupted: bool,
}

/// Two-phase batch execution: collect approvals for every mutating call
/// first, then run the approved batch strictly in the order the model
/// returned it. A single denial aborts the whole batch before anything runs.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    approvals: Arc<dyn ApprovalManager>,
    cancel: CancellationToken,
    poll_interval: Duration,
    auto_approved: HashSet<String>,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        approvals: Arc<dyn ApprovalManager>,
        cancel: CancellationToken,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            approvals,
            cancel,
            poll_interval,
            auto_approved: HashSet::new(),
        }
    }

    pub fn execute_batch(&mut self, session: &mut Session, calls: &[ToolCall]) -> BatchResult {
        // Phase 1: approvals. Nothing executes until every gated call in the
        // batch has been approved.
        for call in calls {
            if self.cancel.is_cancelled() {
                return self.skip_all(session, calls, SKIP_ON_INTERRUPT);
            }
            if !self.registry.policy().requires_approval(call)
                || self.auto_approved.contains(&call.name)
            {
                continue;
            }
            let request = ApprovalRequest {
                operation: call.name.clone(),
                preview: preview(call),
                allow_edit: true,
                timeout: None,
            };
            // A broken approval channel reads as a denial, never as consent.
            let decision = self
                .approvals
                .request_approval(&request)
                .unwrap_or_else(|_| ApprovalDecision::deny());
            if !decision.approved {
                return self.deny_batch(session, calls, &call.id);
            }
            if decision.auto_approve_scope {
                self.auto_approved.insert(call.name.clone());
            }
        }

        // Phase 2: execution, fixed order, no parallelism.
        let mut result = BatchResult {
            all_read_only: calls
                .iter()
                .all(|call| self.registry.is_read_only(&call.name)),
            ..BatchResult::default()
        };
        for (idx, call) in calls.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.skip_remaining(session, &calls[idx..], &mut result);
                result.interrupted = true;
                return result;
            }
            let started = Instant::now();
            let (outcome, interrupted_during) = self.supervised_execute(call);
            session.push_message(Message::tool(&call.id, outcome.render()));
            result.records.push(ToolCallRecord {
                tool_name: call.name.clone(),
                tool_call_id: call.id.clone(),
                args_summary: preview(call),
                success: outcome.success,
                duration_ms: started.elapsed().as_millis() as u64,
            });
            result.observed.push(ObservedCall {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                success: outcome.success,
                output: outcome.output.clone(),
            });
            if interrupted_during {
                self.skip_remaining(session, &calls[idx + 1..], &mut result);
                result.interrupted = true;
                return result;
            }
        }
        result
    }

    /// Runs one tool on a worker thread, polling the interrupt flag while it
    /// is outstanding. On cancellation the worker is abandoned and the call
    /// is recorded as interrupted; already-produced results are kept.
    fn supervised_execute(&self, call: &ToolCall) -> (ToolOutcome, bool) {
        let (tx, rx) = mpsc::channel();
        let registry = Arc::clone(&self.registry);
        let call = call.clone();
        thread::spawn(move || {
            let _ = tx.send(registry.execute(&call.name, &call.arguments));
        });
        loop {
            match rx.recv_timeout(self.poll_interval) {
                Ok(outcome) => return (outcome, false),
                Err(RecvTimeoutError::Timeout) => {
                    if self.cancel.is_cancelled() {
                        return (ToolOutcome::err(INTERRUPTED_WHILE_RUNNING), true);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return (ToolOutcome::err("tool worker disappeared"), false);
                }
            }
        }
    }

    fn deny_batch(
        &self,
        session: &mut Session,
        calls: &[ToolCall],
        denied_id: &str,
    ) -> BatchResult {
        let mut result = BatchResult {
            denied: true,
            denied_operation: calls
                .iter()
                .find(|call| call.id == denied_id)
                .map(|call| call.name.clone()),
            ..BatchResult::default()
        };
        for call in calls {
            let content = if call.id == denied_id {
                DENIAL_RESULT
            } else {
                SKIP_AFTER_DENIAL
            };
            session.push_message(Message::tool(&call.id, content));
            result.records.push(ToolCallRecord {
                tool_name: call.name.clone(),
                tool_call_id: call.id.clone(),
                args_summary: preview(call),
                success: false,
                duration_ms: 0,
            });
        }
        result
    }

    fn skip_all(&self, session: &mut Session, calls: &[ToolCall], reason: &str) -> BatchResult {
        let mut result = BatchResult {
            interrupted: true,
            ..BatchResult::default()
        };
        for call in calls {
            session.push_message(Message::tool(&call.id, reason));
            result.records.push(ToolCallRecord {
                tool_name: call.name.clone(),
                tool_call_id: call.id.clone(),
                args_summary: preview(call),
                success: false,
                duration_ms: 0,
            });
        }
        result
    }

    fn skip_remaining(
        &self,
        session: &mut Session,
        remaining: &[ToolCall],
        result: &mut BatchResult,
    ) {
        for call in remaining {
            session.push_message(Message::tool(&call.id, SKIP_ON_INTERRUPT));
            result.records.push(ToolCallRecord {
                tool_name: call.name.clone(),
                tool_call_id: call.id.clone(),
                args_summary: preview(call),
                success: false,
                duration_ms: 0,
            });
        }
    }
}

fn preview(call: &ToolCall) -> String {
    let compact = call.arguments.to_string();
    let args = if compact.len() > 160 {
        format!("{}...", &compact[..compact.floor_char_boundary(160)])
    } else {
        compact
    };
    format!("{}({args})", call.name)
}
