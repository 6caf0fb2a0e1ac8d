use crate::StrategyCategory;
use serde_json::Value;
use std::cmp::Ordering;

/// One executed tool call as seen by the reflector: name, arguments, whether
/// it succeeded, and (when cheap to carry) its output text.
#[derive(Debug, Clone)]
pub struct ObservedCall {
    pub name: String,
    pub arguments: Value,
    pub success: bool,
    pub output: Option<String>,
}

impl ObservedCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            success: true,
            output: None,
        }
    }

    fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

/// Candidate strategy extracted from a tool sequence. Ephemeral; promotion
/// into the playbook happens in the engine, not here.
#[derive(Debug, Clone, PartialEq)]
pub struct ReflectionResult {
    pub category: StrategyCategory,
    pub content: String,
    pub confidence: f64,
}

type Rule = fn(&[ObservedCall]) -> Option<ReflectionResult>;

// Ordered, pure pattern rules over the tool-name sequence. All rules run;
// the highest-confidence match wins. Extending the set never touches the
// engine.
const RULES: &[Rule] = &[
    list_then_read,
    search_then_read,
    edit_then_test,
    build_then_run,
    failure_then_diagnose,
];

/// Post-execution analysis that proposes a reusable strategy from a
/// successful tool-call sequence.
pub struct Reflector {
    min_tool_calls: usize,
    min_confidence: f64,
}

impl Default for Reflector {
    fn default() -> Self {
        Self::new(2, 0.65)
    }
}

impl Reflector {
    pub fn new(min_tool_calls: usize, min_confidence: f64) -> Self {
        Self {
            min_tool_calls,
            min_confidence,
        }
    }

    pub fn reflect(
        &self,
        _query: &str,
        calls: &[ObservedCall],
        success: bool,
    ) -> Option<ReflectionResult> {
        if !success || calls.len() < self.min_tool_calls {
            return None;
        }
        RULES
            .iter()
            .filter_map(|rule| rule(calls))
            .filter(|r| r.confidence >= self.min_confidence)
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(Ordering::Equal)
            })
    }
}

fn is_list(name: &str) -> bool {
    name.contains("list") || name.ends_with(".ls")
}

fn is_read(name: &str) -> bool {
    name.contains("read") || name.contains("view") || name.contains("open")
}

fn is_search(name: &str) -> bool {
    name.contains("search") || name.contains("grep") || name.contains("glob") || name.contains("find")
}

fn is_edit(name: &str) -> bool {
    name.contains("write") || name.contains("edit") || name.contains("patch")
}

fn is_shell(name: &str) -> bool {
    name.contains("shell") || name.contains("bash") || name.contains("run") || name.contains("exec")
}

fn command_of(call: &ObservedCall) -> Option<&str> {
    call.str_arg("command").or_else(|| call.str_arg("cmd"))
}

fn list_then_read(calls: &[ObservedCall]) -> Option<ReflectionResult> {
    for pair in calls.windows(2) {
        let (list, read) = (&pair[0], &pair[1]);
        if !(is_list(&list.name) && list.success && is_read(&read.name)) {
            continue;
        }
        // Reading a path that appeared in the listing is a stronger signal
        // than any list-then-read adjacency.
        let confirmed = match (read.str_arg("path"), &list.output) {
            (Some(path), Some(output)) => output.contains(path),
            _ => false,
        };
        return Some(ReflectionResult {
            category: StrategyCategory::FileOperations,
            content: "After listing a directory, read the specific entries you need before acting on them.".to_string(),
            confidence: if confirmed { 0.85 } else { 0.75 },
        });
    }
    None
}

fn search_then_read(calls: &[ObservedCall]) -> Option<ReflectionResult> {
    calls
        .windows(2)
        .any(|pair| is_search(&pair[0].name) && pair[0].success && is_read(&pair[1].name))
        .then(|| ReflectionResult {
            category: StrategyCategory::CodeNavigation,
            content: "Narrow down with a search first, then read only the matching files.".to_string(),
            confidence: 0.7,
        })
}

fn edit_then_test(calls: &[ObservedCall]) -> Option<ReflectionResult> {
    let edit_at = calls.iter().position(|c| is_edit(&c.name) && c.success)?;
    let tested = calls[edit_at + 1..].iter().any(|c| {
        c.name.contains("test")
            || command_of(c).is_some_and(|cmd| cmd.contains("test") || cmd.contains("pytest"))
    });
    tested.then(|| ReflectionResult {
        category: StrategyCategory::Testing,
        content: "After modifying code, run the test suite before moving on.".to_string(),
        confidence: 0.8,
    })
}

fn build_then_run(calls: &[ObservedCall]) -> Option<ReflectionResult> {
    let build_at = calls.iter().position(|c| {
        is_shell(&c.name)
            && c.success
            && command_of(c).is_some_and(|cmd| {
                cmd.contains("install") || cmd.contains("build") || cmd.contains("make")
            })
    })?;
    let ran = calls[build_at + 1..].iter().any(|c| {
        is_shell(&c.name)
            && command_of(c).is_some_and(|cmd| cmd.contains("run") || cmd.contains("start"))
    });
    ran.then(|| ReflectionResult {
        category: StrategyCategory::ShellCommands,
        content: "Install or build dependencies before running the project.".to_string(),
        confidence: 0.7,
    })
}

fn failure_then_diagnose(calls: &[ObservedCall]) -> Option<ReflectionResult> {
    calls
        .windows(2)
        .any(|pair| {
            !pair[0].success && (is_list(&pair[1].name) || is_search(&pair[1].name) || is_read(&pair[1].name))
        })
        .then(|| ReflectionResult {
            category: StrategyCategory::ErrorHandling,
            content: "When a call fails, inspect the surrounding files before retrying.".to_string(),
            confidence: 0.7,
        })
}
