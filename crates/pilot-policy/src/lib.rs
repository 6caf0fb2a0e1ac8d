use pilot_core::{
    ApprovalDecision, ApprovalManager, ApprovalRequest, PolicyConfig, Result, ToolCall,
};
use regex::Regex;
use std::io::{IsTerminal, Write};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum PolicyError {
    #[error("path traversal denied")]
    PathTraversal,
    #[error("secret path denied")]
    SecretPath,
    #[error("command is not allowlisted")]
    CommandNotAllowed,
}

/// Workspace safety rules: which paths and commands a tool may touch, which
/// tool calls need a human decision, and secret redaction for logged output.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    cfg: PolicyConfig,
    secret_regex: Regex,
}

impl PolicyEngine {
    pub fn new(cfg: PolicyConfig) -> Self {
        Self {
            cfg,
            secret_regex: Regex::new(r"(?i)(api[_-]?key|secret|token|password)\s*[:=]\s*[^\s]+")
                .expect("valid regex"),
        }
    }

    /// Workspace-relative paths only. An absolute path would make
    /// `workspace.join(path)` discard the workspace root entirely.
    pub fn check_path(&self, path: &str) -> std::result::Result<(), PolicyError> {
        if path.contains("..") || Path::new(path).is_absolute() {
            return Err(PolicyError::PathTraversal);
        }
        if self
            .cfg
            .denied_secret_paths
            .iter()
            .any(|needle| path.contains(needle.trim_matches('*')))
        {
            return Err(PolicyError::SecretPath);
        }
        Ok(())
    }

    /// Allowlist match on leading command tokens, so `cargo test` also
    /// admits `cargo test --workspace`.
    pub fn check_command(&self, cmd: &str) -> std::result::Result<(), PolicyError> {
        let cmd_tokens: Vec<&str> = cmd.split_whitespace().collect();
        if cmd_tokens.is_empty() {
            return Err(PolicyError::CommandNotAllowed);
        }
        for allowed in &self.cfg.allowlist {
            let allowed_tokens: Vec<&str> = allowed.split_whitespace().collect();
            if allowed_tokens.is_empty() {
                continue;
            }
            if cmd_tokens.len() >= allowed_tokens.len()
                && cmd_tokens[..allowed_tokens.len()] == allowed_tokens[..]
            {
                return Ok(());
            }
        }
        Err(PolicyError::CommandNotAllowed)
    }

    pub fn redact(&self, text: &str) -> String {
        self.secret_regex
            .replace_all(text, "$1=REDACTED")
            .to_string()
    }

    /// Only mutating operations are gated; reads never prompt.
    pub fn requires_approval(&self, call: &ToolCall) -> bool {
        match call.name.as_str() {
            "fs.write" | "fs.edit" => self.cfg.approve_edits,
            "shell.run" => {
                if !self.cfg.approve_shell {
                    return false;
                }
                // Allowlisted commands run without prompting.
                call.arguments
                    .get("command")
                    .and_then(|v| v.as_str())
                    .is_none_or(|cmd| self.check_command(cmd).is_err())
            }
            _ => false,
        }
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

/// Blocking stdin prompt: `y` approves once, `a` approves and widens the
/// auto-approve scope to the operation kind, anything else denies. A
/// non-interactive stdin denies by default.
pub struct TerminalApprovalManager;

impl ApprovalManager for TerminalApprovalManager {
    fn request_approval(&self, request: &ApprovalRequest) -> Result<ApprovalDecision> {
        let mut stdout = std::io::stdout();
        let stdin = std::io::stdin();
        if !stdin.is_terminal() || !stdout.is_terminal() {
            return Ok(ApprovalDecision::deny());
        }

        writeln!(stdout, "approval required for `{}`", request.operation)?;
        writeln!(stdout, "{}", request.preview)?;
        write!(stdout, "approve? [y/N/a(lways)]: ")?;
        stdout.flush()?;

        let mut input = String::new();
        stdin.read_line(&mut input)?;
        let normalized = input.trim().to_ascii_lowercase();
        Ok(match normalized.as_str() {
            "y" | "yes" => ApprovalDecision::approve(),
            "a" | "always" => ApprovalDecision {
                approved: true,
                auto_approve_scope: true,
            },
            _ => ApprovalDecision::deny(),
        })
    }
}

/// Fixed-answer manager for non-interactive runs and tests.
pub struct StaticApprovalManager {
    decision: ApprovalDecision,
}

impl StaticApprovalManager {
    pub fn approving() -> Self {
        Self {
            decision: ApprovalDecision::approve(),
        }
    }

    pub fn denying() -> Self {
        Self {
            decision: ApprovalDecision::deny(),
        }
    }
}

impl ApprovalManager for StaticApprovalManager {
    fn request_approval(&self, _request: &ApprovalRequest) -> Result<ApprovalDecision> {
        Ok(self.decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    #[test]
    fn denies_path_traversal_and_secret_paths() {
        let policy = PolicyEngine::default();
        assert!(matches!(
            policy.check_path("../outside"),
            Err(PolicyError::PathTraversal)
        ));
        assert!(matches!(
            policy.check_path("config/.env"),
            Err(PolicyError::SecretPath)
        ));
        assert!(policy.check_path("src/lib.rs").is_ok());
    }

    #[test]
    fn denies_absolute_paths() {
        let policy = PolicyEngine::default();
        assert!(matches!(
            policy.check_path("/etc/hostname"),
            Err(PolicyError::PathTraversal)
        ));
        assert!(matches!(
            policy.check_path("/"),
            Err(PolicyError::PathTraversal)
        ));
    }

    #[test]
    fn allowlist_checks_command_prefix_tokens() {
        let policy = PolicyEngine::default();
        assert!(policy.check_command("cargo test --workspace").is_ok());
        assert!(matches!(
            policy.check_command("rm -rf /"),
            Err(PolicyError::CommandNotAllowed)
        ));
        assert!(matches!(
            policy.check_command(""),
            Err(PolicyError::CommandNotAllowed)
        ));
    }

    #[test]
    fn redacts_common_secret_patterns() {
        let policy = PolicyEngine::default();
        let out = policy.redact("api_key=abcd1234 token: xyz password = hunter2");
        assert!(out.contains("api_key=REDACTED"));
        assert!(out.contains("token=REDACTED"));
        assert!(out.contains("password=REDACTED"));
    }

    #[test]
    fn reads_never_require_approval() {
        let policy = PolicyEngine::default();
        assert!(!policy.requires_approval(&call("fs.read", json!({"path": "a"}))));
        assert!(!policy.requires_approval(&call("fs.list", json!({"path": "."}))));
    }

    #[test]
    fn edits_and_unlisted_commands_require_approval() {
        let policy = PolicyEngine::default();
        assert!(policy.requires_approval(&call("fs.write", json!({"path": "a"}))));
        assert!(policy.requires_approval(&call("shell.run", json!({"command": "rm -rf /"}))));
        assert!(!policy.requires_approval(&call("shell.run", json!({"command": "git status"}))));
    }

    #[test]
    fn static_managers_answer_without_prompting() {
        let request = ApprovalRequest {
            operation: "fs.write".to_string(),
            preview: "write src/lib.rs".to_string(),
            allow_edit: true,
            timeout: None,
        };
        assert!(
            StaticApprovalManager::approving()
                .request_approval(&request)
                .unwrap()
                .approved
        );
        assert!(
            !StaticApprovalManager::denying()
                .request_approval(&request)
                .unwrap()
                .approved
        );
    }
}
