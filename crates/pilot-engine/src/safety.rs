use pilot_core::ToolCall;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

const WINDOW: usize = 10;
const REPEAT_THRESHOLD: usize = 3;

/// Sliding window over `(tool_name, arguments)` fingerprints. When the same
/// call repeats enough times inside the window, one steering notice is due;
/// the safety limit remains the hard stop.
pub struct DoomLoopTracker {
    recent: VecDeque<[u8; 32]>,
    warned: bool,
}

impl Default for DoomLoopTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DoomLoopTracker {
    pub fn new() -> Self {
        Self {
            recent: VecDeque::with_capacity(WINDOW),
            warned: false,
        }
    }

    /// Records a batch; true when a repeat pattern was just detected and no
    /// notice has been injected for it yet. A different call re-arms the
    /// notice, so a later, distinct loop in the same query warns again.
    pub fn observe_batch(&mut self, calls: &[ToolCall]) -> bool {
        let mut fired = false;
        for call in calls {
            let entry = fingerprint(call);
            if self.recent.back().is_some_and(|last| *last != entry) {
                self.warned = false;
            }
            if self.recent.len() == WINDOW {
                self.recent.pop_front();
            }
            self.recent.push_back(entry);
            let repeats = self.recent.iter().filter(|h| **h == entry).count();
            if repeats >= REPEAT_THRESHOLD && !self.warned {
                self.warned = true;
                fired = true;
            }
        }
        fired
    }
}

fn fingerprint(call: &ToolCall) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(call.name.as_bytes());
    hasher.update(call.arguments.to_string().as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "c".to_string(),
            name: name.to_string(),
            arguments: args,
        }
    }

    #[test]
    fn identical_repeats_trigger_one_notice() {
        let mut tracker = DoomLoopTracker::new();
        let repeat = call("fs.read", json!({"path": "a"}));
        assert!(!tracker.observe_batch(&[repeat.clone()]));
        assert!(!tracker.observe_batch(&[repeat.clone()]));
        assert!(tracker.observe_batch(&[repeat.clone()]));
        // Warn once, not on every subsequent repeat.
        assert!(!tracker.observe_batch(&[repeat]));
    }

    #[test]
    fn a_second_distinct_loop_warns_again() {
        let mut tracker = DoomLoopTracker::new();
        let first = call("fs.read", json!({"path": "a"}));
        for _ in 0..2 {
            assert!(!tracker.observe_batch(&[first.clone()]));
        }
        assert!(tracker.observe_batch(&[first]));
        // A different call re-arms the notice for the next loop.
        let second = call("shell.run", json!({"command": "cargo test"}));
        for _ in 0..2 {
            assert!(!tracker.observe_batch(&[second.clone()]));
        }
        assert!(tracker.observe_batch(&[second]));
    }

    #[test]
    fn distinct_arguments_do_not_trigger() {
        let mut tracker = DoomLoopTracker::new();
        for i in 0..10 {
            let distinct = call("fs.read", json!({"path": format!("file_{i}")}));
            assert!(!tracker.observe_batch(&[distinct]));
        }
    }
}
