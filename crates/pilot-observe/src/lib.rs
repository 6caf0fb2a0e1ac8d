use anyhow::{Context, Result};
use chrono::Utc;
use pilot_core::{EventEnvelope, runtime_dir};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only run log plus an optional stderr mirror. Engine events arrive
/// as envelopes and are written as JSON lines; plain notes as text lines.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path, verbose: bool) -> Result<Self> {
        let dir = runtime_dir(workspace);
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            verbose,
        })
    }

    fn append(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("opening {}", self.log_path.display()))?;
        writeln!(file, "{} {line}", Utc::now().to_rfc3339())?;
        Ok(())
    }

    pub fn log(&self, message: &str) {
        if let Err(e) = self.append(message) {
            eprintln!("[pilot] log write failed: {e}");
        }
        self.verbose_log(message);
    }

    pub fn verbose_log(&self, message: &str) {
        if self.verbose {
            eprintln!("[pilot] {message}");
        }
    }

    pub fn warn_log(&self, message: &str) {
        eprintln!("[pilot] warning: {message}");
        let _ = self.append(&format!("warning: {message}"));
    }

    pub fn record_event(&self, event: &EventEnvelope) {
        match serde_json::to_string(event) {
            Ok(line) => {
                if let Err(e) = self.append(&line) {
                    eprintln!("[pilot] event write failed: {e}");
                }
            }
            Err(e) => eprintln!("[pilot] event serialize failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_core::EventKind;
    use uuid::Uuid;

    #[test]
    fn log_lines_are_appended_with_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let observer = Observer::new(dir.path(), false).unwrap();
        observer.log("first");
        observer.log("second");
        let contents =
            std::fs::read_to_string(runtime_dir(dir.path()).join("observe.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
    }

    #[test]
    fn events_are_recorded_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let observer = Observer::new(dir.path(), false).unwrap();
        observer.record_event(&EventEnvelope {
            seq_no: 1,
            at: Utc::now(),
            session_id: Uuid::now_v7(),
            kind: EventKind::IterationStartedV1 { iteration: 3 },
        });
        let contents =
            std::fs::read_to_string(runtime_dir(dir.path()).join("observe.log")).unwrap();
        assert!(contents.contains("iteration_started_v1"));
        assert!(contents.contains("\"iteration\":3"));
    }
}
