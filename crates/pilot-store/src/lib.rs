use anyhow::{Context, Result};
use pilot_core::{Session, runtime_dir};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One JSON document per session under `.pilot/sessions/`. The on-disk shape
/// is exactly the serde form of [`Session`], so load(save(s)) == s.
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(workspace: &Path) -> Result<Self> {
        let root = runtime_dir(workspace).join("sessions");
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        let path = self.path_for(session.id);
        let raw = serde_json::to_string_pretty(session).context("serializing session")?;
        std::fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))
    }

    pub fn load(&self, id: Uuid) -> Result<Session> {
        let path = self.path_for(id);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// All stored sessions, most recently updated first.
    pub fn list(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("reading {}", self.root.display()))?
        {
            let entry = entry?;
            if entry.path().extension().is_some_and(|ext| ext == "json")
                && let Ok(raw) = std::fs::read_to_string(entry.path())
                && let Ok(session) = serde_json::from_str::<Session>(&raw)
            {
                sessions.push(session);
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    pub fn load_latest(&self) -> Result<Option<Session>> {
        Ok(self.list()?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_core::Message;
    use pilot_playbook::{StrategyCategory, StrategyOutcome};

    #[test]
    fn session_round_trip_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();

        let mut session = Session::new(dir.path());
        session.push_message(Message::system("you are a coding agent"));
        session.push_message(Message::user("add a test"));
        let id = session
            .playbook
            .add_strategy(StrategyCategory::Testing, "run tests after edits")
            .id
            .clone();
        session
            .playbook
            .tag_strategy(&id, StrategyOutcome::Helpful)
            .unwrap();

        store.save(&session).unwrap();
        let loaded = store.load(session.id).unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded.playbook.get(&id).unwrap().helpful_count, 1);
        assert_eq!(
            loaded.playbook.next_id.get(&StrategyCategory::Testing),
            Some(&1)
        );
    }

    #[test]
    fn list_orders_by_most_recent_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        let old = Session::new(dir.path());
        store.save(&old).unwrap();
        let mut newer = Session::new(dir.path());
        newer.push_message(Message::user("hello"));
        store.save(&newer).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(store.load_latest().unwrap().unwrap().id, newer.id);
    }

    #[test]
    fn loading_a_missing_session_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        assert!(store.load(Uuid::now_v7()).is_err());
    }
}
