// # Learner Persistence
//
// Durable storage for every learner's Q-table, keyed by stable workload id
// and packed into a single node-scoped entry. The persistence loop snapshots
// all learners every tick; learner creation consults the store so a restart
// (of the agent or of the workload's management) resumes from the learned
// policy instead of from scratch.

use crate::common::WorkloadId;
use crate::learner::LearnerSnapshot;
use crate::Result;
use std::collections::HashMap;
use tracing::debug;

const LEARNER_TREE: &str = "learner-state";

/// The single node-scoped entry holding all Q-tables.
const SNAPSHOT_KEY: &str = "qtables";

pub struct LearnerStateStore {
    tree: sled::Tree,
}

impl LearnerStateStore {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(LEARNER_TREE)?,
        })
    }

    /// Replace the node's snapshot entry with the given learner states.
    pub fn save_all(&self, snapshots: &HashMap<WorkloadId, LearnerSnapshot>) -> Result<()> {
        let raw = serde_json::to_vec(snapshots)?;
        self.tree.insert(SNAPSHOT_KEY, raw)?;
        debug!(learners = snapshots.len(), "learner snapshots persisted");
        Ok(())
    }

    pub fn load_all(&self) -> Result<HashMap<WorkloadId, LearnerSnapshot>> {
        match self.tree.get(SNAPSHOT_KEY)? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(HashMap::new()),
        }
    }

    /// Stored snapshot for one id, if any.
    pub fn load(&self, id: &WorkloadId) -> Result<Option<LearnerSnapshot>> {
        Ok(self.load_all()?.remove(id))
    }

    /// Block until the backing tree is durable on disk. Used by the final
    /// flush on shutdown.
    pub async fn flush(&self) -> Result<()> {
        self.tree.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learner::{Hyperparams, Learner};

    fn store() -> (LearnerStateStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (LearnerStateStore::new(&db).unwrap(), dir)
    }

    #[test]
    fn empty_store_loads_nothing() {
        let (store, _dir) = store();
        assert!(store.load_all().unwrap().is_empty());
        assert!(store.load(&WorkloadId::from("w1")).unwrap().is_none());
    }

    #[test]
    fn save_and_reload_by_id() {
        let (store, _dir) = store();

        let mut learner = Learner::new(Hyperparams::default());
        learner.record_usage(700.0);
        for _ in 0..5 {
            learner.select_action(0.0);
            learner.observe(600, 0.2, false);
        }

        let mut snapshots = HashMap::new();
        snapshots.insert(WorkloadId::from("w1"), learner.snapshot());
        store.save_all(&snapshots).unwrap();

        let loaded = store.load(&WorkloadId::from("w1")).unwrap().unwrap();
        assert_eq!(loaded.qtable, learner.snapshot().qtable);
        assert!(store.load(&WorkloadId::from("w2")).unwrap().is_none());
    }

    #[test]
    fn save_replaces_previous_entry() {
        let (store, _dir) = store();

        let mut first = HashMap::new();
        first.insert(
            WorkloadId::from("w1"),
            Learner::new(Hyperparams::default()).snapshot(),
        );
        store.save_all(&first).unwrap();

        let mut second = HashMap::new();
        second.insert(
            WorkloadId::from("w2"),
            Learner::new(Hyperparams::default()).snapshot(),
        );
        store.save_all(&second).unwrap();

        let all = store.load_all().unwrap();
        assert!(!all.contains_key(&WorkloadId::from("w1")));
        assert!(all.contains_key(&WorkloadId::from("w2")));
    }
}
