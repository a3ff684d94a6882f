use std::collections::HashMap;
use std::collections::hash_map::Entry;

use parking_lot::Mutex;

use crate::domain::DatasetKey;
use crate::error::SkyDataError;
use crate::task::{AcquisitionTask, CancelToken, Stage, TaskSnapshot};

/// In-flight acquisitions keyed by dataset. At most one task per key.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<DatasetKey, AcquisitionTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the task unless one is already registered for its key.
    pub fn register(&self, task: AcquisitionTask) -> Result<CancelToken, SkyDataError> {
        let mut tasks = self.tasks.lock();
        match tasks.entry(task.key().clone()) {
            Entry::Occupied(occupied) => {
                Err(SkyDataError::AlreadyInProgress(occupied.key().to_string()))
            }
            Entry::Vacant(vacant) => {
                let token = task.cancel_token().clone();
                vacant.insert(task);
                Ok(token)
            }
        }
    }

    pub fn remove(&self, key: &DatasetKey) -> Option<AcquisitionTask> {
        self.tasks.lock().remove(key)
    }

    pub fn contains(&self, key: &DatasetKey) -> bool {
        self.tasks.lock().contains_key(key)
    }

    pub fn cancel(&self, key: &DatasetKey) -> bool {
        match self.tasks.lock().get(key) {
            Some(task) => {
                task.cancel_token().cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let tasks = self.tasks.lock();
        for task in tasks.values() {
            task.cancel_token().cancel();
        }
        tasks.len()
    }

    pub fn set_stage(&self, key: &DatasetKey, stage: Stage) {
        if let Some(task) = self.tasks.lock().get_mut(key) {
            task.set_stage(stage);
        }
    }

    pub fn set_progress(&self, key: &DatasetKey, done: u64, total: Option<u64>) {
        if let Some(task) = self.tasks.lock().get_mut(key) {
            task.set_progress(done, total);
        }
    }

    pub fn snapshot(&self, key: &DatasetKey) -> Option<TaskSnapshot> {
        self.tasks.lock().get(key).map(AcquisitionTask::snapshot)
    }

    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        let mut snapshots = self
            .tasks
            .lock()
            .values()
            .map(AcquisitionTask::snapshot)
            .collect::<Vec<_>>();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use assert_matches::assert_matches;

    use super::*;

    fn task(key: &str) -> AcquisitionTask {
        AcquisitionTask::new(key.parse().unwrap(), PathBuf::from(format!("/tmp/{key}.part")))
    }

    #[test]
    fn second_registration_is_rejected() {
        let registry = TaskRegistry::new();
        registry.register(task("hip")).unwrap();
        assert_matches!(
            registry.register(task("hip")),
            Err(SkyDataError::AlreadyInProgress(key)) if key == "hip"
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn cancel_reaches_registered_token() {
        let registry = TaskRegistry::new();
        let token = registry.register(task("hip")).unwrap();
        let key: DatasetKey = "hip".parse().unwrap();
        assert!(registry.cancel(&key));
        assert!(token.is_cancelled());
        assert!(registry.snapshot(&key).unwrap().cancel_requested);

        registry.remove(&key);
        assert!(!registry.cancel(&key));
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshots_are_sorted() {
        let registry = TaskRegistry::new();
        registry.register(task("tycho")).unwrap();
        registry.register(task("hip")).unwrap();
        let keys = registry
            .snapshots()
            .into_iter()
            .map(|snapshot| snapshot.key.to_string())
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["hip", "tycho"]);
        assert_eq!(registry.cancel_all(), 2);
    }
}
