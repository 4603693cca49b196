use chrono::{DateTime, Utc};
use scanhost_proto::wire::{CorrelationId, FileAction, ScanVerdict};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// A file the event source offered for quarantine.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFile {
    pub path: PathBuf,
    pub filename: String,
}

impl CandidateFile {
    pub fn new(path: PathBuf) -> Self {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        CandidateFile { path, filename }
    }
}

/// Where one file sits in its quarantine workflow. Stages only move forward;
/// resolution removes the entry instead of adding a terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitingQuarantineChoice,
    Isolating,
    AwaitingScanResult,
    AwaitingActionChoice,
    ActionInProgress,
}

impl Stage {
    /// Position in the workflow, used to keep transitions one-directional.
    pub fn index(&self) -> u8 {
        match self {
            Stage::AwaitingQuarantineChoice => 1,
            Stage::Isolating => 2,
            Stage::AwaitingScanResult => 3,
            Stage::AwaitingActionChoice => 4,
            Stage::ActionInProgress => 5,
        }
    }
}

/// Everything the correlator remembers about one in-flight file.
#[derive(Debug, Clone)]
pub struct CorrelationEntry {
    pub file: CandidateFile,
    pub stage: Stage,
    pub verdict: Option<ScanVerdict>,
    pub verdict_details: Option<String>,
    /// The remedial action the user picked, set when it goes out to the host.
    pub action: Option<FileAction>,
    pub created_at: DateTime<Utc>,
}

impl CorrelationEntry {
    pub fn new(file: CandidateFile, stage: Stage) -> Self {
        CorrelationEntry {
            file,
            stage,
            verdict: None,
            verdict_details: None,
            action: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("correlation id {0} is already tracked")]
    DuplicateId(CorrelationId),
    #[error("correlation id {0} is not tracked")]
    UnknownId(CorrelationId),
    #[error("stage cannot move from {from:?} to {to:?}")]
    NotForward { from: Stage, to: Stage },
}

/// Observers of entry lifecycles. Hooks run inline on the correlator's
/// task, so implementations must be quick and non-blocking.
pub trait StoreHooks: Send + Sync {
    fn entry_created(&self, _id: &CorrelationId, _entry: &CorrelationEntry) {}
    fn stage_changed(&self, _id: &CorrelationId, _from: Stage, _to: Stage) {}
    fn entry_resolved(&self, _id: &CorrelationId, _entry: &CorrelationEntry) {}
}

/// The single home of workflow state: correlation id → entry.
///
/// Owned by the correlator task, so a plain `HashMap` suffices. Ids are
/// unique for the life of the process and never resurrected; `resolve`
/// removes the entry, which is the only terminal transition.
#[derive(Default)]
pub struct CorrelationStore {
    entries: HashMap<CorrelationId, CorrelationEntry>,
    hooks: Vec<Arc<dyn StoreHooks>>,
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hook(&mut self, hook: Arc<dyn StoreHooks>) {
        self.hooks.push(hook);
    }

    pub fn insert(&mut self, id: CorrelationId, entry: CorrelationEntry) -> Result<(), StoreError> {
        if self.entries.contains_key(&id) {
            return Err(StoreError::DuplicateId(id));
        }
        for hook in &self.hooks {
            hook.entry_created(&id, &entry);
        }
        debug!(id = %id, stage = ?entry.stage, file = %entry.file.filename, "tracking workflow");
        self.entries.insert(id, entry);
        Ok(())
    }

    pub fn get(&self, id: &CorrelationId) -> Option<&CorrelationEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &CorrelationId) -> Option<&mut CorrelationEntry> {
        self.entries.get_mut(id)
    }

    /// Move an entry to a later stage. Going sideways or backwards is a bug
    /// in the caller and is refused.
    pub fn advance(&mut self, id: &CorrelationId, to: Stage) -> Result<(), StoreError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownId(id.clone()))?;
        let from = entry.stage;
        if to.index() <= from.index() {
            return Err(StoreError::NotForward { from, to });
        }
        entry.stage = to;
        debug!(id = %id, ?from, ?to, "workflow advanced");
        for hook in &self.hooks {
            hook.stage_changed(id, from, to);
        }
        Ok(())
    }

    /// Remove an entry. Every workflow ends here, whatever the outcome.
    pub fn resolve(&mut self, id: &CorrelationId) -> Option<CorrelationEntry> {
        let entry = self.entries.remove(id)?;
        debug!(id = %id, stage = ?entry.stage, file = %entry.file.filename, "workflow resolved");
        for hook in &self.hooks {
            hook.entry_resolved(id, &entry);
        }
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<CorrelationId> {
        self.entries.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn entry(stage: Stage) -> CorrelationEntry {
        CorrelationEntry::new(CandidateFile::new(PathBuf::from("/dl/a.bin")), stage)
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let mut store = CorrelationStore::new();
        let id = CorrelationId::mint();
        store.insert(id.clone(), entry(Stage::Isolating)).unwrap();
        let err = store.insert(id.clone(), entry(Stage::Isolating)).unwrap_err();
        assert_eq!(err, StoreError::DuplicateId(id));
    }

    #[test]
    fn stages_never_move_backwards() {
        let mut store = CorrelationStore::new();
        let id = CorrelationId::mint();
        store
            .insert(id.clone(), entry(Stage::AwaitingQuarantineChoice))
            .unwrap();

        store.advance(&id, Stage::Isolating).unwrap();
        store.advance(&id, Stage::AwaitingScanResult).unwrap();

        let err = store.advance(&id, Stage::Isolating).unwrap_err();
        assert_eq!(
            err,
            StoreError::NotForward {
                from: Stage::AwaitingScanResult,
                to: Stage::Isolating
            }
        );
        let err = store.advance(&id, Stage::AwaitingScanResult).unwrap_err();
        assert!(matches!(err, StoreError::NotForward { .. }));
    }

    #[test]
    fn resolve_removes_and_is_idempotent() {
        let mut store = CorrelationStore::new();
        let id = CorrelationId::mint();
        store.insert(id.clone(), entry(Stage::Isolating)).unwrap();

        assert!(store.resolve(&id).is_some());
        assert!(store.resolve(&id).is_none());
        assert!(store.is_empty());
    }

    #[derive(Default)]
    struct RecordingHooks {
        events: Mutex<Vec<String>>,
    }

    impl StoreHooks for RecordingHooks {
        fn entry_created(&self, _id: &CorrelationId, entry: &CorrelationEntry) {
            self.events
                .lock()
                .unwrap()
                .push(format!("created:{:?}", entry.stage));
        }
        fn stage_changed(&self, _id: &CorrelationId, from: Stage, to: Stage) {
            self.events
                .lock()
                .unwrap()
                .push(format!("stage:{}->{}", from.index(), to.index()));
        }
        fn entry_resolved(&self, _id: &CorrelationId, _entry: &CorrelationEntry) {
            self.events.lock().unwrap().push("resolved".to_string());
        }
    }

    #[test]
    fn hooks_see_the_whole_lifecycle() {
        let hooks = Arc::new(RecordingHooks::default());
        let mut store = CorrelationStore::new();
        store.add_hook(hooks.clone());

        let id = CorrelationId::mint();
        store
            .insert(id.clone(), entry(Stage::AwaitingQuarantineChoice))
            .unwrap();
        store.advance(&id, Stage::Isolating).unwrap();
        store.resolve(&id);

        let events = hooks.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "created:AwaitingQuarantineChoice".to_string(),
                "stage:1->2".to_string(),
                "resolved".to_string()
            ]
        );
    }
}
