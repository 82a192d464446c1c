//! File events and the shared progress board
//!
//! The coordinator reacts to drive events and reports pipeline progress on a
//! blackboard keyed by `(id,org)/cmspath`. The board is latching: once a
//! path reports a terminal result, late or re-ordered messages cannot regress
//! it back to an in-flight state.

use crate::cluster::rpc::{topics, ProgressUpdate, RpcMessage};
use crate::cluster::{BusOptions, ClusterBus};
use ahash::{HashMap, HashMapExt};
use crossbeam_channel::Sender;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;

/// Drive event driving the indexing pipeline.
#[derive(Debug, Clone)]
pub enum FileEvent {
    Created { path: PathBuf },
    Modified { path: PathBuf },
    Deleted { path: PathBuf },
    Renamed { from: PathBuf, to: PathBuf },
}

/// Progress phases, mirrored in `ProgressUpdate::kind`.
pub const KIND_PROCESSING: &str = "processing";
pub const KIND_PROGRESS: &str = "progress";
pub const KIND_PROCESSED: &str = "processed";

#[derive(Debug, Clone)]
pub struct BoardEntry {
    pub kind: String,
    pub step_num: usize,
    pub total_steps: usize,
    pub result: Option<bool>,
    /// Latched when a `processed` message lands; later messages for the same
    /// path are ignored until the next `processing`.
    pub done: bool,
}

/// Cluster-shared progress memory. Local observers subscribe with a channel
/// sender; remote replicas receive the same updates over the bus.
pub struct ProgressBoard {
    entries: RwLock<HashMap<String, BoardEntry>>,
    observers: RwLock<Vec<Sender<ProgressUpdate>>>,
    bus: Option<Arc<dyn ClusterBus>>,
}

impl ProgressBoard {
    pub fn new(bus: Option<Arc<dyn ClusterBus>>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            bus,
        }
    }

    /// Register a local observer channel.
    pub fn observe(&self, sender: Sender<ProgressUpdate>) {
        self.observers.write().push(sender);
    }

    pub fn get(&self, key: &str) -> Option<BoardEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Apply an update locally and fan it out (observers + bus).
    pub fn publish(&self, update: ProgressUpdate) {
        if !self.apply(&update) {
            return;
        }
        for observer in self.observers.read().iter() {
            let _ = observer.try_send(update.clone());
        }
        if let Some(bus) = &self.bus {
            let topic = match update.kind.as_str() {
                KIND_PROCESSING => topics::FILE_PROCESSING,
                KIND_PROCESSED => topics::FILE_PROCESSED,
                _ => topics::FILE_PROGRESS,
            };
            if let Err(e) = bus.publish(
                topic,
                RpcMessage::Progress(update),
                &BusOptions::external(),
            ) {
                log::warn!("progress broadcast failed: {}", e);
            }
        }
    }

    /// Apply an update received from a peer (no re-broadcast).
    pub fn apply_remote(&self, update: &ProgressUpdate) {
        self.apply(update);
    }

    /// Returns false when the update was suppressed by the done latch.
    fn apply(&self, update: &ProgressUpdate) -> bool {
        let key = update.board_key();
        let mut entries = self.entries.write();

        let starting_over = update.kind == KIND_PROCESSING;
        if let Some(existing) = entries.get(&key) {
            if existing.done && !starting_over {
                return false;
            }
        }

        entries.insert(
            key,
            BoardEntry {
                kind: update.kind.clone(),
                step_num: update.step_num,
                total_steps: update.total_steps,
                result: update.result,
                done: update.kind == KIND_PROCESSED,
            },
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(kind: &str, step: usize, result: Option<bool>) -> ProgressUpdate {
        ProgressUpdate {
            user_id: "u1".into(),
            org: "acme".into(),
            cmspath: "/docs/a.txt".into(),
            fullpath: "/data/docs/a.txt".into(),
            kind: kind.into(),
            step_num: step,
            total_steps: 4,
            result,
            subtype: "file_created".into(),
        }
    }

    #[test]
    fn test_progress_sequence() {
        let board = ProgressBoard::new(None);
        board.publish(update(KIND_PROCESSING, 0, None));
        board.publish(update(KIND_PROGRESS, 2, None));

        let entry = board.get(&update(KIND_PROGRESS, 2, None).board_key()).unwrap();
        assert_eq!(entry.step_num, 2);
        assert!(!entry.done);
    }

    #[test]
    fn test_done_latch_suppresses_late_messages() {
        let board = ProgressBoard::new(None);
        let key = update(KIND_PROCESSED, 4, Some(true)).board_key();

        board.publish(update(KIND_PROCESSING, 0, None));
        board.publish(update(KIND_PROCESSED, 4, Some(true)));
        // A straggler progress message arrives out of order.
        board.publish(update(KIND_PROGRESS, 3, None));

        let entry = board.get(&key).unwrap();
        assert!(entry.done);
        assert_eq!(entry.kind, KIND_PROCESSED);
        assert_eq!(entry.result, Some(true));
    }

    #[test]
    fn test_new_processing_resets_latch() {
        let board = ProgressBoard::new(None);
        let key = update(KIND_PROCESSING, 0, None).board_key();

        board.publish(update(KIND_PROCESSED, 4, Some(true)));
        board.publish(update(KIND_PROCESSING, 0, None));

        let entry = board.get(&key).unwrap();
        assert!(!entry.done);
        assert_eq!(entry.kind, KIND_PROCESSING);
    }

    #[test]
    fn test_observers_receive_updates() {
        let board = ProgressBoard::new(None);
        let (tx, rx) = crossbeam_channel::unbounded();
        board.observe(tx);

        board.publish(update(KIND_PROCESSING, 0, None));
        board.publish(update(KIND_PROGRESS, 1, None));

        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_suppressed_updates_not_observed() {
        let board = ProgressBoard::new(None);
        let (tx, rx) = crossbeam_channel::unbounded();
        board.observe(tx);

        board.publish(update(KIND_PROCESSED, 4, Some(true)));
        board.publish(update(KIND_PROGRESS, 2, None));

        assert_eq!(rx.try_iter().count(), 1);
    }
}
