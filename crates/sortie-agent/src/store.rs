//! In-memory registry of conversation records.
//!
//! Every mutation is atomic with respect to the record it targets and is
//! announced on the store's event channel, which the monitor subscribes to.
//! Operations on unknown ids are no-ops: cancel and delete are expected to
//! race against each other.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::conversation::{
    Conversation, ConversationId, ConversationStatus, ConversationUpdate, NewConversation,
};
use crate::events::ConversationEvent;

const EVENT_CAPACITY: usize = 256;

/// Process-wide registry of conversations. Construct once and share by `Arc`.
pub struct ConversationStore {
    records: RwLock<HashMap<ConversationId, Conversation>>,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<ConversationEvent>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            records: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            event_tx,
        }
    }

    /// Subscribe to lifecycle events from the store and the engines using it
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.event_tx.subscribe()
    }

    /// Publish an event on the shared channel. Having no subscribers is fine.
    pub fn emit(&self, event: ConversationEvent) {
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<ConversationEvent> {
        self.event_tx.clone()
    }

    /// Add a record with a fresh id and the initial bookkeeping fields.
    pub fn register(&self, new: NewConversation) -> ConversationId {
        let id = ConversationId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = Conversation {
            id,
            goal: new.goal,
            model: new.model,
            caller: new.caller,
            title: new.title,
            status: ConversationStatus::Started,
            current_turn: 0,
            max_turns: new.max_turns,
            total_tokens: 0,
            started_at: chrono::Utc::now(),
            cancelled: false,
            cancel_handle: new.cancel_handle,
            results: None,
            error: None,
        };

        self.records.write().insert(id, record);
        tracing::info!(conversation = %id, "registered conversation");
        self.emit(ConversationEvent::Registered { id });
        id
    }

    pub fn get(&self, id: ConversationId) -> Option<Conversation> {
        self.records.read().get(&id).cloned()
    }

    /// Merge the supplied fields into the record.
    ///
    /// A status change the transition table forbids, or a turn beyond
    /// `max_turns`, is dropped while the rest of the update still applies.
    /// Returns whether the record exists.
    pub fn update(&self, id: ConversationId, update: ConversationUpdate) -> bool {
        let status = {
            let mut records = self.records.write();
            let Some(record) = records.get_mut(&id) else {
                tracing::debug!(conversation = %id, "update for unknown conversation ignored");
                return false;
            };

            if let Some(next) = update.status {
                if next != record.status {
                    if record.status.can_transition_to(next) {
                        record.status = next;
                    } else {
                        tracing::warn!(
                            conversation = %id,
                            "rejected status transition {} -> {}",
                            record.status,
                            next
                        );
                    }
                }
            }
            if let Some(turn) = update.current_turn {
                if turn <= record.max_turns {
                    record.current_turn = turn;
                } else {
                    tracing::warn!(
                        conversation = %id,
                        "turn {} exceeds max turns {}",
                        turn,
                        record.max_turns
                    );
                }
            }
            if let Some(tokens) = update.total_tokens {
                record.total_tokens = tokens;
            }
            if let Some(title) = update.title {
                record.title = Some(title);
            }
            if let Some(results) = update.results {
                record.results = Some(results);
            }
            if let Some(error) = update.error {
                record.error = Some(error);
            }
            if let Some(handle) = update.cancel_handle {
                record.cancel_handle = Some(handle);
            }
            record.status
        };

        self.emit(ConversationEvent::Updated { id, status });
        true
    }

    /// Set the cancellation flag and, for a live conversation, the
    /// `cancelled` status. Calling it again changes nothing.
    pub fn mark_cancelled(&self, id: ConversationId) -> bool {
        let changed = {
            let mut records = self.records.write();
            let Some(record) = records.get_mut(&id) else {
                return false;
            };
            let changed = !record.cancelled || !record.status.is_terminal();
            record.cancelled = true;
            if !record.status.is_terminal() {
                record.status = ConversationStatus::Cancelled;
            }
            changed
        };

        if changed {
            tracing::info!(conversation = %id, "conversation cancelled");
            self.emit(ConversationEvent::Cancelled { id });
        }
        true
    }

    /// `Some(flag)` for a known record, `None` once it has been deleted
    pub fn is_cancelled(&self, id: ConversationId) -> Option<bool> {
        self.records.read().get(&id).map(|r| r.cancelled)
    }

    /// Remove a record, returning it if it existed
    pub fn delete(&self, id: ConversationId) -> Option<Conversation> {
        let removed = self.records.write().remove(&id);
        if removed.is_some() {
            tracing::info!(conversation = %id, "deleted conversation");
            self.emit(ConversationEvent::Deleted { id });
        }
        removed
    }

    /// All records, in no particular order
    pub fn list(&self) -> Vec<Conversation> {
        self.records.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_conversation(goal: &str) -> NewConversation {
        NewConversation {
            goal: goal.to_string(),
            model: "test-model".to_string(),
            caller: None,
            title: None,
            max_turns: 5,
            cancel_handle: None,
        }
    }

    #[test]
    fn test_register_sets_initial_fields() {
        let store = ConversationStore::new();
        let id = store.register(new_conversation("write tests"));
        let record = store.get(id).unwrap();

        assert_eq!(record.goal, "write tests");
        assert_eq!(record.status, ConversationStatus::Started);
        assert_eq!(record.current_turn, 0);
        assert_eq!(record.total_tokens, 0);
        assert!(!record.cancelled);
        assert!(record.results.is_none());
        assert!(record.error.is_none());
    }

    #[test]
    fn test_register_without_caller_leaves_it_absent() {
        let store = ConversationStore::new();
        let id = store.register(new_conversation("g"));
        let record = store.get(id).unwrap();
        assert!(record.caller.is_none());
        assert!(record.title.is_none());
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let store = ConversationStore::new();
        let a = store.register(new_conversation("a"));
        let b = store.register(new_conversation("b"));
        assert!(b > a);
    }

    #[test]
    fn test_update_merges_only_supplied_fields() {
        let store = ConversationStore::new();
        let id = store.register(new_conversation("g"));
        store.update(id, ConversationUpdate::status(ConversationStatus::Working).with_turn(2));
        store.update(id, ConversationUpdate::default().with_total_tokens(99));

        let record = store.get(id).unwrap();
        assert_eq!(record.status, ConversationStatus::Working);
        assert_eq!(record.current_turn, 2);
        assert_eq!(record.total_tokens, 99);
        assert_eq!(record.goal, "g");
    }

    #[test]
    fn test_update_rejects_illegal_transition() {
        let store = ConversationStore::new();
        let id = store.register(new_conversation("g"));
        store.update(id, ConversationUpdate::status(ConversationStatus::TaskComplete));
        store.update(
            id,
            ConversationUpdate::status(ConversationStatus::Working).with_results("late"),
        );

        let record = store.get(id).unwrap();
        assert_eq!(record.status, ConversationStatus::TaskComplete);
        assert_eq!(record.results.as_deref(), Some("late"));
    }

    #[test]
    fn test_update_rejects_turn_beyond_max() {
        let store = ConversationStore::new();
        let id = store.register(new_conversation("g"));
        store.update(id, ConversationUpdate::default().with_turn(6));
        assert_eq!(store.get(id).unwrap().current_turn, 0);
    }

    #[test]
    fn test_update_unknown_id_is_noop() {
        let store = ConversationStore::new();
        assert!(!store.update(
            ConversationId::new(404),
            ConversationUpdate::status(ConversationStatus::Working)
        ));
    }

    #[test]
    fn test_mark_cancelled_is_idempotent() {
        let store = ConversationStore::new();
        let id = store.register(new_conversation("g"));
        assert!(store.mark_cancelled(id));
        assert!(store.mark_cancelled(id));

        let record = store.get(id).unwrap();
        assert_eq!(record.status, ConversationStatus::Cancelled);
        assert!(record.cancelled);
    }

    #[test]
    fn test_mark_cancelled_keeps_finished_status() {
        let store = ConversationStore::new();
        let id = store.register(new_conversation("g"));
        store.update(id, ConversationUpdate::status(ConversationStatus::AgentFinished));
        store.mark_cancelled(id);

        let record = store.get(id).unwrap();
        assert_eq!(record.status, ConversationStatus::AgentFinished);
        assert!(record.cancelled);
    }

    #[test]
    fn test_cancelled_blocks_later_working_update() {
        let store = ConversationStore::new();
        let id = store.register(new_conversation("g"));
        store.mark_cancelled(id);
        store.update(id, ConversationUpdate::status(ConversationStatus::Working));
        assert_eq!(store.get(id).unwrap().status, ConversationStatus::Cancelled);
    }

    #[test]
    fn test_delete_and_double_delete() {
        let store = ConversationStore::new();
        let id = store.register(new_conversation("g"));
        assert!(store.delete(id).is_some());
        assert!(store.delete(id).is_none());
        assert!(store.get(id).is_none());
        assert!(!store.mark_cancelled(id));
        assert_eq!(store.is_cancelled(id), None);
    }

    #[test]
    fn test_list_returns_all_records() {
        let store = ConversationStore::new();
        store.register(new_conversation("a"));
        store.register(new_conversation("b"));
        assert_eq!(store.list().len(), 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_mutations_emit_events() {
        let store = ConversationStore::new();
        let mut rx = store.subscribe();

        let id = store.register(new_conversation("g"));
        store.update(id, ConversationUpdate::status(ConversationStatus::Working));
        store.mark_cancelled(id);
        store.mark_cancelled(id);
        store.delete(id);

        assert_eq!(rx.recv().await.unwrap(), ConversationEvent::Registered { id });
        assert_eq!(
            rx.recv().await.unwrap(),
            ConversationEvent::Updated {
                id,
                status: ConversationStatus::Working
            }
        );
        assert_eq!(rx.recv().await.unwrap(), ConversationEvent::Cancelled { id });
        assert_eq!(rx.recv().await.unwrap(), ConversationEvent::Deleted { id });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_updates_keep_records_consistent() {
        let store = Arc::new(ConversationStore::new());
        let ids: Vec<_> = (0..8)
            .map(|i| store.register(new_conversation(&format!("goal {i}"))))
            .collect();

        let mut tasks = Vec::new();
        for id in ids.clone() {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                for turn in 1..=5 {
                    store.update(
                        id,
                        ConversationUpdate::status(ConversationStatus::Working)
                            .with_turn(turn)
                            .with_total_tokens(u64::from(turn) * 10),
                    );
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for id in ids {
            let record = store.get(id).unwrap();
            assert_eq!(record.current_turn, 5);
            assert_eq!(record.total_tokens, 50);
            assert_eq!(record.status, ConversationStatus::Working);
        }
    }
}
