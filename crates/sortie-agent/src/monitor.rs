//! Event sink between the store and a presentation layer.
//!
//! Outbound, the monitor turns every state-affecting store event into a
//! snapshot of all records. Inbound, it applies cancel, delete and
//! show-results actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::conversation::{Conversation, ConversationId, ConversationStatus};
use crate::events::ConversationEvent;
use crate::store::ConversationStore;

const SNAPSHOT_CAPACITY: usize = 64;

/// Actions a presentation layer can send back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MonitorAction {
    CancelConversation { id: ConversationId },
    DeleteConversation { id: ConversationId },
    ShowResults { id: ConversationId },
}

/// Every record in the store at one moment
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub conversations: Vec<Conversation>,
}

impl Snapshot {
    pub fn get(&self, id: ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    /// Whether every conversation has reached a terminal status
    pub fn all_terminal(&self) -> bool {
        self.conversations.iter().all(|c| c.status.is_terminal())
    }
}

/// Read-only projection of a record's outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultsView {
    pub id: ConversationId,
    pub goal: String,
    pub title: Option<String>,
    pub status: ConversationStatus,
    pub results: Option<String>,
    pub error: Option<String>,
}

/// What an inbound action did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Whether the record existed
    Cancelled(bool),
    /// Whether the record existed
    Deleted(bool),
    Results(Option<ResultsView>),
}

pub struct Monitor {
    store: Arc<ConversationStore>,
    snapshot_tx: broadcast::Sender<Snapshot>,
}

impl Monitor {
    pub fn new(store: Arc<ConversationStore>) -> Self {
        let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_CAPACITY);
        Self { store, snapshot_tx }
    }

    /// Receive snapshots as they are pushed
    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            taken_at: Utc::now(),
            conversations: self.store.list(),
        }
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(self.snapshot());
    }

    pub fn handle_action(&self, action: MonitorAction) -> ActionOutcome {
        match action {
            MonitorAction::CancelConversation { id } => ActionOutcome::Cancelled(self.cancel(id)),
            MonitorAction::DeleteConversation { id } => ActionOutcome::Deleted(self.delete(id)),
            MonitorAction::ShowResults { id } => ActionOutcome::Results(self.show_results(id)),
        }
    }

    /// Fire the cancel handle and mark the record cancelled
    pub fn cancel(&self, id: ConversationId) -> bool {
        let Some(record) = self.store.get(id) else {
            tracing::debug!(conversation = %id, "cancel for unknown conversation");
            return false;
        };
        if let Some(handle) = &record.cancel_handle {
            handle.cancel();
        }
        self.store.mark_cancelled(id)
    }

    /// Remove the record, stopping the conversation if it is still running
    pub fn delete(&self, id: ConversationId) -> bool {
        match self.store.delete(id) {
            Some(record) => {
                if let Some(handle) = &record.cancel_handle {
                    handle.cancel();
                }
                true
            }
            None => false,
        }
    }

    pub fn show_results(&self, id: ConversationId) -> Option<ResultsView> {
        self.store.get(id).map(|record| ResultsView {
            id: record.id,
            goal: record.goal,
            title: record.title,
            status: record.status,
            results: record.results,
            error: record.error,
        })
    }

    /// Cancel every live conversation. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for record in self.store.list() {
            if record.status.is_terminal() {
                continue;
            }
            let outcome = self.handle_action(MonitorAction::CancelConversation { id: record.id });
            if outcome == ActionOutcome::Cancelled(true) {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Forward store events as snapshots until `shutdown` fires or the
    /// store goes away. Events already queued when `shutdown` fires are
    /// still published.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut events = self.store.subscribe();
        self.publish();

        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Ok(event) => self.forward(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "monitor lagged behind store events");
                        self.publish();
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.cancelled() => {
                    self.drain(&mut events);
                    break;
                }
            }
        }
    }

    fn forward(&self, event: &ConversationEvent) {
        if event.affects_state() {
            self.publish();
        }
    }

    fn drain(&self, events: &mut broadcast::Receiver<ConversationEvent>) {
        loop {
            match events.try_recv() {
                Ok(event) => self.forward(&event),
                Err(TryRecvError::Lagged(_)) => self.publish(),
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    /// Run the forwarding loop on its own task
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.run(shutdown).await })
    }
}
