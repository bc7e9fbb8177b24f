//! Optimistic mutation ledger.
//!
//! Every user intent becomes an entry that is applied locally right away
//! and then resolved exactly once: confirmed by the caller, rolled back by
//! the caller, or rolled back by its own timeout. Whichever happens first
//! wins; the others are no-ops.

mod operation;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::model::{
    score_delta, AuthorRef, CommentDraft, CommentRecord, PostDraft, PostRecord, VoteDirection,
    VoteTarget,
};
use crate::telemetry;

pub use operation::{
    Confirmation, LedgerEvent, Operation, OperationId, PendingOperation, ProvisionalSink,
    RollbackData, VoteApplier, VoteOperation, VotePatch, VoteReversal, VoteRollback,
};

const EVENT_CAPACITY: usize = 256;

enum Reverter {
    Vote(Arc<dyn VoteApplier>),
    Post(Arc<dyn ProvisionalSink<PostRecord>>),
    Comment(Arc<dyn ProvisionalSink<CommentRecord>>),
}

struct Entry {
    operation: Operation,
    created_at: Instant,
    confirmed: bool,
    /// Set by the first of confirm / rollback / timeout.
    resolved: bool,
    /// Rollback timer while pending, grace-removal timer once confirmed.
    timer: Option<JoinHandle<()>>,
    reverter: Reverter,
}

impl Entry {
    /// Drops the applier's in-flight mark without touching its state.
    fn release(&self) {
        if let (Operation::Vote(vote), Reverter::Vote(applier)) = (&self.operation, &self.reverter) {
            applier.settle_vote(&vote.target);
        }
    }

    fn revert(&self) {
        match (&self.operation, &self.reverter) {
            (Operation::Vote(vote), Reverter::Vote(applier)) => applier.revert_vote(
                &vote.target,
                VoteReversal {
                    previous_vote: vote.rollback.previous_vote,
                    previous_score: vote.rollback.previous_score,
                    applied_delta: vote.applied_delta(),
                },
            ),
            (Operation::CreatePost { provisional_id, .. }, Reverter::Post(sink)) => {
                sink.remove_provisional(provisional_id)
            }
            (Operation::CreateComment { provisional_id, .. }, Reverter::Comment(sink)) => {
                sink.remove_provisional(provisional_id)
            }
            (operation, _) => {
                warn!(target = "tide.ledger", kind = operation.kind(), "no reverter for operation")
            }
        }
    }
}

#[derive(Clone)]
pub struct MutationLedger {
    inner: Arc<LedgerInner>,
}

struct LedgerInner {
    config: LedgerConfig,
    entries: Mutex<HashMap<OperationId, Entry>>,
    events: broadcast::Sender<LedgerEvent>,
}

impl MutationLedger {
    pub fn new(config: LedgerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(LedgerInner {
                config,
                entries: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.inner.config
    }

    pub fn events(&self) -> broadcast::Receiver<LedgerEvent> {
        self.inner.events.subscribe()
    }

    /// Unconfirmed entries.
    pub fn pending_count(&self) -> usize {
        self.inner
            .entries
            .lock()
            .values()
            .filter(|entry| !entry.confirmed)
            .count()
    }

    /// All entries, including confirmed ones still inside their grace window.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_pending(&self, id: OperationId) -> bool {
        self.inner
            .entries
            .lock()
            .get(&id)
            .map(|entry| !entry.resolved)
            .unwrap_or(false)
    }

    pub fn get(&self, id: OperationId) -> Option<PendingOperation> {
        self.inner.entries.lock().get(&id).map(|entry| PendingOperation {
            id,
            operation: entry.operation.clone(),
            created_at: entry.created_at,
            confirmed: entry.confirmed,
        })
    }

    /// Predicts the vote's effect, applies it through `applier` before
    /// returning, and arms the rollback timer.
    pub fn apply_optimistic_vote(
        &self,
        target: VoteTarget,
        new_vote: Option<VoteDirection>,
        current_vote: Option<VoteDirection>,
        current_score: i64,
        applier: Arc<dyn VoteApplier>,
    ) -> OperationId {
        self.admit();
        let predicted_score = current_score + score_delta(current_vote, new_vote);
        applier.apply_vote(
            &target,
            VotePatch {
                score: predicted_score,
                vote: new_vote,
            },
        );
        debug!(
            target = "tide.ledger",
            target_id = %target.id,
            target_type = target.kind.as_str(),
            current_score,
            predicted_score,
            "vote applied optimistically"
        );

        let operation = Operation::Vote(VoteOperation {
            target,
            new_vote,
            predicted_score,
            rollback: VoteRollback {
                previous_vote: current_vote,
                previous_score: current_score,
            },
        });
        self.register(operation, Reverter::Vote(applier))
    }

    pub fn apply_optimistic_post(
        &self,
        draft: PostDraft,
        author: AuthorRef,
        sink: Arc<dyn ProvisionalSink<PostRecord>>,
    ) -> OperationId {
        self.admit();
        let provisional_id = provisional_id();
        sink.insert_provisional(PostRecord::provisional(
            provisional_id.clone(),
            &draft,
            author,
        ));
        debug!(target = "tide.ledger", provisional_id = %provisional_id, "provisional post inserted");
        self.register(
            Operation::CreatePost {
                draft,
                provisional_id,
            },
            Reverter::Post(sink),
        )
    }

    pub fn apply_optimistic_comment(
        &self,
        draft: CommentDraft,
        author: AuthorRef,
        sink: Arc<dyn ProvisionalSink<CommentRecord>>,
    ) -> OperationId {
        self.admit();
        let provisional_id = provisional_id();
        sink.insert_provisional(CommentRecord::provisional(
            provisional_id.clone(),
            &draft,
            author,
        ));
        debug!(target = "tide.ledger", provisional_id = %provisional_id, "provisional comment inserted");
        self.register(
            Operation::CreateComment {
                draft,
                provisional_id,
            },
            Reverter::Comment(sink),
        )
    }

    /// Marks the operation confirmed and cancels its rollback timer. The
    /// entry lingers for the grace window so late echoes still find it.
    /// Returns false if the operation was already resolved or is unknown.
    pub fn confirm_operation(&self, id: OperationId, confirmation: Option<Confirmation>) -> bool {
        let follow_up = {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(&id) else {
                debug!(target = "tide.ledger", operation_id = %id, "confirm for unknown operation");
                return false;
            };
            if entry.resolved {
                debug!(target = "tide.ledger", operation_id = %id, "confirm ignored; already resolved");
                return false;
            }
            entry.resolved = true;
            entry.confirmed = true;
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.timer = Some(self.spawn_grace_removal(id));
            on_confirm(entry, confirmation)
        };

        if let Some(follow_up) = follow_up {
            follow_up();
        }
        info!(target = "tide.ledger", operation_id = %id, "operation confirmed");
        self.emit(LedgerEvent::Confirmed { id });
        self.record_pending();
        true
    }

    /// Cancels the timer and hands the stored rollback data to `rollback`.
    /// Returns false if the operation was already resolved or is unknown.
    pub fn rollback_operation(&self, id: OperationId, rollback: impl FnOnce(RollbackData)) -> bool {
        let Some(entry) = self.take_unresolved(id) else {
            debug!(target = "tide.ledger", operation_id = %id, "rollback ignored; not pending");
            return false;
        };
        rollback(entry.operation.rollback_data());
        entry.release();
        info!(target = "tide.ledger", operation_id = %id, kind = entry.operation.kind(), "operation rolled back");
        self.emit(LedgerEvent::RolledBack { id });
        self.record_pending();
        true
    }

    /// Rolls back using the applier or sink the operation was created with.
    pub fn revert_operation(&self, id: OperationId) -> bool {
        let Some(entry) = self.take_unresolved(id) else {
            debug!(target = "tide.ledger", operation_id = %id, "revert ignored; not pending");
            return false;
        };
        entry.revert();
        info!(target = "tide.ledger", operation_id = %id, kind = entry.operation.kind(), "operation reverted");
        self.emit(LedgerEvent::RolledBack { id });
        self.record_pending();
        true
    }

    /// Removes entries older than twice the operation timeout, confirmed or
    /// not. Nothing is reverted.
    pub fn sweep(&self) -> usize {
        let max_age = self.inner.config.sweep_age();
        let now = Instant::now();
        let removed = {
            let mut entries = self.inner.entries.lock();
            let before = entries.len();
            entries.retain(|id, entry| {
                let keep = now.saturating_duration_since(entry.created_at) < max_age;
                if !keep {
                    if let Some(timer) = entry.timer.take() {
                        timer.abort();
                    }
                    trace!(target = "tide.ledger", operation_id = %id, confirmed = entry.confirmed, "swept");
                }
                keep
            });
            before - entries.len()
        };
        if removed > 0 {
            info!(target = "tide.ledger", removed, "swept stale operations");
            self.emit(LedgerEvent::Swept { count: removed });
            self.record_pending();
        }
        removed
    }

    /// Runs `sweep` every `sweep_interval` until the handle is aborted.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let ledger = self.clone();
        let period = self
            .inner
            .config
            .sweep_interval()
            .max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                ledger.sweep();
            }
        })
    }

    fn admit(&self) {
        let pending = self.pending_count();
        if pending >= self.inner.config.max_pending {
            warn!(
                target = "tide.ledger",
                pending,
                max_pending = self.inner.config.max_pending,
                "ledger at capacity; sweeping before admitting"
            );
            self.sweep();
        }
    }

    fn register(&self, operation: Operation, reverter: Reverter) -> OperationId {
        let id = Uuid::new_v4();
        let kind = operation.kind();
        {
            let mut entries = self.inner.entries.lock();
            let timer = self.spawn_timeout(id);
            entries.insert(
                id,
                Entry {
                    operation,
                    created_at: Instant::now(),
                    confirmed: false,
                    resolved: false,
                    timer: Some(timer),
                    reverter,
                },
            );
        }
        trace!(target = "tide.ledger", operation_id = %id, kind, "operation registered");
        self.emit(LedgerEvent::Applied { id, kind });
        self.record_pending();
        id
    }

    fn take_unresolved(&self, id: OperationId) -> Option<Entry> {
        let mut entry = take_if_unresolved(&mut self.inner.entries.lock(), id)?;
        entry.resolved = true;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        Some(entry)
    }

    fn spawn_timeout(&self, id: OperationId) -> JoinHandle<()> {
        let ledger = self.clone();
        let timeout = self.inner.config.operation_timeout();
        tokio::spawn(async move {
            sleep(timeout).await;
            ledger.expire(id);
        })
    }

    fn spawn_grace_removal(&self, id: OperationId) -> JoinHandle<()> {
        let ledger = self.clone();
        let grace = self.inner.config.confirm_grace();
        tokio::spawn(async move {
            sleep(grace).await;
            if ledger.inner.entries.lock().remove(&id).is_some() {
                trace!(target = "tide.ledger", operation_id = %id, "confirmed operation retired");
            }
        })
    }

    fn expire(&self, id: OperationId) {
        let Some(mut entry) = take_if_unresolved(&mut self.inner.entries.lock(), id) else {
            return;
        };
        // The running timer is this task; dropping the handle just detaches it.
        entry.timer = None;
        entry.resolved = true;
        warn!(
            target = "tide.ledger",
            operation_id = %id,
            kind = entry.operation.kind(),
            timeout_ms = self.inner.config.operation_timeout_ms,
            "operation timed out; rolling back"
        );
        entry.revert();
        self.emit(LedgerEvent::TimedOut { id });
        self.record_pending();
    }

    fn emit(&self, event: LedgerEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn record_pending(&self) {
        if telemetry::enabled() {
            telemetry::record_gauge("ledger.pending", self.pending_count() as u64);
        }
    }
}

fn take_if_unresolved(entries: &mut HashMap<OperationId, Entry>, id: OperationId) -> Option<Entry> {
    let unresolved = entries.get(&id).map(|entry| !entry.resolved).unwrap_or(false);
    if unresolved {
        entries.remove(&id)
    } else {
        None
    }
}

fn provisional_id() -> String {
    format!("temp-{}", Uuid::new_v4())
}

/// Work to run outside the lock once an entry is confirmed: promote the
/// provisional record, or tell the applier its vote is settled.
fn on_confirm(entry: &Entry, confirmation: Option<Confirmation>) -> Option<Box<dyn FnOnce() + Send>> {
    match (&entry.operation, &entry.reverter, confirmation) {
        (Operation::Vote(vote), Reverter::Vote(applier), _) => {
            let applier = Arc::clone(applier);
            let target = vote.target.clone();
            Some(Box::new(move || applier.settle_vote(&target)))
        }
        (
            Operation::CreatePost { provisional_id, .. },
            Reverter::Post(sink),
            Some(Confirmation::Post(record)),
        ) => {
            let sink = Arc::clone(sink);
            let provisional_id = provisional_id.clone();
            Some(Box::new(move || sink.promote(&provisional_id, record)))
        }
        (
            Operation::CreateComment { provisional_id, .. },
            Reverter::Comment(sink),
            Some(Confirmation::Comment(record)),
        ) => {
            let sink = Arc::clone(sink);
            let provisional_id = provisional_id.clone();
            Some(Box::new(move || sink.promote(&provisional_id, record)))
        }
        (operation, _, Some(_)) => {
            debug!(target = "tide.ledger", kind = operation.kind(), "confirmation payload not used");
            None
        }
        _ => None,
    }
}
