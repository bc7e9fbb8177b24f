//! Shared record containers.
//!
//! A `RecordStore` is where the optimistic path (vote applier, provisional
//! sink) and the live path (router listeners) meet. Conflicting values from
//! an authoritative source always go through [`reconcile::merge`].

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::ledger::{ProvisionalSink, VoteApplier, VotePatch, VoteReversal};
use crate::model::{CommentRecord, PostRecord, VoteTarget};
use crate::reconcile::{self, Reconcilable};
use crate::router::{CommentPatch, ContentChange, FeedListener, PostPatch, ScoreChange, ThreadListener};

pub trait StoreRecord: Reconcilable + Send + Sync + 'static {
    fn is_provisional(&self) -> bool;
}

impl StoreRecord for PostRecord {
    fn is_provisional(&self) -> bool {
        self.provisional
    }
}

impl StoreRecord for CommentRecord {
    fn is_provisional(&self) -> bool {
        self.provisional
    }
}

/// Where live inserts and provisional records land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertAt {
    /// Newest first, as in feeds.
    Front,
    /// Oldest first, as in threads.
    Back,
}

pub struct RecordStore<R> {
    insert_at: InsertAt,
    inner: RwLock<StoreInner<R>>,
}

struct StoreInner<R> {
    order: Vec<String>,
    records: HashMap<String, R>,
    /// Optimistic votes per record not yet confirmed or undone.
    in_flight: HashMap<String, u32>,
}

impl<R> StoreInner<R> {
    fn place(&mut self, id: String, at: InsertAt) {
        match at {
            InsertAt::Front => self.order.insert(0, id),
            InsertAt::Back => self.order.push(id),
        }
    }

    fn forget(&mut self, id: &str) -> Option<R> {
        let record = self.records.remove(id)?;
        self.order.retain(|existing| existing != id);
        self.in_flight.remove(id);
        Some(record)
    }
}

impl<R: StoreRecord> RecordStore<R> {
    pub fn new(insert_at: InsertAt) -> Self {
        Self {
            insert_at,
            inner: RwLock::new(StoreInner {
                order: Vec::new(),
                records: HashMap::new(),
                in_flight: HashMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().records.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<R> {
        self.inner.read().records.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.read().order.clone()
    }

    pub fn records(&self) -> Vec<R> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect()
    }

    /// Replaces the contents with an authoritative snapshot. Overlapping
    /// records are merged against what is held locally; provisional records
    /// the snapshot does not know about stay in front.
    pub fn ingest_snapshot(&self, fresh: Vec<R>) {
        let mut inner = self.inner.write();
        let held: Vec<R> = inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect();
        let merged = reconcile::merge_snapshot(&fresh, &held);

        let mut order: Vec<String> = held
            .iter()
            .filter(|record| record.is_provisional())
            .filter(|record| !fresh.iter().any(|f| f.id() == record.id()))
            .map(|record| record.id().to_string())
            .collect();
        let mut records: HashMap<String, R> = order
            .iter()
            .filter_map(|id| inner.records.get(id).map(|record| (id.clone(), record.clone())))
            .collect();
        for record in merged {
            let id = record.id().to_string();
            if records.insert(id.clone(), record).is_none() {
                order.push(id);
            }
        }

        debug!(
            target = "tide.store",
            fresh = fresh.len(),
            kept_provisional = order.len().saturating_sub(fresh.len()),
            "snapshot ingested"
        );
        inner.in_flight.retain(|id, _| records.contains_key(id));
        inner.order = order;
        inner.records = records;
    }

    /// Appends the next page. Records already held are merged in place.
    pub fn append_page(&self, page: Vec<R>) {
        let mut inner = self.inner.write();
        for record in page {
            let id = record.id().to_string();
            let next = match inner.records.get(&id) {
                Some(held) => reconcile::merge(&record, held),
                None => {
                    inner.order.push(id.clone());
                    record
                }
            };
            inner.records.insert(id, next);
        }
    }

    /// Live insert. Redelivered or already-held ids are merged rather than
    /// duplicated; returns true if the record is new.
    pub fn insert_live(&self, record: R) -> bool {
        let mut inner = self.inner.write();
        let id = record.id().to_string();
        if let Some(held) = inner.records.get(&id) {
            let merged = reconcile::merge(&record, held);
            inner.records.insert(id.clone(), merged);
            trace!(target = "tide.store", id = %id, "duplicate insert merged");
            return false;
        }
        inner.place(id.clone(), self.insert_at);
        inner.records.insert(id, record);
        true
    }

    pub fn remove(&self, id: &str) -> Option<R> {
        self.inner.write().forget(id)
    }

    /// Whether one of the user's votes on `id` is awaiting the server.
    pub fn has_vote_in_flight(&self, id: &str) -> bool {
        self.inner.read().in_flight.contains_key(id)
    }

    fn patch_held(&self, id: &str, patch: impl FnOnce(&mut R, bool)) -> bool {
        let mut inner = self.inner.write();
        let in_flight = inner.in_flight.contains_key(id);
        match inner.records.get_mut(id) {
            Some(record) => {
                patch(record, in_flight);
                true
            }
            None => false,
        }
    }

    fn release_vote(inner: &mut StoreInner<R>, id: &str) {
        if let Some(count) = inner.in_flight.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                inner.in_flight.remove(id);
            }
        }
    }

    /// Runs `update` on the held record. Returns false if `id` is not held.
    pub fn update(&self, id: &str, update: impl FnOnce(&mut R)) -> bool {
        match self.inner.write().records.get_mut(id) {
            Some(record) => {
                update(record);
                true
            }
            None => false,
        }
    }
}

fn apply_score<R: Reconcilable>(record: &mut R, change: ScoreChange, vote_in_flight: bool) {
    let next = match change {
        ScoreChange::Delta(delta) => {
            let score = record.score() + delta;
            record.clone().with_vote_state(score, record.user_vote())
        }
        ScoreChange::Absolute(score) => reconcile::merge_live_score(record, score, vote_in_flight),
    };
    *record = next;
}

pub fn patch_post(post: &mut PostRecord, patch: &PostPatch, vote_in_flight: bool) {
    if let Some(change) = patch.score {
        apply_score(post, change, vote_in_flight);
    }
    if let Some(count) = patch.comment_count {
        post.comment_count = count;
    }
    if let Some(ContentChange { content, edited_at }) = &patch.content {
        post.content = content.clone();
        post.updated_at = *edited_at;
    }
    if let Some(deleted) = patch.is_deleted {
        post.is_deleted = deleted;
    }
}

pub fn patch_comment(comment: &mut CommentRecord, patch: &CommentPatch, vote_in_flight: bool) {
    if let Some(change) = patch.score {
        apply_score(comment, change, vote_in_flight);
    }
    if let Some(count) = patch.reply_count {
        comment.reply_count = count;
    }
    if let Some(ContentChange { content, edited_at }) = &patch.content {
        comment.content = content.clone();
        comment.edited_at = *edited_at;
    }
    if let Some(deleted) = patch.is_deleted {
        comment.is_deleted = deleted;
    }
}

impl RecordStore<PostRecord> {
    pub fn apply_patch(&self, patch: &PostPatch) -> bool {
        self.patch_held(&patch.id, |post, in_flight| patch_post(post, patch, in_flight))
    }
}

impl RecordStore<CommentRecord> {
    pub fn apply_patch(&self, patch: &CommentPatch) -> bool {
        self.patch_held(&patch.id, |comment, in_flight| {
            patch_comment(comment, patch, in_flight)
        })
    }
}

impl<R: StoreRecord> VoteApplier for RecordStore<R> {
    fn apply_vote(&self, target: &VoteTarget, patch: VotePatch) {
        let mut inner = self.inner.write();
        let Some(record) = inner.records.get_mut(&target.id) else {
            trace!(target = "tide.store", id = %target.id, "vote for record not held");
            return;
        };
        *record = record.clone().with_vote_state(patch.score, patch.vote);
        *inner.in_flight.entry(target.id.clone()).or_default() += 1;
    }

    /// Removes only the predicted delta, so live changes that arrived while
    /// the call was pending survive the rollback.
    fn revert_vote(&self, target: &VoteTarget, reversal: VoteReversal) {
        let mut inner = self.inner.write();
        Self::release_vote(&mut inner, &target.id);
        if let Some(record) = inner.records.get_mut(&target.id) {
            *record = reconcile::undo_vote(record, reversal.applied_delta, reversal.previous_vote);
            debug!(target = "tide.store", id = %target.id, score = record.score(), "vote prediction undone");
        }
    }

    fn settle_vote(&self, target: &VoteTarget) {
        Self::release_vote(&mut self.inner.write(), &target.id);
    }
}

impl<R: StoreRecord> ProvisionalSink<R> for RecordStore<R> {
    fn insert_provisional(&self, record: R) {
        let mut inner = self.inner.write();
        let id = record.id().to_string();
        if inner.records.insert(id.clone(), record).is_none() {
            inner.place(id, self.insert_at);
        }
    }

    fn remove_provisional(&self, provisional_id: &str) {
        self.inner.write().forget(provisional_id);
    }

    /// Replaces the provisional record in place. If the live feed already
    /// delivered the server record, the provisional slot is simply dropped.
    fn promote(&self, provisional_id: &str, record: R) {
        let mut inner = self.inner.write();
        let id = record.id().to_string();
        if inner.records.contains_key(&id) {
            inner.forget(provisional_id);
            inner.records.insert(id, record);
            return;
        }
        match inner.order.iter().position(|existing| existing == provisional_id) {
            Some(index) => {
                inner.records.remove(provisional_id);
                inner.order[index] = id.clone();
            }
            None => inner.place(id.clone(), self.insert_at),
        }
        debug!(target = "tide.store", provisional_id, id = %id, "provisional record promoted");
        inner.records.insert(id, record);
    }
}

impl FeedListener for RecordStore<PostRecord> {
    fn on_insert(&self, post: PostRecord) {
        self.insert_live(post);
    }

    fn on_update(&self, patch: PostPatch) {
        self.apply_patch(&patch);
    }

    fn on_delete(&self, post_id: &str) {
        self.remove(post_id);
    }
}

/// One thread: the root post plus its comments, oldest first.
pub struct ThreadStore {
    post: RwLock<Option<PostRecord>>,
    pub comments: RecordStore<CommentRecord>,
}

impl Default for ThreadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadStore {
    pub fn new() -> Self {
        Self {
            post: RwLock::new(None),
            comments: RecordStore::new(InsertAt::Back),
        }
    }

    pub fn post(&self) -> Option<PostRecord> {
        self.post.read().clone()
    }

    /// Sets the root post, merging against the held copy if there is one.
    pub fn ingest_post(&self, fresh: PostRecord) {
        let mut post = self.post.write();
        let next = match post.as_ref() {
            Some(held) if held.id == fresh.id => reconcile::merge(&fresh, held),
            _ => fresh,
        };
        *post = Some(next);
    }
}

impl ThreadListener for ThreadStore {
    fn on_new_comment(&self, comment: CommentRecord) {
        let parent = comment.parent_id.clone();
        if self.comments.insert_live(comment) {
            if let Some(parent) = parent {
                self.comments.update(&parent, |reply_to| {
                    reply_to.reply_count = reply_to.reply_count.saturating_add(1)
                });
            }
        }
    }

    fn on_comment_update(&self, patch: CommentPatch) {
        self.comments.apply_patch(&patch);
    }

    fn on_comment_delete(&self, comment_id: &str) {
        self.comments.remove(comment_id);
    }

    fn on_post_update(&self, patch: PostPatch) {
        if let Some(post) = self.post.write().as_mut().filter(|post| post.id == patch.id) {
            // Votes on the root post are not predicted through this store.
            patch_post(post, &patch, false);
        }
    }
}
