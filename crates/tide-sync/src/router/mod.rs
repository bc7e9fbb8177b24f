//! Topic routing: feed and thread subscriptions multiplexed onto
//! connection topics, with raw changes normalized into typed callbacks.

pub mod diff;
pub mod normalize;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use change_feed::{FeedKey, RawChange, RowFilter};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::config::RouterConfig;
use crate::connection::{ChangeHandler, ConnectionManager, TopicHandle};
use crate::model::{score_delta, CommentRecord, PostId, PostRecord, TargetType, UserId, VoteTarget};
use crate::telemetry::PerfGuard;

pub use diff::{CommentPatch, ContentChange, PostPatch, ScoreChange};
pub use normalize::{DomainChangeEvent, DomainRecord, NormalizeError};

use normalize::{COMMENTS_TABLE, POSTS_TABLE, VOTES_TABLE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedType {
    Hot,
    New,
    Top,
    Rising,
}

impl FeedType {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedType::Hot => "hot",
            FeedType::New => "new",
            FeedType::Top => "top",
            FeedType::Rising => "rising",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "hot" => Some(FeedType::Hot),
            "new" => Some(FeedType::New),
            "top" => Some(FeedType::Top),
            "rising" => Some(FeedType::Rising),
            _ => None,
        }
    }
}

/// Receives live changes for a feed. Score changes caused by votes arrive
/// as `on_update` with a [`ScoreChange::Delta`].
pub trait FeedListener: Send + Sync {
    fn on_insert(&self, post: PostRecord);
    fn on_update(&self, patch: PostPatch);
    fn on_delete(&self, post_id: &str);
}

pub trait ThreadListener: Send + Sync {
    fn on_new_comment(&self, comment: CommentRecord);
    fn on_comment_update(&self, patch: CommentPatch);
    fn on_comment_delete(&self, comment_id: &str);
    fn on_post_update(&self, patch: PostPatch);
}

pub fn feed_topic(feed: FeedType) -> String {
    format!("feed:{}", feed.as_str())
}

pub fn thread_topic(thread_id: &str) -> String {
    format!("thread:{thread_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RouteKey {
    Feed(FeedType),
    Thread(PostId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Created,
    Joined(usize),
}

struct Fanout<L: ?Sized> {
    listeners: RwLock<Vec<(u64, Arc<L>)>>,
}

impl<L: ?Sized> Fanout<L> {
    fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, id: u64, listener: Arc<L>) -> usize {
        let mut listeners = self.listeners.write();
        listeners.push((id, listener));
        listeners.len()
    }

    fn remove(&self, id: u64) -> usize {
        let mut listeners = self.listeners.write();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len()
    }

    /// Listeners are called outside the lock so they may (un)subscribe.
    fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }
}

enum RouteListeners {
    Feed(Arc<Fanout<dyn FeedListener>>),
    Thread(Arc<Fanout<dyn ThreadListener>>),
}

impl RouteListeners {
    fn remove(&self, id: u64) -> usize {
        match self {
            RouteListeners::Feed(fanout) => fanout.remove(id),
            RouteListeners::Thread(fanout) => fanout.remove(id),
        }
    }
}

struct Route {
    listeners: RouteListeners,
    topics: Vec<TopicHandle>,
}

#[derive(Clone)]
pub struct TopicRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    connection: ConnectionManager,
    local_user_id: Option<UserId>,
    routes: Mutex<HashMap<RouteKey, Route>>,
    next_listener: AtomicU64,
}

/// Releases its share of a feed or thread route on `unsubscribe` or drop.
/// The last release tears down every topic the route opened.
pub struct RouterSubscription {
    router: TopicRouter,
    key: RouteKey,
    listener_id: u64,
    status: PoolStatus,
    released: AtomicBool,
}

impl RouterSubscription {
    pub fn status(&self) -> PoolStatus {
        self.status
    }

    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.router.release(&self.key, self.listener_id);
    }
}

impl Drop for RouterSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for RouterSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterSubscription")
            .field("key", &self.key)
            .field("status", &self.status)
            .finish()
    }
}

impl TopicRouter {
    pub fn new(connection: ConnectionManager, config: &RouterConfig) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                connection,
                local_user_id: config.local_user_id.clone(),
                routes: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Number of feed and thread routes currently holding topics open.
    pub fn active_routes(&self) -> usize {
        self.inner.routes.lock().len()
    }

    /// Post changes and post-vote changes for one feed.
    pub fn subscribe_to_feed(
        &self,
        feed: FeedType,
        listener: Arc<dyn FeedListener>,
    ) -> RouterSubscription {
        let key = RouteKey::Feed(feed);
        let listener_id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let mut routes = self.inner.routes.lock();

        let status = match routes.get(&key) {
            Some(Route {
                listeners: RouteListeners::Feed(fanout),
                ..
            }) => PoolStatus::Joined(fanout.add(listener_id, listener)),
            _ => {
                let fanout: Arc<Fanout<dyn FeedListener>> = Arc::new(Fanout::new());
                fanout.add(listener_id, listener);
                let dispatch = Arc::new(FeedDispatch {
                    listeners: fanout.clone(),
                    local_user_id: self.inner.local_user_id.clone(),
                    row_scored: RowScored::default(),
                });
                let topic = feed_topic(feed);
                let posts = self.open_topic(
                    topic.clone(),
                    FeedKey::table(POSTS_TABLE),
                    dispatch.clone(),
                    FeedDispatch::posts,
                );
                let votes = self.open_topic(
                    format!("{topic}:votes"),
                    FeedKey::filtered(
                        VOTES_TABLE,
                        RowFilter::eq("target_type", TargetType::Post.as_str()),
                    ),
                    dispatch,
                    FeedDispatch::votes,
                );
                routes.insert(
                    key.clone(),
                    Route {
                        listeners: RouteListeners::Feed(fanout),
                        topics: vec![posts, votes],
                    },
                );
                PoolStatus::Created
            }
        };
        info!(target = "tide.router", feed = feed.as_str(), ?status, "feed subscribed");

        RouterSubscription {
            router: self.clone(),
            key,
            listener_id,
            status,
            released: AtomicBool::new(false),
        }
    }

    /// Comment changes, vote changes and post changes scoped to one thread.
    pub fn subscribe_to_thread(
        &self,
        thread_id: impl Into<PostId>,
        listener: Arc<dyn ThreadListener>,
    ) -> RouterSubscription {
        let thread_id = thread_id.into();
        let key = RouteKey::Thread(thread_id.clone());
        let listener_id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let mut routes = self.inner.routes.lock();

        let status = match routes.get(&key) {
            Some(Route {
                listeners: RouteListeners::Thread(fanout),
                ..
            }) => PoolStatus::Joined(fanout.add(listener_id, listener)),
            _ => {
                let fanout: Arc<Fanout<dyn ThreadListener>> = Arc::new(Fanout::new());
                fanout.add(listener_id, listener);
                let dispatch = Arc::new(ThreadDispatch {
                    listeners: fanout.clone(),
                    local_user_id: self.inner.local_user_id.clone(),
                    row_scored: RowScored::default(),
                });
                let topic = thread_topic(&thread_id);
                let comments = self.open_topic(
                    topic.clone(),
                    FeedKey::filtered(COMMENTS_TABLE, RowFilter::eq("post_id", thread_id.clone())),
                    dispatch.clone(),
                    ThreadDispatch::comments,
                );
                let votes = self.open_topic(
                    format!("{topic}:votes"),
                    FeedKey::filtered(VOTES_TABLE, RowFilter::eq("thread_id", thread_id.clone())),
                    dispatch.clone(),
                    ThreadDispatch::votes,
                );
                let post = self.open_topic(
                    format!("{topic}:post"),
                    FeedKey::filtered(POSTS_TABLE, RowFilter::eq("id", thread_id.clone())),
                    dispatch,
                    ThreadDispatch::post,
                );
                routes.insert(
                    key.clone(),
                    Route {
                        listeners: RouteListeners::Thread(fanout),
                        topics: vec![comments, votes, post],
                    },
                );
                PoolStatus::Created
            }
        };
        info!(target = "tide.router", thread = %thread_id, ?status, "thread subscribed");

        RouterSubscription {
            router: self.clone(),
            key,
            listener_id,
            status,
            released: AtomicBool::new(false),
        }
    }

    fn open_topic<D>(
        &self,
        topic: String,
        key: FeedKey,
        dispatch: Arc<D>,
        route: fn(&D, &str, RawChange),
    ) -> TopicHandle
    where
        D: Send + Sync + 'static,
    {
        let label = topic.clone();
        let handler: Arc<dyn ChangeHandler> =
            Arc::new(move |change: RawChange| route(&dispatch, &label, change));
        debug!(target = "tide.router", topic = %topic, key = %key, "opening topic");
        self.inner.connection.subscribe_to_topic(topic, key, handler)
    }

    fn release(&self, key: &RouteKey, listener_id: u64) {
        let torn_down = {
            let mut routes = self.inner.routes.lock();
            let remaining = match routes.get(key) {
                Some(route) => route.listeners.remove(listener_id),
                None => return,
            };
            if remaining > 0 {
                debug!(target = "tide.router", ?key, remaining, "route still shared");
                return;
            }
            routes.remove(key)
        };
        if let Some(route) = torn_down {
            for topic in &route.topics {
                topic.unsubscribe();
            }
            info!(target = "tide.router", ?key, topics = route.topics.len(), "route released");
        }
    }
}

/// Signed score change a vote notification implies, or `None` when it
/// cannot be derived (missing vote column, key-only delete image).
pub fn vote_score_delta(event: &DomainChangeEvent) -> Option<(VoteTarget, i64)> {
    let (target, delta) = match event {
        DomainChangeEvent::Inserted(DomainRecord::Vote(vote)) => {
            (vote.target.clone(), vote.vote?.weight())
        }
        DomainChangeEvent::Deleted(DomainRecord::Vote(vote)) => {
            (vote.target.clone(), -vote.vote?.weight())
        }
        DomainChangeEvent::Updated {
            before: Some(DomainRecord::Vote(before)),
            after: DomainRecord::Vote(after),
        } => {
            let previous = before.vote?;
            (after.target.clone(), score_delta(Some(previous), after.vote))
        }
        _ => return None,
    };
    (delta != 0).then_some((target, delta))
}

fn vote_author(event: &DomainChangeEvent) -> Option<&str> {
    match event {
        DomainChangeEvent::Inserted(DomainRecord::Vote(vote))
        | DomainChangeEvent::Deleted(DomainRecord::Vote(vote))
        | DomainChangeEvent::Updated {
            after: DomainRecord::Vote(vote),
            ..
        } => vote.user_id.as_deref(),
        _ => None,
    }
}

fn normalized(topic: &str, change: &RawChange) -> Option<DomainChangeEvent> {
    let _perf = PerfGuard::new("router.normalize");
    match normalize::normalize(change) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(
                target = "tide.router",
                topic = %topic,
                table = %change.table,
                error = %err,
                "dropping change that could not be normalized"
            );
            None
        }
    }
}

fn vote_delta_for(
    local_user_id: Option<&str>,
    topic: &str,
    change: &RawChange,
) -> Option<(VoteTarget, i64)> {
    let event = normalized(topic, change)?;
    if let (Some(local), Some(author)) = (local_user_id, vote_author(&event)) {
        if local == author {
            trace!(target = "tide.router", topic = %topic, "skipping echo of local vote");
            return None;
        }
    }
    let delta = vote_score_delta(&event);
    if delta.is_none() {
        trace!(target = "tide.router", topic = %topic, "vote change carries no score delta");
    }
    delta
}

/// Records whose row updates carry the score. The row already counts every
/// vote, so vote notifications for these records are not turned into
/// deltas; otherwise one remote vote would land twice.
#[derive(Default)]
struct RowScored {
    ids: Mutex<HashSet<(TargetType, String)>>,
}

impl RowScored {
    fn note(&self, kind: TargetType, id: &str, row: &Value) {
        if row.get("score").is_some() {
            self.ids.lock().insert((kind, id.to_string()));
        }
    }

    fn forget(&self, kind: TargetType, id: &str) {
        self.ids.lock().remove(&(kind, id.to_string()));
    }

    fn covers(&self, target: &VoteTarget) -> bool {
        self.ids.lock().contains(&(target.kind, target.id.clone()))
    }
}

/// Vote delta for `change`, unless the target's rows already carry its score.
fn uncounted_vote_delta(
    local_user_id: Option<&str>,
    row_scored: &RowScored,
    topic: &str,
    change: &RawChange,
) -> Option<(VoteTarget, i64)> {
    let (target, delta) = vote_delta_for(local_user_id, topic, change)?;
    if row_scored.covers(&target) {
        trace!(target = "tide.router", topic = %topic, id = %target.id, "score follows row updates; vote delta skipped");
        return None;
    }
    Some((target, delta))
}

struct FeedDispatch {
    listeners: Arc<Fanout<dyn FeedListener>>,
    local_user_id: Option<UserId>,
    row_scored: RowScored,
}

impl FeedDispatch {
    fn posts(&self, topic: &str, change: RawChange) {
        let Some(event) = normalized(topic, &change) else {
            return;
        };
        match event {
            DomainChangeEvent::Inserted(DomainRecord::Post(post)) => {
                for listener in self.listeners.snapshot() {
                    listener.on_insert(post.clone());
                }
            }
            DomainChangeEvent::Updated {
                after: DomainRecord::Post(post),
                ..
            } => {
                let Some(after) = change.after.as_ref() else {
                    return;
                };
                let patch = diff::post_patch(post.id, change.before.as_ref(), after);
                self.row_scored.note(TargetType::Post, &patch.id, after);
                if patch.is_empty() {
                    trace!(target = "tide.router", topic = %topic, "update changed no tracked fields");
                    return;
                }
                for listener in self.listeners.snapshot() {
                    listener.on_update(patch.clone());
                }
            }
            DomainChangeEvent::Deleted(DomainRecord::Post(post)) => {
                self.row_scored.forget(TargetType::Post, &post.id);
                for listener in self.listeners.snapshot() {
                    listener.on_delete(&post.id);
                }
            }
            other => debug!(target = "tide.router", topic = %topic, event = ?other, "unexpected record on feed topic"),
        }
    }

    fn votes(&self, topic: &str, change: RawChange) {
        let Some((target, delta)) = uncounted_vote_delta(
            self.local_user_id.as_deref(),
            &self.row_scored,
            topic,
            &change,
        ) else {
            return;
        };
        if target.kind != TargetType::Post {
            return;
        }
        let patch = PostPatch::score_delta(target.id, delta);
        for listener in self.listeners.snapshot() {
            listener.on_update(patch.clone());
        }
    }
}

struct ThreadDispatch {
    listeners: Arc<Fanout<dyn ThreadListener>>,
    local_user_id: Option<UserId>,
    row_scored: RowScored,
}

impl ThreadDispatch {
    fn comments(&self, topic: &str, change: RawChange) {
        let Some(event) = normalized(topic, &change) else {
            return;
        };
        match event {
            DomainChangeEvent::Inserted(DomainRecord::Comment(comment)) => {
                for listener in self.listeners.snapshot() {
                    listener.on_new_comment(comment.clone());
                }
            }
            DomainChangeEvent::Updated {
                after: DomainRecord::Comment(comment),
                ..
            } => {
                let Some(after) = change.after.as_ref() else {
                    return;
                };
                let patch = diff::comment_patch(comment.id, change.before.as_ref(), after);
                self.row_scored.note(TargetType::Comment, &patch.id, after);
                if patch.is_empty() {
                    return;
                }
                for listener in self.listeners.snapshot() {
                    listener.on_comment_update(patch.clone());
                }
            }
            DomainChangeEvent::Deleted(DomainRecord::Comment(comment)) => {
                self.row_scored.forget(TargetType::Comment, &comment.id);
                for listener in self.listeners.snapshot() {
                    listener.on_comment_delete(&comment.id);
                }
            }
            other => debug!(target = "tide.router", topic = %topic, event = ?other, "unexpected record on thread topic"),
        }
    }

    fn votes(&self, topic: &str, change: RawChange) {
        let Some((target, delta)) = uncounted_vote_delta(
            self.local_user_id.as_deref(),
            &self.row_scored,
            topic,
            &change,
        ) else {
            return;
        };
        match target.kind {
            TargetType::Post => {
                let patch = PostPatch::score_delta(target.id, delta);
                for listener in self.listeners.snapshot() {
                    listener.on_post_update(patch.clone());
                }
            }
            TargetType::Comment => {
                let patch = CommentPatch::score_delta(target.id, delta);
                for listener in self.listeners.snapshot() {
                    listener.on_comment_update(patch.clone());
                }
            }
        }
    }

    fn post(&self, topic: &str, change: RawChange) {
        let Some(event) = normalized(topic, &change) else {
            return;
        };
        let patch = match event {
            DomainChangeEvent::Updated {
                after: DomainRecord::Post(post),
                ..
            } => match change.after.as_ref() {
                Some(after) => {
                    let patch = diff::post_patch(post.id, change.before.as_ref(), after);
                    self.row_scored.note(TargetType::Post, &patch.id, after);
                    patch
                }
                None => return,
            },
            DomainChangeEvent::Deleted(DomainRecord::Post(post)) => PostPatch {
                is_deleted: Some(true),
                ..PostPatch::new(post.id)
            },
            _ => return,
        };
        if patch.is_empty() {
            return;
        }
        for listener in self.listeners.snapshot() {
            listener.on_post_update(patch.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::BackoffPolicy;
    use crate::model::VoteDirection;
    use change_feed::LocalFeed;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: parking_lot::Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl FeedListener for Recorder {
        fn on_insert(&self, post: PostRecord) {
            self.events
                .lock()
                .push(format!("insert {} by {}", post.id, post.author.id));
        }
        fn on_update(&self, patch: PostPatch) {
            self.events.lock().push(format!("update {patch:?}"));
        }
        fn on_delete(&self, post_id: &str) {
            self.events.lock().push(format!("delete {post_id}"));
        }
    }

    impl ThreadListener for Recorder {
        fn on_new_comment(&self, comment: CommentRecord) {
            self.events.lock().push(format!("comment {}", comment.id));
        }
        fn on_comment_update(&self, patch: CommentPatch) {
            self.events.lock().push(format!("comment-update {patch:?}"));
        }
        fn on_comment_delete(&self, comment_id: &str) {
            self.events.lock().push(format!("comment-delete {comment_id}"));
        }
        fn on_post_update(&self, patch: PostPatch) {
            self.events.lock().push(format!("post-update {patch:?}"));
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn connected(local_user: Option<&str>) -> (Arc<LocalFeed>, TopicRouter) {
        let feed = Arc::new(LocalFeed::new());
        let connection =
            ConnectionManager::new(feed.clone(), BackoffPolicy::default(), ConnectionConfig::default());
        connection.connect().await.expect("connect");
        let router = TopicRouter::new(
            connection,
            &RouterConfig {
                local_user_id: local_user.map(str::to_owned),
            },
        );
        (feed, router)
    }

    #[tokio::test(start_paused = true)]
    async fn feed_routes_posts_and_vote_deltas() {
        let (feed, router) = connected(Some("me")).await;
        let recorder = Arc::new(Recorder::default());
        let _sub = router.subscribe_to_feed(FeedType::Hot, recorder.clone());
        settle().await;
        assert!(feed.is_joined("feed:hot"));
        assert!(feed.is_joined("feed:hot:votes"));

        feed.publish(RawChange::insert("posts", json!({"id": "p1", "author_id": "u2"})));
        // separate topics are pumped independently; settle to keep the log ordered
        settle().await;
        feed.publish(RawChange::insert(
            "votes",
            json!({"user_id": "u3", "target_id": "p1", "target_type": "post", "vote": 1}),
        ));
        feed.publish(RawChange::insert(
            "votes",
            json!({"user_id": "me", "target_id": "p1", "target_type": "post", "vote": 1}),
        ));
        feed.publish(RawChange::update(
            "votes",
            Some(json!({"user_id": "u3", "target_id": "p1", "target_type": "post", "vote": "up"})),
            json!({"user_id": "u3", "target_id": "p1", "target_type": "post", "vote": "down"}),
        ));
        feed.publish(RawChange::delete(
            "votes",
            json!({"id": "v1", "target_id": "p1", "target_type": "post"}),
        ));
        settle().await;

        let expected_up = format!("update {:?}", PostPatch::score_delta("p1", 1));
        let expected_flip = format!("update {:?}", PostPatch::score_delta("p1", -2));
        assert_eq!(
            recorder.take(),
            vec!["insert p1 by u2".to_string(), expected_up, expected_flip]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn feed_updates_carry_only_changed_fields() {
        let (feed, router) = connected(None).await;
        let recorder = Arc::new(Recorder::default());
        let _sub = router.subscribe_to_feed(FeedType::New, recorder.clone());
        settle().await;

        feed.publish(RawChange::update(
            "posts",
            Some(json!({"id": "p1", "score": 1, "comment_count": 4})),
            json!({"id": "p1", "score": 1, "comment_count": 5}),
        ));
        feed.publish(RawChange::update(
            "posts",
            Some(json!({"id": "p1", "score": 1})),
            json!({"id": "p1", "score": 1}),
        ));
        feed.publish(RawChange::delete("posts", json!({"id": "p1"})));
        feed.publish(RawChange::insert("posts", json!({"title": "missing id"})));
        settle().await;

        let patch = PostPatch {
            comment_count: Some(5),
            ..PostPatch::new("p1")
        };
        assert_eq!(
            recorder.take(),
            vec![format!("update {patch:?}"), "delete p1".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn row_scored_records_stop_taking_vote_deltas() {
        let (feed, router) = connected(None).await;
        let recorder = Arc::new(Recorder::default());
        let _sub = router.subscribe_to_feed(FeedType::Hot, recorder.clone());
        settle().await;

        // p2 has no row score yet, so its vote still becomes a delta
        feed.publish(RawChange::insert(
            "votes",
            json!({"user_id": "u3", "target_id": "p2", "target_type": "post", "vote": 1}),
        ));
        settle().await;

        feed.publish(RawChange::update(
            "posts",
            Some(json!({"id": "p1", "score": 10})),
            json!({"id": "p1", "score": 11}),
        ));
        settle().await;
        // the vote behind that row change arrives afterwards
        feed.publish(RawChange::insert(
            "votes",
            json!({"user_id": "u3", "target_id": "p1", "target_type": "post", "vote": 1}),
        ));
        settle().await;

        let row = PostPatch {
            score: Some(ScoreChange::Absolute(11)),
            ..PostPatch::new("p1")
        };
        assert_eq!(
            recorder.take(),
            vec![
                format!("update {:?}", PostPatch::score_delta("p2", 1)),
                format!("update {row:?}"),
            ]
        );

        // a deleted record starts over
        feed.publish(RawChange::delete("posts", json!({"id": "p1"})));
        settle().await;
        feed.publish(RawChange::insert(
            "votes",
            json!({"user_id": "u4", "target_id": "p1", "target_type": "post", "vote": -1}),
        ));
        settle().await;
        assert_eq!(
            recorder.take(),
            vec![
                "delete p1".to_string(),
                format!("update {:?}", PostPatch::score_delta("p1", -1)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn thread_routes_comments_votes_and_post() {
        let (feed, router) = connected(None).await;
        let recorder = Arc::new(Recorder::default());
        let _sub = router.subscribe_to_thread("42", recorder.clone());
        settle().await;

        feed.publish(RawChange::insert("comments", json!({"id": "c1", "post_id": 42})));
        feed.publish(RawChange::insert("comments", json!({"id": "c2", "post_id": 7})));
        settle().await;
        feed.publish(RawChange::insert(
            "votes",
            json!({"thread_id": "42", "target_id": "c1", "target_type": "comment", "vote": -1}),
        ));
        settle().await;
        feed.publish(RawChange::update(
            "posts",
            Some(json!({"id": "42", "comment_count": 0})),
            json!({"id": "42", "comment_count": 1}),
        ));
        settle().await;
        feed.publish(RawChange::delete("comments", json!({"id": "c1", "post_id": 42})));
        settle().await;

        let post_patch = PostPatch {
            comment_count: Some(1),
            ..PostPatch::new("42")
        };
        assert_eq!(
            recorder.take(),
            vec![
                "comment c1".to_string(),
                format!("comment-update {:?}", CommentPatch::score_delta("c1", -1)),
                format!("post-update {post_patch:?}"),
                "comment-delete c1".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shared_thread_route_is_reference_counted() {
        let (feed, router) = connected(None).await;
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let a = router.subscribe_to_thread("9", first.clone());
        let b = router.subscribe_to_thread("9", second.clone());
        settle().await;

        assert_eq!(a.status(), PoolStatus::Created);
        assert_eq!(b.status(), PoolStatus::Joined(2));
        assert_eq!(feed.channel_count(), 3);
        assert_eq!(router.active_routes(), 1);

        feed.publish(RawChange::insert("comments", json!({"id": "c1", "post_id": "9"})));
        settle().await;
        assert_eq!(first.take(), vec!["comment c1".to_string()]);
        assert_eq!(second.take(), vec!["comment c1".to_string()]);

        a.unsubscribe();
        a.unsubscribe();
        assert_eq!(feed.channel_count(), 3);
        drop(b);
        assert_eq!(feed.channel_count(), 0);
        assert_eq!(router.active_routes(), 0);
        assert!(router.connection().state().active_topics.is_empty());
    }

    #[test]
    fn vote_delta_needs_both_images_on_update() {
        let after = crate::model::VoteRecord {
            id: None,
            user_id: None,
            target: VoteTarget::post("p1"),
            vote: Some(VoteDirection::Up),
            thread_id: None,
        };
        let event = DomainChangeEvent::Updated {
            before: None,
            after: DomainRecord::Vote(after.clone()),
        };
        assert_eq!(vote_score_delta(&event), None);

        let event = DomainChangeEvent::Updated {
            before: Some(DomainRecord::Vote(crate::model::VoteRecord {
                vote: Some(VoteDirection::Down),
                ..after.clone()
            })),
            after: DomainRecord::Vote(after),
        };
        assert_eq!(vote_score_delta(&event), Some((VoteTarget::post("p1"), 2)));
    }

    #[test]
    fn feed_types_round_trip_names() {
        for feed in [FeedType::Hot, FeedType::New, FeedType::Top, FeedType::Rising] {
            assert_eq!(FeedType::parse(feed.as_str()), Some(feed));
        }
        assert_eq!(feed_topic(FeedType::Rising), "feed:rising");
        assert_eq!(thread_topic("7"), "thread:7");
    }
}
