//! Connection lifecycle: one logical connection to the realtime backend,
//! reconnect with exponential backoff, per-topic channel supervision, and
//! environment gating (online / visible / focused).

mod backoff;
mod state;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use change_feed::{ChangeFeed, FeedError, FeedEvent, FeedKey, RawChange};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::{ConnectionConfig, SyncConfig};
use crate::error::ConnectionError;
use crate::telemetry::PerfGuard;

pub use backoff::BackoffPolicy;
pub use state::{ConnectionState, ConnectionStatus, TopicId};

/// Receives raw changes for one topic, in the order the backend sent them.
pub trait ChangeHandler: Send + Sync {
    fn handle(&self, change: RawChange);
}

impl<F> ChangeHandler for F
where
    F: Fn(RawChange) + Send + Sync,
{
    fn handle(&self, change: RawChange) {
        (self)(change)
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    feed: Arc<dyn ChangeFeed>,
    policy: BackoffPolicy,
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    core: Mutex<Core>,
}

struct Core {
    /// Bumped on every connect attempt and teardown; stale completions compare against it.
    epoch: u64,
    /// Set by `connect`, cleared by `disconnect`. Nothing reconnects unless set.
    wanted: bool,
    exhausted: bool,
    focused: bool,
    attach_seq: u64,
    backoff_timer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    topics: HashMap<TopicId, TopicEntry>,
}

struct TopicEntry {
    key: FeedKey,
    handler: Arc<dyn ChangeHandler>,
    task: Option<JoinHandle<()>>,
    seq: u64,
    errors: u32,
}

/// Handle returned by [`ConnectionManager::subscribe_to_topic`].
#[derive(Clone)]
pub struct TopicHandle {
    manager: ConnectionManager,
    topic: TopicId,
}

impl TopicHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Releases the topic. Safe to call repeatedly or while the attach is in flight.
    pub fn unsubscribe(&self) {
        self.manager.unsubscribe_topic(&self.topic);
    }
}

impl std::fmt::Debug for TopicHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicHandle").field("topic", &self.topic).finish()
    }
}

impl ConnectionManager {
    pub fn new(feed: Arc<dyn ChangeFeed>, policy: BackoffPolicy, config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        Self {
            inner: Arc::new(Inner {
                feed,
                policy,
                config,
                state,
                core: Mutex::new(Core {
                    epoch: 0,
                    wanted: false,
                    exhausted: false,
                    focused: true,
                    attach_seq: 0,
                    backoff_timer: None,
                    heartbeat: None,
                    topics: HashMap::new(),
                }),
            }),
        }
    }

    pub fn from_config(feed: Arc<dyn ChangeFeed>, config: &SyncConfig) -> Self {
        Self::new(
            feed,
            BackoffPolicy::from(&config.backoff),
            config.connection.clone(),
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.borrow().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// `Disconnected/Error -> Connecting -> Connected`. No-op while already
    /// connecting or connected.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.inner.core.lock().wanted = true;
        self.attempt().await
    }

    /// Tears down every topic, cancels timers and parks in `Disconnected`.
    /// Nothing reconnects until `connect` is called again.
    pub fn disconnect(&self) {
        info!(target = "tide.connection", "disconnect requested");
        self.teardown(true);
    }

    /// Manual recovery: drops the transport and connects again. Topic
    /// registrations survive and are re-attached once connected.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        info!(target = "tide.connection", "manual reconnect requested");
        self.teardown(false);
        self.connect().await
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.inner.state.send_if_modified(|state| {
            let changed = state.online != online;
            state.online = online;
            changed
        });
        if changed {
            debug!(target = "tide.connection", online, "network availability changed");
            self.reevaluate(online);
        }
    }

    pub fn set_visible(&self, visible: bool) {
        let changed = self.inner.state.send_if_modified(|state| {
            let changed = state.visible != visible;
            state.visible = visible;
            changed
        });
        if changed {
            debug!(target = "tide.connection", visible, "visibility changed");
            self.reevaluate(visible);
        }
    }

    pub fn set_focused(&self, focused: bool) {
        let regained = {
            let mut core = self.inner.core.lock();
            let regained = focused && !core.focused;
            core.focused = focused;
            regained
        };
        if regained {
            self.reevaluate(true);
        }
    }

    /// Registers `handler` for changes matching `key` under `topic`. Works in
    /// any state: topics registered before the connection is up are attached
    /// once it is. Subscribing to an active topic returns the existing handle
    /// and keeps the original handler.
    pub fn subscribe_to_topic(
        &self,
        topic: impl Into<TopicId>,
        key: FeedKey,
        handler: Arc<dyn ChangeHandler>,
    ) -> TopicHandle {
        let topic = topic.into();
        let mut core = self.inner.core.lock();
        if core.topics.contains_key(&topic) {
            debug!(target = "tide.connection", topic = %topic, "topic already active");
            return TopicHandle {
                manager: self.clone(),
                topic,
            };
        }

        core.topics.insert(
            topic.clone(),
            TopicEntry {
                key,
                handler,
                task: None,
                seq: 0,
                errors: 0,
            },
        );
        self.inner.state.send_modify(|state| {
            state.active_topics.insert(topic.clone());
        });

        if self.status() == ConnectionStatus::Connected {
            self.spawn_attach(&mut core, &topic, None);
        } else {
            debug!(target = "tide.connection", topic = %topic, "topic queued until connected");
        }

        TopicHandle {
            manager: self.clone(),
            topic,
        }
    }

    fn unsubscribe_topic(&self, topic: &str) {
        let removed = self.inner.core.lock().topics.remove(topic);
        let Some(entry) = removed else {
            return;
        };
        if let Some(task) = entry.task {
            task.abort();
        }
        self.inner.feed.leave(topic);
        self.inner.state.send_modify(|state| {
            state.active_topics.remove(topic);
        });
        debug!(target = "tide.connection", topic = %topic, "topic released");
    }

    fn attempt(&self) -> BoxFuture<'static, Result<(), ConnectionError>> {
        let this = self.clone();
        Box::pin(async move {
            let Some(epoch) = this.begin_attempt()? else {
                return Ok(());
            };
            let opened = {
                let _perf = PerfGuard::new("connection.open");
                this.inner.feed.open().await
            };
            this.finish_attempt(epoch, opened)
        })
    }

    fn begin_attempt(&self) -> Result<Option<u64>, ConnectionError> {
        let mut core = self.inner.core.lock();
        let state = self.state();
        if state.status.is_live() {
            return Ok(None);
        }
        if !core.wanted {
            return Err(ConnectionError::Disconnected);
        }
        if core.exhausted {
            return Err(ConnectionError::AttemptsExhausted {
                attempts: state.reconnect_attempts,
            });
        }
        if !state.online {
            debug!(target = "tide.connection", "connect deferred: offline");
            return Err(ConnectionError::Offline);
        }
        if !state.visible {
            debug!(target = "tide.connection", "connect deferred: backgrounded");
            return Err(ConnectionError::Backgrounded);
        }
        if let Some(timer) = core.backoff_timer.take() {
            timer.abort();
        }
        if !self.transition(ConnectionStatus::Connecting, |_| {}) {
            return Ok(None);
        }
        core.epoch += 1;
        debug!(
            target = "tide.connection",
            epoch = core.epoch,
            attempt = state.reconnect_attempts,
            "connecting"
        );
        Ok(Some(core.epoch))
    }

    fn finish_attempt(
        &self,
        epoch: u64,
        opened: Result<(), FeedError>,
    ) -> Result<(), ConnectionError> {
        let mut core = self.inner.core.lock();
        if core.epoch != epoch {
            debug!(target = "tide.connection", epoch, "discarding superseded connect attempt");
            if !core.wanted {
                if opened.is_ok() {
                    self.inner.feed.close();
                }
                return Err(ConnectionError::Disconnected);
            }
            return Ok(());
        }

        match opened {
            Ok(()) => {
                self.transition(ConnectionStatus::Connected, |state| {
                    state.reconnect_attempts = 0;
                    state.last_connected_at = Some(SystemTime::now());
                    state.last_error = None;
                });
                core.heartbeat = self.spawn_heartbeat(epoch);
                let topics: Vec<TopicId> = core.topics.keys().cloned().collect();
                for topic in &topics {
                    self.spawn_attach(&mut core, topic, None);
                }
                info!(
                    target = "tide.connection",
                    epoch,
                    topics = topics.len(),
                    "connected"
                );
                Ok(())
            }
            Err(err) => {
                let err = ConnectionError::Transport(err);
                warn!(target = "tide.connection", epoch, error = %err, "connect attempt failed");
                self.enter_error(&mut core, &err);
                Err(err)
            }
        }
    }

    /// Applies a status change if the edge is legal, together with `update`.
    fn transition(
        &self,
        next: ConnectionStatus,
        update: impl FnOnce(&mut ConnectionState),
    ) -> bool {
        self.inner.state.send_if_modified(|state| {
            if !state.status.can_transition_to(next) {
                trace!(
                    target = "tide.connection",
                    from = ?state.status,
                    to = ?next,
                    "ignoring illegal transition"
                );
                return false;
            }
            debug!(target = "tide.connection", from = ?state.status, to = ?next, "status transition");
            state.status = next;
            update(state);
            true
        })
    }

    /// Moves to `Error`, detaches every topic and arms the backoff timer
    /// unless the attempt cap is reached.
    fn enter_error(&self, core: &mut Core, err: &ConnectionError) {
        if let Some(heartbeat) = core.heartbeat.take() {
            heartbeat.abort();
        }
        for entry in core.topics.values_mut() {
            if let Some(task) = entry.task.take() {
                task.abort();
            }
            entry.errors = 0;
        }
        self.inner.feed.close();

        let mut attempt = 0;
        let moved = self.transition(ConnectionStatus::Error, |state| {
            attempt = state.reconnect_attempts;
            state.reconnect_attempts += 1;
            state.last_error = Some(err.to_string());
        });
        if !moved {
            return;
        }

        let failed = attempt + 1;
        if self.inner.policy.exhausted(failed) {
            core.exhausted = true;
            let terminal = ConnectionError::AttemptsExhausted { attempts: failed };
            self.inner.state.send_modify(|state| {
                state.last_error = Some(terminal.to_string());
            });
            error!(target = "tide.connection", attempts = failed, "reconnect attempts exhausted");
            return;
        }
        self.schedule_backoff(core, attempt);
    }

    fn schedule_backoff(&self, core: &mut Core, attempt: u32) {
        let state = self.state();
        if !state.online || !state.visible {
            debug!(
                target = "tide.connection",
                online = state.online,
                visible = state.visible,
                "reconnect suppressed until environment recovers"
            );
            return;
        }

        let delay = self.inner.policy.delay(attempt, &mut rand::thread_rng());
        info!(
            target = "tide.connection",
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        let this = self.clone();
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            this.inner.core.lock().backoff_timer = None;
            if let Err(err) = this.attempt().await {
                debug!(target = "tide.connection", error = %err, "scheduled reconnect did not connect");
            }
        });
        if let Some(previous) = core.backoff_timer.replace(timer) {
            previous.abort();
        }
    }

    fn spawn_heartbeat(&self, epoch: u64) -> Option<JoinHandle<()>> {
        let interval = self.inner.config.heartbeat_interval();
        if interval.is_zero() {
            return None;
        }
        let this = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match this.inner.feed.ping().await {
                    Ok(()) => trace!(target = "tide.connection", epoch, "heartbeat ok"),
                    Err(err) => {
                        warn!(target = "tide.connection", epoch, error = %err, "heartbeat failed");
                        this.fail_connection(epoch, ConnectionError::Transport(err));
                        break;
                    }
                }
            }
        }))
    }

    /// Transport-level failure while connected.
    fn fail_connection(&self, epoch: u64, err: ConnectionError) {
        let mut core = self.inner.core.lock();
        if core.epoch != epoch || self.status() != ConnectionStatus::Connected {
            return;
        }
        self.enter_error(&mut core, &err);
    }

    fn reevaluate(&self, regained: bool) {
        let state = self.state();
        let mut core = self.inner.core.lock();
        if !state.online || !state.visible {
            if let Some(timer) = core.backoff_timer.take() {
                timer.abort();
                debug!(target = "tide.connection", "pending reconnect cancelled by environment");
            }
            return;
        }
        if !regained {
            return;
        }

        match state.status {
            ConnectionStatus::Error | ConnectionStatus::Disconnected
                if core.wanted && !core.exhausted =>
            {
                info!(target = "tide.connection", "environment recovered; reconnecting now");
                drop(core);
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = this.attempt().await {
                        debug!(target = "tide.connection", error = %err, "environment-triggered reconnect failed");
                    }
                });
            }
            ConnectionStatus::Connected => {
                let epoch = core.epoch;
                drop(core);
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = this.inner.feed.ping().await {
                        warn!(target = "tide.connection", error = %err, "health check failed after resume");
                        this.fail_connection(epoch, ConnectionError::Transport(err));
                    }
                });
            }
            _ => {}
        }
    }

    fn teardown(&self, forget_topics: bool) {
        let mut core = self.inner.core.lock();
        core.wanted = false;
        core.exhausted = false;
        core.epoch += 1;
        if let Some(timer) = core.backoff_timer.take() {
            timer.abort();
        }
        if let Some(heartbeat) = core.heartbeat.take() {
            heartbeat.abort();
        }
        for entry in core.topics.values_mut() {
            if let Some(task) = entry.task.take() {
                task.abort();
            }
            entry.errors = 0;
        }
        if forget_topics {
            core.topics.clear();
        }
        let remaining: BTreeSet<TopicId> = core.topics.keys().cloned().collect();
        self.inner.feed.close();

        self.inner.state.send_modify(|state| {
            if state.status.can_transition_to(ConnectionStatus::Disconnected) {
                debug!(target = "tide.connection", from = ?state.status, "status transition to Disconnected");
                state.status = ConnectionStatus::Disconnected;
            }
            state.reconnect_attempts = 0;
            state.last_error = None;
            state.active_topics = remaining;
        });
    }

    fn spawn_attach(&self, core: &mut Core, topic: &str, delay: Option<Duration>) {
        core.attach_seq += 1;
        let seq = core.attach_seq;
        let Some(entry) = core.topics.get_mut(topic) else {
            return;
        };
        entry.seq = seq;
        let key = entry.key.clone();
        let topic_id = topic.to_string();
        let this = self.clone();
        let task = tokio::spawn(async move {
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            match this.inner.feed.join(&topic_id, &key).await {
                Ok(receiver) => this.pump(topic_id, seq, receiver).await,
                Err(err) => this.topic_failed(&topic_id, seq, err.to_string()),
            }
        });
        if let Some(previous) = entry.task.replace(task) {
            previous.abort();
        }
    }

    async fn pump(&self, topic: TopicId, seq: u64, mut receiver: broadcast::Receiver<FeedEvent>) {
        let current = self.inner.core.lock().topics.get(&topic).map(|entry| entry.seq);
        match current {
            None => {
                // Released while the join was in flight.
                self.inner.feed.leave(&topic);
                return;
            }
            Some(current) if current != seq => return,
            Some(_) => {}
        }
        debug!(target = "tide.connection", topic = %topic, seq, "topic attached");

        loop {
            match receiver.recv().await {
                Ok(FeedEvent::Change(change)) => {
                    let handler = {
                        let mut core = self.inner.core.lock();
                        match core.topics.get_mut(&topic) {
                            Some(entry) if entry.seq == seq => {
                                entry.errors = 0;
                                Arc::clone(&entry.handler)
                            }
                            _ => return,
                        }
                    };
                    handler.handle(change);
                }
                Ok(FeedEvent::ChannelError(reason)) => {
                    self.topic_failed(&topic, seq, reason);
                    return;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target = "tide.connection", topic = %topic, skipped, "topic receiver lagged; changes dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.topic_failed(&topic, seq, "channel closed".into());
                    return;
                }
            }
        }
    }

    /// Channel failure on one topic: resubscribe that topic alone, escalating
    /// to a connection-level error once the threshold is reached.
    fn topic_failed(&self, topic: &str, seq: u64, reason: String) {
        let mut core = self.inner.core.lock();
        let errors = match core.topics.get_mut(topic) {
            Some(entry) if entry.seq == seq => {
                entry.task = None;
                entry.errors += 1;
                entry.errors
            }
            _ => return,
        };
        if self.status() != ConnectionStatus::Connected {
            return;
        }

        let threshold = self.inner.config.topic_error_threshold.max(1);
        if errors >= threshold {
            warn!(
                target = "tide.connection",
                topic = %topic,
                errors,
                reason = %reason,
                "topic keeps failing; escalating to reconnect"
            );
            let err = ConnectionError::Transport(FeedError::Transport(reason));
            self.enter_error(&mut core, &err);
            return;
        }

        let delay = self.inner.config.topic_retry_delay() * errors;
        warn!(
            target = "tide.connection",
            topic = %topic,
            errors,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "topic channel failed; resubscribing"
        );
        self.spawn_attach(&mut core, topic, Some(delay));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use change_feed::LocalFeed;
    use serde_json::json;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval_ms: 5_000,
            topic_error_threshold: 3,
            topic_retry_delay_ms: 100,
        }
    }

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            jitter_max: Duration::ZERO,
            max_attempts,
        }
    }

    fn manager(feed: &Arc<LocalFeed>, max_attempts: u32) -> ConnectionManager {
        ConnectionManager::new(feed.clone(), policy(max_attempts), config())
    }

    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    fn recorder() -> (Arc<Mutex<Vec<RawChange>>>, Arc<dyn ChangeHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Arc<dyn ChangeHandler> = Arc::new(move |change: RawChange| {
            sink.lock().push(change);
        });
        (seen, handler)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let feed = Arc::new(LocalFeed::new());
        let manager = manager(&feed, 5);
        manager.connect().await.expect("connect");
        manager.connect().await.expect("second connect");
        assert!(manager.is_connected());
        assert_eq!(feed.open_count(), 1);
        assert!(manager.state().last_connected_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_backs_off_and_recovers() {
        let feed = Arc::new(LocalFeed::new());
        feed.fail_next_opens(2);
        let manager = manager(&feed, 5);

        assert!(manager.connect().await.is_err());
        assert_eq!(manager.status(), ConnectionStatus::Error);
        assert_eq!(manager.state().reconnect_attempts, 1);

        sleep(Duration::from_millis(99)).await;
        assert_eq!(feed.open_count(), 1);
        sleep(Duration::from_millis(2)).await;
        assert_eq!(feed.open_count(), 2);
        assert_eq!(manager.state().reconnect_attempts, 2);

        // second retry waits base * 2
        sleep(Duration::from_millis(201)).await;
        assert_eq!(feed.open_count(), 3);
        assert!(manager.is_connected());
        assert_eq!(manager.state().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_cap_is_terminal_until_manual_reconnect() {
        let feed = Arc::new(LocalFeed::new());
        feed.fail_next_opens(10);
        let manager = manager(&feed, 2);

        assert!(manager.connect().await.is_err());
        sleep(Duration::from_secs(5)).await;
        assert_eq!(feed.open_count(), 2);
        assert_eq!(manager.status(), ConnectionStatus::Error);
        let err = manager.connect().await.unwrap_err();
        assert_eq!(err, ConnectionError::AttemptsExhausted { attempts: 2 });
        assert!(manager
            .state()
            .last_error
            .unwrap_or_default()
            .contains("exhausted"));

        feed.fail_next_opens(0);
        manager.reconnect().await.expect("manual reconnect");
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_suppresses_reconnect_until_back_online() {
        let feed = Arc::new(LocalFeed::new());
        feed.fail_next_opens(1);
        let manager = manager(&feed, 5);

        assert!(manager.connect().await.is_err());
        manager.set_online(false);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(feed.open_count(), 1);
        assert_eq!(manager.status(), ConnectionStatus::Error);

        manager.set_online(true);
        settle().await;
        assert_eq!(feed.open_count(), 2);
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_backgrounded_waits_for_visibility() {
        let feed = Arc::new(LocalFeed::new());
        let manager = manager(&feed, 5);
        manager.set_visible(false);

        let err = manager.connect().await.unwrap_err();
        assert_eq!(err, ConnectionError::Backgrounded);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);

        manager.set_visible(true);
        settle().await;
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_disconnect_is_not_undone_by_signals() {
        let feed = Arc::new(LocalFeed::new());
        let manager = manager(&feed, 5);
        manager.connect().await.expect("connect");
        manager.disconnect();
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(!feed.is_open());

        manager.set_online(false);
        manager.set_online(true);
        settle().await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(feed.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn topics_registered_early_attach_on_connect() {
        let feed = Arc::new(LocalFeed::new());
        let manager = manager(&feed, 5);
        let (seen, handler) = recorder();
        let handle = manager.subscribe_to_topic("feed:hot", FeedKey::table("posts"), handler);
        assert!(manager.state().active_topics.contains("feed:hot"));

        manager.connect().await.expect("connect");
        settle().await;
        assert!(feed.is_joined("feed:hot"));

        feed.publish(RawChange::insert("posts", json!({"id": "p1"})));
        feed.publish(RawChange::insert("posts", json!({"id": "p2"})));
        settle().await;
        let ids: Vec<_> = seen
            .lock()
            .iter()
            .filter_map(|change| change.after.as_ref()?.get("id").cloned())
            .collect();
        assert_eq!(ids, vec![json!("p1"), json!("p2")]);

        handle.unsubscribe();
        handle.unsubscribe();
        assert!(!feed.is_joined("feed:hot"));
        assert!(manager.state().active_topics.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_subscribe_keeps_one_channel() {
        let feed = Arc::new(LocalFeed::new());
        let manager = manager(&feed, 5);
        manager.connect().await.expect("connect");
        let (first, handler) = recorder();
        let (second, other) = recorder();
        manager.subscribe_to_topic("feed:new", FeedKey::table("posts"), handler);
        manager.subscribe_to_topic("feed:new", FeedKey::table("posts"), other);
        settle().await;

        assert_eq!(feed.channel_count(), 1);
        feed.publish(RawChange::insert("posts", json!({"id": "p1"})));
        settle().await;
        assert_eq!(first.lock().len(), 1);
        assert!(second.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_during_attach_leaves_nothing_joined() {
        let feed = Arc::new(LocalFeed::new());
        let manager = manager(&feed, 5);
        manager.connect().await.expect("connect");
        let (_, handler) = recorder();
        let handle = manager.subscribe_to_topic("thread:9", FeedKey::table("comments"), handler);
        handle.unsubscribe();
        settle().await;
        assert!(!feed.is_joined("thread:9"));
        assert_eq!(feed.channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn topic_error_resubscribes_locally() {
        let feed = Arc::new(LocalFeed::new());
        let manager = manager(&feed, 5);
        manager.connect().await.expect("connect");
        let (seen, handler) = recorder();
        manager.subscribe_to_topic("feed:hot", FeedKey::table("posts"), handler);
        settle().await;

        assert!(feed.inject_channel_error("feed:hot", "socket hiccup"));
        settle().await;
        sleep(Duration::from_millis(100)).await;
        assert!(manager.is_connected());
        assert_eq!(feed.open_count(), 1);
        assert!(feed.is_joined("feed:hot"));

        feed.publish(RawChange::insert("posts", json!({"id": "p3"})));
        settle().await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_topic_errors_escalate_to_reconnect() {
        let feed = Arc::new(LocalFeed::new());
        let manager = manager(&feed, 5);
        manager.connect().await.expect("connect");
        let (_, handler) = recorder();
        manager.subscribe_to_topic("feed:hot", FeedKey::table("posts"), handler);
        settle().await;

        feed.fail_next_joins("feed:hot", 2);
        feed.inject_channel_error("feed:hot", "boom");
        // rejoins at +100ms and +200ms both fail; that third error escalates at ~301ms
        sleep(Duration::from_millis(310)).await;
        let state = manager.state();
        assert_eq!(state.status, ConnectionStatus::Error);
        assert_eq!(state.reconnect_attempts, 1);
        assert_eq!(feed.open_count(), 1);
        assert!(state.active_topics.contains("feed:hot"));

        // first backoff step is 100ms; the topic re-attaches on the new connection
        sleep(Duration::from_millis(100)).await;
        assert_eq!(feed.open_count(), 2);
        assert!(manager.is_connected());
        assert!(feed.is_joined("feed:hot"));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_failure_enters_error_and_reconnects() {
        let feed = Arc::new(LocalFeed::new());
        let manager = manager(&feed, 5);
        manager.connect().await.expect("connect");

        feed.set_ping_healthy(false);
        sleep(Duration::from_millis(5_001)).await;
        assert_eq!(manager.status(), ConnectionStatus::Error);
        assert!(manager.state().last_error.is_some());

        feed.set_ping_healthy(true);
        sleep(Duration::from_millis(101)).await;
        assert!(manager.is_connected());
        assert_eq!(feed.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_reattaches_registered_topics() {
        let feed = Arc::new(LocalFeed::new());
        let manager = manager(&feed, 5);
        let (seen, handler) = recorder();
        manager.subscribe_to_topic("feed:top", FeedKey::table("posts"), handler);
        manager.connect().await.expect("connect");
        settle().await;

        manager.reconnect().await.expect("reconnect");
        settle().await;
        assert!(feed.is_joined("feed:top"));
        feed.publish(RawChange::insert("posts", json!({"id": "p9"})));
        settle().await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn observed_statuses_follow_legal_edges() {
        let feed = Arc::new(LocalFeed::new());
        feed.fail_next_opens(1);
        let manager = manager(&feed, 5);
        let mut rx = manager.watch();
        let observed = Arc::new(Mutex::new(vec![rx.borrow().status]));
        let sink = observed.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let status = rx.borrow().status;
                let mut seen = sink.lock();
                if seen.last() != Some(&status) {
                    seen.push(status);
                }
            }
        });

        let _ = manager.connect().await;
        settle().await;
        sleep(Duration::from_millis(150)).await;
        manager.disconnect();
        settle().await;

        // watch coalesces, so only the settled states are guaranteed to show up
        let observed = observed.lock().clone();
        assert_eq!(observed.first(), Some(&ConnectionStatus::Disconnected));
        assert_eq!(observed.last(), Some(&ConnectionStatus::Disconnected));
        assert!(observed.contains(&ConnectionStatus::Error));
        assert!(observed.contains(&ConnectionStatus::Connected));
    }
}
