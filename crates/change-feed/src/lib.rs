//! Change-notification feed primitives shared by the sync core.
//!
//! A feed delivers row-level `Insert`/`Update`/`Delete` notifications for a
//! table, optionally narrowed by a single `column=eq.value` row filter. The
//! core treats delivery as at-least-once and never assumes the feed is in
//! lockstep with the mutation endpoint.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

const CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Equality filter on a single column, written `column=eq.value` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Parses the `column=eq.value` form. Other operators are not supported.
    pub fn parse(expr: &str) -> Option<Self> {
        let (column, rest) = expr.split_once('=')?;
        let value = rest.strip_prefix("eq.")?;
        let column = column.trim();
        if column.is_empty() {
            return None;
        }
        Some(Self::eq(column, value))
    }

    pub fn matches(&self, row: &Value) -> bool {
        match row.get(&self.column) {
            Some(Value::String(s)) => s == &self.value,
            Some(Value::Number(n)) => n.to_string() == self.value,
            Some(Value::Bool(b)) => b.to_string() == self.value,
            _ => false,
        }
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// What a channel listens to: a table plus an optional row filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedKey {
    pub table: String,
    pub filter: Option<RowFilter>,
}

impl FeedKey {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
        }
    }

    pub fn filtered(table: impl Into<String>, filter: RowFilter) -> Self {
        Self {
            table: table.into(),
            filter: Some(filter),
        }
    }

    pub fn accepts(&self, change: &RawChange) -> bool {
        if self.table != change.table {
            return false;
        }
        match &self.filter {
            None => true,
            Some(filter) => change.row().map(|row| filter.matches(row)).unwrap_or(false),
        }
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            Some(filter) => write!(f, "{}?{}", self.table, filter),
            None => f.write_str(&self.table),
        }
    }
}

/// Raw payload as delivered by the backend. Either side may be missing or
/// partial depending on how the table replicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub table: String,
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    #[serde(default, rename = "old")]
    pub before: Option<Value>,
    #[serde(default, rename = "new")]
    pub after: Option<Value>,
}

impl RawChange {
    pub fn insert(table: impl Into<String>, row: Value) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Insert,
            before: None,
            after: Some(row),
        }
    }

    pub fn update(table: impl Into<String>, before: Option<Value>, after: Value) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Update,
            before,
            after: Some(after),
        }
    }

    pub fn delete(table: impl Into<String>, row: Value) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Delete,
            before: Some(row),
            after: None,
        }
    }

    /// The row used for filter matching: the new image if present, else the old one.
    pub fn row(&self) -> Option<&Value> {
        self.after.as_ref().or(self.before.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Change(RawChange),
    /// The channel failed; no further changes will arrive on this receiver.
    ChannelError(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("feed connection closed")]
    Closed,
    #[error("feed transport error: {0}")]
    Transport(String),
    #[error("feed rejected channel: {0}")]
    Rejected(String),
}

pub type FeedResult<T> = Result<T, FeedError>;

/// Async subscription primitive the sync core consumes.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens the underlying transport.
    async fn open(&self) -> FeedResult<()>;

    /// Closes the transport and every joined channel.
    fn close(&self);

    /// Joins `channel`, receiving changes matching `key`. Re-joining an
    /// existing channel replaces it.
    async fn join(&self, channel: &str, key: &FeedKey) -> FeedResult<broadcast::Receiver<FeedEvent>>;

    /// Leaves `channel`. Unknown channels are ignored.
    fn leave(&self, channel: &str);

    /// Liveness check used by the connection health check.
    async fn ping(&self) -> FeedResult<()>;
}

/// In-memory feed for tests and local development.
#[derive(Debug, Default)]
pub struct LocalFeed {
    state: RwLock<LocalState>,
}

#[derive(Debug)]
struct LocalState {
    open: bool,
    opens: u32,
    failing_opens: u32,
    ping_healthy: bool,
    failing_joins: HashMap<String, u32>,
    channels: HashMap<String, LocalChannel>,
}

impl Default for LocalState {
    fn default() -> Self {
        Self {
            open: false,
            opens: 0,
            failing_opens: 0,
            ping_healthy: true,
            failing_joins: HashMap::new(),
            channels: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct LocalChannel {
    key: FeedKey,
    sender: broadcast::Sender<FeedEvent>,
}

impl LocalFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `open` fail with a transport error.
    pub fn fail_next_opens(&self, count: u32) {
        self.state.write().failing_opens = count;
    }

    /// Makes the next `count` joins of `channel` fail.
    pub fn fail_next_joins(&self, channel: &str, count: u32) {
        self.state
            .write()
            .failing_joins
            .insert(channel.to_string(), count);
    }

    pub fn set_ping_healthy(&self, healthy: bool) {
        self.state.write().ping_healthy = healthy;
    }

    pub fn is_open(&self) -> bool {
        self.state.read().open
    }

    pub fn open_count(&self) -> u32 {
        self.state.read().opens
    }

    pub fn is_joined(&self, channel: &str) -> bool {
        self.state.read().channels.contains_key(channel)
    }

    pub fn channel_count(&self) -> usize {
        self.state.read().channels.len()
    }

    /// Delivers `change` to every joined channel whose key accepts it.
    /// Returns how many channels received it.
    pub fn publish(&self, change: RawChange) -> usize {
        let guard = self.state.read();
        let mut delivered = 0;
        for (name, channel) in guard.channels.iter() {
            if channel.key.accepts(&change)
                && channel.sender.send(FeedEvent::Change(change.clone())).is_ok()
            {
                trace!(target = "feed.local", channel = %name, table = %change.table, "change delivered");
                delivered += 1;
            }
        }
        delivered
    }

    /// Emits a channel-level error on `channel`. Returns false if it is not joined.
    pub fn inject_channel_error(&self, channel: &str, message: &str) -> bool {
        let guard = self.state.read();
        match guard.channels.get(channel) {
            Some(entry) => entry
                .sender
                .send(FeedEvent::ChannelError(message.to_string()))
                .is_ok(),
            None => false,
        }
    }

    /// Simulates the transport going away: every receiver observes a closed channel.
    pub fn drop_connection(&self) {
        let mut guard = self.state.write();
        guard.open = false;
        guard.channels.clear();
        debug!(target = "feed.local", "connection dropped");
    }
}

#[async_trait]
impl ChangeFeed for LocalFeed {
    async fn open(&self) -> FeedResult<()> {
        let mut guard = self.state.write();
        guard.opens += 1;
        if guard.failing_opens > 0 {
            guard.failing_opens -= 1;
            return Err(FeedError::Transport("connection refused".into()));
        }
        guard.open = true;
        Ok(())
    }

    fn close(&self) {
        let mut guard = self.state.write();
        guard.open = false;
        guard.channels.clear();
    }

    async fn join(&self, channel: &str, key: &FeedKey) -> FeedResult<broadcast::Receiver<FeedEvent>> {
        let mut guard = self.state.write();
        if !guard.open {
            return Err(FeedError::Closed);
        }
        if let Some(remaining) = guard.failing_joins.get_mut(channel) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FeedError::Rejected(format!("join {channel} refused")));
            }
        }
        let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
        guard.channels.insert(
            channel.to_string(),
            LocalChannel {
                key: key.clone(),
                sender,
            },
        );
        Ok(receiver)
    }

    fn leave(&self, channel: &str) {
        self.state.write().channels.remove(channel);
    }

    async fn ping(&self) -> FeedResult<()> {
        let guard = self.state.read();
        if !guard.open {
            return Err(FeedError::Closed);
        }
        if !guard.ping_healthy {
            return Err(FeedError::Transport("heartbeat timed out".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn row_filter_parses_eq_form() {
        let filter = RowFilter::parse("post_id=eq.42").expect("filter");
        assert_eq!(filter, RowFilter::eq("post_id", "42"));
        assert_eq!(filter.to_string(), "post_id=eq.42");
        assert!(RowFilter::parse("post_id=gt.42").is_none());
        assert!(RowFilter::parse("=eq.1").is_none());
    }

    #[test]
    fn filter_matches_numbers_and_strings() {
        let filter = RowFilter::eq("post_id", "42");
        assert!(filter.matches(&json!({"post_id": 42})));
        assert!(filter.matches(&json!({"post_id": "42"})));
        assert!(!filter.matches(&json!({"post_id": 7})));
        assert!(!filter.matches(&json!({"other": 42})));
    }

    #[test]
    fn delete_matches_on_old_image() {
        let key = FeedKey::filtered("comments", RowFilter::eq("post_id", "9"));
        let change = RawChange::delete("comments", json!({"id": "c1", "post_id": 9}));
        assert!(key.accepts(&change));
        assert!(!FeedKey::table("posts").accepts(&change));
    }

    #[test]
    fn raw_change_uses_wire_field_names() {
        let change: RawChange = serde_json::from_value(json!({
            "table": "posts",
            "eventType": "UPDATE",
            "old": {"id": "p1"},
            "new": {"id": "p1", "score": 3}
        }))
        .expect("decode");
        assert_eq!(change.kind, ChangeKind::Update);
        assert_eq!(change.after.as_ref().and_then(|row| row.get("score")), Some(&json!(3)));
    }

    #[tokio::test]
    async fn local_feed_routes_by_key() {
        let feed = LocalFeed::new();
        feed.open().await.expect("open");
        let mut posts = feed.join("feed:hot", &FeedKey::table("posts")).await.expect("join");
        let mut thread = feed
            .join("thread:9", &FeedKey::filtered("comments", RowFilter::eq("post_id", "9")))
            .await
            .expect("join");

        let delivered = feed.publish(RawChange::insert("posts", json!({"id": "p1"})));
        assert_eq!(delivered, 1);
        match posts.recv().await.expect("recv") {
            FeedEvent::Change(change) => assert_eq!(change.table, "posts"),
            other => panic!("unexpected event {other:?}"),
        }

        assert_eq!(
            feed.publish(RawChange::insert("comments", json!({"id": "c1", "post_id": 8}))),
            0
        );
        assert_eq!(
            feed.publish(RawChange::insert("comments", json!({"id": "c2", "post_id": 9}))),
            1
        );
        assert!(matches!(thread.recv().await, Ok(FeedEvent::Change(_))));
    }

    #[tokio::test]
    async fn join_requires_open_connection() {
        let feed = LocalFeed::new();
        let err = feed.join("feed:hot", &FeedKey::table("posts")).await.unwrap_err();
        assert_eq!(err, FeedError::Closed);

        feed.fail_next_opens(1);
        assert!(feed.open().await.is_err());
        assert!(feed.open().await.is_ok());
        assert_eq!(feed.open_count(), 2);
    }

    #[tokio::test]
    async fn drop_connection_closes_receivers() {
        let feed = LocalFeed::new();
        feed.open().await.expect("open");
        let mut rx = feed.join("feed:new", &FeedKey::table("posts")).await.expect("join");
        feed.drop_connection();
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(feed.ping().await.is_err());
    }
}
