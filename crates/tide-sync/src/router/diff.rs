//! Field-level patches for update events.
//!
//! Only tracked fields that actually changed are carried. A field absent
//! from the old image counts as changed, so a backend that replicates only
//! the primary key still forwards every tracked field it sent.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::normalize::{bool_field, count_field, edited_at, int_field, text_field};
use crate::model::{CommentId, PostId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreChange {
    /// Authoritative score from the row itself.
    Absolute(i64),
    /// Relative change derived from a vote notification.
    Delta(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChange {
    pub content: String,
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PostPatch {
    pub id: PostId,
    pub score: Option<ScoreChange>,
    pub comment_count: Option<u32>,
    pub content: Option<ContentChange>,
    pub is_deleted: Option<bool>,
}

impl PostPatch {
    pub fn new(id: impl Into<PostId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn score_delta(id: impl Into<PostId>, delta: i64) -> Self {
        Self {
            score: Some(ScoreChange::Delta(delta)),
            ..Self::new(id)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.score.is_none()
            && self.comment_count.is_none()
            && self.content.is_none()
            && self.is_deleted.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommentPatch {
    pub id: CommentId,
    pub score: Option<ScoreChange>,
    pub reply_count: Option<u32>,
    pub content: Option<ContentChange>,
    pub is_deleted: Option<bool>,
}

impl CommentPatch {
    pub fn new(id: impl Into<CommentId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn score_delta(id: impl Into<CommentId>, delta: i64) -> Self {
        Self {
            score: Some(ScoreChange::Delta(delta)),
            ..Self::new(id)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.score.is_none()
            && self.reply_count.is_none()
            && self.content.is_none()
            && self.is_deleted.is_none()
    }
}

fn changed(before: Option<&Value>, after: &Value, field: &str) -> bool {
    let Some(next) = after.get(field) else {
        return false;
    };
    match before.and_then(|row| row.get(field)) {
        Some(previous) => previous != next,
        None => true,
    }
}

fn content_change(before: Option<&Value>, after: &Value, stamp_fields: &[&str]) -> Option<ContentChange> {
    let touched = changed(before, after, "content")
        || stamp_fields
            .iter()
            .any(|field| changed(before, after, field));
    if !touched {
        return None;
    }
    Some(ContentChange {
        content: text_field(after, "content")?,
        edited_at: edited_at(after),
    })
}

pub fn post_patch(id: impl Into<PostId>, before: Option<&Value>, after: &Value) -> PostPatch {
    let mut patch = PostPatch::new(id);
    if changed(before, after, "score") {
        patch.score = int_field(after, "score").map(ScoreChange::Absolute);
    }
    if changed(before, after, "comment_count") {
        patch.comment_count = count_field(after, "comment_count");
    }
    patch.content = content_change(before, after, &["updated_at"]);
    if changed(before, after, "is_deleted") {
        patch.is_deleted = bool_field(after, "is_deleted");
    }
    patch
}

pub fn comment_patch(id: impl Into<CommentId>, before: Option<&Value>, after: &Value) -> CommentPatch {
    let mut patch = CommentPatch::new(id);
    if changed(before, after, "score") {
        patch.score = int_field(after, "score").map(ScoreChange::Absolute);
    }
    if changed(before, after, "reply_count") {
        patch.reply_count = count_field(after, "reply_count");
    }
    patch.content = content_change(before, after, &["edited_at", "updated_at"]);
    if changed(before, after, "is_deleted") {
        patch.is_deleted = bool_field(after, "is_deleted");
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_changed_fields_are_forwarded() {
        let before = json!({"id": "p1", "score": 3, "comment_count": 1, "content": "a", "is_deleted": false});
        let after = json!({"id": "p1", "score": 4, "comment_count": 1, "content": "a", "is_deleted": false});
        let patch = post_patch("p1", Some(&before), &after);
        assert_eq!(patch.score, Some(ScoreChange::Absolute(4)));
        assert_eq!(patch.comment_count, None);
        assert_eq!(patch.content, None);
        assert_eq!(patch.is_deleted, None);
    }

    #[test]
    fn identical_images_yield_an_empty_patch() {
        let row = json!({"id": "c1", "score": 2, "reply_count": 0, "content": "x"});
        assert!(comment_patch("c1", Some(&row), &row).is_empty());
    }

    #[test]
    fn key_only_before_image_forwards_everything_present() {
        let before = json!({"id": "p1"});
        let after = json!({"id": "p1", "score": 0, "content": "hello", "updated_at": "2024-05-02T00:00:00Z"});
        let patch = post_patch("p1", Some(&before), &after);
        assert_eq!(patch.score, Some(ScoreChange::Absolute(0)));
        let content = patch.content.as_ref().expect("content");
        assert_eq!(content.content, "hello");
        assert!(content.edited_at.is_some());
        // comment_count was not sent at all
        assert_eq!(patch.comment_count, None);
        assert_eq!(post_patch("p1", None, &after), patch);
    }

    #[test]
    fn edit_timestamp_alone_carries_content() {
        let before = json!({"id": "c1", "content": "same", "edited_at": null});
        let after = json!({"id": "c1", "content": "same", "edited_at": "2024-05-02T00:00:00Z"});
        let patch = comment_patch("c1", Some(&before), &after);
        assert_eq!(patch.content.map(|c| c.content), Some("same".to_string()));
    }

    #[test]
    fn soft_delete_flag() {
        let before = json!({"id": "c1", "is_deleted": false});
        let after = json!({"id": "c1", "is_deleted": true});
        let patch = comment_patch("c1", Some(&before), &after);
        assert_eq!(patch.is_deleted, Some(true));
        assert_eq!(patch.score, None);
    }
}
