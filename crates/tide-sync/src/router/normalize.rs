//! Raw row payloads to typed records.
//!
//! Rows arrive with whatever columns the backend replicates: ids may be
//! numeric or text, votes may be `1`/`-1` or `"up"`/`"down"`, and delete
//! images frequently carry only the primary key. Parsing is lenient about
//! everything except the identifying columns.

use change_feed::{ChangeKind, RawChange};
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::model::{
    AuthorRef, CommentRecord, PostRecord, TargetType, VoteDirection, VoteRecord, VoteTarget,
};

pub const POSTS_TABLE: &str = "posts";
pub const COMMENTS_TABLE: &str = "comments";
pub const VOTES_TABLE: &str = "votes";

#[derive(Debug, Clone, PartialEq)]
pub enum DomainRecord {
    Post(PostRecord),
    Comment(CommentRecord),
    Vote(VoteRecord),
}

/// A normalized change, independent of the feed's wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainChangeEvent {
    Inserted(DomainRecord),
    /// `before` is absent when the backend did not replicate the old image
    /// or it could not be parsed.
    Updated {
        before: Option<DomainRecord>,
        after: DomainRecord,
    },
    Deleted(DomainRecord),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("no normalizer for table {0}")]
    UnknownTable(String),
    #[error("{0:?} change carried no row image")]
    MissingImage(ChangeKind),
    #[error("row image is not an object")]
    NotAnObject,
    #[error("row is missing {0}")]
    MissingField(&'static str),
    #[error("row has an unusable {0}")]
    InvalidField(&'static str),
}

pub fn normalize(change: &RawChange) -> Result<DomainChangeEvent, NormalizeError> {
    let table = change.table.as_str();
    match change.kind {
        ChangeKind::Insert => {
            let row = change
                .after
                .as_ref()
                .ok_or(NormalizeError::MissingImage(change.kind))?;
            Ok(DomainChangeEvent::Inserted(parse_record(table, row)?))
        }
        ChangeKind::Update => {
            let row = change
                .after
                .as_ref()
                .ok_or(NormalizeError::MissingImage(change.kind))?;
            let after = parse_record(table, row)?;
            let before = change
                .before
                .as_ref()
                .and_then(|row| parse_record(table, row).ok());
            Ok(DomainChangeEvent::Updated { before, after })
        }
        ChangeKind::Delete => {
            let row = change
                .before
                .as_ref()
                .or(change.after.as_ref())
                .ok_or(NormalizeError::MissingImage(change.kind))?;
            Ok(DomainChangeEvent::Deleted(parse_record(table, row)?))
        }
    }
}

pub fn parse_record(table: &str, row: &Value) -> Result<DomainRecord, NormalizeError> {
    match table {
        POSTS_TABLE => parse_post(row).map(DomainRecord::Post),
        COMMENTS_TABLE => parse_comment(row).map(DomainRecord::Comment),
        VOTES_TABLE => parse_vote(row).map(DomainRecord::Vote),
        other => Err(NormalizeError::UnknownTable(other.to_string())),
    }
}

pub fn parse_post(row: &Value) -> Result<PostRecord, NormalizeError> {
    if !row.is_object() {
        return Err(NormalizeError::NotAnObject);
    }
    Ok(PostRecord {
        id: id_field(row, "id").ok_or(NormalizeError::MissingField("id"))?,
        author: author_of(row),
        title: text_field(row, "title").unwrap_or_default(),
        content: text_field(row, "content").unwrap_or_default(),
        score: int_field(row, "score").unwrap_or(0),
        comment_count: count_field(row, "comment_count").unwrap_or(0),
        user_vote: vote_field(row, "user_vote"),
        created_at: timestamp_field(row, "created_at").unwrap_or_default(),
        updated_at: timestamp_field(row, "updated_at"),
        is_deleted: bool_field(row, "is_deleted").unwrap_or(false),
        provisional: false,
    })
}

pub fn parse_comment(row: &Value) -> Result<CommentRecord, NormalizeError> {
    if !row.is_object() {
        return Err(NormalizeError::NotAnObject);
    }
    Ok(CommentRecord {
        id: id_field(row, "id").ok_or(NormalizeError::MissingField("id"))?,
        post_id: id_field(row, "post_id").unwrap_or_default(),
        parent_id: id_field(row, "parent_id"),
        author: author_of(row),
        content: text_field(row, "content").unwrap_or_default(),
        score: int_field(row, "score").unwrap_or(0),
        reply_count: count_field(row, "reply_count").unwrap_or(0),
        user_vote: vote_field(row, "user_vote"),
        created_at: timestamp_field(row, "created_at").unwrap_or_default(),
        edited_at: edited_at(row),
        is_deleted: bool_field(row, "is_deleted").unwrap_or(false),
        provisional: false,
    })
}

pub fn parse_vote(row: &Value) -> Result<VoteRecord, NormalizeError> {
    if !row.is_object() {
        return Err(NormalizeError::NotAnObject);
    }
    let target = if let Some(id) = id_field(row, "target_id") {
        let kind = match text_field(row, "target_type").as_deref() {
            None | Some("post") => TargetType::Post,
            Some("comment") => TargetType::Comment,
            Some(_) => return Err(NormalizeError::InvalidField("target_type")),
        };
        VoteTarget { id, kind }
    } else if let Some(id) = id_field(row, "comment_id") {
        VoteTarget::comment(id)
    } else if let Some(id) = id_field(row, "post_id") {
        VoteTarget::post(id)
    } else {
        return Err(NormalizeError::MissingField("target_id"));
    };

    let vote = ["vote", "vote_type", "value"]
        .iter()
        .find_map(|key| vote_field(row, key));
    let thread_id = id_field(row, "thread_id")
        .or_else(|| id_field(row, "post_id"))
        .or_else(|| (target.kind == TargetType::Post).then(|| target.id.clone()));

    Ok(VoteRecord {
        id: id_field(row, "id"),
        user_id: id_field(row, "user_id"),
        target,
        vote,
        thread_id,
    })
}

/// Joined author identity if the payload has it, otherwise a placeholder
/// carrying only the author id.
fn author_of(row: &Value) -> AuthorRef {
    let author_id = id_field(row, "author_id")
        .or_else(|| id_field(row, "user_id"))
        .unwrap_or_default();
    for key in ["author", "profiles", "profile"] {
        if let Some(joined) = row.get(key).filter(|value| value.is_object()) {
            return AuthorRef {
                id: id_field(joined, "id").unwrap_or_else(|| author_id.clone()),
                username: text_field(joined, "username"),
                display_name: text_field(joined, "display_name"),
                avatar_url: text_field(joined, "avatar_url"),
            };
        }
    }
    AuthorRef::placeholder(author_id)
}

pub(crate) fn edited_at(row: &Value) -> Option<DateTime<Utc>> {
    timestamp_field(row, "edited_at").or_else(|| timestamp_field(row, "updated_at"))
}

pub(crate) fn id_field(row: &Value, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn text_field(row: &Value, key: &str) -> Option<String> {
    row.get(key)?.as_str().map(str::to_owned)
}

pub(crate) fn int_field(row: &Value, key: &str) -> Option<i64> {
    match row.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn count_field(row: &Value, key: &str) -> Option<u32> {
    int_field(row, key).map(|n| u32::try_from(n.max(0)).unwrap_or(u32::MAX))
}

pub(crate) fn bool_field(row: &Value, key: &str) -> Option<bool> {
    match row.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub(crate) fn vote_field(row: &Value, key: &str) -> Option<VoteDirection> {
    match row.get(key)? {
        Value::Number(n) => n.as_i64().and_then(VoteDirection::from_value),
        Value::String(s) => VoteDirection::parse(s),
        _ => None,
    }
}

pub(crate) fn timestamp_field(row: &Value, key: &str) -> Option<DateTime<Utc>> {
    let text = row.get(key)?.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| text.parse::<DateTime<Utc>>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn post_insert_without_join_gets_placeholder_author() {
        let change = RawChange::insert(
            "posts",
            json!({
                "id": 17,
                "author_id": "u-3",
                "title": "hi",
                "content": "body",
                "score": "4",
                "comment_count": 2,
                "created_at": "2024-05-01T10:00:00Z"
            }),
        );
        let DomainChangeEvent::Inserted(DomainRecord::Post(post)) = normalize(&change).expect("post")
        else {
            panic!("expected a post insert");
        };
        assert_eq!(post.id, "17");
        assert_eq!(post.score, 4);
        assert_eq!(post.comment_count, 2);
        assert_eq!(post.author, AuthorRef::placeholder("u-3"));
        assert_eq!(post.created_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn joined_author_is_kept() {
        let post = parse_post(&json!({
            "id": "p1",
            "author_id": "u-1",
            "author": {"username": "ada", "display_name": "Ada"}
        }))
        .expect("post");
        assert_eq!(post.author.id, "u-1");
        assert_eq!(post.author.username.as_deref(), Some("ada"));
        assert!(!post.author.is_placeholder());
    }

    #[test]
    fn delete_with_key_only_image() {
        let change = RawChange::delete("comments", json!({"id": "c9"}));
        match normalize(&change).expect("delete") {
            DomainChangeEvent::Deleted(DomainRecord::Comment(comment)) => {
                assert_eq!(comment.id, "c9")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn vote_encodings_and_targets() {
        let vote = parse_vote(&json!({
            "user_id": "u1", "target_id": 5, "target_type": "comment", "vote": -1, "thread_id": "p2"
        }))
        .expect("vote");
        assert_eq!(vote.target, VoteTarget::comment("5"));
        assert_eq!(vote.vote, Some(VoteDirection::Down));
        assert_eq!(vote.thread_id.as_deref(), Some("p2"));

        let vote = parse_vote(&json!({"post_id": "p7", "vote_type": "up"})).expect("vote");
        assert_eq!(vote.target, VoteTarget::post("p7"));
        assert_eq!(vote.vote, Some(VoteDirection::Up));
        assert_eq!(vote.thread_id.as_deref(), Some("p7"));

        assert_eq!(
            parse_vote(&json!({"id": "v1"})),
            Err(NormalizeError::MissingField("target_id"))
        );
    }

    #[test]
    fn rejects_unusable_payloads() {
        assert_eq!(
            normalize(&RawChange::insert("profiles", json!({"id": 1}))),
            Err(NormalizeError::UnknownTable("profiles".into()))
        );
        assert_eq!(
            normalize(&RawChange::insert("posts", json!({"title": "no id"}))),
            Err(NormalizeError::MissingField("id"))
        );
        assert_eq!(parse_post(&json!([1, 2])), Err(NormalizeError::NotAnObject));
    }

    #[test]
    fn unparseable_before_image_is_dropped() {
        let change = RawChange::update("posts", Some(json!("garbage")), json!({"id": "p1"}));
        match normalize(&change).expect("update") {
            DomainChangeEvent::Updated { before, .. } => assert!(before.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
