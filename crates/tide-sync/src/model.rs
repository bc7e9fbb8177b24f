//! Records shared by the router, the ledger and the record stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type PostId = String;
pub type CommentId = String;
pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteDirection {
    /// Wire encodings seen in vote rows: `1`/`-1` or `"up"`/`"down"`.
    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            1 => Some(VoteDirection::Up),
            -1 => Some(VoteDirection::Down),
            _ => None,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "up" | "upvote" | "1" => Some(VoteDirection::Up),
            "down" | "downvote" | "-1" => Some(VoteDirection::Down),
            _ => None,
        }
    }

    /// Contribution of this vote to a score.
    pub fn weight(self) -> i64 {
        match self {
            VoteDirection::Up => 1,
            VoteDirection::Down => -1,
        }
    }
}

fn weight_of(vote: Option<VoteDirection>) -> i64 {
    vote.map(VoteDirection::weight).unwrap_or(0)
}

/// Score change caused by replacing `previous` with `next`.
///
/// Removing the old vote contributes the negation of its weight, adding the
/// new one contributes its weight.
pub fn score_delta(previous: Option<VoteDirection>, next: Option<VoteDirection>) -> i64 {
    -weight_of(previous) + weight_of(next)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Post,
    Comment,
}

impl TargetType {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetType::Post => "post",
            TargetType::Comment => "comment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoteTarget {
    pub id: String,
    pub kind: TargetType,
}

impl VoteTarget {
    pub fn post(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TargetType::Post,
        }
    }

    pub fn comment(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TargetType::Comment,
        }
    }
}

/// Author identity. A placeholder carries only the id; display fields are
/// filled in by whichever consumer eventually needs them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthorRef {
    pub id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl AuthorRef {
    pub fn placeholder(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.username.is_none() && self.display_name.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: PostId,
    pub author: AuthorRef,
    pub title: String,
    pub content: String,
    pub score: i64,
    pub comment_count: u32,
    pub user_vote: Option<VoteDirection>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    /// Locally created and not yet confirmed by the server.
    #[serde(default)]
    pub provisional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub id: CommentId,
    pub post_id: PostId,
    pub parent_id: Option<CommentId>,
    pub author: AuthorRef,
    pub content: String,
    pub score: i64,
    pub reply_count: u32,
    pub user_vote: Option<VoteDirection>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    #[serde(default)]
    pub provisional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub id: Option<String>,
    pub user_id: Option<UserId>,
    pub target: VoteTarget,
    /// Missing when the backend only replicates the primary key on delete.
    pub vote: Option<VoteDirection>,
    pub thread_id: Option<PostId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDraft {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentDraft {
    pub post_id: PostId,
    pub parent_id: Option<CommentId>,
    pub content: String,
}

impl PostRecord {
    pub fn provisional(id: PostId, draft: &PostDraft, author: AuthorRef) -> Self {
        Self {
            id,
            author,
            title: draft.title.clone(),
            content: draft.content.clone(),
            score: 0,
            comment_count: 0,
            user_vote: None,
            created_at: Utc::now(),
            updated_at: None,
            is_deleted: false,
            provisional: true,
        }
    }
}

impl CommentRecord {
    pub fn provisional(id: CommentId, draft: &CommentDraft, author: AuthorRef) -> Self {
        Self {
            id,
            post_id: draft.post_id.clone(),
            parent_id: draft.parent_id.clone(),
            author,
            content: draft.content.clone(),
            score: 0,
            reply_count: 0,
            user_vote: None,
            created_at: Utc::now(),
            edited_at: None,
            is_deleted: false,
            provisional: true,
        }
    }
}
