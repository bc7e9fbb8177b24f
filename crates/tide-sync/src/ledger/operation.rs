use tokio::time::Instant;
use uuid::Uuid;

use crate::model::{
    CommentDraft, CommentId, CommentRecord, PostDraft, PostId, PostRecord, VoteDirection,
    VoteTarget,
};

pub type OperationId = Uuid;

/// State needed to undo a predicted vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteRollback {
    pub previous_vote: Option<VoteDirection>,
    pub previous_score: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteOperation {
    pub target: VoteTarget,
    pub new_vote: Option<VoteDirection>,
    pub predicted_score: i64,
    pub rollback: VoteRollback,
}

impl VoteOperation {
    pub fn applied_delta(&self) -> i64 {
        self.predicted_score - self.rollback.previous_score
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Vote(VoteOperation),
    CreatePost {
        draft: PostDraft,
        provisional_id: PostId,
    },
    CreateComment {
        draft: CommentDraft,
        provisional_id: CommentId,
    },
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Vote(_) => "vote",
            Operation::CreatePost { .. } => "create_post",
            Operation::CreateComment { .. } => "create_comment",
        }
    }

    pub fn provisional_id(&self) -> Option<&str> {
        match self {
            Operation::Vote(_) => None,
            Operation::CreatePost { provisional_id, .. }
            | Operation::CreateComment { provisional_id, .. } => Some(provisional_id),
        }
    }

    pub fn rollback_data(&self) -> RollbackData {
        match self {
            Operation::Vote(vote) => RollbackData::Vote {
                target: vote.target.clone(),
                previous_vote: vote.rollback.previous_vote,
                previous_score: vote.rollback.previous_score,
                applied_delta: vote.applied_delta(),
            },
            Operation::CreatePost { provisional_id, .. } => RollbackData::RemovePost {
                provisional_id: provisional_id.clone(),
            },
            Operation::CreateComment { provisional_id, .. } => RollbackData::RemoveComment {
                provisional_id: provisional_id.clone(),
            },
        }
    }
}

/// Handed to a caller-supplied rollback callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackData {
    Vote {
        target: VoteTarget,
        previous_vote: Option<VoteDirection>,
        previous_score: i64,
        /// What the prediction added to the score. Undo by subtracting it
        /// from the current value; `previous_score` may be stale by now.
        applied_delta: i64,
    },
    RemovePost {
        provisional_id: PostId,
    },
    RemoveComment {
        provisional_id: CommentId,
    },
}

/// Server result attached to a confirmation.
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    Post(PostRecord),
    Comment(CommentRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VotePatch {
    pub score: i64,
    pub vote: Option<VoteDirection>,
}

/// Writes a predicted (or restored) vote state into whatever holds the target.
pub trait VoteApplier: Send + Sync {
    fn apply_vote(&self, target: &VoteTarget, patch: VotePatch);

    /// Undoes a prediction. The default writes back the recorded score,
    /// which is only right for appliers that see no live updates.
    fn revert_vote(&self, target: &VoteTarget, reversal: VoteReversal) {
        self.apply_vote(
            target,
            VotePatch {
                score: reversal.previous_score,
                vote: reversal.previous_vote,
            },
        )
    }

    /// The prediction is no longer in flight: confirmed, or undone by a
    /// caller-supplied rollback.
    fn settle_vote(&self, target: &VoteTarget) {
        let _ = target;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteReversal {
    pub previous_vote: Option<VoteDirection>,
    pub previous_score: i64,
    pub applied_delta: i64,
}

impl<F> VoteApplier for F
where
    F: Fn(&VoteTarget, VotePatch) + Send + Sync,
{
    fn apply_vote(&self, target: &VoteTarget, patch: VotePatch) {
        (self)(target, patch)
    }
}

/// Receives provisional records for optimistic creates.
pub trait ProvisionalSink<R>: Send + Sync {
    fn insert_provisional(&self, record: R);

    fn remove_provisional(&self, provisional_id: &str);

    /// Swaps the provisional record for the server's. Sinks that refetch
    /// instead can leave this as a no-op.
    fn promote(&self, provisional_id: &str, record: R) {
        let _ = (provisional_id, record);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    Applied {
        id: OperationId,
        kind: &'static str,
    },
    Confirmed {
        id: OperationId,
    },
    RolledBack {
        id: OperationId,
    },
    TimedOut {
        id: OperationId,
    },
    Swept {
        count: usize,
    },
}

/// Read-only view of a ledger entry.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub id: OperationId,
    pub operation: Operation,
    pub created_at: Instant,
    pub confirmed: bool,
}
