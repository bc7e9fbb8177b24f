//! Remote mutation endpoint and the optimistic runner around it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::MutationError;
use crate::ledger::{
    Confirmation, MutationLedger, OperationId, ProvisionalSink, VoteApplier,
};
use crate::model::{
    AuthorRef, CommentDraft, CommentId, CommentRecord, PostDraft, PostId, PostRecord,
    VoteDirection, VoteTarget,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub target: VoteTarget,
    /// `None` clears the caller's vote.
    pub vote: Option<VoteDirection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReceipt {
    pub target: VoteTarget,
    pub vote: Option<VoteDirection>,
    /// Score after the vote, when the endpoint reports it.
    #[serde(default)]
    pub score: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum DeleteTarget {
    Post(PostId),
    Comment(CommentId),
}

/// The server side of every mutation. Implementations map transport and
/// HTTP failures onto [`MutationError`].
#[async_trait]
pub trait MutationEndpoint: Send + Sync {
    async fn cast_vote(&self, request: VoteRequest) -> Result<VoteReceipt, MutationError>;

    async fn create_post(&self, draft: PostDraft) -> Result<PostRecord, MutationError>;

    async fn create_comment(&self, draft: CommentDraft) -> Result<CommentRecord, MutationError>;

    async fn delete(&self, target: DeleteTarget) -> Result<(), MutationError>;
}

/// Applies each mutation locally through the ledger, calls the endpoint,
/// then confirms or rolls back. A rejected call rolls back immediately
/// instead of waiting for the ledger timeout.
#[derive(Clone)]
pub struct OptimisticMutations {
    endpoint: Arc<dyn MutationEndpoint>,
    ledger: MutationLedger,
    author: AuthorRef,
}

impl OptimisticMutations {
    pub fn new(endpoint: Arc<dyn MutationEndpoint>, ledger: MutationLedger, author: AuthorRef) -> Self {
        Self {
            endpoint,
            ledger,
            author,
        }
    }

    pub fn ledger(&self) -> &MutationLedger {
        &self.ledger
    }

    pub fn author(&self) -> &AuthorRef {
        &self.author
    }

    pub async fn vote(
        &self,
        target: VoteTarget,
        new_vote: Option<VoteDirection>,
        current_vote: Option<VoteDirection>,
        current_score: i64,
        applier: Arc<dyn VoteApplier>,
    ) -> Result<VoteReceipt, MutationError> {
        let id = self.ledger.apply_optimistic_vote(
            target.clone(),
            new_vote,
            current_vote,
            current_score,
            applier,
        );
        let result = self
            .endpoint
            .cast_vote(VoteRequest {
                target,
                vote: new_vote,
            })
            .await;
        self.settle(id, result, |_| None)
    }

    pub async fn create_post(
        &self,
        draft: PostDraft,
        sink: Arc<dyn ProvisionalSink<PostRecord>>,
    ) -> Result<PostRecord, MutationError> {
        let id = self
            .ledger
            .apply_optimistic_post(draft.clone(), self.author.clone(), sink);
        let result = self.endpoint.create_post(draft).await;
        self.settle(id, result, |post| Some(Confirmation::Post(post.clone())))
    }

    pub async fn create_comment(
        &self,
        draft: CommentDraft,
        sink: Arc<dyn ProvisionalSink<CommentRecord>>,
    ) -> Result<CommentRecord, MutationError> {
        let id = self
            .ledger
            .apply_optimistic_comment(draft.clone(), self.author.clone(), sink);
        let result = self.endpoint.create_comment(draft).await;
        self.settle(id, result, |comment| {
            Some(Confirmation::Comment(comment.clone()))
        })
    }

    /// Deletes are not predicted locally.
    pub async fn delete(&self, target: DeleteTarget) -> Result<(), MutationError> {
        match self.endpoint.delete(target.clone()).await {
            Ok(()) => {
                debug!(target = "tide.mutation", ?target, "delete accepted");
                Ok(())
            }
            Err(err) => {
                warn!(target = "tide.mutation", ?target, error = %err, "delete rejected");
                Err(err)
            }
        }
    }

    fn settle<T>(
        &self,
        id: OperationId,
        result: Result<T, MutationError>,
        confirmation: impl FnOnce(&T) -> Option<Confirmation>,
    ) -> Result<T, MutationError> {
        match result {
            Ok(value) => {
                if self.ledger.confirm_operation(id, confirmation(&value)) {
                    info!(target = "tide.mutation", operation_id = %id, "mutation confirmed");
                    Ok(value)
                } else {
                    // Already rolled back locally; the caller should refetch.
                    warn!(
                        target = "tide.mutation",
                        operation_id = %id,
                        "server accepted a mutation the ledger already rolled back"
                    );
                    Err(MutationError::TimedOut)
                }
            }
            Err(err) => {
                warn!(target = "tide.mutation", operation_id = %id, error = %err, "mutation rejected; rolling back");
                self.ledger.revert_operation(id);
                Err(err)
            }
        }
    }
}
