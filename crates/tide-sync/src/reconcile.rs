//! Merge policy for authoritative snapshots versus locally held records.
//!
//! Pure and clock-free: the result depends only on the two records.

use std::collections::HashMap;

use crate::model::{CommentRecord, PostRecord, VoteDirection};

/// Records that carry a score and the local user's vote.
pub trait Reconcilable: Clone {
    fn id(&self) -> &str;
    fn score(&self) -> i64;
    fn user_vote(&self) -> Option<VoteDirection>;
    fn with_vote_state(self, score: i64, user_vote: Option<VoteDirection>) -> Self;
}

impl Reconcilable for PostRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn score(&self) -> i64 {
        self.score
    }

    fn user_vote(&self) -> Option<VoteDirection> {
        self.user_vote
    }

    fn with_vote_state(mut self, score: i64, user_vote: Option<VoteDirection>) -> Self {
        self.score = score;
        self.user_vote = user_vote;
        self
    }
}

impl Reconcilable for CommentRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn score(&self) -> i64 {
        self.score
    }

    fn user_vote(&self) -> Option<VoteDirection> {
        self.user_vote
    }

    fn with_vote_state(mut self, score: i64, user_vote: Option<VoteDirection>) -> Self {
        self.score = score;
        self.user_vote = user_vote;
        self
    }
}

/// Combines a freshly fetched record with the locally held one.
///
/// - local vote set, fresh vote unset: the server has not caught up, keep
///   the local score and vote.
/// - same vote on both: never let the score regress, take the larger.
/// - anything else: the fresh record wins.
///
/// Every other field always comes from `fresh`.
pub fn merge<R: Reconcilable>(fresh: &R, local: &R) -> R {
    match (local.user_vote(), fresh.user_vote()) {
        (Some(vote), None) => fresh.clone().with_vote_state(local.score(), Some(vote)),
        (Some(local_vote), Some(fresh_vote)) if local_vote == fresh_vote => {
            let score = fresh.score().max(local.score());
            fresh.clone().with_vote_state(score, Some(fresh_vote))
        }
        _ => fresh.clone(),
    }
}

/// Merges a fetched page against local records by id. Order and membership
/// follow `fresh`; records without a local counterpart pass through.
pub fn merge_snapshot<R: Reconcilable>(fresh: &[R], local: &[R]) -> Vec<R> {
    let local_by_id: HashMap<&str, &R> = local.iter().map(|record| (record.id(), record)).collect();
    fresh
        .iter()
        .map(|record| match local_by_id.get(record.id()) {
            Some(held) => merge(record, *held),
            None => record.clone(),
        })
        .collect()
}

/// Takes a prediction back out of a held record. Live changes that landed
/// while the call was in flight stay counted; only `applied_delta` is removed.
pub fn undo_vote<R: Reconcilable>(
    held: &R,
    applied_delta: i64,
    previous_vote: Option<VoteDirection>,
) -> R {
    held.clone().with_vote_state(held.score() - applied_delta, previous_vote)
}

/// Applies a score read from a live row change. While one of the user's
/// votes on the record is still in flight the reading may predate it, so
/// the snapshot rule decides; otherwise the row is the server's value.
pub fn merge_live_score<R: Reconcilable>(held: &R, score: i64, vote_in_flight: bool) -> R {
    let fresh = held.clone().with_vote_state(score, held.user_vote());
    if vote_in_flight {
        merge(&fresh, held)
    } else {
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuthorRef, PostDraft};
    use VoteDirection::{Down, Up};

    fn post(id: &str, score: i64, vote: Option<VoteDirection>) -> PostRecord {
        let draft = PostDraft {
            title: format!("post {id}"),
            content: String::new(),
        };
        let mut post = PostRecord::provisional(id.to_string(), &draft, AuthorRef::placeholder("u1"));
        post.provisional = false;
        post.with_vote_state(score, vote)
    }

    #[test]
    fn local_vote_survives_lagging_snapshot() {
        let merged = merge(&post("p", 10, None), &post("p", 11, Some(Up)));
        assert_eq!((merged.score, merged.user_vote), (11, Some(Up)));
    }

    #[test]
    fn same_vote_takes_higher_score() {
        let merged = merge(&post("p", 10, Some(Up)), &post("p", 11, Some(Up)));
        assert_eq!((merged.score, merged.user_vote), (11, Some(Up)));

        let merged = merge(&post("p", 14, Some(Up)), &post("p", 11, Some(Up)));
        assert_eq!(merged.score, 14);
    }

    #[test]
    fn changed_vote_trusts_fresh() {
        let merged = merge(&post("p", 9, Some(Down)), &post("p", 11, Some(Up)));
        assert_eq!((merged.score, merged.user_vote), (9, Some(Down)));
    }

    #[test]
    fn no_local_vote_uses_fresh() {
        let fresh = post("p", 3, Some(Down));
        assert_eq!(merge(&fresh, &post("p", 8, None)), fresh);
        let fresh = post("p", 3, None);
        assert_eq!(merge(&fresh, &post("p", 8, None)), fresh);
    }

    #[test]
    fn non_vote_fields_come_from_fresh() {
        let mut fresh = post("p", 10, None);
        fresh.title = "edited".into();
        fresh.comment_count = 7;
        let merged = merge(&fresh, &post("p", 11, Some(Up)));
        assert_eq!(merged.title, "edited");
        assert_eq!(merged.comment_count, 7);
    }

    #[test]
    fn undo_keeps_changes_made_by_others() {
        // predicted 10 -> 11 (up); someone else's vote since moved it to 12
        let undone = undo_vote(&post("p", 12, Some(Up)), 1, None);
        assert_eq!((undone.score, undone.user_vote), (11, None));
    }

    #[test]
    fn live_score_only_held_up_while_a_vote_is_in_flight() {
        let held = post("p", 11, Some(Up));
        assert_eq!(merge_live_score(&held, 10, true).score, 11);
        assert_eq!(merge_live_score(&held, 12, true).score, 12);

        let settled = merge_live_score(&held, 10, false);
        assert_eq!((settled.score, settled.user_vote), (10, Some(Up)));
    }

    #[test]
    fn snapshot_merge_is_by_id_in_fresh_order() {
        let fresh = vec![post("a", 1, None), post("b", 5, Some(Up)), post("c", 0, None)];
        let local = vec![post("b", 6, Some(Up)), post("a", 2, Some(Down)), post("z", 9, None)];
        let merged = merge_snapshot(&fresh, &local);
        let summary: Vec<_> = merged
            .iter()
            .map(|p| (p.id.as_str(), p.score, p.user_vote))
            .collect();
        assert_eq!(
            summary,
            vec![("a", 2, Some(Down)), ("b", 6, Some(Up)), ("c", 0, None)]
        );
    }
}
