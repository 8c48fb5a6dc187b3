use std::collections::BTreeMap;

use crate::domain::{Observation, ReplicaId};
use crate::group::{ObservationSummary, RoundId};

/// Ballot of one peer within a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteState {
    Yes,
    No,
    Pending,
}

impl From<bool> for VoteState {
    fn from(vote: bool) -> Self {
        if vote {
            VoteState::Yes
        } else {
            VoteState::No
        }
    }
}

/// Result of feeding a vote into a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// This vote brought the tally to quorum
    Complete,
    /// Same peer voted twice; the first ballot stands
    Duplicate,
    /// Vote from the proposer itself or after quorum
    Ignored,
}

/// A leader-initiated poll of the other replicas.
///
/// The number of expected votes is fixed when the round opens: membership
/// changes while the round is in flight do not move the quorum.
#[derive(Debug, Clone)]
pub struct VoteRound {
    id: RoundId,
    observation: Observation,
    expected: usize,
    votes: BTreeMap<ReplicaId, bool>,
}

impl VoteRound {
    pub fn open(id: RoundId, observation: Observation, group_size: usize) -> Self {
        Self {
            id,
            observation,
            expected: group_size.saturating_sub(1),
            votes: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &RoundId {
        &self.id
    }

    pub fn observation(&self) -> &Observation {
        &self.observation
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn tallied(&self) -> usize {
        self.votes.len()
    }

    pub fn record(&mut self, peer: &ReplicaId, vote: bool) -> RecordOutcome {
        if peer == &self.id.proposer || self.is_complete() {
            return RecordOutcome::Ignored;
        }
        if self.votes.contains_key(peer) {
            return RecordOutcome::Duplicate;
        }
        self.votes.insert(peer.clone(), vote);
        if self.is_complete() {
            RecordOutcome::Complete
        } else {
            RecordOutcome::Recorded
        }
    }

    /// Quorum is reached exactly when every other member of the opening view voted.
    pub fn is_complete(&self) -> bool {
        self.votes.len() == self.expected
    }

    pub fn state_of(&self, peer: &ReplicaId) -> VoteState {
        self.votes
            .get(peer)
            .map(|v| VoteState::from(*v))
            .unwrap_or(VoteState::Pending)
    }

    pub fn yes_count(&self) -> usize {
        self.votes.values().filter(|v| **v).count()
    }

    pub fn no_count(&self) -> usize {
        self.votes.values().filter(|v| !**v).count()
    }

    /// The proposal stands when approvals outnumber rejections.
    pub fn accepted(&self) -> bool {
        self.yes_count() > self.no_count()
    }

    /// First peer (in id order) that approved.
    pub fn first_approver(&self) -> Option<&ReplicaId> {
        self.votes.iter().find(|(_, v)| **v).map(|(peer, _)| peer)
    }
}

/// Vote request held by a replica that had no observation to compare against
#[derive(Debug, Clone, PartialEq)]
pub struct PendingVoteRequest {
    pub round: RoundId,
    pub summary: ObservationSummary,
}

/// Buffer of unanswered vote requests plus the retry budget spent on them
#[derive(Debug, Clone, Default)]
pub struct PendingVotes {
    requests: BTreeMap<RoundId, PendingVoteRequest>,
    retries: u32,
}

impl PendingVotes {
    /// Buffers a request; returns true when the buffer was empty before.
    pub fn push(&mut self, request: PendingVoteRequest) -> bool {
        let was_empty = self.requests.is_empty();
        self.requests.insert(request.round.clone(), request);
        was_empty
    }

    /// Counts one failed recheck and returns the total so far.
    pub fn bump_retry(&mut self) -> u32 {
        self.retries += 1;
        self.retries
    }

    /// Empties the buffer and resets the retry budget.
    pub fn drain(&mut self) -> Vec<PendingVoteRequest> {
        self.retries = 0;
        std::mem::take(&mut self.requests).into_values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LoadKind, Timestamp};
    use rstest::rstest;

    fn observation() -> Observation {
        Observation::profile(
            "BU1".into(),
            LoadKind::Building,
            Timestamp::now(),
            vec![500.0; 24],
            480.0,
        )
        .unwrap()
    }

    fn round(size: usize) -> VoteRound {
        VoteRound::open(
            RoundId {
                proposer: "BU1".into(),
                seq: 1,
            },
            observation(),
            size,
        )
    }

    fn peer(i: usize) -> ReplicaId {
        ReplicaId(format!("BU{}", i + 2))
    }

    #[rstest]
    #[case(3)]
    #[case(4)]
    #[case(5)]
    #[case(7)]
    #[case(10)]
    fn test_quorum_completes_at_exactly_n_minus_one(#[case] n: usize) {
        let mut r = round(n);
        for i in 0..n - 2 {
            assert_eq!(r.record(&peer(i), true), RecordOutcome::Recorded);
            assert!(!r.is_complete());
        }
        assert_eq!(r.record(&peer(n - 2), false), RecordOutcome::Complete);
        assert!(r.is_complete());

        // a late extra member never pushes the tally past n - 1
        assert_eq!(r.record(&peer(n + 5), true), RecordOutcome::Ignored);
        assert_eq!(r.tallied(), n - 1);
    }

    #[test]
    fn test_duplicate_and_self_votes_do_not_count() {
        let mut r = round(4);
        assert_eq!(r.record(&peer(0), true), RecordOutcome::Recorded);
        assert_eq!(r.record(&peer(0), false), RecordOutcome::Duplicate);
        assert_eq!(r.record(&"BU1".into(), true), RecordOutcome::Ignored);
        assert_eq!(r.tallied(), 1);
        assert_eq!(r.state_of(&peer(0)), VoteState::Yes);
        assert_eq!(r.state_of(&peer(1)), VoteState::Pending);
    }

    #[test]
    fn test_verdict_and_first_approver() {
        let mut r = round(4);
        r.record(&"BU4".into(), true);
        r.record(&"BU2".into(), false);
        r.record(&"BU3".into(), false);
        assert!(!r.accepted());
        assert_eq!(r.first_approver(), Some(&ReplicaId::from("BU4")));

        let mut tie = round(3);
        tie.record(&"BU2".into(), true);
        tie.record(&"BU3".into(), false);
        assert!(!tie.accepted());
    }

    #[test]
    fn test_pending_votes_drain_resets_budget() {
        let mut pending = PendingVotes::default();
        let req = PendingVoteRequest {
            round: RoundId {
                proposer: "EV1".into(),
                seq: 3,
            },
            summary: ObservationSummary {
                kind: LoadKind::EvAggregate,
                timestamp: Timestamp::now(),
                metric: 90.0,
            },
        };
        assert!(pending.push(req.clone()));
        assert!(!pending.push(req.clone()));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.bump_retry(), 1);
        assert_eq!(pending.bump_retry(), 2);

        let drained = pending.drain();
        assert_eq!(drained, vec![req]);
        assert!(pending.is_empty());
        assert_eq!(pending.retries(), 0);
    }
}
