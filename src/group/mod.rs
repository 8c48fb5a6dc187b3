//! Boundary to the group membership service.
//!
//! Leader election, membership tracking and message transport are provided by
//! an external service. Agents only see the events below and talk back through
//! [`GroupHandle`]. The `local` module holds an in-process implementation used
//! by the simulation binary and the integration tests.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::{LoadKind, ReplicaId, Timestamp};

#[cfg(feature = "sim")]
pub mod local;

/// Identifier of one vote round, unique per proposer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoundId {
    pub proposer: ReplicaId,
    pub seq: u64,
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.proposer, self.seq)
    }
}

/// What peers need to judge a proposer's observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationSummary {
    pub kind: LoadKind,
    pub timestamp: Timestamp,
    pub metric: f64,
}

/// Application messages exchanged inside a replica group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupMessage {
    /// The leader names the replica that must forward its observation for `round`.
    Release { round: RoundId, designated: ReplicaId },
}

/// Snapshot of the group as seen by one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipView {
    pub group: String,
    pub size: usize,
    pub leader: Option<ReplicaId>,
}

impl MembershipView {
    pub fn alone(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            size: 1,
            leader: None,
        }
    }
}

/// Inbound notifications from the membership service
#[derive(Debug, Clone, PartialEq)]
pub enum GroupEvent {
    MemberJoined { member: ReplicaId, view: MembershipView },
    MemberLeft { member: ReplicaId, view: MembershipView },
    LeaderElected { leader: ReplicaId, view: MembershipView },
    LeaderExited { leader: ReplicaId, view: MembershipView },
    VoteRequest { round: RoundId, summary: ObservationSummary },
    VoteReply { round: RoundId, from: ReplicaId, vote: bool },
    Message { from: ReplicaId, message: GroupMessage },
}

impl GroupEvent {
    /// Membership view carried by membership/leadership events.
    pub fn view(&self) -> Option<&MembershipView> {
        match self {
            GroupEvent::MemberJoined { view, .. }
            | GroupEvent::MemberLeft { view, .. }
            | GroupEvent::LeaderElected { view, .. }
            | GroupEvent::LeaderExited { view, .. } => Some(view),
            _ => None,
        }
    }
}

/// Outbound primitives of the membership service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GroupHandle: Send + Sync {
    /// Ask every other member to vote on `summary`.
    async fn request_vote(&self, round: RoundId, summary: ObservationSummary) -> Result<()>;
    /// Answer a vote request; delivered to the round's proposer.
    async fn send_vote(&self, round: RoundId, vote: bool) -> Result<()>;
    /// Send a message to every other member.
    async fn broadcast(&self, message: GroupMessage) -> Result<()>;
}
