//! Replica consensus: a leader only forwards an observation once the other
//! replicas of its load have confirmed it against their own readings.

pub mod agent;
pub mod role;
pub mod round;
pub mod runtime;
pub mod strategy;

pub use agent::{Action, ConsensusAgent, Input, Phase, TimerId};
pub use role::Role;
pub use round::{PendingVoteRequest, PendingVotes, RecordOutcome, VoteRound, VoteState};
pub use runtime::{ReplicaOutputs, ReplicaRuntime};
pub use strategy::{approves, strategy_for, LoadStrategy, SheddableLoad, StorageLoad};
