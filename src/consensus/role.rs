use crate::domain::ReplicaId;
use crate::group::MembershipView;

/// Position of a replica in its group, recomputed on every membership event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower { leader: Option<ReplicaId> },
    /// Group of two or fewer: no voting, every replica acts on its own data
    Singleton,
}

impl Role {
    pub fn from_view(view: &MembershipView, me: &ReplicaId) -> Self {
        if view.size <= 2 {
            Role::Singleton
        } else if view.leader.as_ref() == Some(me) {
            Role::Leader
        } else {
            Role::Follower {
                leader: view.leader.clone(),
            }
        }
    }

    /// Leader and singleton replicas may forward data and actuate devices.
    pub fn acts(&self) -> bool {
        matches!(self, Role::Leader | Role::Singleton)
    }
}
