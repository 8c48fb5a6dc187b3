//! In-process group membership service.
//!
//! Members register with a [`LocalGroup`] and receive [`GroupEvent`]s on an
//! unbounded channel. Leadership is assigned explicitly by the owner of the
//! group (the simulation or a test); there is no election algorithm here.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{GroupEvent, GroupHandle, GroupMessage, MembershipView, ObservationSummary, RoundId};
use crate::domain::ReplicaId;

struct GroupState {
    name: String,
    members: BTreeMap<ReplicaId, mpsc::UnboundedSender<GroupEvent>>,
    leader: Option<ReplicaId>,
}

impl GroupState {
    fn view(&self) -> MembershipView {
        MembershipView {
            group: self.name.clone(),
            size: self.members.len(),
            leader: self.leader.clone(),
        }
    }

    fn send_to(&self, member: &ReplicaId, event: GroupEvent) {
        if let Some(tx) = self.members.get(member) {
            if tx.send(event).is_err() {
                debug!(member = %member, "dropping event for closed member");
            }
        }
    }

    fn send_all(&self, event: &GroupEvent) {
        for member in self.members.keys() {
            self.send_to(member, event.clone());
        }
    }

    fn send_others(&self, from: &ReplicaId, event: &GroupEvent) {
        for member in self.members.keys().filter(|m| *m != from) {
            self.send_to(member, event.clone());
        }
    }
}

/// Shared registry of one replica group
#[derive(Clone)]
pub struct LocalGroup {
    state: Arc<Mutex<GroupState>>,
}

impl LocalGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(GroupState {
                name: name.into(),
                members: BTreeMap::new(),
                leader: None,
            })),
        }
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    /// Registers a member; everyone (the newcomer included) gets the new view.
    pub fn join(
        &self,
        member: ReplicaId,
    ) -> (LocalGroupHandle, mpsc::UnboundedReceiver<GroupEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.members.insert(member.clone(), tx);
        let event = GroupEvent::MemberJoined {
            member: member.clone(),
            view: state.view(),
        };
        state.send_all(&event);
        drop(state);
        (
            LocalGroupHandle {
                member,
                group: self.clone(),
            },
            rx,
        )
    }

    /// Removes a member. A departing leader is reported as exited first.
    pub fn leave(&self, member: &ReplicaId) {
        let mut state = self.state.lock();
        if state.members.remove(member).is_none() {
            return;
        }
        if state.leader.as_ref() == Some(member) {
            state.leader = None;
            let event = GroupEvent::LeaderExited {
                leader: member.clone(),
                view: state.view(),
            };
            state.send_all(&event);
        }
        let event = GroupEvent::MemberLeft {
            member: member.clone(),
            view: state.view(),
        };
        state.send_all(&event);
    }

    /// Makes `leader` the group leader and notifies every member.
    pub fn elect(&self, leader: &ReplicaId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.members.contains_key(leader) {
            bail!("{} is not a member of group {}", leader, state.name);
        }
        if let Some(previous) = state.leader.take() {
            if &previous != leader {
                let event = GroupEvent::LeaderExited {
                    leader: previous,
                    view: state.view(),
                };
                state.send_all(&event);
            }
        }
        state.leader = Some(leader.clone());
        let event = GroupEvent::LeaderElected {
            leader: leader.clone(),
            view: state.view(),
        };
        state.send_all(&event);
        Ok(())
    }

    /// Elects the member with the smallest id, if any.
    pub fn elect_first(&self) -> Result<Option<ReplicaId>> {
        let first = self.state.lock().members.keys().next().cloned();
        if let Some(leader) = &first {
            self.elect(leader)?;
        }
        Ok(first)
    }

    pub fn view(&self) -> MembershipView {
        self.state.lock().view()
    }
}

/// One member's handle to a [`LocalGroup`]
#[derive(Clone)]
pub struct LocalGroupHandle {
    member: ReplicaId,
    group: LocalGroup,
}

impl LocalGroupHandle {
    pub fn member(&self) -> &ReplicaId {
        &self.member
    }
}

#[async_trait]
impl GroupHandle for LocalGroupHandle {
    async fn request_vote(&self, round: RoundId, summary: ObservationSummary) -> Result<()> {
        let state = self.group.state.lock();
        state.send_others(&self.member, &GroupEvent::VoteRequest { round, summary });
        Ok(())
    }

    async fn send_vote(&self, round: RoundId, vote: bool) -> Result<()> {
        let state = self.group.state.lock();
        let proposer = round.proposer.clone();
        state.send_to(
            &proposer,
            GroupEvent::VoteReply {
                round,
                from: self.member.clone(),
                vote,
            },
        );
        Ok(())
    }

    async fn broadcast(&self, message: GroupMessage) -> Result<()> {
        let state = self.group.state.lock();
        state.send_others(
            &self.member,
            &GroupEvent::Message {
                from: self.member.clone(),
                message,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LoadKind, Timestamp};

    fn drain(rx: &mut mpsc::UnboundedReceiver<GroupEvent>) -> Vec<GroupEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_join_elect_and_vote_routing() {
        let group = LocalGroup::new("BU");
        let (h1, mut rx1) = group.join("BU1".into());
        let (h2, mut rx2) = group.join("BU2".into());
        let (_h3, mut rx3) = group.join("BU3".into());
        group.elect(&"BU1".into()).unwrap();

        let events = drain(&mut rx1);
        let last = events.last().unwrap();
        assert_eq!(last.view().unwrap().size, 3);
        assert_eq!(last.view().unwrap().leader, Some("BU1".into()));
        drain(&mut rx2);
        drain(&mut rx3);

        let round = RoundId {
            proposer: "BU1".into(),
            seq: 1,
        };
        let summary = ObservationSummary {
            kind: LoadKind::Building,
            timestamp: Timestamp::now(),
            metric: 10.0,
        };
        h1.request_vote(round.clone(), summary).await.unwrap();
        assert!(drain(&mut rx1).is_empty());
        assert!(matches!(drain(&mut rx2)[0], GroupEvent::VoteRequest { .. }));
        assert!(matches!(drain(&mut rx3)[0], GroupEvent::VoteRequest { .. }));

        h2.send_vote(round, true).await.unwrap();
        match &drain(&mut rx1)[0] {
            GroupEvent::VoteReply { from, vote, .. } => {
                assert_eq!(from, &ReplicaId::from("BU2"));
                assert!(*vote);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_leader_leaving_reports_exit() {
        let group = LocalGroup::new("EV");
        let (_h1, _rx1) = group.join("EV1".into());
        let (_h2, mut rx2) = group.join("EV2".into());
        group.elect(&"EV1".into()).unwrap();
        drain(&mut rx2);

        group.leave(&"EV1".into());
        let events = drain(&mut rx2);
        assert!(matches!(events[0], GroupEvent::LeaderExited { .. }));
        match &events[1] {
            GroupEvent::MemberLeft { view, .. } => {
                assert_eq!(view.size, 1);
                assert_eq!(view.leader, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_elect_unknown_member_fails() {
        let group = LocalGroup::new("BESS");
        assert!(group.elect(&"BESS9".into()).is_err());
    }
}
