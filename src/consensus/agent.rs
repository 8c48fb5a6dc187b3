//! Replica consensus state machine.
//!
//! The agent is synchronous and performs no I/O: every input is processed to
//! completion and turned into a list of [`Action`]s that the runtime executes.
//! Timers are fire-and-forget; an expired timer comes back as a fresh
//! [`Input::Timer`].

use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::role::Role;
use super::round::{PendingVoteRequest, PendingVotes, RecordOutcome, VoteRound};
use super::strategy::{approves, strategy_for, LoadStrategy};
use crate::config::ConsensusConfig;
use crate::domain::{DeviceCommand, DispatchCommand, LoadKind, Observation, PowerRequest, ReplicaId};
use crate::group::{GroupEvent, GroupMessage, MembershipView, ObservationSummary, RoundId};
use crate::telemetry::{EventKind, TelemetryEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Recheck for local data while vote requests are buffered
    VoteRetry,
    /// Recheck for a leader while holding unreleased data
    LeaderWait,
    /// Recheck leadership while holding an unapplied dispatch
    Actuation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Observation(Observation),
    Group(GroupEvent),
    Dispatch(DispatchCommand),
    Timer(TimerId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    RequestVote { round: RoundId, summary: ObservationSummary },
    SendVote { round: RoundId, vote: bool },
    Broadcast(GroupMessage),
    /// Forward an agreed observation to the coordinator
    Submit(PowerRequest),
    Actuate(DeviceCommand),
    ArmTimer { timer: TimerId, after: Duration },
    HaltTimer(TimerId),
    Telemetry(TelemetryEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Proposing,
    Decided,
}

pub struct ConsensusAgent {
    id: ReplicaId,
    kind: LoadKind,
    strategy: Box<dyn LoadStrategy>,
    cfg: ConsensusConfig,
    view: MembershipView,
    role: Role,
    latest: Option<Observation>,
    released: bool,
    round: Option<VoteRound>,
    next_seq: u64,
    pending: PendingVotes,
    pending_dispatch: Option<DispatchCommand>,
    armed: BTreeSet<TimerId>,
    current_power: f64,
}

impl ConsensusAgent {
    pub fn new(id: ReplicaId, group: impl Into<String>, kind: LoadKind, cfg: ConsensusConfig) -> Self {
        Self::with_strategy(id, group, strategy_for(kind), cfg)
    }

    pub fn with_strategy(
        id: ReplicaId,
        group: impl Into<String>,
        strategy: Box<dyn LoadStrategy>,
        cfg: ConsensusConfig,
    ) -> Self {
        let view = MembershipView::alone(group);
        let role = Role::from_view(&view, &id);
        Self {
            kind: strategy.kind(),
            id,
            strategy,
            cfg,
            view,
            role,
            latest: None,
            released: false,
            round: None,
            next_seq: 0,
            pending: PendingVotes::default(),
            pending_dispatch: None,
            armed: BTreeSet::new(),
            current_power: 0.0,
        }
    }

    pub fn id(&self) -> &ReplicaId {
        &self.id
    }

    pub fn kind(&self) -> LoadKind {
        self.kind
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn view(&self) -> &MembershipView {
        &self.view
    }

    pub fn phase(&self) -> Phase {
        if self.round.is_some() {
            Phase::Proposing
        } else if self.released {
            Phase::Decided
        } else {
            Phase::Idle
        }
    }

    pub fn round(&self) -> Option<&VoteRound> {
        self.round.as_ref()
    }

    pub fn pending_votes(&self) -> usize {
        self.pending.len()
    }

    /// Last actuated power, reported back in the next observation.
    pub fn current_power(&self) -> f64 {
        self.current_power
    }

    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        let mut out = Vec::new();
        match input {
            Input::Observation(obs) => self.on_observation(obs, &mut out),
            Input::Group(event) => self.on_group(event, &mut out),
            Input::Dispatch(cmd) => self.on_dispatch(cmd, &mut out),
            Input::Timer(timer) => {
                self.armed.remove(&timer);
                self.on_timer(timer, &mut out);
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Local data
    // ------------------------------------------------------------------

    fn on_observation(&mut self, obs: Observation, out: &mut Vec<Action>) {
        if obs.kind != self.kind {
            warn!(replica = %self.id, kind = %obs.kind, "ignoring observation of another kind");
            return;
        }
        info!(replica = %self.id, timestamp = %obs.timestamp, "sensor data received");
        out.push(self.event(EventKind::SensorData, self.id.to_string()));

        if let Some(stale) = self.round.take() {
            info!(replica = %self.id, round = %stale.id(), "fresher observation supersedes round");
        }
        self.latest = Some(obs);
        self.released = false;

        if !self.pending.is_empty() {
            self.answer_pending(out);
        }
        self.advance(out);
    }

    /// Moves unreleased data forward according to the current role.
    fn advance(&mut self, out: &mut Vec<Action>) {
        if self.released || self.round.is_some() {
            return;
        }
        let Some(obs) = self.latest.clone() else {
            return;
        };
        match self.role.clone() {
            Role::Singleton => {
                self.halt(TimerId::LeaderWait, out);
                self.submit(&obs, out);
            }
            Role::Leader => {
                self.halt(TimerId::LeaderWait, out);
                self.open_round(obs, out);
            }
            Role::Follower { leader: None } => {
                info!(replica = %self.id, size = self.view.size, "no leader yet");
                if !self.armed.contains(&TimerId::LeaderWait) {
                    let after = self.cfg.leader_wait();
                    self.arm(TimerId::LeaderWait, after, out);
                }
            }
            Role::Follower { leader: Some(_) } => {
                self.halt(TimerId::LeaderWait, out);
            }
        }
    }

    fn open_round(&mut self, obs: Observation, out: &mut Vec<Action>) {
        self.next_seq += 1;
        let id = RoundId {
            proposer: self.id.clone(),
            seq: self.next_seq,
        };
        let summary = ObservationSummary {
            kind: obs.kind,
            timestamp: obs.timestamp,
            metric: self.strategy.comparison_metric(&obs),
        };
        // a fresh round always starts from an empty tally
        self.round = Some(VoteRound::open(id.clone(), obs, self.view.size));
        info!(replica = %self.id, round = %id, expected = self.view.size.saturating_sub(1), "begun voting");
        out.push(self.event(EventKind::VoteBegin, id.to_string()));
        out.push(Action::RequestVote { round: id, summary });
    }

    fn submit(&mut self, obs: &Observation, out: &mut Vec<Action>) {
        info!(replica = %self.id, "sending observation to coordinator");
        out.push(self.event(EventKind::SendReqPower, self.id.to_string()));
        out.push(Action::Submit(obs.to_request()));
        self.released = true;
    }

    // ------------------------------------------------------------------
    // Group events
    // ------------------------------------------------------------------

    fn on_group(&mut self, event: GroupEvent, out: &mut Vec<Action>) {
        let membership_changed = match event.view() {
            Some(view) => {
                self.view = view.clone();
                true
            }
            None => false,
        };

        match event {
            GroupEvent::MemberJoined { member, .. } => {
                debug!(replica = %self.id, member = %member, size = self.view.size, "member joined");
            }
            GroupEvent::MemberLeft { member, .. } => {
                info!(replica = %self.id, member = %member, size = self.view.size, "member left");
                out.push(self.event(EventKind::MemberLeft, member.to_string()));
            }
            GroupEvent::LeaderElected { leader, .. } => {
                info!(replica = %self.id, leader = %leader, "leader elected");
                out.push(self.event(EventKind::LeaderElected, leader.to_string()));
            }
            GroupEvent::LeaderExited { leader, .. } => {
                info!(replica = %self.id, leader = %leader, "leader left");
                out.push(self.event(EventKind::LeaderLeft, leader.to_string()));
            }
            GroupEvent::VoteRequest { round, summary } => self.on_vote_request(round, summary, out),
            GroupEvent::VoteReply { round, from, vote } => self.on_vote_reply(round, from, vote, out),
            GroupEvent::Message { from, message } => self.on_message(from, message, out),
        }

        if membership_changed {
            self.refresh_role(out);
        }
    }

    fn refresh_role(&mut self, out: &mut Vec<Action>) {
        let role = Role::from_view(&self.view, &self.id);
        if role == self.role {
            return;
        }
        info!(replica = %self.id, from = ?self.role, to = ?role, "role changed");
        self.role = role;

        if self.role != Role::Leader {
            if let Some(round) = self.round.take() {
                warn!(replica = %self.id, round = %round.id(), "leadership lost, abandoning round");
            }
        }
        if self.role.acts() {
            if let Some(cmd) = self.pending_dispatch.take() {
                self.actuate(cmd, out);
            }
        }
        self.advance(out);
    }

    fn on_vote_request(&mut self, round: RoundId, summary: ObservationSummary, out: &mut Vec<Action>) {
        if round.proposer == self.id {
            return;
        }
        if summary.kind != self.kind {
            warn!(replica = %self.id, round = %round, kind = %summary.kind, "vote request for another kind");
            return;
        }
        match &self.latest {
            Some(obs) => {
                let own = self.strategy.comparison_metric(obs);
                let vote = approves(own, summary.metric, self.cfg.vote_tolerance);
                debug!(replica = %self.id, round = %round, own, proposed = summary.metric, vote, "voting");
                out.push(Action::SendVote { round, vote });
            }
            None => {
                info!(replica = %self.id, round = %round, "no local data yet, deferring vote");
                if self.pending.push(PendingVoteRequest { round, summary }) {
                    let after = self.cfg.vote_retry();
                    self.arm(TimerId::VoteRetry, after, out);
                }
            }
        }
    }

    fn answer_pending(&mut self, out: &mut Vec<Action>) {
        let Some(obs) = &self.latest else {
            return;
        };
        let own = self.strategy.comparison_metric(obs);
        for request in self.pending.drain() {
            let vote = approves(own, request.summary.metric, self.cfg.vote_tolerance);
            debug!(replica = %self.id, round = %request.round, vote, "answering deferred vote");
            out.push(Action::SendVote {
                round: request.round,
                vote,
            });
        }
        self.halt(TimerId::VoteRetry, out);
    }

    fn on_vote_reply(&mut self, round: RoundId, from: ReplicaId, vote: bool, out: &mut Vec<Action>) {
        let Some(current) = self.round.as_mut() else {
            debug!(replica = %self.id, round = %round, "vote for a round no longer open");
            return;
        };
        if current.id() != &round {
            debug!(replica = %self.id, round = %round, open = %current.id(), "stale vote ignored");
            return;
        }
        match current.record(&from, vote) {
            RecordOutcome::Complete => self.decide(out),
            RecordOutcome::Recorded => {
                debug!(
                    replica = %self.id,
                    round = %round,
                    tallied = current.tallied(),
                    expected = current.expected(),
                    "vote recorded"
                );
            }
            RecordOutcome::Duplicate | RecordOutcome::Ignored => {
                debug!(replica = %self.id, round = %round, from = %from, "vote not counted");
            }
        }
    }

    fn decide(&mut self, out: &mut Vec<Action>) {
        let Some(round) = self.round.take() else {
            return;
        };
        info!(
            replica = %self.id,
            round = %round.id(),
            yes = round.yes_count(),
            no = round.no_count(),
            "voting result"
        );
        out.push(self.event(EventKind::VoteEnd, round.id().to_string()));

        if round.accepted() {
            info!(replica = %self.id, "verified observation is consistent");
            self.submit(round.observation(), out);
        } else if let Some(peer) = round.first_approver() {
            info!(replica = %self.id, designated = %peer, "asking other member to send data");
            out.push(Action::Broadcast(GroupMessage::Release {
                round: round.id().clone(),
                designated: peer.clone(),
            }));
            self.released = true;
        } else {
            warn!(replica = %self.id, round = %round.id(), "no peer approved, sending own observation");
            self.submit(round.observation(), out);
        }
    }

    fn on_message(&mut self, from: ReplicaId, message: GroupMessage, out: &mut Vec<Action>) {
        match message {
            GroupMessage::Release { round, designated } => {
                if designated != self.id {
                    debug!(replica = %self.id, round = %round, designated = %designated, "release for another member");
                    return;
                }
                match self.latest.clone() {
                    Some(obs) => {
                        info!(replica = %self.id, leader = %from, round = %round, "designated to send data");
                        self.submit(&obs, out);
                    }
                    None => {
                        warn!(replica = %self.id, round = %round, "designated to send data but holding none");
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn on_dispatch(&mut self, cmd: DispatchCommand, out: &mut Vec<Action>) {
        if cmd.kind() != self.kind {
            debug!(replica = %self.id, kind = %cmd.kind(), "dispatch for another kind");
            return;
        }
        info!(replica = %self.id, "received allocated power");
        if self.role.acts() {
            self.actuate(cmd, out);
        } else {
            if self.pending_dispatch.replace(cmd).is_some() {
                debug!(replica = %self.id, "newer dispatch supersedes unapplied one");
            }
            if !self.armed.contains(&TimerId::Actuation) {
                let after = self.cfg.actuation_retry();
                self.arm(TimerId::Actuation, after, out);
            }
        }
    }

    fn actuate(&mut self, cmd: DispatchCommand, out: &mut Vec<Action>) {
        self.halt(TimerId::Actuation, out);
        match self.strategy.device_command(&cmd) {
            Some(command) => {
                self.current_power = command.power();
                info!(replica = %self.id, command = ?command, "actuating device");
                out.push(self.event(EventKind::Actuate, self.id.to_string()));
                out.push(Action::Actuate(command));
            }
            None => warn!(replica = %self.id, "empty dispatch vector"),
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn on_timer(&mut self, timer: TimerId, out: &mut Vec<Action>) {
        match timer {
            TimerId::VoteRetry => self.on_vote_retry(out),
            TimerId::LeaderWait => self.advance(out),
            TimerId::Actuation => {
                let Some(cmd) = self.pending_dispatch.take() else {
                    return;
                };
                if self.role.acts() {
                    self.actuate(cmd, out);
                } else {
                    self.pending_dispatch = Some(cmd);
                    let after = self.cfg.actuation_retry();
                    self.arm(TimerId::Actuation, after, out);
                }
            }
        }
    }

    fn on_vote_retry(&mut self, out: &mut Vec<Action>) {
        if self.pending.is_empty() {
            return;
        }
        if self.latest.is_some() {
            self.answer_pending(out);
            return;
        }
        let retries = self.pending.bump_retry();
        if retries >= self.cfg.max_vote_retries {
            warn!(replica = %self.id, retries, "no device data, rejecting deferred votes");
            for request in self.pending.drain() {
                out.push(self.event(EventKind::VoteTimeout, request.round.to_string()));
                out.push(Action::SendVote {
                    round: request.round,
                    vote: false,
                });
            }
        } else {
            info!(replica = %self.id, retries, "waiting for device data");
            let after = self.cfg.vote_retry();
            self.arm(TimerId::VoteRetry, after, out);
        }
    }

    fn arm(&mut self, timer: TimerId, after: Duration, out: &mut Vec<Action>) {
        self.armed.insert(timer);
        out.push(Action::ArmTimer { timer, after });
    }

    fn halt(&mut self, timer: TimerId, out: &mut Vec<Action>) {
        if self.armed.remove(&timer) {
            out.push(Action::HaltTimer(timer));
        }
    }

    fn event(&self, kind: EventKind, target: String) -> Action {
        Action::Telemetry(TelemetryEvent::new(
            kind,
            self.view.group.clone(),
            self.id.to_string(),
            target,
        ))
    }
}
