use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::agent::{Action, ConsensusAgent, Input, TimerId};
use crate::domain::{DeviceCommand, PowerRequest, ReplicaId};
use crate::group::{GroupEvent, GroupHandle};
use crate::telemetry::EventSink;
use crate::timer::TimerSet;

/// Where a replica's released data and device commands go
#[derive(Debug, Clone)]
pub struct ReplicaOutputs {
    pub submissions: mpsc::UnboundedSender<PowerRequest>,
    pub actuations: mpsc::UnboundedSender<(ReplicaId, DeviceCommand)>,
}

/// Drives one [`ConsensusAgent`] from tokio channels.
///
/// Inputs are handled strictly one at a time; each resulting action is
/// executed before the next input is taken.
pub struct ReplicaRuntime<G> {
    agent: ConsensusAgent,
    group: G,
    outputs: ReplicaOutputs,
    sink: Arc<dyn EventSink>,
    timers: TimerSet<TimerId>,
}

impl<G: GroupHandle + 'static> ReplicaRuntime<G> {
    pub fn new(agent: ConsensusAgent, group: G, outputs: ReplicaOutputs, sink: Arc<dyn EventSink>) -> Self {
        Self {
            agent,
            group,
            outputs,
            sink,
            timers: TimerSet::new(),
        }
    }

    pub fn agent(&self) -> &ConsensusAgent {
        &self.agent
    }

    /// Runs until either the local input channel or the group channel closes.
    pub async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        mut group_events: mpsc::UnboundedReceiver<GroupEvent>,
    ) -> Result<()> {
        info!(replica = %self.agent.id(), kind = %self.agent.kind(), "replica runtime started");
        loop {
            let input = tokio::select! {
                biased;
                event = group_events.recv() => match event {
                    Some(event) => Input::Group(event),
                    None => break,
                },
                input = inputs.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
                timer = self.timers.expired() => Input::Timer(timer),
            };
            for action in self.agent.handle(input) {
                self.execute(action).await;
            }
        }
        info!(replica = %self.agent.id(), "replica runtime stopped");
        Ok(())
    }

    async fn execute(&mut self, action: Action) {
        let id = self.agent.id().clone();
        match action {
            Action::RequestVote { round, summary } => {
                if let Err(e) = self.group.request_vote(round.clone(), summary).await {
                    warn!(replica = %id, round = %round, error = %e, "vote request failed");
                }
            }
            Action::SendVote { round, vote } => {
                if let Err(e) = self.group.send_vote(round.clone(), vote).await {
                    warn!(replica = %id, round = %round, error = %e, "vote reply failed");
                }
            }
            Action::Broadcast(message) => {
                if let Err(e) = self.group.broadcast(message).await {
                    warn!(replica = %id, error = %e, "group broadcast failed");
                }
            }
            Action::Submit(request) => {
                if self.outputs.submissions.send(request).is_err() {
                    warn!(replica = %id, "coordinator channel closed, observation dropped");
                }
            }
            Action::Actuate(command) => {
                if self.outputs.actuations.send((id.clone(), command)).is_err() {
                    warn!(replica = %id, "device channel closed, command dropped");
                }
            }
            Action::ArmTimer { timer, after } => self.timers.arm(timer, after),
            Action::HaltTimer(timer) => {
                if self.timers.halt(timer) {
                    debug!(replica = %id, timer = ?timer, "timer halted");
                }
            }
            Action::Telemetry(event) => self.sink.emit(event),
        }
    }
}
