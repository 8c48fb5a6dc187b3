use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::aggregator::{Coordinator, CoordinatorAction, CoordinatorInput, CoordinatorTimer};
use super::report::CycleReport;
use crate::domain::{ClientId, DispatchCommand};
use crate::group::GroupEvent;
use crate::telemetry::EventSink;
use crate::timer::TimerSet;

/// Where the coordinator's dispatches and cycle reports go
#[derive(Debug, Clone)]
pub struct CoordinatorOutputs {
    pub dispatches: mpsc::UnboundedSender<(ClientId, DispatchCommand)>,
    pub reports: mpsc::UnboundedSender<CycleReport>,
}

/// Drives a [`Coordinator`] from tokio channels, one input at a time.
pub struct CoordinatorService {
    coordinator: Coordinator,
    outputs: CoordinatorOutputs,
    sink: Arc<dyn EventSink>,
    timers: TimerSet<CoordinatorTimer>,
}

impl CoordinatorService {
    pub fn new(coordinator: Coordinator, outputs: CoordinatorOutputs, sink: Arc<dyn EventSink>) -> Self {
        Self {
            coordinator,
            outputs,
            sink,
            timers: TimerSet::new(),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Runs until the input channel closes. A closed group channel only stops
    /// membership updates.
    pub async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<CoordinatorInput>,
        mut group_events: mpsc::UnboundedReceiver<GroupEvent>,
    ) -> Result<()> {
        let id = self.coordinator.id().clone();
        info!(coordinator = %id, "coordinator service started");
        let mut group_open = true;
        loop {
            let input = tokio::select! {
                biased;
                event = group_events.recv(), if group_open => match event {
                    Some(event) => CoordinatorInput::Group(event),
                    None => {
                        debug!(coordinator = %id, "group channel closed");
                        group_open = false;
                        continue;
                    }
                },
                input = inputs.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
                timer = self.timers.expired() => CoordinatorInput::Timer(timer),
            };
            for action in self.coordinator.handle(input) {
                self.execute(action);
            }
        }
        info!(
            coordinator = %id,
            cycles = self.coordinator.cycles(),
            "coordinator service stopped"
        );
        Ok(())
    }

    fn execute(&mut self, action: CoordinatorAction) {
        match action {
            CoordinatorAction::SendDispatch { client, command } => {
                if self.outputs.dispatches.send((client.clone(), command)).is_err() {
                    warn!(coordinator = %self.coordinator.id(), client = %client, "dispatch channel closed");
                }
            }
            CoordinatorAction::Report(report) => {
                if self.outputs.reports.send(*report).is_err() {
                    debug!(coordinator = %self.coordinator.id(), "no report consumer");
                }
            }
            CoordinatorAction::ArmTimer { timer, after } => self.timers.arm(timer, after),
            CoordinatorAction::HaltTimer(timer) => {
                self.timers.halt(timer);
            }
            CoordinatorAction::Telemetry(event) => self.sink.emit(event),
        }
    }
}
