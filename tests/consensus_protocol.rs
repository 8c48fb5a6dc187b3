//! Replica groups running over the in-process membership service.

use std::sync::Arc;
use std::time::Duration;

use microgrid_coordinator::config::ConsensusConfig;
use microgrid_coordinator::consensus::{ConsensusAgent, Input, ReplicaOutputs, ReplicaRuntime};
use microgrid_coordinator::domain::{
    DeviceCommand, DispatchCommand, LoadKind, Observation, PowerRequest, ReplicaId, Timestamp, HORIZON,
};
use microgrid_coordinator::group::local::LocalGroup;
use microgrid_coordinator::telemetry::{ChannelSink, EventKind, TelemetryEvent};
use rstest::rstest;
use tokio::sync::mpsc;

struct Cluster {
    group: LocalGroup,
    inputs: Vec<(ReplicaId, mpsc::UnboundedSender<Input>)>,
    submissions: mpsc::UnboundedReceiver<PowerRequest>,
    actuations: mpsc::UnboundedReceiver<(ReplicaId, DeviceCommand)>,
    telemetry: mpsc::UnboundedReceiver<TelemetryEvent>,
}

impl Cluster {
    /// Starts `size` building replicas `BU1..` and elects `BU1`.
    fn start(size: usize) -> Self {
        let group = LocalGroup::new("BU");
        let (sub_tx, submissions) = mpsc::unbounded_channel();
        let (act_tx, actuations) = mpsc::unbounded_channel();
        let (sink, telemetry) = ChannelSink::new();
        let sink = Arc::new(sink);
        let mut inputs = Vec::new();
        for index in 1..=size {
            let id = ReplicaId::new(format!("BU{}", index));
            let (handle, events) = group.join(id.clone());
            let (tx, rx) = mpsc::unbounded_channel();
            let agent = ConsensusAgent::new(id.clone(), "BU", LoadKind::Building, ConsensusConfig::default());
            let runtime = ReplicaRuntime::new(
                agent,
                handle,
                ReplicaOutputs {
                    submissions: sub_tx.clone(),
                    actuations: act_tx.clone(),
                },
                sink.clone(),
            );
            tokio::spawn(runtime.run(rx, events));
            inputs.push((id, tx));
        }
        group.elect_first().unwrap();
        Self {
            group,
            inputs,
            submissions,
            actuations,
            telemetry,
        }
    }

    fn observe(&self, id: &str, current_power: f64) {
        let obs = Observation::profile(
            id.into(),
            LoadKind::Building,
            Timestamp::now(),
            vec![500.0; HORIZON],
            current_power,
        )
        .unwrap();
        let (_, tx) = self.inputs.iter().find(|(r, _)| r.as_str() == id).unwrap();
        tx.send(Input::Observation(obs)).unwrap();
    }

    fn dispatch(&self, command: DispatchCommand) {
        for (_, tx) in &self.inputs {
            tx.send(Input::Dispatch(command.clone())).unwrap();
        }
    }

    async fn next_submission(&mut self) -> PowerRequest {
        tokio::time::timeout(Duration::from_secs(10), self.submissions.recv())
            .await
            .expect("submission in time")
            .expect("submission channel open")
    }
}

#[rstest]
#[case(3)]
#[case(5)]
#[tokio::test]
async fn test_agreeing_replicas_release_leader_data(#[case] size: usize) {
    let mut cluster = Cluster::start(size);
    for index in 2..=size {
        cluster.observe(&format!("BU{}", index), 482.0);
    }
    cluster.observe("BU1", 480.0);

    let submitted = cluster.next_submission().await;
    assert_eq!(submitted.0, ReplicaId::from("BU1"));
    assert_eq!(submitted.4, 480.0);

    // exactly one submission for the round
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cluster.submissions.try_recv().is_err());
}

#[tokio::test]
async fn test_outvoted_leader_designates_an_approving_peer() {
    let mut cluster = Cluster::start(4);
    cluster.observe("BU2", 480.0);
    cluster.observe("BU3", 590.0);
    cluster.observe("BU4", 480.0);
    cluster.observe("BU1", 600.0);

    let submitted = cluster.next_submission().await;
    assert_eq!(submitted.0, ReplicaId::from("BU3"));
    assert_eq!(submitted.4, 590.0);
}

#[tokio::test]
async fn test_two_member_group_skips_voting() {
    let mut cluster = Cluster::start(2);
    cluster.observe("BU2", 300.0);
    cluster.observe("BU1", 480.0);

    let mut senders = vec![
        cluster.next_submission().await.0.to_string(),
        cluster.next_submission().await.0.to_string(),
    ];
    senders.sort();
    assert_eq!(senders, vec!["BU1", "BU2"]);

    while let Ok(ev) = cluster.telemetry.try_recv() {
        assert_ne!(ev.event, EventKind::VoteBegin);
    }
}

#[tokio::test]
async fn test_only_the_leader_actuates() {
    let mut cluster = Cluster::start(3);
    cluster.dispatch(DispatchCommand(LoadKind::Building, vec![420.0; HORIZON]));
    cluster.dispatch(DispatchCommand(LoadKind::EvAggregate, vec![10.0; HORIZON]));

    let (replica, command) = tokio::time::timeout(Duration::from_secs(10), cluster.actuations.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replica, ReplicaId::from("BU1"));
    assert_eq!(command, DeviceCommand::LimitPower(420.0));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cluster.actuations.try_recv().is_err());
}

#[tokio::test]
async fn test_new_leader_proposes_held_data() {
    let mut cluster = Cluster::start(4);
    cluster.group.leave(&"BU1".into());
    cluster.group.elect(&"BU2".into()).unwrap();

    cluster.observe("BU3", 480.0);
    cluster.observe("BU4", 481.0);
    cluster.observe("BU2", 479.0);

    let submitted = cluster.next_submission().await;
    assert_eq!(submitted.0, ReplicaId::from("BU2"));
}
