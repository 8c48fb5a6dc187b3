use crate::config::FallbackPolicy;
use crate::domain::{ClientId, DispatchCommand, DispatchMap, LoadKind};

/// Dispatch sent to one client when a cycle could not be solved.
pub fn fallback_dispatch(
    policy: FallbackPolicy,
    kind: LoadKind,
    previous: Option<&DispatchCommand>,
    horizon: usize,
) -> DispatchCommand {
    let vector = match (policy, previous) {
        (FallbackPolicy::HoldPrevious, Some(prev)) if !prev.vector().is_empty() => {
            // one cycle later: drop the step just actuated, repeat the tail
            let tail = &prev.vector()[1..];
            let last = prev.vector()[prev.vector().len() - 1];
            tail.iter()
                .copied()
                .chain(std::iter::repeat(last))
                .take(horizon)
                .collect()
        }
        _ => vec![0.0; horizon],
    };
    DispatchCommand(kind, vector)
}

/// Fallback dispatch for every client of the failed cycle.
pub fn fallback_map<'a>(
    policy: FallbackPolicy,
    clients: impl IntoIterator<Item = (&'a ClientId, LoadKind)>,
    previous: &DispatchMap,
    horizon: usize,
) -> DispatchMap {
    clients
        .into_iter()
        .map(|(client, kind)| {
            let prev = previous.get(client).filter(|p| p.kind() == kind);
            (client.clone(), fallback_dispatch(policy, kind, prev, horizon))
        })
        .collect()
}
