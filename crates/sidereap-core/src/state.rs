use crate::types::{ContainerObservation, ContainerStateSets, SidecarSet};

/// Termination reasons that count as a finished container
pub const COMPLETED_REASONS: [&str; 2] = ["Completed", "Error"];

/// Bucket container observations into all/running/completed sets
///
/// Ready containers are running. Not-ready containers are completed only when their
/// last termination reason is in [`COMPLETED_REASONS`]; anything else (waiting,
/// crash-looping, unknown) stays unaccounted.
pub fn classify(observations: &[ContainerObservation]) -> ContainerStateSets {
    let mut sets = ContainerStateSets::default();

    for obs in observations {
        sets.all.insert(obs.name.clone());

        if obs.ready {
            sets.running.insert(obs.name.clone());
        } else if obs
            .termination_reason
            .as_deref()
            .is_some_and(|r| COMPLETED_REASONS.contains(&r))
        {
            sets.completed.insert(obs.name.clone());
        }
    }

    // A name reported twice with conflicting states must not land in both buckets.
    let overlap: Vec<String> = sets.running.intersection(&sets.completed).cloned().collect();
    for name in overlap {
        sets.completed.remove(&name);
    }

    sets
}

/// Decide whether the sidecars should be told to exit
///
/// Due only when every known container is accounted for and the running set is exactly
/// the sidecar set. A pod with nothing running is never due.
pub fn shutdown_due(sets: &ContainerStateSets, sidecars: &SidecarSet) -> bool {
    if sets.running.is_empty() {
        return false;
    }

    let all_accounted = sets
        .all
        .iter()
        .all(|n| sets.running.contains(n) || sets.completed.contains(n));

    all_accounted && &sets.running == sidecars.names()
}
