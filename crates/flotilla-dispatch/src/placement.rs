//! Host selection for new jobs.
//!
//! Picks the host running the fewest jobs; ties go to the lowest host ID
//! so the choice is deterministic for a given cluster snapshot.

use tracing::debug;

use flotilla_core::Host;

pub fn select_host(hosts: &[Host]) -> Option<&Host> {
    let chosen = hosts
        .iter()
        .min_by(|a, b| a.jobs.len().cmp(&b.jobs.len()).then_with(|| a.id.cmp(&b.id)))?;
    debug!(host = %chosen.id, jobs = chosen.jobs.len(), candidates = hosts.len(), "host selected");
    Some(chosen)
}
