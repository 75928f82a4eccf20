//! Deterministic cluster-task ownership.
//!
//! Every node evaluates the same assignment function over the same record
//! snapshot, so exactly one node considers a task its own without any
//! coordination round.

use std::collections::BTreeSet;

use crate::record::DatabaseTopology;

/// splitmix64 finalizer; cheap, stable mixing for task placement.
fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Decide which node owns a task.
///
/// The mentor node wins if it is a live member. Otherwise `(task_id, epoch)`
/// hashes into the live member list, sorted by node tag so every node
/// computes the same answer.
pub fn whose_task_is_it(
    topology: &DatabaseTopology,
    deletion_in_progress: &BTreeSet<String>,
    mentor_node: Option<&str>,
    task_id: u64,
    epoch: u64,
) -> Option<String> {
    let mut candidates: Vec<&str> = topology
        .members
        .iter()
        .map(|m| m.node_tag.as_str())
        .filter(|tag| !deletion_in_progress.contains(*tag))
        .collect();
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_unstable();

    if let Some(mentor) = mentor_node {
        if candidates.contains(&mentor) {
            return Some(mentor.to_string());
        }
    }

    let slot = (mix64(task_id ^ mix64(epoch)) % candidates.len() as u64) as usize;
    Some(candidates[slot].to_string())
}
