//! Leader election strategies.
//!
//! Election is local and optimistic: every surviving node evaluates the same
//! deterministic strategy over its own view of the candidates, so nodes with
//! the same view converge on one winner without a voting round-trip.

use strata_common::NetworkNode;

/// Why an election runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionReason {
    /// The known coordinator went stale
    CoordinatorLost,
    /// More than one live node claims the coordinator role
    DuplicateCoordinator,
}

/// Inputs available to a strategy besides the candidate list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionContext {
    pub reason: ElectionReason,
    pub lost_coordinator: Option<String>,
}

impl ElectionContext {
    pub fn coordinator_lost(lost: impl Into<String>) -> Self {
        Self {
            reason: ElectionReason::CoordinatorLost,
            lost_coordinator: Some(lost.into()),
        }
    }

    pub fn duplicate_coordinator() -> Self {
        Self {
            reason: ElectionReason::DuplicateCoordinator,
            lost_coordinator: None,
        }
    }
}

/// Decides whether the local node should take the coordinator role
pub trait LeaderElectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `candidates` always contains the local node
    fn should_become_leader(
        &self,
        self_id: &str,
        candidates: &[NetworkNode],
        context: &ElectionContext,
    ) -> bool;
}

/// Default strategy: the candidate with the smallest node id wins
#[derive(Debug, Clone, Copy, Default)]
pub struct LowestIdElection;

impl LeaderElectionStrategy for LowestIdElection {
    fn name(&self) -> &'static str {
        "lowest-id"
    }

    fn should_become_leader(
        &self,
        self_id: &str,
        candidates: &[NetworkNode],
        _context: &ElectionContext,
    ) -> bool {
        candidates
            .iter()
            .map(|n| n.node_id.as_str())
            .chain(std::iter::once(self_id))
            .min()
            == Some(self_id)
    }
}

/// Highest numeric metadata value wins; ties and missing values fall back to id order
#[derive(Debug, Clone)]
pub struct MetadataPriorityElection {
    key: String,
}

impl MetadataPriorityElection {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    fn priority(&self, node: &NetworkNode) -> i64 {
        node.metadata
            .get(&self.key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(i64::MIN)
    }
}

impl Default for MetadataPriorityElection {
    fn default() -> Self {
        Self::new("priority")
    }
}

impl LeaderElectionStrategy for MetadataPriorityElection {
    fn name(&self) -> &'static str {
        "metadata-priority"
    }

    fn should_become_leader(
        &self,
        self_id: &str,
        candidates: &[NetworkNode],
        _context: &ElectionContext,
    ) -> bool {
        // Highest priority first, then smallest id
        candidates
            .iter()
            .min_by(|a, b| {
                self.priority(b)
                    .cmp(&self.priority(a))
                    .then_with(|| a.node_id.cmp(&b.node_id))
            })
            .is_none_or(|winner| winner.node_id == self_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::{Metadata, NodeRole};

    fn node(id: &str) -> NetworkNode {
        NetworkNode::new(id, id, NodeRole::Participant)
    }

    fn ranked(id: &str, priority: &str) -> NetworkNode {
        node(id).with_metadata(Metadata::from([("priority".to_string(), priority.to_string())]))
    }

    #[test]
    fn test_lowest_id_is_deterministic() {
        let candidates = vec![node("node-c"), node("node-a"), node("node-b")];
        let ctx = ElectionContext::coordinator_lost("node-z");
        let strategy = LowestIdElection;

        let winners: Vec<_> = ["node-a", "node-b", "node-c"]
            .into_iter()
            .filter(|id| strategy.should_become_leader(id, &candidates, &ctx))
            .collect();
        assert_eq!(winners, vec!["node-a"]);
    }

    #[test]
    fn test_lowest_id_sole_survivor_wins() {
        let ctx = ElectionContext::coordinator_lost("node-a");
        assert!(LowestIdElection.should_become_leader("node-b", &[node("node-b")], &ctx));
        assert!(LowestIdElection.should_become_leader("node-b", &[], &ctx));
    }

    #[test]
    fn test_metadata_priority() {
        let candidates = vec![ranked("node-a", "1"), ranked("node-b", "7"), node("node-c")];
        let ctx = ElectionContext::duplicate_coordinator();
        let strategy = MetadataPriorityElection::default();
        assert!(strategy.should_become_leader("node-b", &candidates, &ctx));
        assert!(!strategy.should_become_leader("node-a", &candidates, &ctx));
        assert!(!strategy.should_become_leader("node-c", &candidates, &ctx));
    }

    #[test]
    fn test_metadata_priority_ties_use_id() {
        let candidates = vec![ranked("node-b", "3"), ranked("node-a", "3")];
        let ctx = ElectionContext::duplicate_coordinator();
        assert!(MetadataPriorityElection::default().should_become_leader("node-a", &candidates, &ctx));
    }
}
