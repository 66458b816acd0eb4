//! feedback.rs
//! Splitting a simultaneous block into a recursive part and a feedback set.

use crate::error::{ModelError, Result};
use log::debug;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

/// Which equations are forced into the feedback set before cycle breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MfsPolicy {
    /// Every equation of a simultaneous block is feedback.
    #[default]
    AllFeedback,
    /// Equations not normalized explicitly or by isolation.
    NonNormalized,
    /// Equations nonlinear in the block's variables.
    NonLinear,
    /// Equations both nonlinear and not normalized.
    NonNormalizedNonLinear,
}

impl MfsPolicy {
    pub fn from_level(level: u8) -> Result<Self> {
        match level {
            0 => Ok(MfsPolicy::AllFeedback),
            1 => Ok(MfsPolicy::NonNormalized),
            2 => Ok(MfsPolicy::NonLinear),
            3 => Ok(MfsPolicy::NonNormalizedNonLinear),
            _ => Err(ModelError::Config { msg: format!("mfs must be between 0 and 3, got {}", level) }),
        }
    }

    pub fn forces_feedback(self, normalized: bool, nonlinear: bool) -> bool {
        match self {
            MfsPolicy::AllFeedback => true,
            MfsPolicy::NonNormalized => !normalized,
            MfsPolicy::NonLinear => nonlinear,
            MfsPolicy::NonNormalizedNonLinear => nonlinear && !normalized,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackSplit {
    /// Local indices, each depending only on earlier ones.
    pub recursive: Vec<usize>,
    /// Local indices, ascending.
    pub feedback: Vec<usize>,
}

/// Edges point from dependency to user, restricted to non-feedback nodes.
fn recursive_graph(n: usize, dependencies: &[(usize, usize)], feedback: &[bool]) -> DiGraph<usize, ()> {
    let mut graph = DiGraph::with_capacity(n, dependencies.len());
    for i in 0..n {
        graph.add_node(i);
    }
    for &(user, dep) in dependencies {
        if user != dep && !feedback[user] && !feedback[dep] {
            graph.add_edge(NodeIndex::new(dep), NodeIndex::new(user), ());
        }
    }
    graph
}

/// `dependencies` holds `(user, dependency)` pairs of local indices.
/// Nodes in `forced` are feedback; further nodes are added greedily (highest
/// degree inside a remaining cycle, lowest index on ties) until the rest is acyclic.
pub fn select_feedback(n: usize, dependencies: &[(usize, usize)], forced: &[bool]) -> FeedbackSplit {
    let mut feedback = forced.to_vec();
    loop {
        let graph = recursive_graph(n, dependencies, &feedback);
        let mut added = false;
        for scc in tarjan_scc(&graph) {
            if scc.len() < 2 {
                continue;
            }
            let degree = |node: NodeIndex| {
                let inner = |d| graph.neighbors_directed(node, d).filter(|m| scc.contains(m)).count();
                inner(Direction::Incoming) + inner(Direction::Outgoing)
            };
            let Some(&chosen) = scc.iter().max_by(|&&a, &&b| degree(a).cmp(&degree(b)).then(b.index().cmp(&a.index()))) else {
                continue;
            };
            debug!("Breaking cycle of {} equations at local equation {}", scc.len(), chosen.index());
            feedback[chosen.index()] = true;
            added = true;
        }
        if !added {
            break;
        }
    }

    // Tarjan emits users before their dependencies; reverse for evaluation order.
    let graph = recursive_graph(n, dependencies, &feedback);
    let recursive = tarjan_scc(&graph)
        .into_iter()
        .rev()
        .flatten()
        .map(|node| node.index())
        .filter(|&i| !feedback[i])
        .collect();
    let feedback = (0..n).filter(|&i| feedback[i]).collect();
    FeedbackSplit { recursive, feedback }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(MfsPolicy::AllFeedback, true, false, true)]
    #[case(MfsPolicy::NonNormalized, true, true, false)]
    #[case(MfsPolicy::NonNormalized, false, false, true)]
    #[case(MfsPolicy::NonLinear, true, true, true)]
    #[case(MfsPolicy::NonNormalizedNonLinear, true, true, false)]
    #[case(MfsPolicy::NonNormalizedNonLinear, false, true, true)]
    fn test_policy_forcing(#[case] policy: MfsPolicy, #[case] normalized: bool, #[case] nonlinear: bool, #[case] forced: bool) {
        assert_eq!(policy.forces_feedback(normalized, nonlinear), forced);
    }

    #[test]
    fn test_from_level() {
        assert_eq!(MfsPolicy::from_level(2).unwrap(), MfsPolicy::NonLinear);
        assert!(MfsPolicy::from_level(4).is_err());
    }

    #[test]
    fn test_two_cycle_breaks_once() {
        // 0 uses 1, 1 uses 0
        let split = select_feedback(2, &[(0, 1), (1, 0)], &[false, false]);
        assert_eq!(split.feedback.len(), 1);
        assert_eq!(split.recursive.len(), 1);
    }

    #[test]
    fn test_recursive_part_is_topologically_ordered() {
        // chain 2 <- 1 <- 0 plus 0 uses 3 (feedback)
        let deps = [(0, 1), (1, 2), (0, 3), (3, 0)];
        let split = select_feedback(4, &deps, &[false, false, false, true]);
        assert_eq!(split.feedback, vec![3]);
        assert_eq!(split.recursive, vec![2, 1, 0]);
    }

    #[test]
    fn test_all_forced() {
        let split = select_feedback(3, &[(0, 1), (1, 2), (2, 0)], &[true; 3]);
        assert!(split.recursive.is_empty());
        assert_eq!(split.feedback, vec![0, 1, 2]);
    }
}
