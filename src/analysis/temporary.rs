//! temporary.rs
//! Selection and ordering of temporary terms (shared subexpressions).

use super::topology::PostOrder;
use crate::store::{NodeId, NodeKind, Registry};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporaryTermsMode {
    /// One numbering across the whole evaluation routine.
    #[default]
    Global,
    /// One set per block, plus a separate set for its other-variable derivatives.
    BlockScoped,
}

/// Temporaries grouped by the emission section that first needs them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemporarySet {
    pub sections: Vec<Vec<NodeId>>,
}

impl TemporarySet {
    pub fn empty(sections: usize) -> Self { Self { sections: vec![Vec::new(); sections] } }
    pub fn len(&self) -> usize { self.sections.iter().map(Vec::len).sum() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ { self.sections.iter().flatten().copied() }
}

/// Picks the non-leaf nodes referenced at least twice from `groups` of roots.
///
/// Operands of a node are only counted on its first reference, so a shared
/// subtree contributes its inner nodes once. Each temporary lands in the first
/// group that reaches it, after the temporaries it depends on. Nodes in
/// `available` are already computed and act as leaves.
pub fn extract(registry: &Registry, groups: &[Vec<NodeId>], available: &HashSet<NodeId>) -> TemporarySet {
    let mut counts: HashMap<NodeId, u32> = HashMap::new();
    for &root in groups.iter().flatten() {
        count(registry, root, available, &mut counts);
    }
    let is_temp = |node: NodeId| {
        counts.get(&node).map_or(false, |&c| c >= 2)
            && !matches!(registry.kind(node), NodeKind::Constant(_))
            && !registry.kind(node).is_leaf()
    };

    let mut walk = PostOrder::new(registry);
    for &node in available {
        walk.mark(node);
    }
    let mut set = TemporarySet::empty(groups.len());
    for (s, group) in groups.iter().enumerate() {
        let section = &mut set.sections[s];
        for &root in group {
            walk.visit(root, &mut |n| {
                if is_temp(n) {
                    section.push(n);
                }
            });
        }
    }
    set
}

fn count(registry: &Registry, node: NodeId, available: &HashSet<NodeId>, counts: &mut HashMap<NodeId, u32>) {
    if available.contains(&node) {
        return;
    }
    let c = counts.entry(node).or_insert(0);
    *c += 1;
    if *c == 1 {
        for &operand in registry.operands(node) {
            count(registry, operand, available, counts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SymbolId;

    fn shared() -> (Registry, NodeId, NodeId, NodeId, NodeId) {
        // s = exp(x); r1 = s + y; r2 = s * y; r3 = r1 * 2
        let mut reg = Registry::new();
        let x = reg.variable(SymbolId(0), 0);
        let y = reg.variable(SymbolId(1), 0);
        let s = reg.exp(x);
        let r1 = reg.add(s, y);
        let r2 = reg.mul(s, y);
        let two = reg.constant(2.0);
        let r3 = reg.mul(r1, two);
        (reg, s, r1, r2, r3)
    }

    #[test]
    fn test_shared_subexpression_becomes_temporary() {
        let (reg, s, r1, r2, _) = shared();
        let set = extract(&reg, &[vec![r1, r2]], &HashSet::new());
        assert_eq!(set.sections, vec![vec![s]]);
    }

    #[test]
    fn test_temporary_lands_in_first_section_using_it() {
        let (reg, s, r1, r2, r3) = shared();
        let set = extract(&reg, &[vec![r2], vec![r1, r3]], &HashSet::new());
        assert_eq!(set.sections[0], vec![s]);
        // r1 is referenced by the second group and by r3
        assert_eq!(set.sections[1], vec![r1]);
    }

    #[test]
    fn test_temporaries_follow_their_dependencies() {
        let (reg, s, r1, _, r3) = shared();
        let r4 = {
            let mut reg = reg.clone();
            let e = reg.exp(r1);
            (reg.add(e, r3), reg)
        };
        let (root, reg) = r4;
        let set = extract(&reg, &[vec![root, r1, s]], &HashSet::new());
        let order: Vec<NodeId> = set.iter().collect();
        let pos = |id: NodeId| order.iter().position(|&x| x == id);
        assert!(pos(s).unwrap() < pos(r1).unwrap());
    }

    #[test]
    fn test_available_nodes_are_not_selected_again() {
        let (reg, s, r1, r2, _) = shared();
        let available = HashSet::from([s]);
        let set = extract(&reg, &[vec![r1, r2]], &available);
        assert!(set.is_empty());
    }
}
