use crate::store::{NodeId, Registry};
use std::collections::HashSet;

/// Depth-first post-order walk over expression operands.
///
/// Every operand is emitted before its users and each node at most once
/// across all calls to `visit`. Nodes marked beforehand are treated as
/// already available: neither they nor their operands are emitted.
pub struct PostOrder<'a> {
    registry: &'a Registry,
    visited: HashSet<NodeId>,
}

impl<'a> PostOrder<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry, visited: HashSet::new() }
    }

    pub fn mark(&mut self, node: NodeId) { self.visited.insert(node); }

    pub fn visit(&mut self, node: NodeId, emit: &mut dyn FnMut(NodeId)) {
        if !self.visited.insert(node) {
            return;
        }
        for &operand in self.registry.operands(node) {
            self.visit(operand, emit);
        }
        emit(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SymbolId;

    #[test]
    fn test_post_order_diamond_dependency() {
        // Shape: a -> b, a -> c, b+c -> d
        let mut reg = Registry::new();
        let a = reg.variable(SymbolId(0), 0);
        let b = reg.exp(a);
        let c = reg.log(a);
        let d = reg.add(b, c);

        let mut res = Vec::new();
        let mut walk = PostOrder::new(&reg);
        walk.visit(d, &mut |n| res.push(n));
        walk.visit(b, &mut |n| res.push(n));
        let pos = |id: NodeId| res.iter().position(|&x| x == id).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(a) < pos(c));
        assert!(pos(b) < pos(d));
        assert!(pos(c) < pos(d));
        assert_eq!(res.len(), 4);
    }

    #[test]
    fn test_marked_nodes_hide_their_operands() {
        let mut reg = Registry::new();
        let a = reg.variable(SymbolId(0), 0);
        let b = reg.exp(a);
        let d = reg.mul(b, b);
        let mut walk = PostOrder::new(&reg);
        walk.mark(b);
        let mut seen = Vec::new();
        walk.visit(d, &mut |n| seen.push(n));
        assert_eq!(seen, vec![d]);
    }
}
