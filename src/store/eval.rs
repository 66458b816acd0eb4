//! eval.rs
//! Direct numerical evaluation of expression nodes.

use super::registry::Registry;
use super::types::*;
use crate::error::Result;
use std::collections::HashMap;

/// Source of values for the leaves of an expression.
pub trait LeafValues {
    fn variable(&self, symbol: SymbolId, lag: i32) -> Result<f64>;
    fn parameter(&self, symbol: SymbolId) -> Result<f64>;
    fn steady_state(&self, symbol: SymbolId) -> Result<f64>;
}

/// Memoizing evaluator; one instance per set of leaf values.
pub struct NodeEvaluator<'a> {
    registry: &'a Registry,
    leaves: &'a dyn LeafValues,
    memo: HashMap<NodeId, f64>,
}

impl<'a> NodeEvaluator<'a> {
    pub fn new(registry: &'a Registry, leaves: &'a dyn LeafValues) -> Self {
        Self { registry, leaves, memo: HashMap::new() }
    }

    pub fn value(&mut self, node: NodeId) -> Result<f64> {
        if let Some(&v) = self.memo.get(&node) {
            return Ok(v);
        }
        let registry = self.registry;
        let operands = registry.operands(node);
        let v = match registry.kind(node) {
            NodeKind::Constant(i) => registry.constants_data[*i as usize],
            NodeKind::Variable { symbol, lag } => self.leaves.variable(*symbol, *lag)?,
            NodeKind::Parameter(symbol) => self.leaves.parameter(*symbol)?,
            NodeKind::SteadyState(symbol) => self.leaves.steady_state(*symbol)?,
            NodeKind::Unary(op) => op.apply(self.value(operands[0])?),
            NodeKind::Binary(op) => {
                let a = self.value(operands[0])?;
                let b = self.value(operands[1])?;
                op.apply(a, b)
            }
            NodeKind::External { function, wrt } => {
                let args = operands.iter().map(|&o| self.value(o)).collect::<Result<Vec<f64>>>()?;
                registry.externals[*function as usize].partial(&args, wrt)
            }
        };
        self.memo.insert(node, v);
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;

    struct Fixed;

    impl LeafValues for Fixed {
        fn variable(&self, symbol: SymbolId, lag: i32) -> Result<f64> {
            Ok(symbol.0 as f64 + 10.0 * lag as f64)
        }
        fn parameter(&self, _symbol: SymbolId) -> Result<f64> { Ok(0.5) }
        fn steady_state(&self, symbol: SymbolId) -> Result<f64> {
            Err(ModelError::MissingValue { name: format!("ss {}", symbol.0) })
        }
    }

    #[test]
    fn test_evaluates_nested_expression() {
        let mut reg = Registry::new();
        let y = reg.variable(SymbolId(2), 0);
        let y_lag = reg.variable(SymbolId(2), -1);
        let p = reg.parameter(SymbolId(9));
        let prod = reg.mul(p, y_lag);
        let e = reg.add(y, prod);
        let mut ev = NodeEvaluator::new(&reg, &Fixed);
        assert_eq!(ev.value(e).unwrap(), 2.0 + 0.5 * -8.0);
    }

    #[test]
    fn test_missing_leaf_propagates() {
        let mut reg = Registry::new();
        let ss = reg.steady_state(SymbolId(1));
        let mut ev = NodeEvaluator::new(&reg, &Fixed);
        assert!(matches!(ev.value(ss), Err(ModelError::MissingValue { .. })));
    }
}
