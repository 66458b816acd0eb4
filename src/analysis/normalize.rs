//! normalize.rs
//! Rewriting an equation as `variable = expression` for its matched variable.

use crate::derive::{Differentiator, FirstDerivatives};
use crate::error::Result;
use crate::model::{DerivId, Equation};
use crate::store::{BinaryOp, NodeId, NodeKind, Registry, UnaryOp};
use std::collections::{BTreeSet, HashMap};

/// How an equation is used once its block is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquationKind {
    /// `lhs` is the variable and `rhs` computes it.
    Evaluate,
    /// The variable equals the stored expression.
    EvaluateRenormalized(NodeId),
    /// Only usable as a residual.
    Solve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Explicit,
    Isolated,
    Linear,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalization {
    pub kind: EquationKind,
    pub method: Method,
}

impl Normalization {
    /// Explicit or obtained by symbolic isolation.
    pub fn is_normalized(&self) -> bool { matches!(self.method, Method::Explicit | Method::Isolated) }
}

pub struct Normalizer<'a, 'd, 'r> {
    pub registry: &'a mut Registry,
    pub diff: &'d mut Differentiator<'r>,
    pub first: &'a FirstDerivatives,
}

impl Normalizer<'_, '_, '_> {
    /// Normalizes equation `eq` for `var` (the variable node at lag 0, with id
    /// `var_id`). `block_ids` are the lag-0 ids of the block's variables.
    pub fn normalize(
        &mut self,
        eq: usize,
        equation: &Equation,
        var: NodeId,
        var_id: DerivId,
        block_ids: &BTreeSet<DerivId>,
    ) -> Result<Normalization> {
        let in_lhs = self.diff.depends_on(self.registry, equation.lhs, var_id);
        let in_rhs = self.diff.depends_on(self.registry, equation.rhs, var_id);

        // 1. Explicit
        if equation.lhs == var && !in_rhs {
            return Ok(Normalization { kind: EquationKind::Evaluate, method: Method::Explicit });
        }

        // 2. Isolation along the single occurrence path
        let isolated = match (in_lhs, in_rhs) {
            (true, false) => self.isolate(equation.lhs, equation.rhs, var, var_id),
            (false, true) => self.isolate(equation.rhs, equation.lhs, var, var_id),
            _ => None,
        };
        if let Some(node) = isolated {
            return Ok(Normalization { kind: EquationKind::EvaluateRenormalized(node), method: Method::Isolated });
        }

        // 3. Linear solve: residual = c + d * v with d free of block variables
        if let Some(&d) = self.first.get(&(eq, var_id)) {
            let nonlinear = self.diff.non_null(self.registry, d).iter().any(|id| block_ids.contains(id));
            if !nonlinear {
                let replacements = HashMap::from([(var, self.registry.zero())]);
                let c = self.registry.substitute(equation.residual, &replacements, &mut HashMap::new());
                let ratio = self.registry.div(c, d);
                let solved = self.registry.neg(ratio);
                return Ok(Normalization { kind: EquationKind::EvaluateRenormalized(solved), method: Method::Linear });
            }
        }

        Ok(Normalization { kind: EquationKind::Solve, method: Method::None })
    }

    /// Peels `expr = acc` until `expr` is the variable; `None` when an
    /// operation on the path cannot be inverted or both operands contain it.
    fn isolate(&mut self, mut expr: NodeId, mut acc: NodeId, var: NodeId, var_id: DerivId) -> Option<NodeId> {
        loop {
            if expr == var {
                return Some(acc);
            }
            let operands = self.registry.operands(expr).to_vec();
            match self.registry.kind(expr).clone() {
                NodeKind::Unary(op) => {
                    let r = &mut *self.registry;
                    acc = match op {
                        UnaryOp::Neg => r.neg(acc),
                        UnaryOp::Exp => r.log(acc),
                        UnaryOp::Log => r.exp(acc),
                        UnaryOp::Log10 => {
                            let ten = r.constant(10.0);
                            r.pow(ten, acc)
                        }
                        UnaryOp::Sqrt => r.mul(acc, acc),
                        _ => return None,
                    };
                    expr = operands[0];
                }
                NodeKind::Binary(op) => {
                    let (a, b) = (operands[0], operands[1]);
                    let in_a = self.diff.depends_on(self.registry, a, var_id);
                    let in_b = self.diff.depends_on(self.registry, b, var_id);
                    if in_a == in_b {
                        return None;
                    }
                    let r = &mut *self.registry;
                    (acc, expr) = match (op, in_a) {
                        (BinaryOp::Add, true) => (r.sub(acc, b), a),
                        (BinaryOp::Add, false) => (r.sub(acc, a), b),
                        (BinaryOp::Sub, true) => (r.add(acc, b), a),
                        (BinaryOp::Sub, false) => (r.sub(a, acc), b),
                        (BinaryOp::Mul, true) => (r.div(acc, b), a),
                        (BinaryOp::Mul, false) => (r.div(acc, a), b),
                        (BinaryOp::Div, true) => (r.mul(acc, b), a),
                        (BinaryOp::Div, false) => (r.div(a, acc), b),
                        (BinaryOp::Pow, true) if r.constant_value(b).is_some() => {
                            let one = r.one();
                            let inv = r.div(one, b);
                            (r.pow(acc, inv), a)
                        }
                        _ => return None,
                    };
                }
                _ => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::compute_jacobian;
    use crate::model::{DynamicModel, DynamicResolver, EvalContext};
    use crate::store::{NodeEvaluator, SymbolType};

    fn setup(build: impl Fn(&mut DynamicModel) -> (NodeId, NodeId)) -> (DynamicModel, Normalization, f64) {
        let mut m = DynamicModel::new();
        m.declare("x", SymbolType::Endogenous).unwrap();
        m.declare("w", SymbolType::Endogenous).unwrap();
        let (lhs, rhs) = build(&mut m);
        m.add_equation(lhs, rhs);
        m.compute_deriv_ids().unwrap();
        let xsym = m.symbols.id("x").unwrap();
        let x_id = m.deriv_ids.get(xsym, 0).unwrap();
        let x = m.registry.variable(xsym, 0);

        let resolver = DynamicResolver::new(&m.symbols, &m.deriv_ids);
        let mut diff = Differentiator::new(&resolver);
        let mut reg = m.registry.clone();
        let vars: BTreeSet<DerivId> = (0..m.deriv_ids.len() as u32).map(DerivId).collect();
        let first = compute_jacobian(&mut diff, &mut reg, &m.equations, &vars).unwrap();
        let block_ids = BTreeSet::from([x_id]);
        let eq = m.equations[0];
        let norm = Normalizer { registry: &mut reg, diff: &mut diff, first: &first }
            .normalize(0, &eq, x, x_id, &block_ids)
            .unwrap();

        // Value of the normalized expression with w = 3
        let mut ctx = EvalContext::new();
        ctx.set_by_name(&m.symbols, "w", 3.0).unwrap();
        let value = match norm.kind {
            EquationKind::EvaluateRenormalized(node) => {
                let leaves = ctx.leaves(&m.symbols);
                NodeEvaluator::new(&reg, &leaves).value(node).unwrap()
            }
            _ => f64::NAN,
        };
        drop(diff);
        (m, norm, value)
    }

    #[test]
    fn test_explicit() {
        let (_, norm, _) = setup(|m| {
            let x = m.var("x", 0).unwrap();
            let w = m.var("w", 0).unwrap();
            (x, w)
        });
        assert_eq!(norm.kind, EquationKind::Evaluate);
        assert!(norm.is_normalized());
    }

    #[test]
    fn test_isolation_through_log_and_product() {
        // log(2 * x) = w  =>  x = exp(w) / 2
        let (_, norm, value) = setup(|m| {
            let x = m.var("x", 0).unwrap();
            let w = m.var("w", 0).unwrap();
            let two = m.registry.constant(2.0);
            let p = m.registry.mul(two, x);
            (m.registry.log(p), w)
        });
        assert_eq!(norm.method, Method::Isolated);
        assert!((value - 3f64.exp() / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_linear_solve_when_variable_occurs_twice() {
        // x + w * x = w  =>  x = w / (1 + w)
        let (_, norm, value) = setup(|m| {
            let x = m.var("x", 0).unwrap();
            let w = m.var("w", 0).unwrap();
            let wx = m.registry.mul(w, x);
            (m.registry.add(x, wx), w)
        });
        assert_eq!(norm.method, Method::Linear);
        assert!(!norm.is_normalized());
        assert!((value - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_nonlinear_repeated_occurrence_is_solve() {
        // x * exp(x) = w
        let (_, norm, _) = setup(|m| {
            let x = m.var("x", 0).unwrap();
            let w = m.var("w", 0).unwrap();
            let e = m.registry.exp(x);
            (m.registry.mul(x, e), w)
        });
        assert_eq!(norm.kind, EquationKind::Solve);
    }
}
