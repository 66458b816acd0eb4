//! tables.rs
//! Sparse first, second and third order derivative tables of the equations.

use super::differentiator::Differentiator;
use crate::error::Result;
use crate::model::{DerivId, Equation};
use crate::store::{NodeId, Registry};
use std::collections::{BTreeMap, BTreeSet};

pub type FirstDerivatives = BTreeMap<(usize, DerivId), NodeId>;
/// Keys satisfy `id1 <= id2`.
pub type SecondDerivatives = BTreeMap<(usize, DerivId, DerivId), NodeId>;
/// Keys satisfy `id1 <= id2 <= id3`.
pub type ThirdDerivatives = BTreeMap<(usize, DerivId, DerivId, DerivId), NodeId>;

fn candidates(diff: &mut Differentiator, registry: &Registry, node: NodeId, vars: &BTreeSet<DerivId>, from: Option<DerivId>) -> Vec<DerivId> {
    diff.non_null(registry, node)
        .iter()
        .copied()
        .filter(|id| vars.contains(id) && from.map_or(true, |f| *id >= f))
        .collect()
}

/// Derivatives of every residual w.r.t. `vars`; exact zeros are left out.
pub fn compute_jacobian(
    diff: &mut Differentiator,
    registry: &mut Registry,
    equations: &[Equation],
    vars: &BTreeSet<DerivId>,
) -> Result<FirstDerivatives> {
    let mut table = BTreeMap::new();
    for (eq, equation) in equations.iter().enumerate() {
        for id in candidates(diff, registry, equation.residual, vars, None) {
            let d = diff.derivative(registry, equation.residual, id)?;
            if !registry.is_zero(d) {
                table.insert((eq, id), d);
            }
        }
    }
    Ok(table)
}

pub fn compute_hessian(
    diff: &mut Differentiator,
    registry: &mut Registry,
    first: &FirstDerivatives,
    vars: &BTreeSet<DerivId>,
) -> Result<SecondDerivatives> {
    let mut table = BTreeMap::new();
    for (&(eq, id1), &d1) in first {
        if !vars.contains(&id1) {
            continue;
        }
        for id2 in candidates(diff, registry, d1, vars, Some(id1)) {
            let d2 = diff.derivative(registry, d1, id2)?;
            if !registry.is_zero(d2) {
                table.insert((eq, id1, id2), d2);
            }
        }
    }
    Ok(table)
}

pub fn compute_third(
    diff: &mut Differentiator,
    registry: &mut Registry,
    second: &SecondDerivatives,
    vars: &BTreeSet<DerivId>,
) -> Result<ThirdDerivatives> {
    let mut table = BTreeMap::new();
    for (&(eq, id1, id2), &d2) in second {
        for id3 in candidates(diff, registry, d2, vars, Some(id2)) {
            let d3 = diff.derivative(registry, d2, id3)?;
            if !registry.is_zero(d3) {
                table.insert((eq, id1, id2, id3), d3);
            }
        }
    }
    Ok(table)
}

/// All derivative tables produced by one computing pass.
#[derive(Debug, Clone, Default)]
pub struct DerivativeTables {
    /// Symbolic first derivatives, before any cutoff.
    pub first: FirstDerivatives,
    /// First derivatives written by the code generator.
    pub emitted_first: FirstDerivatives,
    pub second: SecondDerivatives,
    pub third: ThirdDerivatives,
    pub params: super::params::ParamsDerivatives,
    pub chain_rule: super::chain_rule::ChainRuleDerivatives,
}

impl DerivativeTables {
    pub fn nnz(&self) -> [usize; 3] { [self.emitted_first.len(), self.second.len(), self.third.len()] }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DynamicModel, DynamicResolver};
    use crate::store::SymbolType;

    #[test]
    fn test_second_order_keys_are_sorted_and_consistent() {
        // x*z + x^3 = 0
        let mut m = DynamicModel::new();
        m.declare("x", SymbolType::Endogenous).unwrap();
        m.declare("z", SymbolType::Endogenous).unwrap();
        let x = m.var("x", 0).unwrap();
        let z = m.var("z", -1).unwrap();
        let xz = m.registry.mul(x, z);
        let three = m.registry.constant(3.0);
        let x3 = m.registry.pow(x, three);
        let lhs = m.registry.add(xz, x3);
        let zero = m.registry.zero();
        m.add_equation(lhs, zero);
        m.compute_deriv_ids().unwrap();

        let vars: BTreeSet<DerivId> = (0..m.deriv_ids.len() as u32).map(DerivId).collect();
        let resolver = DynamicResolver::new(&m.symbols, &m.deriv_ids);
        let mut diff = Differentiator::new(&resolver);
        let mut reg = m.registry.clone();
        let eqs = m.equations.clone();
        let first = compute_jacobian(&mut diff, &mut reg, &eqs, &vars).unwrap();
        let second = compute_hessian(&mut diff, &mut reg, &first, &vars).unwrap();
        let third = compute_third(&mut diff, &mut reg, &second, &vars).unwrap();

        assert_eq!(first.len(), 2);
        // d2/dx2, d2/dxdz
        assert_eq!(second.len(), 2);
        for &(_, a, b) in second.keys() {
            assert!(a <= b);
        }
        // Only d3/dx3 survives
        assert_eq!(third.len(), 1);
        let (&(_, a, b, c), &node) = third.iter().next().unwrap();
        assert!(a == b && b == c);
        assert_eq!(reg.constant_value(node), Some(6.0));

        // Every second-order entry is the derivative of a first-order entry
        for (&(eq, id1, id2), &d2) in &second {
            let d1 = first[&(eq, id1)];
            assert_eq!(diff.derivative(&mut reg, d1, id2).unwrap(), d2);
        }
    }
}
