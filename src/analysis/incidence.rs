//! incidence.rs
//! Numerical first-derivative incidence at the evaluation point.

use crate::derive::FirstDerivatives;
use crate::error::Result;
use crate::model::{DerivId, DerivIdTable, EvalContext, SymbolTable};
use crate::store::{NodeEvaluator, Registry, SymbolType};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
pub struct Incidence {
    /// Values of every first derivative at the evaluation point.
    pub values: BTreeMap<(usize, DerivId), f64>,
    /// `(equation, endogenous type-specific id)` pairs at lag 0 that survived the cutoff.
    pub contemporaneous: BTreeMap<(usize, usize), f64>,
    /// Entries whose magnitude fell below the cutoff.
    pub pruned: BTreeSet<(usize, DerivId)>,
}

impl Incidence {
    pub fn row(&self, eq: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.contemporaneous.range((eq, 0)..(eq + 1, 0)).map(|(&(_, v), &x)| (v, x))
    }

    pub fn get(&self, eq: usize, var: usize) -> Option<f64> { self.contemporaneous.get(&(eq, var)).copied() }
}

pub fn compute_incidence(
    registry: &Registry,
    symbols: &SymbolTable,
    deriv_ids: &DerivIdTable,
    first: &FirstDerivatives,
    context: &EvalContext,
    cutoff: f64,
) -> Result<Incidence> {
    let leaves = context.leaves(symbols);
    let mut evaluator = NodeEvaluator::new(registry, &leaves);
    let mut incidence = Incidence::default();
    for (&(eq, id), &node) in first {
        let value = evaluator.value(node)?;
        incidence.values.insert((eq, id), value);
        if value.abs() < cutoff {
            debug!("Equation {}: derivative w.r.t. id {} is {:e}, below cutoff {:e}", eq + 1, id.0, value, cutoff);
            incidence.pruned.insert((eq, id));
            continue;
        }
        if deriv_ids.type_of(id)? == SymbolType::Endogenous {
            let (symbol, lag) = deriv_ids.lookup(id)?;
            if lag == 0 {
                incidence.contemporaneous.insert((eq, symbols.type_specific_id(symbol)?), value);
            }
        }
    }
    Ok(incidence)
}
