//! chain_rule.rs
//! Derivatives of feedback equations once the recursive variables of their
//! block have been substituted by their normalized expressions.

use super::differentiator::Differentiator;
use crate::analysis::{BlockDecomposition, EquationKind};
use crate::error::{ModelError, Result};
use crate::model::{DerivId, DerivIdTable, Equation, SymbolTable};
use crate::store::{NodeId, Registry, SymbolId, SymbolType};
use log::debug;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// `(feedback equation, variable, lag) -> d residual / d variable(lag)`
pub type ChainRuleDerivatives = BTreeMap<(usize, SymbolId, i32), NodeId>;

pub fn compute_chain_rule(
    diff: &mut Differentiator,
    registry: &mut Registry,
    symbols: &SymbolTable,
    deriv_ids: &DerivIdTable,
    equations: &[Equation],
    blocks: &BlockDecomposition,
) -> Result<ChainRuleDerivatives> {
    let mut table = BTreeMap::new();
    for b in 0..blocks.nb_blocks() {
        let block = blocks.block(b)?;
        if block.recursive_size == 0 || block.feedback_size() == 0 {
            continue;
        }

        // 1. Recursive variables at lag 0 with their normalized expressions
        let mut recursive: Vec<(DerivId, NodeId)> = Vec::with_capacity(block.recursive_size);
        for (i, &eq) in blocks.recursive_equations(b)?.iter().enumerate() {
            let symbol = symbols.by_type_specific_id(SymbolType::Endogenous, blocks.block_variable_id(b, i)?)?;
            let id = deriv_ids.require(symbols, symbol, 0)?;
            let expr = match blocks.equation_kind(eq)? {
                EquationKind::Evaluate => equations[eq].rhs,
                EquationKind::EvaluateRenormalized(node) => node,
                EquationKind::Solve => return Err(ModelError::NotNormalized { equation: eq }),
            };
            recursive.push((id, expr));
        }

        // 2. Feedback variables at every lag they occur with
        let feedback_symbols: BTreeSet<SymbolId> = blocks
            .feedback_variables(b)?
            .iter()
            .map(|&v| symbols.by_type_specific_id(SymbolType::Endogenous, v))
            .collect::<Result<_>>()?;
        let feedback_eqs = blocks.feedback_equations(b)?;
        let mut candidates = BTreeSet::new();
        let roots = feedback_eqs.iter().map(|&eq| equations[eq].residual).chain(recursive.iter().map(|r| r.1));
        for node in roots.collect::<Vec<_>>() {
            for &id in diff.non_null(registry, node) {
                if feedback_symbols.contains(&deriv_ids.lookup(id)?.0) {
                    candidates.insert(id);
                }
            }
        }

        // 3. Total derivatives of the recursive variables
        let mut total: Vec<HashMap<DerivId, NodeId>> = Vec::with_capacity(recursive.len());
        for r in 0..recursive.len() {
            let (_, expr) = recursive[r];
            let mut row = HashMap::new();
            for &id in &candidates {
                let direct = diff.derivative(registry, expr, id)?;
                let acc = compose(diff, registry, expr, direct, &recursive[..r], &total, id)?;
                row.insert(id, acc);
            }
            total.push(row);
        }

        // 4. Feedback residuals through the recursive part
        for &eq in feedback_eqs {
            let residual = equations[eq].residual;
            for &id in &candidates {
                let direct = diff.derivative(registry, residual, id)?;
                let acc = compose(diff, registry, residual, direct, &recursive, &total, id)?;
                if !registry.is_zero(acc) {
                    let (symbol, lag) = deriv_ids.lookup(id)?;
                    table.insert((eq, symbol, lag), acc);
                }
            }
        }
        debug!("Block {}: chain rule over {} recursive equations", b + 1, recursive.len());
    }
    Ok(table)
}

/// `direct + sum_q d node / d v_q * d v_q / d id` over the recursive variables `v_q`.
fn compose(
    diff: &mut Differentiator,
    registry: &mut Registry,
    node: NodeId,
    direct: NodeId,
    recursive: &[(DerivId, NodeId)],
    total: &[HashMap<DerivId, NodeId>],
    id: DerivId,
) -> Result<NodeId> {
    let mut acc = direct;
    for (q, &(var_id, _)) in recursive.iter().enumerate() {
        let through = diff.derivative(registry, node, var_id)?;
        if registry.is_zero(through) {
            continue;
        }
        let inner = total[q].get(&id).copied().unwrap_or(registry.zero());
        let term = registry.mul(through, inner);
        acc = registry.add(acc, term);
    }
    Ok(acc)
}
