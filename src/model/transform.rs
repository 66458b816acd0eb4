//! transform.rs
//! Equation-rewriting passes. Each of them invalidates the derivation ids.

use super::symbols::AuxKind;
use super::DynamicModel;
use crate::error::Result;
use crate::store::{NodeId, SymbolId, SymbolType};
use log::info;
use std::collections::{BTreeSet, HashMap};

impl DynamicModel {
    fn occurrences(&self) -> BTreeSet<(SymbolId, i32)> {
        self.registry.variables(self.equations.iter().map(|e| e.residual))
    }

    fn rewrite(&mut self, replacements: &HashMap<NodeId, NodeId>) {
        let mut memo = HashMap::new();
        for i in 0..self.equations.len() {
            let eq = self.equations[i];
            let lhs = self.registry.substitute(eq.lhs, replacements, &mut memo);
            let rhs = self.registry.substitute(eq.rhs, replacements, &mut memo);
            let residual = self.registry.sub(lhs, rhs);
            self.equations[i] = super::Equation { lhs, rhs, residual };
        }
        self.deriv_ids.clear();
    }

    /// Replaces `x(±k)`, `k >= 2`, by a chain of auxiliary endogenous
    /// variables `a_1 = x(±1)`, `a_j = a_{j-1}(±1)`, so that `x(±k) = a_{k-1}(±1)`.
    fn substitute_endo_beyond_one(&mut self, direction: i32) -> Result<usize> {
        let kind = if direction > 0 { AuxKind::EndoLead } else { AuxKind::EndoLag };
        let mut chains: HashMap<(SymbolId, i32), SymbolId> = HashMap::new();
        let mut replacements = HashMap::new();
        let mut new_equations = Vec::new();
        for (symbol, lag) in self.occurrences() {
            if self.symbols.symbol_type(symbol)? != SymbolType::Endogenous || lag * direction < 2 {
                continue;
            }
            let depth = lag.abs() - 1;
            for j in 1..=depth {
                if chains.contains_key(&(symbol, j)) {
                    continue;
                }
                let previous = if j == 1 { symbol } else { chains[&(symbol, j - 1)] };
                let rhs = self.registry.variable(previous, direction);
                let definition = self.registry.variable(symbol, 0);
                let aux = self.symbols.add_aux(kind, symbol, direction * (j + 1), Some(definition))?;
                chains.insert((symbol, j), aux);
                let lhs = self.registry.variable(aux, 0);
                new_equations.push((lhs, rhs));
            }
            let node = self.registry.variable(symbol, lag);
            let replacement = self.registry.variable(chains[&(symbol, depth)], direction);
            replacements.insert(node, replacement);
        }
        self.rewrite(&replacements);
        let created = new_equations.len();
        for (lhs, rhs) in new_equations {
            self.add_equation(lhs, rhs);
        }
        Ok(created)
    }

    pub fn substitute_endo_lead_greater_than_two(&mut self) -> Result<usize> {
        let n = self.substitute_endo_beyond_one(1)?;
        info!("Substituted endogenous leads beyond one: {} auxiliary variables", n);
        Ok(n)
    }

    pub fn substitute_endo_lag_greater_than_two(&mut self) -> Result<usize> {
        let n = self.substitute_endo_beyond_one(-1)?;
        info!("Substituted endogenous lags beyond one: {} auxiliary variables", n);
        Ok(n)
    }

    /// Replaces exogenous `e(±k)` by `a(±k)` with an auxiliary endogenous copy `a = e`.
    fn substitute_exo(&mut self, leads: bool) -> Result<usize> {
        let kind = if leads { AuxKind::ExoLead } else { AuxKind::ExoLag };
        let mut copies: HashMap<SymbolId, SymbolId> = HashMap::new();
        let mut replacements = HashMap::new();
        let mut new_equations = Vec::new();
        for (symbol, lag) in self.occurrences() {
            let ty = self.symbols.symbol_type(symbol)?;
            let exogenous = matches!(ty, SymbolType::Exogenous | SymbolType::ExogenousDet);
            if !exogenous || lag == 0 || (lag > 0) != leads {
                continue;
            }
            let aux = match copies.get(&symbol) {
                Some(&aux) => aux,
                None => {
                    let original = self.registry.variable(symbol, 0);
                    let aux = self.symbols.add_aux(kind, symbol, lag.signum(), Some(original))?;
                    let lhs = self.registry.variable(aux, 0);
                    new_equations.push((lhs, original));
                    copies.insert(symbol, aux);
                    aux
                }
            };
            let node = self.registry.variable(symbol, lag);
            replacements.insert(node, self.registry.variable(aux, lag));
        }
        self.rewrite(&replacements);
        let created = new_equations.len();
        for (lhs, rhs) in new_equations {
            self.add_equation(lhs, rhs);
        }
        Ok(created)
    }

    pub fn substitute_exo_lead(&mut self) -> Result<usize> {
        let n = self.substitute_exo(true)?;
        info!("Substituted exogenous leads: {} auxiliary variables", n);
        Ok(n)
    }

    pub fn substitute_exo_lag(&mut self) -> Result<usize> {
        let n = self.substitute_exo(false)?;
        info!("Substituted exogenous lags: {} auxiliary variables", n);
        Ok(n)
    }

    /// Shifts every occurrence of a predetermined variable one period back.
    /// Each variable is shifted once; repeated calls only shift variables
    /// marked predetermined since the previous call.
    pub fn transform_predetermined_variables(&mut self) -> Result<usize> {
        let pending = self.symbols.take_unshifted_predetermined();
        if pending.is_empty() {
            return Ok(0);
        }
        let mut replacements = HashMap::new();
        for (symbol, lag) in self.occurrences() {
            if pending.contains(&symbol) {
                let node = self.registry.variable(symbol, lag);
                replacements.insert(node, self.registry.variable(symbol, lag - 1));
            }
        }
        self.rewrite(&replacements);
        info!("Shifted {} predetermined variables", pending.len());
        Ok(pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EvalContext;

    fn model_with_lead_three() -> DynamicModel {
        let mut m = DynamicModel::new();
        m.declare("x", SymbolType::Endogenous).unwrap();
        let x = m.var("x", 0).unwrap();
        let x3 = m.var("x", 3).unwrap();
        let half = m.registry.constant(0.5);
        let rhs = m.registry.mul(half, x3);
        m.add_equation(x, rhs);
        m
    }

    #[test]
    fn test_endo_lead_chain() {
        let mut m = model_with_lead_three();
        m.compute_deriv_ids().unwrap();
        assert_eq!(m.substitute_endo_lead_greater_than_two().unwrap(), 2);
        assert!(m.deriv_ids.is_empty());
        assert_eq!(m.equation_count(), 3);
        let max_lead = m.occurrences().iter().map(|&(_, l)| l).max().unwrap();
        assert_eq!(max_lead, 1);
        assert_eq!(m.symbols.endo_nbr(), 3);
    }

    #[test]
    fn test_fill_eval_context_uses_aux_definitions() {
        let mut m = model_with_lead_three();
        m.substitute_endo_lead_greater_than_two().unwrap();
        let mut ctx = EvalContext::new();
        ctx.set_by_name(&m.symbols, "x", 2.0).unwrap();
        let filled = m.fill_eval_context(&ctx).unwrap();
        for aux in m.symbols.aux_variables() {
            assert_eq!(filled.get(aux.symbol), Some(2.0));
        }
    }

    #[test]
    fn test_exo_lag_copy_and_predetermined_shift() {
        let mut m = DynamicModel::new();
        m.declare("k", SymbolType::Endogenous).unwrap();
        m.declare("e", SymbolType::Exogenous).unwrap();
        let k = m.var("k", 0).unwrap();
        let e_lag = m.var("e", -1).unwrap();
        m.add_equation(k, e_lag);
        assert_eq!(m.substitute_exo_lag().unwrap(), 1);
        let e = m.symbols.id("e").unwrap();
        assert!(m.occurrences().iter().all(|&(s, l)| s != e || l == 0));

        let ksym = m.symbols.id("k").unwrap();
        m.symbols.mark_predetermined(ksym).unwrap();
        assert_eq!(m.transform_predetermined_variables().unwrap(), 1);
        assert!(m.occurrences().contains(&(ksym, -1)));
        assert!(!m.occurrences().contains(&(ksym, 0)));

        // A second call leaves the already shifted variable alone
        assert_eq!(m.transform_predetermined_variables().unwrap(), 0);
        assert!(m.occurrences().contains(&(ksym, -1)));
        assert!(!m.occurrences().contains(&(ksym, -2)));
    }
}
