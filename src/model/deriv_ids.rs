//! deriv_ids.rs
//! Bijection between `(symbol, lag)` pairs and derivation ids, plus the
//! dynamic Jacobian column layout built on top of it.

use super::symbols::SymbolTable;
use crate::error::{ModelError, Result};
use crate::store::{SymbolId, SymbolType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DerivId(pub u32);

impl DerivId {
    #[inline(always)]
    pub fn index(&self) -> usize { self.0 as usize }
}

/// Largest lag and lead (both as non-negative magnitudes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagLead {
    pub lag: i32,
    pub lead: i32,
}

impl LagLead {
    pub fn extend(&mut self, lag: i32) {
        if lag < 0 {
            self.lag = self.lag.max(-lag);
        } else {
            self.lead = self.lead.max(lag);
        }
    }

    pub fn merge(&mut self, other: LagLead) {
        self.lag = self.lag.max(other.lag);
        self.lead = self.lead.max(other.lead);
    }
}

#[derive(Debug, Clone, Default)]
pub struct DerivIdTable {
    table: BTreeMap<(SymbolId, i32), DerivId>,
    inverse: Vec<(SymbolId, i32, SymbolType)>,
    pub endo: LagLead,
    pub exo: LagLead,
    pub exo_det: LagLead,
    frozen: bool,
    dyn_cols: HashMap<DerivId, usize>,
    dyn_cols_nbr: usize,
}

impl DerivIdTable {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.inverse.len() }
    pub fn is_empty(&self) -> bool { self.inverse.is_empty() }
    pub fn freeze(&mut self) { self.frozen = true; }
    pub fn is_frozen(&self) -> bool { self.frozen }

    /// Forgets every id. Called by rewriting passes.
    pub fn clear(&mut self) { *self = Self::default(); }

    /// Returns the id of `(symbol, lag)`, allocating it when new. Parameters are always lag 0.
    pub fn allocate(&mut self, symbols: &SymbolTable, symbol: SymbolId, lag: i32) -> Result<DerivId> {
        let ty = symbols.symbol_type(symbol)?;
        let lag = if ty == SymbolType::Parameter { 0 } else { lag };
        if let Some(&id) = self.table.get(&(symbol, lag)) {
            return Ok(id);
        }
        if self.frozen {
            return Err(ModelError::DerivIdsFrozen { symbol: symbols.name(symbol)?.to_string(), lag });
        }
        let id = DerivId(self.inverse.len() as u32);
        self.table.insert((symbol, lag), id);
        self.inverse.push((symbol, lag, ty));
        match ty {
            SymbolType::Endogenous => self.endo.extend(lag),
            SymbolType::Exogenous => self.exo.extend(lag),
            SymbolType::ExogenousDet => self.exo_det.extend(lag),
            SymbolType::Parameter => {}
        }
        Ok(id)
    }

    pub fn get(&self, symbol: SymbolId, lag: i32) -> Option<DerivId> {
        self.table.get(&(symbol, lag)).copied()
    }

    /// Like `get`, failing with the symbol's name when the pair has no id.
    pub fn require(&self, symbols: &SymbolTable, symbol: SymbolId, lag: i32) -> Result<DerivId> {
        match self.get(symbol, lag) {
            Some(id) => Ok(id),
            None => Err(ModelError::MissingDerivId { name: symbols.name(symbol)?.to_string(), lag }),
        }
    }

    pub fn lookup(&self, id: DerivId) -> Result<(SymbolId, i32)> {
        self.inverse.get(id.index()).map(|&(s, l, _)| (s, l)).ok_or(ModelError::UnknownDerivId { id: id.0 })
    }

    pub fn type_of(&self, id: DerivId) -> Result<SymbolType> {
        self.inverse.get(id.index()).map(|e| e.2).ok_or(ModelError::UnknownDerivId { id: id.0 })
    }

    pub fn ids_of_type(&self, ty: SymbolType) -> Vec<DerivId> {
        (0..self.inverse.len() as u32).map(DerivId).filter(|id| self.inverse[id.index()].2 == ty).collect()
    }

    pub fn max_lag(&self) -> i32 { self.endo.lag.max(self.exo.lag).max(self.exo_det.lag) }
    pub fn max_lead(&self) -> i32 { self.endo.lead.max(self.exo.lead).max(self.exo_det.lead) }

    /// Endogenous columns ordered lag-major then by declaration; exogenous and
    /// deterministic exogenous columns follow when `jacobian_exo` is set.
    pub fn compute_dyn_jacobian_cols(&mut self, symbols: &SymbolTable, jacobian_exo: bool) -> Result<()> {
        self.dyn_cols.clear();
        let mut endo = Vec::new();
        let mut exo = Vec::new();
        for (i, &(symbol, lag, ty)) in self.inverse.iter().enumerate() {
            let id = DerivId(i as u32);
            match ty {
                SymbolType::Endogenous => endo.push((lag, symbols.type_specific_id(symbol)?, id)),
                SymbolType::Exogenous | SymbolType::ExogenousDet => exo.push((symbol, lag, ty, id)),
                SymbolType::Parameter => {}
            }
        }
        endo.sort_unstable();
        for (col, &(_, _, id)) in endo.iter().enumerate() {
            self.dyn_cols.insert(id, col);
        }
        let endo_cols = endo.len();
        self.dyn_cols_nbr = endo_cols;
        if jacobian_exo {
            for (symbol, lag, ty, id) in exo {
                if lag != 0 {
                    return Err(ModelError::ExogenousLag { name: symbols.name(symbol)?.to_string(), lag });
                }
                let offset = if ty == SymbolType::Exogenous { endo_cols } else { endo_cols + symbols.exo_nbr() };
                self.dyn_cols.insert(id, offset + symbols.type_specific_id(symbol)?);
            }
            self.dyn_cols_nbr += symbols.exo_nbr() + symbols.exo_det_nbr();
        }
        Ok(())
    }

    pub fn dyn_jacobian_col(&self, id: DerivId) -> Result<usize> {
        self.dyn_cols.get(&id).copied().ok_or(ModelError::UnknownDerivId { id: id.0 })
    }

    pub fn dyn_jacobian_cols_nbr(&self) -> usize { self.dyn_cols_nbr }

    /// Number of `(endogenous, lag)` pairs, i.e. the length of the `y` vector.
    pub fn endo_dynamic_nbr(&self) -> usize {
        self.inverse.iter().filter(|e| e.2 == SymbolType::Endogenous).count()
    }

    /// `endo_nbr × (max_lag + max_lead + 1)` matrix of 1-based `y` positions, 0 when absent.
    pub fn lead_lag_incidence(&self, symbols: &SymbolTable) -> Result<Vec<Vec<usize>>> {
        let width = (self.endo.lag + self.endo.lead + 1) as usize;
        let mut matrix = vec![vec![0; width]; symbols.endo_nbr()];
        for (&(symbol, lag), &id) in &self.table {
            if self.inverse[id.index()].2 != SymbolType::Endogenous {
                continue;
            }
            let row = symbols.type_specific_id(symbol)?;
            matrix[row][(lag + self.endo.lag) as usize] = self.dyn_jacobian_col(id)? + 1;
        }
        Ok(matrix)
    }
}
