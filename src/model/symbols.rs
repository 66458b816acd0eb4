//! symbols.rs
//! Declared symbols, their classes and type-specific ids.

use crate::error::{ModelError, Result};
use crate::store::{NodeId, SymbolId, SymbolType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxKind {
    EndoLead,
    EndoLag,
    ExoLead,
    ExoLag,
}

/// Auxiliary endogenous variable introduced by a model transformation.
///
/// `definition` is the expression the variable equals at lag 0; it is used to
/// fill evaluation contexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuxVariable {
    pub symbol: SymbolId,
    pub kind: AuxKind,
    pub orig_symbol: SymbolId,
    pub orig_lag: i32,
    #[serde(skip)]
    pub definition: Option<NodeId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolTable {
    names: Vec<String>,
    types: Vec<SymbolType>,
    type_ids: Vec<usize>,
    by_name: HashMap<String, SymbolId>,
    by_type: [Vec<SymbolId>; 4],
    predetermined: BTreeSet<SymbolId>,
    /// Predetermined variables whose occurrences were already shifted back.
    shifted: BTreeSet<SymbolId>,
    aux: Vec<AuxVariable>,
}

fn slot(ty: SymbolType) -> usize {
    match ty {
        SymbolType::Endogenous => 0,
        SymbolType::Exogenous => 1,
        SymbolType::ExogenousDet => 2,
        SymbolType::Parameter => 3,
    }
}

impl SymbolTable {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, name: &str, ty: SymbolType) -> Result<SymbolId> {
        if self.by_name.contains_key(name) {
            return Err(ModelError::DuplicateSymbol { name: name.to_string() });
        }
        let id = SymbolId::new(self.names.len());
        let class = &mut self.by_type[slot(ty)];
        self.type_ids.push(class.len());
        class.push(id);
        self.names.push(name.to_string());
        self.types.push(ty);
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Declares an auxiliary endogenous variable named after its origin.
    pub fn add_aux(&mut self, kind: AuxKind, orig_symbol: SymbolId, orig_lag: i32, definition: Option<NodeId>) -> Result<SymbolId> {
        let prefix = match kind {
            AuxKind::EndoLead => "AUX_ENDO_LEAD",
            AuxKind::EndoLag => "AUX_ENDO_LAG",
            AuxKind::ExoLead => "AUX_EXO_LEAD",
            AuxKind::ExoLag => "AUX_EXO_LAG",
        };
        let name = format!("{}_{}_{}", prefix, orig_symbol.0, orig_lag.abs());
        let symbol = self.add(&name, SymbolType::Endogenous)?;
        self.aux.push(AuxVariable { symbol, kind, orig_symbol, orig_lag, definition });
        Ok(symbol)
    }

    pub fn len(&self) -> usize { self.names.len() }
    pub fn is_empty(&self) -> bool { self.names.is_empty() }

    pub fn id(&self, name: &str) -> Result<SymbolId> {
        self.by_name.get(name).copied().ok_or_else(|| ModelError::UnknownSymbol { name: name.to_string() })
    }

    fn check(&self, symbol: SymbolId) -> Result<usize> {
        if symbol.index() < self.names.len() {
            Ok(symbol.index())
        } else {
            Err(ModelError::UnknownSymbol { name: format!("#{}", symbol.0) })
        }
    }

    pub fn name(&self, symbol: SymbolId) -> Result<&str> {
        Ok(&self.names[self.check(symbol)?])
    }

    pub fn symbol_type(&self, symbol: SymbolId) -> Result<SymbolType> {
        Ok(self.types[self.check(symbol)?])
    }

    pub fn type_specific_id(&self, symbol: SymbolId) -> Result<usize> {
        Ok(self.type_ids[self.check(symbol)?])
    }

    /// Inverse of `type_specific_id`.
    pub fn by_type_specific_id(&self, ty: SymbolType, tsid: usize) -> Result<SymbolId> {
        self.by_type[slot(ty)]
            .get(tsid)
            .copied()
            .ok_or_else(|| ModelError::UnknownSymbol { name: format!("{:?} #{}", ty, tsid) })
    }

    pub fn of_type(&self, ty: SymbolType) -> &[SymbolId] { &self.by_type[slot(ty)] }
    pub fn endo_nbr(&self) -> usize { self.by_type[0].len() }
    pub fn exo_nbr(&self) -> usize { self.by_type[1].len() }
    pub fn exo_det_nbr(&self) -> usize { self.by_type[2].len() }
    pub fn param_nbr(&self) -> usize { self.by_type[3].len() }

    pub fn names_of_type(&self, ty: SymbolType) -> Vec<String> {
        self.of_type(ty).iter().map(|s| self.names[s.index()].clone()).collect()
    }

    pub fn mark_predetermined(&mut self, symbol: SymbolId) -> Result<()> {
        if self.symbol_type(symbol)? != SymbolType::Endogenous {
            return Err(ModelError::Config {
                msg: format!("{} is not endogenous and cannot be predetermined", self.names[symbol.index()]),
            });
        }
        self.predetermined.insert(symbol);
        Ok(())
    }

    pub fn is_predetermined(&self, symbol: SymbolId) -> bool { self.predetermined.contains(&symbol) }
    pub fn predetermined(&self) -> impl Iterator<Item = SymbolId> + '_ { self.predetermined.iter().copied() }

    /// Predetermined variables not yet shifted, now recorded as shifted.
    pub fn take_unshifted_predetermined(&mut self) -> Vec<SymbolId> {
        let pending: Vec<SymbolId> = self.predetermined.difference(&self.shifted).copied().collect();
        self.shifted.extend(pending.iter().copied());
        pending
    }
    pub fn aux_variables(&self) -> &[AuxVariable] { &self.aux }
}
