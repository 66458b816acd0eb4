//! resolver.rs
//! The capability the differentiator needs from a model: mapping leaves to
//! derivation ids and back.

use super::deriv_ids::{DerivId, DerivIdTable};
use super::symbols::SymbolTable;
use crate::error::{ModelError, Result};
use crate::store::{SymbolId, SymbolType};

pub trait DerivIdResolver {
    fn deriv_id(&self, symbol: SymbolId, lag: i32) -> Result<DerivId>;
    fn type_of(&self, id: DerivId) -> Result<SymbolType>;
    fn lag_of(&self, id: DerivId) -> Result<i32>;
    fn symbol_of(&self, id: DerivId) -> Result<SymbolId>;
}

/// Resolves against the dynamic model's `(symbol, lag)` table.
pub struct DynamicResolver<'a> {
    symbols: &'a SymbolTable,
    table: &'a DerivIdTable,
}

impl<'a> DynamicResolver<'a> {
    pub fn new(symbols: &'a SymbolTable, table: &'a DerivIdTable) -> Self { Self { symbols, table } }
}

impl DerivIdResolver for DynamicResolver<'_> {
    fn deriv_id(&self, symbol: SymbolId, lag: i32) -> Result<DerivId> {
        let lag = if self.symbols.symbol_type(symbol)? == SymbolType::Parameter { 0 } else { lag };
        self.table.get(symbol, lag).ok_or_else(|| ModelError::UnknownSymbol {
            name: format!("{}({})", self.symbols.name(symbol).unwrap_or("?"), lag),
        })
    }
    fn type_of(&self, id: DerivId) -> Result<SymbolType> { self.table.type_of(id) }
    fn lag_of(&self, id: DerivId) -> Result<i32> { Ok(self.table.lookup(id)?.1) }
    fn symbol_of(&self, id: DerivId) -> Result<SymbolId> { Ok(self.table.lookup(id)?.0) }
}

/// Static view of the same symbols: lags are ignored and ids are laid out
/// endogenous, exogenous, deterministic exogenous, parameters.
pub struct StaticResolver<'a> {
    symbols: &'a SymbolTable,
}

impl<'a> StaticResolver<'a> {
    pub fn new(symbols: &'a SymbolTable) -> Self { Self { symbols } }

    fn class_offset(&self, ty: SymbolType) -> usize {
        match ty {
            SymbolType::Endogenous => 0,
            SymbolType::Exogenous => self.symbols.endo_nbr(),
            SymbolType::ExogenousDet => self.symbols.endo_nbr() + self.symbols.exo_nbr(),
            SymbolType::Parameter => self.symbols.endo_nbr() + self.symbols.exo_nbr() + self.symbols.exo_det_nbr(),
        }
    }

    fn split(&self, id: DerivId) -> Result<(SymbolType, usize)> {
        let i = id.index();
        for ty in [SymbolType::Parameter, SymbolType::ExogenousDet, SymbolType::Exogenous, SymbolType::Endogenous] {
            let offset = self.class_offset(ty);
            if i >= offset && i - offset < self.symbols.of_type(ty).len() {
                return Ok((ty, i - offset));
            }
        }
        Err(ModelError::UnknownDerivId { id: id.0 })
    }
}

impl DerivIdResolver for StaticResolver<'_> {
    fn deriv_id(&self, symbol: SymbolId, _lag: i32) -> Result<DerivId> {
        let ty = self.symbols.symbol_type(symbol)?;
        Ok(DerivId((self.class_offset(ty) + self.symbols.type_specific_id(symbol)?) as u32))
    }
    fn type_of(&self, id: DerivId) -> Result<SymbolType> { Ok(self.split(id)?.0) }
    fn lag_of(&self, id: DerivId) -> Result<i32> { self.split(id).map(|_| 0) }
    fn symbol_of(&self, id: DerivId) -> Result<SymbolId> {
        let (ty, tsid) = self.split(id)?;
        self.symbols.by_type_specific_id(ty, tsid)
    }
}
