//! context.rs
//! Numerical values of symbols used for cutoff evaluation and rank checks.

use super::symbols::SymbolTable;
use crate::error::{ModelError, Result};
use crate::store::{LeafValues, SymbolId};
use std::collections::HashMap;

/// One value per symbol; lags are ignored, so a context describes a steady state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalContext {
    values: HashMap<SymbolId, f64>,
}

impl EvalContext {
    pub fn new() -> Self { Self::default() }

    pub fn set(&mut self, symbol: SymbolId, value: f64) { self.values.insert(symbol, value); }
    pub fn get(&self, symbol: SymbolId) -> Option<f64> { self.values.get(&symbol).copied() }
    pub fn len(&self) -> usize { self.values.len() }
    pub fn is_empty(&self) -> bool { self.values.is_empty() }

    pub fn set_by_name(&mut self, symbols: &SymbolTable, name: &str, value: f64) -> Result<()> {
        self.set(symbols.id(name)?, value);
        Ok(())
    }

    pub fn leaves<'a>(&'a self, symbols: &'a SymbolTable) -> ContextValues<'a> {
        ContextValues { context: self, symbols }
    }
}

pub struct ContextValues<'a> {
    context: &'a EvalContext,
    symbols: &'a SymbolTable,
}

impl ContextValues<'_> {
    fn lookup(&self, symbol: SymbolId) -> Result<f64> {
        self.context.get(symbol).ok_or_else(|| ModelError::MissingValue {
            name: self.symbols.name(symbol).unwrap_or("?").to_string(),
        })
    }
}

impl LeafValues for ContextValues<'_> {
    fn variable(&self, symbol: SymbolId, _lag: i32) -> Result<f64> { self.lookup(symbol) }
    fn parameter(&self, symbol: SymbolId) -> Result<f64> { self.lookup(symbol) }
    fn steady_state(&self, symbol: SymbolId) -> Result<f64> { self.lookup(symbol) }
}
