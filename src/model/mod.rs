//! mod.rs
//! The dynamic model: symbols, equations over the shared expression store and
//! the derivation-id table built from them.

pub mod context;
pub mod deriv_ids;
pub mod resolver;
pub mod symbols;
pub mod transform;

pub use context::EvalContext;
pub use deriv_ids::{DerivId, DerivIdTable, LagLead};
pub use resolver::{DerivIdResolver, DynamicResolver, StaticResolver};
pub use symbols::{AuxKind, AuxVariable, SymbolTable};

use crate::error::{ModelError, Result};
use crate::store::{ExternalFunction, NodeEvaluator, NodeId, Registry, SymbolId, SymbolType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Equation {
    pub lhs: NodeId,
    pub rhs: NodeId,
    /// `lhs - rhs`
    pub residual: NodeId,
}

#[derive(Debug, Clone, Default)]
pub struct DynamicModel {
    pub registry: Registry,
    pub symbols: SymbolTable,
    pub equations: Vec<Equation>,
    pub deriv_ids: DerivIdTable,
}

impl DynamicModel {
    pub fn new() -> Self { Self::default() }

    pub fn declare(&mut self, name: &str, ty: SymbolType) -> Result<SymbolId> { self.symbols.add(name, ty) }

    /// Node for `name` at `lag`; parameters ignore the lag.
    pub fn var(&mut self, name: &str, lag: i32) -> Result<NodeId> {
        let symbol = self.symbols.id(name)?;
        Ok(match self.symbols.symbol_type(symbol)? {
            SymbolType::Parameter => self.registry.parameter(symbol),
            _ => self.registry.variable(symbol, lag),
        })
    }

    pub fn param(&mut self, name: &str) -> Result<NodeId> { self.var(name, 0) }

    pub fn steady_state(&mut self, name: &str) -> Result<NodeId> {
        let symbol = self.symbols.id(name)?;
        Ok(self.registry.steady_state(symbol))
    }

    pub fn register_external(&mut self, name: &str, nargs: usize, eval: fn(&[f64]) -> f64) -> u32 {
        self.registry.register_external(ExternalFunction { name: name.to_string(), nargs, eval })
    }

    pub fn add_equation(&mut self, lhs: NodeId, rhs: NodeId) -> usize {
        let residual = self.registry.sub(lhs, rhs);
        self.equations.push(Equation { lhs, rhs, residual });
        self.equations.len() - 1
    }

    pub fn equation(&self, eq: usize) -> Result<&Equation> {
        self.equations.get(eq).ok_or(ModelError::UnknownEquation { equation: eq })
    }

    pub fn equation_count(&self) -> usize { self.equations.len() }

    /// Rebuilds the derivation-id table from the current equations: variables
    /// in `(symbol, lag)` order first, then parameters.
    pub fn compute_deriv_ids(&mut self) -> Result<()> {
        self.deriv_ids.clear();
        let residuals: Vec<NodeId> = self.equations.iter().map(|e| e.residual).collect();
        for (symbol, lag) in self.registry.variables(residuals.iter().copied()) {
            self.deriv_ids.allocate(&self.symbols, symbol, lag)?;
        }
        for symbol in self.registry.parameters(residuals) {
            self.deriv_ids.allocate(&self.symbols, symbol, 0)?;
        }
        Ok(())
    }

    pub fn resolver(&self) -> DynamicResolver<'_> { DynamicResolver::new(&self.symbols, &self.deriv_ids) }

    /// Completes `context` with the values of auxiliary variables, computed from their definitions.
    pub fn fill_eval_context(&self, context: &EvalContext) -> Result<EvalContext> {
        let mut filled = context.clone();
        for aux in self.symbols.aux_variables() {
            let Some(definition) = aux.definition else { continue };
            let value = {
                let leaves = filled.leaves(&self.symbols);
                NodeEvaluator::new(&self.registry, &leaves).value(definition)?
            };
            filled.set(aux.symbol, value);
        }
        Ok(filled)
    }
}
