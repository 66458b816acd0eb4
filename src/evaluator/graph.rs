//! graph.rs
//! Evaluates the emission plan directly on the expression graph.

use super::{EvalInputs, EvalOutputs, Evaluator, EvaluatorShape};
use crate::codegen::plan::{EmissionPlan, Target};
use crate::error::{ModelError, Result};
use crate::model::{DerivIdTable, SymbolTable};
use crate::store::{LeafValues, NodeEvaluator, Registry, SymbolId, SymbolType};

pub struct GraphEvaluator {
    registry: Registry,
    symbols: SymbolTable,
    deriv_ids: DerivIdTable,
    plan: EmissionPlan,
}

struct InputLeaves<'a> {
    symbols: &'a SymbolTable,
    deriv_ids: &'a DerivIdTable,
    inputs: &'a EvalInputs<'a>,
}

impl LeafValues for InputLeaves<'_> {
    fn variable(&self, symbol: SymbolId, lag: i32) -> Result<f64> {
        let tsid = self.symbols.type_specific_id(symbol)?;
        let row = (self.inputs.it as i64 + lag as i64) as usize;
        Ok(match self.symbols.symbol_type(symbol)? {
            SymbolType::Endogenous => {
                let id = self.deriv_ids.get(symbol, lag).ok_or_else(|| ModelError::MissingValue {
                    name: format!("{}({})", self.symbols.name(symbol).unwrap_or("?"), lag),
                })?;
                self.inputs.y[self.deriv_ids.dyn_jacobian_col(id)?]
            }
            SymbolType::Exogenous => self.inputs.x.get(row, tsid),
            SymbolType::ExogenousDet => self.inputs.x.get(row, self.symbols.exo_nbr() + tsid),
            SymbolType::Parameter => self.inputs.params[tsid],
        })
    }

    fn parameter(&self, symbol: SymbolId) -> Result<f64> { Ok(self.inputs.params[self.symbols.type_specific_id(symbol)?]) }

    fn steady_state(&self, symbol: SymbolId) -> Result<f64> {
        Ok(self.inputs.steady_state[self.symbols.type_specific_id(symbol)?])
    }
}

impl GraphEvaluator {
    pub fn new(registry: Registry, symbols: SymbolTable, deriv_ids: DerivIdTable, plan: EmissionPlan) -> Self {
        Self { registry, symbols, deriv_ids, plan }
    }
}

fn store(shape: &EvaluatorShape, outputs: &mut EvalOutputs, target: Target, value: f64) {
    match target {
        Target::Residual { row } => outputs.residual[row] = value,
        Target::Jacobian { row, col } => {
            if let Some(g1) = outputs.g1.as_mut() {
                g1[row + col * shape.equations] = value;
            }
        }
        Target::Sparse { order, slot, row, col } => {
            let (buf, n) = if order == 2 { (outputs.g2.as_mut(), shape.nnz_g2) } else { (outputs.g3.as_mut(), shape.nnz_g3) };
            if let Some(buf) = buf {
                buf[slot] = (row + 1) as f64;
                buf[slot + n] = (col + 1) as f64;
                buf[slot + 2 * n] = value;
            }
        }
        _ => {}
    }
}

impl Evaluator for GraphEvaluator {
    fn shape(&self) -> &EvaluatorShape { &self.plan.shape }

    fn evaluate(&self, inputs: &EvalInputs, outputs: &mut EvalOutputs) -> Result<()> {
        let shape = &self.plan.shape;
        shape.validate(inputs)?;
        shape.prepare(outputs);
        let mask = outputs.mask();
        let leaves = InputLeaves { symbols: &self.symbols, deriv_ids: &self.deriv_ids, inputs };
        let mut evaluator = NodeEvaluator::new(&self.registry, &leaves);
        for section in &self.plan.model.sections {
            if section.output.mask() & mask == 0 {
                continue;
            }
            for a in &section.assignments {
                let value = evaluator.value(a.expr)?;
                store(shape, outputs, a.target, value);
            }
        }
        Ok(())
    }
}
