//! tape.rs
//! Evaluator backed by an instruction tape, with per-block solver entry points.

use super::{EvalInputs, EvalOutputs, Evaluator, EvaluatorShape};
use crate::codegen::tape::Tape;
use crate::error::{ModelError, Result};
use crate::store::ExternalFunction;
use crate::vm::{Engine, Environment, Workspace};
use log::debug;
use std::path::Path;

pub struct TapeEvaluator {
    tape: Tape,
    shape: EvaluatorShape,
    externals: Vec<ExternalFunction>,
}

/// Result of one block solver call.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockOutputs {
    /// `y` with the block's recursive variables overwritten.
    pub y: Vec<f64>,
    pub residual: Vec<f64>,
    /// Column-major `feedback_size × jacobian_cols`; column `(lag + endo_lag) * feedback_size + j`
    /// is feedback variable `j` at `lag`, `endo_lag` being the block's largest own-variable lag.
    pub jacobian: Vec<f64>,
    pub feedback_size: usize,
    pub jacobian_cols: usize,
}

impl TapeEvaluator {
    pub fn new(tape: Tape, shape: EvaluatorShape, externals: Vec<ExternalFunction>) -> Result<Self> {
        Engine::validate(&tape, &shape, &externals)?;
        debug!("Loaded tape: {} instructions, {} routines", tape.len(), tape.routines.len());
        Ok(Self { tape, shape, externals })
    }

    /// Reads a `<base>_dynamic.cod` file.
    pub fn load(path: &Path, shape: EvaluatorShape, externals: Vec<ExternalFunction>) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| ModelError::io(path, e))?;
        Self::new(Tape::from_bytes(&bytes)?, shape, externals)
    }

    pub fn tape(&self) -> &Tape { &self.tape }

    pub fn block_count(&self) -> usize { self.tape.routines.len().saturating_sub(1) }

    /// Evaluates the recursive part of `block`, then its feedback residuals and Jacobian.
    pub fn evaluate_block(&self, block: usize, inputs: &EvalInputs) -> Result<BlockOutputs> {
        if block >= self.block_count() {
            return Err(ModelError::UnknownBlock { block });
        }
        self.shape.validate(inputs)?;
        let routine = self.tape.routine(block + 1)?;
        let env = self.environment(inputs);
        let mut ws = Workspace::new();
        ws.prepare(routine, inputs.y);
        Engine::run(&self.tape, block + 1, &env, &mut ws, &self.shape, None, 0b111)?;
        Ok(BlockOutputs {
            y: ws.y,
            residual: ws.block_residual,
            jacobian: ws.block_jacobian,
            feedback_size: routine.feedback_size as usize,
            jacobian_cols: routine.jacobian_cols as usize,
        })
    }

    fn environment<'a>(&'a self, inputs: &EvalInputs<'a>) -> Environment<'a> {
        Environment {
            x: inputs.x,
            params: inputs.params,
            steady_state: inputs.steady_state,
            it: inputs.it,
            externals: &self.externals,
        }
    }
}

impl Evaluator for TapeEvaluator {
    fn shape(&self) -> &EvaluatorShape { &self.shape }

    fn evaluate(&self, inputs: &EvalInputs, outputs: &mut EvalOutputs) -> Result<()> {
        self.shape.validate(inputs)?;
        self.shape.prepare(outputs);
        let env = self.environment(inputs);
        let mut ws = Workspace::new();
        ws.prepare(self.tape.routine(0)?, inputs.y);
        let mask = outputs.mask();
        Engine::run(&self.tape, 0, &env, &mut ws, &self.shape, Some(outputs), mask)
    }
}
