//! evaluator
//! Numerical evaluation of the dynamic model through a common interface,
//! whichever form (expression graph, instruction tape, compiled library)
//! backs it.

pub mod graph;
pub mod library;
pub mod tape;

pub use graph::GraphEvaluator;
pub use library::LibraryEvaluator;
pub use tape::TapeEvaluator;

use crate::error::{ModelError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Argument and output dimensions shared by every evaluator of one model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatorShape {
    pub equations: usize,
    /// Length of `y`, one entry per `(endogenous, lag)` pair.
    pub y_len: usize,
    pub endo_nbr: usize,
    /// Columns of `x`: exogenous then deterministic exogenous.
    pub exo_cols: usize,
    pub param_nbr: usize,
    pub jacobian_cols: usize,
    pub nnz_g2: usize,
    pub nnz_g3: usize,
    pub max_lag: i32,
    pub exo_lag: i32,
    pub exo_lead: i32,
    /// Endogenous type-specific id of each `y` entry.
    pub y_index: Vec<usize>,
}

impl EvaluatorShape {
    pub fn g1_len(&self) -> usize { self.equations * self.jacobian_cols }

    pub fn validate(&self, inputs: &EvalInputs) -> Result<()> {
        if inputs.y.len() != self.y_len {
            return Err(ModelError::size("y", self.y_len, inputs.y.len()));
        }
        if inputs.x.cols() != self.exo_cols {
            return Err(ModelError::size("x columns", self.exo_cols, inputs.x.cols()));
        }
        if inputs.params.len() != self.param_nbr {
            return Err(ModelError::size("params", self.param_nbr, inputs.params.len()));
        }
        if inputs.steady_state.len() != self.endo_nbr {
            return Err(ModelError::size("steady_state", self.endo_nbr, inputs.steady_state.len()));
        }
        if self.exo_cols > 0 {
            let needed = inputs.it + self.exo_lead.max(0) as usize + 1;
            if (inputs.it as i64) < self.exo_lag as i64 || inputs.x.rows() < needed {
                return Err(ModelError::size(format!("x rows around period {}", inputs.it), needed, inputs.x.rows()));
            }
        }
        Ok(())
    }

    /// Sizes and zeroes the requested output buffers.
    pub fn prepare(&self, outputs: &mut EvalOutputs) {
        let reset = |buf: &mut Vec<f64>, len: usize| {
            buf.clear();
            buf.resize(len, 0.0);
        };
        reset(&mut outputs.residual, self.equations);
        if let Some(g1) = outputs.g1.as_mut() {
            reset(g1, self.g1_len());
        }
        if let Some(g2) = outputs.g2.as_mut() {
            reset(g2, 3 * self.nnz_g2);
        }
        if let Some(g3) = outputs.g3.as_mut() {
            reset(g3, 3 * self.nnz_g3);
        }
    }

    /// `y` built from steady-state values, one per `(endogenous, lag)` pair.
    pub fn steady_y(&self, steady_state: &[f64]) -> Result<Vec<f64>> {
        if steady_state.len() != self.endo_nbr {
            return Err(ModelError::size("steady_state", self.endo_nbr, steady_state.len()));
        }
        Ok(self.y_index.iter().map(|&i| steady_state[i]).collect())
    }
}

/// Column-major `rows × cols` matrix of exogenous values, one row per period.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExogenousMatrix {
    data: Vec<f64>,
    rows: usize,
    cols: usize,
}

impl ExogenousMatrix {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(ModelError::size("exogenous matrix", rows * cols, data.len()));
        }
        Ok(Self { data, rows, cols })
    }

    pub fn zeros(rows: usize, cols: usize) -> Self { Self { data: vec![0.0; rows * cols], rows, cols } }

    pub fn rows(&self) -> usize { self.rows }
    pub fn cols(&self) -> usize { self.cols }
    pub fn as_slice(&self) -> &[f64] { &self.data }

    #[inline(always)]
    pub fn get(&self, row: usize, col: usize) -> f64 { self.data[row + col * self.rows] }

    pub fn set(&mut self, row: usize, col: usize, value: f64) { self.data[row + col * self.rows] = value; }
}

#[derive(Debug, Clone, Copy)]
pub struct EvalInputs<'a> {
    pub y: &'a [f64],
    pub x: &'a ExogenousMatrix,
    pub params: &'a [f64],
    pub steady_state: &'a [f64],
    /// Row of `x` holding the current period.
    pub it: usize,
}

/// Output buffers; `None` means the output is not requested.
/// `g1` is column-major; `g2` and `g3` hold `nnz` 1-based rows, then
/// `nnz` 1-based columns, then `nnz` values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalOutputs {
    pub residual: Vec<f64>,
    pub g1: Option<Vec<f64>>,
    pub g2: Option<Vec<f64>>,
    pub g3: Option<Vec<f64>>,
}

impl EvalOutputs {
    /// Requests outputs up to derivative `order` (0 = residuals only).
    pub fn with_order(order: usize) -> Self {
        Self {
            residual: Vec::new(),
            g1: (order >= 1).then(Vec::new),
            g2: (order >= 2).then(Vec::new),
            g3: (order >= 3).then(Vec::new),
        }
    }

    /// Bit `k` is set when output `k` (residual, g1, g2, g3) is requested.
    pub fn mask(&self) -> u8 {
        1 | (self.g1.is_some() as u8) << 1 | (self.g2.is_some() as u8) << 2 | (self.g3.is_some() as u8) << 3
    }

    pub fn jacobian(&self, shape: &EvaluatorShape, row: usize, col: usize) -> Option<f64> {
        self.g1.as_ref().map(|g1| g1[row + col * shape.equations])
    }

    /// `(row, col, value)` triplets of `g2` (`order` 2) or `g3` (`order` 3), 0-based.
    pub fn triplets(&self, order: u8) -> Vec<(usize, usize, f64)> {
        let Some(buf) = (if order == 2 { self.g2.as_ref() } else { self.g3.as_ref() }) else { return Vec::new() };
        let n = buf.len() / 3;
        (0..n).map(|k| (buf[k] as usize - 1, buf[k + n] as usize - 1, buf[k + 2 * n])).collect()
    }
}

pub trait Evaluator: Send + Sync {
    fn shape(&self) -> &EvaluatorShape;

    fn evaluate(&self, inputs: &EvalInputs, outputs: &mut EvalOutputs) -> Result<()>;

    /// Evaluates with every endogenous variable at its steady state, the
    /// exogenous variables at zero and the current period at the model's maximum lag.
    fn evaluate_steady(&self, params: &[f64], steady_state: &[f64], outputs: &mut EvalOutputs) -> Result<()> {
        let shape = self.shape();
        let y = shape.steady_y(steady_state)?;
        let it = shape.max_lag.max(0) as usize;
        let x = ExogenousMatrix::zeros(it + shape.exo_lead.max(0) as usize + 1, shape.exo_cols);
        let inputs = EvalInputs { y: &y, x: &x, params, steady_state, it };
        self.evaluate(&inputs, outputs)
    }

    /// Evaluates one `y` per period in parallel, period `k` reading row `first_it + k` of `x`.
    fn evaluate_periods(
        &self,
        ys: &[Vec<f64>],
        x: &ExogenousMatrix,
        params: &[f64],
        steady_state: &[f64],
        first_it: usize,
        requested: &EvalOutputs,
    ) -> Result<Vec<EvalOutputs>> {
        ys.par_iter()
            .enumerate()
            .map(|(k, y)| {
                let mut out = requested.clone();
                let inputs = EvalInputs { y, x, params, steady_state, it: first_it + k };
                self.evaluate(&inputs, &mut out)?;
                Ok(out)
            })
            .collect()
    }
}
