//! workspace.rs
//! Scratch memory of one VM call: operand stack, temporaries and block buffers.

use crate::codegen::tape::TapeRoutine;
use crate::error::{ModelError, Result};

#[derive(Debug, Clone, Default)]
pub struct Workspace {
    stack: Vec<f64>,
    pub(crate) args: Vec<f64>,
    pub temps: Vec<f64>,
    /// Working copy of `y`; block solvers write their recursive variables here.
    pub y: Vec<f64>,
    pub block_residual: Vec<f64>,
    /// Column-major `feedback_size × jacobian_cols`.
    pub block_jacobian: Vec<f64>,
}

impl Workspace {
    pub fn new() -> Self { Self::default() }

    /// Resets the buffers for a call of `routine` at point `y`.
    pub fn prepare(&mut self, routine: &TapeRoutine, y: &[f64]) {
        self.stack.clear();
        self.temps.clear();
        self.temps.resize(routine.temp_count as usize, f64::NAN);
        self.y.clear();
        self.y.extend_from_slice(y);
        let fb = routine.feedback_size as usize;
        self.block_residual.clear();
        self.block_residual.resize(fb, 0.0);
        self.block_jacobian.clear();
        self.block_jacobian.resize(fb * routine.jacobian_cols as usize, 0.0);
    }

    #[inline(always)]
    pub fn push(&mut self, v: f64) { self.stack.push(v); }

    #[inline(always)]
    pub fn pop(&mut self) -> Result<f64> {
        self.stack.pop().ok_or_else(|| ModelError::CorruptTape { msg: "stack underflow".into() })
    }

    /// Moves the top `n` values into `args`, first argument first.
    pub fn pop_args(&mut self, n: usize) -> Result<()> {
        if self.stack.len() < n {
            return Err(ModelError::CorruptTape { msg: "stack underflow".into() });
        }
        let at = self.stack.len() - n;
        self.args.clear();
        self.args.extend(self.stack.drain(at..));
        Ok(())
    }

    pub fn depth(&self) -> usize { self.stack.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_sizes_buffers() {
        let mut ws = Workspace::new();
        ws.push(1.0);
        let routine = TapeRoutine { start: 0, end: 1, temp_count: 3, feedback_size: 2, jacobian_cols: 4 };
        ws.prepare(&routine, &[1.0, 2.0]);
        assert_eq!(ws.depth(), 0);
        assert_eq!(ws.temps.len(), 3);
        assert!(ws.temps[0].is_nan());
        assert_eq!(ws.block_jacobian.len(), 8);
        assert_eq!(ws.y, vec![1.0, 2.0]);
    }

    #[test]
    fn test_stack_underflow_is_an_error() {
        let mut ws = Workspace::new();
        assert!(ws.pop().is_err());
        ws.push(1.0);
        ws.push(2.0);
        ws.pop_args(2).unwrap();
        assert_eq!(ws.args, vec![1.0, 2.0]);
        assert!(ws.pop_args(1).is_err());
    }
}
