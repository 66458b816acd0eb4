//! engine.rs
//! Stack interpreter for instruction tapes.

use super::workspace::Workspace;
use crate::codegen::tape::{OpCode, Tape, TapeRoutine};
use crate::error::{ModelError, Result};
use crate::evaluator::{EvalOutputs, EvaluatorShape, ExogenousMatrix};
use crate::store::{BinaryOp, ExternalFunction, UnaryOp};

/// Read-only arguments of one call.
pub struct Environment<'a> {
    pub x: &'a ExogenousMatrix,
    pub params: &'a [f64],
    pub steady_state: &'a [f64],
    pub it: usize,
    pub externals: &'a [ExternalFunction],
}

pub struct Engine;

fn corrupt(pc: usize, msg: impl std::fmt::Display) -> ModelError {
    ModelError::CorruptTape { msg: format!("instruction {}: {}", pc, msg) }
}

impl Engine {
    /// Runs routine `index` of the tape. Bit `k` of `mask` selects output `k`
    /// of the routine; `outputs` receives the model routine's stores.
    pub fn run(
        tape: &Tape,
        index: usize,
        env: &Environment,
        ws: &mut Workspace,
        shape: &EvaluatorShape,
        mut outputs: Option<&mut EvalOutputs>,
        mask: u8,
    ) -> Result<()> {
        let routine = *tape.routine(index)?;
        let mut pc = routine.start as usize;
        while pc < routine.end as usize {
            let (a, b, c) = (tape.a[pc], tape.b[pc], tape.c[pc]);
            let op = OpCode::from_u8(tape.ops[pc]).ok_or_else(|| corrupt(pc, "unknown opcode"))?;
            pc += 1;
            match op {
                OpCode::PushConst => ws.push(tape.constants[a as usize]),
                OpCode::LoadEndo => ws.push(ws.y[a as usize]),
                OpCode::LoadExo => {
                    let row = (env.it as i64 + b as i32 as i64) as usize;
                    ws.push(env.x.get(row, a as usize));
                }
                OpCode::LoadParam => ws.push(env.params[a as usize]),
                OpCode::LoadSteady => ws.push(env.steady_state[a as usize]),
                OpCode::LoadTemp => ws.push(ws.temps[a as usize]),
                OpCode::Unary => {
                    let op = UnaryOp::from_u8(a as u8).ok_or_else(|| corrupt(pc - 1, "unknown unary op"))?;
                    let v = ws.pop()?;
                    ws.push(op.apply(v));
                }
                OpCode::Binary => {
                    let op = BinaryOp::from_u8(a as u8).ok_or_else(|| corrupt(pc - 1, "unknown binary op"))?;
                    let rhs = ws.pop()?;
                    let lhs = ws.pop()?;
                    ws.push(op.apply(lhs, rhs));
                }
                OpCode::CallExternal => {
                    ws.pop_args(b as usize)?;
                    let v = env.externals[a as usize].partial(&ws.args, &tape.partials[c as usize]);
                    ws.push(v);
                }
                OpCode::StoreTemp => ws.temps[a as usize] = ws.pop()?,
                OpCode::StoreEndo => ws.y[a as usize] = ws.pop()?,
                OpCode::StoreBlockResidual => ws.block_residual[a as usize] = ws.pop()?,
                OpCode::StoreBlockJacobian => {
                    let v = ws.pop()?;
                    ws.block_jacobian[a as usize + b as usize * routine.feedback_size as usize] = v;
                }
                OpCode::StoreResidual | OpCode::StoreG1 | OpCode::StoreG2 | OpCode::StoreG3 => {
                    let v = ws.pop()?;
                    let out = outputs.as_deref_mut().ok_or_else(|| corrupt(pc - 1, "no output buffers"))?;
                    Self::store(op, a as usize, b as usize, c as usize, v, shape, out);
                }
                OpCode::JumpUnless => {
                    if (a as u8) & mask == 0 {
                        pc = b as usize;
                    }
                }
                OpCode::Return => break,
            }
        }
        Ok(())
    }

    fn store(op: OpCode, a: usize, b: usize, c: usize, v: f64, shape: &EvaluatorShape, out: &mut EvalOutputs) {
        match op {
            OpCode::StoreResidual => out.residual[a] = v,
            OpCode::StoreG1 => {
                if let Some(g1) = out.g1.as_mut() {
                    g1[a + b * shape.equations] = v;
                }
            }
            _ => {
                let (buf, n) = if op == OpCode::StoreG2 { (out.g2.as_mut(), shape.nnz_g2) } else { (out.g3.as_mut(), shape.nnz_g3) };
                if let Some(buf) = buf {
                    buf[a] = (b + 1) as f64;
                    buf[a + n] = (c + 1) as f64;
                    buf[a + 2 * n] = v;
                }
            }
        }
    }

    /// Checks every operand index and the stack discipline of the tape
    /// against the model shape, so that `run` cannot index out of bounds.
    pub fn validate(tape: &Tape, shape: &EvaluatorShape, externals: &[ExternalFunction]) -> Result<()> {
        // 1. Column lengths and external functions
        let n = tape.ops.len();
        if tape.a.len() != n || tape.b.len() != n || tape.c.len() != n {
            return Err(ModelError::CorruptTape { msg: "operand columns differ in length".into() });
        }
        if tape.externals.len() != externals.len()
            || tape.externals.iter().zip(externals).any(|(name, f)| name != &f.name)
        {
            return Err(ModelError::CorruptTape {
                msg: format!("tape expects external functions {:?}", tape.externals),
            });
        }

        // 2. Each routine in isolation
        for (r, routine) in tape.routines.iter().enumerate() {
            let (start, end) = (routine.start as usize, routine.end as usize);
            if start >= end || end > n || tape.ops[end - 1] != OpCode::Return as u8 {
                return Err(ModelError::CorruptTape { msg: format!("routine {} has a bad range", r) });
            }
            Self::validate_routine(tape, routine, r == 0, shape, externals)?;
        }
        Ok(())
    }

    fn validate_routine(
        tape: &Tape,
        routine: &TapeRoutine,
        is_model: bool,
        shape: &EvaluatorShape,
        externals: &[ExternalFunction],
    ) -> Result<()> {
        let check = |pc: usize, ok: bool, what: &str| if ok { Ok(()) } else { Err(corrupt(pc, what)) };
        let fb = routine.feedback_size as usize;
        let mut depth: usize = 0;
        for pc in routine.start as usize..routine.end as usize {
            let (a, b, c) = (tape.a[pc] as usize, tape.b[pc] as usize, tape.c[pc] as usize);
            let op = OpCode::from_u8(tape.ops[pc]).ok_or_else(|| corrupt(pc, "unknown opcode"))?;
            let (pops, pushes) = match op {
                OpCode::PushConst => {
                    check(pc, a < tape.constants.len(), "constant out of range")?;
                    (0, 1)
                }
                OpCode::LoadEndo => {
                    check(pc, a < shape.y_len, "endogenous column out of range")?;
                    (0, 1)
                }
                OpCode::LoadExo => {
                    let lag = tape.b[pc] as i32;
                    check(pc, a < shape.exo_cols, "exogenous column out of range")?;
                    check(pc, -lag <= shape.exo_lag && lag <= shape.exo_lead, "exogenous lag out of range")?;
                    (0, 1)
                }
                OpCode::LoadParam => {
                    check(pc, a < shape.param_nbr, "parameter out of range")?;
                    (0, 1)
                }
                OpCode::LoadSteady => {
                    check(pc, a < shape.endo_nbr, "steady state out of range")?;
                    (0, 1)
                }
                OpCode::LoadTemp | OpCode::StoreTemp => {
                    check(pc, a < routine.temp_count as usize, "temporary out of range")?;
                    if op == OpCode::LoadTemp { (0, 1) } else { (1, 0) }
                }
                OpCode::Unary => {
                    check(pc, UnaryOp::from_u8(a as u8).is_some(), "unknown unary op")?;
                    (1, 1)
                }
                OpCode::Binary => {
                    check(pc, BinaryOp::from_u8(a as u8).is_some(), "unknown binary op")?;
                    (2, 1)
                }
                OpCode::CallExternal => {
                    let f = externals.get(a).ok_or_else(|| corrupt(pc, "unknown external function"))?;
                    check(pc, b == f.nargs, "wrong argument count")?;
                    let wrt = tape.partials.get(c).ok_or_else(|| corrupt(pc, "unknown partial"))?;
                    check(pc, wrt.iter().all(|&i| (i as usize) < f.nargs), "partial index out of range")?;
                    (b, 1)
                }
                OpCode::StoreResidual => {
                    check(pc, is_model && a < shape.equations, "residual row out of range")?;
                    (1, 0)
                }
                OpCode::StoreG1 => {
                    check(pc, is_model && a < shape.equations && b < shape.jacobian_cols, "g1 entry out of range")?;
                    (1, 0)
                }
                OpCode::StoreG2 | OpCode::StoreG3 => {
                    let (nnz, cols) = if op == OpCode::StoreG2 {
                        (shape.nnz_g2, shape.jacobian_cols.pow(2))
                    } else {
                        (shape.nnz_g3, shape.jacobian_cols.pow(3))
                    };
                    check(pc, is_model && a < nnz && b < shape.equations && c < cols, "sparse entry out of range")?;
                    (1, 0)
                }
                OpCode::StoreEndo => {
                    check(pc, a < shape.y_len, "endogenous column out of range")?;
                    (1, 0)
                }
                OpCode::StoreBlockResidual => {
                    check(pc, a < fb, "block residual out of range")?;
                    (1, 0)
                }
                OpCode::StoreBlockJacobian => {
                    check(pc, a < fb && b < routine.jacobian_cols as usize, "block jacobian out of range")?;
                    (1, 0)
                }
                OpCode::JumpUnless => {
                    check(pc, depth == 0, "jump with a non-empty stack")?;
                    check(pc, b > pc && b < routine.end as usize, "jump target out of range")?;
                    (0, 0)
                }
                OpCode::Return => (0, 0),
            };
            depth = depth.checked_sub(pops).ok_or_else(|| corrupt(pc, "stack underflow"))? + pushes;
        }
        if depth != 0 {
            return Err(ModelError::CorruptTape { msg: "values left on the stack".into() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::tape::TapeRoutine;

    fn shape() -> EvaluatorShape {
        EvaluatorShape { equations: 1, y_len: 2, endo_nbr: 2, param_nbr: 1, jacobian_cols: 2, ..Default::default() }
    }

    /// residual[0] = y[0] * params[0] - 3.0; g1 column 1 = y[1]
    fn tape() -> Tape {
        let mut t = Tape { constants: vec![3.0], ..Default::default() };
        let code = [
            (OpCode::LoadEndo, 0, 0, 0),
            (OpCode::LoadParam, 0, 0, 0),
            (OpCode::Binary, BinaryOp::Mul as u32, 0, 0),
            (OpCode::PushConst, 0, 0, 0),
            (OpCode::Binary, BinaryOp::Sub as u32, 0, 0),
            (OpCode::StoreResidual, 0, 0, 0),
            (OpCode::JumpUnless, 2, 9, 0),
            (OpCode::LoadEndo, 1, 0, 0),
            (OpCode::StoreG1, 0, 1, 0),
            (OpCode::Return, 0, 0, 0),
        ];
        for (op, a, b, c) in code {
            t.ops.push(op as u8);
            t.a.push(a);
            t.b.push(b);
            t.c.push(c);
        }
        t.routines.push(TapeRoutine { start: 0, end: 10, ..Default::default() });
        t
    }

    fn env<'a>(x: &'a ExogenousMatrix) -> Environment<'a> {
        Environment { x, params: &[2.0], steady_state: &[0.0, 0.0], it: 0, externals: &[] }
    }

    #[test]
    fn test_run_respects_mask() {
        let (tape, shape) = (tape(), shape());
        Engine::validate(&tape, &shape, &[]).unwrap();
        let x = ExogenousMatrix::zeros(1, 0);
        let mut ws = Workspace::new();

        let mut out = EvalOutputs::with_order(1);
        shape.prepare(&mut out);
        ws.prepare(&tape.routines[0], &[5.0, 7.0]);
        let mask = out.mask();
        Engine::run(&tape, 0, &env(&x), &mut ws, &shape, Some(&mut out), mask).unwrap();
        assert_eq!(out.residual, vec![7.0]);
        assert_eq!(out.g1, Some(vec![0.0, 7.0]));

        let mut out = EvalOutputs::with_order(0);
        shape.prepare(&mut out);
        ws.prepare(&tape.routines[0], &[5.0, 7.0]);
        let mask = out.mask();
        Engine::run(&tape, 0, &env(&x), &mut ws, &shape, Some(&mut out), mask).unwrap();
        assert_eq!(out.residual, vec![7.0]);
        assert_eq!(out.g1, None);
    }

    #[test]
    fn test_validation_rejects_bad_operands() {
        let shape = shape();
        let mut bad = tape();
        bad.a[0] = 9;
        assert!(matches!(Engine::validate(&bad, &shape, &[]), Err(ModelError::CorruptTape { .. })));

        let mut bad = tape();
        bad.ops[2] = OpCode::Return as u8;
        bad.ops[4] = OpCode::Unary as u8;
        assert!(Engine::validate(&bad, &shape, &[]).is_err());

        let mut bad = tape();
        bad.b[6] = 40;
        assert!(Engine::validate(&bad, &shape, &[]).is_err());
    }
}
