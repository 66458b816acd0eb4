//! tape.rs
//! Instruction tape for the stack VM, and its `<base>_dynamic.cod` file format.

use super::plan::{EmissionPlan, Operand, Routine, Target};
use crate::error::{ModelError, Result};
use crate::store::{NodeId, NodeKind, PartialIndex, Registry};
use std::collections::HashMap;

const MAGIC: &[u8; 4] = b"DYNT";
const VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    PushConst = 0,
    LoadEndo = 1,
    LoadExo = 2,
    LoadParam = 3,
    LoadSteady = 4,
    LoadTemp = 5,
    Unary = 6,
    Binary = 7,
    CallExternal = 8,
    StoreTemp = 9,
    StoreResidual = 10,
    StoreG1 = 11,
    StoreG2 = 12,
    StoreG3 = 13,
    StoreEndo = 14,
    StoreBlockResidual = 15,
    StoreBlockJacobian = 16,
    JumpUnless = 17,
    Return = 18,
}

impl OpCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        use OpCode::*;
        const ALL: [OpCode; 19] = [
            PushConst, LoadEndo, LoadExo, LoadParam, LoadSteady, LoadTemp, Unary, Binary, CallExternal, StoreTemp,
            StoreResidual, StoreG1, StoreG2, StoreG3, StoreEndo, StoreBlockResidual, StoreBlockJacobian, JumpUnless,
            Return,
        ];
        ALL.get(code as usize).copied()
    }
}

/// One entry point of the tape: the model evaluator or a block solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TapeRoutine {
    pub start: u32,
    pub end: u32,
    pub temp_count: u32,
    pub feedback_size: u32,
    pub jacobian_cols: u32,
}

/// Structure-of-Arrays layout: instruction `i` is `ops[i]` with
/// operands `a[i]`, `b[i]` and `c[i]` (0 when unused).
///
/// | op              | a        | b           | c            |
/// |-----------------|----------|-------------|--------------|
/// | PushConst       | constant |             |              |
/// | LoadEndo        | y column |             |              |
/// | LoadExo         | column   | lag (i32)   |              |
/// | Unary/Binary    | op code  |             |              |
/// | CallExternal    | function | nargs       | partial list |
/// | StoreG1         | row      | column      |              |
/// | StoreG2/G3      | slot     | row         | column       |
/// | JumpUnless      | mask     | target      |              |
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tape {
    pub ops: Vec<u8>,
    pub a: Vec<u32>,
    pub b: Vec<u32>,
    pub c: Vec<u32>,
    pub constants: Vec<f64>,
    pub partials: Vec<PartialIndex>,
    /// External function names, indexed like the registry's externals.
    pub externals: Vec<String>,
    /// Routine 0 evaluates the model; routine `1 + b` solves block `b`.
    pub routines: Vec<TapeRoutine>,
}

impl Tape {
    pub fn len(&self) -> usize { self.ops.len() }
    pub fn is_empty(&self) -> bool { self.ops.is_empty() }

    pub fn routine(&self, index: usize) -> Result<&TapeRoutine> {
        self.routines.get(index).ok_or_else(|| ModelError::CorruptTape { msg: format!("no routine {}", index) })
    }

    fn push(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> usize {
        self.ops.push(op as u8);
        self.a.push(a);
        self.b.push(b);
        self.c.push(c);
        self.ops.len() - 1
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.ops.len() * 13);
        out.extend_from_slice(MAGIC);
        let put = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_le_bytes());
        put(&mut out, VERSION);
        put(&mut out, self.ops.len() as u32);
        out.extend_from_slice(&self.ops);
        for column in [&self.a, &self.b, &self.c] {
            for &v in column {
                put(&mut out, v);
            }
        }
        put(&mut out, self.constants.len() as u32);
        for v in &self.constants {
            out.extend_from_slice(&v.to_le_bytes());
        }
        put(&mut out, self.partials.len() as u32);
        for p in &self.partials {
            out.push(p.len() as u8);
            out.extend_from_slice(p);
        }
        put(&mut out, self.externals.len() as u32);
        for name in &self.externals {
            put(&mut out, name.len() as u32);
            out.extend_from_slice(name.as_bytes());
        }
        put(&mut out, self.routines.len() as u32);
        for r in &self.routines {
            for v in [r.start, r.end, r.temp_count, r.feedback_size, r.jacobian_cols] {
                put(&mut out, v);
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        if r.take(4)? != MAGIC {
            return Err(ModelError::CorruptTape { msg: "bad magic".into() });
        }
        let version = r.u32()?;
        if version != VERSION {
            return Err(ModelError::CorruptTape { msg: format!("unsupported version {}", version) });
        }
        let n = r.u32()? as usize;
        let mut tape = Tape { ops: r.take(n)?.to_vec(), ..Default::default() };
        for column in [&mut tape.a, &mut tape.b, &mut tape.c] {
            *column = (0..n).map(|_| r.u32()).collect::<Result<_>>()?;
        }
        let count = r.u32()?;
        tape.constants = (0..count).map(|_| r.f64()).collect::<Result<_>>()?;
        let count = r.u32()?;
        for _ in 0..count {
            let len = r.take(1)?[0] as usize;
            tape.partials.push(r.take(len)?.iter().copied().collect());
        }
        let count = r.u32()?;
        for _ in 0..count {
            let len = r.u32()? as usize;
            let name = std::str::from_utf8(r.take(len)?).map_err(|e| ModelError::CorruptTape { msg: e.to_string() })?;
            tape.externals.push(name.to_string());
        }
        let count = r.u32()?;
        for _ in 0..count {
            tape.routines.push(TapeRoutine {
                start: r.u32()?,
                end: r.u32()?,
                temp_count: r.u32()?,
                feedback_size: r.u32()?,
                jacobian_cols: r.u32()?,
            });
        }
        r.finish()?;
        Ok(tape)
    }
}

/// Little-endian cursor over a generated binary file.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self { Self { bytes, pos: 0 } }

    pub(crate) fn finish(&self) -> Result<()> {
        if self.pos != self.bytes.len() {
            return Err(ModelError::CorruptTape { msg: format!("{} trailing bytes", self.bytes.len() - self.pos) });
        }
        Ok(())
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.bytes.len()).ok_or_else(|| ModelError::CorruptTape {
            msg: format!("truncated at byte {}", self.pos),
        })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub(crate) fn f64(&mut self) -> Result<f64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(f64::from_le_bytes(buf))
    }
}

pub struct Compiler<'a> {
    registry: &'a Registry,
    plan: &'a EmissionPlan,
    tape: Tape,
    constants: HashMap<u64, u32>,
    partials: HashMap<PartialIndex, u32>,
}

impl<'a> Compiler<'a> {
    pub fn new(registry: &'a Registry, plan: &'a EmissionPlan) -> Self {
        let tape = Tape { externals: registry.externals.iter().map(|e| e.name.clone()).collect(), ..Default::default() };
        Self { registry, plan, tape, constants: HashMap::new(), partials: HashMap::new() }
    }

    /// Compiles the model routine and every block solver into one tape.
    pub fn compile(mut self) -> Result<Tape> {
        let plan = self.plan;
        self.routine(&plan.model, 0, 0)?;
        for solver in &plan.block_solvers {
            self.routine(&solver.routine, solver.feedback_size, solver.jacobian_cols)?;
        }
        Ok(self.tape)
    }

    fn routine(&mut self, routine: &Routine, feedback_size: usize, jacobian_cols: usize) -> Result<()> {
        let start = self.tape.len() as u32;
        for (s, section) in routine.sections.iter().enumerate() {
            let temps = &routine.scopes[section.scope];

            // 1. Temporaries, skipped when no later output is requested
            if !section.temps.is_empty() {
                let jump = self.tape.push(OpCode::JumpUnless, routine.temps_needed_mask(s) as u32, 0, 0);
                for &(node, slot) in &section.temps {
                    self.definition(node, temps)?;
                    self.tape.push(OpCode::StoreTemp, slot as u32, 0, 0);
                }
                self.tape.b[jump] = self.tape.len() as u32;
            }

            // 2. Assignments of the section's own output
            if section.assignments.is_empty() {
                continue;
            }
            let jump = self.tape.push(OpCode::JumpUnless, section.output.mask() as u32, 0, 0);
            for a in &section.assignments {
                self.expr(a.expr, temps)?;
                let (op, x, y, z) = match a.target {
                    Target::Residual { row } => (OpCode::StoreResidual, row, 0, 0),
                    Target::Jacobian { row, col } => (OpCode::StoreG1, row, col, 0),
                    Target::Sparse { order: 2, slot, row, col } => (OpCode::StoreG2, slot, row, col),
                    Target::Sparse { slot, row, col, .. } => (OpCode::StoreG3, slot, row, col),
                    Target::Endogenous { col } => (OpCode::StoreEndo, col, 0, 0),
                    Target::BlockResidual { row } => (OpCode::StoreBlockResidual, row, 0, 0),
                    Target::BlockJacobian { row, col } => (OpCode::StoreBlockJacobian, row, col, 0),
                    Target::ParamResidual { .. } | Target::ParamJacobian { .. } | Target::ParamList { .. } => {
                        return Err(ModelError::CorruptTape { msg: "parameter derivatives have no tape form".into() })
                    }
                };
                self.tape.push(op, x as u32, y as u32, z as u32);
            }
            self.tape.b[jump] = self.tape.len() as u32;
        }
        self.tape.push(OpCode::Return, 0, 0, 0);
        self.tape.routines.push(TapeRoutine {
            start,
            end: self.tape.len() as u32,
            temp_count: routine.temp_count as u32,
            feedback_size: feedback_size as u32,
            jacobian_cols: jacobian_cols as u32,
        });
        Ok(())
    }

    fn expr(&mut self, node: NodeId, temps: &HashMap<NodeId, usize>) -> Result<()> {
        match temps.get(&node) {
            Some(&slot) => {
                self.tape.push(OpCode::LoadTemp, slot as u32, 0, 0);
                Ok(())
            }
            None => self.definition(node, temps),
        }
    }

    fn definition(&mut self, node: NodeId, temps: &HashMap<NodeId, usize>) -> Result<()> {
        let registry = self.registry;
        let operands = registry.operands(node);
        match registry.kind(node) {
            NodeKind::Constant(_) => {
                let value = registry.constant_value(node).unwrap_or(0.0);
                let next = self.tape.constants.len() as u32;
                let index = *self.constants.entry(value.to_bits()).or_insert(next);
                if index == next {
                    self.tape.constants.push(value);
                }
                self.tape.push(OpCode::PushConst, index, 0, 0);
            }
            NodeKind::Variable { .. } | NodeKind::Parameter(_) | NodeKind::SteadyState(_) => {
                let (op, a, b) = match self.plan.operand(node)? {
                    Operand::Endogenous { col } => (OpCode::LoadEndo, col as u32, 0),
                    Operand::Exogenous { col, lag } => (OpCode::LoadExo, col as u32, lag as u32),
                    Operand::Parameter { index } => (OpCode::LoadParam, index as u32, 0),
                    Operand::SteadyState { index } => (OpCode::LoadSteady, index as u32, 0),
                };
                self.tape.push(op, a, b, 0);
            }
            NodeKind::Unary(op) => {
                self.expr(operands[0], temps)?;
                self.tape.push(OpCode::Unary, *op as u32, 0, 0);
            }
            NodeKind::Binary(op) => {
                self.expr(operands[0], temps)?;
                self.expr(operands[1], temps)?;
                self.tape.push(OpCode::Binary, *op as u32, 0, 0);
            }
            NodeKind::External { function, wrt } => {
                for &arg in operands {
                    self.expr(arg, temps)?;
                }
                let next = self.tape.partials.len() as u32;
                let index = *self.partials.entry(wrt.clone()).or_insert(next);
                if index == next {
                    self.tape.partials.push(wrt.clone());
                }
                self.tape.push(OpCode::CallExternal, *function, operands.len() as u32, index);
            }
        }
        Ok(())
    }
}
