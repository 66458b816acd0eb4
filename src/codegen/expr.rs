//! expr.rs
//! Renders expression nodes as fully parenthesized MATLAB or C text.

use super::plan::{EmissionPlan, Operand};
use crate::error::Result;
use crate::store::{BinaryOp, NodeId, NodeKind, Registry, UnaryOp};
use std::collections::HashMap;

pub trait Dialect {
    fn operand(&self, op: Operand) -> String;
    fn temp(&self, slot: usize) -> String;
    fn unary(&self, op: UnaryOp, a: &str) -> String;
    fn binary(&self, op: BinaryOp, a: &str, b: &str) -> String;
    fn call(&self, name: &str, args: &[String]) -> String { format!("{}({})", name, args.join(", ")) }
}

/// Shortest text that reads back as the same `f64`.
pub fn number(v: f64) -> String {
    let text = format!("{:?}", v);
    if v < 0.0 { format!("({})", text) } else { text }
}

/// `it_`, `it_+2` or `it_-1`.
pub fn period(lag: i32) -> String {
    match lag {
        0 => "it_".to_string(),
        l if l > 0 => format!("it_+{}", l),
        l => format!("it_{}", l),
    }
}

pub struct Matlab;

impl Dialect for Matlab {
    fn operand(&self, op: Operand) -> String {
        match op {
            Operand::Endogenous { col } => format!("y({})", col + 1),
            Operand::Exogenous { col, lag } => format!("x({}, {})", period(lag), col + 1),
            Operand::Parameter { index } => format!("params({})", index + 1),
            Operand::SteadyState { index } => format!("steady_state({})", index + 1),
        }
    }

    fn temp(&self, slot: usize) -> String { format!("T({})", slot + 1) }

    fn unary(&self, op: UnaryOp, a: &str) -> String {
        match op {
            UnaryOp::Neg => format!("(-{})", a),
            _ => format!("{}({})", op.name(), a),
        }
    }

    fn binary(&self, op: BinaryOp, a: &str, b: &str) -> String {
        match op {
            BinaryOp::Pow => format!("({}^{})", a, b),
            _ => format!("({}{}{})", a, op.symbol(), b),
        }
    }
}

pub struct C;

impl Dialect for C {
    fn operand(&self, op: Operand) -> String {
        match op {
            Operand::Endogenous { col } => format!("y[{}]", col),
            Operand::Exogenous { col, lag } => format!("x[{}+nb_row_x*{}]", period(lag), col),
            Operand::Parameter { index } => format!("params[{}]", index),
            Operand::SteadyState { index } => format!("steady_state[{}]", index),
        }
    }

    fn temp(&self, slot: usize) -> String { format!("T[{}]", slot) }

    fn unary(&self, op: UnaryOp, a: &str) -> String {
        match op {
            UnaryOp::Neg => format!("(-{})", a),
            UnaryOp::Abs => format!("fabs({})", a),
            UnaryOp::Sign => format!("((double)(({a})>0)-(double)(({a})<0))", a = a),
            _ => format!("{}({})", op.name(), a),
        }
    }

    fn binary(&self, op: BinaryOp, a: &str, b: &str) -> String {
        match op {
            BinaryOp::Pow => format!("pow({}, {})", a, b),
            _ => format!("({}{}{})", a, op.symbol(), b),
        }
    }
}

pub struct Renderer<'a, D: Dialect> {
    pub registry: &'a Registry,
    pub plan: &'a EmissionPlan,
    pub dialect: &'a D,
    /// Temporaries visible to the expression being rendered.
    pub temps: &'a HashMap<NodeId, usize>,
}

impl<'a, D: Dialect> Renderer<'a, D> {
    /// Renders `node`, reading already computed temporaries by slot.
    pub fn expr(&self, node: NodeId) -> Result<String> {
        match self.temps.get(&node) {
            Some(&slot) => Ok(self.dialect.temp(slot)),
            None => self.definition(node),
        }
    }

    /// Renders the operation of `node` itself, even when `node` is a temporary.
    pub fn definition(&self, node: NodeId) -> Result<String> {
        let operands = self.registry.operands(node);
        Ok(match self.registry.kind(node) {
            NodeKind::Constant(_) => number(self.registry.constant_value(node).unwrap_or(0.0)),
            NodeKind::Variable { .. } | NodeKind::Parameter(_) | NodeKind::SteadyState(_) => {
                self.dialect.operand(self.plan.operand(node)?)
            }
            NodeKind::Unary(op) => self.dialect.unary(*op, &self.expr(operands[0])?),
            NodeKind::Binary(op) => self.dialect.binary(*op, &self.expr(operands[0])?, &self.expr(operands[1])?),
            NodeKind::External { function, wrt } => {
                let args = operands.iter().map(|&a| self.expr(a)).collect::<Result<Vec<_>>>()?;
                let name = self.registry.externals[*function as usize].partial_name(wrt);
                self.dialect.call(&name, &args)
            }
        })
    }
}
