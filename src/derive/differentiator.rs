//! differentiator.rs
//! Memoized symbolic differentiation over the expression store.

use crate::error::Result;
use crate::model::{DerivId, DerivIdResolver};
use crate::store::{BinaryOp, NodeId, NodeKind, Registry, UnaryOp, ONE, ZERO};
use smallvec::SmallVec;
use std::collections::{BTreeSet, HashMap};

pub struct Differentiator<'r> {
    resolver: &'r dyn DerivIdResolver,
    /// Ids w.r.t. which each node has a structurally non-zero derivative.
    non_null: Vec<BTreeSet<DerivId>>,
    memo: HashMap<(NodeId, DerivId), NodeId>,
}

impl<'r> Differentiator<'r> {
    pub fn new(resolver: &'r dyn DerivIdResolver) -> Self {
        Self { resolver, non_null: Vec::new(), memo: HashMap::new() }
    }

    pub fn resolver(&self) -> &'r dyn DerivIdResolver { self.resolver }

    /// Extends the non-null sets to nodes created since the last call.
    fn sync(&mut self, registry: &Registry) {
        for i in self.non_null.len()..registry.count() {
            let node = NodeId::new(i);
            // Leaves without an id never occur in an equation; nothing to differentiate.
            let set = match *registry.kind(node) {
                NodeKind::Variable { symbol, lag } => self.resolver.deriv_id(symbol, lag).ok().into_iter().collect(),
                NodeKind::Parameter(symbol) => self.resolver.deriv_id(symbol, 0).ok().into_iter().collect(),
                NodeKind::Constant(_) | NodeKind::SteadyState(_) => BTreeSet::new(),
                _ => {
                    let mut set = BTreeSet::new();
                    for &op in registry.operands(node) {
                        set.extend(self.non_null[op.index()].iter().copied());
                    }
                    set
                }
            };
            self.non_null.push(set);
        }
    }

    pub fn non_null(&mut self, registry: &Registry, node: NodeId) -> &BTreeSet<DerivId> {
        self.sync(registry);
        &self.non_null[node.index()]
    }

    pub fn depends_on(&mut self, registry: &Registry, node: NodeId, id: DerivId) -> bool {
        self.non_null(registry, node).contains(&id)
    }

    pub fn derivative(&mut self, registry: &mut Registry, node: NodeId, id: DerivId) -> Result<NodeId> {
        self.sync(registry);
        if !self.non_null[node.index()].contains(&id) {
            return Ok(ZERO);
        }
        if let Some(&d) = self.memo.get(&(node, id)) {
            return Ok(d);
        }
        let operands: SmallVec<[NodeId; 4]> = SmallVec::from_slice(registry.operands(node));
        let d = match registry.kind(node).clone() {
            NodeKind::Constant(_) | NodeKind::SteadyState(_) => ZERO,
            NodeKind::Variable { .. } | NodeKind::Parameter(_) => ONE,
            NodeKind::Unary(op) => {
                let a = operands[0];
                let da = self.derivative(registry, a, id)?;
                Self::unary_rule(registry, op, node, a, da)
            }
            NodeKind::Binary(op) => {
                let (a, b) = (operands[0], operands[1]);
                let da = self.derivative(registry, a, id)?;
                let db = self.derivative(registry, b, id)?;
                Self::binary_rule(registry, op, node, a, b, da, db)
            }
            NodeKind::External { function, wrt } => {
                let mut sum = ZERO;
                for (i, &arg) in operands.iter().enumerate() {
                    let darg = self.derivative(registry, arg, id)?;
                    if darg == ZERO {
                        continue;
                    }
                    let mut partial_wrt = wrt.clone();
                    partial_wrt.push(i as u8);
                    let partial = registry.external(function, &operands, partial_wrt);
                    let term = registry.mul(darg, partial);
                    sum = registry.add(sum, term);
                }
                sum
            }
        };
        self.memo.insert((node, id), d);
        Ok(d)
    }

    fn unary_rule(reg: &mut Registry, op: UnaryOp, node: NodeId, a: NodeId, da: NodeId) -> NodeId {
        match op {
            UnaryOp::Neg => reg.neg(da),
            UnaryOp::Exp => reg.mul(da, node),
            UnaryOp::Log => reg.div(da, a),
            UnaryOp::Log10 => {
                let ln10 = reg.constant(std::f64::consts::LN_10);
                let den = reg.mul(a, ln10);
                reg.div(da, den)
            }
            UnaryOp::Sqrt => {
                let two = reg.constant(2.0);
                let den = reg.mul(two, node);
                reg.div(da, den)
            }
            UnaryOp::Sin => {
                let cos = reg.unary(UnaryOp::Cos, a);
                reg.mul(da, cos)
            }
            UnaryOp::Cos => {
                let sin = reg.unary(UnaryOp::Sin, a);
                let t = reg.mul(da, sin);
                reg.neg(t)
            }
            UnaryOp::Tan => {
                let sq = reg.mul(node, node);
                let sec2 = reg.add(ONE, sq);
                reg.mul(da, sec2)
            }
            UnaryOp::Atan => {
                let sq = reg.mul(a, a);
                let den = reg.add(ONE, sq);
                reg.div(da, den)
            }
            UnaryOp::Abs => {
                let sign = reg.unary(UnaryOp::Sign, a);
                reg.mul(da, sign)
            }
            UnaryOp::Sign => ZERO,
        }
    }

    fn binary_rule(
        reg: &mut Registry,
        op: BinaryOp,
        node: NodeId,
        a: NodeId,
        b: NodeId,
        da: NodeId,
        db: NodeId,
    ) -> NodeId {
        match op {
            BinaryOp::Add => reg.add(da, db),
            BinaryOp::Sub => reg.sub(da, db),
            BinaryOp::Mul => {
                let l = reg.mul(da, b);
                let r = reg.mul(a, db);
                reg.add(l, r)
            }
            BinaryOp::Div => {
                let l = reg.mul(da, b);
                let r = reg.mul(a, db);
                let num = reg.sub(l, r);
                let den = reg.mul(b, b);
                reg.div(num, den)
            }
            BinaryOp::Pow if db == ZERO => {
                // d(a^b) = b * a^(b-1) * da
                let b_minus_one = reg.sub(b, ONE);
                let p = reg.pow(a, b_minus_one);
                let scaled = reg.mul(b, p);
                reg.mul(da, scaled)
            }
            BinaryOp::Pow => {
                // d(a^b) = a^b * (db * log(a) + b * da / a)
                let log_a = reg.log(a);
                let l = reg.mul(db, log_a);
                let b_da = reg.mul(b, da);
                let r = reg.div(b_da, a);
                let inner = reg.add(l, r);
                reg.mul(node, inner)
            }
        }
    }
}
