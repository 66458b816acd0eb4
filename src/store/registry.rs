use super::types::*;
use smallvec::SmallVec;
use std::collections::{BTreeSet, HashMap, HashSet};

type Operands = SmallVec<[NodeId; 2]>;

pub const ZERO: NodeId = NodeId(0);
pub const ONE: NodeId = NodeId(1);

/// Arena of hash-consed expression nodes.
///
/// Operands are stored CSR-style in `operands_flat`; an operand always has a
/// smaller id than the node using it, so id order is a valid evaluation order.
#[derive(Debug, Clone)]
pub struct Registry {
    // Columnar Arrays
    pub kinds: Vec<NodeKind>,

    // Topology (CSR)
    pub operands_flat: Vec<NodeId>,
    pub operand_ranges: Vec<(u32, u32)>, // (start, count)

    // Data Blobs
    pub constants_data: Vec<f64>,
    pub externals: Vec<ExternalFunction>,

    // Structural identity
    interned: HashMap<(NodeKind, Operands), NodeId>,
    constants: HashMap<u64, NodeId>,
}

impl Default for Registry {
    fn default() -> Self { Self::new() }
}

impl Registry {
    pub fn new() -> Self {
        let mut reg = Self {
            kinds: Vec::new(),
            operands_flat: Vec::new(),
            operand_ranges: Vec::new(),
            constants_data: Vec::new(),
            externals: Vec::new(),
            interned: HashMap::new(),
            constants: HashMap::new(),
        };
        reg.constant(0.0);
        reg.constant(1.0);
        reg
    }

    pub fn count(&self) -> usize { self.kinds.len() }
    pub fn zero(&self) -> NodeId { ZERO }
    pub fn one(&self) -> NodeId { ONE }
    pub fn is_zero(&self, id: NodeId) -> bool { id == ZERO }

    #[inline(always)]
    pub fn kind(&self, id: NodeId) -> &NodeKind { &self.kinds[id.index()] }

    #[inline(always)]
    pub fn operands(&self, id: NodeId) -> &[NodeId] {
        let (start, count) = self.operand_ranges[id.index()];
        &self.operands_flat[start as usize..(start + count) as usize]
    }

    pub fn constant_value(&self, id: NodeId) -> Option<f64> {
        match self.kinds[id.index()] {
            NodeKind::Constant(i) => Some(self.constants_data[i as usize]),
            _ => None,
        }
    }

    fn intern(&mut self, kind: NodeKind, operands: &[NodeId]) -> NodeId {
        let key = (kind, Operands::from_slice(operands));
        if let Some(&id) = self.interned.get(&key) {
            return id;
        }
        let id = NodeId::new(self.kinds.len());
        let start = self.operands_flat.len() as u32;
        self.operands_flat.extend_from_slice(operands);
        self.operand_ranges.push((start, operands.len() as u32));
        self.kinds.push(key.0.clone());
        self.interned.insert(key, id);
        id
    }

    pub fn constant(&mut self, value: f64) -> NodeId {
        // -0.0 and 0.0 share the zero node
        let value = if value == 0.0 { 0.0 } else { value };
        if let Some(&id) = self.constants.get(&value.to_bits()) {
            return id;
        }
        let idx = self.constants_data.len() as u32;
        self.constants_data.push(value);
        let id = self.intern(NodeKind::Constant(idx), &[]);
        self.constants.insert(value.to_bits(), id);
        id
    }

    pub fn variable(&mut self, symbol: SymbolId, lag: i32) -> NodeId {
        self.intern(NodeKind::Variable { symbol, lag }, &[])
    }

    pub fn parameter(&mut self, symbol: SymbolId) -> NodeId {
        self.intern(NodeKind::Parameter(symbol), &[])
    }

    pub fn steady_state(&mut self, symbol: SymbolId) -> NodeId {
        self.intern(NodeKind::SteadyState(symbol), &[])
    }

    fn fold(&mut self, value: f64) -> Option<NodeId> {
        if value.is_finite() { Some(self.constant(value)) } else { None }
    }

    fn both_constant(&self, a: NodeId, b: NodeId) -> Option<(f64, f64)> {
        Some((self.constant_value(a)?, self.constant_value(b)?))
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        if a == ZERO { return b; }
        if b == ZERO { return a; }
        if let Some((x, y)) = self.both_constant(a, b) {
            if let Some(c) = self.fold(x + y) { return c; }
        }
        self.intern(NodeKind::Binary(BinaryOp::Add), &[a, b])
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> NodeId {
        if b == ZERO { return a; }
        if a == ZERO { return self.neg(b); }
        if a == b { return ZERO; }
        if let Some((x, y)) = self.both_constant(a, b) {
            if let Some(c) = self.fold(x - y) { return c; }
        }
        self.intern(NodeKind::Binary(BinaryOp::Sub), &[a, b])
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        if a == ZERO || b == ZERO { return ZERO; }
        if a == ONE { return b; }
        if b == ONE { return a; }
        if let Some((x, y)) = self.both_constant(a, b) {
            if let Some(c) = self.fold(x * y) { return c; }
        }
        self.intern(NodeKind::Binary(BinaryOp::Mul), &[a, b])
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> NodeId {
        if a == ZERO && b != ZERO { return ZERO; }
        if b == ONE { return a; }
        if a == b && b != ZERO { return ONE; }
        if let Some((x, y)) = self.both_constant(a, b) {
            if y != 0.0 {
                if let Some(c) = self.fold(x / y) { return c; }
            }
        }
        self.intern(NodeKind::Binary(BinaryOp::Div), &[a, b])
    }

    pub fn pow(&mut self, a: NodeId, b: NodeId) -> NodeId {
        if b == ZERO { return ONE; }
        if b == ONE { return a; }
        if a == ONE { return ONE; }
        if let Some((x, y)) = self.both_constant(a, b) {
            if let Some(c) = self.fold(x.powf(y)) { return c; }
        }
        self.intern(NodeKind::Binary(BinaryOp::Pow), &[a, b])
    }

    pub fn neg(&mut self, a: NodeId) -> NodeId {
        if a == ZERO { return ZERO; }
        if let NodeKind::Unary(UnaryOp::Neg) = self.kind(a) {
            return self.operands(a)[0];
        }
        if let Some(x) = self.constant_value(a) {
            return self.constant(-x);
        }
        self.intern(NodeKind::Unary(UnaryOp::Neg), &[a])
    }

    pub fn unary(&mut self, op: UnaryOp, a: NodeId) -> NodeId {
        if op == UnaryOp::Neg {
            return self.neg(a);
        }
        if let Some(x) = self.constant_value(a) {
            if let Some(c) = self.fold(op.apply(x)) { return c; }
        }
        self.intern(NodeKind::Unary(op), &[a])
    }

    pub fn binary(&mut self, op: BinaryOp, a: NodeId, b: NodeId) -> NodeId {
        match op {
            BinaryOp::Add => self.add(a, b),
            BinaryOp::Sub => self.sub(a, b),
            BinaryOp::Mul => self.mul(a, b),
            BinaryOp::Div => self.div(a, b),
            BinaryOp::Pow => self.pow(a, b),
        }
    }

    pub fn exp(&mut self, a: NodeId) -> NodeId { self.unary(UnaryOp::Exp, a) }
    pub fn log(&mut self, a: NodeId) -> NodeId { self.unary(UnaryOp::Log, a) }

    pub fn register_external(&mut self, function: ExternalFunction) -> u32 {
        self.externals.push(function);
        (self.externals.len() - 1) as u32
    }

    /// Call of an external function, or of one of its partials when `wrt` is non-empty.
    pub fn external(&mut self, function: u32, args: &[NodeId], mut wrt: PartialIndex) -> NodeId {
        wrt.sort_unstable();
        self.intern(NodeKind::External { function, wrt }, args)
    }

    /// Rebuilds `node` with `replacements` applied, going through the simplifying constructors.
    pub fn substitute(
        &mut self,
        node: NodeId,
        replacements: &HashMap<NodeId, NodeId>,
        memo: &mut HashMap<NodeId, NodeId>,
    ) -> NodeId {
        if let Some(&r) = replacements.get(&node) {
            return r;
        }
        if let Some(&r) = memo.get(&node) {
            return r;
        }
        let operands: Operands = Operands::from_slice(self.operands(node));
        if operands.is_empty() {
            return node;
        }
        let rebuilt: Operands = operands.iter().map(|&o| self.substitute(o, replacements, memo)).collect();
        let result = if rebuilt == operands { node } else { self.rebuild(node, &rebuilt) };
        memo.insert(node, result);
        result
    }

    fn rebuild(&mut self, node: NodeId, operands: &[NodeId]) -> NodeId {
        match self.kind(node).clone() {
            NodeKind::Unary(op) => self.unary(op, operands[0]),
            NodeKind::Binary(op) => self.binary(op, operands[0], operands[1]),
            NodeKind::External { function, wrt } => self.external(function, operands, wrt),
            _ => node,
        }
    }

    /// Leaf nodes (variables, parameters, steady-state references) reachable from `roots`.
    pub fn leaves(&self, roots: impl IntoIterator<Item = NodeId>) -> BTreeSet<NodeId> {
        let mut visited = HashSet::new();
        let mut stack: Vec<NodeId> = roots.into_iter().collect();
        let mut found = BTreeSet::new();
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            match self.kind(node) {
                NodeKind::Constant(_) => {}
                k if k.is_leaf() => { found.insert(node); }
                _ => stack.extend_from_slice(self.operands(node)),
            }
        }
        found
    }

    /// `(symbol, lag)` pairs of the variables reachable from `roots`.
    pub fn variables(&self, roots: impl IntoIterator<Item = NodeId>) -> BTreeSet<(SymbolId, i32)> {
        self.leaves(roots)
            .into_iter()
            .filter_map(|n| match *self.kind(n) {
                NodeKind::Variable { symbol, lag } => Some((symbol, lag)),
                _ => None,
            })
            .collect()
    }

    pub fn parameters(&self, roots: impl IntoIterator<Item = NodeId>) -> BTreeSet<SymbolId> {
        self.leaves(roots)
            .into_iter()
            .filter_map(|n| match *self.kind(n) {
                NodeKind::Parameter(symbol) => Some(symbol),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn x(reg: &mut Registry) -> NodeId { reg.variable(SymbolId(0), 0) }

    #[test]
    fn test_structural_identity_shares_ids() {
        let mut reg = Registry::new();
        let a = x(&mut reg);
        let b = reg.variable(SymbolId(1), -1);
        let s1 = reg.add(a, b);
        let s2 = reg.add(a, b);
        assert_eq!(s1, s2);
        assert_ne!(reg.add(b, a), s1);
        assert_eq!(reg.constant(2.5), reg.constant(2.5));
        assert_eq!(reg.constant(-0.0), ZERO);
    }

    #[test]
    fn test_operands_precede_their_users() {
        let mut reg = Registry::new();
        let a = x(&mut reg);
        let e = reg.exp(a);
        let p = reg.mul(e, a);
        for id in [e, p] {
            for &op in reg.operands(id) {
                assert!(op < id);
            }
        }
    }

    #[rstest]
    #[case::add_zero(BinaryOp::Add, true, false)]
    #[case::mul_one(BinaryOp::Mul, false, true)]
    #[case::sub_zero(BinaryOp::Sub, true, false)]
    #[case::div_one(BinaryOp::Div, false, true)]
    #[case::pow_one(BinaryOp::Pow, false, true)]
    fn test_identity_simplifications(#[case] op: BinaryOp, #[case] with_zero: bool, #[case] with_one: bool) {
        let mut reg = Registry::new();
        let a = x(&mut reg);
        let neutral = if with_zero { ZERO } else { ONE };
        assert!(with_zero || with_one);
        assert_eq!(reg.binary(op, a, neutral), a);
    }

    #[test]
    fn test_absorbing_and_folding() {
        let mut reg = Registry::new();
        let a = x(&mut reg);
        assert_eq!(reg.mul(a, ZERO), ZERO);
        assert_eq!(reg.sub(a, a), ZERO);
        let na = reg.neg(a);
        assert_eq!(reg.neg(na), a);
        let two = reg.constant(2.0);
        let three = reg.constant(3.0);
        let six = reg.mul(two, three);
        assert_eq!(reg.constant_value(six), Some(6.0));
        // Division by a zero constant is kept symbolic
        let bad = reg.div(two, ZERO);
        assert!(reg.constant_value(bad).is_none());
    }

    #[test]
    fn test_substitute_folds_through_constructors() {
        let mut reg = Registry::new();
        let a = x(&mut reg);
        let b = reg.variable(SymbolId(1), 0);
        let prod = reg.mul(a, b);
        let expr = reg.add(prod, b);
        let replacements = HashMap::from([(a, ZERO)]);
        let out = reg.substitute(expr, &replacements, &mut HashMap::new());
        assert_eq!(out, b);
    }

    #[test]
    fn test_variables_collects_lags() {
        let mut reg = Registry::new();
        let a = x(&mut reg);
        let lagged = reg.variable(SymbolId(0), -1);
        let p = reg.parameter(SymbolId(5));
        let e = reg.mul(p, lagged);
        let root = reg.add(a, e);
        let vars = reg.variables([root]);
        assert_eq!(vars.into_iter().collect::<Vec<_>>(), vec![(SymbolId(0), -1), (SymbolId(0), 0)]);
        assert_eq!(reg.parameters([root]).len(), 1);
    }
}
