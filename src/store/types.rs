use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline(always)]
    pub fn index(&self) -> usize { self.0 as usize }
    pub fn new(idx: usize) -> Self { Self(idx as u32) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SymbolId(pub u32);

impl SymbolId {
    #[inline(always)]
    pub fn index(&self) -> usize { self.0 as usize }
    pub fn new(idx: usize) -> Self { Self(idx as u32) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolType {
    Endogenous,
    Exogenous,
    ExogenousDet,
    Parameter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum UnaryOp {
    Neg = 0,
    Exp = 1,
    Log = 2,
    Log10 = 3,
    Sqrt = 4,
    Sin = 5,
    Cos = 6,
    Tan = 7,
    Atan = 8,
    Abs = 9,
    Sign = 10,
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 11] = [
        UnaryOp::Neg, UnaryOp::Exp, UnaryOp::Log, UnaryOp::Log10, UnaryOp::Sqrt, UnaryOp::Sin,
        UnaryOp::Cos, UnaryOp::Tan, UnaryOp::Atan, UnaryOp::Abs, UnaryOp::Sign,
    ];

    #[inline(always)]
    pub fn apply(self, a: f64) -> f64 {
        match self {
            UnaryOp::Neg => -a,
            UnaryOp::Exp => a.exp(),
            UnaryOp::Log => a.ln(),
            UnaryOp::Log10 => a.log10(),
            UnaryOp::Sqrt => a.sqrt(),
            UnaryOp::Sin => a.sin(),
            UnaryOp::Cos => a.cos(),
            UnaryOp::Tan => a.tan(),
            UnaryOp::Atan => a.atan(),
            UnaryOp::Abs => a.abs(),
            // Matches the C expression ((a > 0) - (a < 0)), so sign(0) = 0.
            UnaryOp::Sign => ((a > 0.0) as i32 - (a < 0.0) as i32) as f64,
        }
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Function name shared by the MATLAB and C text forms (except `abs`/`sign` in C).
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Log10 => "log10",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tan => "tan",
            UnaryOp::Atan => "atan",
            UnaryOp::Abs => "abs",
            UnaryOp::Sign => "sign",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum BinaryOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Pow = 4,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 5] = [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul, BinaryOp::Div, BinaryOp::Pow];

    #[inline(always)]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
        }
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
        }
    }
}

/// Argument positions an external-function partial is taken with respect to.
pub type PartialIndex = SmallVec<[u8; 3]>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Constant(u32), // Index into constants_data
    Variable { symbol: SymbolId, lag: i32 },
    Parameter(SymbolId),
    SteadyState(SymbolId),
    Unary(UnaryOp),
    Binary(BinaryOp),
    External { function: u32, wrt: PartialIndex },
}

impl NodeKind {
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            NodeKind::Constant(_) | NodeKind::Variable { .. } | NodeKind::Parameter(_) | NodeKind::SteadyState(_)
        )
    }
}

/// A user-supplied scalar function of several arguments.
#[derive(Debug, Clone)]
pub struct ExternalFunction {
    pub name: String,
    pub nargs: usize,
    pub eval: fn(&[f64]) -> f64,
}

impl ExternalFunction {
    /// Partial derivative w.r.t. the positions in `wrt`, by nested central differences.
    pub fn partial(&self, args: &[f64], wrt: &[u8]) -> f64 {
        let Some((&last, rest)) = wrt.split_last() else {
            return (self.eval)(args);
        };
        let i = last as usize;
        let h = f64::EPSILON.cbrt() * args[i].abs().max(1.0);
        let mut shifted = args.to_vec();
        shifted[i] = args[i] + h;
        let up = self.partial(&shifted, rest);
        shifted[i] = args[i] - h;
        let down = self.partial(&shifted, rest);
        (up - down) / (2.0 * h)
    }

    /// Name of the partial-derivative function in the text forms, e.g. `f__d1_2`.
    pub fn partial_name(&self, wrt: &[u8]) -> String {
        if wrt.is_empty() {
            return self.name.clone();
        }
        let suffix: Vec<String> = wrt.iter().map(|i| (i + 1).to_string()).collect();
        format!("{}__d{}", self.name, suffix.join("_"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use smallvec::smallvec;

    #[rstest]
    #[case(UnaryOp::Sign, -3.0, -1.0)]
    #[case(UnaryOp::Sign, 0.0, 0.0)]
    #[case(UnaryOp::Abs, -2.5, 2.5)]
    #[case(UnaryOp::Log10, 1000.0, 3.0)]
    fn test_unary_apply(#[case] op: UnaryOp, #[case] a: f64, #[case] expected: f64) {
        assert!((op.apply(a) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_opcode_roundtrip_through_u8() {
        for op in UnaryOp::ALL {
            assert_eq!(UnaryOp::from_u8(op as u8), Some(op));
        }
        assert_eq!(BinaryOp::from_u8(4), Some(BinaryOp::Pow));
        assert_eq!(BinaryOp::from_u8(5), None);
    }

    #[test]
    fn test_external_partial_by_finite_differences() {
        fn f(a: &[f64]) -> f64 { a[0] * a[0] * a[1] }
        let ext = ExternalFunction { name: "f".into(), nargs: 2, eval: f };
        let args = [3.0, 2.0];
        assert!((ext.partial(&args, &[0]) - 12.0).abs() < 1e-6);
        assert!((ext.partial(&args, &[0, 1]) - 6.0).abs() < 1e-4);
        let wrt: PartialIndex = smallvec![0, 1];
        assert_eq!(ext.partial_name(&wrt), "f__d1_2");
    }
}
