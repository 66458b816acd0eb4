#![allow(dead_code)]

use dynmodel_core::{DynamicModel, EvalContext, EvalInputs, EvaluatorShape, ExogenousMatrix, SymbolType};

pub const RBC_PARAMS: [f64; 4] = [0.36, 0.99, 0.9, 0.025];

/// Three-equation growth model:
///   z = rho*z(-1) + e
///   k = exp(z)*k(-1)^alpha + (1-delta)*k(-1) - c
///   1/c = beta/c(+1) * (alpha*exp(z(+1))*k^(alpha-1) + 1 - delta)
pub fn rbc() -> (DynamicModel, EvalContext) {
    let mut m = DynamicModel::new();
    for name in ["c", "k", "z"] {
        m.declare(name, SymbolType::Endogenous).unwrap();
    }
    m.declare("e", SymbolType::Exogenous).unwrap();
    for name in ["alpha", "beta", "rho", "delta"] {
        m.declare(name, SymbolType::Parameter).unwrap();
    }

    let (c, c_lead) = (m.var("c", 0).unwrap(), m.var("c", 1).unwrap());
    let (k, k_lag) = (m.var("k", 0).unwrap(), m.var("k", -1).unwrap());
    let (z, z_lag, z_lead) = (m.var("z", 0).unwrap(), m.var("z", -1).unwrap(), m.var("z", 1).unwrap());
    let e = m.var("e", 0).unwrap();
    let (alpha, beta) = (m.param("alpha").unwrap(), m.param("beta").unwrap());
    let (rho, delta) = (m.param("rho").unwrap(), m.param("delta").unwrap());

    let r = &mut m.registry;
    let one = r.one();
    let persistence = r.mul(rho, z_lag);
    let law = r.add(persistence, e);

    let tfp = r.exp(z);
    let capital = r.pow(k_lag, alpha);
    let output = r.mul(tfp, capital);
    let keep = r.sub(one, delta);
    let undepreciated = r.mul(keep, k_lag);
    let resources = r.add(output, undepreciated);
    let accumulation = r.sub(resources, c);

    let marginal = r.div(one, c);
    let tfp_next = r.exp(z_lead);
    let exponent = r.sub(alpha, one);
    let k_pow = r.pow(k, exponent);
    let mpk = r.mul(alpha, tfp_next);
    let mpk = r.mul(mpk, k_pow);
    let gross = r.add(mpk, keep);
    let discount = r.div(beta, c_lead);
    let euler = r.mul(discount, gross);

    m.add_equation(z, law);
    m.add_equation(k, accumulation);
    m.add_equation(marginal, euler);

    let mut ctx = EvalContext::new();
    for (name, value) in [("c", 0.8), ("k", 10.0), ("z", 0.0), ("e", 0.0)] {
        ctx.set_by_name(&m.symbols, name, value).unwrap();
    }
    for (name, value) in ["alpha", "beta", "rho", "delta"].into_iter().zip(RBC_PARAMS) {
        ctx.set_by_name(&m.symbols, name, value).unwrap();
    }
    (m, ctx)
}

/// Evaluation point sized for `shape`, with distinct positive values.
pub struct Point {
    pub y: Vec<f64>,
    pub x: ExogenousMatrix,
    pub params: Vec<f64>,
    pub steady_state: Vec<f64>,
    pub it: usize,
}

impl Point {
    pub fn new(shape: &EvaluatorShape, params: &[f64]) -> Self {
        let it = shape.exo_lag.max(0) as usize;
        let rows = it + shape.exo_lead.max(0) as usize + 1;
        let data = (0..rows * shape.exo_cols).map(|i| 0.01 * (i + 1) as f64).collect();
        Self {
            y: (0..shape.y_len).map(|i| 0.9 + 0.05 * i as f64).collect(),
            x: ExogenousMatrix::new(rows, shape.exo_cols, data).unwrap(),
            params: params.to_vec(),
            steady_state: vec![1.0; shape.endo_nbr],
            it,
        }
    }

    pub fn inputs(&self) -> EvalInputs<'_> {
        EvalInputs { y: &self.y, x: &self.x, params: &self.params, steady_state: &self.steady_state, it: self.it }
    }
}

pub fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(actual.len(), expected.len(), "length differs");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tol * (1.0 + e.abs()), "entry {}: {} vs {}", i, a, e);
    }
}
