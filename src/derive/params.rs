//! params.rs
//! Derivatives of residuals, Jacobian and Hessian w.r.t. parameters.

use super::differentiator::Differentiator;
use super::tables::{FirstDerivatives, SecondDerivatives, ThirdDerivatives};
use crate::error::Result;
use crate::model::{DerivId, Equation};
use crate::store::{NodeId, Registry};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default)]
pub struct ParamsDerivatives {
    /// `(eq, param)`
    pub residuals: FirstDerivatives,
    /// `(eq, param1, param2)`, `param1 <= param2`
    pub residuals_second: SecondDerivatives,
    /// `(eq, var, param)`
    pub jacobian: SecondDerivatives,
    /// `(eq, var, param1, param2)`, `param1 <= param2`
    pub jacobian_second: ThirdDerivatives,
    /// `(eq, var1, var2, param)`
    pub hessian: ThirdDerivatives,
}

impl ParamsDerivatives {
    pub fn is_empty(&self) -> bool {
        self.residuals.is_empty()
            && self.residuals_second.is_empty()
            && self.jacobian.is_empty()
            && self.jacobian_second.is_empty()
            && self.hessian.is_empty()
    }
}

fn param_candidates(diff: &mut Differentiator, registry: &Registry, node: NodeId, params: &BTreeSet<DerivId>, from: Option<DerivId>) -> Vec<DerivId> {
    diff.non_null(registry, node)
        .iter()
        .copied()
        .filter(|id| params.contains(id) && from.map_or(true, |f| *id >= f))
        .collect()
}

/// Computes the parameter derivative tables. `hessian` is the variable Hessian
/// when it was requested; its parameter derivatives are skipped otherwise.
pub fn compute_params_derivatives(
    diff: &mut Differentiator,
    registry: &mut Registry,
    equations: &[Equation],
    jacobian: &FirstDerivatives,
    hessian: Option<&SecondDerivatives>,
    params: &BTreeSet<DerivId>,
) -> Result<ParamsDerivatives> {
    let mut out = ParamsDerivatives::default();

    for (eq, equation) in equations.iter().enumerate() {
        for p in param_candidates(diff, registry, equation.residual, params, None) {
            let d = diff.derivative(registry, equation.residual, p)?;
            if registry.is_zero(d) {
                continue;
            }
            out.residuals.insert((eq, p), d);
            for p2 in param_candidates(diff, registry, d, params, Some(p)) {
                let d2 = diff.derivative(registry, d, p2)?;
                if !registry.is_zero(d2) {
                    out.residuals_second.insert((eq, p, p2), d2);
                }
            }
        }
    }

    for (&(eq, var), &d1) in jacobian {
        if params.contains(&var) {
            continue;
        }
        for p in param_candidates(diff, registry, d1, params, None) {
            let d = diff.derivative(registry, d1, p)?;
            if registry.is_zero(d) {
                continue;
            }
            out.jacobian.insert((eq, var, p), d);
            for p2 in param_candidates(diff, registry, d, params, Some(p)) {
                let d2 = diff.derivative(registry, d, p2)?;
                if !registry.is_zero(d2) {
                    out.jacobian_second.insert((eq, var, p, p2), d2);
                }
            }
        }
    }

    if let Some(hessian) = hessian {
        for (&(eq, v1, v2), &d2) in hessian {
            for p in param_candidates(diff, registry, d2, params, None) {
                let d = diff.derivative(registry, d2, p)?;
                if !registry.is_zero(d) {
                    out.hessian.insert((eq, v1, v2, p), d);
                }
            }
        }
    }

    Ok(out)
}
