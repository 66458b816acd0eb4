pub mod chain_rule;
pub mod differentiator;
pub mod params;
pub mod tables;

pub use chain_rule::{compute_chain_rule, ChainRuleDerivatives};
pub use differentiator::Differentiator;
pub use params::{compute_params_derivatives, ParamsDerivatives};
pub use tables::{
    compute_hessian, compute_jacobian, compute_third, DerivativeTables, FirstDerivatives, SecondDerivatives,
    ThirdDerivatives,
};
