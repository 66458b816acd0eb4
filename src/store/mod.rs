pub mod eval;
pub mod registry;
pub mod types;

pub use eval::{LeafValues, NodeEvaluator};
pub use registry::{Registry, ONE, ZERO};
pub use types::*;
