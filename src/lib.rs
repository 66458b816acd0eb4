//! dynmodel_core
//! Dynamic-model compiler: symbolic derivatives of a system of dynamic
//! equations, block decomposition, temporary terms, and generated evaluators
//! (MATLAB text, C source, instruction tape).

pub mod analysis;
pub mod codegen;
pub mod config;
pub mod derive;
pub mod display;
pub mod error;
pub mod evaluator;
pub mod model;
pub mod pass;
pub mod store;
pub mod vm;

pub use config::{OutputTarget, PassOptions};
pub use error::{ModelError, Result};
pub use evaluator::{EvalInputs, EvalOutputs, Evaluator, EvaluatorShape, ExogenousMatrix};
pub use model::{DynamicModel, EvalContext};
pub use pass::PassArtifacts;
pub use store::SymbolType;
