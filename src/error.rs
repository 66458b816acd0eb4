//! error.rs
//! Error taxonomy shared by the model, the computing pass and the evaluators.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Unknown derivation id: {id}")]
    UnknownDerivId { id: u32 },
    #[error("Unknown symbol: {name}")]
    UnknownSymbol { name: String },
    #[error("Unknown block: {block}")]
    UnknownBlock { block: usize },
    #[error("Unknown equation: {equation}")]
    UnknownEquation { equation: usize },
    #[error("Block {block} has no member at position {position}")]
    UnknownBlockMember { block: usize, position: usize },
    #[error("No derivation id for {name} at lag {lag}")]
    MissingDerivId { name: String, lag: i32 },
    #[error("Equation {equation} is evaluated recursively but has no normalized form")]
    NotNormalized { equation: usize },
    #[error("Derivation ids are frozen, cannot allocate ({symbol}, lag {lag})")]
    DerivIdsFrozen { symbol: String, lag: i32 },
    #[error("Symbol declared twice: {name}")]
    DuplicateSymbol { name: String },
    #[error("Model has {equations} equations for {endogenous} endogenous variables")]
    EquationCountMismatch { equations: usize, endogenous: usize },
    #[error("Structurally singular system: equations {equations:?} cannot determine variables {variables:?}")]
    StructuralSingularity {
        equations: Vec<usize>,
        variables: Vec<String>,
    },
    #[error("Size mismatch for {what}: expected {expected}, got {actual}")]
    SizeMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },
    #[error("No value for {name} in the evaluation context")]
    MissingValue { name: String },
    #[error("Exogenous variable {name} appears with lag {lag}; substitute exogenous leads/lags before requesting exogenous Jacobian columns")]
    ExogenousLag { name: String, lag: i32 },
    #[error("Can't load {path}: {reason}")]
    LoadFailure { path: PathBuf, reason: String },
    #[error("Corrupt instruction tape: {msg}")]
    CorruptTape { msg: String },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration: {msg}")]
    Config { msg: String },
}

impl ModelError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ModelError::Io { path: path.into(), source }
    }

    pub fn size(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        ModelError::SizeMismatch { what: what.into(), expected, actual }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
