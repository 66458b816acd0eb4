pub mod engine;
pub mod workspace;

pub use engine::{Engine, Environment};
pub use workspace::Workspace;
