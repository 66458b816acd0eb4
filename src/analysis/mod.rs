pub mod blocks;
pub mod feedback;
pub mod incidence;
pub mod normalize;
pub mod temporary;
pub mod topology;

pub use blocks::{decompose, Block, BlockDecomposition, BlockLagLead, DecompositionInput, Direction, SimulationType};
pub use feedback::MfsPolicy;
pub use incidence::{compute_incidence, Incidence};
pub use normalize::{EquationKind, Normalization};
pub use temporary::{TemporarySet, TemporaryTermsMode};
