//! config.rs
//! Switches of a computing pass and the output destination, loadable from JSON.

use crate::analysis::{MfsPolicy, TemporaryTermsMode};
use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassOptions {
    /// Jacobian columns for exogenous and deterministic exogenous variables.
    pub jacobian_exo: bool,
    pub hessian: bool,
    pub third_derivatives: bool,
    pub params_derivatives: bool,
    pub no_tmp_terms: bool,
    pub block: bool,
    /// Emit the C form.
    pub use_dll: bool,
    /// Emit the instruction tape.
    pub bytecode: bool,
    pub cutoff: f64,
    pub mfs: MfsPolicy,
    pub temporary_terms: TemporaryTermsMode,
    /// Also drop below-cutoff entries from the emitted Jacobian.
    pub prune_emitted_jacobian: bool,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            jacobian_exo: false,
            hessian: false,
            third_derivatives: false,
            params_derivatives: false,
            no_tmp_terms: false,
            block: false,
            use_dll: false,
            bytecode: false,
            cutoff: 1e-15,
            mfs: MfsPolicy::AllFeedback,
            temporary_terms: TemporaryTermsMode::Global,
            prune_emitted_jacobian: false,
        }
    }
}

impl PassOptions {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json).map_err(|e| ModelError::Config { msg: e.to_string() })?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ModelError::io(path, e))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.cutoff >= 0.0 && self.cutoff.is_finite()) {
            return Err(ModelError::Config { msg: format!("cutoff must be a non-negative number, got {}", self.cutoff) });
        }
        if self.third_derivatives && !self.hessian {
            return Err(ModelError::Config { msg: "third_derivatives requires hessian".into() });
        }
        Ok(())
    }

    /// Options with the implied switches turned on.
    pub fn effective(&self) -> Self {
        let mut out = self.clone();
        out.jacobian_exo |= self.hessian || self.third_derivatives || self.params_derivatives;
        out
    }
}

/// Where generated files go; every file name starts with `basename`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTarget {
    pub directory: PathBuf,
    pub basename: String,
}

impl OutputTarget {
    pub fn new(directory: impl Into<PathBuf>, basename: impl Into<String>) -> Self {
        Self { directory: directory.into(), basename: basename.into() }
    }

    pub fn path(&self, suffix: &str) -> PathBuf { self.directory.join(format!("{}{}", self.basename, suffix)) }
}
