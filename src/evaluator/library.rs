//! library.rs
//! Evaluator backed by the compiled C form, loaded with `dlopen`.
//!
//! The library must export `Dynamic` with the signature written by the C
//! emitter. Any external functions it calls must be resolvable at load time.

use super::{EvalInputs, EvalOutputs, Evaluator, EvaluatorShape};
use crate::error::{ModelError, Result};
use libc::{c_char, c_int, c_void};
use log::info;
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr;

/// `void Dynamic(y, x, nb_row_x, params, steady_state, it_, residual, g1, g2, g3)`
pub type DynamicFn = unsafe extern "C" fn(
    y: *const f64,
    x: *const f64,
    nb_row_x: c_int,
    params: *const f64,
    steady_state: *const f64,
    it_: c_int,
    residual: *mut f64,
    g1: *mut f64,
    g2: *mut f64,
    g3: *mut f64,
);

pub struct LibraryEvaluator {
    handle: *mut c_void,
    dynamic: DynamicFn,
    shape: EvaluatorShape,
    path: PathBuf,
}

// SAFETY: the generated `Dynamic` keeps no global state; every call works on
// its own stack array of temporaries and the caller's buffers.
unsafe impl Send for LibraryEvaluator {}
unsafe impl Sync for LibraryEvaluator {}

fn dl_error() -> String {
    // SAFETY: dlerror returns NULL or a valid NUL-terminated string.
    unsafe {
        let msg: *const c_char = libc::dlerror();
        if msg.is_null() { "unknown dlopen error".to_string() } else { CStr::from_ptr(msg).to_string_lossy().into_owned() }
    }
}

impl LibraryEvaluator {
    pub fn load(path: &Path, shape: EvaluatorShape) -> Result<Self> {
        let fail = |reason: String| ModelError::LoadFailure { path: path.to_path_buf(), reason };
        let c_path = CString::new(path.to_string_lossy().as_bytes()).map_err(|e| fail(e.to_string()))?;

        // SAFETY: c_path is a valid C string; the handle is closed in Drop.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(fail(dl_error()));
        }
        let symbol = CString::new("Dynamic").map_err(|e| fail(e.to_string()))?;
        // SAFETY: handle is a live library handle.
        let address = unsafe { libc::dlsym(handle, symbol.as_ptr()) };
        if address.is_null() {
            let reason = dl_error();
            // SAFETY: handle came from dlopen and is not used afterwards.
            unsafe { libc::dlclose(handle) };
            return Err(fail(reason));
        }
        // SAFETY: the C emitter writes `Dynamic` with exactly this signature.
        let dynamic: DynamicFn = unsafe { std::mem::transmute::<*mut c_void, DynamicFn>(address) };
        info!("Loaded compiled model from {}", path.display());
        Ok(Self { handle, dynamic, shape, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path { &self.path }
}

impl Drop for LibraryEvaluator {
    fn drop(&mut self) {
        // SAFETY: handle came from a successful dlopen.
        unsafe { libc::dlclose(self.handle) };
    }
}

fn out_ptr(buf: &mut Option<Vec<f64>>) -> *mut f64 {
    match buf {
        Some(v) => v.as_mut_ptr(),
        None => ptr::null_mut(),
    }
}

impl Evaluator for LibraryEvaluator {
    fn shape(&self) -> &EvaluatorShape { &self.shape }

    fn evaluate(&self, inputs: &EvalInputs, outputs: &mut EvalOutputs) -> Result<()> {
        self.shape.validate(inputs)?;
        self.shape.prepare(outputs);
        let rows = c_int::try_from(inputs.x.rows()).map_err(|_| ModelError::size("x rows", c_int::MAX as usize, inputs.x.rows()))?;
        let it = c_int::try_from(inputs.it).map_err(|_| ModelError::size("it", c_int::MAX as usize, inputs.it))?;
        // SAFETY: every buffer was sized against the shape the library was generated with.
        unsafe {
            (self.dynamic)(
                inputs.y.as_ptr(),
                inputs.x.as_slice().as_ptr(),
                rows,
                inputs.params.as_ptr(),
                inputs.steady_state.as_ptr(),
                it,
                outputs.residual.as_mut_ptr(),
                out_ptr(&mut outputs.g1),
                out_ptr(&mut outputs.g2),
                out_ptr(&mut outputs.g3),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library_is_a_load_failure() {
        let result = LibraryEvaluator::load(Path::new("/nonexistent/libmodel.so"), EvaluatorShape::default());
        match result {
            Err(ModelError::LoadFailure { path, .. }) => assert_eq!(path, PathBuf::from("/nonexistent/libmodel.so")),
            _ => panic!("expected a load failure"),
        }
    }
}
