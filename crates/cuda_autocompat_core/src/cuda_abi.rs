//! The small slice of the CUDA driver C ABI this crate consumes. None of
//! these symbols are defined here; they are resolved at runtime out of a
//! candidate `libcuda.so.1` by the search engine's probe step.

use std::os::raw::{c_char, c_int};

pub type CuDriverGetVersionFn = unsafe extern "C" fn(*mut c_int) -> c_int;
pub type CuGetErrorNameFn = unsafe extern "C" fn(c_int, *mut *const c_char) -> c_int;
pub type CuGetErrorStringFn = unsafe extern "C" fn(c_int, *mut *const c_char) -> c_int;

/// If present, this data symbol marks a library as one of *our own* stub
/// builds rather than a real system driver, and disqualifies it as a
/// candidate to avoid the search engine recursively resolving itself. The
/// publishing half lives in `cuda_autocompat_preload` and
/// `cuda_autocompat_audit`, each of which exports a `#[no_mangle] pub static`
/// under this exact name.
pub const SENTINEL_SYMBOL: &str = "cuda_autocompat_version";

pub const FN_DRIVER_GET_VERSION: &str = "cuDriverGetVersion";
pub const FN_GET_ERROR_NAME: &str = "cuGetErrorName";
pub const FN_GET_ERROR_STRING: &str = "cuGetErrorString";
