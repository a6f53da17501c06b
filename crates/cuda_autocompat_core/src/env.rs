//! A `secure_getenv`-equivalent environment accessor.
//!
//! Every environment variable this crate reads (`CUDA_HOME`,
//! `CUDA_AUTOCOMPAT_VERBOSE`, `LD_AUDIT`, `PATH`) goes through here rather
//! than `std::env::var`, so that the whole module is inert (returns nothing)
//! when the process is running set-user-ID or set-group-ID, exactly as glibc's
//! `secure_getenv` is for ordinary libc callers.

use std::ffi::{c_char, CStr, CString};

extern "C" {
    // glibc extension; returns NULL for every variable when the process is
    // running under an elevated/altered privilege boundary (AT_SECURE).
    fn secure_getenv(name: *const c_char) -> *mut c_char;
}

/// Reads `name` via `secure_getenv`, returning `None` if unset or if the
/// process is running with elevated privileges.
pub fn secure_env_var(name: &str) -> Option<String> {
    let c_name = CString::new(name).ok()?;
    // SAFETY: c_name is NUL-terminated and outlives the call; the returned
    // pointer, if non-null, points into the process environment block and is
    // valid to read as a NUL-terminated string until the environment changes.
    let ptr = unsafe { secure_getenv(c_name.as_ptr()) };
    if ptr.is_null() {
        return None;
    }
    // SAFETY: see above.
    let value = unsafe { CStr::from_ptr(ptr) };
    Some(value.to_string_lossy().into_owned())
}

/// Like [`secure_env_var`], but returns the raw pointer `secure_getenv` gave
/// back instead of copying it out. On glibc this points directly into the
/// live environment block (the `KEY=value` string `execve` set up), not a
/// copy, which the `LD_AUDIT` sanitizer relies on to edit that string in
/// place without invalidating other holders of the same pointer.
///
/// # Safety
/// The returned pointer is valid only as long as nothing calls `setenv`,
/// `putenv`, or `unsetenv` on `name` (or reallocates the environment array)
/// in the meantime.
pub unsafe fn secure_getenv_ptr(name: &str) -> Option<*mut c_char> {
    let c_name = CString::new(name).ok()?;
    let ptr = secure_getenv(c_name.as_ptr());
    if ptr.is_null() {
        None
    } else {
        Some(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variable_is_none() {
        assert!(secure_env_var("CUDA_AUTOCOMPAT_DEFINITELY_UNSET_VAR_XYZ").is_none());
    }
}
