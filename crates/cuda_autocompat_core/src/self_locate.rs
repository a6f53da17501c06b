//! Resolves the on-disk path of the object (executable or shared object)
//! that statically links this crate in, via `dladdr` on the address of a
//! marker symbol defined here. Since this crate is always statically linked
//! (as an rlib) into its caller's final artifact, the marker symbol's
//! address always belongs to that artifact, never to `cuda_autocompat_core`
//! as a standalone object.

use std::ffi::CStr;
use std::path::PathBuf;

use once_cell::sync::OnceCell;

/// Address-only marker; never read, only taken.
#[used]
static SELF_MARKER: u8 = 0;

static SELF_PATH: OnceCell<Option<PathBuf>> = OnceCell::new();

/// Returns the path the dynamic linker used to load the calling artifact,
/// cached after the first successful lookup. `None` if `dladdr` fails.
pub fn path_to_self() -> Option<&'static PathBuf> {
    SELF_PATH
        .get_or_init(|| {
            let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
            let addr = std::ptr::addr_of!(SELF_MARKER) as *const std::ffi::c_void;
            // SAFETY: addr is a valid pointer into static storage of the
            // calling artifact; info is a plain out-parameter.
            let rc = unsafe { libc::dladdr(addr, &mut info) };
            if rc == 0 || info.dli_fname.is_null() {
                return None;
            }
            // SAFETY: a successful dladdr call guarantees a NUL-terminated
            // dli_fname valid for the lifetime of the process.
            let fname = unsafe { CStr::from_ptr(info.dli_fname) };
            Some(PathBuf::from(fname.to_string_lossy().into_owned()))
        })
        .as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_to_some_existing_path() {
        let path = path_to_self().expect("dladdr should resolve the test binary's own path");
        assert!(path.exists());
    }

    #[test]
    fn is_cached_across_calls() {
        let first = path_to_self().cloned();
        let second = path_to_self().cloned();
        assert_eq!(first, second);
    }
}
