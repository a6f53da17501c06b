//! A scoped, non-copyable, non-movable shared-library handle.
//!
//! Crates like `libloading` cover typed symbol lookup well, but none expose a
//! way to ask the loader for the canonical path it actually resolved a handle
//! to (`dlinfo`, `RTLD_DI_LINKMAP`), which the search engine's directory-path
//! cache needs in order to dedup candidates by their real, fully-resolved
//! location. This wrapper therefore goes straight to `libc`'s
//! `dlopen`/`dlsym`/`dlclose`/`dlinfo`.

use std::ffi::{c_void, CStr, CString};
use std::path::Path;

use crate::link_map::LinkMap;
use crate::log_trace;

/// A scoped `dlopen` handle. Dropping it closes the handle exactly once.
/// Neither `Clone` nor movable-by-value semantics apply: cloning would create
/// two owners of one `dlclose`, so this type is intentionally left
/// non-`Clone` and accessed only by reference or via `Option<DlLibrary>`.
pub struct DlLibrary {
    handle: *mut c_void,
    last_error: Option<String>,
}

// The handle is an opaque, loader-managed resource; nothing here mutates
// global state beyond what dlopen/dlsym/dlclose already serialize internally.
unsafe impl Send for DlLibrary {}

impl DlLibrary {
    /// Opens `path` with lazy binding and local symbol visibility.
    pub fn open(path: &Path) -> Self {
        let mut lib = DlLibrary {
            handle: std::ptr::null_mut(),
            last_error: None,
        };
        lib.open_with_flags(path, libc::RTLD_LAZY | libc::RTLD_LOCAL);
        lib
    }

    /// Opens `path` with lazy binding and *global* symbol visibility, so that
    /// later `dlopen`s of dependent libraries can resolve symbols through it.
    /// Used only by the driver-library preloader (§4.11); every other
    /// consumer of this wrapper only ever probes a candidate in isolation and
    /// wants `open`'s local visibility instead.
    pub fn open_global(path: &Path) -> Self {
        let mut lib = DlLibrary {
            handle: std::ptr::null_mut(),
            last_error: None,
        };
        lib.open_with_flags(path, libc::RTLD_LAZY | libc::RTLD_GLOBAL);
        lib
    }

    fn open_with_flags(&mut self, path: &Path, flags: i32) -> bool {
        log_trace!("dlopen({})", path.display());
        let Ok(c_path) = CString::new(path.as_os_str().to_string_lossy().as_bytes()) else {
            self.last_error = Some("path contains an interior NUL byte".to_string());
            return false;
        };
        // SAFETY: c_path is a valid, NUL-terminated C string for the duration
        // of this call.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), flags) };
        if handle.is_null() {
            self.last_error = Some(dl_error());
            log_trace!("{}", self.last_error.as_deref().unwrap_or(""));
            return false;
        }
        self.handle = handle;
        true
    }

    pub fn is_open(&self) -> bool {
        !self.handle.is_null()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// The loader's own idea of this handle's resolved path, via
    /// `dlinfo(RTLD_DI_LINKMAP)`. `None` if the handle is closed or the
    /// query fails.
    pub fn path(&self) -> Option<String> {
        if self.handle.is_null() {
            return None;
        }
        log_trace!("dlinfo(handle, RTLD_DI_LINKMAP)");
        let mut map: *const LinkMap = std::ptr::null();
        // SAFETY: handle is a live dlopen handle; map receives a pointer
        // owned by the loader that remains valid for the handle's lifetime.
        let rc = unsafe {
            libc::dlinfo(
                self.handle,
                libc::RTLD_DI_LINKMAP,
                &mut map as *mut _ as *mut c_void,
            )
        };
        if rc != 0 || map.is_null() {
            return None;
        }
        // SAFETY: a non-null link_map from a successful dlinfo call has a
        // valid, NUL-terminated l_name for the lifetime of the handle.
        let name = unsafe { CStr::from_ptr((*map).l_name) };
        Some(name.to_string_lossy().into_owned())
    }

    /// Looks up a data symbol, returning `None` if absent. Non-fatal by
    /// design: callers treat `None` as "absent", not an error.
    ///
    /// # Safety
    /// The caller must know the actual type of the symbol at `name`.
    pub unsafe fn data_symbol<T>(&self, name: &str) -> Option<*const T> {
        self.symbol_pointer(name).map(|p| p as *const T)
    }

    /// Looks up a function symbol, returning `None` if absent.
    ///
    /// # Safety
    /// The caller must know the actual signature of the symbol at `name`.
    pub unsafe fn function_symbol<F: Copy>(&self, name: &str) -> Option<F> {
        let ptr = self.symbol_pointer(name)?;
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*mut c_void>());
        let union_ptr = &ptr as *const *mut c_void as *const F;
        Some(*union_ptr)
    }

    fn symbol_pointer(&self, name: &str) -> Option<*mut c_void> {
        if self.handle.is_null() {
            return None;
        }
        log_trace!("dlsym({name})");
        let Ok(c_name) = CString::new(name) else {
            return None;
        };
        // SAFETY: handle is a live dlopen handle; c_name is NUL-terminated.
        let sym = unsafe { libc::dlsym(self.handle, c_name.as_ptr()) };
        if sym.is_null() {
            None
        } else {
            Some(sym)
        }
    }
}

impl Drop for DlLibrary {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            log_trace!("dlclose(handle)");
            // SAFETY: handle was returned by a successful dlopen and has not
            // already been closed.
            if unsafe { libc::dlclose(self.handle) } != 0 {
                self.last_error = Some(dl_error());
                log_trace!("{}", self.last_error.as_deref().unwrap_or(""));
            }
            self.handle = std::ptr::null_mut();
        }
    }
}

fn dl_error() -> String {
    // SAFETY: dlerror returns either NULL or a pointer to a static,
    // NUL-terminated message valid until the next dl* call.
    unsafe {
        let ptr = libc::dlerror();
        if ptr.is_null() {
            String::new()
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn opening_a_nonexistent_library_fails_without_panicking() {
        let lib = DlLibrary::open(&PathBuf::from("/nonexistent/libtotallybogus.so.1"));
        assert!(!lib.is_open());
        assert!(lib.last_error().is_some());
        assert!(lib.path().is_none());
    }

    #[test]
    fn missing_symbol_lookup_is_none_not_an_error() {
        let lib = DlLibrary::open(&PathBuf::from("/nonexistent/libtotallybogus.so.1"));
        // SAFETY: test-only probe of a type that will never actually be read.
        let sym = unsafe { lib.data_symbol::<i32>("anything") };
        assert!(sym.is_none());
    }
}
