//! The rtld-audit interposer: the `cdylib` a CUDA-linked process loads via
//! `LD_AUDIT` so that the dynamic linker's own name resolution is rewritten
//! to point at the best driver this host has to offer.
//!
//! glibc calls into a handful of `la_*` entry points by symbol name (see
//! `dlopen(3)`'s "Dynamic Linker Audit Interface"); none of them are declared
//! in any header this crate links against, so their signatures here are the
//! contract itself; all three run on the loader's own single thread before
//! any other library's code executes, which is what makes the `static mut`
//! module state below sound without further synchronization.

mod helper_invoker;
mod sanitizer;

use std::ffi::CStr;
use std::os::raw::{c_char, c_long, c_uint};
use std::path::{Path, PathBuf};

use cuda_autocompat_core::link_map::LinkMap;
use cuda_autocompat_core::path_utils::{path_join, FixedPath};
use cuda_autocompat_core::{log_error, log_info, TRACKED_LIBRARIES};

/// The rtld-audit ABI version this module was built against. glibc's own
/// `<link.h>` defines `LAV_CURRENT` as `1`; there has never been a second
/// revision of the interface.
const LAV_CURRENT: c_uint = 1;

/// Flags `la_objopen` can request via its return value, from `<bits/link.h>`.
/// Unused here beyond the `Open question` discussed in `DESIGN.md`: this
/// module returns them once eagerly for every tracked library rather than
/// ever hooking the finer-grained symbol-bind callbacks they'd enable.
const LA_FLG_BINDTO: c_uint = 0x1;
const LA_FLG_BINDFROM: c_uint = 0x2;

/// The published half of the self-reference sentinel (§9): the search
/// helper this module spawns (`cuda_autocompat_core::search`) looks this
/// data symbol up by name and disqualifies any candidate that exports it,
/// so that an audited process's own audit module can never be selected as a
/// driver to load from. The value carries no meaning; only its presence is
/// checked.
#[no_mangle]
#[allow(non_upper_case_globals)]
pub static cuda_autocompat_version: std::os::raw::c_int = 0;

/// Module-scope state threaded through the three audit callbacks: one fixed
/// path buffer per tracked library, populated all-or-nothing by
/// [`la_version`]. `initialized` is `false` until every buffer is filled,
/// which is what lets [`la_objsearch`]/[`la_objopen`] treat "helper failed"
/// as "disabled" rather than risk matching against stale or partial paths.
struct AuditState {
    paths: [FixedPath; 4],
    initialized: bool,
}

impl AuditState {
    const fn new() -> Self {
        Self {
            paths: [FixedPath::new(), FixedPath::new(), FixedPath::new(), FixedPath::new()],
            initialized: false,
        }
    }
}

// SAFETY: every access to this state happens from the dynamic linker's own
// audit callbacks, which glibc invokes strictly serially on the thread that
// is loading the process — there is no concurrent caller to race against.
static mut AUDIT_STATE: AuditState = AuditState::new();

fn locate_driver_dir() -> Option<PathBuf> {
    let helper_path = helper_invoker::find_search_helper()?;
    helper_invoker::run_search_helper(&helper_path)
}

/// Populates `state.paths` from `driver_dir`, all four or none. Returns
/// `false` (leaving every buffer cleared) if any single join would overflow
/// `PATH_MAX`, which is the only way [`path_join`] can fail here.
fn fill_paths(state: &mut AuditState, driver_dir: &Path) -> bool {
    let dir_str = driver_dir.to_string_lossy();
    for (buf, soname) in state.paths.iter_mut().zip(TRACKED_LIBRARIES) {
        if path_join(buf, &dir_str, soname).is_err() {
            log_error!("path for {soname} would exceed PATH_MAX under {dir_str}");
            return false;
        }
    }
    true
}

/// Called once, before any other library in the process loads. Resolves the
/// winning driver directory via the out-of-process search helper and joins
/// it with each tracked library's basename into the module's static path
/// buffers. On any failure the buffers are left empty, and subsequent
/// `la_objsearch`/`la_objopen` calls pass every request straight through,
/// leaving the process exactly as it would have loaded without this module.
///
/// # Safety
/// Called directly by the dynamic linker per the rtld-audit ABI; must be
/// exported under this exact symbol name with C calling convention.
#[no_mangle]
pub unsafe extern "C" fn la_version(_version: c_uint) -> c_uint {
    let state = &mut AUDIT_STATE;
    for buf in state.paths.iter_mut() {
        buf.clear();
    }
    state.initialized = false;

    let backup = sanitizer::sanitize();
    let driver_dir = locate_driver_dir();
    match driver_dir {
        Some(dir) => {
            log_info!("Selected {}", dir.display());
            state.initialized = fill_paths(state, &dir);
        }
        None => {
            log_error!("Failed to locate a usable libcuda.so.1; passing library loads through unmodified");
        }
    }
    if let Some(backup) = backup {
        sanitizer::restore(backup);
    }

    LAV_CURRENT
}

/// Called by the loader for every load-by-name. If initialization succeeded
/// and `name` exactly matches one of the four tracked basenames, returns the
/// corresponding precomputed absolute path instead; otherwise returns `name`
/// unchanged, which is the loader's convention for "no rewrite".
///
/// # Safety
/// Called directly by the dynamic linker with a NUL-terminated `name` valid
/// for the duration of this call; must be exported under this exact symbol
/// name with C calling convention.
#[no_mangle]
pub unsafe extern "C" fn la_objsearch(
    name: *const c_char,
    _cookie: *mut usize,
    _flag: c_uint,
) -> *mut c_char {
    if name.is_null() {
        return name as *mut c_char;
    }

    let state = &AUDIT_STATE;
    if state.initialized {
        if let Ok(requested) = CStr::from_ptr(name).to_str() {
            for (buf, soname) in state.paths.iter().zip(TRACKED_LIBRARIES) {
                if requested == soname {
                    return buf.as_ptr() as *mut c_char;
                }
            }
        }
    }

    name as *mut c_char
}

/// Called by the loader for every object it has just loaded (including ones
/// whose path it resolved on its own, without consulting
/// [`la_objsearch`]). If the loaded path is prefix-matched by one of the
/// four tracked paths, requests full bind-to/bind-from auditing on it; this
/// codebase does not act on that further auditing today, so the flags are
/// requested defensively and never exercised by a symbol-bind callback.
///
/// # Safety
/// Called directly by the dynamic linker with a valid `map` for the
/// duration of this call; must be exported under this exact symbol name
/// with C calling convention.
#[no_mangle]
pub unsafe extern "C" fn la_objopen(
    map: *mut LinkMap,
    _lmid: c_long,
    _cookie: *mut usize,
) -> c_uint {
    let Some(map) = map.as_ref() else {
        return 0;
    };
    if map.l_name.is_null() {
        return 0;
    }
    let name = CStr::from_ptr(map.l_name).to_bytes();
    if name.is_empty() {
        return 0;
    }

    let state = &AUDIT_STATE;
    if state.initialized {
        for buf in state.paths.iter() {
            let tracked = buf.as_bytes();
            if !tracked.is_empty() && name.starts_with(tracked) {
                return LA_FLG_BINDTO | LA_FLG_BINDFROM;
            }
        }
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_paths_populates_every_tracked_basename() {
        let mut state = AuditState::new();
        assert!(fill_paths(&mut state, &PathBuf::from("/opt/driver")));
        for (buf, soname) in state.paths.iter().zip(TRACKED_LIBRARIES) {
            assert_eq!(buf.as_str(), format!("/opt/driver/{soname}"));
        }
    }

    #[test]
    fn uninitialized_state_matches_nothing() {
        let state = AuditState::new();
        assert!(!state.initialized);
        for buf in state.paths.iter() {
            assert!(buf.is_empty());
        }
    }
}
