//! An alternative to the `LD_AUDIT` interposer: a `cdylib` that, once it is
//! itself loaded (typically by being named directly as one of the process's
//! own shared library dependencies), runs the search engine in-process and
//! eagerly `dlopen`s the winning driver and its siblings with global symbol
//! visibility, so that the process's own unresolved `libcuda.so.1` imports
//! bind against them. Unlike the audit interposer this never spawns the
//! search helper as a subprocess — there is no recursive-self-load hazard to
//! sanitize an environment variable against, since this module never appears
//! in `LD_AUDIT` in the first place.
//!
//! Runs entirely inside library constructor/destructor hooks ("IFUNC-style"
//! in the sense that, like glibc's own `DT_GNU_IFUNC` resolvers, this code
//! executes before the rest of the process's static initializers), which is
//! why module state here is a bare `static mut` rather than something
//! requiring a running allocator-aware runtime: nothing else in the process
//! is executing concurrently with these hooks.

use ctor::{ctor, dtor};

use cuda_autocompat_core::default_path::default_search_paths;
use cuda_autocompat_core::dylib::DlLibrary;
use cuda_autocompat_core::search::{self, SearchState};
use cuda_autocompat_core::{log_error, log_info, log_verbose};

/// The published half of the self-reference sentinel (§9): the search
/// engine's probe step (`cuda_autocompat_core::search`) looks this data
/// symbol up by name and disqualifies any candidate that exports it, so that
/// this module's own preload build can never be selected as a driver to load
/// from. The value carries no meaning; only its presence is checked.
#[no_mangle]
#[allow(non_upper_case_globals)]
pub static cuda_autocompat_version: std::os::raw::c_int = 0;

/// Load order matters: each later library may depend on symbols the earlier
/// ones already made globally visible. `libcudadebugger.so.1` is
/// deliberately absent here even though the search engine's sibling check
/// requires it to exist on disk (see the matching comment in
/// `cuda_autocompat_core::search`) — it is optional at load time, mandatory
/// only as evidence that a candidate directory is a complete driver install.
const PRELOAD_ORDER: [&str; 3] = [
    "libcuda.so.1",
    "libnvidia-nvvm.so.4",
    "libnvidia-ptxjitcompiler.so.1",
];

// SAFETY: populated only by `on_load` and drained only by `on_unload`, which
// run at library construction/destruction — points in the process lifecycle
// where nothing else in this module is executing concurrently.
static mut HANDLES: Option<Vec<DlLibrary>> = None;

fn load_driver_libs() -> Option<Vec<DlLibrary>> {
    log_info!("Loading driver libs");

    let mut state = SearchState::new();
    let paths = default_search_paths().unwrap_or_default();
    search::search(&[], &paths, &mut state);

    let found = state.found?;
    log_info!("Selected {} ({})", found.driver_dir.display(), found.version);

    let mut opened = Vec::with_capacity(PRELOAD_ORDER.len());
    for soname in PRELOAD_ORDER {
        let path = found.driver_dir.join(soname);
        log_verbose!("{}", path.display());
        let lib = DlLibrary::open_global(&path);
        if !lib.is_open() {
            log_error!(
                "Error loading {soname}: {}",
                lib.last_error().unwrap_or("unknown dlopen failure")
            );
            opened.push(lib);
            opened.reverse();
            drop(opened);
            return None;
        }
        opened.push(lib);
    }

    Some(opened)
}

/// Closes `handles` in the reverse of their acquisition order, matching the
/// dependency chain they were opened in.
fn unload_driver_libs(mut handles: Vec<DlLibrary>) {
    log_info!("Unloading driver libs");
    handles.reverse();
    drop(handles);
}

#[ctor]
fn on_load() {
    log_info!(
        "CUDA AutoCompat v{} (libcuda IFUNC interface)",
        env!("CARGO_PKG_VERSION")
    );

    match load_driver_libs() {
        Some(handles) => {
            // SAFETY: see the invariant documented on `HANDLES`.
            unsafe {
                HANDLES = Some(handles);
            }
        }
        None => {
            log_error!("No suitable libcuda.so.1 found");
            std::process::exit(1);
        }
    }
}

#[dtor]
fn on_unload() {
    // SAFETY: see the invariant documented on `HANDLES`.
    let handles = unsafe { HANDLES.take() };
    if let Some(handles) = handles {
        unload_driver_libs(handles);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preload_order_excludes_the_debugger_library() {
        assert!(!PRELOAD_ORDER.contains(&"libcudadebugger.so.1"));
        assert_eq!(PRELOAD_ORDER[0], "libcuda.so.1");
        assert_eq!(PRELOAD_ORDER.len(), 3);
    }

    #[test]
    fn unloading_an_empty_handle_list_does_not_panic() {
        unload_driver_libs(Vec::new());
    }
}
