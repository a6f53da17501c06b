//! The driver search engine: five pipeline operations over a [`SearchState`]
//! that together discover, probe, and rank every plausible `libcuda.so.1` on
//! the host.

use std::collections::{HashMap, HashSet};
use std::ffi::c_int;
use std::fs;
use std::mem::MaybeUninit;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::instrument;

use crate::cuda_abi::{
    CuDriverGetVersionFn, CuGetErrorNameFn, CuGetErrorStringFn, FN_DRIVER_GET_VERSION,
    FN_GET_ERROR_NAME, FN_GET_ERROR_STRING, SENTINEL_SYMBOL,
};
use crate::dylib::DlLibrary;
use crate::env::secure_env_var;
use crate::version::DriverVersion;
use crate::{log_debug, log_info, log_trace, log_verbose};

const LIBCUDA_SONAME: &str = "libcuda.so.1";
// libcudadebugger.so.1 is mandatory here (a candidate missing it is rejected)
// even though the preloader crate's load order currently leaves it disabled;
// see the matching comment over there.
const REQUIRED_SIBLINGS: [&str; 3] = [
    "libnvidia-nvvm.so.4",
    "libnvidia-ptxjitcompiler.so.1",
    "libcudadebugger.so.1",
];
const LIBCUDART_SONAMES: [&str; 3] = ["libcudart.so.11", "libcudart.so.12", "libcudart.so.13"];
const TOOLKIT_LIB_SUBDIR: &str = "targets/x86_64-linux/lib";

/// A probed version, or one of the reasons probing a candidate did not yield
/// one. Kept distinct from a raw negative integer so that "no version" can't
/// be mistaken for a version by later numeric comparison, the way the
/// original C++'s `-1`/`-2`/`-3`/`-4` sentinel-return convention could be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    Version(i32),
    StatError,
    IsDirectory,
    SelfReference,
    LibraryError,
}

impl ProbeOutcome {
    fn version(self) -> Option<i32> {
        match self {
            ProbeOutcome::Version(v) => Some(v),
            _ => None,
        }
    }

    fn cache_value(self) -> i32 {
        match self {
            ProbeOutcome::Version(v) => v,
            _ => -1,
        }
    }

    fn from_cache_value(v: i32) -> Self {
        if v >= 0 {
            ProbeOutcome::Version(v)
        } else {
            ProbeOutcome::LibraryError
        }
    }
}

/// The winning candidate: its driver version and the directory it lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub version: DriverVersion,
    pub driver_dir: PathBuf,
}

/// An append-only accumulator of search progress, shared across every
/// pipeline step so that duplicate directories and inodes are never probed
/// twice within one search.
#[derive(Default)]
pub struct SearchState {
    pub found: Option<SearchResult>,
    dir_path_cache: HashSet<PathBuf>,
    dir_inode_cache: HashSet<u64>,
    ver_cache: HashMap<u64, i32>,
}

impl SearchState {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_file_exists(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

/// Probes `libcuda_path` for its driver version, consulting and populating
/// the inode→version cache so the same file is never `dlopen`'d twice even
/// if reached through different paths.
fn probe_driver_version(libcuda_path: &Path, state: &mut SearchState) -> ProbeOutcome {
    log_trace!("stat({})", libcuda_path.display());
    let meta = match fs::metadata(libcuda_path) {
        Ok(m) => m,
        Err(e) => {
            log_trace!("{e}");
            return ProbeOutcome::StatError;
        }
    };
    if meta.is_dir() {
        return ProbeOutcome::IsDirectory;
    }

    let ino = meta.ino();
    if let Some(cached) = state.ver_cache.get(&ino) {
        log_debug!("cached (inode = {ino})");
        return ProbeOutcome::from_cache_value(*cached);
    }

    let outcome = probe_driver_version_uncached(libcuda_path);
    state.ver_cache.insert(ino, outcome.cache_value());
    outcome
}

fn probe_driver_version_uncached(libcuda_path: &Path) -> ProbeOutcome {
    let lib = DlLibrary::open(libcuda_path);
    if !lib.is_open() {
        return ProbeOutcome::LibraryError;
    }

    // SAFETY: the sentinel, if present, is a plain `int` data symbol; we
    // never dereference it, only check for its existence.
    if unsafe { lib.data_symbol::<i32>(SENTINEL_SYMBOL) }.is_some() {
        return ProbeOutcome::SelfReference;
    }

    // SAFETY: each of these symbol types matches the CUDA driver C ABI
    // documented in cuda_abi.rs; the library was just opened above.
    let Some(cu_get_error_name) =
        (unsafe { lib.function_symbol::<CuGetErrorNameFn>(FN_GET_ERROR_NAME) })
    else {
        return ProbeOutcome::LibraryError;
    };
    let Some(cu_get_error_string) =
        (unsafe { lib.function_symbol::<CuGetErrorStringFn>(FN_GET_ERROR_STRING) })
    else {
        return ProbeOutcome::LibraryError;
    };
    let Some(cu_driver_get_version) =
        (unsafe { lib.function_symbol::<CuDriverGetVersionFn>(FN_DRIVER_GET_VERSION) })
    else {
        return ProbeOutcome::LibraryError;
    };

    let mut ver = MaybeUninit::<c_int>::uninit();
    // SAFETY: cu_driver_get_version is a valid CUDA entry point taking an
    // out-param pointer to a live c_int.
    let rc = unsafe { cu_driver_get_version(ver.as_mut_ptr()) };
    // SAFETY: initialized unconditionally by a successful driver call; on
    // failure the value is ignored below.
    let ver = unsafe { ver.assume_init() };

    if rc != 0 {
        log_cuda_error(rc, cu_get_error_name, cu_get_error_string);
        // The original implementation returns whatever landed in the
        // out-param even on failure; preserved here for behavioral fidelity
        // (a failing driver call conventionally leaves it untouched, which
        // downstream comparisons treat as simply a low/implausible version).
    }

    ProbeOutcome::Version(ver)
}

fn log_cuda_error(
    code: c_int,
    cu_get_error_name: CuGetErrorNameFn,
    cu_get_error_string: CuGetErrorStringFn,
) {
    let mut name_ptr = MaybeUninit::<*const std::os::raw::c_char>::uninit();
    let mut string_ptr = MaybeUninit::<*const std::os::raw::c_char>::uninit();
    // SAFETY: both functions are valid CUDA entry points taking an out-param
    // pointer to a live `const char *`.
    let name_ok = unsafe { cu_get_error_name(code, name_ptr.as_mut_ptr()) } == 0;
    let string_ok = unsafe { cu_get_error_string(code, string_ptr.as_mut_ptr()) } == 0;
    if name_ok && string_ok {
        // SAFETY: both calls succeeded, so both pointers reference static
        // NUL-terminated strings owned by the driver library.
        unsafe {
            let name = std::ffi::CStr::from_ptr(name_ptr.assume_init()).to_string_lossy();
            let string = std::ffi::CStr::from_ptr(string_ptr.assume_init()).to_string_lossy();
            log_trace!("cuDriverGetVersion: {name} ({string})");
        }
    } else {
        log_trace!("cuDriverGetVersion: {code}");
    }
}

/// The outcome of one [`update_libcuda`] attempt. Distinguished from a plain
/// bool so tests can tell "rejected outright" from "evaluated but lost the
/// version comparison" rather than collapsing both into a single failure
/// case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateOutcome {
    Updated,
    SkippedLowerVersion,
    Failed,
}

/// The update algorithm: the center of the search engine. Attempts to adopt
/// `libcuda_path` as the new best candidate.
#[instrument(level = "debug", skip(state), fields(path = %libcuda_path.display()))]
fn update_libcuda(libcuda_path: &Path, state: &mut SearchState) -> UpdateOutcome {
    log_info!("libcuda: {}", libcuda_path.display());

    let Some(libcuda_dir) = libcuda_path.parent() else {
        log_info!("libcuda: Skipping (no parent directory)");
        return UpdateOutcome::Failed;
    };

    if !state.dir_path_cache.insert(libcuda_dir.to_path_buf()) {
        log_info!("libcuda: Skipping (directory already checked)");
        return UpdateOutcome::Failed;
    }

    log_trace!("stat({})", libcuda_dir.display());
    let dir_meta = match fs::metadata(libcuda_dir) {
        Ok(m) => m,
        Err(e) => {
            log_trace!("{e}");
            log_info!("libcuda: Skipping (directory stat error)");
            return UpdateOutcome::Failed;
        }
    };
    if !dir_meta.is_dir() {
        log_info!("libcuda: Skipping (directory error)");
        return UpdateOutcome::Failed;
    }
    if !state.dir_inode_cache.insert(dir_meta.ino()) {
        log_debug!("cached (inode = {})", dir_meta.ino());
        log_info!("libcuda: Skipping (directory inode already checked)");
        return UpdateOutcome::Failed;
    }

    let ver = match probe_driver_version(libcuda_path, state) {
        ProbeOutcome::IsDirectory => {
            log_info!("libcuda: Skipping (directory)");
            return UpdateOutcome::Failed;
        }
        ProbeOutcome::StatError => {
            log_info!("libcuda: Skipping (stat error)");
            return UpdateOutcome::Failed;
        }
        ProbeOutcome::SelfReference => {
            log_info!("libcuda: Skipping (autocompat detected)");
            return UpdateOutcome::Failed;
        }
        ProbeOutcome::LibraryError => {
            log_info!("libcuda: Skipping (library error)");
            return UpdateOutcome::Failed;
        }
        ProbeOutcome::Version(v) => v,
    };

    for sibling in REQUIRED_SIBLINGS {
        if !check_file_exists(&libcuda_dir.join(sibling)) {
            log_info!("libcuda: Skipping ({sibling} not found)");
            return UpdateOutcome::Failed;
        }
    }

    log_info!("libcuda: cuDriverGetVersion = {ver}");

    let version = DriverVersion(ver);
    match &state.found {
        None => {
            log_info!("libcuda: Updating (first found)");
            state.found = Some(SearchResult {
                version,
                driver_dir: libcuda_dir.to_path_buf(),
            });
            UpdateOutcome::Updated
        }
        Some(best) if version > best.version => {
            log_info!("libcuda: Updating ({ver} > {})", best.version);
            state.found = Some(SearchResult {
                version,
                driver_dir: libcuda_dir.to_path_buf(),
            });
            UpdateOutcome::Updated
        }
        Some(best) => {
            log_info!("libcuda: Skipping ({ver} <= {})", best.version);
            UpdateOutcome::SkippedLowerVersion
        }
    }
}

/// Strips `suffix`'s components off the end of `full`, returning the
/// remaining prefix, or `None` if `full` does not end with `suffix`
/// component-for-component.
fn check_path_ends_with(mut full: &Path, suffix: &Path) -> Option<PathBuf> {
    let suffix_components: Vec<_> = suffix.components().collect();
    for component in suffix_components.into_iter().rev() {
        let full_last = full.file_name()?;
        if full_last != component.as_os_str() {
            return None;
        }
        full = full.parent()?;
    }
    Some(full.to_path_buf())
}

fn get_toolkit_from_libcudart(lib_path: &Path) -> Option<PathBuf> {
    let canonical = weakly_canonical(lib_path);
    let reallib_dir = canonical.parent()?;
    log_debug!("-> {}", reallib_dir.display());
    check_path_ends_with(reallib_dir, Path::new(TOOLKIT_LIB_SUBDIR))
}

/// `std::fs::canonicalize` that tolerates a path whose final components
/// don't yet exist, matching `std::filesystem::weakly_canonical`: canonicalize
/// the longest existing prefix and re-append whatever didn't resolve.
fn weakly_canonical(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        match fs::canonicalize(existing) {
            Ok(mut canon) => {
                for component in tail.iter().rev() {
                    canon.push(component);
                }
                return canon;
            }
            Err(_) => match existing.parent() {
                Some(parent) if !existing.as_os_str().is_empty() => {
                    if let Some(name) = existing.file_name() {
                        tail.push(name);
                    }
                    existing = parent;
                }
                _ => return path.to_path_buf(),
            },
        }
    }
}

/// §4.6 step 1: probe every user-provided `libcuda.so.1` entry for a direct
/// driver, keeping the best among them. "Stop on first success" (§4.6) gates
/// the *pipeline* as a whole — `search` below skips steps 2-5 once this step
/// has found anything — not this step's own loop: a user-supplied `--libs`
/// list legitimately names more than one toolkit's driver (§8 scenario 2),
/// and an early exit on the first entry that merely got far enough to be
/// evaluated (win or lose the version comparison) would silently ignore
/// every later entry, including a strictly newer one.
#[instrument(level = "info", skip(state), fields(libs = libs.len()))]
pub fn search_libraries_libcuda(libs: &[PathBuf], state: &mut SearchState) {
    log_info!("Searching for driver in libraries");
    for lib_path in libs {
        log_verbose!("{}", lib_path.display());
        if lib_path.file_name().map(|n| n == LIBCUDA_SONAME).unwrap_or(false) {
            update_libcuda(lib_path, state);
        }
    }
}

/// §4.6 step 2: probe user-provided library files for a toolkit runtime.
#[instrument(level = "info", skip(state), fields(libs = libs.len()))]
pub fn search_libraries_libcudart(libs: &[PathBuf], state: &mut SearchState) {
    log_info!("Searching for toolkits in libraries");
    for libcudart_path in libs {
        log_verbose!("{}", libcudart_path.display());
        let Some(fname) = libcudart_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !LIBCUDART_SONAMES.contains(&fname) {
            continue;
        }
        let Some(toolkit_dir) = get_toolkit_from_libcudart(libcudart_path) else {
            continue;
        };
        log_debug!("-> {}", toolkit_dir.display());
        let libcuda_path = toolkit_dir.join("compat").join(LIBCUDA_SONAME);
        update_libcuda(&libcuda_path, state);
    }
}

/// §4.6 step 3: probe `CUDA_HOME`.
#[instrument(level = "info", skip(state))]
pub fn search_cuda_home(state: &mut SearchState) {
    log_info!("Searching for toolkit in CUDA_HOME");
    let Some(cuda_home) = secure_env_var("CUDA_HOME") else {
        return;
    };
    let toolkit_dir = PathBuf::from(&cuda_home);
    log_verbose!("CUDA_HOME={}", toolkit_dir.display());

    let libcuda_path = toolkit_dir.join("compat").join(LIBCUDA_SONAME);
    if !check_file_exists(&libcuda_path) {
        return;
    }
    update_libcuda(&libcuda_path, state);
}

/// §4.6 step 4: probe search directories for toolkit runtimes.
#[instrument(level = "info", skip(state), fields(paths = paths.len()))]
pub fn search_paths_libcudart(paths: &[PathBuf], state: &mut SearchState) {
    log_info!("Searching for toolkits in library search path");
    for libcudart_dir in paths {
        log_verbose!("{}", libcudart_dir.display());
        for libcudart_fname in LIBCUDART_SONAMES {
            let libcudart_path = libcudart_dir.join(libcudart_fname);
            log_debug!("{}", libcudart_path.display());
            if !check_file_exists(&libcudart_path) {
                continue;
            }
            let Some(toolkit_dir) = get_toolkit_from_libcudart(&libcudart_path) else {
                continue;
            };
            log_debug!("-> {}", toolkit_dir.display());
            let libcuda_path = toolkit_dir.join("compat").join(LIBCUDA_SONAME);
            if check_file_exists(&libcuda_path) {
                update_libcuda(&libcuda_path, state);
            }
            break;
        }
    }
}

/// §4.6 step 5: probe search directories for a direct driver.
#[instrument(level = "info", skip(state), fields(paths = paths.len()))]
pub fn search_paths_libcuda(paths: &[PathBuf], state: &mut SearchState) {
    log_info!("Searching for driver in library search path");
    for lib_dir in paths {
        log_verbose!("{}", lib_dir.display());
        let lib_path = lib_dir.join(LIBCUDA_SONAME);
        log_debug!("{}", lib_path.display());
        if !check_file_exists(&lib_path) {
            continue;
        }
        update_libcuda(&lib_path, state);
    }
}

/// Runs the full canonical pipeline of §4.6: step 1 always runs first; steps
/// 2 through 5 only run as a group if step 1 left no candidate, matching the
/// helper executable's own orchestration rather than gating each step
/// individually.
#[instrument(level = "info", skip(state), fields(libs = libs.len(), paths = paths.len()))]
pub fn search(libs: &[PathBuf], paths: &[PathBuf], state: &mut SearchState) {
    search_libraries_libcuda(libs, state);
    if state.found.is_none() {
        search_libraries_libcudart(libs, state);
        search_cuda_home(state);
        search_paths_libcudart(paths, state);
        search_paths_libcuda(paths, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn write_stub_siblings(dir: &Path) {
        for sibling in REQUIRED_SIBLINGS {
            fs::write(dir.join(sibling), b"stub").unwrap();
        }
    }

    #[test]
    fn check_path_ends_with_strips_matching_suffix() {
        let full = Path::new("/toolkit/targets/x86_64-linux/lib");
        let suffix = Path::new("targets/x86_64-linux/lib");
        assert_eq!(
            check_path_ends_with(full, suffix),
            Some(PathBuf::from("/toolkit"))
        );
    }

    #[test]
    fn check_path_ends_with_rejects_nonmatching_suffix() {
        let full = Path::new("/toolkit/lib64");
        let suffix = Path::new("targets/x86_64-linux/lib");
        assert_eq!(check_path_ends_with(full, suffix), None);
    }

    #[test]
    fn unopenable_candidate_is_skipped_without_panicking() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("libcuda.so.1"), b"not a real library").unwrap();
        // siblings deliberately absent; the file also isn't a real ELF shared
        // object, so this exercises the dlopen-failure skip path.
        let mut state = SearchState::new();
        let outcome = update_libcuda(&tmp.path().join("libcuda.so.1"), &mut state);
        assert_eq!(outcome, UpdateOutcome::Failed);
        assert!(state.found.is_none());
    }

    #[test]
    fn same_directory_reached_twice_is_probed_once() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("libcuda.so.1"), b"not a real library").unwrap();
        write_stub_siblings(tmp.path());

        let alias = tmp.path().parent().unwrap().join("alias_of_target");
        symlink(tmp.path(), &alias).unwrap();

        let mut state = SearchState::new();
        update_libcuda(&tmp.path().join("libcuda.so.1"), &mut state);
        let outcome_again = update_libcuda(&alias.join("libcuda.so.1"), &mut state);

        assert_eq!(outcome_again, UpdateOutcome::Failed);
        assert_eq!(state.dir_inode_cache.len(), 1);

        let _ = fs::remove_file(&alias);
    }
}
