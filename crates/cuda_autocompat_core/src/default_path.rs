//! Queries the dynamic linker for its own configured default search
//! directories, for use when the caller supplied no `-p`/`--search-path` at
//! any recursion level of argument parsing.

use std::ffi::{c_char, c_void, CStr};
use std::os::raw::{c_int, c_uint};
use std::path::PathBuf;

use tracing::instrument;

use crate::log_warn;

// glibc's <dlfcn.h> RTLD_DI_* request codes; not all are exposed by the
// `libc` crate across targets, so they're declared directly here.
const RTLD_DI_SERINFO: c_int = 4;
const RTLD_DI_SERINFOSIZE: c_int = 5;

#[repr(C)]
struct DlSerpath {
    dls_name: *const c_char,
    dls_flags: c_uint,
}

#[repr(C)]
struct DlSerinfoHeader {
    dls_size: usize,
    dls_cnt: c_uint,
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// Returns the dynamic linker's default search path list for the current
/// process, or `None` if the loader query failed, which callers treat as
/// "no defaults available".
#[instrument(level = "info")]
pub fn default_search_paths() -> Option<Vec<PathBuf>> {
    // SAFETY: a NULL filename handle to dlopen returns a handle to the main
    // program itself, which is always valid to query and never needs closing
    // via our usual dlclose discipline (the loader owns it for the process
    // lifetime).
    let handle = unsafe { libc::dlopen(std::ptr::null(), libc::RTLD_LAZY) };
    if handle.is_null() {
        log_warn!("dlopen(NULL) failed while probing default search paths");
        return None;
    }

    let mut size_probe = DlSerinfoHeader {
        dls_size: 0,
        dls_cnt: 0,
    };
    // SAFETY: size_probe is a valid, uniquely-owned buffer whose first two
    // members match the layout glibc expects for this request.
    let rc = unsafe {
        libc::dlinfo(
            handle,
            RTLD_DI_SERINFOSIZE,
            &mut size_probe as *mut _ as *mut c_void,
        )
    };
    if rc != 0 {
        log_warn!("dlinfo(RTLD_DI_SERINFOSIZE) failed");
        return None;
    }

    let array_offset = round_up(
        std::mem::size_of::<DlSerinfoHeader>(),
        std::mem::align_of::<DlSerpath>(),
    );

    let mut buffer = vec![0u8; size_probe.dls_size];
    // SAFETY: buffer is exactly dls_size bytes, matching what the loader
    // asked for; we pre-fill the header fields it relies on as inputs.
    unsafe {
        let header = buffer.as_mut_ptr() as *mut DlSerinfoHeader;
        (*header).dls_size = size_probe.dls_size;
        (*header).dls_cnt = size_probe.dls_cnt;
    }

    // SAFETY: buffer is sized exactly as the loader requested and its header
    // fields are populated as required by RTLD_DI_SERINFO.
    let rc = unsafe {
        libc::dlinfo(
            handle,
            RTLD_DI_SERINFO,
            buffer.as_mut_ptr() as *mut c_void,
        )
    };
    if rc != 0 {
        log_warn!("dlinfo(RTLD_DI_SERINFO) failed");
        return None;
    }

    let mut paths = Vec::with_capacity(size_probe.dls_cnt as usize);
    for i in 0..size_probe.dls_cnt as usize {
        let entry_offset = array_offset + i * std::mem::size_of::<DlSerpath>();
        if entry_offset + std::mem::size_of::<DlSerpath>() > buffer.len() {
            break;
        }
        // SAFETY: entry_offset was just bounds-checked against buffer.len(),
        // and the loader populated dls_cnt contiguous DlSerpath entries
        // starting at array_offset.
        let entry = unsafe { &*(buffer.as_ptr().add(entry_offset) as *const DlSerpath) };
        if entry.dls_name.is_null() {
            continue;
        }
        // SAFETY: a non-null dls_name is a NUL-terminated string owned by
        // the loader, valid for the lifetime of this buffer's query.
        let name = unsafe { CStr::from_ptr(entry.dls_name) };
        paths.push(PathBuf::from(name.to_string_lossy().into_owned()));
    }

    Some(paths)
}
