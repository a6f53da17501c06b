//! Strips this module's own path out of the inherited `LD_AUDIT` value for
//! the duration of the captive search-helper subprocess, then puts it back.
//!
//! `LD_AUDIT` is inherited by children. Left untouched, the helper process
//! would load under the same audit module that just spawned it and
//! recursively resolve itself. Editing the value via `setenv` would relocate
//! the string and strand any other pointer already taken into the original
//! (the one the loader itself may be holding); instead this mutates the live
//! environment string in place, exactly the way the original C module does.

use std::ffi::{c_char, CStr};

use cuda_autocompat_core::path_utils::path_filename;
use cuda_autocompat_core::path_utils::PATH_MAX;
use cuda_autocompat_core::self_locate::path_to_self;

/// Holds the bytes this sanitizer displaced, so [`restore`] can put them
/// back. `None` means no sanitization is currently active (either nothing
/// needed stripping, or the attempt failed).
pub struct Backup {
    data: [u8; PATH_MAX],
    slot: *mut c_char,
    slot_len: usize,
    trailing_len: usize,
}

/// Removes the first `LD_AUDIT` entry matching our own basename, returning a
/// backup to pass to [`restore`]. Returns `None` if `LD_AUDIT` is unset, our
/// own path can't be determined, or no entry matches.
pub fn sanitize() -> Option<Backup> {
    // SAFETY: the pointer is used only to read and then locally mutate the
    // bytes of this one environment entry, before anything else in this
    // single-threaded bootstrap context has a chance to touch it.
    let ld_audit_ptr = unsafe { cuda_autocompat_core::env::secure_getenv_ptr("LD_AUDIT") }?;

    let self_path = path_to_self()?;
    let self_str = self_path.to_string_lossy();
    let self_fname = path_filename(&self_str);
    if self_fname.is_empty() {
        return None;
    }

    // SAFETY: ld_audit_ptr is a live, NUL-terminated string owned by the
    // process environment block.
    let ld_audit = unsafe { CStr::from_ptr(ld_audit_ptr) }.to_str().ok()?;

    let mut offset = 0usize;
    let mut cursor = ld_audit;
    while !cursor.is_empty() {
        let (token, rest) = match cursor.find(':') {
            Some(idx) => (&cursor[..idx], &cursor[idx + 1..]),
            None => (cursor, ""),
        };

        if token.len() >= self_fname.len() {
            let token_fname = path_filename(token);
            if token_fname == self_fname {
                let slot_len = ld_audit.len() - rest.len() - offset;
                // SAFETY: slot points `offset` bytes into the live string;
                // the entry plus its trailing delimiter fits within the
                // string's own length, so this stays in bounds.
                unsafe {
                    return Some(apply(ld_audit_ptr.add(offset), slot_len));
                }
            }
        }

        offset += token.len() + 1;
        cursor = rest;
    }

    None
}

/// # Safety
/// `slot` must point `slot_len` readable/writable bytes into the live
/// `LD_AUDIT` string, immediately followed by its (possibly empty) trailing
/// tail up to the terminating NUL.
unsafe fn apply(slot: *mut c_char, slot_len: usize) -> Backup {
    let mut data = [0u8; PATH_MAX];
    let slot_bytes = std::slice::from_raw_parts(slot as *const u8, slot_len);
    data[..slot_len].copy_from_slice(slot_bytes);

    let tail_start = slot.add(slot_len);
    let trailing_len = CStr::from_ptr(tail_start).to_bytes().len();

    std::ptr::copy(tail_start, slot, trailing_len);
    // The displaced region spans `slot_len` (old entry) + `trailing_len`
    // (old tail) + 1 (NUL) bytes from `slot`; the tail now occupies the
    // first `trailing_len` of those, so the old entry's `slot_len` bytes
    // starting right after it are exactly what's left to zero.
    std::ptr::write_bytes(slot.add(trailing_len), 0, slot_len);

    Backup {
        data,
        slot,
        slot_len,
        trailing_len,
    }
}

/// Undoes [`sanitize`], restoring the original bytes and live string layout.
pub fn restore(backup: Backup) {
    // SAFETY: `backup.slot` was produced by `sanitize` from a still-live
    // environment string that nothing else has touched in between, per this
    // module's single-active-bracket invariant.
    unsafe {
        std::ptr::copy(
            backup.slot,
            backup.slot.add(backup.slot_len),
            backup.trailing_len,
        );
        std::ptr::copy_nonoverlapping(backup.data.as_ptr() as *const c_char, backup.slot, backup.slot_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `sanitize`/`restore` operate on the real process environment block, so
    // they are exercised against a synthetic in-memory buffer here rather
    // than against `std::env`, keeping the test free of global state races.
    #[test]
    fn apply_and_restore_round_trips_a_synthetic_buffer() {
        let mut buf = b"/opt/self/libaudit.so:/other/thing.so\0".to_vec();
        let self_entry_len = "/opt/self/libaudit.so:".len();
        let ptr = buf.as_mut_ptr() as *mut c_char;

        let backup = unsafe { apply(ptr, self_entry_len) };
        let remaining = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap();
        assert_eq!(remaining, "/other/thing.so");

        restore(backup);
        let restored = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap();
        assert_eq!(restored, "/opt/self/libaudit.so:/other/thing.so");
    }
}
