//! Locates and runs the stand-alone `cuda-autocompat-search` helper as a
//! captive subprocess, the way the audit module resolves its driver
//! directory without carrying the search engine's own dependency footprint
//! into every audited process.

use std::path::{Path, PathBuf};
use std::process::Command;

use cuda_autocompat_core::path_utils::PATH_MAX;
use cuda_autocompat_core::self_locate::path_to_self;

const HELPER_EXE: &str = "cuda-autocompat-search";

/// Finds the sibling `cuda-autocompat-search` executable: first by deriving
/// `<prefix>/libexec/cuda-autocompat-search` from our own install prefix
/// (the ancestor directory named `lib`), then by falling back to a `PATH`
/// search if that doesn't exist or isn't executable.
pub fn find_search_helper() -> Option<PathBuf> {
    if let Some(self_path) = path_to_self() {
        let self_str = self_path.to_string_lossy();
        if let Some(prefix_end) =
            cuda_autocompat_core::path_utils::path_prefix(&self_str, "lib", false)
        {
            let prefix = &self_str[..prefix_end];
            let candidate = Path::new(prefix).join("libexec").join(HELPER_EXE);
            if is_executable(&candidate) {
                return Some(candidate);
            }
        }
    }

    let path_var = cuda_autocompat_core::env::secure_env_var("PATH")?;
    for dir in path_var.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = Path::new(dir).join(HELPER_EXE);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }

    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Runs the search helper and returns the driver directory it printed,
/// stopping at the first NUL or newline and truncating to `PATH_MAX - 1`
/// bytes the way the original capped its read buffer.
pub fn run_search_helper(helper_path: &Path) -> Option<PathBuf> {
    let output = Command::new(helper_path).output().ok()?;
    if !output.status.success() {
        return None;
    }

    let stop = output
        .stdout
        .iter()
        .position(|&b| b == 0 || b == b'\n')
        .unwrap_or(output.stdout.len())
        .min(PATH_MAX - 1);

    let text = std::str::from_utf8(&output.stdout[..stop]).ok()?;
    if text.is_empty() {
        None
    } else {
        Some(PathBuf::from(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonexistent_path_entries_are_not_executable() {
        assert!(!is_executable(Path::new("/definitely/not/here/xyz")));
    }
}
