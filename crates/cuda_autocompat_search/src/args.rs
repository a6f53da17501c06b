//! Command-line argument handling for the search helper.
//!
//! Option recognition itself is delegated to `clap` (§10.3); layered on top
//! is the behavior `clap` has no derive-level equivalent for: colon-list
//! expansion with per-entry existence/kind filtering and content dedup, the
//! recursive single-line stdin continuation form, and default-path seeding
//! when no `--search-path` was ever seen.

use std::collections::HashSet;
use std::io::BufRead;
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;
use tracing::instrument;

use cuda_autocompat_core::default_path::default_search_paths;
use cuda_autocompat_core::{log_debug, log_error, log_info};

#[derive(Debug, Error)]
pub enum ParseArgsError {
    #[error("{0}")]
    Usage(String),
    #[error("unrecognized argument '{0}'")]
    UnrecognizedArgument(String),
    #[error("failed to read arguments from stdin")]
    StdinContinuation,
    #[error("failed to obtain the dynamic linker's default search path")]
    DefaultSearchPath,
    /// `-h`/`--help` was given; usage was printed, the caller should exit
    /// non-zero without treating this as an error worth logging again.
    #[error("help requested")]
    HelpRequested,
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "cuda-autocompat-search",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct RawArgs {
    #[arg(short = 'p', long = "search-path")]
    search_path: Vec<String>,

    #[arg(short = 'l', long = "libs")]
    libs: Vec<String>,

    #[arg(short = 'h', long = "help", action = clap::ArgAction::SetTrue)]
    help: bool,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    rest: Vec<String>,
}

#[derive(Default)]
struct Accumulator {
    paths: Vec<PathBuf>,
    path_cache: HashSet<PathBuf>,
    libs: Vec<PathBuf>,
    lib_cache: HashSet<PathBuf>,
    search_path_seen: bool,
}

/// Parses `argv` (including `argv[0]`, the program name) and every
/// stdin-continuation it triggers, returning the accumulated directory and
/// library lists.
#[instrument(level = "info", skip(argv))]
pub fn parse_args(argv: &[String]) -> Result<(Vec<PathBuf>, Vec<PathBuf>), ParseArgsError> {
    let mut acc = Accumulator::default();
    parse_args_helper(argv, &mut acc)?;

    if !acc.search_path_seen {
        log_info!("Adding default search paths");
        let defaults = default_search_paths().ok_or(ParseArgsError::DefaultSearchPath)?;
        for dir in defaults {
            add_path(&dir.to_string_lossy(), &mut acc.paths, &mut acc.path_cache, true);
        }
    }

    Ok((acc.paths, acc.libs))
}

fn parse_args_helper(argv: &[String], acc: &mut Accumulator) -> Result<(), ParseArgsError> {
    let parsed = RawArgs::try_parse_from(argv).map_err(|e| {
        if e.kind() == clap::error::ErrorKind::DisplayHelp {
            ParseArgsError::HelpRequested
        } else {
            log_error!("{}: {}", argv.first().map(String::as_str).unwrap_or("?"), e);
            ParseArgsError::Usage(e.to_string())
        }
    })?;

    if parsed.help {
        eprintln!("{}", usage(argv.first().map(String::as_str).unwrap_or("cuda-autocompat-search")));
        return Err(ParseArgsError::HelpRequested);
    }

    for entry in &parsed.search_path {
        acc.search_path_seen = true;
        log_info!("Adding search paths");
        parse_paths(entry, &mut acc.paths, &mut acc.path_cache, true);
    }
    for entry in &parsed.libs {
        log_info!("Adding search libs");
        parse_paths(entry, &mut acc.libs, &mut acc.lib_cache, false);
    }

    for arg in &parsed.rest {
        if arg != "-" {
            log_error!("unrecognized argument '{arg}'");
            return Err(ParseArgsError::UnrecognizedArgument(arg.clone()));
        }

        log_info!("Reading additional arguments from stdin");
        let new_args = parse_argv_from_stdin()?;

        let mut new_argv = Vec::with_capacity(new_args.len() + 1);
        new_argv.push(argv[0].clone());
        new_argv.extend(new_args);

        parse_args_helper(&new_argv, acc)?;
    }

    Ok(())
}

fn parse_argv_from_stdin() -> Result<Vec<String>, ParseArgsError> {
    let mut line = String::new();
    let read = std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|_| ParseArgsError::StdinContinuation)?;
    if read == 0 {
        log_error!("Failed to read arguments from stdin");
        return Err(ParseArgsError::StdinContinuation);
    }
    log_debug!("{}", line.trim_end());

    let args: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    if args.is_empty() {
        return Err(ParseArgsError::StdinContinuation);
    }
    Ok(args)
}

/// Splits a colon-separated list and runs each entry through [`add_path`].
fn parse_paths(src: &str, dst: &mut Vec<PathBuf>, cache: &mut HashSet<PathBuf>, dir_mode: bool) {
    if src.is_empty() {
        return;
    }
    for entry in cuda_autocompat_core::path_utils::tokens(src, ':') {
        add_path(entry, dst, cache, dir_mode);
    }
    // A trailing ':' yields no final token from `tokens`; the original
    // implementation's own tokenizer has the same behavior, so there is
    // nothing further to add here.
}

/// Filters and normalizes a single path entry: empty directories become
/// `"."`, empty files are skipped, entries are deduplicated by content, and
/// entries that don't exist (or are the wrong kind) are silently skipped with
/// a debug diagnostic.
fn add_path(src: &str, out: &mut Vec<PathBuf>, cache: &mut HashSet<PathBuf>, dir_mode: bool) {
    let src_path: PathBuf = if src.is_empty() {
        if !dir_mode {
            log_debug!("skip empty");
            return;
        }
        PathBuf::from(".")
    } else {
        PathBuf::from(src)
    };

    if !cache.insert(src_path.clone()) {
        log_debug!("skip {} (already processed)", src_path.display());
        return;
    }

    let Ok(meta) = std::fs::metadata(&src_path) else {
        log_debug!("skip {} (does not exist)", src_path.display());
        return;
    };
    if dir_mode && !meta.is_dir() {
        log_debug!("skip {} (not a directory)", src_path.display());
        return;
    }
    if !dir_mode && !meta.is_file() {
        log_debug!("skip {} (not a regular file)", src_path.display());
        return;
    }

    out.push(src_path);
}

fn usage(exe: &str) -> String {
    format!(
        "Usage: {exe} [OPTIONS]\n\
         \x20 -p, --search-path=PATH      Colon-separated library search path.\n\
         \x20 -l, --libs=LIBRARIES        Colon-separated library list to search.\n\
         \x20 -h, --help                  Display this help and exit."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_path_maps_empty_directory_entry_to_dot() {
        let mut out = Vec::new();
        let mut cache = HashSet::new();
        add_path("", &mut out, &mut cache, true);
        assert_eq!(out, vec![PathBuf::from(".")]);
    }

    #[test]
    fn add_path_skips_empty_file_entry() {
        let mut out = Vec::new();
        let mut cache = HashSet::new();
        add_path("", &mut out, &mut cache, false);
        assert!(out.is_empty());
    }

    #[test]
    fn add_path_dedups_repeated_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_string_lossy().into_owned();
        let mut out = Vec::new();
        let mut cache = HashSet::new();
        add_path(&dir, &mut out, &mut cache, true);
        add_path(&dir, &mut out, &mut cache, true);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn add_path_skips_nonexistent_entry() {
        let mut out = Vec::new();
        let mut cache = HashSet::new();
        add_path("/definitely/does/not/exist/xyz", &mut out, &mut cache, true);
        assert!(out.is_empty());
    }

    #[test]
    fn add_path_rejects_wrong_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let file_path = tmp.path().join("a_file");
        std::fs::write(&file_path, b"x").unwrap();
        let mut out = Vec::new();
        let mut cache = HashSet::new();
        add_path(&file_path.to_string_lossy(), &mut out, &mut cache, true);
        assert!(out.is_empty());
    }

    #[test]
    fn parse_paths_splits_colon_list() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();
        let joined = format!("{}:{}", a.display(), b.display());

        let mut out = Vec::new();
        let mut cache = HashSet::new();
        parse_paths(&joined, &mut out, &mut cache, true);
        assert_eq!(out, vec![a, b]);
    }
}
