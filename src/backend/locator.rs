//! Backend executable lookup.
//!
//! Search order is fixed: explicit well-known install directories first,
//! then a PATH-style fallback. The PATH value is a parameter rather than
//! read ambiently, so callers (and tests) control the fallback.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Locate the backend executable.
///
/// Returns the first existing candidate, or `None` when the executable
/// cannot be found anywhere. Existence is the only check; execute
/// permission failures surface later, at spawn time.
pub fn locate_executable(
    name: &str,
    install_dirs: &[PathBuf],
    path_var: Option<&OsString>,
) -> Option<PathBuf> {
    for dir in install_dirs {
        if let Some(found) = candidate_in(dir, name) {
            return Some(found);
        }
    }

    let path_var = path_var?;
    for dir in std::env::split_paths(path_var) {
        if let Some(found) = candidate_in(&dir, name) {
            return Some(found);
        }
    }
    None
}

fn candidate_in(dir: &Path, name: &str) -> Option<PathBuf> {
    let candidate = dir.join(name);
    if candidate.is_file() {
        return Some(candidate);
    }

    // Windows installs carry launcher extensions.
    #[cfg(windows)]
    for ext in ["exe", "cmd", "bat"] {
        let with_ext = dir.join(format!("{}.{}", name, ext));
        if with_ext.is_file() {
            return Some(with_ext);
        }
    }

    None
}
