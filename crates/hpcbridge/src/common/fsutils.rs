use std::path::{Path, PathBuf};

pub fn absolute_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        match std::env::current_dir() {
            Ok(current) => current.join(path),
            Err(_) => path,
        }
    }
}

/// Expands a leading `~` into the home directory of the current user.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Normalizes a remote (POSIX) path so that paths can be compared textually.
/// Repeated separators, `.` components and trailing separators are removed.
pub fn normalize_remote_path(path: &str) -> String {
    let components: Vec<&str> = path
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    let joined = components.join("/");
    if path.starts_with('/') {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Joins a remote base directory with a child component.
pub fn join_remote_path(base: &str, child: &str) -> String {
    let base = base.trim_end_matches('/');
    if child.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{child}")
    }
}
