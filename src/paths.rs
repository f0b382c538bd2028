use std::path::{Path, PathBuf};

/// Expand a leading `~` against `home`. Other paths are returned unchanged.
pub fn expand_home(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    match path.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(path),
    }
}

/// Like [`expand_home`], using the current user's home directory.
pub fn expand_user(path: &str) -> PathBuf {
    match dirs::home_dir() {
        Some(home) => expand_home(path, &home),
        None => PathBuf::from(path),
    }
}

/// Directories catalog scripts are allowed to live under.
pub fn trusted_dirs(home: &Path) -> Vec<PathBuf> {
    vec![
        home.join("github"),
        home.join(".saturn").join("runtime"),
        home.to_path_buf(),
    ]
}

/// True when `path` sits inside one of `trusted`. Compared by components,
/// so `/home/pi2` is not inside `/home/pi`.
pub fn is_trusted(path: &Path, trusted: &[PathBuf]) -> bool {
    trusted.iter().any(|dir| path.starts_with(dir))
}
