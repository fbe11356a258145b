//! Path helpers: home expansion and the default configuration location.

use std::path::PathBuf;

use directories::{BaseDirs, ProjectDirs};

/// Expand a leading `~` to the current user's home directory.
///
/// Paths without a leading `~`, and `~user` forms, are returned unchanged.
/// If no home directory can be determined the literal path is kept.
pub fn expand_tilde(raw: &str) -> PathBuf {
    let rest = if raw == "~" {
        Some("")
    } else {
        raw.strip_prefix("~/")
    };

    match (rest, BaseDirs::new()) {
        (Some(rest), Some(dirs)) if rest.is_empty() => dirs.home_dir().to_path_buf(),
        (Some(rest), Some(dirs)) => dirs.home_dir().join(rest),
        _ => PathBuf::from(raw),
    }
}

/// Default configuration file (`<config dir>/vaultsign/vaultsign.kdl`)
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "vaultsign").map(|dirs| dirs.config_dir().join("vaultsign.kdl"))
}
