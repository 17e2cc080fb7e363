//! Stable host identifier, persisted across restarts.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

const CONFIG_DIR: &str = ".config/webshell";
const ID_FILE: &str = "instance_id";

/// Uses `explicit` when given, otherwise the identifier stored under the
/// user's config directory, creating one on first run.
pub fn resolve_instance_id(explicit: Option<&str>) -> Result<String> {
    if let Some(id) = explicit.map(str::trim).filter(|id| !id.is_empty()) {
        return Ok(id.to_owned());
    }
    load_or_create(&default_id_path())
}

pub fn default_id_path() -> PathBuf {
    let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home_dir).join(CONFIG_DIR).join(ID_FILE)
}

pub fn load_or_create(path: &Path) -> Result<String> {
    if let Ok(contents) = fs::read_to_string(path) {
        let id = contents.trim();
        if !id.is_empty() {
            return Ok(id.to_owned());
        }
    }

    let id = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, &id).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Generated instance ID {} at {}", id, path.display());

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_id_wins() {
        assert_eq!(resolve_instance_id(Some(" inst-7 ")).unwrap(), "inst-7");
    }

    #[test]
    fn generated_id_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/instance_id");

        let first = load_or_create(&path).unwrap();
        assert!(Uuid::parse_str(&first).is_ok());
        assert_eq!(load_or_create(&path).unwrap(), first);
    }

    #[test]
    fn stored_id_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance_id");
        fs::write(&path, "inst-1\n").unwrap();

        assert_eq!(load_or_create(&path).unwrap(), "inst-1");
    }

    #[test]
    fn empty_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance_id");
        fs::write(&path, "  \n").unwrap();

        let id = load_or_create(&path).unwrap();
        assert!(!id.is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), id);
    }
}
