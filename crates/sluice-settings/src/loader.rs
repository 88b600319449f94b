//! Layered configuration loading.
//!
//! 1. Global: `~/.config/sluice/sluice.toml`
//! 2. Project: `<workspace>/.sluice/sluice.toml`
//!
//! Project values take precedence.

use crate::SluiceConfig;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "sluice.toml";

/// Loads and merges `SluiceConfig` from global and project-level files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged configuration for the given workspace.
    ///
    /// Missing files are skipped. A file that fails to parse emits a warning
    /// to stderr and is treated as absent.
    pub fn load(workspace: &Path) -> SluiceConfig {
        Self::load_layers(&Self::global_config_path(), workspace)
    }

    /// Same as [`ConfigLoader::load`] with an explicit global file.
    pub fn load_layers(global: &Path, workspace: &Path) -> SluiceConfig {
        let global = Self::load_optional(global);
        let project = Self::load_optional(&Self::project_config_path(workspace));
        global.merge(project)
    }

    /// Absolute path to the global config file.
    pub fn global_config_path() -> PathBuf {
        Self::global_config_dir()
            .unwrap_or_else(|| PathBuf::from(".sluice"))
            .join(CONFIG_FILE)
    }

    /// Path to the project config file for the given workspace.
    pub fn project_config_path(workspace: &Path) -> PathBuf {
        workspace.join(".sluice").join(CONFIG_FILE)
    }

    fn global_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("sluice"))
    }

    fn load_optional(path: &Path) -> SluiceConfig {
        if !path.exists() {
            return SluiceConfig::default();
        }
        match SluiceConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("sluice-settings: warning: failed to parse {path:?}: {err}");
                SluiceConfig::default()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;

    fn write_project(workspace: &Path, contents: &str) {
        let dir = workspace.join(".sluice");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("sluice.toml"), contents).unwrap();
    }

    #[test]
    fn test_load_missing_files_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::load_layers(&dir.path().join("absent.toml"), dir.path());
        assert_eq!(config, SluiceConfig::default());
    }

    #[test]
    fn test_load_project_config_only() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), "[proxy]\nport = 3128\n");

        let config = ConfigLoader::load_layers(&dir.path().join("absent.toml"), dir.path());
        assert_eq!(config.proxy.port(), 3128);
    }

    #[test]
    fn test_load_merges_global_and_project() {
        let global_dir = tempfile::tempdir().unwrap();
        let global = global_dir.path().join("sluice.toml");
        fs::write(&global, "[proxy]\nhost = \"127.0.0.1\"\nport = 8080\n").unwrap();

        let project_dir = tempfile::tempdir().unwrap();
        write_project(project_dir.path(), "[proxy]\nport = 9000\n");

        let config = ConfigLoader::load_layers(&global, project_dir.path());
        assert_eq!(config.proxy.host(), "127.0.0.1");
        assert_eq!(config.proxy.port(), 9000);
    }

    #[test]
    fn test_load_malformed_config_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), "not valid toml :::");

        let config = ConfigLoader::load_layers(&dir.path().join("absent.toml"), dir.path());
        assert_eq!(config, SluiceConfig::default());
    }

    #[test]
    fn test_project_config_path() {
        let path = ConfigLoader::project_config_path(Path::new("/workspace"));
        assert_eq!(path, PathBuf::from("/workspace/.sluice/sluice.toml"));
    }

    #[test]
    fn test_global_config_path_ends_with_sluice_toml() {
        let path = ConfigLoader::global_config_path();
        assert!(path.ends_with("sluice.toml"));
        assert!(path.to_string_lossy().contains("sluice"));
    }
}
