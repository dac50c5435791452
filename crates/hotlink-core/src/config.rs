//! Linker configuration.
//!
//! Configuration lives in a `hotlink.toml` file:
//!
//! ```toml
//! search_paths = ["plugins", "/opt/acme/lib"]
//! binding = "now"
//! reload_policy = "strict"
//! system_path = "/usr/local/lib"
//! ```
//!
//! Every key is optional. Relative search paths are taken relative to the
//! directory containing the file.
//!
//! # Resolution Algorithm
//!
//! 1. `HOTLINK_CONFIG` environment variable
//! 2. Start directory (usually the current directory)
//! 3. Parent directories (walk up to filesystem root)
//! 4. XDG config directory (`~/.config/hotlink/hotlink.toml`)
//!
//! A missing file is not an error. Directories listed in
//! `HOTLINK_SEARCH_PATH` (platform path-list syntax) are appended to the
//! search paths by [`LinkerConfig::load_or_default`].

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{cache::ReloadPolicy, loader::Binding, path::PathResolver};

const CONFIG_FILE: &str = "hotlink.toml";
const CONFIG_ENV: &str = "HOTLINK_CONFIG";
const SEARCH_PATH_ENV: &str = "HOTLINK_SEARCH_PATH";

/// Errors that can occur during configuration resolution or loading.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error when reading a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error when a config file is malformed.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file not found.
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
}

/// Settings for a linker instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkerConfig {
    /// Extra directories searched after the working and system directories.
    pub search_paths: Vec<PathBuf>,

    /// When the platform loader binds symbols of newly opened libraries.
    pub binding: Binding,

    /// What a reload does with symbols the replacement lacks.
    pub reload_policy: ReloadPolicy,

    /// Overrides the platform system library directory.
    pub system_path: Option<PathBuf>,
}

impl LinkerConfig {
    /// Resolves the config file starting from the current directory.
    ///
    /// # Errors
    ///
    /// Returns `Err(ConfigError)` if the current directory cannot be
    /// determined, or if a found config file cannot be read or parsed.
    pub fn resolve() -> Result<Option<Self>, ConfigError> {
        let current = std::env::current_dir()?;
        Self::resolve_from(&current)
    }

    /// Resolves the config file starting from `start`.
    ///
    /// # Errors
    ///
    /// Returns `Err(ConfigError)` if the environment override points to a
    /// missing file, or if a found config file cannot be read or parsed.
    pub fn resolve_from(start: &Path) -> Result<Option<Self>, ConfigError> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let xdg_path = dirs::config_dir().map(|dir| dir.join("hotlink").join(CONFIG_FILE));
        resolve_in(start, env_path, xdg_path)
    }

    /// Loads a config file from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns `Err(ConfigError)` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&contents)?;

        let root_dir = path.parent().unwrap_or_else(|| Path::new("."));
        for search_path in &mut config.search_paths {
            if search_path.is_relative() {
                *search_path = root_dir.join(&*search_path);
            }
        }
        Ok(config)
    }

    /// Resolved config, or the defaults if there is none, plus the
    /// directories from `HOTLINK_SEARCH_PATH`.
    ///
    /// # Errors
    ///
    /// Returns `Err(ConfigError)` under the same conditions as
    /// [`LinkerConfig::resolve`].
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let mut config = Self::resolve()?.unwrap_or_default();
        if let Some(paths) = std::env::var_os(SEARCH_PATH_ENV) {
            config.search_paths.extend(std::env::split_paths(&paths));
        }
        Ok(config)
    }

    /// Builds a path resolver carrying this configuration's directories.
    ///
    /// Search paths that are not directories are skipped.
    pub fn path_resolver(&self) -> PathResolver {
        let resolver = match &self.system_path {
            Some(dir) => PathResolver::new().with_system_dir(Some(dir.clone())),
            None => PathResolver::new(),
        };
        for search_path in &self.search_paths {
            resolver.add_search_path(search_path);
        }
        resolver
    }
}

fn resolve_in(
    start: &Path,
    env_path: Option<PathBuf>,
    xdg_path: Option<PathBuf>,
) -> Result<Option<LinkerConfig>, ConfigError> {
    // Step 1: Environment variable override
    if let Some(path) = env_path {
        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }
        return LinkerConfig::load(&path).map(Some);
    }

    // Steps 2 and 3: Start directory, then its parents
    for dir in start.ancestors() {
        let path = dir.join(CONFIG_FILE);
        if path.is_file() {
            return LinkerConfig::load(&path).map(Some);
        }
    }

    // Step 4: XDG config directory
    if let Some(path) = xdg_path
        && path.is_file()
    {
        return LinkerConfig::load(&path).map(Some);
    }

    Ok(None)
}
