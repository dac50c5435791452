//! Mapping logical library names to files on disk.
//!
//! A logical name such as `mathlib` is expanded to the platform file name
//! (`libmathlib.so`, `libmathlib.dylib`, `mathlib.dll`) and looked up in, in
//! order: the working directory, the system library directory, and every
//! search path added at runtime. Names that already contain a directory
//! component are taken as paths and only checked for existence.

use std::{
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use tracing::{debug, warn};

#[cfg(windows)]
const PREFIX: &str = "";
#[cfg(not(windows))]
const PREFIX: &str = "lib";

#[cfg(windows)]
const SUFFIX: &str = ".dll";
#[cfg(target_os = "macos")]
const SUFFIX: &str = ".dylib";
#[cfg(not(any(windows, target_os = "macos")))]
const SUFFIX: &str = ".so";

#[cfg(windows)]
const SYSTEM_DIR: &str = "C:/Windows/System32";
#[cfg(not(windows))]
const SYSTEM_DIR: &str = "/usr/lib";

/// Locates library files for logical library names.
#[derive(Debug)]
pub struct PathResolver {
    /// `None` means the process working directory at lookup time.
    working_dir: Option<PathBuf>,
    system_dir: Option<PathBuf>,
    search_paths: RwLock<Vec<PathBuf>>,
}

impl Default for PathResolver {
    fn default() -> Self {
        Self {
            working_dir: None,
            system_dir: Some(PathBuf::from(SYSTEM_DIR)),
            search_paths: RwLock::new(Vec::new()),
        }
    }
}

impl PathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks names up relative to `dir` instead of the process working
    /// directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Overrides the system library directory; `None` disables it.
    #[must_use]
    pub fn with_system_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.system_dir = dir;
        self
    }

    /// `true` if `name` already carries the platform prefix and suffix.
    pub fn is_fully_qualified_name(name: &str) -> bool {
        name.starts_with(PREFIX) && name.ends_with(SUFFIX)
    }

    /// Adds whichever of the platform prefix and suffix `name` lacks.
    pub fn to_fully_qualified_name(name: &str) -> String {
        let mut full = String::with_capacity(PREFIX.len() + name.len() + SUFFIX.len());
        if !name.starts_with(PREFIX) {
            full.push_str(PREFIX);
        }
        full.push_str(name);
        if !name.ends_with(SUFFIX) {
            full.push_str(SUFFIX);
        }
        full
    }

    /// Appends `path` to the search paths.
    ///
    /// Ignored unless `path` is an existing directory; returns whether it was
    /// added.
    pub fn add_search_path(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if !path.is_dir() {
            warn!(path = %path.display(), "Ignoring search path that is not a directory");
            return false;
        }

        let mut search_paths = self
            .search_paths
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !search_paths.iter().any(|existing| existing == path) {
            debug!(path = %path.display(), "Search path added");
            search_paths.push(path.to_path_buf());
        }
        true
    }

    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.search_paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Finds the file for `name`, or `None` if no candidate exists.
    pub fn find_path(&self, name: &str) -> Option<PathBuf> {
        let given = Path::new(name);
        if given.is_absolute() || given.components().count() > 1 {
            return given.is_file().then(|| given.to_path_buf());
        }

        let file_names = if Self::is_fully_qualified_name(name) {
            vec![name.to_string()]
        } else {
            vec![Self::to_fully_qualified_name(name), name.to_string()]
        };

        let found = self
            .candidate_dirs()
            .into_iter()
            .flat_map(|dir| file_names.iter().map(move |file| dir.join(file)))
            .find(|candidate| candidate.is_file());

        match &found {
            Some(path) => debug!(name, path = %path.display(), "Library path resolved"),
            None => debug!(name, "Library path not found"),
        }
        found
    }

    pub fn is_valid_path(&self, name: &str) -> bool {
        self.find_path(name).is_some()
    }

    fn candidate_dirs(&self) -> Vec<PathBuf> {
        let working_dir = self
            .working_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));

        std::iter::once(working_dir)
            .chain(self.system_dir.clone())
            .chain(self.search_paths())
            .collect()
    }
}
