//! Environment constants and path utilities for the task-group engine.
//!
//! Centralizes thread names, configuration file names and logging defaults
//! so the binary, the configuration loader and the engine agree on them.

use std::path::{Path, PathBuf};

/// Hidden application directory name
pub const APP_DIR_NAME: &str = ".taskgroup";

/// Configuration file name inside [`APP_DIR_NAME`]
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "taskgroup.toml";

/// Default tracing filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "taskgroup=info";

/// Thread naming
pub mod threads {
    /// Prefix of every group pump thread; the group id is appended
    pub const PUMP_THREAD_PREFIX: &str = "taskgroup-pump";

    /// Worker threads of the process-wide dispatch runtime
    pub const DISPATCH_THREAD_NAME: &str = "taskgroup-dispatch";
}

/// Get local configuration file path: `{dir}/.taskgroup/config.toml`
pub fn local_config_file_path(dir: &Path) -> PathBuf {
    dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME)
}

/// Get user configuration directory: `{home}/.taskgroup`
pub fn user_config_dir_path(home: &Path) -> PathBuf {
    home.join(APP_DIR_NAME)
}

/// Get user configuration file path: `{home}/.taskgroup/config.toml`
pub fn user_config_file_path(home: &Path) -> PathBuf {
    user_config_dir_path(home).join(CONFIG_FILE_NAME)
}
