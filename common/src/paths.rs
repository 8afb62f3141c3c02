use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::{SOCKET_ENV, SOCKET_NAME};

pub fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

fn dir_or(value: Option<OsString>, fallback: impl FnOnce() -> PathBuf) -> PathBuf {
    match value {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => fallback(),
    }
}

pub fn xdg_config_home() -> PathBuf {
    dir_or(env::var_os("XDG_CONFIG_HOME"), || home_dir().join(".config"))
}

pub fn xdg_cache_home() -> PathBuf {
    dir_or(env::var_os("XDG_CACHE_HOME"), || home_dir().join(".cache"))
}

/// Typically /run/user/<uid> on Linux.
pub fn xdg_runtime_dir() -> PathBuf {
    dir_or(env::var_os("XDG_RUNTIME_DIR"), xdg_cache_home)
}

pub fn config_dir() -> PathBuf {
    xdg_config_home().join("transcoder")
}

pub fn default_socket_path() -> PathBuf {
    xdg_runtime_dir().join(SOCKET_NAME)
}

/// The socket a worker connects to: `$TRANSCODER_SOCKET` when the
/// supervisor set it, the well-known runtime path otherwise.
pub fn socket_path() -> PathBuf {
    dir_or(env::var_os(SOCKET_ENV), default_socket_path)
}
