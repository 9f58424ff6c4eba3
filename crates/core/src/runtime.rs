//! ONNX Runtime shared-library discovery for the `load-dynamic` build.

use std::env;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(target_os = "linux")]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Directories probed for the runtime library, in priority order:
/// the executable's directory (Windows), `<exe>/lib`, `<exe>/../lib`,
/// `<cwd>/lib`, then the usual system locations on Unix.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = env::current_exe()
        .and_then(|p| p.canonicalize())
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        if cfg!(windows) {
            dirs.push(exe_dir.clone());
        }
        dirs.push(exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            dirs.push(parent.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    if cfg!(unix) {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Point `ORT_DYLIB_PATH` at a bundled runtime if the user has not set it.
///
/// Call before the first session is built. Returns the path in effect.
pub fn setup_runtime_libs() -> Option<PathBuf> {
    if let Some(existing) = env::var_os(ORT_DYLIB_ENV) {
        return Some(PathBuf::from(existing));
    }
    let found = find_ort_dylib_in_dirs(&candidate_lib_dirs())?;
    env::set_var(ORT_DYLIB_ENV, &found);
    Some(found)
}

/// Log which runtime library will be loaded. Call after tracing is up.
pub fn log_runtime_lib_status() {
    match env::var(ORT_DYLIB_ENV) {
        Ok(path) if Path::new(&path).is_file() => info!(path = %path, "ONNX Runtime library"),
        Ok(path) => warn!(path = %path, "{ORT_DYLIB_ENV} points at a missing file"),
        Err(_) => warn!("{ORT_DYLIB_ENV} not set; ONNX Runtime will use the default search path"),
    }
}
