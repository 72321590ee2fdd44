//! Locating bundled helper binaries and the ONNX Runtime shared library.
//!
//! Release archives ship `ffmpeg`, `ffprobe` and `onnxruntime` next to the
//! executable; a system install is used when nothing is bundled.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{info, warn};

#[cfg(target_os = "linux")]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .and_then(|p| p.canonicalize())
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

/// `<exe_dir>`, `<exe_dir>/bin`, `<cwd>/bin`, in that order.
fn bundled_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = exe_dir() {
        push_unique(&mut dirs, dir.join("bin"));
        dirs.insert(0, dir);
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("bin"));
    }
    dirs
}

/// `<exe_dir>`, `<exe_dir>/lib`, `<cwd>/lib`, in that order.
fn bundled_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = exe_dir() {
        push_unique(&mut dirs, dir.clone());
        push_unique(&mut dirs, dir.join("lib"));
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("lib"));
    }
    dirs
}

fn executable_file_name(binary: &str) -> String {
    if cfg!(windows) && Path::new(binary).extension().is_none() {
        format!("{binary}.exe")
    } else {
        binary.to_string()
    }
}

fn first_existing(dirs: &[PathBuf], file_name: &str) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file())
}

/// A `Command` for `binary`, preferring a bundled copy over `PATH`.
pub fn command_for(binary: &str) -> Command {
    match first_existing(&bundled_bin_dirs(), &executable_file_name(binary)) {
        Some(path) => Command::new(path),
        None => Command::new(binary),
    }
}

/// Point `ORT_DYLIB_PATH` at a bundled ONNX Runtime library unless the user
/// already set it. Must run before the first `ort` call.
pub fn setup_ort_dylib() {
    if env::var_os("ORT_DYLIB_PATH").is_some() {
        return;
    }
    if let Some(path) = first_existing(&bundled_lib_dirs(), ORT_LIB_NAME) {
        env::set_var("ORT_DYLIB_PATH", path);
    }
}

/// Call after tracing is initialized.
pub fn log_runtime_status() {
    match env::var_os("ORT_DYLIB_PATH") {
        Some(path) if Path::new(&path).is_file() => {
            info!(path = %Path::new(&path).display(), "Using ONNX Runtime library");
        }
        Some(path) => {
            warn!(
                path = %Path::new(&path).display(),
                "ORT_DYLIB_PATH points at a missing file"
            );
        }
        None => warn!("ORT_DYLIB_PATH not set; relying on the system library search path"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_bin_dirs_include_cwd_bin() {
        let dirs = bundled_bin_dirs();
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("bin")));
        }
    }

    #[test]
    fn bundled_lib_dirs_have_no_duplicates() {
        let dirs = bundled_lib_dirs();
        for (i, dir) in dirs.iter().enumerate() {
            assert!(!dirs[i + 1..].contains(dir));
        }
    }

    #[test]
    fn first_existing_prefers_earlier_dir() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        let name = executable_file_name("ffprobe");
        std::fs::write(second.join(&name), b"second").unwrap();

        let resolved = first_existing(&[first.clone(), second.clone()], &name);
        assert_eq!(resolved, Some(second.join(&name)));

        std::fs::write(first.join(&name), b"first").unwrap();
        let resolved = first_existing(&[first.clone(), second], &name);
        assert_eq!(resolved, Some(first.join(&name)));
    }

    #[test]
    fn command_for_falls_back_to_bare_name() {
        let command = command_for("definitely-not-a-bundled-tool");
        assert_eq!(command.get_program(), "definitely-not-a-bundled-tool");
    }
}
