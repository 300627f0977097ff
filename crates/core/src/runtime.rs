//! Locating ONNX Runtime and the GPU libraries it needs before the first
//! session is built. `ort` loads `libonnxruntime` dynamically from
//! `ORT_DYLIB_PATH`; CUDA, cuDNN and TensorRT are preloaded so the execution
//! providers can resolve them without `LD_LIBRARY_PATH`.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

/// Extra directory searched before the defaults.
pub const LIB_DIR_ENV: &str = "PIXELSCALE_LIB_DIR";
pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// What [`setup_runtime_libs`] found, reported once logging is up.
#[derive(Debug, Clone, Default)]
pub struct RuntimeLibs {
    pub searched: Vec<PathBuf>,
    /// Set when we exported `ORT_DYLIB_PATH` ourselves.
    pub discovered_ort: Option<PathBuf>,
    pub preloaded: Vec<PathBuf>,
}

/// Directories probed, in order: `$PIXELSCALE_LIB_DIR`, `<data_dir>/lib`,
/// `<exe_dir>/lib`, `<exe_dir>/../lib`, `<cwd>/lib`, then the system lib
/// directories on Unix.
fn candidate_lib_dirs(data_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(dir) = env::var_os(LIB_DIR_ENV).filter(|v| !v.is_empty()) {
        push(PathBuf::from(dir));
    }
    if let Some(data_dir) = data_dir {
        push(data_dir.join("lib"));
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            push(exe_dir.to_path_buf());
            push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load order for GPU libraries: CUDA runtime and math libs, then cuDNN, then
/// TensorRT. ORT's own provider libraries are excluded because they need
/// symbols from `libonnxruntime`, which `ort` loads later.
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    let cuda = ["libcudart", "libcublas", "libcufft", "libcurand"];
    if cuda.iter().any(|prefix| name.starts_with(prefix)) {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else if name.starts_with("libnvinfer") || name.starts_with("libnvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    let cuda = ["cudart64_", "cublas64_", "cublaslt64_", "cufft64_", "curand64_"];
    if cuda.iter().any(|prefix| name.starts_with(prefix)) {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_shared_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_shared_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// GPU libraries to preload, sorted by (priority, file name). The first
/// directory holding a given file name wins.
fn collect_gpu_libs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for entries in dirs.iter().filter_map(|dir| std::fs::read_dir(dir).ok()) {
        for path in entries.flatten().map(|entry| entry.path()) {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !is_shared_lib(&name, &path) {
                continue;
            }
            let Some(priority) = load_priority(&name) else {
                continue;
            };
            if seen.insert(name.clone()) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort();
    libs.into_iter().map(|(_, _, path)| path).collect()
}

/// Loaded with `RTLD_GLOBAL` and leaked so later `dlopen` calls from the
/// execution providers resolve against them.
#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Export `ORT_DYLIB_PATH` when unset and preload GPU libraries. Must run
/// before any ONNX Runtime session is created; the caller logs the result
/// with [`log_runtime_lib_status`] once tracing is initialized.
pub fn setup_runtime_libs(data_dir: Option<&Path>) -> RuntimeLibs {
    let searched = candidate_lib_dirs(data_dir);

    let mut discovered_ort = None;
    if env::var_os(ORT_DYLIB_ENV).is_none() {
        if let Some(path) = find_ort_dylib(&searched) {
            env::set_var(ORT_DYLIB_ENV, &path);
            discovered_ort = Some(path);
        }
    }

    let preloaded = collect_gpu_libs(&searched)
        .into_iter()
        .filter(|path| unsafe { load_library(path) })
        .collect();

    RuntimeLibs {
        searched,
        discovered_ort,
        preloaded,
    }
}

pub fn log_runtime_lib_status(libs: &RuntimeLibs) {
    match env::var(ORT_DYLIB_ENV) {
        Ok(ort) if Path::new(&ort).is_file() => {
            info!(path = %ort, discovered = libs.discovered_ort.is_some(), "ONNX Runtime library")
        }
        Ok(ort) => warn!(path = %ort, "{ORT_DYLIB_ENV} points to a missing file"),
        Err(_) => warn!(
            searched = ?libs.searched,
            "{ORT_LIB_NAME} not found; ONNX Runtime will use the default loader search path"
        ),
    }

    if libs.preloaded.is_empty() {
        debug!("No CUDA/cuDNN/TensorRT libraries preloaded");
    } else {
        info!(count = libs.preloaded.len(), "Preloaded GPU runtime libraries");
        for path in &libs.preloaded {
            debug!(path = %path.display(), "Preloaded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_lib_is_searched_before_cwd() {
        let data_dir = tempfile::tempdir().unwrap();
        let dirs = candidate_lib_dirs(Some(data_dir.path()));
        let data_pos = dirs.iter().position(|d| d == &data_dir.path().join("lib"));
        let cwd_pos = env::current_dir()
            .ok()
            .and_then(|cwd| dirs.iter().position(|d| d == &cwd.join("lib")));

        assert!(data_pos.is_some());
        if let (Some(data_pos), Some(cwd_pos)) = (data_pos, cwd_pos) {
            assert!(data_pos < cwd_pos);
        }
        #[cfg(unix)]
        assert_eq!(dirs.last(), Some(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn finds_ort_in_first_matching_dir() {
        let temp = tempfile::tempdir().unwrap();
        let (a, b, c) = (temp.path().join("a"), temp.path().join("b"), temp.path().join("c"));
        for dir in [&a, &b, &c] {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(b.join(ORT_LIB_NAME), b"b").unwrap();
        std::fs::write(c.join(ORT_LIB_NAME), b"c").unwrap();

        assert_eq!(find_ort_dylib(&[a.clone(), b.clone(), c]), Some(b.join(ORT_LIB_NAME)));
        assert_eq!(find_ort_dylib(&[a]), None);
    }

    #[cfg(unix)]
    #[test]
    fn gpu_libs_sorted_and_deduplicated() {
        let temp = tempfile::tempdir().unwrap();
        let (first, second) = (temp.path().join("first"), temp.path().join("second"));
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        for name in ["libnvinfer.so.10", "libcudnn.so.9", "libonnxruntime.so", "readme.txt"] {
            std::fs::write(first.join(name), b"").unwrap();
        }
        std::fs::write(second.join("libcudnn.so.9"), b"").unwrap();
        std::fs::write(second.join("libcudart.so.12"), b"").unwrap();

        let libs = collect_gpu_libs(&[first.clone(), second.clone()]);
        assert_eq!(
            libs,
            vec![
                second.join("libcudart.so.12"),
                first.join("libcudnn.so.9"),
                first.join("libnvinfer.so.10"),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn load_priority_orders_cuda_cudnn_tensorrt() {
        assert!(load_priority("libcudart.so.12") < load_priority("libcudnn.so.9"));
        assert!(load_priority("libcublasLt.so.12") < load_priority("libcudnn_ops.so.9"));
        assert!(load_priority("libcudnn.so.9") < load_priority("libnvinfer.so.10"));
        assert_eq!(load_priority("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(load_priority("libpng16.so"), None);
    }

    #[cfg(windows)]
    #[test]
    fn load_priority_orders_cuda_cudnn_tensorrt() {
        assert!(load_priority("cudart64_12.dll") < load_priority("cudnn64_9.dll"));
        assert!(load_priority("cudnn64_9.dll") < load_priority("nvinfer_10.dll"));
        assert_eq!(load_priority("onnxruntime_providers_cuda.dll"), None);
    }
}
