//! Native inference engine reached through a fixed C ABI
//!
//! An engine library exports eight symbols:
//!
//! | symbol                        | signature                                        |
//! |-------------------------------|--------------------------------------------------|
//! | `runtime_initialization`      | `int (void)`                                     |
//! | `runtime_model_loading`       | `int (const char *path)`                         |
//! | `runtime_inference_execution` | `int (tensors_struct *in, tensors_struct *out)`  |
//! | `runtime_inference_cleanup`   | `int (void)`                                     |
//! | `runtime_destruction`         | `int (void)`                                     |
//! | `runtime_error_message`       | `const char *(void)`                             |
//! | `runtime_version`             | `const char *(void)`                             |
//! | `runtime_name`                | `const char *(void)`                             |
//!
//! Status 0 is success. Output buffers belong to the engine until
//! `runtime_inference_cleanup` is called.

use crate::error::{BridgeError, Result};
use crate::marshal::{read_aggregate, InputAggregate, RawTensors};
use crate::tensor::TensorSet;
use libloading::Library;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

type FnStatus = unsafe extern "C" fn() -> c_int;
type FnModelLoading = unsafe extern "C" fn(*const c_char) -> c_int;
type FnInference = unsafe extern "C" fn(*mut RawTensors, *mut RawTensors) -> c_int;
type FnText = unsafe extern "C" fn() -> *const c_char;

/// Operations every engine offers, native or not
pub trait InferenceEngine: Send {
    fn name(&self) -> String;

    fn version(&self) -> String;

    fn initialize(&mut self) -> Result<()>;

    fn load_model(&mut self, path: &Path) -> Result<()>;

    /// Run one inference; the returned set owns copies of the outputs
    fn infer(&mut self, inputs: &TensorSet) -> Result<TensorSet>;

    /// Release the engine's output buffers from the last inference
    fn cleanup(&mut self) -> Result<()>;

    fn destroy(&mut self) -> Result<()>;
}

impl<T: InferenceEngine + ?Sized> InferenceEngine for Box<T> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn version(&self) -> String {
        (**self).version()
    }

    fn initialize(&mut self) -> Result<()> {
        (**self).initialize()
    }

    fn load_model(&mut self, path: &Path) -> Result<()> {
        (**self).load_model(path)
    }

    fn infer(&mut self, inputs: &TensorSet) -> Result<TensorSet> {
        (**self).infer(inputs)
    }

    fn cleanup(&mut self) -> Result<()> {
        (**self).cleanup()
    }

    fn destroy(&mut self) -> Result<()> {
        (**self).destroy()
    }
}

/// How the engine library is mapped into the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Plain `dlopen`; every load of the same path shares one copy
    #[default]
    Shared,
    /// `dlmopen` into a fresh link-map namespace so each instance has its
    /// own globals (glibc only)
    Namespaced,
}

/// Resolved engine entry points
#[derive(Clone, Copy)]
struct EngineSymbols {
    initialization: FnStatus,
    model_loading: FnModelLoading,
    inference_execution: FnInference,
    inference_cleanup: FnStatus,
    destruction: FnStatus,
    error_message: FnText,
    version: FnText,
    name: FnText,
}

impl EngineSymbols {
    /// # Safety
    /// `lib` must export the engine ABI with the documented signatures
    unsafe fn resolve(lib: &Library) -> std::result::Result<Self, libloading::Error> {
        Ok(Self {
            initialization: *lib.get::<FnStatus>(b"runtime_initialization\0")?,
            model_loading: *lib.get::<FnModelLoading>(b"runtime_model_loading\0")?,
            inference_execution: *lib.get::<FnInference>(b"runtime_inference_execution\0")?,
            inference_cleanup: *lib.get::<FnStatus>(b"runtime_inference_cleanup\0")?,
            destruction: *lib.get::<FnStatus>(b"runtime_destruction\0")?,
            error_message: *lib.get::<FnText>(b"runtime_error_message\0")?,
            version: *lib.get::<FnText>(b"runtime_version\0")?,
            name: *lib.get::<FnText>(b"runtime_name\0")?,
        })
    }
}

/// Engine library loaded with [`libloading`]
pub struct NativeEngine {
    path: PathBuf,
    symbols: EngineSymbols,
    destroyed: bool,
    // Unloaded after `drop` has called runtime_destruction
    _lib: Option<Library>,
}

impl NativeEngine {
    /// Load the library at `path` and resolve every engine symbol
    pub fn load(path: &Path, isolation: Isolation) -> Result<Self> {
        let load_error = |reason: String| BridgeError::LibraryLoad {
            path: path.to_path_buf(),
            reason,
        };

        let lib = match isolation {
            Isolation::Shared => unsafe { Library::new(path) }.map_err(|e| load_error(e.to_string()))?,
            Isolation::Namespaced => open_namespaced(path).map_err(load_error)?,
        };
        let symbols = unsafe { EngineSymbols::resolve(&lib) }.map_err(|e| load_error(e.to_string()))?;

        let engine = NativeEngine {
            path: path.to_path_buf(),
            symbols,
            destroyed: false,
            _lib: Some(lib),
        };
        log::info!(
            "Loaded engine {} {} from {} ({:?})",
            engine.name(),
            engine.version(),
            path.display(),
            isolation
        );
        Ok(engine)
    }

    #[cfg(test)]
    fn from_symbols(path: &str, symbols: EngineSymbols) -> Self {
        NativeEngine {
            path: PathBuf::from(path),
            symbols,
            destroyed: false,
            _lib: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The engine's description of its last failure
    pub fn error_message(&self) -> String {
        unsafe { text((self.symbols.error_message)()) }
    }

    fn check(&self, call: &'static str, status: c_int) -> Result<()> {
        if status == 0 {
            Ok(())
        } else {
            Err(BridgeError::FfiStatus {
                call,
                status,
                message: self.error_message(),
            })
        }
    }
}

impl InferenceEngine for NativeEngine {
    fn name(&self) -> String {
        unsafe { text((self.symbols.name)()) }
    }

    fn version(&self) -> String {
        unsafe { text((self.symbols.version)()) }
    }

    fn initialize(&mut self) -> Result<()> {
        let status = unsafe { (self.symbols.initialization)() };
        self.check("runtime_initialization", status)
    }

    fn load_model(&mut self, path: &Path) -> Result<()> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| BridgeError::Config(format!("model path {}: {}", path.display(), e)))?;
        let status = unsafe { (self.symbols.model_loading)(c_path.as_ptr()) };
        self.check("runtime_model_loading", status)?;
        log::info!("Model loaded: {}", path.display());
        Ok(())
    }

    fn infer(&mut self, inputs: &TensorSet) -> Result<TensorSet> {
        let mut aggregate = InputAggregate::new(inputs)?;
        let mut outputs = RawTensors::empty();

        let status = unsafe { (self.symbols.inference_execution)(aggregate.as_mut_ptr(), &mut outputs) };
        self.check("runtime_inference_execution", status)?;

        // SAFETY: on success the engine has filled `outputs` and keeps the
        // buffers alive until runtime_inference_cleanup
        unsafe { read_aggregate(&outputs) }
    }

    fn cleanup(&mut self) -> Result<()> {
        let status = unsafe { (self.symbols.inference_cleanup)() };
        self.check("runtime_inference_cleanup", status)
    }

    fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        let status = unsafe { (self.symbols.destruction)() };
        self.check("runtime_destruction", status)
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            log::error!("Engine {} failed to shut down: {}", self.path.display(), e);
        }
    }
}

unsafe fn text(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn open_namespaced(path: &Path) -> std::result::Result<Library, String> {
    use std::os::raw::{c_long, c_void};

    const LM_ID_NEWLM: c_long = -1;

    extern "C" {
        fn dlmopen(lmid: c_long, filename: *const c_char, flags: c_int) -> *mut c_void;
    }

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| e.to_string())?;
    let handle = unsafe { dlmopen(LM_ID_NEWLM, c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_DEEPBIND) };
    if handle.is_null() {
        let reason = unsafe { text(libc::dlerror()) };
        return Err(if reason.is_empty() {
            "dlmopen failed".to_string()
        } else {
            reason
        });
    }

    // SAFETY: handle is a live dlopen-family handle, closed by Library's drop
    Ok(unsafe { libloading::os::unix::Library::from_raw(handle) }.into())
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn open_namespaced(_path: &Path) -> std::result::Result<Library, String> {
    Err("namespaced loading requires glibc".to_string())
}
