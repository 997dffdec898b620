//! Dynamic library loading for native functions (`spec.md` §4.J, §6).
//!
//! Adapted from the teacher's cross-platform `vm/ffi/loader.rs`, trimmed
//! to the Unix `dlopen`/`dlsym`/`dlclose` path this workspace builds for
//! (`lsvm-core`'s Cargo.toml only carries `libc` under
//! `cfg(unix)`). `spec.md` §9 calls host dynamic libraries out as a
//! pattern to "abstract to a symbol provider interface ... with ordered
//! resolution" — [`LibrarySet`] is that interface: slot 0 is reserved for
//! the host's own exported runtime symbols, and `resolve` tries every
//! loaded library in insertion order, matching `spec.md` §6's
//! native-symbol resolution rule.

use std::ffi::{CStr, CString};
use std::path::Path;

use lsvm_abi::NativeFn;
use thiserror::Error;

/// Errors raised while loading a native library or resolving a symbol.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The library file could not be opened.
    #[error("library not found: {path}")]
    NotFound {
        /// Path or name that was attempted.
        path: String,
    },
    /// A symbol was absent from every loaded library.
    #[error("symbol not found: {symbol}")]
    SymbolNotFound {
        /// The mangled symbol name that was searched for.
        symbol: String,
    },
    /// The path or symbol name was not representable as a C string.
    #[error("invalid name: {0}")]
    InvalidName(String),
}

/// A single loaded dynamic library.
pub struct Library {
    handle: *mut std::ffi::c_void,
    path: String,
}

impl Library {
    /// `dlopen` the library at `path` with `RTLD_NOW | RTLD_LOCAL`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path_str = path.as_ref().to_str().ok_or_else(|| LoadError::InvalidName(format!("{:?}", path.as_ref())))?;
        let c_path = CString::new(path_str).map_err(|e| LoadError::InvalidName(e.to_string()))?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            let detail = unsafe { dlerror_message() };
            return Err(LoadError::NotFound { path: format!("{path_str}: {detail}") });
        }
        Ok(Library { handle, path: path_str.to_owned() })
    }

    /// Resolve `symbol` in this library, if present.
    ///
    /// # Safety
    /// The caller must ensure the resolved symbol's actual signature
    /// matches [`NativeFn`].
    pub unsafe fn symbol(&self, symbol: &str) -> Option<NativeFn> {
        let c_name = CString::new(symbol).ok()?;
        libc::dlerror();
        let sym = libc::dlsym(self.handle, c_name.as_ptr());
        if sym.is_null() {
            return None;
        }
        Some(std::mem::transmute::<*mut std::ffi::c_void, NativeFn>(sym))
    }

    /// Path this library was opened from.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

unsafe impl Send for Library {}
unsafe impl Sync for Library {}

unsafe fn dlerror_message() -> String {
    let ptr = libc::dlerror();
    if ptr.is_null() {
        "unknown error".to_owned()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

/// Every dynamic library the VM currently has open, in load order.
/// Slot 0 is conventionally reserved for the host's own exported
/// runtime symbols (`spec.md` §4.E) but is populated by the registry the
/// same way as any other entry — this set just preserves order.
#[derive(Default)]
pub struct LibrarySet {
    libraries: Vec<Library>,
}

impl LibrarySet {
    /// An empty library set.
    pub fn new() -> LibrarySet {
        LibrarySet { libraries: Vec::new() }
    }

    /// Load and append a library.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        self.libraries.push(Library::open(path)?);
        Ok(())
    }

    /// Resolve `symbol` by trying every loaded library in insertion
    /// order; the first hit wins (`spec.md` §6).
    pub fn resolve(&self, symbol: &str) -> Option<NativeFn> {
        self.libraries.iter().find_map(|lib| unsafe { lib.symbol(symbol) })
    }

    /// Number of libraries currently loaded.
    pub fn len(&self) -> usize {
        self.libraries.len()
    }

    /// Whether no libraries are loaded.
    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }
}
