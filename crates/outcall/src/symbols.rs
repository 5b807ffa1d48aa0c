//! Process-wide symbol resolution
//!
//! `resolve_symbol` reproduces the backend loader's lookup rules so that a
//! "can this be called?" check agrees with what the generated code will
//! actually reach. `HostSymbols` is the symbol table those rules run against:
//! explicitly added symbols, the running program, and any library loaded
//! permanently.

use std::ffi::{CStr, CString};
use std::path::Path;

use rustc_hash::FxHashMap;
use thiserror::Error;

/// Leading byte marking a name as an assembly name, to be used verbatim
pub const ASM_NAME_MARKER: char = '\u{1}';

/// Anything that can look up a symbol address by its exact name
pub trait SymbolSource {
    /// Exact-name lookup; no marker handling
    fn search(&self, name: &str) -> Option<usize>;
}

/// Resolve `name` the way the backend loader would.
///
/// A leading [`ASM_NAME_MARKER`] is stripped before the lookup. If the name
/// was marked and the stripped name starts with `_`, a failed lookup is
/// retried without that underscore (legacy C-name decoration).
pub fn resolve_symbol<S: SymbolSource + ?Sized>(source: &S, name: &str) -> Option<usize> {
    let (marked, stripped) = match name.strip_prefix(ASM_NAME_MARKER) {
        Some(rest) => (true, rest),
        None => (false, name),
    };

    if let Some(addr) = source.search(stripped) {
        return Some(addr);
    }

    // Only marked names get the underscore retry.
    if marked {
        if let Some(undecorated) = stripped.strip_prefix('_') {
            return source.search(undecorated);
        }
    }

    None
}

/// Errors that can occur while making a library's symbols visible
#[derive(Debug, Error)]
pub enum LoadError {
    /// Library file not found or could not be loaded
    #[error("Library not found: {path}")]
    NotFound {
        /// Path that was attempted, with the loader's message
        path: String,
    },

    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// Invalid path encoding
    #[error("Invalid UTF-8 in path: {0}")]
    InvalidPath(String),
}

/// The process-wide symbol table used by the real backend.
///
/// Lookup order: explicitly added symbols, then the running program (and
/// everything it links), then libraries added with
/// [`HostSymbols::load_library_permanently`], in load order.
pub struct HostSymbols {
    explicit: FxHashMap<String, usize>,
    libraries: Vec<Library>,
}

impl HostSymbols {
    /// Symbol table covering the running program.
    ///
    /// Falls back to explicit symbols only if the program handle cannot be
    /// opened.
    pub fn new() -> Self {
        let mut libraries = Vec::new();
        match Library::this_program() {
            Ok(program) => libraries.push(program),
            Err(e) => tracing::warn!(target: "outcall", error = %e, "program symbols unavailable"),
        }
        HostSymbols {
            explicit: FxHashMap::default(),
            libraries,
        }
    }

    /// Symbol table that only knows explicitly added symbols
    pub fn isolated() -> Self {
        HostSymbols {
            explicit: FxHashMap::default(),
            libraries: Vec::new(),
        }
    }

    /// Make `name` resolve to `address`, taking precedence over the program
    pub fn add_symbol(&mut self, name: impl Into<String>, address: usize) {
        self.explicit.insert(name.into(), address);
    }

    /// Load a shared library and keep it loaded for the life of the process
    pub fn load_library_permanently<P: AsRef<Path>>(&mut self, path: P) -> Result<(), LoadError> {
        let path_ref = path.as_ref();
        let path_str = path_ref
            .to_str()
            .ok_or_else(|| LoadError::InvalidPath(format!("{:?}", path_ref)))?;

        let library = Library::open(path_str)?;
        tracing::debug!(target: "outcall", path = path_str, "library loaded permanently");
        self.libraries.push(library);
        Ok(())
    }

    /// Number of explicitly added symbols
    pub fn explicit_count(&self) -> usize {
        self.explicit.len()
    }
}

impl Default for HostSymbols {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolSource for HostSymbols {
    fn search(&self, name: &str) -> Option<usize> {
        if let Some(&addr) = self.explicit.get(name) {
            return Some(addr);
        }

        // Names with an interior NUL cannot exist in a symbol table.
        let c_name = CString::new(name).ok()?;
        self.libraries
            .iter()
            .find_map(|library| library.symbol(&c_name))
    }
}

// ============================================================================
// Library handles (never closed)
// ============================================================================

struct Library {
    handle: *mut std::ffi::c_void,
}

// The handle is only passed to the platform loader, which is thread-safe.
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

#[cfg(unix)]
impl Library {
    fn this_program() -> Result<Self, LoadError> {
        // A null path asks for the program itself rather than a library.
        let handle = unsafe { libc::dlopen(std::ptr::null(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if handle.is_null() {
            return Err(LoadError::Platform(last_dl_error()));
        }
        Ok(Library { handle })
    }

    fn open(path: &str) -> Result<Self, LoadError> {
        let c_path = CString::new(path)
            .map_err(|e| LoadError::Platform(format!("Invalid path: {}", e)))?;

        // RTLD_GLOBAL: later lookups through the program handle see it too
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if handle.is_null() {
            return Err(LoadError::NotFound {
                path: format!("{}: {}", path, last_dl_error()),
            });
        }

        Ok(Library { handle })
    }

    fn symbol(&self, name: &CStr) -> Option<usize> {
        let addr = unsafe { libc::dlsym(self.handle, name.as_ptr()) };
        if addr.is_null() {
            None
        } else {
            Some(addr as usize)
        }
    }
}

#[cfg(unix)]
fn last_dl_error() -> String {
    unsafe {
        let err_ptr = libc::dlerror();
        if err_ptr.is_null() {
            "Unknown error".to_string()
        } else {
            CStr::from_ptr(err_ptr).to_string_lossy().into_owned()
        }
    }
}

#[cfg(windows)]
impl Library {
    fn this_program() -> Result<Self, LoadError> {
        let handle = unsafe { GetModuleHandleW(std::ptr::null()) };
        if handle.is_null() {
            let error = unsafe { GetLastError() };
            return Err(LoadError::Platform(format!("error code: {}", error)));
        }
        Ok(Library { handle })
    }

    fn open(path: &str) -> Result<Self, LoadError> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;

        let wide: Vec<u16> = OsStr::new(path)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        let handle = unsafe { LoadLibraryW(wide.as_ptr()) };
        if handle.is_null() {
            let error = unsafe { GetLastError() };
            return Err(LoadError::NotFound {
                path: format!("{} (error code: {})", path, error),
            });
        }

        Ok(Library { handle })
    }

    fn symbol(&self, name: &CStr) -> Option<usize> {
        let addr = unsafe { GetProcAddress(self.handle, name.as_ptr()) };
        if addr.is_null() {
            None
        } else {
            Some(addr as usize)
        }
    }
}

#[cfg(windows)]
extern "system" {
    fn GetModuleHandleW(name: *const u16) -> *mut std::ffi::c_void;
    fn LoadLibraryW(filename: *const u16) -> *mut std::ffi::c_void;
    fn GetProcAddress(module: *mut std::ffi::c_void, procname: *const std::ffi::c_char)
        -> *mut std::ffi::c_void;
    fn GetLastError() -> u32;
}

#[cfg(not(any(unix, windows)))]
impl Library {
    fn this_program() -> Result<Self, LoadError> {
        Err(LoadError::Platform("dynamic symbols unsupported on this platform".to_string()))
    }

    fn open(path: &str) -> Result<Self, LoadError> {
        Err(LoadError::NotFound { path: path.to_string() })
    }

    fn symbol(&self, _name: &CStr) -> Option<usize> {
        None
    }
}
