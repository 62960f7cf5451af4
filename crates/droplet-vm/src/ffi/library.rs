//! Dynamic library loading
//!
//! Cross-platform shared-library handles: `dlopen`/`dlsym` on unix,
//! `LoadLibraryW`/`GetProcAddress` on windows.

use thiserror::Error;

/// Errors from the FFI bridge
#[derive(Debug, Error)]
pub enum FfiError {
    /// Library file not found or could not be loaded
    #[error("library not found: {path}")]
    NotFound {
        /// Path that was attempted (with the loader's error appended)
        path: String,
    },

    /// Symbol not found in a loaded library
    #[error("symbol not found: {symbol} in {library}")]
    SymbolNotFound {
        /// Symbol name that was not found
        symbol: String,
        /// Library path
        library: String,
    },

    /// Path or symbol name could not cross the C boundary
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Signature tag/arity combination the bridge does not support
    #[error("unsupported signature {sig} with {argc} arguments")]
    UnsupportedSignature {
        /// The one-byte signature tag
        sig: u8,
        /// Argument count supplied by the call site
        argc: usize,
    },
}

/// Loaded shared-library handle
pub struct Library {
    handle: LibraryHandle,
    path: String,
}

impl Library {
    /// Load a dynamic library from `path`.
    ///
    /// Unix loads with `dlopen(RTLD_NOW | RTLD_LOCAL)`; windows with
    /// `LoadLibraryW`.
    pub fn open(path: &str) -> Result<Self, FfiError> {
        let handle = LibraryHandle::load(path)?;
        Ok(Library {
            handle,
            path: path.to_string(),
        })
    }

    /// Resolve a symbol as a typed function pointer.
    ///
    /// # Safety
    ///
    /// The caller must ensure the symbol's actual signature matches `T` and
    /// that the library outlives every use of the returned pointer. The
    /// bridge guarantees the latter by caching libraries for the VM's
    /// lifetime.
    pub unsafe fn get<T: Copy>(&self, symbol: &str) -> Result<T, FfiError> {
        self.handle.symbol(symbol, &self.path)
    }

    /// Path this library was loaded from
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(unix)]
type LibraryHandle = UnixLibrary;

#[cfg(windows)]
type LibraryHandle = WindowsLibrary;

// ============================================================================
// Unix implementation (Linux, macOS, BSD)
// ============================================================================

#[cfg(unix)]
struct UnixLibrary {
    handle: *mut std::ffi::c_void,
}

#[cfg(unix)]
impl UnixLibrary {
    fn load(path: &str) -> Result<Self, FfiError> {
        use std::ffi::{CStr, CString};

        let c_path =
            CString::new(path).map_err(|e| FfiError::InvalidName(format!("{}: {}", path, e)))?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };

        if handle.is_null() {
            let reason = unsafe {
                let err = libc::dlerror();
                if err.is_null() {
                    "unknown error".to_string()
                } else {
                    CStr::from_ptr(err).to_string_lossy().into_owned()
                }
            };
            return Err(FfiError::NotFound {
                path: format!("{}: {}", path, reason),
            });
        }

        Ok(UnixLibrary { handle })
    }

    unsafe fn symbol<T: Copy>(&self, name: &str, lib_path: &str) -> Result<T, FfiError> {
        use std::ffi::CString;

        let c_name =
            CString::new(name).map_err(|e| FfiError::InvalidName(format!("{}: {}", name, e)))?;

        // Clear any stale error state before resolving
        libc::dlerror();
        let symbol = libc::dlsym(self.handle, c_name.as_ptr());

        if symbol.is_null() {
            return Err(FfiError::SymbolNotFound {
                symbol: name.to_string(),
                library: lib_path.to_string(),
            });
        }

        Ok(std::mem::transmute_copy(&symbol))
    }
}

#[cfg(unix)]
impl Drop for UnixLibrary {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

// ============================================================================
// Windows implementation
// ============================================================================

#[cfg(windows)]
struct WindowsLibrary {
    handle: *mut std::ffi::c_void,
}

#[cfg(windows)]
impl WindowsLibrary {
    fn load(path: &str) -> Result<Self, FfiError> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;

        let wide: Vec<u16> = OsStr::new(path)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        let handle = unsafe { LoadLibraryW(wide.as_ptr()) };
        if handle.is_null() {
            let code = unsafe { GetLastError() };
            return Err(FfiError::NotFound {
                path: format!("{} (error code {})", path, code),
            });
        }

        Ok(WindowsLibrary { handle })
    }

    unsafe fn symbol<T: Copy>(&self, name: &str, lib_path: &str) -> Result<T, FfiError> {
        use std::ffi::CString;

        let c_name =
            CString::new(name).map_err(|e| FfiError::InvalidName(format!("{}: {}", name, e)))?;

        let symbol = GetProcAddress(self.handle, c_name.as_ptr());
        if symbol.is_null() {
            return Err(FfiError::SymbolNotFound {
                symbol: name.to_string(),
                library: lib_path.to_string(),
            });
        }

        Ok(std::mem::transmute_copy(&symbol))
    }
}

#[cfg(windows)]
impl Drop for WindowsLibrary {
    fn drop(&mut self) {
        unsafe {
            FreeLibrary(self.handle);
        }
    }
}

#[cfg(windows)]
extern "system" {
    fn LoadLibraryW(filename: *const u16) -> *mut std::ffi::c_void;
    fn GetProcAddress(
        module: *mut std::ffi::c_void,
        procname: *const i8,
    ) -> *mut std::ffi::c_void;
    fn FreeLibrary(module: *mut std::ffi::c_void) -> i32;
    fn GetLastError() -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_not_found() {
        let result = Library::open("/nonexistent/library.so");
        assert!(matches!(result, Err(FfiError::NotFound { .. })));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_symbol_not_found() {
        let lib = Library::open("libm.so.6").expect("libm should load");
        let result: Result<extern "C" fn(f64) -> f64, _> =
            unsafe { lib.get("definitely_not_a_symbol") };
        assert!(matches!(result, Err(FfiError::SymbolNotFound { .. })));
    }
}
