//! C-ABI foreign function bridge
//!
//! Loads shared libraries by path (cached for the VM's lifetime), resolves
//! exported symbols by name, and dispatches calls through typed trampolines
//! selected by a one-byte signature tag:
//!
//! | sig | call shape               |
//! |-----|--------------------------|
//! | 0   | `int32(int32, int32)`    |
//! | 1   | `int32(int32)`           |
//! | 2   | `double(double, double)` |
//! | 3   | `double(double)`         |
//!
//! Arguments arrive left-to-right (the interpreter pops them right-to-left
//! off the operand stack) and coerce to the declared native type: Int
//! truncates to `int32`, Float truncates to `int32`, either widens to
//! `double`, anything non-numeric becomes zero.

mod library;

pub use library::{FfiError, Library};

use crate::value::Value;
use rustc_hash::FxHashMap;

fn as_i32(value: Value) -> i32 {
    match value {
        Value::Int(i) => i as i32,
        Value::Float(f) => f as i32,
        _ => 0,
    }
}

fn as_f64(value: Value) -> f64 {
    value.as_f64_coerced()
}

/// Library cache and call dispatcher
#[derive(Default)]
pub struct FfiBridge {
    libraries: FxHashMap<String, Library>,
}

impl FfiBridge {
    /// Create an empty bridge
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cached library for `path`, loading it on first use
    pub fn library(&mut self, path: &str) -> Result<&Library, FfiError> {
        if !self.libraries.contains_key(path) {
            let library = Library::open(path)?;
            self.libraries.insert(path.to_string(), library);
        }
        Ok(&self.libraries[path])
    }

    /// Number of libraries loaded so far
    pub fn loaded_count(&self) -> usize {
        self.libraries.len()
    }

    /// Resolve `symbol` in `path` and invoke it per the `sig` tag.
    ///
    /// `args` are in call order. Fails on library load, symbol resolution,
    /// or an unsupported signature/arity combination; the caller turns the
    /// failure into a fault plus a Nil sentinel.
    pub fn call(
        &mut self,
        path: &str,
        symbol: &str,
        sig: u8,
        args: &[Value],
    ) -> Result<Value, FfiError> {
        let library = self.library(path)?;
        match (sig, args.len()) {
            (0, 2) => {
                type F = unsafe extern "C" fn(i32, i32) -> i32;
                let f: F = unsafe { library.get(symbol)? };
                let result = unsafe { f(as_i32(args[0]), as_i32(args[1])) };
                Ok(Value::Int(result as i64))
            }
            (1, 1) => {
                type F = unsafe extern "C" fn(i32) -> i32;
                let f: F = unsafe { library.get(symbol)? };
                let result = unsafe { f(as_i32(args[0])) };
                Ok(Value::Int(result as i64))
            }
            (2, 2) => {
                type F = unsafe extern "C" fn(f64, f64) -> f64;
                let f: F = unsafe { library.get(symbol)? };
                let result = unsafe { f(as_f64(args[0]), as_f64(args[1])) };
                Ok(Value::Float(result))
            }
            (3, 1) => {
                type F = unsafe extern "C" fn(f64) -> f64;
                let f: F = unsafe { library.get(symbol)? };
                let result = unsafe { f(as_f64(args[0])) };
                Ok(Value::Float(result))
            }
            (sig, argc) => Err(FfiError::UnsupportedSignature { sig, argc }),
        }
    }
}
