//! Droplet VM runtime
//!
//! This crate provides the execution engine for Droplet bytecode:
//! - Tagged values and heap objects ([`Value`], [`object::HeapObject`])
//! - Mark-and-sweep garbage-collected heap ([`gc::Heap`])
//! - Operand stack and call frames ([`stack::OperandStack`])
//! - Module loader (see [`loader`])
//! - Native (host callback) registry and the builtin native set
//! - C-ABI FFI bridge ([`ffi::FfiBridge`])
//! - The interpreter loop and entry orchestration ([`Vm`])
//!
//! Runtime faults are non-fatal by design: the offending opcode produces a
//! sentinel value, reports a structured [`host::RuntimeFault`] through the
//! VM's [`host::Host`], and execution continues. Only load failures, a
//! missing entry point, and heap exhaustion abort execution.

pub mod builtins;
pub mod ffi;
pub mod gc;
pub mod host;
pub mod loader;
pub mod native;
pub mod object;
pub mod stack;
pub mod value;
pub mod vm;

pub use gc::{GcStats, Heap};
pub use host::{CaptureHost, Host, RuntimeFault, StderrHost};
pub use loader::Function;
pub use stack::{CallFrame, OperandStack};
pub use value::{ObjRef, Value};
pub use vm::{Vm, VmOptions};

use droplet_bytecode::ModuleError;

/// VM execution errors surfaced to the host
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Malformed module
    #[error("load error: {0}")]
    Load(#[from] ModuleError),

    /// IO error while reading a module file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry function not present in the loaded module
    #[error("entry function not found: {0}")]
    EntryNotFound(String),

    /// Heap exhausted after collection
    #[error("out of memory: {live} live objects exceed the configured limit of {limit}")]
    OutOfMemory {
        /// Live objects after the failed collection
        live: usize,
        /// Configured hard limit
        limit: usize,
    },
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;
