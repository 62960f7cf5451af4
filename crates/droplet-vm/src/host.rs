//! Host interface
//!
//! The VM never writes to stdout or stderr itself: native output and
//! runtime-fault diagnostics flow through a [`Host`] supplied by the
//! embedder. The default [`StderrHost`] renders faults to stderr and native
//! output to stdout; [`CaptureHost`] records both for assertions.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use thiserror::Error;

/// A non-fatal runtime fault.
///
/// The offending opcode produces a sentinel value (Nil, zero, or false) and
/// execution continues; the fault itself is delivered to the host.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeFault {
    /// Constant pool index out of range
    #[error("constant index {0} out of range")]
    BadConstant(u32),

    /// Constant referenced as a name is not a string
    #[error("constant {0} is not a string")]
    ConstantNotString(u32),

    /// Function table index out of range
    #[error("unknown function index {0}")]
    UnknownFunction(u32),

    /// Native name not present in the registry
    #[error("native function not registered: {0}")]
    UnknownNative(String),

    /// Operand incompatible with the opcode's expectation
    #[error("{op}: expected {expected}, got {actual}")]
    TypeCoercion {
        /// Opcode mnemonic
        op: &'static str,
        /// Expected operand kind
        expected: &'static str,
        /// Actual operand kind
        actual: &'static str,
    },

    /// Out-of-range array index
    #[error("array index {index} out of range (len {len})")]
    IndexOutOfRange {
        /// The requested index
        index: i64,
        /// The array length at the time of access
        len: usize,
    },

    /// Integer modulo with a zero divisor
    #[error("integer modulo by zero")]
    ModuloByZero,

    /// FFI failure (library load, symbol resolution, unsupported signature)
    #[error("ffi: {0}")]
    Ffi(String),

    /// Undecodable opcode byte; halts the interpreter loop
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
}

/// Host-supplied channels for diagnostics and native output
pub trait Host {
    /// Deliver a runtime fault
    fn fault(&mut self, fault: &RuntimeFault);

    /// Deliver native output (`print`/`println` text, no newline added)
    fn out(&mut self, text: &str);
}

/// Default host: faults to stderr, output to stdout
pub struct StderrHost;

impl Host for StderrHost {
    fn fault(&mut self, fault: &RuntimeFault) {
        eprintln!("droplet: {}", fault);
    }

    fn out(&mut self, text: &str) {
        print!("{}", text);
        let _ = std::io::stdout().flush();
    }
}

#[derive(Default)]
struct Captured {
    faults: Vec<RuntimeFault>,
    output: String,
}

/// Recording host for tests.
///
/// Clones share the same buffers, so a test can keep one handle and hand
/// the other to the VM.
#[derive(Clone, Default)]
pub struct CaptureHost {
    inner: Rc<RefCell<Captured>>,
}

impl CaptureHost {
    /// Create an empty capture host
    pub fn new() -> Self {
        Self::default()
    }

    /// All faults reported so far
    pub fn faults(&self) -> Vec<RuntimeFault> {
        self.inner.borrow().faults.clone()
    }

    /// Number of faults reported so far
    pub fn fault_count(&self) -> usize {
        self.inner.borrow().faults.len()
    }

    /// Accumulated native output
    pub fn output(&self) -> String {
        self.inner.borrow().output.clone()
    }
}

impl Host for CaptureHost {
    fn fault(&mut self, fault: &RuntimeFault) {
        self.inner.borrow_mut().faults.push(fault.clone());
    }

    fn out(&mut self, text: &str) {
        self.inner.borrow_mut().output.push_str(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_host_shares_buffers() {
        let host = CaptureHost::new();
        let mut handle = host.clone();
        handle.out("hello ");
        handle.out("world");
        handle.fault(&RuntimeFault::ModuloByZero);

        assert_eq!(host.output(), "hello world");
        assert_eq!(host.fault_count(), 1);
        assert_eq!(host.faults(), vec![RuntimeFault::ModuloByZero]);
    }

    #[test]
    fn test_fault_rendering() {
        let fault = RuntimeFault::TypeCoercion {
            op: "GET_FIELD",
            expected: "instance",
            actual: "string",
        };
        assert_eq!(fault.to_string(), "GET_FIELD: expected instance, got string");
        assert_eq!(
            RuntimeFault::IndexOutOfRange { index: 5, len: 2 }.to_string(),
            "array index 5 out of range (len 2)"
        );
    }
}
