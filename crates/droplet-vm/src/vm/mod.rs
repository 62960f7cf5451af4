//! VM state and entry orchestration
//!
//! A [`Vm`] owns everything a single execution needs: operand stack, call
//! frames, constant pool, function table, globals, native registry, FFI
//! library cache, the garbage-collected heap, and the host channels. One VM
//! is one single-threaded mutator; nothing here is shared across threads.

mod interpreter;

use crate::builtins::register_builtins;
use crate::ffi::FfiBridge;
use crate::gc::{Heap, DEFAULT_GC_THRESHOLD};
use crate::host::{Host, RuntimeFault, StderrHost};
use crate::loader::Function;
use crate::native::{NativeFn, NativeRegistry};
use crate::stack::{CallFrame, OperandStack};
use crate::value::Value;
use crate::{VmError, VmResult};
use droplet_bytecode::Module;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// VM construction options
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Collection threshold in live registry entries
    pub gc_threshold: usize,
    /// Hard limit on live objects; execution aborts with
    /// [`VmError::OutOfMemory`] when a collection cannot get back under it.
    /// Zero means unlimited.
    pub max_live_objects: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            gc_threshold: DEFAULT_GC_THRESHOLD,
            max_live_objects: 0,
        }
    }
}

/// The Droplet virtual machine
pub struct Vm {
    /// Operand stack (also holds frame locals)
    pub stack: OperandStack,
    /// Garbage-collected heap
    pub heap: Heap,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) constants: Vec<Value>,
    pub(crate) functions: Vec<Arc<Function>>,
    pub(crate) function_index: FxHashMap<String, u32>,
    pub(crate) globals: FxHashMap<String, Value>,
    pub(crate) natives: NativeRegistry,
    pub(crate) ffi: FfiBridge,
    pub(crate) host: Box<dyn Host>,
    pub(crate) options: VmOptions,
    pub(crate) halt: Option<i32>,
}

impl Vm {
    /// Create a VM with default options and the stderr host
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    /// Create a VM with explicit options
    pub fn with_options(options: VmOptions) -> Self {
        Self {
            stack: OperandStack::new(),
            heap: Heap::with_threshold(options.gc_threshold),
            frames: Vec::new(),
            constants: Vec::new(),
            functions: Vec::new(),
            function_index: FxHashMap::default(),
            globals: FxHashMap::default(),
            natives: NativeRegistry::new(),
            ffi: FfiBridge::new(),
            host: Box::new(StderrHost),
            options,
            halt: None,
        }
    }

    /// Replace the host channels
    pub fn set_host(&mut self, host: Box<dyn Host>) {
        self.host = host;
    }

    /// Report a runtime fault through the host
    pub fn report(&mut self, fault: RuntimeFault) {
        self.host.fault(&fault);
    }

    /// Send native output through the host
    pub fn host_out(&mut self, text: &str) {
        self.host.out(text);
    }

    /// Register a native function (last registration per name wins)
    pub fn register_native(&mut self, name: &str, handler: impl Fn(&mut Vm, u8) + 'static) {
        self.natives.register(name, handler);
    }

    pub(crate) fn native(&self, name: &str) -> Option<NativeFn> {
        self.natives.get(name)
    }

    /// Look up a function-table index by name
    pub fn function_index(&self, name: &str) -> Option<u32> {
        self.function_index.get(name).copied()
    }

    /// Loaded constant pool (strings already materialized as heap objects)
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// Read a global by name
    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).copied()
    }

    /// Write a global by name (created lazily on first store)
    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    /// Current call-frame depth
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Ask the interpreter loop to stop after the current opcode
    pub fn request_halt(&mut self, code: i32) {
        self.halt = Some(code);
    }

    /// Exit code requested via `exit`, if any
    pub fn exit_code(&self) -> Option<i32> {
        self.halt
    }

    /// Push a call frame for `index` over the top `argc` stack values.
    ///
    /// Slot 0 lands on the deepest argument; locals beyond the arguments
    /// are reserved and Nil-filled before any callee code runs. An invalid
    /// index faults, consumes the arguments, and leaves a Nil result.
    pub fn call_function_by_index(&mut self, index: u32, argc: u8) {
        let Some(function) = self.functions.get(index as usize).cloned() else {
            self.report(RuntimeFault::UnknownFunction(index));
            for _ in 0..argc {
                self.stack.pop();
            }
            self.stack.push(Value::Nil);
            return;
        };

        let local_base = self.stack.depth().saturating_sub(argc as usize);
        let extra = function.local_count.saturating_sub(argc);
        for _ in 0..extra {
            self.stack.push(Value::Nil);
        }
        self.frames.push(CallFrame {
            function,
            ip: 0,
            local_base,
        });
    }

    /// Run a full collection with the canonical root set: every live
    /// operand-stack slot, every global, every constant-pool entry.
    pub fn collect_garbage(&mut self) {
        let heap = &mut self.heap;
        let stack = &self.stack;
        let globals = &self.globals;
        let constants = &self.constants;
        heap.collect(|mark| {
            for value in stack.live() {
                mark(*value);
            }
            for value in globals.values() {
                mark(*value);
            }
            for value in constants {
                mark(*value);
            }
        });
    }

    /// Entry orchestration: load `module`, resolve `main`, run to fixation,
    /// and return the final value `main` left on the stack.
    ///
    /// Natives must be registered before the call. [`Vm::default`] starts
    /// from the builtin set; [`Vm::new`] starts empty.
    pub fn run_module(&mut self, module: &Module) -> VmResult<Value> {
        self.load_module(module)?;
        let main = self
            .function_index("main")
            .ok_or_else(|| VmError::EntryNotFound("main".to_string()))?;
        self.call_function_by_index(main, 0);
        self.run()?;
        Ok(self.stack.pop())
    }
}

impl Default for Vm {
    fn default() -> Self {
        let mut vm = Self::new();
        register_builtins(&mut vm);
        vm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CaptureHost;
    use droplet_bytecode::{CodeBuilder, ModuleWriter};

    #[test]
    fn test_entry_not_found() {
        let mut writer = ModuleWriter::new();
        let mut not_main = CodeBuilder::new();
        not_main.ret(0);
        writer.add_function("helper", 0, 0, not_main);
        let module = writer.finish();

        let mut vm = Vm::new();
        assert!(matches!(
            vm.run_module(&module),
            Err(VmError::EntryNotFound(name)) if name == "main"
        ));
    }

    #[test]
    fn test_call_unknown_function_faults() {
        let host = CaptureHost::new();
        let mut vm = Vm::new();
        vm.set_host(Box::new(host.clone()));

        vm.stack.push(Value::Int(1));
        vm.call_function_by_index(7, 1);

        assert_eq!(vm.frame_depth(), 0);
        assert_eq!(vm.stack.pop(), Value::Nil);
        assert!(vm.stack.is_empty());
        assert_eq!(host.faults(), vec![RuntimeFault::UnknownFunction(7)]);
    }

    #[test]
    fn test_frame_entry_reserves_locals() {
        let mut writer = ModuleWriter::new();
        let mut f = CodeBuilder::new();
        f.ret(0);
        writer.add_function("f", 1, 3, f);
        let module = writer.finish();

        let mut vm = Vm::new();
        vm.load_module(&module).unwrap();
        vm.stack.push(Value::Int(42));
        vm.call_function_by_index(0, 1);

        // arg + two reserved Nil slots
        assert_eq!(vm.stack.depth(), 3);
        assert_eq!(vm.stack.get(0), Some(Value::Int(42)));
        assert_eq!(vm.stack.get(1), Some(Value::Nil));
        assert_eq!(vm.stack.get(2), Some(Value::Nil));
        assert_eq!(vm.frames[0].local_base, 0);
    }

    #[test]
    fn test_globals_lazily_created() {
        let mut vm = Vm::new();
        assert_eq!(vm.global("x"), None);
        vm.set_global("x", Value::Int(5));
        assert_eq!(vm.global("x"), Some(Value::Int(5)));
    }

    #[test]
    fn test_collect_garbage_roots() {
        let mut vm = Vm::new();
        let on_stack = vm.heap.alloc_string("stack");
        vm.stack.push(Value::Object(on_stack));
        let in_global = vm.heap.alloc_string("global");
        vm.set_global("g", Value::Object(in_global));
        let dead = vm.heap.alloc_string("dead");

        vm.collect_garbage();

        assert!(vm.heap.contains(on_stack));
        assert!(vm.heap.contains(in_global));
        assert!(!vm.heap.contains(dead));
    }
}
