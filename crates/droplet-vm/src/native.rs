//! Native function registry
//!
//! A name-indexed table of host callbacks. A native receives the VM and an
//! argument count; its contract is to pop exactly `argc` values from the
//! operand stack and push exactly one return value (Nil when it has nothing
//! meaningful to return). Registration is idempotent per name: the last
//! writer wins.

use crate::vm::Vm;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A host callback: `(vm, argc)` with the stack contract above
pub type NativeFn = Arc<dyn Fn(&mut Vm, u8)>;

/// Registry of natives indexed by symbolic name
#[derive(Default)]
pub struct NativeRegistry {
    handlers: FxHashMap<String, NativeFn>,
}

impl NativeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a native by name (replaces any previous registration)
    pub fn register(&mut self, name: &str, handler: impl Fn(&mut Vm, u8) + 'static) {
        self.handlers.insert(name.to_string(), Arc::new(handler));
    }

    /// Look up a handler by name
    pub fn get(&self, name: &str) -> Option<NativeFn> {
        self.handlers.get(name).cloned()
    }

    /// Check if a name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_register_and_get() {
        let mut registry = NativeRegistry::new();
        registry.register("answer", |vm, _argc| vm.stack.push(Value::Int(42)));

        assert!(registry.contains("answer"));
        assert!(!registry.contains("question"));
        assert_eq!(registry.len(), 1);

        let mut vm = Vm::new();
        let handler = registry.get("answer").unwrap();
        handler(&mut vm, 0);
        assert_eq!(vm.stack.pop(), Value::Int(42));
    }

    #[test]
    fn test_last_registration_wins() {
        let mut registry = NativeRegistry::new();
        registry.register("f", |vm, _| vm.stack.push(Value::Int(1)));
        registry.register("f", |vm, _| vm.stack.push(Value::Int(2)));
        assert_eq!(registry.len(), 1);

        let mut vm = Vm::new();
        registry.get("f").unwrap()(&mut vm, 0);
        assert_eq!(vm.stack.pop(), Value::Int(2));
    }
}
