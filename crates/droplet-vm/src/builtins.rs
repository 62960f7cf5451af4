//! Builtin native functions
//!
//! The standard native set the entry orchestration registers before loading
//! a module. Output goes through the VM's host, not straight to stdout, so
//! embedders and tests can capture it.

use crate::object::HeapObject;
use crate::value::Value;
use crate::vm::Vm;

/// Register the builtin native set on a VM
pub fn register_builtins(vm: &mut Vm) {
    vm.register_native("print", native_print);
    vm.register_native("println", native_println);
    vm.register_native("str", native_str);
    vm.register_native("len", native_len);
    vm.register_native("int", native_int);
    vm.register_native("float", native_float);
    vm.register_native("exit", native_exit);
}

fn render_args(vm: &mut Vm, argc: u8) -> String {
    let mut text = String::new();
    // deepest argument first
    for i in (0..argc).rev() {
        text.push_str(&vm.heap.display(vm.stack.peek(i as usize)));
        if i > 0 {
            text.push(' ');
        }
    }
    for _ in 0..argc {
        vm.stack.pop();
    }
    text
}

fn native_print(vm: &mut Vm, argc: u8) {
    let text = render_args(vm, argc);
    vm.host_out(&text);
    vm.stack.push(Value::Nil);
}

fn native_println(vm: &mut Vm, argc: u8) {
    let mut text = render_args(vm, argc);
    text.push('\n');
    vm.host_out(&text);
    vm.stack.push(Value::Nil);
}

fn native_str(vm: &mut Vm, argc: u8) {
    if argc != 1 {
        for _ in 0..argc {
            vm.stack.pop();
        }
        vm.stack.push(Value::Nil);
        return;
    }
    let value = vm.stack.pop();
    let text = vm.heap.display(value);
    let handle = vm.heap.alloc_string(text);
    vm.stack.push(Value::Object(handle));
}

fn native_len(vm: &mut Vm, argc: u8) {
    if argc != 1 {
        for _ in 0..argc {
            vm.stack.pop();
        }
        vm.stack.push(Value::Int(0));
        return;
    }
    let value = vm.stack.pop();
    let len = match value {
        Value::Object(r) => match vm.heap.get(r) {
            Some(HeapObject::Str(s)) => s.len(),
            Some(HeapObject::Array(items)) => items.len(),
            Some(HeapObject::Map(entries)) => entries.len(),
            _ => 0,
        },
        _ => 0,
    };
    vm.stack.push(Value::Int(len as i64));
}

fn native_int(vm: &mut Vm, argc: u8) {
    if argc != 1 {
        for _ in 0..argc {
            vm.stack.pop();
        }
        vm.stack.push(Value::Int(0));
        return;
    }
    let value = vm.stack.pop();
    let result = match value {
        Value::Int(i) => i,
        Value::Float(f) => f as i64,
        other => vm.heap.display(other).trim().parse::<i64>().unwrap_or(0),
    };
    vm.stack.push(Value::Int(result));
}

fn native_float(vm: &mut Vm, argc: u8) {
    if argc != 1 {
        for _ in 0..argc {
            vm.stack.pop();
        }
        vm.stack.push(Value::Float(0.0));
        return;
    }
    let value = vm.stack.pop();
    let result = match value {
        Value::Float(f) => f,
        Value::Int(i) => i as f64,
        other => vm.heap.display(other).trim().parse::<f64>().unwrap_or(0.0),
    };
    vm.stack.push(Value::Float(result));
}

fn native_exit(vm: &mut Vm, argc: u8) {
    let mut code = 0;
    for i in 0..argc {
        let value = vm.stack.pop();
        if i == argc - 1 {
            // deepest value is the first argument
            code = value.as_i64_coerced() as i32;
        }
    }
    vm.request_halt(code);
    vm.stack.push(Value::Nil);
}
