//! The fetch-decode-execute loop
//!
//! Single-threaded, synchronous, non-preemptive. Each iteration polls the
//! collector, reads one opcode from the top frame at `ip`, and dispatches.
//! Inline operands are little-endian: one byte for argument counts and
//! local slots, four bytes for indices and jump targets.
//!
//! Runtime faults never unwind the loop: the opcode pushes its sentinel,
//! the fault goes to the host, and execution continues. The loop itself
//! ends when the frame stack drains, a halt is requested, or an opcode byte
//! does not decode.

use crate::host::RuntimeFault;
use crate::object::HeapObject;
use crate::value::Value;
use crate::vm::Vm;
use crate::{VmError, VmResult};
use droplet_bytecode::Opcode;

impl Vm {
    /// Drive the interpreter until the call-frame stack is empty (or a halt
    /// is requested, or the heap limit is exceeded).
    pub fn run(&mut self) -> VmResult<()> {
        while !self.frames.is_empty() {
            if self.halt.is_some() {
                break;
            }
            self.poll_gc()?;

            let frame = self.frames.last().expect("loop precondition");
            if frame.ip >= frame.function.code.len() {
                // Falling off the end of a function is an implicit bare return
                self.do_return(0);
                continue;
            }

            let byte = self.read_u8();
            let Some(op) = Opcode::from_u8(byte) else {
                self.report(RuntimeFault::UnknownOpcode(byte));
                return Ok(());
            };

            match op {
                // Stack manipulation
                Opcode::PushConst => self.op_push_const(),
                Opcode::Pop => {
                    self.stack.pop();
                }
                Opcode::Dup => {
                    let top = self.stack.peek(0);
                    self.stack.push(top);
                }
                Opcode::Swap => {
                    let a = self.stack.pop();
                    let b = self.stack.pop();
                    self.stack.push(a);
                    self.stack.push(b);
                }
                Opcode::Rot => {
                    let a = self.stack.pop();
                    let b = self.stack.pop();
                    let c = self.stack.pop();
                    self.stack.push(b);
                    self.stack.push(a);
                    self.stack.push(c);
                }

                // Locals & globals
                Opcode::LoadLocal => self.op_load_local(),
                Opcode::StoreLocal => self.op_store_local(),
                Opcode::LoadGlobal => self.op_load_global(),
                Opcode::StoreGlobal => self.op_store_global(),

                // Arithmetic
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                    self.op_arithmetic(op)
                }

                // Logical
                Opcode::And => {
                    let b = self.stack.pop();
                    let a = self.stack.pop();
                    self.stack.push(Value::Bool(a.is_truthy() && b.is_truthy()));
                }
                Opcode::Or => {
                    let b = self.stack.pop();
                    let a = self.stack.pop();
                    self.stack.push(Value::Bool(a.is_truthy() || b.is_truthy()));
                }
                Opcode::Not => {
                    let a = self.stack.pop();
                    self.stack.push(Value::Bool(!a.is_truthy()));
                }

                // Comparison
                Opcode::Eq
                | Opcode::Neq
                | Opcode::Lt
                | Opcode::Gt
                | Opcode::Lte
                | Opcode::Gte => self.op_compare(op),

                // Control flow
                Opcode::Jump => {
                    let target = self.read_u32();
                    self.jump_to(target);
                }
                Opcode::JumpIfFalse => {
                    let target = self.read_u32();
                    let condition = self.stack.pop();
                    if !condition.is_truthy() {
                        self.jump_to(target);
                    }
                }
                Opcode::JumpIfTrue => {
                    let target = self.read_u32();
                    let condition = self.stack.pop();
                    if condition.is_truthy() {
                        self.jump_to(target);
                    }
                }

                // Calls
                Opcode::Call => {
                    let index = self.read_u32();
                    let argc = self.read_u8();
                    self.call_function_by_index(index, argc);
                }
                Opcode::Return => {
                    let count = self.read_u8();
                    self.do_return(count);
                }
                Opcode::CallNative => self.op_call_native(),
                Opcode::CallFfi => self.op_call_ffi(),

                // Object operations
                Opcode::NewObject => self.op_new_object(),
                Opcode::GetField => self.op_get_field(),
                Opcode::SetField => self.op_set_field(),
                Opcode::IsInstance => self.op_is_instance(),

                // Array operations
                Opcode::NewArray => {
                    let handle = self.heap.alloc_array();
                    self.stack.push(Value::Object(handle));
                }
                Opcode::ArrayGet => self.op_array_get(),
                Opcode::ArraySet => self.op_array_set(),

                // Map operations
                Opcode::NewMap => {
                    let handle = self.heap.alloc_map();
                    self.stack.push(Value::Object(handle));
                }
                Opcode::MapGet => self.op_map_get(),
                Opcode::MapSet => self.op_map_set(),

                // String operations
                Opcode::StringConcat => self.op_string_concat(),
                Opcode::StringLength => self.op_string_length(),
                Opcode::StringSubstr => self.op_string_substr(),
                Opcode::StringEq => self.op_string_eq(),
                Opcode::StringGetChar => self.op_string_get_char(),
            }
        }
        Ok(())
    }

    // ========================================================================
    // Fetch helpers
    // ========================================================================

    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("active frame");
        let code = &frame.function.code;
        if frame.ip >= code.len() {
            return 0;
        }
        let value = code[frame.ip];
        frame.ip += 1;
        value
    }

    fn read_u32(&mut self) -> u32 {
        let frame = self.frames.last_mut().expect("active frame");
        let code = &frame.function.code;
        if frame.ip + 4 > code.len() {
            frame.ip = code.len();
            return 0;
        }
        let value = u32::from_le_bytes(code[frame.ip..frame.ip + 4].try_into().unwrap());
        frame.ip += 4;
        value
    }

    fn jump_to(&mut self, target: u32) {
        // Targets are byte offsets local to the current function, never
        // module-global addresses.
        let frame = self.frames.last_mut().expect("active frame");
        frame.ip = target as usize;
    }

    fn poll_gc(&mut self) -> VmResult<()> {
        if !self.heap.should_collect() {
            return Ok(());
        }
        self.collect_garbage();
        let limit = self.options.max_live_objects;
        if limit > 0 && self.heap.live() > limit {
            return Err(VmError::OutOfMemory {
                live: self.heap.live(),
                limit,
            });
        }
        Ok(())
    }

    /// Resolve a constant that the opcode expects to be a string name
    fn constant_name(&mut self, index: u32) -> Option<String> {
        let Some(value) = self.constants.get(index as usize).copied() else {
            self.report(RuntimeFault::BadConstant(index));
            return None;
        };
        match self.heap.str_value(value) {
            Some(name) => Some(name.to_string()),
            None => {
                self.report(RuntimeFault::ConstantNotString(index));
                None
            }
        }
    }

    /// Kind of a value for fault messages (heap objects report their kind)
    fn kind_of(&self, value: Value) -> &'static str {
        match value {
            Value::Object(r) => self.heap.get(r).map(|o| o.kind_name()).unwrap_or("object"),
            other => other.type_name(),
        }
    }

    fn coercion_fault(&mut self, op: &'static str, expected: &'static str, value: Value) {
        let actual = self.kind_of(value);
        self.report(RuntimeFault::TypeCoercion {
            op,
            expected,
            actual,
        });
    }

    // ========================================================================
    // Frames
    // ========================================================================

    /// Pop `count` return values, discard the top frame, truncate the stack
    /// to the frame's base, and re-push the values in their original push
    /// order (the first returned value ends up deepest).
    pub(crate) fn do_return(&mut self, count: u8) {
        let mut returns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            returns.push(self.stack.pop());
        }
        let Some(frame) = self.frames.pop() else {
            return;
        };
        self.stack.truncate_to(frame.local_base);
        for value in returns.into_iter().rev() {
            self.stack.push(value);
        }
    }

    // ========================================================================
    // Opcode handlers
    // ========================================================================

    fn op_push_const(&mut self) {
        let index = self.read_u32();
        match self.constants.get(index as usize).copied() {
            Some(value) => self.stack.push(value),
            None => {
                self.report(RuntimeFault::BadConstant(index));
                self.stack.push(Value::Nil);
            }
        }
    }

    fn op_load_local(&mut self) {
        let slot = self.read_u8();
        let base = self.frames.last().expect("active frame").local_base;
        let value = self.stack.get(base + slot as usize).unwrap_or(Value::Nil);
        self.stack.push(value);
    }

    fn op_store_local(&mut self) {
        let slot = self.read_u8();
        let base = self.frames.last().expect("active frame").local_base;
        let value = self.stack.pop();
        self.stack.set(base + slot as usize, value);
    }

    fn op_load_global(&mut self) {
        let index = self.read_u32();
        let Some(name) = self.constant_name(index) else {
            self.stack.push(Value::Nil);
            return;
        };
        let value = self.globals.get(&name).copied().unwrap_or(Value::Nil);
        self.stack.push(value);
    }

    fn op_store_global(&mut self) {
        let index = self.read_u32();
        let value = self.stack.pop();
        if let Some(name) = self.constant_name(index) {
            self.globals.insert(name, value);
        }
    }

    fn op_arithmetic(&mut self, op: Opcode) {
        let b = self.stack.pop();
        let a = self.stack.pop();

        // Float math when either side is Float; DIV always yields Float.
        let float_math = matches!(a, Value::Float(_))
            || matches!(b, Value::Float(_))
            || op == Opcode::Div;

        if float_math {
            let x = a.as_f64_coerced();
            let y = b.as_f64_coerced();
            let result = match op {
                Opcode::Add => x + y,
                Opcode::Sub => x - y,
                Opcode::Mul => x * y,
                Opcode::Div => x / y,
                Opcode::Mod => x % y,
                _ => unreachable!(),
            };
            self.stack.push(Value::Float(result));
        } else {
            let x = a.as_i64_coerced();
            let y = b.as_i64_coerced();
            let result = match op {
                Opcode::Add => x.wrapping_add(y),
                Opcode::Sub => x.wrapping_sub(y),
                Opcode::Mul => x.wrapping_mul(y),
                Opcode::Mod => {
                    if y == 0 {
                        self.report(RuntimeFault::ModuloByZero);
                        0
                    } else {
                        // truncating modulo, sign follows the dividend
                        x.wrapping_rem(y)
                    }
                }
                _ => unreachable!(),
            };
            self.stack.push(Value::Int(result));
        }
    }

    fn op_compare(&mut self, op: Opcode) {
        let b = self.stack.pop();
        let a = self.stack.pop();

        let result = if a.is_numeric() && b.is_numeric() {
            if matches!(a, Value::Float(_)) || matches!(b, Value::Float(_)) {
                let x = a.as_f64_coerced();
                let y = b.as_f64_coerced();
                match op {
                    Opcode::Eq => x == y,
                    Opcode::Neq => x != y,
                    Opcode::Lt => x < y,
                    Opcode::Gt => x > y,
                    Opcode::Lte => x <= y,
                    Opcode::Gte => x >= y,
                    _ => unreachable!(),
                }
            } else {
                let x = a.as_i64_coerced();
                let y = b.as_i64_coerced();
                match op {
                    Opcode::Eq => x == y,
                    Opcode::Neq => x != y,
                    Opcode::Lt => x < y,
                    Opcode::Gt => x > y,
                    Opcode::Lte => x <= y,
                    Opcode::Gte => x >= y,
                    _ => unreachable!(),
                }
            }
        } else if let (Value::Object(ra), Value::Object(rb)) = (a, b) {
            match (self.heap.str_value(a), self.heap.str_value(b)) {
                (Some(sa), Some(sb)) => match op {
                    Opcode::Eq => sa == sb,
                    Opcode::Neq => sa != sb,
                    Opcode::Lt => sa < sb,
                    Opcode::Gt => sa > sb,
                    Opcode::Lte => sa <= sb,
                    Opcode::Gte => sa >= sb,
                    _ => unreachable!(),
                },
                // non-string objects compare by identity, equality only
                _ => match op {
                    Opcode::Eq => ra == rb,
                    Opcode::Neq => ra != rb,
                    _ => false,
                },
            }
        } else {
            // cross-kind: display-string equality, ordering is always false
            match op {
                Opcode::Eq => self.heap.display(a) == self.heap.display(b),
                Opcode::Neq => self.heap.display(a) != self.heap.display(b),
                _ => false,
            }
        };

        self.stack.push(Value::Bool(result));
    }

    fn op_call_native(&mut self) {
        let name_index = self.read_u32();
        let argc = self.read_u8();
        let Some(name) = self.constant_name(name_index) else {
            for _ in 0..argc {
                self.stack.pop();
            }
            self.stack.push(Value::Nil);
            return;
        };
        match self.native(&name) {
            Some(handler) => handler(self, argc),
            None => {
                self.report(RuntimeFault::UnknownNative(name));
                for _ in 0..argc {
                    self.stack.pop();
                }
                self.stack.push(Value::Nil);
            }
        }
    }

    fn op_call_ffi(&mut self) {
        let lib_index = self.read_u32();
        let sym_index = self.read_u32();
        let argc = self.read_u8();
        let sig = self.read_u8();

        let names = (self.constant_name(lib_index), self.constant_name(sym_index));
        let (Some(lib), Some(symbol)) = names else {
            for _ in 0..argc {
                self.stack.pop();
            }
            self.stack.push(Value::Nil);
            return;
        };

        // right-to-left pops put the arguments back into call order
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.stack.pop());
        }
        args.reverse();

        match self.ffi.call(&lib, &symbol, sig, &args) {
            Ok(value) => self.stack.push(value),
            Err(error) => {
                self.report(RuntimeFault::Ffi(error.to_string()));
                self.stack.push(Value::Nil);
            }
        }
    }

    fn op_new_object(&mut self) {
        let index = self.read_u32();
        let Some(value) = self.constants.get(index as usize).copied() else {
            self.report(RuntimeFault::BadConstant(index));
            self.stack.push(Value::Nil);
            return;
        };
        let class_name = self
            .heap
            .str_value(value)
            .unwrap_or("Object")
            .to_string();
        let handle = self.heap.alloc_instance(class_name);
        self.stack.push(Value::Object(handle));
    }

    fn op_get_field(&mut self) {
        let name_index = self.read_u32();
        let object = self.stack.pop();
        let Some(name) = self.constant_name(name_index) else {
            self.stack.push(Value::Nil);
            return;
        };

        let field = object.as_object().and_then(|r| match self.heap.get(r) {
            Some(HeapObject::Instance { fields, .. }) => {
                // absent field reads as Nil, not a fault
                Some(fields.get(&name).copied().unwrap_or(Value::Nil))
            }
            _ => None,
        });

        match field {
            Some(value) => self.stack.push(value),
            None => {
                self.coercion_fault("GET_FIELD", "instance", object);
                self.stack.push(Value::Nil);
            }
        }
    }

    fn op_set_field(&mut self) {
        let name_index = self.read_u32();
        let value = self.stack.pop();
        let object = self.stack.pop();
        let Some(name) = self.constant_name(name_index) else {
            return;
        };

        if let Some(r) = object.as_object() {
            if let Some(HeapObject::Instance { fields, .. }) = self.heap.get_mut(r) {
                fields.insert(name, value);
                return;
            }
        }
        self.coercion_fault("SET_FIELD", "instance", object);
    }

    fn op_is_instance(&mut self) {
        let name_index = self.read_u32();
        let value = self.stack.pop();
        let Some(type_name) = self.constant_name(name_index) else {
            self.stack.push(Value::Bool(false));
            return;
        };
        let matches = value
            .as_object()
            .and_then(|r| self.heap.get(r))
            .and_then(|o| o.class_name())
            .map(|class_name| class_name == type_name)
            .unwrap_or(false);
        self.stack.push(Value::Bool(matches));
    }

    fn op_array_get(&mut self) {
        let index_value = self.stack.pop();
        let array_value = self.stack.pop();
        let index = index_value.as_i64_coerced();

        let lookup = array_value.as_object().and_then(|r| {
            self.heap
                .get(r)
                .and_then(|o| o.as_array())
                .map(|items| (items.len(), usize::try_from(index).ok().and_then(|i| items.get(i).copied())))
        });

        match lookup {
            None => {
                self.coercion_fault("ARRAY_GET", "array", array_value);
                self.stack.push(Value::Nil);
            }
            Some((len, None)) => {
                self.report(RuntimeFault::IndexOutOfRange { index, len });
                self.stack.push(Value::Nil);
            }
            Some((_, Some(value))) => self.stack.push(value),
        }
    }

    fn op_array_set(&mut self) {
        let value = self.stack.pop();
        let index_value = self.stack.pop();
        let array_value = self.stack.pop();
        let index = index_value.as_i64_coerced();

        let slot = array_value
            .as_object()
            .and_then(|r| self.heap.get_mut(r))
            .and_then(|o| o.as_array_mut());

        // a negative index falls through to the fault below
        let len = match slot {
            None => {
                self.coercion_fault("ARRAY_SET", "array", array_value);
                return;
            }
            Some(items) => match usize::try_from(index) {
                Ok(i) => {
                    if i >= items.len() {
                        // store past the end resizes with Nil fill
                        items.resize(i + 1, Value::Nil);
                    }
                    items[i] = value;
                    return;
                }
                Err(_) => items.len(),
            },
        };
        self.report(RuntimeFault::IndexOutOfRange { index, len });
    }

    fn op_map_get(&mut self) {
        let key_value = self.stack.pop();
        let map_value = self.stack.pop();
        let key = self.heap.display(key_value);

        let lookup = map_value.as_object().and_then(|r| {
            self.heap
                .get(r)
                .and_then(|o| o.as_map())
                .map(|entries| entries.get(&key).copied().unwrap_or(Value::Nil))
        });

        match lookup {
            Some(value) => self.stack.push(value),
            None => {
                self.coercion_fault("MAP_GET", "map", map_value);
                self.stack.push(Value::Nil);
            }
        }
    }

    fn op_map_set(&mut self) {
        let value = self.stack.pop();
        let key_value = self.stack.pop();
        let map_value = self.stack.pop();
        // keys are the display form of the original key value
        let key = self.heap.display(key_value);

        match map_value
            .as_object()
            .and_then(|r| self.heap.get_mut(r))
            .and_then(|o| o.as_map_mut())
        {
            Some(entries) => {
                entries.insert(key, value);
            }
            None => self.coercion_fault("MAP_SET", "map", map_value),
        }
    }

    fn op_string_concat(&mut self) {
        let b = self.stack.pop();
        let a = self.stack.pop();
        let text = format!("{}{}", self.heap.display(a), self.heap.display(b));
        let handle = self.heap.alloc_string(text);
        self.stack.push(Value::Object(handle));
    }

    fn op_string_length(&mut self) {
        let value = self.stack.pop();
        match self.heap.str_value(value) {
            Some(s) => {
                let len = s.len() as i64;
                self.stack.push(Value::Int(len));
            }
            None => {
                self.coercion_fault("STRING_LENGTH", "string", value);
                self.stack.push(Value::Int(0));
            }
        }
    }

    fn op_string_substr(&mut self) {
        let start = self.read_u32() as usize;
        let len = self.read_u32() as usize;
        let value = self.stack.pop();

        let text = match self.heap.str_value(value) {
            Some(s) => {
                let bytes = s.as_bytes();
                let start = start.min(bytes.len());
                let end = start + len.min(bytes.len() - start);
                String::from_utf8_lossy(&bytes[start..end]).into_owned()
            }
            None => {
                self.coercion_fault("STRING_SUBSTR", "string", value);
                String::new()
            }
        };
        let handle = self.heap.alloc_string(text);
        self.stack.push(Value::Object(handle));
    }

    fn op_string_eq(&mut self) {
        let b = self.stack.pop();
        let a = self.stack.pop();
        let equal = self.heap.display(a) == self.heap.display(b);
        self.stack.push(Value::Bool(equal));
    }

    fn op_string_get_char(&mut self) {
        let index_value = self.stack.pop();
        let value = self.stack.pop();
        let index = index_value.as_i64_coerced();

        let text = match self.heap.str_value(value) {
            Some(s) => usize::try_from(index)
                .ok()
                .and_then(|i| s.as_bytes().get(i).copied())
                .map(|byte| String::from_utf8_lossy(&[byte]).into_owned())
                .unwrap_or_default(),
            None => {
                self.coercion_fault("STRING_GET_CHAR", "string", value);
                String::new()
            }
        };
        let handle = self.heap.alloc_string(text);
        self.stack.push(Value::Object(handle));
    }
}
