//! Module loading
//!
//! Materializes a decoded [`Module`] into VM state: constants become
//! [`Value`]s (string constants are interned as heap Strings up front, so
//! opcode references resolve to object handles directly), and each function
//! header becomes a [`Function`] owning its slice of the shared code
//! section.
//!
//! [`Module::decode`] already validates the container; the loader re-checks
//! the header cross-references because a module can also arrive as an
//! in-memory structure that never went through `decode`.

use crate::value::Value;
use crate::vm::Vm;
use crate::{VmError, VmResult};
use droplet_bytecode::{Constant, Module, ModuleError};
use std::sync::Arc;

/// An executable function descriptor
#[derive(Debug)]
pub struct Function {
    /// Function name (resolved through the constant pool at load time)
    pub name: String,
    /// Number of argument slots
    pub arg_count: u8,
    /// Total local slots, arguments included
    pub local_count: u8,
    /// Bytecode body
    pub code: Vec<u8>,
}

impl Vm {
    /// Load a module: populate the constant pool and the function table.
    ///
    /// On any validation failure the VM is left untouched and the error is
    /// returned to the host.
    pub fn load_module(&mut self, module: &Module) -> VmResult<()> {
        // Validate headers before mutating any VM state
        for (index, def) in module.functions.iter().enumerate() {
            let index = index as u32;
            if module.function_name(def).is_none() {
                return Err(VmError::Load(ModuleError::BadNameIndex {
                    index,
                    name_index: def.name_index,
                }));
            }
            let in_bounds = (def.start as usize)
                .checked_add(def.size as usize)
                .map(|end| end <= module.code.len())
                .unwrap_or(false);
            if !in_bounds {
                return Err(VmError::Load(ModuleError::BadCodeSlice {
                    index,
                    start: def.start,
                    size: def.size,
                    code_size: module.code.len() as u32,
                }));
            }
        }

        let base = self.constants.len();
        for constant in &module.constants {
            let value = match constant {
                Constant::Int(v) => Value::Int(*v as i64),
                Constant::Float(v) => Value::Float(*v),
                Constant::Str(s) => Value::Object(self.heap.alloc_string(s.clone())),
                Constant::Nil => Value::Nil,
                Constant::Bool(b) => Value::Bool(*b),
            };
            self.constants.push(value);
        }
        debug_assert_eq!(self.constants.len(), base + module.constants.len());

        for def in &module.functions {
            let name = module
                .function_name(def)
                .expect("validated above")
                .to_string();
            let code = module.function_code(def).to_vec();
            let index = self.functions.len() as u32;
            self.function_index.insert(name.clone(), index);
            self.functions.push(Arc::new(Function {
                name,
                arg_count: def.arg_count,
                local_count: def.local_count,
                code,
            }));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use droplet_bytecode::{CodeBuilder, FunctionDef, ModuleWriter, Opcode};

    fn sample_module() -> Module {
        let mut writer = ModuleWriter::new();
        let c2 = writer.add_const_int(2);
        writer.add_const_float(1.5);
        writer.add_const_str("greeting");
        writer.add_const_nil();
        writer.add_const_bool(true);

        let mut main = CodeBuilder::new();
        main.push_const(c2).ret(1);
        writer.add_function("main", 0, 0, main);
        writer.finish()
    }

    #[test]
    fn test_load_materializes_constants() {
        let mut vm = Vm::new();
        vm.load_module(&sample_module()).unwrap();

        let constants = vm.constants();
        assert_eq!(constants[0], Value::Int(2));
        assert_eq!(constants[1], Value::Float(1.5));
        assert_eq!(vm.heap.str_value(constants[2]), Some("greeting"));
        assert_eq!(constants[3], Value::Nil);
        assert_eq!(constants[4], Value::Bool(true));
    }

    #[test]
    fn test_load_builds_function_table() {
        let mut vm = Vm::new();
        vm.load_module(&sample_module()).unwrap();

        let index = vm.function_index("main").unwrap();
        assert_eq!(index, 0);
        assert!(vm.function_index("missing").is_none());
    }

    #[test]
    fn test_load_rejects_bad_name_index() {
        let mut module = sample_module();
        module.functions[0].name_index = 0; // the int constant
        let mut vm = Vm::new();
        assert!(matches!(
            vm.load_module(&module),
            Err(VmError::Load(ModuleError::BadNameIndex { .. }))
        ));
        // Nothing was installed
        assert!(vm.function_index("main").is_none());
        assert!(vm.constants().is_empty());
    }

    #[test]
    fn test_load_rejects_bad_code_slice() {
        let mut module = sample_module();
        module.functions[0].size = u32::MAX;
        let mut vm = Vm::new();
        assert!(matches!(
            vm.load_module(&module),
            Err(VmError::Load(ModuleError::BadCodeSlice { .. }))
        ));
    }

    #[test]
    fn test_duplicate_names_last_wins() {
        let mut writer = ModuleWriter::new();
        let mut first = CodeBuilder::new();
        first.op(Opcode::Pop);
        writer.add_function("f", 0, 0, first);
        let mut second = CodeBuilder::new();
        second.ret(0);
        writer.add_function("f", 0, 0, second);
        let module = writer.finish();

        let mut vm = Vm::new();
        vm.load_module(&module).unwrap();
        assert_eq!(vm.function_index("f"), Some(1));
    }

    #[test]
    fn test_function_def_roundtrips_through_loader() {
        let module = sample_module();
        let def: &FunctionDef = &module.functions[0];
        let mut vm = Vm::new();
        vm.load_module(&module).unwrap();
        // PUSH_CONST + u32, RETURN + u8
        assert_eq!(def.size, 7);
    }
}
