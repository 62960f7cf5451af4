//! The `.dbc` module container
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic:      "DLBC" (4 bytes)
//! version:    u8     (current: 1)
//! constCount: u32
//! constants[constCount]:
//!   tag: u8
//!     1 -> int32 (i32)
//!     2 -> float (f64)
//!     3 -> string: u32 length, bytes[length]
//!     4 -> nil (no payload)
//!     5 -> bool (u8, 0 or 1)
//! fnCount:    u32
//! functions[fnCount]:
//!   nameIndex:  u32   (must reference a string constant)
//!   start:      u32   (byte offset into code section)
//!   size:       u32   (byte length)
//!   argCount:   u8
//!   localCount: u8
//! codeSize:   u32
//! code:       bytes[codeSize]
//! ```
//!
//! Function bodies live in one shared code section; each header names a
//! sub-slice of it. [`ModuleWriter`] and [`CodeBuilder`] are the emission
//! API the compiler (and the test suites) use to produce conforming files.

use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};
use crate::opcode::Opcode;
use thiserror::Error;

/// Magic number for Droplet bytecode files: "DLBC"
pub const MAGIC: [u8; 4] = *b"DLBC";

/// Current bytecode version
pub const VERSION: u8 = 1;

/// Module encoding/decoding errors
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Underlying decode error (truncated extent, bad UTF-8)
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid magic number
    #[error("invalid magic number: expected DLBC, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("unsupported version: {0} (current: {VERSION})")]
    UnsupportedVersion(u8),

    /// Unknown constant tag
    #[error("unknown constant tag {tag} at constant {index}")]
    UnknownConstantTag {
        /// The tag byte read from the stream
        tag: u8,
        /// Which constant carried it
        index: u32,
    },

    /// Function name index does not reference a string constant
    #[error("function {index}: name index {name_index} is not a string constant")]
    BadNameIndex {
        /// Which function header
        index: u32,
        /// The offending constant index
        name_index: u32,
    },

    /// Function code slice lies outside the code section
    #[error("function {index}: code slice {start}+{size} exceeds code section ({code_size} bytes)")]
    BadCodeSlice {
        /// Which function header
        index: u32,
        /// Declared start offset
        start: u32,
        /// Declared byte length
        size: u32,
        /// Actual code section size
        code_size: u32,
    },

    /// Trailing bytes after the code section
    #[error("{0} trailing bytes after code section")]
    TrailingBytes(usize),
}

/// A constant pool entry
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// 32-bit integer (tag 1)
    Int(i32),
    /// 64-bit float (tag 2)
    Float(f64),
    /// UTF-8 string (tag 3)
    Str(String),
    /// Nil (tag 4)
    Nil,
    /// Boolean (tag 5)
    Bool(bool),
}

impl Constant {
    /// Wire tag for this constant kind
    pub fn tag(&self) -> u8 {
        match self {
            Constant::Int(_) => 1,
            Constant::Float(_) => 2,
            Constant::Str(_) => 3,
            Constant::Nil => 4,
            Constant::Bool(_) => 5,
        }
    }

    /// The string payload, when this is a string constant
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Constant::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// A function descriptor as stored in the module header
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    /// Constant index of the function name (string constant)
    pub name_index: u32,
    /// Byte offset of the body within the code section
    pub start: u32,
    /// Byte length of the body
    pub size: u32,
    /// Number of argument slots
    pub arg_count: u8,
    /// Total local slots (arguments included)
    pub local_count: u8,
}

/// A compiled Droplet module
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Constant pool
    pub constants: Vec<Constant>,
    /// Function headers
    pub functions: Vec<FunctionDef>,
    /// Shared code section
    pub code: Vec<u8>,
}

impl Module {
    /// Resolve a function's name through the constant pool
    pub fn function_name(&self, def: &FunctionDef) -> Option<&str> {
        self.constants.get(def.name_index as usize)?.as_str()
    }

    /// Borrow a function's body out of the shared code section
    pub fn function_code(&self, def: &FunctionDef) -> &[u8] {
        &self.code[def.start as usize..(def.start + def.size) as usize]
    }

    /// Encode the module to the binary `.dbc` layout
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BytecodeWriter::new();

        writer.emit_bytes(&MAGIC);
        writer.emit_u8(VERSION);

        writer.emit_u32(self.constants.len() as u32);
        for constant in &self.constants {
            writer.emit_u8(constant.tag());
            match constant {
                Constant::Int(v) => writer.emit_i32(*v),
                Constant::Float(v) => writer.emit_f64(*v),
                Constant::Str(s) => {
                    writer.emit_u32(s.len() as u32);
                    writer.emit_bytes(s.as_bytes());
                }
                Constant::Nil => {}
                Constant::Bool(v) => writer.emit_u8(*v as u8),
            }
        }

        writer.emit_u32(self.functions.len() as u32);
        for def in &self.functions {
            writer.emit_u32(def.name_index);
            writer.emit_u32(def.start);
            writer.emit_u32(def.size);
            writer.emit_u8(def.arg_count);
            writer.emit_u8(def.local_count);
        }

        writer.emit_u32(self.code.len() as u32);
        writer.emit_bytes(&self.code);

        writer.into_bytes()
    }

    /// Decode and validate a module from the binary `.dbc` layout
    pub fn decode(data: &[u8]) -> Result<Self, ModuleError> {
        let mut reader = BytecodeReader::new(data);

        let magic_bytes = reader.read_bytes(4)?;
        let magic: [u8; 4] = magic_bytes.try_into().unwrap();
        if magic != MAGIC {
            return Err(ModuleError::InvalidMagic(magic));
        }

        let version = reader.read_u8()?;
        if version != VERSION {
            return Err(ModuleError::UnsupportedVersion(version));
        }

        let const_count = reader.read_u32()?;
        let mut constants = Vec::with_capacity(const_count as usize);
        for index in 0..const_count {
            let tag = reader.read_u8()?;
            let constant = match tag {
                1 => Constant::Int(reader.read_i32()?),
                2 => Constant::Float(reader.read_f64()?),
                3 => Constant::Str(reader.read_string()?),
                4 => Constant::Nil,
                5 => Constant::Bool(reader.read_u8()? != 0),
                tag => return Err(ModuleError::UnknownConstantTag { tag, index }),
            };
            constants.push(constant);
        }

        let fn_count = reader.read_u32()?;
        let mut functions = Vec::with_capacity(fn_count as usize);
        for _ in 0..fn_count {
            functions.push(FunctionDef {
                name_index: reader.read_u32()?,
                start: reader.read_u32()?,
                size: reader.read_u32()?,
                arg_count: reader.read_u8()?,
                local_count: reader.read_u8()?,
            });
        }

        let code_size = reader.read_u32()?;
        let code = reader.read_bytes(code_size as usize)?;
        if reader.remaining() > 0 {
            return Err(ModuleError::TrailingBytes(reader.remaining()));
        }

        // Header cross-checks: names must be string constants, bodies must
        // lie within the code section.
        for (index, def) in functions.iter().enumerate() {
            let index = index as u32;
            let name_ok = constants
                .get(def.name_index as usize)
                .map(|c| c.as_str().is_some())
                .unwrap_or(false);
            if !name_ok {
                return Err(ModuleError::BadNameIndex {
                    index,
                    name_index: def.name_index,
                });
            }
            let end = def.start.checked_add(def.size);
            if end.is_none() || end.unwrap() > code_size {
                return Err(ModuleError::BadCodeSlice {
                    index,
                    start: def.start,
                    size: def.size,
                    code_size,
                });
            }
        }

        Ok(Self {
            constants,
            functions,
            code,
        })
    }
}

/// Builder for one function body
///
/// Wraps a [`BytecodeWriter`] with one emission method per instruction, so
/// test and compiler code reads like an assembly listing. Methods return
/// `&mut Self` for chaining. Jump targets are function-local byte offsets;
/// use [`CodeBuilder::offset`] and the `*_placeholder`/`patch_target` pair
/// for forward jumps.
#[derive(Default)]
pub struct CodeBuilder {
    writer: BytecodeWriter,
}

impl CodeBuilder {
    /// Create an empty function body builder
    pub fn new() -> Self {
        Self {
            writer: BytecodeWriter::new(),
        }
    }

    /// Current byte offset within this function body
    pub fn offset(&self) -> u32 {
        self.writer.offset() as u32
    }

    /// Consume the builder, returning the body bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.writer.into_bytes()
    }

    /// PUSH_CONST: push constant pool entry
    pub fn push_const(&mut self, index: u32) -> &mut Self {
        self.writer.emit_opcode(Opcode::PushConst);
        self.writer.emit_u32(index);
        self
    }

    /// POP
    pub fn pop(&mut self) -> &mut Self {
        self.op(Opcode::Pop)
    }

    /// DUP
    pub fn dup(&mut self) -> &mut Self {
        self.op(Opcode::Dup)
    }

    /// SWAP
    pub fn swap(&mut self) -> &mut Self {
        self.op(Opcode::Swap)
    }

    /// ROT
    pub fn rot(&mut self) -> &mut Self {
        self.op(Opcode::Rot)
    }

    /// LOAD_LOCAL
    pub fn load_local(&mut self, slot: u8) -> &mut Self {
        self.writer.emit_opcode(Opcode::LoadLocal);
        self.writer.emit_u8(slot);
        self
    }

    /// STORE_LOCAL
    pub fn store_local(&mut self, slot: u8) -> &mut Self {
        self.writer.emit_opcode(Opcode::StoreLocal);
        self.writer.emit_u8(slot);
        self
    }

    /// LOAD_GLOBAL
    pub fn load_global(&mut self, name_index: u32) -> &mut Self {
        self.writer.emit_opcode(Opcode::LoadGlobal);
        self.writer.emit_u32(name_index);
        self
    }

    /// STORE_GLOBAL
    pub fn store_global(&mut self, name_index: u32) -> &mut Self {
        self.writer.emit_opcode(Opcode::StoreGlobal);
        self.writer.emit_u32(name_index);
        self
    }

    /// Emit a bare (operand-less) instruction
    pub fn op(&mut self, opcode: Opcode) -> &mut Self {
        debug_assert_eq!(opcode.operand_width(), 0, "{} takes operands", opcode.name());
        self.writer.emit_opcode(opcode);
        self
    }

    /// JUMP to a known target
    pub fn jump(&mut self, target: u32) -> &mut Self {
        self.writer.emit_opcode(Opcode::Jump);
        self.writer.emit_u32(target);
        self
    }

    /// JUMP_IF_FALSE to a known target (pops the condition)
    pub fn jump_if_false(&mut self, target: u32) -> &mut Self {
        self.writer.emit_opcode(Opcode::JumpIfFalse);
        self.writer.emit_u32(target);
        self
    }

    /// JUMP_IF_TRUE to a known target (pops the condition)
    pub fn jump_if_true(&mut self, target: u32) -> &mut Self {
        self.writer.emit_opcode(Opcode::JumpIfTrue);
        self.writer.emit_u32(target);
        self
    }

    /// Emit a jump-family instruction with a placeholder target.
    ///
    /// Returns the patch position for [`CodeBuilder::patch_target`].
    pub fn jump_placeholder(&mut self, opcode: Opcode) -> usize {
        debug_assert!(matches!(
            opcode,
            Opcode::Jump | Opcode::JumpIfFalse | Opcode::JumpIfTrue
        ));
        self.writer.emit_opcode(opcode);
        let at = self.writer.offset();
        self.writer.emit_u32(0);
        at
    }

    /// Patch a placeholder emitted by [`CodeBuilder::jump_placeholder`]
    pub fn patch_target(&mut self, at: usize, target: u32) -> &mut Self {
        self.writer.patch_u32(at, target);
        self
    }

    /// CALL a function by table index
    pub fn call(&mut self, function_index: u32, argc: u8) -> &mut Self {
        self.writer.emit_opcode(Opcode::Call);
        self.writer.emit_u32(function_index);
        self.writer.emit_u8(argc);
        self
    }

    /// RETURN the top `count` values
    pub fn ret(&mut self, count: u8) -> &mut Self {
        self.writer.emit_opcode(Opcode::Return);
        self.writer.emit_u8(count);
        self
    }

    /// CALL_NATIVE by name-constant index
    pub fn call_native(&mut self, name_index: u32, argc: u8) -> &mut Self {
        self.writer.emit_opcode(Opcode::CallNative);
        self.writer.emit_u32(name_index);
        self.writer.emit_u8(argc);
        self
    }

    /// CALL_FFI by library/symbol name-constant indices
    pub fn call_ffi(&mut self, lib_index: u32, sym_index: u32, argc: u8, sig: u8) -> &mut Self {
        self.writer.emit_opcode(Opcode::CallFfi);
        self.writer.emit_u32(lib_index);
        self.writer.emit_u32(sym_index);
        self.writer.emit_u8(argc);
        self.writer.emit_u8(sig);
        self
    }

    /// NEW_OBJECT with a class-name constant
    pub fn new_object(&mut self, class_name_index: u32) -> &mut Self {
        self.writer.emit_opcode(Opcode::NewObject);
        self.writer.emit_u32(class_name_index);
        self
    }

    /// GET_FIELD by name-constant index
    pub fn get_field(&mut self, name_index: u32) -> &mut Self {
        self.writer.emit_opcode(Opcode::GetField);
        self.writer.emit_u32(name_index);
        self
    }

    /// SET_FIELD by name-constant index
    pub fn set_field(&mut self, name_index: u32) -> &mut Self {
        self.writer.emit_opcode(Opcode::SetField);
        self.writer.emit_u32(name_index);
        self
    }

    /// IS_INSTANCE against a type-name constant
    pub fn is_instance(&mut self, name_index: u32) -> &mut Self {
        self.writer.emit_opcode(Opcode::IsInstance);
        self.writer.emit_u32(name_index);
        self
    }

    /// STRING_SUBSTR with inline start/length
    pub fn string_substr(&mut self, start: u32, len: u32) -> &mut Self {
        self.writer.emit_opcode(Opcode::StringSubstr);
        self.writer.emit_u32(start);
        self.writer.emit_u32(len);
        self
    }
}

/// Module emission API
///
/// Interns constants, appends function bodies to the shared code section,
/// and produces a [`Module`]. String constants are deduplicated; numeric
/// constants are appended as-is.
#[derive(Default)]
pub struct ModuleWriter {
    constants: Vec<Constant>,
    functions: Vec<FunctionDef>,
    code: Vec<u8>,
}

impl ModuleWriter {
    /// Create an empty module writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an int constant, returning its pool index
    pub fn add_const_int(&mut self, value: i32) -> u32 {
        self.push_constant(Constant::Int(value))
    }

    /// Add a float constant, returning its pool index
    pub fn add_const_float(&mut self, value: f64) -> u32 {
        self.push_constant(Constant::Float(value))
    }

    /// Add (or reuse) a string constant, returning its pool index
    pub fn add_const_str(&mut self, value: &str) -> u32 {
        if let Some(at) = self
            .constants
            .iter()
            .position(|c| c.as_str() == Some(value))
        {
            return at as u32;
        }
        self.push_constant(Constant::Str(value.to_string()))
    }

    /// Add a nil constant, returning its pool index
    pub fn add_const_nil(&mut self) -> u32 {
        self.push_constant(Constant::Nil)
    }

    /// Add a bool constant, returning its pool index
    pub fn add_const_bool(&mut self, value: bool) -> u32 {
        self.push_constant(Constant::Bool(value))
    }

    fn push_constant(&mut self, constant: Constant) -> u32 {
        let index = self.constants.len() as u32;
        self.constants.push(constant);
        index
    }

    /// Append a function: interns the name, moves the body into the shared
    /// code section, records the header. Returns the function table index.
    pub fn add_function(
        &mut self,
        name: &str,
        arg_count: u8,
        local_count: u8,
        body: CodeBuilder,
    ) -> u32 {
        let name_index = self.add_const_str(name);
        let bytes = body.into_bytes();
        let start = self.code.len() as u32;
        let size = bytes.len() as u32;
        self.code.extend_from_slice(&bytes);

        let index = self.functions.len() as u32;
        self.functions.push(FunctionDef {
            name_index,
            start,
            size,
            arg_count,
            local_count,
        });
        index
    }

    /// Finalize into a [`Module`]
    pub fn finish(self) -> Module {
        Module {
            constants: self.constants,
            functions: self.functions,
            code: self.code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_module_roundtrip() {
        let module = ModuleWriter::new().finish();
        let decoded = Module::decode(&module.encode()).unwrap();
        assert_eq!(decoded, module);
    }

    #[test]
    fn test_module_with_function() {
        let mut writer = ModuleWriter::new();
        let c2 = writer.add_const_int(2);
        let c3 = writer.add_const_int(3);

        let mut main = CodeBuilder::new();
        main.push_const(c2).push_const(c3).op(Opcode::Add).ret(1);
        writer.add_function("main", 0, 0, main);

        let module = writer.finish();
        let decoded = Module::decode(&module.encode()).unwrap();

        assert_eq!(decoded, module);
        assert_eq!(decoded.functions.len(), 1);
        let def = &decoded.functions[0];
        assert_eq!(decoded.function_name(def), Some("main"));
        assert_eq!(def.arg_count, 0);
        // PUSH_CONST(5) + PUSH_CONST(5) + ADD(1) + RETURN(2)
        assert_eq!(decoded.function_code(def).len(), 13);
    }

    #[test]
    fn test_string_constants_deduplicated() {
        let mut writer = ModuleWriter::new();
        let a = writer.add_const_str("value");
        let b = writer.add_const_str("value");
        let c = writer.add_const_str("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_all_constant_kinds_roundtrip() {
        let mut writer = ModuleWriter::new();
        writer.add_const_int(-7);
        writer.add_const_float(2.5);
        writer.add_const_str("hello");
        writer.add_const_nil();
        writer.add_const_bool(true);
        writer.add_const_bool(false);

        let module = writer.finish();
        let decoded = Module::decode(&module.encode()).unwrap();
        assert_eq!(
            decoded.constants,
            vec![
                Constant::Int(-7),
                Constant::Float(2.5),
                Constant::Str("hello".to_string()),
                Constant::Nil,
                Constant::Bool(true),
                Constant::Bool(false),
            ]
        );
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = b"XLBC".to_vec();
        bytes.push(VERSION);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            Module::decode(&bytes),
            Err(ModuleError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = MAGIC.to_vec();
        bytes.push(99);
        assert!(matches!(
            Module::decode(&bytes),
            Err(ModuleError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_truncated_module() {
        let module = ModuleWriter::new().finish();
        let mut bytes = module.encode();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            Module::decode(&bytes),
            Err(ModuleError::Decode(_))
        ));
    }

    #[test]
    fn test_bad_name_index_rejected() {
        let mut writer = ModuleWriter::new();
        let idx = writer.add_const_int(42);
        writer.add_function("main", 0, 0, CodeBuilder::new());
        let mut module = writer.finish();
        // point the name at the int constant
        module.functions[0].name_index = idx;
        assert!(matches!(
            Module::decode(&module.encode()),
            Err(ModuleError::BadNameIndex { .. })
        ));
    }

    #[test]
    fn test_bad_code_slice_rejected() {
        let mut writer = ModuleWriter::new();
        let mut main = CodeBuilder::new();
        main.ret(0);
        writer.add_function("main", 0, 0, main);
        let mut module = writer.finish();
        module.functions[0].size = 1000;
        assert!(matches!(
            Module::decode(&module.encode()),
            Err(ModuleError::BadCodeSlice { .. })
        ));
    }

    #[test]
    fn test_unknown_constant_tag() {
        let mut bytes = MAGIC.to_vec();
        bytes.push(VERSION);
        bytes.extend_from_slice(&1u32.to_le_bytes()); // one constant
        bytes.push(9); // bogus tag
        assert!(matches!(
            Module::decode(&bytes),
            Err(ModuleError::UnknownConstantTag { tag: 9, index: 0 })
        ));
    }

    #[test]
    fn test_jump_placeholder_patching() {
        let mut code = CodeBuilder::new();
        let at = code.jump_placeholder(Opcode::JumpIfFalse);
        code.op(Opcode::Pop);
        let target = code.offset();
        code.patch_target(at, target);

        let bytes = code.into_bytes();
        // opcode byte, then the patched little-endian target
        assert_eq!(bytes[0], Opcode::JumpIfFalse.to_u8());
        assert_eq!(u32::from_le_bytes(bytes[1..5].try_into().unwrap()), target);
    }
}
