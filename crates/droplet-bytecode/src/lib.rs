//! Droplet bytecode format
//!
//! This crate defines the wire format shared by the Droplet compiler and the
//! Droplet VM:
//! - The one-byte opcode set ([`Opcode`])
//! - Little-endian encoding primitives ([`BytecodeWriter`], [`BytecodeReader`])
//! - The `.dbc` module container ([`Module`]) and the emission API the
//!   compiler uses to produce it ([`ModuleWriter`], [`CodeBuilder`])
//!
//! Opcode identity is part of the wire format: changing a numeric value is a
//! version bump.

pub mod encoder;
pub mod module;
pub mod opcode;

pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError};
pub use module::{CodeBuilder, Constant, FunctionDef, Module, ModuleError, ModuleWriter};
pub use opcode::Opcode;
