//! Full-module round-trip tests: everything the writer can produce must
//! decode back to an identical module.

use droplet_bytecode::{CodeBuilder, Constant, Module, ModuleError, ModuleWriter, Opcode};

fn representative_module() -> Module {
    let mut writer = ModuleWriter::new();
    let c2 = writer.add_const_int(2);
    let pi = writer.add_const_float(3.14159);
    let greeting = writer.add_const_str("hello");
    let nil = writer.add_const_nil();
    let yes = writer.add_const_bool(true);
    let class = writer.add_const_str("Point");
    let field = writer.add_const_str("x");
    let lib = writer.add_const_str("libm.so.6");
    let sym = writer.add_const_str("cos");

    let mut helper = CodeBuilder::new();
    helper
        .load_local(0)
        .push_const(c2)
        .op(Opcode::Mul)
        .ret(1);
    let helper_index = writer.add_function("helper", 1, 2, helper);

    let mut main = CodeBuilder::new();
    main.push_const(pi)
        .call(helper_index, 1)
        .new_object(class)
        .dup()
        .push_const(greeting)
        .set_field(field)
        .get_field(field)
        .push_const(nil)
        .push_const(yes)
        .pop()
        .pop()
        .string_substr(0, 3)
        .call_ffi(lib, sym, 1, 3)
        .ret(1);
    writer.add_function("main", 0, 1, main);

    writer.finish()
}

#[test]
fn encode_decode_is_identity() {
    let module = representative_module();
    let bytes = module.encode();
    let decoded = Module::decode(&bytes).unwrap();
    assert_eq!(decoded, module);

    // a second trip is bit-stable
    assert_eq!(decoded.encode(), bytes);
}

#[test]
fn header_layout_is_stable() {
    let module = representative_module();
    let bytes = module.encode();
    assert_eq!(&bytes[0..4], b"DLBC");
    assert_eq!(bytes[4], 1); // version
    let const_count = u32::from_le_bytes(bytes[5..9].try_into().unwrap());
    assert_eq!(const_count as usize, module.constants.len());
}

#[test]
fn constants_survive_with_payloads() {
    let module = representative_module();
    let decoded = Module::decode(&module.encode()).unwrap();
    assert_eq!(decoded.constants[0], Constant::Int(2));
    assert!(matches!(decoded.constants[1], Constant::Float(f) if (f - 3.14159).abs() < 1e-12));
    assert_eq!(decoded.constants[2], Constant::Str("hello".to_string()));
}

#[test]
fn function_bodies_slice_the_shared_code_section() {
    let module = representative_module();
    let decoded = Module::decode(&module.encode()).unwrap();

    let total: usize = decoded.functions.iter().map(|f| f.size as usize).sum();
    assert_eq!(total, decoded.code.len());

    let helper = &decoded.functions[0];
    assert_eq!(decoded.function_name(helper), Some("helper"));
    assert_eq!(
        decoded.function_code(helper).first().copied(),
        Some(Opcode::LoadLocal.to_u8())
    );
}

#[test]
fn every_truncation_is_rejected() {
    let bytes = representative_module().encode();
    // chopping the stream at any point must fail loudly, never panic
    for len in 0..bytes.len() {
        let result = Module::decode(&bytes[..len]);
        assert!(result.is_err(), "decode succeeded at truncation {}", len);
    }
}

#[test]
fn trailing_garbage_is_rejected() {
    let mut bytes = representative_module().encode();
    bytes.extend_from_slice(&[0, 0, 0]);
    assert!(matches!(
        Module::decode(&bytes),
        Err(ModuleError::TrailingBytes(3))
    ));
}
