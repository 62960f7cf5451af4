//! Droplet command-line runner
//!
//! Loads a compiled `.dbc` module, registers the builtin natives, and runs
//! the program's `main` function. `info` decodes a module without running
//! it and lists its constants and functions.

use anyhow::Context;
use clap::{Parser, Subcommand};
use droplet_bytecode::{Constant, Module, Opcode};
use droplet_vm::{builtins::register_builtins, Value, Vm};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "droplet")]
#[command(about = "Droplet bytecode virtual machine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a compiled Droplet module
    Run {
        /// Module file (.dbc)
        file: PathBuf,
    },

    /// Decode a module and list its constants and functions
    Info {
        /// Module file (.dbc)
        file: PathBuf,
        /// Also disassemble every function body
        #[arg(short, long)]
        disasm: bool,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file } => run(&file),
        Commands::Info { file, disasm } => {
            info(&file, disasm)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load(file: &PathBuf) -> anyhow::Result<Module> {
    let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let module =
        Module::decode(&bytes).with_context(|| format!("decoding {}", file.display()))?;
    Ok(module)
}

fn run(file: &PathBuf) -> anyhow::Result<ExitCode> {
    let module = load(file)?;

    let mut vm = Vm::new();
    register_builtins(&mut vm);
    let result = vm
        .run_module(&module)
        .with_context(|| format!("running {}", file.display()))?;

    if !matches!(result, Value::Nil) {
        println!("{}", vm.heap.display(result));
    }

    let code = vm.exit_code().unwrap_or(0);
    Ok(ExitCode::from(code.clamp(0, 255) as u8))
}

fn info(file: &PathBuf, disasm: bool) -> anyhow::Result<()> {
    let module = load(file)?;

    println!("module: {}", file.display());
    println!("constants: {}", module.constants.len());
    for (index, constant) in module.constants.iter().enumerate() {
        let rendered = match constant {
            Constant::Int(v) => format!("int    {}", v),
            Constant::Float(v) => format!("float  {}", v),
            Constant::Str(s) => format!("string {:?}", s),
            Constant::Nil => "nil".to_string(),
            Constant::Bool(v) => format!("bool   {}", v),
        };
        println!("  [{}] {}", index, rendered);
    }

    println!("functions: {}", module.functions.len());
    for def in &module.functions {
        let name = module.function_name(def).unwrap_or("<invalid>");
        println!(
            "  {} args={} locals={} code={}B @ {}",
            name, def.arg_count, def.local_count, def.size, def.start
        );
        if disasm {
            disassemble(module.function_code(def));
        }
    }

    Ok(())
}

fn disassemble(code: &[u8]) {
    let mut offset = 0;
    while offset < code.len() {
        let byte = code[offset];
        let Some(op) = Opcode::from_u8(byte) else {
            println!("    {:6}  .byte {:#04x}", offset, byte);
            offset += 1;
            continue;
        };

        let width = op.operand_width();
        if offset + 1 + width > code.len() {
            println!("    {:6}  {} <truncated operands>", offset, op.name());
            return;
        }
        let operands = &code[offset + 1..offset + 1 + width];
        let rendered = render_operands(op, operands);
        println!("    {:6}  {}{}", offset, op.name(), rendered);
        offset += 1 + width;
    }
}

fn render_operands(op: Opcode, operands: &[u8]) -> String {
    let u32_at = |at: usize| u32::from_le_bytes(operands[at..at + 4].try_into().unwrap());
    match op {
        Opcode::LoadLocal | Opcode::StoreLocal | Opcode::Return => {
            format!(" {}", operands[0])
        }
        Opcode::Call | Opcode::CallNative => {
            format!(" {}, argc={}", u32_at(0), operands[4])
        }
        Opcode::CallFfi => format!(
            " lib={}, sym={}, argc={}, sig={}",
            u32_at(0),
            u32_at(4),
            operands[8],
            operands[9]
        ),
        Opcode::StringSubstr => format!(" start={}, len={}", u32_at(0), u32_at(4)),
        _ if op.operand_width() == 4 => format!(" {}", u32_at(0)),
        _ => String::new(),
    }
}
