use std::{env, fs, path::Path};

use tracing_subscriber::EnvFilter;

use elk_vm::bytecode::Program;
use elk_vm::bytecode::disasm::{print_program, print_program_stats};
use elk_vm::lang::std_fn::Library;
use elk_vm::runtime::{Vm, VmConfig};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    let disassemble = args.contains(&"--dis".to_string());
    let stats = args.contains(&"--stats".to_string());
    let max_steps = flag_value(&args, "--max-steps");

    // first non-flag argument is the filename
    let filename = args
        .iter()
        .skip(1)
        .filter(|a| Some(a.as_str()) != max_steps.as_deref())
        .find(|a| !a.starts_with('-'));

    let Some(filename) = filename else {
        print_usage();
        std::process::exit(1);
    };
    ensure_extension(filename);

    let mut program = match fs::read(filename) {
        Ok(bytes) => match Program::decode(&bytes) {
            Ok(program) => program,
            Err(e) => {
                eprintln!("Failed to decode '{}': {}", filename, e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("Failed to read '{}': {}", filename, e);
            std::process::exit(1);
        }
    };

    if disassemble || stats {
        if disassemble {
            print_program(&program);
        }
        if stats {
            print_program_stats(&program);
        }
        return;
    }

    if let Err(e) = program.bind(&Library::prelude()) {
        eprintln!("Link error: {}", e);
        std::process::exit(1);
    }

    let mut config = VmConfig::default();
    if let Some(max) = max_steps {
        match max.parse() {
            Ok(max) => config.max_steps = Some(max),
            Err(_) => {
                eprintln!("Error: --max-steps expects a number, got {}", max);
                std::process::exit(1);
            }
        }
    }

    let mut vm = Vm::with_config(config);
    if let Err(e) = vm.execute(&program, 0) {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    let at = args.iter().position(|a| a == flag)?;
    args.get(at + 1).cloned()
}

fn ensure_extension(filename: &str) {
    let path = Path::new(filename);
    if path.extension().and_then(|e| e.to_str()) != Some("elkc") {
        eprintln!("Error: expected a .elkc file, got {}", filename);
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("ELK VM - bytecode executor for compiled elk scripts");
    println!();
    println!("Usage:");
    println!("  elk-vm <file.elkc>                 Run a compiled program");
    println!("  elk-vm --dis <file.elkc>           Disassemble every page");
    println!("  elk-vm --stats <file.elkc>         Show bytecode statistics");
    println!("  elk-vm --max-steps <n> <file>      Abort after n instructions");
    println!("  elk-vm --help, -h                  Show this help");
    println!();
    println!("Set RUST_LOG (e.g. RUST_LOG=elk_vm=debug) to enable logging.");
}
