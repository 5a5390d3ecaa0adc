//! Veld Compiler
//!
//! A small statically-typed, namespace-aware language compiled to
//! native code through an in-process JIT.

mod backend;
mod frontend;
mod middle;
mod stdlib;
mod types;
mod utils;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use frontend::module::{CompilationUnit, UnitManager};
use middle::ir::IrModule;
use middle::ir_gen;
use middle::ir_printer::print_ir;
use utils::Error;

/// Veld Compiler
#[derive(Parser, Debug)]
#[command(name = "veldc")]
#[command(version = "0.1.0")]
#[command(about = "Veld compiler - runs .veld sources through an LLVM JIT")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Input source file (.veld)
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,

    /// Print the Veld IR instead of executing
    #[arg(long)]
    emit_ir: bool,

    /// Write the backend LLVM IR to a file before executing
    #[arg(long, value_name = "FILE")]
    dump_llvm: Option<PathBuf>,

    /// Additional import search paths
    #[arg(short = 'I', long = "include", value_name = "DIR")]
    include: Vec<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile and execute a source file
    Run { input: PathBuf },
    /// Check a source file for errors without generating code
    Check { input: PathBuf },
    /// Interactive evaluation loop
    Repl,
    /// Print version information
    Version,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    match &cli.command {
        Some(Commands::Run { input }) => run_file(input.clone(), &cli),
        Some(Commands::Check { input }) => check_file(input),
        Some(Commands::Repl) => repl(&cli),
        Some(Commands::Version) => {
            println!("veldc 0.1.0");
            println!("Veld Compiler");
            println!("License: Apache-2.0");
        }
        None => match cli.input.clone() {
            Some(input) => run_file(input, &cli),
            None => {
                eprintln!("Error: No input file specified");
                eprintln!("Usage: veldc <FILE> or veldc run <FILE>");
                process::exit(1);
            }
        },
    }
}

fn report(err: &Error) {
    match err.span() {
        Some(span) if span.line > 0 => eprintln!("error at {}: {}", span, err),
        _ => eprintln!("error: {}", err),
    }
}

/// Load, resolve and generate the root unit plus everything it
/// imports, in dependency order. The root unit's module comes last.
fn compile(input: &PathBuf, include: &[PathBuf]) -> Result<Vec<IrModule>, Error> {
    let mut manager = UnitManager::new(include.to_vec());
    let root = manager.load_root(input)?;
    generate_all(&manager, &root)
}

fn generate_all(manager: &UnitManager, root: &CompilationUnit) -> Result<Vec<IrModule>, Error> {
    let mut modules = Vec::new();
    for unit in manager.units_in_order() {
        modules.push(ir_gen::generate(unit)?);
    }
    modules.push(ir_gen::generate(root)?);
    Ok(modules)
}

fn check_file(input: &PathBuf) {
    let mut manager = UnitManager::new(Vec::new());
    match manager.load_root(input) {
        Ok(_) => println!("No errors found"),
        Err(e) => {
            report(&e);
            process::exit(1);
        }
    }
}

fn run_file(input: PathBuf, cli: &Cli) {
    let modules = match compile(&input, &cli.include) {
        Ok(m) => m,
        Err(e) => {
            report(&e);
            process::exit(1);
        }
    };

    if cli.emit_ir {
        for module in &modules {
            println!("{}", print_ir(module));
        }
        return;
    }

    if let Err(e) = execute(&modules, cli.dump_llvm.as_deref()) {
        report(&e);
        process::exit(1);
    }
}

/// Compile the lowered modules and call the generated entry points:
/// every unit's root initializer in dependency order, then the root
/// unit's top-level wrappers in file order.
#[cfg(feature = "llvm")]
fn execute(modules: &[IrModule], dump_llvm: Option<&std::path::Path>) -> Result<(), Error> {
    use backend::codegen::NativeBackend;
    use backend::llvm::JitBackend;

    let mut jit = JitBackend::new("veld");
    for module in modules {
        jit.lower(module)?;
    }
    if let Some(path) = dump_llvm {
        jit.dump_ir(path)?;
    }
    jit.compile()?;

    for module in modules {
        if let Some(init) = jit.entry_point(&module.init) {
            // Generated init functions take no arguments and return
            // nothing; the contract is upheld by the generator.
            unsafe { init() };
        }
    }
    let root = modules.last().ok_or_else(|| Error::Internal("no modules".into()))?;
    for entry in &root.entries {
        match jit.entry_point(entry) {
            Some(f) => unsafe { f() },
            None => {
                return Err(Error::BackendFailure(format!(
                    "missing entry point {}",
                    entry
                )))
            }
        }
    }
    Ok(())
}

#[cfg(not(feature = "llvm"))]
fn execute(_modules: &[IrModule], _dump_llvm: Option<&std::path::Path>) -> Result<(), Error> {
    Err(Error::BackendFailure(
        "veldc was built without the llvm feature; use --emit-ir or `check`".into(),
    ))
}

/// Interactive loop: each input compiles and runs as a fresh unit; a
/// fatal error aborts only that input.
fn repl(cli: &Cli) {
    use std::io::{BufRead, Write};

    println!("Veld 0.1.0 interactive mode (empty line evaluates, Ctrl-D exits)");
    let stdin = std::io::stdin();
    let mut buffer = String::new();

    loop {
        if buffer.is_empty() {
            print!("> ");
        } else {
            print!(". ");
        }
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                let err = anyhow::Error::new(e).context("failed to read input");
                eprintln!("{:#}", err);
                break;
            }
        }

        if !line.trim().is_empty() {
            buffer.push_str(&line);
            continue;
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let source = std::mem::take(&mut buffer);
        let mut manager = UnitManager::new(cli.include.clone());
        let result = manager
            .load_source(&source, "repl")
            .and_then(|unit| generate_all(&manager, &unit))
            .and_then(|modules| execute(&modules, None));
        if let Err(e) = result {
            report(&e);
        }
    }
}
