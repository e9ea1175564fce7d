//! Glint CLI
//!
//! Command-line interface for running Glint scripts.

use clap::Parser as ClapParser;
use std::io::Read;
use std::path::PathBuf;
use std::process;

use glint_runtime::{GlintError, Vm};

#[derive(ClapParser)]
#[command(name = "glint")]
#[command(about = "Glint - a small dynamically typed scripting language", long_about = None)]
struct Cli {
    /// Script to run. Omit or pass `-` to read from stdin.
    path: Option<PathBuf>,

    /// Print a bytecode disassembly and a per-instruction stack trace to stderr.
    #[arg(long)]
    trace: bool,
}

const EX_USAGE: i32 = 65;
const EX_SOFTWARE: i32 = 70;

fn read_source(path: Option<&PathBuf>) -> std::io::Result<String> {
    match path {
        Some(p) if p.as_os_str() != "-" => std::fs::read_to_string(p),
        _ => {
            let mut source = String::new();
            std::io::stdin().read_to_string(&mut source)?;
            Ok(source)
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let source = match read_source(cli.path.as_ref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("glint: {e}");
            process::exit(EX_SOFTWARE);
        }
    };

    let mut vm = Vm::new();
    vm.trace = cli.trace || std::env::var("GLINT_TRACE").is_ok();

    match vm.interpret(&source) {
        Ok(()) => {}
        Err(GlintError::Compile(e)) => {
            eprintln!("{e}");
            process::exit(EX_USAGE);
        }
        Err(GlintError::Runtime(e)) => {
            eprintln!("{e}");
            process::exit(EX_SOFTWARE);
        }
    }
}
