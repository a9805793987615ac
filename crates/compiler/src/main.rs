//! Mica compiler CLI
//!
//! Command-line interface for compiling .mica programs to amd64 Plan-9
//! assembly and for running parse/type checks.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use std::path::PathBuf;
use std::process;

use micac::CompilerConfig;

#[derive(ClapParser)]
#[command(name = "micac")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Mica compiler - compile .mica programs to amd64 assembly", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a .mica file to Plan-9 amd64 assembly
    Build {
        /// Input .mica source file
        input: PathBuf,

        /// Output path (defaults to the input with a .s extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the assembly to standard output instead of a file
        #[arg(long)]
        stdout: bool,

        /// Path to a TOML build configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Parse and type-check .mica files without generating code
    Check {
        /// Input .mica source files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build {
            input,
            output,
            stdout,
            config,
        } => run_build(&input, output.as_deref(), stdout, config.as_deref()),
        Commands::Check { inputs } => run_check(&inputs),
        Commands::Completions { shell } => run_completions(shell),
    }
}

fn run_build(
    input: &std::path::Path,
    output: Option<&std::path::Path>,
    to_stdout: bool,
    config_path: Option<&std::path::Path>,
) {
    let config = match config_path {
        Some(path) => {
            let content = match std::fs::read_to_string(path) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Error reading config {}: {}", path.display(), e);
                    process::exit(1);
                }
            };
            match CompilerConfig::from_toml(&content) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    process::exit(1);
                }
            }
        }
        None => CompilerConfig::default(),
    };

    if to_stdout {
        let source = match std::fs::read_to_string(input) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error reading {}: {}", input.display(), e);
                process::exit(1);
            }
        };
        match micac::compile_source(&source, &config) {
            Ok(asm) => print!("{}", asm),
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        }
        return;
    }

    match micac::compile_file(input, output, &config) {
        Ok(out) => println!("Compiled {} -> {}", input.display(), out.display()),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run_check(inputs: &[PathBuf]) {
    let mut failed = false;
    for input in inputs {
        let source = match std::fs::read_to_string(input) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error reading {}: {}", input.display(), e);
                failed = true;
                continue;
            }
        };
        match micac::check_source(&source) {
            Ok(_) => println!("{}: ok", input.display()),
            Err(e) => {
                eprintln!("{}: {}", input.display(), e);
                failed = true;
            }
        }
    }
    if failed {
        process::exit(1);
    }
}

fn run_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "micac", &mut io::stdout());
}
