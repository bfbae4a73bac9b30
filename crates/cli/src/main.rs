//! Moat host shell
//!
//! Runs untrusted scripts under explicit resource bounds, checks them
//! without running, and offers a budgeted REPL. Each error kind maps to
//! a distinct exit code so wrapping tooling can tell a misbehaving
//! script from an over-budget one.

mod profile;
mod repl;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};

use moat_core::Prototype;
use moat_runtime::{Globals, GlobalsConfig, Loader, RuntimeError};

use crate::profile::SandboxProfile;

/// The compiler, seen through the runtime's loader seam.
struct SourceCompiler;

impl Loader for SourceCompiler {
    fn compile(&self, source: &[u8], chunk_name: &str) -> Result<Arc<Prototype>, String> {
        moat_compiler::compile(source, chunk_name).map_err(|e| e.to_string())
    }
}

#[derive(Parser)]
#[command(name = "moat")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run untrusted Lua 5.2 scripts under hard resource bounds", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script under the sandbox bounds
    Run {
        /// Script file
        input: PathBuf,

        /// Sandbox profile (TOML)
        #[arg(long)]
        profile: Option<PathBuf>,

        /// Instruction budget (overrides the profile)
        #[arg(long)]
        max_instructions: Option<u64>,

        /// Intermediate string size cap in bytes (overrides the profile)
        #[arg(long)]
        max_string_size: Option<usize>,

        /// Source length cap in bytes (overrides the profile)
        #[arg(long)]
        max_source_len: Option<usize>,

        /// Report reachable bytes after the run
        #[arg(long)]
        memory: bool,
    },

    /// Compile a script without running it
    Check {
        /// Script files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Interactive session with a per-line budget
    Repl {
        /// Sandbox profile (TOML)
        #[arg(long)]
        profile: Option<PathBuf>,
    },

    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Exit codes by failure kind; success is 0.
fn exit_code_for(err: &RuntimeError) -> u8 {
    match err {
        RuntimeError::Compile(_) => 2,
        RuntimeError::ScriptTooLong { .. } => 3,
        RuntimeError::Lua { .. } => 4,
        RuntimeError::LimitExceeded { .. } => 5,
        RuntimeError::StringLimitExceeded { .. } => 6,
        RuntimeError::Orphaned => 7,
        RuntimeError::Internal(_) => 70,
    }
}

fn load_profile(path: Option<&PathBuf>) -> Result<SandboxProfile, String> {
    match path {
        Some(p) => SandboxProfile::load(p),
        None => Ok(SandboxProfile::default()),
    }
}

/// A sandbox configured from a profile, with the compiler installed.
fn build_sandbox(profile: &SandboxProfile) -> Globals {
    let globals = Globals::with_config(GlobalsConfig {
        max_source_len: profile.max_source_len,
        console_capacity: profile.console_capacity,
    });
    globals.install_loader(Arc::new(SourceCompiler));
    globals
}

fn drain_console(globals: &Globals) {
    while let Some(line) = globals.try_dequeue() {
        println!("{line}");
    }
}

fn run_file(
    input: &PathBuf,
    profile: SandboxProfile,
    report_memory: bool,
) -> Result<(), (String, u8)> {
    let source =
        std::fs::read(input).map_err(|e| (format!("cannot read {}: {e}", input.display()), 66))?;
    let globals = build_sandbox(&profile);
    if profile.max_instructions > 0 {
        globals
            .install_main_limit(profile.max_instructions, profile.max_string_size)
            .map_err(|e| (e.to_string(), 70))?;
    }
    let chunk_name = input
        .file_name()
        .map_or_else(|| "script".to_string(), |n| n.to_string_lossy().into_owned());
    let result = globals
        .load(&source, &chunk_name)
        .and_then(|f| globals.call(&f, Vec::new()));
    drain_console(&globals);
    match result {
        Ok(values) => {
            for v in values {
                println!("{}", v.display_string());
            }
            if report_memory {
                eprintln!("reachable bytes: {}", globals.used_memory());
            }
            Ok(())
        }
        Err(err) => Err((err.to_string(), exit_code_for(&err))),
    }
}

fn check_files(inputs: &[PathBuf]) -> Result<(), (String, u8)> {
    for input in inputs {
        let source = std::fs::read(input)
            .map_err(|e| (format!("cannot read {}: {e}", input.display()), 66))?;
        let chunk_name = input.to_string_lossy().into_owned();
        moat_compiler::compile(&source, &chunk_name).map_err(|e| (e.to_string(), 2))?;
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Run {
            input,
            profile,
            max_instructions,
            max_string_size,
            max_source_len,
            memory,
        } => load_profile(profile.as_ref())
            .map_err(|e| (e, 78u8))
            .and_then(|p| {
                let p = p.with_overrides(max_instructions, max_string_size, max_source_len);
                run_file(&input, p, memory)
            }),
        Commands::Check { inputs } => check_files(&inputs),
        Commands::Repl { profile } => load_profile(profile.as_ref())
            .map_err(|e| (e, 78u8))
            .and_then(|p| repl::run(&build_sandbox(&p), &p).map_err(|e| (e, 74u8))),
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "moat", &mut std::io::stdout());
            Ok(())
        }
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err((message, code)) => {
            eprintln!("moat: {message}");
            ExitCode::from(code)
        }
    }
}
