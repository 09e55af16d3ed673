//! Lox CLI
//!
//! Command-line interface for running Lox programs: execute a file, start
//! an interactive shell, evaluate a string from argv, or run the built-in
//! test battery.
//!
//! Exit codes follow the classic sysexits split: 0 on success, 65 on a
//! compile error, 70 on a runtime error, 74 when a file cannot be read.

mod battery;

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use lox_core::{ErrorKind, Value};
use lox_runtime::Vm;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

#[derive(ClapParser)]
#[command(name = "lox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lox interpreter - compile and run Lox programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a Lox source file
    #[command(visible_alias = "r")]
    Run {
        /// Input .lox source file
        path: PathBuf,
    },

    /// Start an interactive shell
    #[command(visible_alias = "s")]
    Shell,

    /// Evaluate a source string
    #[command(visible_alias = "e")]
    Eval {
        /// Lox source text
        source: String,
    },

    /// Run the built-in test battery
    #[command(visible_alias = "t")]
    Test,

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run { path } => run_file(&path),
        Commands::Shell => run_shell(),
        Commands::Eval { source } => run_eval(&source),
        Commands::Test => battery::run_all(),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "lox", &mut io::stdout());
            0
        }
    };
    process::exit(code);
}

fn run_file(path: &Path) -> i32 {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(_) => {
            eprintln!("Could not open file \"{}\".", path.display());
            return 74;
        }
    };
    let mut vm = Vm::new();
    exit_code_for(vm.interpret(&source))
}

fn run_eval(source: &str) -> i32 {
    let mut vm = Vm::new();
    exit_code_for(vm.interpret(source))
}

fn run_shell() -> i32 {
    println!("Welcome to Lox. Type 'q' to quit.");
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(error) => {
            eprintln!("Could not start line editor: {}", error);
            return 74;
        }
    };

    // One VM for the whole session, so globals persist between lines.
    let mut vm = Vm::new();
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim() == "q" {
                    break;
                }
                let _ = editor.add_history_entry(line.as_str());
                let value = vm.interpret(&line);
                println!("=> result: {}", value);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(error) => {
                eprintln!("Could not read line: {}", error);
                return 74;
            }
        }
    }
    0
}

fn exit_code_for(value: Value) -> i32 {
    if !value.is_error() {
        return 0;
    }
    match value.as_error() {
        ErrorKind::Compile => 65,
        ErrorKind::Runtime => 70,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_program(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(contents.as_bytes()).expect("write temp file");
        file
    }

    #[test]
    fn test_run_file_success() {
        let file = write_program("print 1 + 2;");
        assert_eq!(run_file(file.path()), 0);
    }

    #[test]
    fn test_run_file_compile_error() {
        let file = write_program("print ;");
        assert_eq!(run_file(file.path()), 65);
    }

    #[test]
    fn test_run_file_runtime_error() {
        let file = write_program("print 1 + nil;");
        assert_eq!(run_file(file.path()), 70);
    }

    #[test]
    fn test_run_file_missing() {
        assert_eq!(run_file(Path::new("definitely/not/a/real/file.lox")), 74);
    }

    #[test]
    fn test_eval_exit_codes() {
        assert_eq!(run_eval("var answer = 6 * 7;"), 0);
        assert_eq!(run_eval("var = ;"), 65);
        assert_eq!(run_eval("undefined_function();"), 70);
    }

    #[test]
    fn test_demo_programs_run_clean() {
        let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos");
        for name in ["fib.lox", "counter.lox", "brew.lox"] {
            assert_eq!(run_file(&demos.join(name)), 0, "{} should run clean", name);
        }
    }

    #[test]
    fn test_battery_passes() {
        assert_eq!(battery::run_all(), 0);
    }
}
