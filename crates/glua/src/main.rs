use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use glua::{exit_code, Interpreter};
use glua_vm::Mode;

#[derive(Parser)]
#[command(name = "glua", about = "A small Lua-flavored scripting language", version)]
struct Cli {
    /// Script to execute; omit it for a REPL
    file: Option<String>,

    /// Suppress the REPL banner
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();

    match cli.file {
        Some(file) => run_file(&file),
        None => repl(cli.quiet),
    }
}

fn run_file(file: &str) {
    let source = match std::fs::read_to_string(file) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Error reading {file}: {error}");
            std::process::exit(4);
        }
    };

    let mut interpreter = Interpreter::new(Mode::Script);
    match interpreter.eval(&source) {
        Ok(value) => println!("{value}"),
        Err(errors) => {
            eprintln!("{errors}");
            std::process::exit(exit_code(&errors));
        }
    }
}

fn repl(quiet: bool) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(error) => {
            eprintln!("Failed to start line editor: {error}");
            std::process::exit(4);
        }
    };
    let history_path = history_dir().join("history.txt");
    let _ = editor.load_history(&history_path);

    if !quiet {
        println!("glua v{}", env!("CARGO_PKG_VERSION"));
        println!("Running REPL... Ctrl-D to exit");
    }

    let mut interpreter = Interpreter::new(Mode::Repl);

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(input);

                match interpreter.eval(input) {
                    Ok(value) => println!("{value}"),
                    Err(errors) => {
                        println!("{errors}");
                        // Start the next line with a clean slate.
                        interpreter.clear_errors();
                    }
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(error) => {
                eprintln!("Read error: {error}");
                break;
            }
        }
    }

    let _ = std::fs::create_dir_all(history_dir());
    let _ = editor.save_history(&history_path);
}

fn history_dir() -> std::path::PathBuf {
    std::env::var("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("."))
        .join(".glua")
}
