use clap::Parser as ClapParser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::process;

use riposte::frontend::{self, FrontendError};
use riposte::{intern, stringify, Format, Global, State};

const HISTORY_FILE: &str = ".riposte_history";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum FormatArg {
    #[value(name = "R")]
    R,
    #[value(name = "Riposte")]
    Riposte,
}

#[derive(ClapParser, Debug)]
#[command(name = "riposte", version, about = "Vectorized array-language VM")]
struct Cli {
    /// Execute the named source file non-interactively
    #[arg(short = 'f', long = "file", value_name = "PATH")]
    file: Option<String>,

    /// Number of worker threads
    #[arg(short = 'j', default_value_t = 1, value_name = "N")]
    threads: usize,

    /// Verbose diagnostics
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Suppress echo of top-level results
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Output format
    #[arg(short = 'F', long = "format", value_enum, default_value = "Riposte")]
    format: FormatArg,

    /// Dump a per-opcode execution profile under this name at exit
    #[arg(short = 'p', long = "profile", value_name = "NAME")]
    profile: Option<String>,
}

fn main() {
    // Everything after --args belongs to the program, not the driver.
    let argv: Vec<String> = std::env::args().collect();
    let (driver_args, program_args) = match argv.iter().position(|a| a == "--args") {
        Some(i) => (argv[..i].to_vec(), argv[i + 1..].to_vec()),
        None => (argv.clone(), Vec::new()),
    };
    let cli = Cli::parse_from(driver_args);

    env_logger::Builder::new()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init();

    let global = Global::new(cli.threads, &program_args);
    let mut state = State::new_main(global.clone());
    if cli.profile.is_some() {
        state.enable_profile();
    }
    let echo = !cli.quiet;
    let format = match cli.format {
        FormatArg::R => Format::R,
        FormatArg::Riposte => Format::Riposte,
    };

    let rc = match &cli.file {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(source) => run_source(&mut state, &source, echo, format),
            Err(err) => {
                eprintln!("Error reading file '{}': {}", path, err);
                1
            }
        },
        None => {
            println!("Riposte ({} thread{})", cli.threads, if cli.threads == 1 { "" } else { "s" });
            println!();
            repl(&mut state, echo, format)
        }
    };

    if let Some(name) = &cli.profile {
        if let Err(err) = std::fs::write(name, state.profile_report()) {
            eprintln!("Error writing profile '{}': {}", name, err);
        }
    }

    drop(state);
    global.shutdown();
    process::exit(rc);
}

/// Evaluate one unit, echoing visible results.
fn eval_and_echo(state: &mut State, exprs: &[frontend::Expr], echo: bool, format: Format) {
    let global = state.global.clone();
    for expr in exprs {
        let proto = match frontend::compile(&global, std::slice::from_ref(expr)) {
            Ok(p) => p,
            Err(err) => {
                eprintln!("Error ({}): {}", err.kind(), err.message());
                return;
            }
        };
        match state.eval_top_level(proto, global.global_env) {
            // Nil marks an error already routed through __stop__.
            Ok(v) if v.is_nil() => {}
            Ok(v) => {
                // SAFETY: env and heap are live for the whole session.
                unsafe {
                    *(*global.global_env).insert(&global.heap, intern(".Last.value")) = v;
                }
                let visible = unsafe { (*proto).visible };
                if echo && visible {
                    println!("{}", stringify(v, format));
                }
            }
            Err(err) => {
                eprintln!("Error ({}): {}", err.kind(), err.message());
            }
        }
    }
}

fn run_source(state: &mut State, source: &str, echo: bool, format: Format) -> i32 {
    match frontend::parse(source) {
        Ok(exprs) => {
            eval_and_echo(state, &exprs, echo, format);
            0
        }
        Err(FrontendError::Incomplete) => {
            eprintln!("Error (compiler): unexpected end of input");
            1
        }
        Err(FrontendError::Message(m)) => {
            eprintln!("Error (compiler): {}", m);
            1
        }
    }
}

fn repl(state: &mut State, echo: bool, format: Format) -> i32 {
    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(err) => {
            eprintln!("Error initializing line editor: {}", err);
            return 1;
        }
    };
    let _ = rl.load_history(HISTORY_FILE);

    let mut input = String::new();
    loop {
        let prompt = if input.is_empty() { "> " } else { "+ " };
        match rl.readline(prompt) {
            Ok(line) => {
                if !line.is_empty() {
                    let _ = rl.add_history_entry(line.as_str());
                    let _ = rl.save_history(HISTORY_FILE);
                }
                input.push_str(&line);
                input.push('\n');
                match frontend::parse(&input) {
                    Ok(exprs) => {
                        input.clear();
                        eval_and_echo(state, &exprs, echo, format);
                    }
                    Err(FrontendError::Incomplete) => {}
                    Err(FrontendError::Message(m)) => {
                        input.clear();
                        eprintln!("Error (compiler): {}", m);
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                input.clear();
            }
            Err(ReadlineError::Eof) => return 0,
            Err(err) => {
                eprintln!("Error: {}", err);
                return 1;
            }
        }
    }
}
