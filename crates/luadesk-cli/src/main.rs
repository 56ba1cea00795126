use std::{
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, mpsc},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use luadesk::{
    CallerKind, DialogService, FileMode, HostEvent, HostEventKind, RunOutcome, ScriptHost, SessionConfig,
};
use tracing_subscriber::EnvFilter;

/// How often the event loop wakes to retry deferred replies.
const PUMP_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[command(name = "luadesk")]
#[command(about = "Run, debug and compile Lua scripts", long_about = None)]
struct Cli {
    #[command(flatten)]
    session: SessionArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SessionArgs {
    /// JSON session configuration; flags below override it
    #[arg(long, global = true, env = "LUADESK_CONFIG")]
    config: Option<PathBuf>,

    /// Stream debug snapshots to stderr while the script runs
    #[arg(long, global = true, env = "LUADESK_DEBUG")]
    debug: bool,

    /// Start the interpreter without its standard libraries
    #[arg(long, global = true)]
    no_stdlib: bool,

    /// Mailbox polling quantum in milliseconds
    #[arg(long, global = true, env = "LUADESK_POLL_MS")]
    poll_ms: Option<u64>,

    /// Interpreter memory limit in bytes
    #[arg(long, global = true, env = "LUADESK_MEMORY_LIMIT")]
    memory_limit: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file
    Run {
        /// Script to run
        file: PathBuf,

        /// Print the run outcome as JSON on stdout when done
        #[arg(long)]
        json: bool,
    },

    /// Compile a script file to stripped bytecode
    Compile {
        /// Script to compile
        file: PathBuf,

        /// Output path for the bytecode
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Interactive console; globals persist between entries
    Console,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("LUADESK_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match session_config(&cli.session) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Run { file, json } => run_file(config, &file, json),
        Commands::Compile { file, output } => compile_file(config, &file, &output),
        Commands::Console => console(config.chunk_name("console")),
    }
}

fn session_config(args: &SessionArgs) -> Result<SessionConfig, String> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|err| format!("cannot read {}: {err}", path.display()))?;
            SessionConfig::from_json(&text).map_err(|err| format!("invalid config {}: {err}", path.display()))?
        }
        None => SessionConfig::new(),
    };
    if args.debug {
        config = config.debugging(true);
    }
    if args.no_stdlib {
        config = config.standard_libraries(false);
    }
    if let Some(millis) = args.poll_ms {
        config = config.poll_quantum_ms(millis);
    }
    if let Some(bytes) = args.memory_limit {
        config = config.memory_limit(bytes);
    }
    Ok(config)
}

fn run_file(config: SessionConfig, path: &Path, json: bool) -> ExitCode {
    let show_snapshots = config.debugging;
    let (tx, rx) = mpsc::channel();
    let mut host = match ScriptHost::open("main", CallerKind::Editor, config, Arc::new(tx)) {
        Ok(host) => host,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let started = host.run_file(path, None).map_err(|err| err.to_string());
    let outcome = match started.and_then(|()| run_to_completion(&mut host, &rx, show_snapshots)) {
        Ok(outcome) => outcome,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    if json {
        match serde_json::to_string(&outcome) {
            Ok(text) => println!("{text}"),
            Err(err) => eprintln!("error: cannot encode outcome: {err}"),
        }
    }
    if outcome.ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn compile_file(config: SessionConfig, path: &Path, output: &Path) -> ExitCode {
    let (tx, _rx) = mpsc::channel();
    let host = match ScriptHost::open("compile", CallerKind::Editor, config, Arc::new(tx)) {
        Ok(host) => host,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    let result = host.with_session(|session| {
        session.run_script_file(path, None, FileMode::Compile { out_path: output })
    });
    match result {
        Some(Ok(())) => {
            eprintln!("wrote {}", output.display());
            ExitCode::SUCCESS
        }
        Some(Err(err)) => {
            report_error(&err.to_string(), err.line());
            ExitCode::FAILURE
        }
        None => {
            eprintln!("error: session is busy");
            ExitCode::FAILURE
        }
    }
}

fn console(config: SessionConfig) -> ExitCode {
    let (tx, rx) = mpsc::channel();
    let show_snapshots = config.debugging;
    let mut host = match ScriptHost::open("console", CallerKind::Console, config, Arc::new(tx)) {
        Ok(host) => host,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut source = String::new();
    loop {
        let prompt = if source.is_empty() { "> " } else { ">> " };
        let Some(line) = read_line(prompt) else {
            println!();
            break;
        };
        if source.is_empty() && line.trim().is_empty() {
            continue;
        }
        if !source.is_empty() {
            source.push('\n');
        }
        source.push_str(&line);

        let incomplete = host
            .with_session(|session| session.needs_more_input(&source))
            .unwrap_or(false);
        if incomplete {
            continue;
        }

        let finished = host
            .run(&source)
            .map_err(|err| err.to_string())
            .and_then(|()| run_to_completion(&mut host, &rx, show_snapshots));
        if let Err(err) = finished {
            eprintln!("error: {err}");
        }
        source.clear();
    }
    ExitCode::SUCCESS
}

/// Plays the UI thread until the started run's terminal event arrives.
fn run_to_completion(
    host: &mut ScriptHost,
    events: &mpsc::Receiver<HostEvent>,
    show_snapshots: bool,
) -> Result<RunOutcome, String> {
    let mut dialogs = TerminalDialogs;
    loop {
        match events.recv_timeout(PUMP_INTERVAL) {
            Ok(event) if !host.owns(&event) => {}
            Ok(event) => {
                render(&event, show_snapshots);
                if let Some(outcome) = host.handle_event(&event, &mut dialogs) {
                    return Ok(outcome);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => host.pump(),
            Err(mpsc::RecvTimeoutError::Disconnected) => return Err("event channel closed".to_owned()),
        }
    }
}

fn render(event: &HostEvent, show_snapshots: bool) {
    match &event.kind {
        HostEventKind::Print(text) => {
            print!("{text}");
            let _ = io::stdout().flush();
        }
        HostEventKind::Clear => {
            print!("\x1B[2J\x1B[H");
            let _ = io::stdout().flush();
        }
        HostEventKind::ErrorOutput { message, line } => report_error(message, *line),
        HostEventKind::Snapshot(text) if show_snapshots => eprintln!("--- snapshot ---\n{text}"),
        _ => {}
    }
}

fn report_error(message: &str, line: Option<usize>) {
    match line {
        Some(line) => eprintln!("error (line {}): {message}", line + 1),
        None => eprintln!("error: {message}"),
    }
}

/// Modal dialogs on the terminal.
struct TerminalDialogs;

impl DialogService for TerminalDialogs {
    fn read_text(&mut self, prompt: &str) -> Option<String> {
        let prompt = if prompt.is_empty() { "? " } else { " " };
        read_line(prompt)
    }

    fn ask(&mut self, question: &str) -> bool {
        read_line(&format!("{question} [y/N] ")).is_some_and(|answer| matches!(answer.trim(), "y" | "Y" | "yes"))
    }

    fn alert(&mut self, message: &str) {
        let _ = read_line(&format!("{message} [enter] "));
    }
}

fn read_line(prompt: &str) -> Option<String> {
    print!("{prompt}");
    io::stdout().flush().ok()?;
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\n', '\r']).to_owned()),
    }
}
