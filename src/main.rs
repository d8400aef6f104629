//! ptyhost - run a program under a pseudo terminal and stream its I/O
//!
//! Events are written to stdout as newline-delimited JSON. Control messages
//! (`{"action":"cancel"}`) are read from stdin unless `--detach` is given.
//!
//! # Quick Start
//!
//! ```text
//! ptyhost run -- git status          # run git under a 120x30 terminal
//! ptyhost run --cols 80 -- cmd /c dir
//! ptyhost probe                      # report what the child terminal looks like
//! ```
//!
//! # Exit status
//!
//! | Outcome | Status |
//! |---------|--------|
//! | child exited | child's exit code |
//! | error event | 1 |
//! | cancelled | 130 |

use std::env;
use std::path::PathBuf;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ptyhost::config::Config;
use ptyhost::stream::{ControlSource, ExecutionStreamController};
use ptyhost::transport::{DetachedControl, InterruptControl, NdjsonControl, NdjsonSink};
use ptyhost::{PathResolver, PtySize};

/// Environment variable holding a tracing filter, e.g. `ptyhost=debug`.
const LOG_ENV: &str = "PTYHOST_LOG";

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// What to do, parsed from the command line
#[derive(Debug, PartialEq)]
enum Command {
    Run { program: String, args: Vec<String> },
    Probe,
}

/// Command line options; unset values come from config.toml
#[derive(Debug, PartialEq)]
struct CliArgs {
    command: Command,
    cols: Option<u16>,
    rows: Option<u16>,
    cwd: Option<PathBuf>,
    detach: bool,
    config_path: Option<PathBuf>,
}

fn print_version() {
    eprintln!("ptyhost {}", VERSION);
}

fn print_help() {
    eprintln!("ptyhost {} - run a program under a pseudo terminal and stream its I/O", VERSION);
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  ptyhost run [OPTIONS] -- PROGRAM [ARGS...]");
    eprintln!("  ptyhost probe [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --cols <N>            Terminal width (default: 120)");
    eprintln!("  --rows <N>            Terminal height (default: 30)");
    eprintln!("  --cwd <DIR>           Working directory for the program");
    eprintln!("  --detach              Do not read control messages from stdin");
    eprintln!("  -c, --config <FILE>   Use this config file instead of ~/.ptyhost/config.toml");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Events (stdout, one JSON object per line):");
    eprintln!("  {{\"type\":\"started\",\"operationId\":...,\"commandLine\":...}}");
    eprintln!("  {{\"type\":\"output\",\"data\":...}}");
    eprintln!("  {{\"type\":\"exited\",\"exitCode\":...,\"duration\":\"HH:MM:SS.mmm\"}}");
    eprintln!("  {{\"type\":\"error\",\"code\":...,\"message\":...,\"remediationHint\":...}}");
    eprintln!();
    eprintln!("Control (stdin):");
    eprintln!("  {{\"action\":\"cancel\"}}     Kill the program and end the stream");
    eprintln!("  Closing stdin also cancels.");
    eprintln!();
    eprintln!("Logging: set {}=debug, or log_level / log_file in config.toml", LOG_ENV);
}

fn parse_number(flag: &str, value: Option<&String>) -> Result<u16, String> {
    let value = value.ok_or_else(|| format!("Missing value for {}", flag))?;
    match value.parse::<u16>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("Invalid value for {}: {}", flag, value)),
    }
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut i = 0;
    let mut subcommand: Option<&str> = None;
    let mut cols = None;
    let mut rows = None;
    let mut cwd = None;
    let mut detach = false;
    let mut config_path = None;
    let mut program: Vec<String> = Vec::new();

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "--cols" => {
                i += 1;
                cols = Some(parse_number("--cols", args.get(i))?);
            }
            "--rows" => {
                i += 1;
                rows = Some(parse_number("--rows", args.get(i))?);
            }
            "--cwd" => {
                i += 1;
                let dir = args.get(i).ok_or("Missing value for --cwd")?;
                cwd = Some(PathBuf::from(dir));
            }
            "--detach" => {
                detach = true;
            }
            "-c" | "--config" => {
                i += 1;
                let path = args.get(i).ok_or("Missing value for --config")?;
                config_path = Some(PathBuf::from(path));
            }
            "--" => {
                program.extend(args[i + 1..].iter().cloned());
                break;
            }
            "run" | "probe" if subcommand.is_none() => {
                subcommand = Some(if args[i] == "run" { "run" } else { "probe" });
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
            _ if subcommand == Some("run") => {
                // First positional starts the program; everything after it is
                // passed through untouched.
                program.extend(args[i..].iter().cloned());
                break;
            }
            arg => {
                return Err(format!("Unexpected argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    let command = match subcommand {
        Some("run") => {
            let mut program = program.into_iter();
            let name = program.next().ok_or("Missing program to run")?;
            Command::Run {
                program: name,
                args: program.collect(),
            }
        }
        Some(_) => {
            if !program.is_empty() {
                return Err("probe does not take a program".to_string());
            }
            Command::Probe
        }
        None => return Err("Missing command (run or probe). Use -h for help.".to_string()),
    };

    Ok(CliArgs {
        command,
        cols,
        rows,
        cwd,
        detach,
        config_path,
    })
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Stdout carries the event stream, so logs never go there.
    let log_file = config.log_file.as_ref().and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });

    if let Some(file) = log_file {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

/// Forward every Ctrl+C into a channel for `InterruptControl`.
///
/// The listener lives for the whole run, so an interrupt that arrives while
/// the controller is busy writing an event is queued instead of dropped.
fn forward_interrupts() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            if tx.send(()).is_err() {
                break;
            }
        }
    });
    rx
}

async fn run(cli: CliArgs) -> anyhow::Result<i32> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::load(),
    };
    init_logging(&config);
    info!("ptyhost {} starting", VERSION);

    let default_size = config.terminal.size();
    let size = PtySize::new(
        cli.cols.unwrap_or(default_size.cols),
        cli.rows.unwrap_or(default_size.rows),
    );

    let inner: Box<dyn ControlSource> = if cli.detach {
        Box::new(DetachedControl)
    } else {
        Box::new(NdjsonControl::new(tokio::io::stdin()))
    };
    let mut control = InterruptControl::new(inner, forward_interrupts());
    let mut sink = NdjsonSink::new(tokio::io::stdout());
    let controller = ExecutionStreamController::new(config.timing);

    let outcome = match cli.command {
        Command::Run { program, args } => {
            let resolver = PathResolver {
                program,
                arguments: args,
                working_directory: cli.cwd,
                size,
            };
            controller.run(&resolver, &mut sink, &mut control).await
        }
        Command::Probe => controller.probe(size, &mut sink, &mut control).await,
    };

    info!(?outcome, "ptyhost finished");
    Ok(outcome.exit_status())
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(2);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let status = match runtime.block_on(run(cli)) {
        Ok(status) => status,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    };

    // The stdin reader sits on a blocking thread that never returns; exit
    // without waiting for the runtime to wind it down.
    std::process::exit(status);
}
