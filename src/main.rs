// ABOUTME: Main entry point for the shellbox CLI
//
// Binary: shellbox
// Usage: shellbox <COMMAND>
// - exec: run one command through a fresh persistent session
// - repl: interactive loop over one session, with input/poll channels

#![allow(missing_docs)]

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use shellbox::config::AppConfig;
use shellbox::terminal::{ExecuteRequest, SessionOptions, TerminalSession};

#[derive(Parser)]
#[command(name = "shellbox", about = "Persistent tmux-backed shell execution", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single command through a fresh session and print the observation
    Exec {
        /// The command to execute
        command: String,

        /// Hard timeout in seconds; without it the no-output pause applies
        #[arg(long)]
        timeout: Option<f64>,

        /// Working directory for the session
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,

        /// Identity to run the shell as
        #[arg(long)]
        username: Option<String>,
    },

    /// Drive one session interactively from stdin
    ///
    /// Plain lines run as commands. `:i <text>` sends input to the running
    /// process (`:i C-c` interrupts it), an empty line polls for more
    /// output, `:q` quits.
    Repl {
        /// Working directory for the session
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,

        /// Identity to run the shell as
        #[arg(long)]
        username: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load().unwrap_or_default();
    setup_logging(&config);

    match cli.command {
        Commands::Exec {
            command,
            timeout,
            work_dir,
            username,
        } => exec(&config, command, timeout, work_dir, username).await,
        Commands::Repl { work_dir, username } => repl(&config, work_dir, username).await,
    }
}

fn session_options(config: &AppConfig, username: Option<String>) -> SessionOptions {
    let mut options = config.terminal.session_options();
    if username.is_some() {
        options.username = username;
    }
    options
}

async fn exec(
    config: &AppConfig,
    command: String,
    timeout: Option<f64>,
    work_dir: PathBuf,
    username: Option<String>,
) -> Result<()> {
    let mut session = TerminalSession::new(&work_dir, session_options(config, username));
    session
        .initialize()
        .await
        .context("Failed to initialize terminal session")?;

    let mut request = ExecuteRequest::new(command);
    if let Some(secs) = timeout {
        request = request.with_timeout(Duration::from_secs_f64(secs));
    }

    let result = session.execute(&request).await;
    session.close().await.ok();

    let observation = result.context("Command execution failed")?;
    println!("{}", observation.agent_observation());

    if observation.exit_code > 0 {
        std::process::exit(observation.exit_code.min(255));
    }
    Ok(())
}

async fn repl(config: &AppConfig, work_dir: PathBuf, username: Option<String>) -> Result<()> {
    let mut session = TerminalSession::new(&work_dir, session_options(config, username));
    session
        .initialize()
        .await
        .context("Failed to initialize terminal session")?;

    println!("shellbox repl - plain lines run commands, ':i <text>' sends input, empty line polls, ':q' quits");

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush().ok();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end_matches('\n');

        let request = if line == ":q" {
            break;
        } else if let Some(input) = line.strip_prefix(":i ") {
            ExecuteRequest::input(input)
        } else {
            ExecuteRequest::new(line)
        };

        match session.execute(&request).await {
            Ok(observation) => println!("{}", observation.agent_observation()),
            Err(err) => {
                eprintln!("session error: {err}");
                break;
            }
        }
    }

    session.close().await.ok();
    Ok(())
}

fn setup_logging(config: &AppConfig) {
    use std::fs::OpenOptions;
    use tracing_subscriber::prelude::*;

    let log_dir = config.resolved_log_dir();
    let _ = std::fs::create_dir_all(&log_dir);

    let log_file = log_dir.join(format!(
        "shellbox-{}.jsonl",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));

    let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_file) else {
        // no log file, run silent rather than refuse to start
        return;
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_writer(file)
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shellbox=info".into()),
        )
        .init();
}
