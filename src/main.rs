use ai_harness::cache::MatcherStore;
use ai_harness::config::Config;
use ai_harness::diagnosis::{ConfiguredProvider, ReqwestTransport};
use ai_harness::failure::FailureLog;
use ai_harness::pipeline::{Pipeline, PipelineError, PipelineInput};
use ai_harness::runner::{CommandSpec, ProcessExecutor};
use anyhow::{Context, Result};
use clap::{ArgAction, CommandFactory, Parser};
use std::fs;
use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Exit status when there is nothing to run and no log to read.
const USAGE_EXIT_CODE: i32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "ai-harness",
    about = "Run a command; if it fails, ask an LLM what is missing, install it, and retry",
    version
)]
struct Args {
    /// Model to ask (e.g. gemini-2.5-flash, gpt-4o, or vendor/model via OpenRouter)
    #[arg(long)]
    model: Option<String>,

    /// Where matcher records are written
    #[arg(long)]
    matchers_dir: Option<PathBuf>,

    /// Diagnosis request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Program that installs package remedies as `<program> <manager> <name>`
    #[arg(long)]
    install_with: Option<String>,

    /// Don't prefix captured output lines with `[command] `
    #[arg(long)]
    no_prefix: bool,

    /// Read the failure log from this file instead of stdin
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// More logging on stderr (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Command to run (and retry), followed by its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    let code = match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            1
        }
    };
    let _ = io::stdout().flush();
    std::process::exit(code);
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(args: Args) -> Result<i32> {
    let mut config = Config::from_env();
    apply_flags(&mut config, &args);

    let Some(input) = read_input(&args)? else {
        let _ = Args::command().print_help();
        return Ok(USAGE_EXIT_CODE);
    };

    if config.credentials.is_empty() {
        info!("no API key configured; a failing command cannot be diagnosed");
    }
    let transport = ReqwestTransport::new(config.timeout).context("failed to set up HTTP client")?;
    let provider = ConfiguredProvider::new(config.credentials.clone(), Arc::new(transport));
    let store = MatcherStore::new(&config.matchers_dir);

    let mut pipeline = Pipeline::new(ProcessExecutor, provider, store, io::stdout())
        .model_hint(config.model.clone())
        .install_command(config.install_command.clone())
        .prefix_output(config.prefix_output);

    match pipeline.run(input) {
        Ok(outcome) => {
            info!(?outcome, "finished");
            Ok(outcome.exit_code())
        }
        Err(err @ PipelineError::Diagnosis { .. }) => {
            eprintln!("Analysis failed: {}", err);
            Ok(err.exit_code())
        }
        Err(err) => {
            eprintln!("Error: {}", err);
            Ok(err.exit_code())
        }
    }
}

/// Flags beat environment and settings file.
fn apply_flags(config: &mut Config, args: &Args) {
    if let Some(model) = &args.model {
        config.model = Some(model.clone());
    }
    if let Some(dir) = &args.matchers_dir {
        config.matchers_dir = dir.clone();
    }
    if let Some(secs) = args.timeout.filter(|secs| *secs > 0) {
        config.timeout = Duration::from_secs(secs);
    }
    if let Some(program) = &args.install_with {
        config.install_command = Some(program.clone());
    }
    if args.no_prefix {
        config.prefix_output = false;
    }
}

/// A non-blank log (file or piped stdin) wins; positional args then only name the retry.
fn read_input(args: &Args) -> Result<Option<PipelineInput>> {
    let command = args
        .command
        .split_first()
        .map(|(program, rest)| CommandSpec::new(program.as_str()).args(rest.iter().cloned()));

    let log = match &args.log_file {
        Some(path) => Some(
            fs::read(path)
                .with_context(|| format!("failed to read failure log {}", path.display()))?,
        ),
        None if !io::stdin().is_terminal() => {
            let mut bytes = Vec::new();
            io::stdin()
                .read_to_end(&mut bytes)
                .context("failed to read failure log from stdin")?;
            Some(bytes)
        }
        None => None,
    };

    let input = match (log.map(|bytes| FailureLog::from_bytes(&bytes)), command) {
        (Some(log), retry) if !log.is_blank() => Some(PipelineInput::Log { log, retry }),
        (_, Some(command)) => Some(PipelineInput::Command(command)),
        _ => None,
    };
    Ok(input)
}
