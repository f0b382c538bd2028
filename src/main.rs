mod cli;
mod shell_completion;

use std::io::{self, IsTerminal};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Confirm;
use tracing::{info, warn};

use cli::{Cli, Command};
use saturn_relay::catalog::{self, Catalog};
use saturn_relay::config::{self, ManagerConfig};
use saturn_relay::log::LogFileSink;
use saturn_relay::relay::Answer;
use saturn_relay::sink::{self, ConsoleSink, Fanout};
use saturn_relay::supervisor::{CommandSpec, RunOutcome, RunReport, Supervisor};
use saturn_relay::web::{self, AppState, LOG_STEM};

/// Process exit status for a finished run.
fn exit_status(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Completed { code } => *code,
        RunOutcome::TimedOut { .. } => 124,
        RunOutcome::Terminated => 130,
        RunOutcome::Failed { .. } => 1,
    }
}

fn open_run_log(config: &ManagerConfig) -> Option<LogFileSink> {
    match LogFileSink::timestamped(&config.log_dir(), LOG_STEM, config.log.format) {
        Ok(log) => {
            info!("logging run to {}", log.path().display());
            Some(log)
        }
        Err(e) => {
            warn!("run log disabled: {e:#}");
            None
        }
    }
}

/// Ask the terminal user to answer a detected prompt.
fn ask(supervisor: &Supervisor, text: &str) {
    let answer = match Confirm::new().with_prompt(text).default(true).interact() {
        Ok(true) => Answer::Yes,
        Ok(false) => Answer::No,
        Err(e) => {
            warn!("cannot ask interactively ({e}); the prompt will time out unanswered");
            return;
        }
    };
    if let Err(e) = supervisor.answer(answer) {
        warn!("answer not relayed: {e}");
    }
}

/// Run `spec` in the foreground: narrate to the terminal, ask on prompts,
/// cancel on Ctrl-C. Returns once the run finishes, even if a question is
/// still on screen.
fn supervise(
    config: &ManagerConfig,
    supervisor: &Supervisor,
    spec: CommandSpec,
) -> Result<RunReport> {
    let auto_answer = spec.auto_answer;
    let (channel, receiver) = sink::channel("terminal", config.server.sink_buffer);
    let mut fanout = Fanout::default().with(channel);
    if let Some(log) = open_run_log(config) {
        fanout = fanout.with(log);
    }

    let cancel = supervisor.clone();
    ctrlc::set_handler(move || {
        cancel.cancel();
    })
    .ok();

    let handle = supervisor.start(spec, fanout)?;
    let stdout = io::stdout();
    let color = stdout.is_terminal();
    let mut console = ConsoleSink::new(stdout, color);

    // The question runs on its own thread so an expired prompt or a cancel
    // ends the run without waiting for a keypress.
    console.follow(&receiver, |text| {
        if auto_answer.is_some() {
            return;
        }
        let supervisor = supervisor.clone();
        let text = text.to_string();
        thread::spawn(move || ask(&supervisor, &text));
    });

    Ok(handle.wait())
}

fn print_scripts(catalog: &Catalog) {
    if catalog.is_empty() {
        println!("No scripts available.");
    }
    for (category, scripts) in catalog.grouped() {
        println!("{category}");
        for script in scripts {
            let version = script
                .version
                .as_deref()
                .map(|v| format!(" (v{v})"))
                .unwrap_or_default();
            let description = script.entry.description.as_deref().unwrap_or("");
            println!("  {:<28} {}{}", script.name(), description, version);
            if !script.entry.flags.is_empty() {
                println!("  {:<28} flags: {}", "", script.entry.flags.join(" "));
            }
        }
    }
    for warning in catalog.warnings() {
        println!("warning: {warning}");
    }
}

fn home_dir() -> Result<std::path::PathBuf> {
    dirs::home_dir().context("could not determine the home directory")
}

fn finish(report: &RunReport) -> Result<()> {
    let code = exit_status(&report.outcome);
    info!(
        outcome = %report.outcome,
        elapsed_secs = report.elapsed.as_secs(),
        "run finished"
    );
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let quiet_command = matches!(
        &cli.command,
        Command::Config { .. } | Command::Completions { .. } | Command::Scripts { json: true }
    );

    let filter = match cli.verbose {
        0 if quiet_command => "saturn_relay=warn",
        0 => "saturn_relay=info",
        1 => "saturn_relay=debug",
        _ => "saturn_relay=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ManagerConfig::load(&cwd)?;

    if !quiet_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .saturn/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Run {
            script,
            backup_dir,
            skip_check,
            flags,
        } => {
            let home = home_dir()?;
            let catalog = Catalog::load(&config.scripts, &home);
            for warning in catalog.warnings() {
                warn!("{warning}");
            }
            let script = catalog.find(&script)?;
            let launcher = config.launcher();
            if !skip_check {
                launcher.preflight(script)?;
            }
            let spec = launcher.command(script, &flags, backup_dir.as_deref())?;
            let supervisor = Supervisor::new(config.supervisor_config()?);
            let report = supervise(&config, &supervisor, spec)?;
            finish(&report)
        }
        Command::Exec {
            yes,
            no,
            timeout,
            prompt_timeout,
            argv,
        } => {
            let (program, args) = argv
                .split_first()
                .context("exec needs a program after `--`")?;
            let auto_answer = match (yes, no) {
                (true, _) => Some(Answer::Yes),
                (_, true) => Some(Answer::No),
                _ => None,
            };
            let spec = CommandSpec::new(program.as_str(), args.iter().cloned())
                .timeout(timeout.map_or(config.supervisor.timeout(), Duration::from_secs))
                .prompt_timeout(
                    prompt_timeout.map_or(config.supervisor.prompt_timeout(), Duration::from_secs),
                )
                .auto_answer(auto_answer);
            let supervisor = Supervisor::new(config.supervisor_config()?);
            let report = supervise(&config, &supervisor, spec)?;
            finish(&report)
        }
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let state = AppState::from_config(&config, home_dir()?)?;
            for warning in state.catalog.warnings() {
                warn!("{warning}");
            }
            let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
            runtime.block_on(web::serve(state, &bind))
        }
        Command::Scripts { json } => {
            let catalog = Catalog::load(&config.scripts, &home_dir()?);
            if json {
                let rendered = serde_json::to_string_pretty(&catalog)
                    .context("failed to serialize catalog to JSON")?;
                println!("{rendered}");
            } else {
                print_scripts(&catalog);
            }
            Ok(())
        }
        Command::Backups { kind } => {
            let names = catalog::list_backups(kind.into(), &home_dir()?)?;
            if names.is_empty() {
                println!("No backups found.");
            }
            for name in names {
                println!("{name}");
            }
            Ok(())
        }
        Command::Config { json } => {
            let path = config_path.as_deref();
            if json {
                println!("{}", config::render_json(&config, path)?);
            } else {
                print!("{}", config::render_human(&config, path));
            }
            Ok(())
        }
        Command::Completions { shell } => shell_completion::print(shell),
    }
}
