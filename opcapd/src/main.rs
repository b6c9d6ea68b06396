use std::convert::Infallible;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{debug, info};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::process::Command as ChildCommand;
use tokio::sync::mpsc;

use opcapd::config::Config;
use opcapd::hooks::{HookRegistry, WatchedOp};
use opcapd::{ConsumedEvent, Subsystem, spawn_consumer};

const EVENT_QUEUE: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "opcapd")]
#[command(about = "Process lifecycle and executable mapping capture")]
struct Args {
    /// Path to config file (default: $OPCAP_CONFIG or /etc/opcap/opcap.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Print capture metrics as JSON before exiting
    #[arg(long)]
    stats: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record the executable mappings of a running process
    Snapshot {
        #[arg(long)]
        pid: u32,
    },
    /// Run a command under capture and report its lifecycle
    Run {
        #[arg(trailing_var_arg = true, required = true, value_name = "CMD")]
        argv: Vec<String>,
    },
}

/// Replay a program replacement for a process that is already running.
fn snapshot(registry: &HookRegistry, pid: u32) -> anyhow::Result<()> {
    anyhow::ensure!(
        Path::new(&format!("/proc/{pid}")).exists(),
        "no process with pid {pid}"
    );
    registry
        .execve(pid, || Ok::<(), Infallible>(()))
        .unwrap_or_else(|never| match never {});
    Ok(())
}

async fn run(registry: &HookRegistry, argv: &[String]) -> anyhow::Result<i32> {
    let (program, rest) = argv.split_first().context("no command given")?;
    let mut spawned = None;
    let pid = registry
        .fork(WatchedOp::Fork, std::process::id(), || {
            let child = ChildCommand::new(program).args(rest).spawn()?;
            let pid = child
                .id()
                .ok_or_else(|| io::Error::other("child exited before its pid was read"))?;
            spawned = Some(child);
            Ok::<u32, io::Error>(pid)
        })
        .with_context(|| format!("failed to spawn {program}"))?;
    let mut child = spawned.context("spawned child went missing")?;

    // spawn() only returns once the exec has succeeded.
    registry
        .execve(pid, || Ok::<(), Infallible>(()))
        .unwrap_or_else(|never| match never {});

    let status = child
        .wait()
        .await
        .with_context(|| format!("waiting for {program} (pid {pid})"))?;
    let code = status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1);
    info!("{} (pid {}) exited with {}", program, pid, code);
    Ok(registry.exit(pid, code, |code| code))
}

async fn print_events(mut rx: mpsc::Receiver<ConsumedEvent>) -> anyhow::Result<()> {
    let mut out = BufWriter::new(tokio::io::stdout());
    while let Some(event) = rx.recv().await {
        let line = serde_json::to_string(&event)?;
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
    }
    out.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::load(),
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();
    debug!("config: {:?}", config);

    let mut subsystem = Subsystem::new(&config).context("failed to set up capture")?;
    let consumer = subsystem
        .consumer()
        .context("failed to open mapping buffer")?;
    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    let consumer_task = spawn_consumer(consumer, tx);
    let printer = tokio::spawn(print_events(rx));

    let exit_code = match &args.command {
        Command::Snapshot { pid } => {
            snapshot(subsystem.registry(), *pid)?;
            0
        }
        Command::Run { argv } => run(subsystem.registry(), argv).await?,
    };

    let stats = subsystem.shutdown();
    consumer_task
        .await
        .context("consumer task panicked")?
        .context("consumer failed")?;
    printer.await.context("printer task panicked")??;

    if args.stats {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
