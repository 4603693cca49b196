use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use scanhost_proto::wire::{HostRequest, ServiceReply};
use std::{env, fs, path::PathBuf, process, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};
use warden::{
    app::{App, BootstrapConfig},
    channel::{ChannelManager, ProcessTransport},
    isolation::IsolationPathStore,
    logger::{init_tracing, AuditHooks},
    prompt::ConsolePresenter,
    settings::{EnvSettingsStore, Settings},
    workflow::{CandidateFile, Correlator, WorkflowEvent},
};

#[derive(Parser, Debug)]
#[command(
    name = "warden",
    about = "Quarantine and scan finished downloads",
    version = "0.2.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch the downloads directory and run workflows until Ctrl-C
    Run(RunArgs),

    /// Quarantine and scan a single file, then exit
    Analyze(AnalyzeArgs),

    /// Move the isolation directory (the scan host relocates its files)
    SetPath(SetPathArgs),

    /// Print the configured isolation directory
    GetPath,

    /// Emit JSON Schema for the wire protocol
    Schema,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Downloads directory to watch; defaults to $WARDEN_DOWNLOADS, then
    /// $HOME/Downloads
    #[arg(long)]
    downloads: Option<PathBuf>,

    /// Scan host executable; defaults to $WARDEN_SCANHOST
    #[arg(long)]
    service: Option<PathBuf>,

    /// Only report downloads with these extensions (comma separated);
    /// empty reports everything
    #[arg(long, value_delimiter = ',')]
    ext: Vec<String>,

    /// Seconds between directory polls
    #[arg(long, default_value = "2")]
    poll_secs: u64,

    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// File to quarantine and scan
    file: PathBuf,

    /// Scan host executable; defaults to $WARDEN_SCANHOST
    #[arg(long)]
    service: Option<PathBuf>,

    /// Optional log level override
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Args, Debug)]
struct SetPathArgs {
    /// New isolation directory
    path: String,

    /// Scan host executable; defaults to $WARDEN_SCANHOST
    #[arg(long)]
    service: Option<PathBuf>,

    /// Optional log level override
    #[arg(long, default_value = "warn")]
    log_level: String,
}

/// Resolve the warden root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("WARDEN_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./warden")
    }
}

fn resolve_service(flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path);
    }
    if let Ok(path) = env::var("WARDEN_SCANHOST") {
        return Ok(PathBuf::from(path));
    }
    bail!("no scan host configured; pass --service or set WARDEN_SCANHOST")
}

fn resolve_downloads_dir(flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path);
    }
    if let Ok(path) = env::var("WARDEN_DOWNLOADS") {
        return Ok(PathBuf::from(path));
    }
    if let Ok(home) = env::var("HOME") {
        return Ok(PathBuf::from(home).join("Downloads"));
    }
    bail!("no downloads directory found; pass --downloads or set WARDEN_DOWNLOADS")
}

fn load_settings(root: &PathBuf) -> anyhow::Result<Settings> {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir)?;
    Ok(Settings(EnvSettingsStore::new(config_dir.join(".env"))))
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs {
        downloads: None,
        service: None,
        ext: vec![],
        poll_secs: 2,
        log_level: "info".to_string(),
    })) {
        Commands::Run(args) => {
            let root = resolve_root_dir();
            run(root, args).await?;
            Ok(())
        }
        Commands::Analyze(args) => {
            let root = resolve_root_dir();
            init_tracing(&root, &args.log_level)?;
            analyze(root, args).await?;
            Ok(())
        }
        Commands::SetPath(args) => {
            let root = resolve_root_dir();
            init_tracing(&root, &args.log_level)?;
            set_path(root, args).await?;
            Ok(())
        }
        Commands::GetPath => {
            let root = resolve_root_dir();
            let settings = load_settings(&root)?;
            let current = settings.isolation_path().await;
            if current.is_empty() {
                println!("isolation path: (scan host default)");
            } else {
                println!("isolation path: {current}");
            }
            Ok(())
        }
        Commands::Schema => {
            let root = resolve_root_dir();
            let out_dir = root.join("schemas");
            fs::create_dir_all(&out_dir)?;
            let requests = schemars::schema_for!(HostRequest);
            fs::write(
                out_dir.join("host_request.schema.json"),
                serde_json::to_string_pretty(&requests)?,
            )?;
            let replies = schemars::schema_for!(ServiceReply);
            fs::write(
                out_dir.join("service_reply.schema.json"),
                serde_json::to_string_pretty(&replies)?,
            )?;
            println!("Schemas written to {}", out_dir.display());
            process::exit(0);
        }
    }
}

async fn run(root: PathBuf, args: RunArgs) -> anyhow::Result<()> {
    init_tracing(&root, &args.log_level)?;

    let downloads = resolve_downloads_dir(args.downloads)?;
    let service = resolve_service(args.service)?;
    let settings = load_settings(&root)?;
    let presenter = Arc::new(ConsolePresenter::new());

    info!("warden starting up");
    println!("warden {} is starting up", env!("CARGO_PKG_VERSION"));

    let mut app = App::new();
    let result = app
        .bootstrap(
            BootstrapConfig {
                downloads_dir: Some(downloads.clone()),
                extensions: args.ext,
                poll_interval: std::time::Duration::from_secs(args.poll_secs.max(1)),
            },
            Arc::new(ProcessTransport::new(service)),
            presenter.clone(),
            settings,
        )
        .await;
    if let Err(e) = result {
        error!("Failed to bootstrap warden: {:#}", e);
        eprintln!("❌ Failed to bootstrap warden: {e:#}");
        process::exit(1);
    }

    println!("watching {}; press Ctrl-C to exit", downloads.display());
    info!(downloads = %downloads.display(), "warden running; press Ctrl-C to exit");

    // Lines typed by the user answer open questions.
    let events = match app.events() {
        Some(events) => events,
        None => bail!("bootstrap finished without an event queue"),
    };
    let stdin_presenter = presenter.clone();
    let stdin_task = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match stdin_presenter.parse_choice(line) {
                Some((id, choice)) => {
                    if events.send(WorkflowEvent::Choice { id, choice }).await.is_err() {
                        break;
                    }
                }
                None => println!("      could not match that; reply with: <tag> <number>"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;

    println!("\nShutting down…");
    info!("warden shutting down");

    stdin_task.abort();
    app.shutdown().await;

    println!("Goodbye!");

    process::exit(0);
}

/// One file, one workflow: drive the correlator inline and exit as soon as
/// the file's fate is settled.
async fn analyze(root: PathBuf, args: AnalyzeArgs) -> anyhow::Result<()> {
    if !args.file.is_file() {
        bail!("{} is not a file", args.file.display());
    }
    let service = resolve_service(args.service)?;
    let settings = load_settings(&root)?;
    let presenter = Arc::new(ConsolePresenter::new());

    let (chan_tx, mut chan_rx) = mpsc::channel(64);
    let channel = ChannelManager::new(Arc::new(ProcessTransport::new(service)), chan_tx);
    let mut correlator = Correlator::new(channel.clone(), presenter.clone(), settings);
    correlator.store_mut().add_hook(Arc::new(AuditHooks));

    correlator
        .handle(WorkflowEvent::AnalyzeRequested(CandidateFile::new(args.file)))
        .await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    while !correlator.is_idle() {
        tokio::select! {
            ev = chan_rx.recv() => match ev {
                Some(ev) => correlator.handle(ev.into()).await,
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match presenter.parse_choice(line) {
                        Some((id, choice)) => {
                            correlator.handle(WorkflowEvent::Choice { id, choice }).await
                        }
                        None => println!("      could not match that; reply with: <tag> <number>"),
                    }
                }
                _ => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\naborted");
                break;
            }
        }
    }

    channel.shutdown().await;
    Ok(())
}

async fn set_path(root: PathBuf, args: SetPathArgs) -> anyhow::Result<()> {
    let service = resolve_service(args.service)?;
    let settings = load_settings(&root)?;

    // The receiver stays alive so stray replies have somewhere to go.
    let (chan_tx, _chan_rx) = mpsc::channel(64);
    let channel = ChannelManager::new(Arc::new(ProcessTransport::new(service)), chan_tx);
    let store = IsolationPathStore::new(settings, channel.clone());

    match store.update(&args.path).await {
        Ok(update) => {
            println!("✅ Isolation path is now {}", args.path);
            println!("   {}", update.details);
            if let Some(moved) = update.moved_count {
                println!("   {moved} isolated file(s) moved.");
            }
            channel.shutdown().await;
            Ok(())
        }
        Err(e) => {
            channel.shutdown().await;
            eprintln!("❌ {e}");
            process::exit(1);
        }
    }
}
