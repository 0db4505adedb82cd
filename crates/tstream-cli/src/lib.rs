use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use tstream_config::resolve;
use tstream_runtime::{Agent, DeclarationStore, LocalVault, ProcessOptions};

#[derive(Parser)]
#[command(name = "tstream", about = "Telemetry streaming agent", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the agent
    Run {
        /// Declaration file to apply at startup (otherwise the stored
        /// declaration is used)
        #[arg(long)]
        declaration: Option<PathBuf>,

        /// Directory holding the agent's persistent state
        #[arg(long, default_value = "/var/lib/tstream")]
        data_dir: PathBuf,

        /// Log filter (overrides the declaration's Controls.logLevel)
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Validate a declaration and print its expanded components
    Check {
        /// Declaration file
        file: PathBuf,
    },

    /// Write test frames to a local listener port
    Inject {
        /// Listener port
        #[arg(long, default_value_t = tstream_types::DEFAULT_EVENT_LISTENER_PORT)]
        port: u16,

        /// File with one frame per line; `-` reads stdin
        file: PathBuf,
    },
}

pub fn run(cli: Cli) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    match cli.command {
        Command::Run {
            declaration,
            data_dir,
            log_level,
        } => runtime.block_on(run_agent(declaration, data_dir, log_level)),
        Command::Check { file } => check_declaration(&file),
        Command::Inject { port, file } => runtime.block_on(inject_frames(port, &file)),
    }
}

async fn run_agent(
    declaration: Option<PathBuf>,
    data_dir: PathBuf,
    log_level: Option<String>,
) -> Result<()> {
    let startup = declaration.map(|path| read_declaration(&path)).transpose()?;

    // Precedence: --log-level, then the declaration's Controls, then env
    let controls_level = startup
        .as_ref()
        .and_then(|raw| raw.get("Controls"))
        .and_then(|controls| controls.get("logLevel"))
        .and_then(Value::as_str)
        .map(str::to_string);
    init_logging(log_level.or(controls_level).as_deref());

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("could not create {}", data_dir.display()))?;
    let store = Arc::new(DeclarationStore::open(&data_dir.join("state.db"))?);
    let agent = Arc::new(Agent::new(store, Arc::new(LocalVault)));

    let change_loop = agent.start().await?;

    if let Some(raw) = startup {
        agent
            .worker()
            .process_declaration(raw, ProcessOptions::saved())
            .await
            .context("startup declaration rejected")?;
    }

    wait_for_interrupt().await;
    change_loop.abort();
    agent.shutdown().await;
    Ok(())
}

fn check_declaration(path: &PathBuf) -> Result<()> {
    let raw = read_declaration(path)?;
    let resolved = resolve(&raw, None).context("declaration is invalid")?;

    println!("{:<60} {:<48} enabled", "id", "class");
    for component in &resolved.components {
        println!(
            "{:<60} {:<48} {}",
            component.id,
            component.class().as_str(),
            component.enable
        );
    }
    println!(
        "\n{} components, {} mapped producers",
        resolved.components.len(),
        resolved.mappings.len()
    );
    Ok(())
}

async fn inject_frames(port: u16, path: &PathBuf) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let content = if path.as_os_str() == "-" {
        use std::io::Read;
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?
    };

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .with_context(|| format!("no listener on port {}", port))?;
    for line in content.lines().filter(|line| !line.trim().is_empty()) {
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
    }
    stream.flush().await?;
    println!("injected {} frame(s) into port {}", content.lines().count(), port);
    Ok(())
}

fn read_declaration(path: &PathBuf) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", path.display()))
}

fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    // Ignored when a subscriber is already set (tests)
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn wait_for_interrupt() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    if ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .is_err()
    {
        // No signal handler available; run until externally killed
        std::future::pending::<()>().await;
    }
    let _ = rx.recv().await;
}
