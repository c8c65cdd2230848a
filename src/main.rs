//! `dtmesh` CLI: run a delay-tolerant messaging node, or drive one from the
//! command line.

use clap::{Parser, Subcommand};
use dtmesh::config::Config;
use dtmesh::engine::EngineCoordinator;
use dtmesh::protocol::EngineEvent;
use dtmesh::transport::TcpTransport;
use dtmesh::Result;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Delay-tolerant peer-to-peer messaging engine", long_about = None)]
struct Args {
    /// Logging verbosity passed to `env_logger` when RUST_LOG is unset.
    #[arg(short, long, default_value = "info")]
    verbosity: String,

    /// Path to the data directory (overrides config/env resolution).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Port to listen on (overrides config/env resolution).
    #[arg(short, long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the node: advertise, discover peers, and print engine events
    /// and incoming messages to stdout until interrupted.
    Run,
    /// Send a single text message to `recipient` and exit.
    Send {
        recipient: String,
        body: String,
    },
    /// List known friends.
    Friends,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    dtmesh::logging::init(&args.verbosity);

    let mut config = Config::load()?;
    if let Some(data_dir) = &args.data_dir {
        config.app.data_dir = data_dir.clone();
        config.database.path = data_dir.join("dtmesh.db");
    }
    if let Some(port) = args.port {
        config.app.listen_port = port;
    }
    config.validate()?;

    let (transport, transport_events) = TcpTransport::new(config.app.listen_port);
    let engine = EngineCoordinator::new(config, Arc::new(transport), transport_events).await?;

    match args.command {
        Command::Run => run(engine).await,
        Command::Send { recipient, body } => send(engine, &recipient, &body).await,
        Command::Friends => friends(engine).await,
    }
}

async fn run(engine: Arc<EngineCoordinator>) -> Result<()> {
    log::info!(
        "dtmesh node {} listening, press Ctrl-C to stop",
        engine.self_user_id()
    );

    let mut events = engine.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::MessageReceived { message_id, sender_id } => {
                    println!("[received] {message_id} from {sender_id}");
                }
                EngineEvent::Delivered { message_id } => {
                    println!("[delivered] {message_id}");
                }
                EngineEvent::PeerConnected { endpoint_id, name } => {
                    println!("[peer connected] {endpoint_id} ({name})");
                }
                EngineEvent::PeerDisconnected { endpoint_id } => {
                    println!("[peer disconnected] {endpoint_id}");
                }
                other => log::debug!("{other:?}"),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| dtmesh::Error::Internal(e.to_string()))?;
    event_task.abort();
    engine.shutdown().await
}

async fn send(engine: Arc<EngineCoordinator>, recipient: &str, body: &str) -> Result<()> {
    let message_id = engine.send_text(recipient, body).await?;
    println!("queued {message_id}");
    // Give the forwarder executor a moment to attempt the initial send
    // before the process exits.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    engine.shutdown().await
}

async fn friends(engine: Arc<EngineCoordinator>) -> Result<()> {
    for friend in engine.list_friends().await? {
        println!(
            "{}\t{}\t{}",
            friend.user_id,
            friend.nickname,
            if friend.is_online { "online" } else { "offline" }
        );
    }
    engine.shutdown().await
}
