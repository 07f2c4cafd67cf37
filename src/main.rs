//! Sotto demo client.
//!
//! Runs both peers of a session in one process over the in-memory
//! rendezvous store and the loopback transport: handshake, a chat exchange,
//! a file transfer with progress, and an orderly teardown. The same core
//! drives a real deployment once the transport and store traits are bound
//! to production implementations.

use clap::Parser;
use sotto::session::loopback::{LoopbackFactory, LoopbackNetwork};
use sotto::session::{Phase, SessionCore, SessionEvent, SessionSlot};
use sotto::{MemoryRendezvous, SessionConfig, SyntheticPipeline, parse_magic_link};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "sotto", version, about = "Sotto: encrypted two-party session demo")]
struct Args {
    /// Room identifier
    #[arg(short, long, default_value = "DEMO-1")]
    room: String,

    /// Shared passphrase
    #[arg(short, long, default_value = "hunter2")]
    passphrase: String,

    /// Magic-link fragment (room=<id>&pass=<passphrase>); overrides the
    /// room and passphrase flags for the joining peer
    #[arg(long)]
    link: Option<String>,

    /// File to transfer from the first peer to the second
    #[arg(short, long)]
    file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sotto=info".into()),
        )
        .init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        error!("demo failed: {err}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryRendezvous::new());
    let network = LoopbackNetwork::new();

    let alice_config = SessionConfig::new(&args.room, &args.passphrase, "Alice");
    let bob_config = match &args.link {
        Some(link) => {
            let link = parse_magic_link(link).ok_or("invalid magic link")?;
            SessionConfig::from_magic_link(&link)
        }
        None => SessionConfig::new(&args.room, &args.passphrase, "Bob"),
    };

    let (alice, alice_phase, alice_events) = SessionCore::start(
        alice_config,
        SessionSlot::new(),
        store.clone(),
        Arc::new(LoopbackFactory::new(network.clone())),
        Arc::new(SyntheticPipeline::new()),
    )?;
    let (bob, bob_phase, bob_events) = SessionCore::start(
        bob_config,
        SessionSlot::new(),
        store.clone(),
        Arc::new(LoopbackFactory::new(network.clone())),
        Arc::new(SyntheticPipeline::new()),
    )?;

    let mut alice_done = spawn_reporter("alice", alice_events);
    let mut bob_done = spawn_reporter("bob", bob_events);

    wait_for_phase(alice_phase, Phase::Connected).await?;
    wait_for_phase(bob_phase, Phase::Connected).await?;
    info!("both peers connected");

    alice.send_chat("hello from the initiator 👋").await?;
    bob.send_chat("loud and clear").await?;

    let (file_name, payload) = match &args.file {
        Some(path) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file.bin".to_string());
            (name, std::fs::read(path)?)
        }
        None => {
            // 256 KiB of generated payload: four chunks' worth.
            let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
            ("demo.bin".to_string(), payload)
        }
    };
    info!(file = %file_name, bytes = payload.len(), "starting file transfer");
    alice
        .send_file(&file_name, "application/octet-stream", &payload)
        .await?;

    // Give the receive side a beat to report, then tear down from one side.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    alice.exit();

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), alice_done.recv()).await;
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), bob_done.recv()).await;
    info!("session closed on both sides");
    Ok(())
}

/// Print a peer's events; signal once the session terminates.
fn spawn_reporter(
    who: &'static str,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) -> mpsc::UnboundedReceiver<()> {
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Phase(phase) => info!(peer = who, ?phase, "phase"),
                SessionEvent::RemoteParticipant(p) => {
                    info!(peer = who, name = %p.display_name, audio = p.audio_enabled, video = p.video_enabled, "remote participant")
                }
                SessionEvent::Chat { text } => info!(peer = who, %text, "chat"),
                SessionEvent::FileProgress { id, received, total } => {
                    info!(peer = who, %id, received, total, "file progress")
                }
                SessionEvent::FileReceived(file) => {
                    info!(peer = who, name = %file.name, bytes = file.bytes.len(), "file received")
                }
                SessionEvent::FileAborted { id } => info!(peer = who, %id, "file aborted"),
                SessionEvent::Warning(message) => info!(peer = who, %message, "warning"),
                SessionEvent::Terminated => {
                    info!(peer = who, "terminated");
                    let _ = done_tx.send(());
                    return;
                }
            }
        }
    });
    done_rx
}

async fn wait_for_phase(mut phase_rx: watch::Receiver<Phase>, wanted: Phase) -> Result<(), String> {
    let reached = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        loop {
            if *phase_rx.borrow_and_update() == wanted {
                return true;
            }
            if phase_rx.changed().await.is_err() {
                return false;
            }
        }
    })
    .await;

    match reached {
        Ok(true) => Ok(()),
        Ok(false) => Err("phase channel closed".to_string()),
        Err(_) => Err(format!("timed out waiting for {wanted:?}")),
    }
}
