use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use color_eyre::{eyre::WrapErr as _, Result};
use shoal::{
    create_from_file, peer_list_channel, AnnounceParams, ChunkManager, PeerId, Session,
    SessionConfig, TorrentCreatorConfig, TorrentInfo, TrackerClient, TrackerConfig, TrackerProc,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
struct Args {
    /// Log at info level unless RUST_LOG is set.
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Seed and download a torrent until interrupted.
    Peer(PeerArgs),
    /// Write a torrent descriptor for a file.
    Create(CreateArgs),
}

#[derive(Debug, clap::Args)]
struct PeerArgs {
    #[clap(short, long, default_value_t = 8088)]
    port: u16,

    /// Directory holding the pieces and the assembled file.
    #[clap(short, long, default_value = ".")]
    dest: PathBuf,

    /// Address announced to the tracker instead of the one it observes.
    #[clap(long)]
    ip: Option<IpAddr>,

    /// Peer id announced to the tracker.
    netid: String,

    torrent: PathBuf,
}

#[derive(Debug, clap::Args)]
struct CreateArgs {
    #[clap(long)]
    piece_size: Option<u32>,

    #[clap(long)]
    tracker: String,

    file: PathBuf,

    out: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    color_eyre::install()?;

    let default_level = if args.verbose { "info" } else { "warn" };
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(filter_layer)
        .init();

    match args.command {
        Command::Peer(args) => peer(args).await,
        Command::Create(args) => create(args).await,
    }
}

async fn peer(args: PeerArgs) -> Result<()> {
    let info = TorrentInfo::load(&args.torrent)
        .await
        .wrap_err_with(|| format!("failed to load {}", args.torrent.display()))?;
    tokio::fs::create_dir_all(&args.dest)
        .await
        .wrap_err_with(|| format!("failed to create {}", args.dest.display()))?;
    let chunks = ChunkManager::open(info.clone(), &args.dest).await?;

    let token = CancellationToken::new();
    let peer_id = PeerId::new(args.netid);
    let (peers, receiver) = peer_list_channel();

    let tracker = match info.tracker_url() {
        Some(url) => {
            let client = TrackerClient::new(url)?;
            let params = AnnounceParams {
                torrent_id: info.torrent_id(),
                peer_id: peer_id.clone(),
                port: args.port,
                ip: args.ip,
            };
            Some(TrackerProc::spawn(
                client,
                params,
                TrackerConfig::default(),
                peers,
                token.clone(),
            ))
        }
        None => {
            tracing::warn!("torrent has no tracker, no peers will be discovered");
            None
        }
    };

    let config = SessionConfig {
        listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port),
        peer_id,
        ..Default::default()
    };
    let session = Session::start(chunks, config, receiver, token.clone())
        .await
        .wrap_err_with(|| format!("failed to listen on port {}", args.port))?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    token.cancel();
    session.join().await;
    if let Some(tracker) = tracker {
        tracker.join().await;
    }
    Ok(())
}

async fn create(args: CreateArgs) -> Result<()> {
    let config = TorrentCreatorConfig {
        file_name: None,
        tracker_url: Some(args.tracker),
        piece_size: args.piece_size,
    };
    let info = create_from_file(&args.file, config)
        .await
        .wrap_err_with(|| format!("failed to read {}", args.file.display()))?;
    tokio::fs::write(&args.out, info.encode()?).await?;
    println!("{} {}", info.torrent_id(), args.out.display());
    Ok(())
}
