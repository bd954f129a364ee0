use std::{net::SocketAddr, sync::Arc, time::Duration};

use slotmap::SlotMap;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    wire::{self, Message, MessageKind, PROTOCOL_VERSION},
    ChunkManager, Error, PeerEntry, PeerId, Result,
};

mod download;
pub use download::{download, DownloadSession};

mod listener;

mod tracker;
pub use tracker::{TrackerConfig, TrackerProc};

mod upload;
pub use upload::UploadSession;

type Sender<T> = UnboundedSender<T>;
type Receiver<T> = UnboundedReceiver<T>;
type SessionSender = Sender<SessionMsg>;
type SessionReceiver = Receiver<SessionMsg>;

/// Publishing side of the peer list consumed by a [`Session`].
pub type PeerListSender = watch::Sender<Vec<PeerEntry>>;
pub type PeerListReceiver = watch::Receiver<Vec<PeerEntry>>;

pub fn peer_list_channel() -> (PeerListSender, PeerListReceiver) {
    watch::channel(Vec::new())
}

slotmap::new_key_type! {
    struct DownloadKey;
}

enum SessionMsg {
    DownloadFinished {
        key: DownloadKey,
        result: Result<u32>,
    },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub listen_addr: SocketAddr,
    /// Our identity on the tracker. Peers announced under this id are skipped.
    pub peer_id: PeerId,
    /// Maximum wait for a single message from a peer.
    pub io_timeout: Duration,
    pub connect_timeout: Duration,
    /// How often the orchestrator checks whether every piece is available.
    pub completion_poll: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8088)),
            peer_id: PeerId::new("shoal"),
            io_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            completion_poll: Duration::from_secs(1),
        }
    }
}

/// A running node for one torrent: serves pieces to inbound peers, downloads
/// missing pieces from the peers it is told about and assembles the output
/// file once every piece is available. Seeding continues after assembly.
///
/// Dropping the handle cancels the node; sessions already running are left
/// to finish on their own.
pub struct Session {
    chunks: Arc<ChunkManager>,
    local_addr: SocketAddr,
    token: CancellationToken,
    completed: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl Session {
    /// Binds the listener and spawns the node. Bind failures are returned here.
    pub async fn start(
        chunks: Arc<ChunkManager>,
        config: SessionConfig,
        peers: PeerListReceiver,
        token: CancellationToken,
    ) -> Result<Session> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(
            addr = %local_addr,
            torrent = %chunks.torrent_id(),
            "listening for peers"
        );

        let listener = tokio::spawn(listener::run(
            listener,
            chunks.clone(),
            config.io_timeout,
            token.clone(),
        ));

        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        // a seeder's source file is already the output and is left untouched
        let (completed_tx, completed) = watch::channel(chunks.output_intact());
        if chunks.output_intact() {
            tracing::info!("{} is complete, seeding", chunks.output_path().display());
        }
        let state = SessionState {
            config,
            chunks: chunks.clone(),
            local_addr,
            sender,
            downloads: Default::default(),
            completed: completed_tx,
        };
        let orchestrator = tokio::spawn(session_run(state, receiver, peers, token.clone()));

        Ok(Self {
            chunks,
            local_addr,
            token,
            completed,
            tasks: vec![listener, orchestrator],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn chunks(&self) -> &Arc<ChunkManager> {
        &self.chunks
    }

    /// Whether the output file has been assembled.
    pub fn completed(&self) -> bool {
        *self.completed.borrow()
    }

    /// Resolves once the output file has been assembled. Returns `false` if
    /// the node stopped first.
    pub async fn wait_completed(&self) -> bool {
        let mut completed = self.completed.clone();
        let done = completed.wait_for(|done| *done).await.is_ok();
        done
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Waits for the listener and orchestrator to stop. Only returns after
    /// [`Session::shutdown`] or after the token passed to `start` is cancelled.
    pub async fn join(mut self) {
        for task in std::mem::take(&mut self.tasks) {
            if let Err(err) = task.await {
                tracing::error!("session task failed: {err}");
            }
        }
    }
}

struct SessionState {
    config: SessionConfig,
    chunks: Arc<ChunkManager>,
    local_addr: SocketAddr,
    sender: SessionSender,
    downloads: SlotMap<DownloadKey, PeerEntry>,
    completed: watch::Sender<bool>,
}

async fn session_run(
    mut state: SessionState,
    mut receiver: SessionReceiver,
    mut peers: PeerListReceiver,
    token: CancellationToken,
) {
    let batch = peers.borrow_and_update().clone();
    session_process_peers(&mut state, batch);

    let mut peers_open = true;
    let mut poll = tokio::time::interval(state.config.completion_poll);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            changed = peers.changed(), if peers_open => match changed {
                Ok(()) => {
                    let batch = peers.borrow_and_update().clone();
                    session_process_peers(&mut state, batch);
                }
                Err(_) => {
                    tracing::debug!("peer list closed");
                    peers_open = false;
                }
            },
            Some(msg) = receiver.recv() => session_process(&mut state, msg).await,
            _ = poll.tick() => session_check_completion(&mut state).await,
        }
    }

    tracing::info!(downloads = state.downloads.len(), "session stopped");
}

async fn session_process(state: &mut SessionState, msg: SessionMsg) {
    match msg {
        SessionMsg::DownloadFinished { key, result } => {
            session_process_download_finished(state, key, result).await
        }
    }
}

fn session_process_peers(state: &mut SessionState, batch: Vec<PeerEntry>) {
    if *state.completed.borrow() {
        return;
    }
    for peer in batch {
        if peer.id == state.config.peer_id || peer.addr == state.local_addr {
            continue;
        }
        if state.downloads.values().any(|active| active.addr == peer.addr) {
            tracing::debug!(addr = %peer.addr, "download already running for {}", peer.id);
            continue;
        }
        session_spawn_download(state, peer);
    }
}

fn session_spawn_download(state: &mut SessionState, peer: PeerEntry) {
    tracing::info!(addr = %peer.addr, "starting download from {}", peer.id);
    let addr = peer.addr;
    let key = state.downloads.insert(peer);
    let sender = state.sender.clone();
    let chunks = state.chunks.clone();
    let connect_timeout = state.config.connect_timeout;
    let io_timeout = state.config.io_timeout;
    tokio::spawn(async move {
        let result = download(addr, chunks, connect_timeout, io_timeout).await;
        // the orchestrator may already be gone during shutdown
        let _ = sender.send(SessionMsg::DownloadFinished { key, result });
    });
}

async fn session_process_download_finished(
    state: &mut SessionState,
    key: DownloadKey,
    result: Result<u32>,
) {
    let peer = match state.downloads.remove(key) {
        Some(peer) => peer,
        None => return,
    };
    match result {
        Ok(downloaded) => tracing::info!(
            addr = %peer.addr,
            "download from {} finished after {downloaded} pieces",
            peer.id
        ),
        Err(err) => tracing::warn!(addr = %peer.addr, "download from {} failed: {err}", peer.id),
    }
    session_check_completion(state).await;
}

async fn session_check_completion(state: &mut SessionState) {
    if *state.completed.borrow() || !state.chunks.is_complete() {
        return;
    }
    match state.chunks.assemble().await {
        Ok(path) => {
            tracing::info!("download complete, assembled {}", path.display());
            state.completed.send_replace(true);
        }
        Err(err) => tracing::error!("failed to assemble output file: {err}"),
    }
}

/// Reads the next message, failing with [`Error::Timeout`] if the peer stays
/// silent for longer than `timeout`.
async fn receive<S>(stream: &mut S, timeout: Duration) -> Result<Option<Message>>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, wire::read_message(stream)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}

fn expect_message(message: Option<Message>, expected: MessageKind) -> Result<Message> {
    let message = message.ok_or_else(|| Error::protocol("failed to parse message"))?;
    if message.version != PROTOCOL_VERSION {
        return Err(Error::protocol(format!(
            "unsupported protocol version {}",
            message.version
        )));
    }
    if message.kind == expected {
        return Ok(message);
    }
    if message.kind == MessageKind::Error {
        return Err(Error::Remote(message.reason()));
    }
    Err(Error::protocol(format!(
        "expected {expected}, received {}",
        message.kind
    )))
}

async fn report_error<S>(stream: &mut S, error: &Error)
where
    S: AsyncWrite + Unpin,
{
    let reason = match error.peer_reason() {
        Some(reason) => reason,
        None => return,
    };
    if let Err(err) = wire::write_message(stream, &Message::error(&reason)).await {
        tracing::debug!("failed to send error to peer: {err}");
    }
}
