use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use rand::RngCore as _;
use shoal::{
    peer_list_channel,
    wire::{self, Message, MessageKind},
    ChunkManager, PeerEntry, PeerId, PieceIdx, Session, SessionConfig, Sha1, TorrentCreator,
    TorrentCreatorConfig, TorrentInfo,
};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

const PIECE_SIZE: u32 = 1024;
const TIMEOUT: Duration = Duration::from_secs(10);

fn random_data(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

fn torrent(data: &[u8]) -> TorrentInfo {
    let mut creator = TorrentCreator::new(TorrentCreatorConfig {
        file_name: Some("payload.bin".to_string()),
        piece_size: Some(PIECE_SIZE),
        ..Default::default()
    });
    creator.push_data(data);
    creator.finish().unwrap()
}

fn config(peer_id: &str) -> SessionConfig {
    SessionConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        peer_id: PeerId::new(peer_id),
        io_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        completion_poll: Duration::from_millis(50),
    }
}

async fn open(info: &TorrentInfo, root: &Path) -> Arc<ChunkManager> {
    ChunkManager::open(info.clone(), root).await.unwrap()
}

async fn seeder(info: &TorrentInfo, data: &[u8], root: &Path) -> Session {
    tokio::fs::write(root.join(info.file_name()), data).await.unwrap();
    let chunks = open(info, root).await;
    assert!(chunks.is_complete());
    let (_peers, receiver) = peer_list_channel();
    Session::start(chunks, config("seeder"), receiver, CancellationToken::new())
        .await
        .unwrap()
}

async fn next(stream: &mut TcpStream) -> Option<Message> {
    tokio::time::timeout(TIMEOUT, wire::read_message(stream))
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn three_piece_transfer() {
    let data = random_data(2 * PIECE_SIZE as usize + 300);
    let info = torrent(&data);
    assert_eq!(info.pieces_count(), 3);

    let seed_dir = tempfile::tempdir().unwrap();
    let seeder = seeder(&info, &data, seed_dir.path()).await;

    let leech_dir = tempfile::tempdir().unwrap();
    let chunks = open(&info, leech_dir.path()).await;
    assert_eq!(chunks.progress(), (0, 3));
    let (peers, receiver) = peer_list_channel();
    let leecher = Session::start(chunks, config("leecher"), receiver, CancellationToken::new())
        .await
        .unwrap();
    assert!(!leecher.completed());

    peers.send_replace(vec![
        PeerEntry::new(leecher.local_addr(), "leecher"),
        PeerEntry::new(seeder.local_addr(), "seeder"),
    ]);

    let completed = tokio::time::timeout(TIMEOUT, leecher.wait_completed())
        .await
        .unwrap();
    assert!(completed);
    assert!(leecher.chunks().is_complete());

    let output = tokio::fs::read(leech_dir.path().join("payload.bin"))
        .await
        .unwrap();
    assert_eq!(output, data);

    for session in [seeder, leecher] {
        session.shutdown();
        tokio::time::timeout(TIMEOUT, session.join()).await.unwrap();
    }
}

#[tokio::test]
async fn leecher_resumes_from_persisted_pieces() {
    let data = random_data(3 * PIECE_SIZE as usize);
    let info = torrent(&data);

    let seed_dir = tempfile::tempdir().unwrap();
    let seeder = seeder(&info, &data, seed_dir.path()).await;

    let leech_dir = tempfile::tempdir().unwrap();
    let chunks = open(&info, leech_dir.path()).await;
    let full = shoal::PieceBitfield::from_bytes(&[0xE0], 3).unwrap();
    let claim = chunks.claim_next_missing(&full).unwrap();
    assert_eq!(claim.index(), PieceIdx::new(0));
    claim
        .commit(bytes_of(&data, 0))
        .await
        .unwrap();
    drop(chunks);

    let chunks = open(&info, leech_dir.path()).await;
    assert_eq!(chunks.progress(), (1, 3));

    let (peers, receiver) = peer_list_channel();
    peers.send_replace(vec![PeerEntry::new(seeder.local_addr(), "seeder")]);
    let leecher = Session::start(chunks, config("leecher"), receiver, CancellationToken::new())
        .await
        .unwrap();
    assert!(tokio::time::timeout(TIMEOUT, leecher.wait_completed())
        .await
        .unwrap());
    let output = tokio::fs::read(leech_dir.path().join("payload.bin"))
        .await
        .unwrap();
    assert_eq!(output, data);
}

fn bytes_of(data: &[u8], index: usize) -> bytes::Bytes {
    let start = index * PIECE_SIZE as usize;
    let end = (start + PIECE_SIZE as usize).min(data.len());
    bytes::Bytes::copy_from_slice(&data[start..end])
}

#[tokio::test]
async fn wrong_torrent_id_is_rejected() {
    let data = random_data(PIECE_SIZE as usize * 2);
    let info = torrent(&data);
    let dir = tempfile::tempdir().unwrap();
    let seeder = seeder(&info, &data, dir.path()).await;

    let mut stream = TcpStream::connect(seeder.local_addr()).await.unwrap();
    wire::write_message(&mut stream, &Message::hello_request(Sha1::hash(b"other")))
        .await
        .unwrap();
    let reply = next(&mut stream).await.unwrap();
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.reason(), "torrent id not valid");
    assert!(next(&mut stream).await.is_none());
}

#[tokio::test]
async fn out_of_range_request_is_rejected() {
    let data = random_data(PIECE_SIZE as usize * 2 + 1);
    let info = torrent(&data);
    let dir = tempfile::tempdir().unwrap();
    let seeder = seeder(&info, &data, dir.path()).await;
    let before = seeder.chunks().bitfield();

    let mut stream = TcpStream::connect(seeder.local_addr()).await.unwrap();
    wire::write_message(&mut stream, &Message::hello_request(info.torrent_id()))
        .await
        .unwrap();
    let hello = next(&mut stream).await.unwrap();
    assert_eq!(hello.kind, MessageKind::HelloResponse);
    assert_eq!(hello.payload.as_ref(), before.bytes());

    let request = Message::piece_request(PieceIdx::new(3), 1).unwrap();
    wire::write_message(&mut stream, &request).await.unwrap();
    let reply = next(&mut stream).await.unwrap();
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.reason(), "chunk invalid");
    assert!(next(&mut stream).await.is_none());
    assert_eq!(seeder.chunks().bitfield(), before);
}

#[tokio::test]
async fn shutdown_stops_listener() {
    let data = random_data(PIECE_SIZE as usize);
    let info = torrent(&data);
    let dir = tempfile::tempdir().unwrap();
    let seeder = seeder(&info, &data, dir.path()).await;
    let addr = seeder.local_addr();

    seeder.shutdown();
    tokio::time::timeout(TIMEOUT, seeder.join()).await.unwrap();
    assert!(TcpStream::connect(addr).await.is_err());
}
