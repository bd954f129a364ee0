use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use bytes::Bytes;

use crate::{Error, PieceBitfield, PieceIdx, Result, Sha1, TorrentInfo};

pub mod disk;
use disk::PieceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PieceStatus {
    /// Not requested from any peer.
    Missing,
    /// Claimed by exactly one download session.
    Downloading,
    /// Verified and persisted.
    Available,
}

type ClaimId = u64;

#[derive(Debug)]
struct PieceState {
    hash: Sha1,
    status: PieceStatus,
    /// Set exactly while the piece is `Downloading`.
    owner: Option<ClaimId>,
}

impl PieceState {
    fn owned_by(&self, claim: ClaimId) -> bool {
        self.status == PieceStatus::Downloading && self.owner == Some(claim)
    }
}

/// Tracks the status of every piece of one torrent.
///
/// The status table sits behind a single lock so that claiming, releasing and
/// committing pieces are serialized across all sessions. The lock is never held
/// across an await point. Every claim carries its own id and a piece only
/// changes state on behalf of the claim that currently owns it, so a claim that
/// lost its piece to `release` can neither commit nor release it again.
#[derive(Debug)]
pub struct ChunkManager {
    info: TorrentInfo,
    store: PieceStore,
    pieces: Mutex<Vec<PieceState>>,
    next_claim: AtomicU64,
    output_intact: bool,
}

impl ChunkManager {
    /// Builds the manager and marks every piece already present under `root`
    /// as available, either as a persisted piece file or inside an existing
    /// output file.
    pub async fn open(info: TorrentInfo, root: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let store = PieceStore::new(info.clone(), root.into());
        let mut present = store.scan().await.map_err(Error::Storage)?;
        let import = store
            .import_output(&present)
            .await
            .map_err(Error::Storage)?;
        if !import.imported.is_empty() {
            tracing::info!(
                count = import.imported.len(),
                "imported pieces from {}",
                store.output_path().display()
            );
        }
        present.extend(import.imported);

        let mut pieces = info
            .pieces()
            .iter()
            .map(|&hash| PieceState {
                hash,
                status: PieceStatus::Missing,
                owner: None,
            })
            .collect::<Vec<_>>();
        for idx in present {
            pieces[idx.as_usize()].status = PieceStatus::Available;
        }

        let manager = Self {
            info,
            store,
            pieces: Mutex::new(pieces),
            next_claim: AtomicU64::new(0),
            output_intact: import.intact,
        };
        let (available, total) = manager.progress();
        tracing::info!(
            torrent = %manager.torrent_id(),
            "pre-seeded {available}/{total} pieces"
        );
        Ok(Arc::new(manager))
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    pub fn torrent_id(&self) -> Sha1 {
        self.info.torrent_id()
    }

    pub fn piece_count(&self) -> u32 {
        self.info.pieces_count()
    }

    pub fn file_name(&self) -> &str {
        self.info.file_name()
    }

    pub fn output_path(&self) -> PathBuf {
        self.store.output_path()
    }

    /// Whether the output file already held every piece when the manager was
    /// opened, in which case it never needs to be assembled.
    pub fn output_intact(&self) -> bool {
        self.output_intact
    }

    pub fn status(&self, piece_idx: PieceIdx) -> Option<PieceStatus> {
        self.lock().get(piece_idx.as_usize()).map(|p| p.status)
    }

    /// Snapshot of the pieces we can serve.
    pub fn bitfield(&self) -> PieceBitfield {
        let pieces = self.lock();
        let mut bitfield = PieceBitfield::with_size(pieces.len() as u32);
        for (index, piece) in pieces.iter().enumerate() {
            if piece.status == PieceStatus::Available {
                bitfield.set_piece(PieceIdx::new(index as u32));
            }
        }
        bitfield
    }

    /// Claims the first piece, in ordinal order, that is missing locally and
    /// advertised by the peer.
    pub fn claim_next_missing(self: &Arc<Self>, peer_bitfield: &PieceBitfield) -> Option<PieceClaim> {
        let mut pieces = self.lock();
        let (index, piece) = pieces.iter_mut().enumerate().find(|(index, piece)| {
            piece.status == PieceStatus::Missing
                && peer_bitfield.has_piece(PieceIdx::new(*index as u32))
        })?;
        let id = self.next_claim.fetch_add(1, Ordering::Relaxed);
        piece.status = PieceStatus::Downloading;
        piece.owner = Some(id);
        Some(PieceClaim {
            manager: Arc::clone(self),
            id,
            index: PieceIdx::new(index as u32),
            hash: piece.hash,
            settled: false,
        })
    }

    /// Returns a downloading piece with this hash to `Missing`. Returns `false`
    /// and changes nothing if no such piece is downloading.
    pub fn release(&self, hash: Sha1) -> bool {
        let mut pieces = self.lock();
        match pieces
            .iter_mut()
            .find(|p| p.hash == hash && p.status == PieceStatus::Downloading)
        {
            Some(piece) => {
                piece.status = PieceStatus::Missing;
                piece.owner = None;
                true
            }
            None => false,
        }
    }

    /// Verifies `data` against `hash`, persists it and marks the downloading
    /// piece with that hash as available, on behalf of whichever claim holds
    /// it. On a hash mismatch the piece stays `Downloading` and must be
    /// released by the caller.
    pub async fn commit(&self, hash: Sha1, data: Bytes) -> Result<PieceIdx> {
        verify(hash, &data)?;
        let (piece_idx, claim) = {
            let pieces = self.lock();
            pieces
                .iter()
                .enumerate()
                .find_map(|(index, p)| match p.owner {
                    Some(claim) if p.hash == hash && p.owned_by(claim) => {
                        Some((PieceIdx::new(index as u32), claim))
                    }
                    _ => None,
                })
                .ok_or(Error::NotClaimed(hash))?
        };
        self.persist(piece_idx, hash, claim, &data).await?;
        Ok(piece_idx)
    }

    pub fn is_complete(&self) -> bool {
        self.lock()
            .iter()
            .all(|p| p.status == PieceStatus::Available)
    }

    pub fn lookup_by_ordinal(&self, piece_idx: PieceIdx) -> Option<Sha1> {
        self.lock().get(piece_idx.as_usize()).map(|p| p.hash)
    }

    /// Returns `(available, total)`.
    pub fn progress(&self) -> (u32, u32) {
        let pieces = self.lock();
        let available = pieces
            .iter()
            .filter(|p| p.status == PieceStatus::Available)
            .count();
        (available as u32, pieces.len() as u32)
    }

    /// Reads the persisted bytes of an available piece.
    pub async fn read_piece(&self, piece_idx: PieceIdx) -> Result<Bytes> {
        let hash = {
            let pieces = self.lock();
            let piece = pieces.get(piece_idx.as_usize()).ok_or(Error::OutOfRange {
                index: u64::from(u32::from(piece_idx)),
                count: pieces.len() as u32,
            })?;
            if piece.status != PieceStatus::Available {
                return Err(Error::Unavailable(piece_idx));
            }
            piece.hash
        };
        self.store
            .read(piece_idx, hash)
            .await
            .map_err(Error::Storage)
    }

    /// Concatenates all pieces into the output file.
    pub async fn assemble(&self) -> Result<PathBuf> {
        let (available, total) = self.progress();
        if available != total {
            return Err(Error::Incomplete { available, total });
        }
        let path = self.store.assemble().await.map_err(Error::Storage)?;
        tracing::info!("assembled {}", path.display());
        Ok(path)
    }

    // ownership is checked before the write and again when flipping the status,
    // the piece may be released while the write is in flight
    async fn persist(
        &self,
        piece_idx: PieceIdx,
        hash: Sha1,
        claim: ClaimId,
        data: &[u8],
    ) -> Result<()> {
        if !self.owns(piece_idx, claim) {
            return Err(Error::NotClaimed(hash));
        }
        self.store
            .write(piece_idx, hash, data)
            .await
            .map_err(Error::Storage)?;
        let mut pieces = self.lock();
        let piece = &mut pieces[piece_idx.as_usize()];
        if !piece.owned_by(claim) {
            return Err(Error::NotClaimed(hash));
        }
        piece.status = PieceStatus::Available;
        piece.owner = None;
        tracing::debug!(piece = %piece_idx, "piece available");
        Ok(())
    }

    fn owns(&self, piece_idx: PieceIdx, claim: ClaimId) -> bool {
        self.lock()[piece_idx.as_usize()].owned_by(claim)
    }

    fn release_index(&self, piece_idx: PieceIdx, claim: ClaimId) -> bool {
        let mut pieces = self.lock();
        let piece = &mut pieces[piece_idx.as_usize()];
        if !piece.owned_by(claim) {
            return false;
        }
        piece.status = PieceStatus::Missing;
        piece.owner = None;
        true
    }

    // every critical section leaves the table consistent, so a poisoned lock is still usable
    fn lock(&self) -> MutexGuard<'_, Vec<PieceState>> {
        self.pieces.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn verify(expected: Sha1, data: &[u8]) -> Result<()> {
    let received = Sha1::hash(data);
    if received != expected {
        return Err(Error::HashMismatch { expected, received });
    }
    Ok(())
}

/// Exclusive right to download one piece.
///
/// Dropping a claim that was not committed returns the piece to `Missing`, so
/// a session that fails or is dropped mid-transfer never strands a piece.
#[derive(Debug)]
pub struct PieceClaim {
    manager: Arc<ChunkManager>,
    id: ClaimId,
    index: PieceIdx,
    hash: Sha1,
    settled: bool,
}

impl PieceClaim {
    pub fn index(&self) -> PieceIdx {
        self.index
    }

    pub fn hash(&self) -> Sha1 {
        self.hash
    }

    /// Verifies and persists the piece. On error the claim is dropped and the
    /// piece released. Fails with [`Error::NotClaimed`] if the piece was
    /// released behind this claim's back.
    pub async fn commit(mut self, data: Bytes) -> Result<()> {
        verify(self.hash, &data)?;
        self.manager
            .persist(self.index, self.hash, self.id, &data)
            .await?;
        self.settled = true;
        Ok(())
    }

    pub fn release(mut self) {
        self.settled = true;
        self.manager.release_index(self.index, self.id);
    }
}

impl Drop for PieceClaim {
    fn drop(&mut self) {
        if !self.settled && self.manager.release_index(self.index, self.id) {
            tracing::debug!(piece = %self.index, "released piece");
        }
    }
}
