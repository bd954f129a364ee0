use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};

use crate::{PieceIdx, Sha1, TorrentInfo};

#[derive(Debug, Default)]
pub struct OutputImport {
    /// Pieces copied from the output file into the piece directory.
    pub imported: Vec<PieceIdx>,
    /// The output file holds every piece and nothing else.
    pub intact: bool,
}

/// One file per verified piece under `<root>/.<file_name>.pieces/`.
#[derive(Debug, Clone)]
pub struct PieceStore {
    info: TorrentInfo,
    root: PathBuf,
    pieces_dir: PathBuf,
}

impl PieceStore {
    pub fn new(info: TorrentInfo, root: PathBuf) -> Self {
        let pieces_dir = root.join(format!(".{}.pieces", info.file_name()));
        Self {
            info,
            root,
            pieces_dir,
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.root.join(self.info.file_name())
    }

    pub fn piece_path(&self, piece_idx: PieceIdx, hash: Sha1) -> PathBuf {
        self.pieces_dir.join(format!(
            "{}.{}.{}.piece",
            self.info.file_name(),
            u32::from(piece_idx),
            hash
        ))
    }

    pub async fn read(&self, piece_idx: PieceIdx, hash: Sha1) -> std::io::Result<Bytes> {
        let data = tokio::fs::read(self.piece_path(piece_idx, hash)).await?;
        Ok(Bytes::from(data))
    }

    /// Writes to a temporary sibling first so a crash never leaves a truncated
    /// piece under its final name.
    pub async fn write(&self, piece_idx: PieceIdx, hash: Sha1, data: &[u8]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.pieces_dir).await?;
        let path = self.piece_path(piece_idx, hash);
        let tmp_path = path.with_extension("tmp");
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &path).await
    }

    /// Returns the pieces whose persisted file exists and hashes correctly.
    /// Corrupt piece files are removed.
    pub async fn scan(&self) -> std::io::Result<Vec<PieceIdx>> {
        let mut present = Vec::new();
        for (piece_idx, &hash) in self.info.piece_indices().zip(self.info.pieces()) {
            let data = match self.read(piece_idx, hash).await {
                Ok(data) => data,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            if Sha1::hash(&data) == hash {
                present.push(piece_idx);
            } else {
                tracing::warn!(piece = %piece_idx, "removing corrupt piece file");
                tokio::fs::remove_file(self.piece_path(piece_idx, hash)).await?;
            }
        }
        Ok(present)
    }

    /// Verifies an existing output file piece by piece. Intact pieces that
    /// are not in `present` are copied into the piece directory.
    pub async fn import_output(&self, present: &[PieceIdx]) -> std::io::Result<OutputImport> {
        let mut file = match tokio::fs::File::open(self.output_path()).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(OutputImport::default())
            }
            Err(err) => return Err(err),
        };

        let mut import = OutputImport {
            imported: Vec::new(),
            intact: file.metadata().await?.len() == self.info.file_size(),
        };
        for (piece_idx, &hash) in self.info.piece_indices().zip(self.info.pieces()) {
            let data = match read_range(
                &mut file,
                self.info.piece_offset(piece_idx),
                self.info.piece_length_from_index(piece_idx),
            )
            .await
            {
                Ok(data) => data,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    import.intact = false;
                    break;
                }
                Err(err) => return Err(err),
            };
            if Sha1::hash(&data) != hash {
                import.intact = false;
                continue;
            }
            if !present.contains(&piece_idx) {
                self.write(piece_idx, hash, &data).await?;
                import.imported.push(piece_idx);
            }
        }
        Ok(import)
    }

    /// Concatenates every piece in ordinal order into the output file.
    pub async fn assemble(&self) -> std::io::Result<PathBuf> {
        let path = self.output_path();
        let tmp_path = self.root.join(format!(".{}.partial", self.info.file_name()));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .await?;
        for (piece_idx, &hash) in self.info.piece_indices().zip(self.info.pieces()) {
            let data = self.read(piece_idx, hash).await?;
            file.write_all(&data).await?;
        }
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(path)
    }
}

async fn read_range(file: &mut tokio::fs::File, offset: u64, length: u32) -> std::io::Result<Bytes> {
    let mut data = BytesMut::zeroed(length as usize);
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    file.read_exact(&mut data).await?;
    Ok(data.freeze())
}
