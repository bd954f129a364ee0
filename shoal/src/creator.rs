use std::path::Path;

use tokio::io::AsyncReadExt as _;

use crate::{Error, Result, Sha1, TorrentInfo};

const DEFAULT_PIECE_SIZE: u32 = 16 * 1024;

#[derive(Debug, Default, Clone)]
pub struct TorrentCreatorConfig {
    pub file_name: Option<String>,
    pub tracker_url: Option<String>,
    pub piece_size: Option<u32>,
}

/// Splits data into pieces and hashes them as it is pushed.
#[derive(Debug)]
pub struct TorrentCreator {
    config: TorrentCreatorConfig,
    piece_size: u32,
    pieces: Vec<Sha1>,
    length: u64,
    buffer: Vec<u8>,
}

impl TorrentCreator {
    pub fn new(config: TorrentCreatorConfig) -> Self {
        let piece_size = config.piece_size.unwrap_or(DEFAULT_PIECE_SIZE);
        Self {
            config,
            piece_size,
            pieces: Default::default(),
            length: 0,
            buffer: Default::default(),
        }
    }

    pub fn push_data(&mut self, data: &[u8]) {
        self.length += data.len() as u64;
        self.buffer.extend_from_slice(data);

        let piece_size = self.piece_size as usize;
        if piece_size == 0 {
            return;
        }
        while self.buffer.len() >= piece_size {
            self.pieces.push(Sha1::hash(&self.buffer[..piece_size]));
            self.buffer.drain(..piece_size);
        }
    }

    /// The torrent id is the digest of the concatenated piece digests.
    pub fn finish(mut self) -> Result<TorrentInfo> {
        if !self.buffer.is_empty() {
            self.pieces.push(Sha1::hash(&self.buffer));
        }

        let file_name = self
            .config
            .file_name
            .ok_or_else(|| Error::Descriptor("missing file name".to_string()))?;
        let mut concatenated = Vec::with_capacity(self.pieces.len() * crate::hash::SHA1_LENGTH);
        for piece in &self.pieces {
            concatenated.extend_from_slice(piece.as_bytes());
        }

        TorrentInfo::new(
            Sha1::hash(&concatenated),
            self.config.tracker_url,
            file_name,
            self.length,
            self.piece_size,
            self.pieces,
        )
    }
}

/// Builds a descriptor for the file at `path`, naming it after the file unless
/// the config says otherwise.
pub async fn create_from_file(
    path: impl AsRef<Path>,
    mut config: TorrentCreatorConfig,
) -> Result<TorrentInfo> {
    let path = path.as_ref();
    if config.file_name.is_none() {
        config.file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
    }

    let mut creator = TorrentCreator::new(config);
    let mut file = tokio::fs::File::open(path).await.map_err(Error::Storage)?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(Error::Storage)?;
        if n == 0 {
            break;
        }
        creator.push_data(&buf[..n]);
    }
    creator.finish()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::PieceIdx;

    fn config(piece_size: u32) -> TorrentCreatorConfig {
        TorrentCreatorConfig {
            file_name: Some("data.bin".to_string()),
            tracker_url: None,
            piece_size: Some(piece_size),
        }
    }

    #[test]
    fn pieces_from_chunks() {
        let data = b"0123456789";
        let mut creator = TorrentCreator::new(config(4));
        creator.push_data(&data[..3]);
        creator.push_data(&data[3..]);
        let info = creator.finish().unwrap();

        assert_eq!(info.pieces_count(), 3);
        assert_eq!(info.file_size(), 10);
        assert_eq!(info.piece_hash(PieceIdx::new(0)), Some(Sha1::hash(b"0123")));
        assert_eq!(info.piece_hash(PieceIdx::new(1)), Some(Sha1::hash(b"4567")));
        assert_eq!(info.piece_hash(PieceIdx::new(2)), Some(Sha1::hash(b"89")));
    }

    #[test]
    fn exact_multiple_has_no_trailing_piece() {
        let mut creator = TorrentCreator::new(config(5));
        creator.push_data(b"0123456789");
        let info = creator.finish().unwrap();
        assert_eq!(info.pieces_count(), 2);
        assert_eq!(info.piece_length_from_index(PieceIdx::new(1)), 5);
    }

    #[test]
    fn torrent_id_depends_on_content() {
        let mut a = TorrentCreator::new(config(4));
        a.push_data(b"aaaa");
        let mut b = TorrentCreator::new(config(4));
        b.push_data(b"bbbb");
        assert_ne!(
            a.finish().unwrap().torrent_id(),
            b.finish().unwrap().torrent_id()
        );
    }

    #[tokio::test]
    async fn from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mkv");
        tokio::fs::write(&path, vec![7u8; 100]).await.unwrap();

        let info = create_from_file(
            &path,
            TorrentCreatorConfig {
                piece_size: Some(30),
                tracker_url: Some("http://tracker".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(info.file_name(), "movie.mkv");
        assert_eq!(info.pieces_count(), 4);
        assert_eq!(info.tracker_url(), Some("http://tracker"));
    }
}
