use std::{path::Path, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{wire, Error, PieceIdx, Result, Sha1};

/// On-disk JSON layout of a torrent descriptor.
#[derive(Debug, Serialize, Deserialize)]
struct Descriptor {
    torrent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tracker_url: Option<String>,
    file_name: String,
    file_size: u64,
    piece_size: u32,
    pieces: Vec<String>,
}

#[derive(Debug)]
struct TorrentInfoInner {
    torrent_id: Sha1,
    tracker_url: Option<String>,
    file_name: String,
    file_size: u64,
    piece_size: u32,
    pieces: Vec<Sha1>,
}

#[derive(Clone)]
pub struct TorrentInfo(Arc<TorrentInfoInner>);

impl std::fmt::Debug for TorrentInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Torrent \n\tId : {}\n\tTracker : {:?}\n\tName : {:?}\n\tSize : {}\n\tPiece size : {}\n\tPieces : {}\n",
            self.0.torrent_id,
            self.0.tracker_url,
            self.0.file_name,
            self.0.file_size,
            self.0.piece_size,
            self.0.pieces.len()
        )
    }
}

impl TorrentInfo {
    pub fn new(
        torrent_id: Sha1,
        tracker_url: Option<String>,
        file_name: String,
        file_size: u64,
        piece_size: u32,
        pieces: Vec<Sha1>,
    ) -> Result<Self> {
        if piece_size == 0 || piece_size as usize > wire::MAX_PAYLOAD_LENGTH {
            return Err(Error::Descriptor(format!(
                "piece size must be between 1 and {}, got {piece_size}",
                wire::MAX_PAYLOAD_LENGTH
            )));
        }

        let expected_pieces = file_size.div_ceil(u64::from(piece_size));
        if pieces.len() as u64 != expected_pieces {
            return Err(Error::Descriptor(format!(
                "expected {expected_pieces} pieces for {file_size} bytes, got {}",
                pieces.len()
            )));
        }
        if u32::try_from(pieces.len()).is_err() {
            return Err(Error::Descriptor("too many pieces".to_string()));
        }

        let bare_name = Path::new(&file_name)
            .file_name()
            .map(|name| name == file_name.as_str())
            .unwrap_or(false);
        if !bare_name {
            return Err(Error::Descriptor(format!(
                "file name must not contain a path: {file_name:?}"
            )));
        }

        Ok(Self(Arc::new(TorrentInfoInner {
            torrent_id,
            tracker_url,
            file_name,
            file_size,
            piece_size,
            pieces,
        })))
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let descriptor = serde_json::from_slice::<Descriptor>(buf)
            .map_err(|err| Error::Descriptor(err.to_string()))?;
        let pieces = descriptor
            .pieces
            .iter()
            .map(|piece| Sha1::from_hex(piece))
            .collect::<Result<Vec<_>>>()?;
        Self::new(
            Sha1::from_hex(&descriptor.torrent_id)?,
            descriptor.tracker_url,
            descriptor.file_name,
            descriptor.file_size,
            descriptor.piece_size,
            pieces,
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let descriptor = Descriptor {
            torrent_id: self.0.torrent_id.to_hex(),
            tracker_url: self.0.tracker_url.clone(),
            file_name: self.0.file_name.clone(),
            file_size: self.0.file_size,
            piece_size: self.0.piece_size,
            pieces: self.0.pieces.iter().map(Sha1::to_hex).collect(),
        };
        serde_json::to_vec_pretty(&descriptor).map_err(|err| Error::Descriptor(err.to_string()))
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read(path.as_ref())
            .await
            .map_err(Error::Storage)?;
        Self::decode(&content)
    }

    pub fn torrent_id(&self) -> Sha1 {
        self.0.torrent_id
    }

    pub fn tracker_url(&self) -> Option<&str> {
        self.0.tracker_url.as_deref()
    }

    pub fn file_name(&self) -> &str {
        &self.0.file_name
    }

    pub fn file_size(&self) -> u64 {
        self.0.file_size
    }

    pub fn piece_size(&self) -> u32 {
        self.0.piece_size
    }

    pub fn pieces(&self) -> &[Sha1] {
        &self.0.pieces
    }

    pub fn pieces_count(&self) -> u32 {
        self.0.pieces.len() as u32
    }

    pub fn piece_indices(&self) -> impl Iterator<Item = PieceIdx> {
        (0..self.pieces_count()).map(PieceIdx::new)
    }

    pub fn piece_hash(&self, piece_index: PieceIdx) -> Option<Sha1> {
        self.0.pieces.get(piece_index.as_usize()).copied()
    }

    pub fn piece_offset(&self, piece_index: PieceIdx) -> u64 {
        u64::from(piece_index.0) * u64::from(self.piece_size())
    }

    /// Length of the piece, the last piece may be shorter.
    pub fn piece_length_from_index(&self, piece_index: PieceIdx) -> u32 {
        let offset = self.piece_offset(piece_index);
        let remaining = self.file_size().saturating_sub(offset);
        remaining.min(u64::from(self.piece_size())) as u32
    }

    /// Width in bytes of the ordinal carried by PIECE_REQUEST.
    pub fn ordinal_width(&self) -> usize {
        crate::PieceBitfield::required_bytes(self.pieces_count())
    }
}

#[cfg(test)]
mod test_torrent_info {
    use super::*;

    const DESCRIPTOR: &str = r#"{
        "torrent_id": "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3",
        "tracker_url": "http://127.0.0.1:8080/announce",
        "file_name": "song.mp3",
        "file_size": 10,
        "piece_size": 4,
        "pieces": [
            "81fe8bfe87576c3ecb22426f8e57847382917acf",
            "3c363836cf4e16666669a25da280a1865c2d2874",
            "2d0134ed3b9de132c720fe697b532b4c232ff9fe"
        ]
    }"#;

    #[test]
    fn decode() {
        let info = TorrentInfo::decode(DESCRIPTOR.as_bytes()).unwrap();
        insta::assert_yaml_snapshot!(info.torrent_id().to_string(), @"a94a8fe5ccb19ba61c4c0873d391e987982fbbd3");
        assert_eq!(info.tracker_url(), Some("http://127.0.0.1:8080/announce"));
        insta::assert_yaml_snapshot!(info.file_name(), @"song.mp3");
        insta::assert_yaml_snapshot!(info.file_size(), @"10");
        insta::assert_yaml_snapshot!(info.piece_size(), @"4");
        insta::assert_yaml_snapshot!(info.pieces_count(), @"3");
        insta::assert_yaml_snapshot!(info.ordinal_width(), @"1");
    }

    #[test]
    fn piece_lengths() {
        let info = TorrentInfo::decode(DESCRIPTOR.as_bytes()).unwrap();
        assert_eq!(info.piece_length_from_index(PieceIdx::new(0)), 4);
        assert_eq!(info.piece_length_from_index(PieceIdx::new(1)), 4);
        assert_eq!(info.piece_length_from_index(PieceIdx::new(2)), 2);
        assert_eq!(info.piece_offset(PieceIdx::new(2)), 8);
        assert_eq!(info.piece_hash(PieceIdx::new(3)), None);
    }

    #[test]
    fn encode_decode() {
        let info = TorrentInfo::decode(DESCRIPTOR.as_bytes()).unwrap();
        let encoded = info.encode().unwrap();
        let decoded = TorrentInfo::decode(&encoded).unwrap();
        assert_eq!(decoded.torrent_id(), info.torrent_id());
        assert_eq!(decoded.pieces(), info.pieces());
        assert_eq!(decoded.tracker_url(), info.tracker_url());
    }

    #[test]
    fn rejects_invalid_descriptors() {
        let wrong_count = DESCRIPTOR.replace(r#""file_size": 10"#, r#""file_size": 13"#);
        assert!(matches!(
            TorrentInfo::decode(wrong_count.as_bytes()),
            Err(Error::Descriptor(_))
        ));

        let big_pieces = DESCRIPTOR.replace(r#""piece_size": 4"#, r#""piece_size": 70000"#);
        assert!(TorrentInfo::decode(big_pieces.as_bytes()).is_err());

        let path_name = DESCRIPTOR.replace("song.mp3", "../song.mp3");
        assert!(TorrentInfo::decode(path_name.as_bytes()).is_err());

        let bad_hash = DESCRIPTOR.replace("81fe8bfe", "zzfe8bfe");
        assert!(TorrentInfo::decode(bad_hash.as_bytes()).is_err());
    }
}
