mod chunks;
pub use chunks::{disk::PieceStore, ChunkManager, PieceClaim, PieceStatus};

mod creator;
pub use creator::{create_from_file, TorrentCreator, TorrentCreatorConfig};

mod error;
pub use error::{Error, Result};

mod hash;
pub use hash::Sha1;

mod info;
pub use info::TorrentInfo;

mod peer;
pub use peer::{PeerEntry, PeerId};

mod piece;
pub use piece::{PieceBitfield, PieceIdx};

pub mod session;
pub use session::{peer_list_channel, Session, SessionConfig, TrackerConfig, TrackerProc};

pub mod tracker;
pub use tracker::{Announce, AnnounceParams, TrackerClient};

pub mod wire;
