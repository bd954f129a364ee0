use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::{
    wire::{self, Message, MessageKind},
    ChunkManager, Error, PieceBitfield, PieceClaim, Result,
};

use super::{expect_message, receive, report_error};

#[derive(Debug)]
enum DownloadState {
    SendHello,
    AwaitHelloResponse,
    RequestLoop(PieceBitfield),
    Closed,
}

/// Connects to `addr` and downloads every piece the peer has that we are
/// missing. Returns the number of pieces downloaded.
pub async fn download(
    addr: SocketAddr,
    chunks: Arc<ChunkManager>,
    connect_timeout: Duration,
    io_timeout: Duration,
) -> Result<u32> {
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(stream) => stream?,
        Err(_) => return Err(Error::Timeout),
    };
    tracing::debug!(addr = %addr, "connected to peer");
    DownloadSession::new(stream, chunks, io_timeout).run().await
}

/// Fetches pieces from one remote peer over an established connection.
pub struct DownloadSession<S> {
    stream: S,
    chunks: Arc<ChunkManager>,
    io_timeout: Duration,
    downloaded: u32,
}

impl<S> DownloadSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, chunks: Arc<ChunkManager>, io_timeout: Duration) -> Self {
        Self {
            stream,
            chunks,
            io_timeout,
            downloaded: 0,
        }
    }

    /// Runs until the peer has nothing left that we need. Any piece claimed
    /// when an error occurs is released before the error is reported to the
    /// peer.
    pub async fn run(mut self) -> Result<u32> {
        match self.drive().await {
            Ok(()) => Ok(self.downloaded),
            Err(err) => {
                report_error(&mut self.stream, &err).await;
                Err(err)
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        let mut state = DownloadState::SendHello;
        loop {
            state = match state {
                DownloadState::SendHello => {
                    let hello = Message::hello_request(self.chunks.torrent_id());
                    wire::write_message(&mut self.stream, &hello).await?;
                    DownloadState::AwaitHelloResponse
                }
                DownloadState::AwaitHelloResponse => {
                    DownloadState::RequestLoop(self.await_hello_response().await?)
                }
                DownloadState::RequestLoop(peer_bitfield) => {
                    match self.chunks.claim_next_missing(&peer_bitfield) {
                        Some(claim) => {
                            self.fetch(claim).await?;
                            DownloadState::RequestLoop(peer_bitfield)
                        }
                        None => DownloadState::Closed,
                    }
                }
                DownloadState::Closed => return Ok(()),
            };
        }
    }

    async fn await_hello_response(&mut self) -> Result<PieceBitfield> {
        let message = receive(&mut self.stream, self.io_timeout).await?;
        let message = expect_message(message, MessageKind::HelloResponse)?;
        let count = self.chunks.piece_count();
        let bitfield = PieceBitfield::from_bytes(&message.payload, count).ok_or_else(|| {
            Error::protocol(format!(
                "bitfield must be {} bytes, got {}",
                PieceBitfield::required_bytes(count),
                message.payload.len()
            ))
        })?;
        tracing::debug!("peer advertises {}/{count} pieces", bitfield.num_set());
        Ok(bitfield)
    }

    // the claim is released by its drop if anything below fails
    async fn fetch(&mut self, claim: PieceClaim) -> Result<()> {
        let width = self.chunks.info().ordinal_width();
        let request = Message::piece_request(claim.index(), width)?;
        wire::write_message(&mut self.stream, &request).await?;

        let message = match receive(&mut self.stream, self.io_timeout).await? {
            Some(message) => message,
            None => return Err(Error::end_of_stream()),
        };
        let message = expect_message(Some(message), MessageKind::PieceResponse)?;
        let piece_idx = claim.index();
        claim.commit(message.payload).await?;
        self.downloaded += 1;

        let (available, total) = self.chunks.progress();
        tracing::info!(piece = %piece_idx, "downloaded piece ({available}/{total})");
        Ok(())
    }
}
