use std::{sync::Arc, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    wire::{self, Message, MessageKind},
    ChunkManager, Error, PieceIdx, Result,
};

use super::{expect_message, receive, report_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadState {
    AwaitHello,
    SendHelloResponse,
    ServeLoop,
    Closed,
}

/// Serves pieces to one remote peer that connected to us.
pub struct UploadSession<S> {
    stream: S,
    chunks: Arc<ChunkManager>,
    io_timeout: Duration,
    served: u32,
}

impl<S> UploadSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, chunks: Arc<ChunkManager>, io_timeout: Duration) -> Self {
        Self {
            stream,
            chunks,
            io_timeout,
            served: 0,
        }
    }

    /// Runs until the peer disconnects or violates the protocol. Returns the
    /// number of pieces served. Protocol violations are reported to the peer
    /// with an ERROR message before the connection is dropped.
    pub async fn run(mut self) -> Result<u32> {
        match self.drive().await {
            Ok(()) => Ok(self.served),
            Err(err) => {
                report_error(&mut self.stream, &err).await;
                Err(err)
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        let mut state = UploadState::AwaitHello;
        loop {
            state = match state {
                UploadState::AwaitHello => {
                    self.await_hello().await?;
                    UploadState::SendHelloResponse
                }
                UploadState::SendHelloResponse => {
                    let bitfield = self.chunks.bitfield();
                    wire::write_message(
                        &mut self.stream,
                        &Message::hello_response(bitfield.into_vec()),
                    )
                    .await?;
                    UploadState::ServeLoop
                }
                UploadState::ServeLoop => {
                    if self.serve_next().await? {
                        UploadState::ServeLoop
                    } else {
                        UploadState::Closed
                    }
                }
                UploadState::Closed => return Ok(()),
            };
        }
    }

    async fn await_hello(&mut self) -> Result<()> {
        let message = receive(&mut self.stream, self.io_timeout).await?;
        let message = expect_message(message, MessageKind::HelloRequest)?;
        if message.payload.as_ref() != self.chunks.torrent_id().as_bytes() {
            return Err(Error::TorrentMismatch);
        }
        Ok(())
    }

    // returns false once the peer has closed the connection
    async fn serve_next(&mut self) -> Result<bool> {
        let message = match receive(&mut self.stream, self.io_timeout).await? {
            Some(message) => message,
            None => return Ok(false),
        };
        let message = expect_message(Some(message), MessageKind::PieceRequest)?;

        let width = self.chunks.info().ordinal_width();
        if message.payload.len() != width {
            return Err(Error::protocol(format!(
                "piece request must be {width} bytes, got {}",
                message.payload.len()
            )));
        }

        let ordinal = wire::decode_ordinal(&message.payload);
        let count = self.chunks.piece_count();
        let piece_idx = match u32::try_from(ordinal) {
            Ok(index) if self.chunks.lookup_by_ordinal(PieceIdx::new(index)).is_some() => {
                PieceIdx::new(index)
            }
            _ => {
                return Err(Error::OutOfRange {
                    index: ordinal,
                    count,
                })
            }
        };

        let data = self.chunks.read_piece(piece_idx).await?;
        wire::write_message(&mut self.stream, &Message::piece_response(data)).await?;
        self.served += 1;
        tracing::debug!(piece = %piece_idx, "served piece");
        Ok(true)
    }
}
