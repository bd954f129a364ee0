use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::ChunkManager;

use super::upload::UploadSession;

/// Accepts connections until cancelled, serving each one from its own task.
/// Upload sessions already running are left to finish on their own.
pub async fn run(
    listener: TcpListener,
    chunks: Arc<ChunkManager>,
    io_timeout: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(accept(stream, addr, chunks.clone(), io_timeout));
                }
                Err(err) => {
                    tracing::warn!("failed to accept connection: {err}");
                }
            },
        }
    }
    tracing::info!("listener stopped");
}

async fn accept(
    stream: TcpStream,
    addr: SocketAddr,
    chunks: Arc<ChunkManager>,
    io_timeout: Duration,
) {
    tracing::info!(addr = %addr, "accepted upload peer");
    match UploadSession::new(stream, chunks, io_timeout).run().await {
        Ok(served) => tracing::info!(addr = %addr, "upload peer left after {served} pieces"),
        Err(err) => tracing::warn!(addr = %addr, "upload session failed: {err}"),
    }
}
