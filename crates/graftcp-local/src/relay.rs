//! Bidirectional byte relay between a client and its upstream.
//!
//! Each direction is copied on its own task. Whichever finishes first cancels
//! the session token, which unblocks the other direction's pending read or
//! write; a peer that keeps its side open (keep-alive) would otherwise pin
//! the session forever. Both directions report back over a oneshot before
//! the sockets are released.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// How one direction of the session ended.
#[derive(Debug)]
pub struct DirectionReport {
    pub bytes: u64,
    /// `None` on clean end-of-stream.
    pub error: Option<io::Error>,
}

impl DirectionReport {
    fn lost() -> Self {
        Self {
            bytes: 0,
            error: Some(io::Error::new(io::ErrorKind::Other, "relay task vanished")),
        }
    }
}

/// Outcome of a finished relay session.
#[derive(Debug)]
pub struct RelayOutcome {
    pub client_to_upstream: DirectionReport,
    pub upstream_to_client: DirectionReport,
}

/// Relay until both directions are done, then close both connections.
pub async fn relay(client: TcpStream, upstream: TcpStream) -> RelayOutcome {
    let token = CancellationToken::new();
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let (up_tx, up_rx) = oneshot::channel();
    let (down_tx, down_rx) = oneshot::channel();

    tokio::spawn(pipe(client_read, upstream_write, token.clone(), up_tx));
    tokio::spawn(pipe(upstream_read, client_write, token.clone(), down_tx));

    // The halves are dropped inside the pipe tasks, closing the sockets.
    let client_to_upstream = up_rx.await.unwrap_or_else(|_| DirectionReport::lost());
    let upstream_to_client = down_rx.await.unwrap_or_else(|_| DirectionReport::lost());

    RelayOutcome {
        client_to_upstream,
        upstream_to_client,
    }
}

enum Step {
    Data(usize),
    Eof,
    Failed(io::Error),
    Cancelled,
}

async fn pipe<R, W>(
    mut src: R,
    mut dst: W,
    token: CancellationToken,
    done: oneshot::Sender<DirectionReport>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let error = loop {
        let step = tokio::select! {
            read = src.read(&mut buf) => match read {
                Ok(0) => Step::Eof,
                Ok(n) => Step::Data(n),
                Err(e) => Step::Failed(e),
            },
            _ = token.cancelled() => Step::Cancelled,
        };

        let n = match step {
            Step::Data(n) => n,
            Step::Eof => {
                let _ = dst.shutdown().await;
                break None;
            }
            Step::Failed(e) => break Some(e),
            Step::Cancelled => break Some(cancelled()),
        };

        let step = tokio::select! {
            written = dst.write_all(&buf[..n]) => match written {
                Ok(()) => Step::Data(n),
                Err(e) => Step::Failed(e),
            },
            _ = token.cancelled() => Step::Cancelled,
        };

        match step {
            Step::Data(n) => bytes += n as u64,
            Step::Failed(e) => break Some(e),
            Step::Eof | Step::Cancelled => break Some(cancelled()),
        }
    };

    token.cancel();
    drop(src);
    drop(dst);
    let _ = done.send(DirectionReport { bytes, error });
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "opposite direction finished")
}
