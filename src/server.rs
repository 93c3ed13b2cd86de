//! Connection listener (spec.md §3 outer loop), grounded on
//! `server/connection_loop.rs`'s accept loop: a `TcpListener` fed into a
//! `JoinSet` of per-connection tasks, with a broadcast channel carrying
//! graceful shutdown to every task in flight. TLS termination and a
//! metrics endpoint are outer-layer concerns the source's `server` module
//! also carries but SPEC_FULL.md scopes out of this crate's core engine.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::clientjob::{ClientJob, ClientJobState};
use crate::context::Context;
use crate::errors::{AcngError, Result};
use crate::http::parse_request;

const MAX_HEAD_SIZE: usize = 16 * 1024;
const BODY_BUFSIZE: usize = 64 * 1024;

/// Binds `bind_addr` and serves connections until a shutdown signal
/// arrives (SIGINT/SIGTERM on Unix).
pub async fn serve(ctx: Arc<Context>, bind_addr: &str) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await.map_err(AcngError::from)?;
    info!(addr = bind_addr, "listening");
    let (shutdown_tx, _) = broadcast::channel(1);
    run(ctx, listener, shutdown_tx).await;
    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received, shutting down"),
            _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C received, shutting down");
    }
}

/// The accept loop: spawns one task per connection, reaps finished ones,
/// and stops accepting as soon as a shutdown signal fires.
pub async fn run(ctx: Arc<Context>, listener: TcpListener, shutdown_tx: broadcast::Sender<()>) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = await_shutdown_signal() => break,

            res = listener.accept() => {
                match res {
                    Ok((socket, peer)) => {
                        let ctx = ctx.clone();
                        let mut shutdown_rx = shutdown_tx.subscribe();
                        tasks.spawn(async move {
                            tokio::select! {
                                biased;
                                _ = shutdown_rx.recv() => {}
                                result = handle_connection(ctx, socket, peer) => {
                                    if let Err(err) = result {
                                        warn!(%peer, error = %err, "connection ended with an error");
                                    }
                                }
                            }
                        });
                    }
                    Err(err) => error!(error = %err, "failed to accept connection"),
                }
            }

            Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = res {
                    if err.is_panic() {
                        error!(error = ?err, "a connection handler panicked");
                    }
                }
            }
        }
    }

    info!("shutting down, signalling in-flight connections");
    let _ = shutdown_tx.send(());
    while tasks.join_next().await.is_some() {}
    info!("all connections closed");
}

/// Serves requests on one accepted connection until the client closes it,
/// sends `Connection: close`, or a request fails after headers were
/// already sent (spec.md §4.6.4: once committed, failures must disconnect
/// rather than substitute an error page).
async fn handle_connection(ctx: Arc<Context>, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut leftover: Vec<u8> = Vec::new();

    loop {
        let Some(request) = read_request_head(&mut stream, &mut leftover).await? else {
            return Ok(());
        };

        let keep_alive_requested = request
            .headers
            .get("connection")
            .map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("keep-alive")))
            .unwrap_or(request.version == crate::http::header::HttpVersion::Http11);

        let mut job = match ClientJob::prepare(&ctx, &request, peer.to_string()).await {
            Ok(job) => job,
            Err(status) => {
                let headers = crate::http::Headers::default();
                let head = crate::http::format_response_head(
                    crate::http::header::HttpVersion::Http11,
                    &status,
                    &headers,
                );
                stream.write_all(&head).await.map_err(AcngError::from)?;
                if !keep_alive_requested {
                    return Ok(());
                }
                continue;
            }
        };

        job.wait_for_head().await;
        let cooked = job.cook_response_header();
        stream.write_all(&cooked.head_bytes).await.map_err(AcngError::from)?;

        if matches!(cooked.next_state, ClientJobState::SendData | ClientJobState::SendChunkHeader) {
            if let Err(err) = stream_body(&mut stream, &mut job).await {
                warn!(%peer, error = %err, "body streaming failed after headers were sent");
                return Err(err);
            }
        }

        if !job.keep_alive {
            return Ok(());
        }
    }
}

/// Streams the response body, chunk-encoding it if the file-item's length
/// wasn't known when headers were sent (spec.md §4.6.3).
async fn stream_body(stream: &mut TcpStream, job: &mut ClientJob) -> Result<()> {
    let chunked = job.state == ClientJobState::SendChunkHeader;
    loop {
        match job.next_body_chunk(BODY_BUFSIZE).await? {
            Some(chunk) => {
                if chunked {
                    let header = crate::http::chunked::encode_chunk_header(chunk.len());
                    stream.write_all(&header).await.map_err(AcngError::from)?;
                    stream.write_all(&chunk).await.map_err(AcngError::from)?;
                    stream.write_all(b"\r\n").await.map_err(AcngError::from)?;
                } else {
                    stream.write_all(&chunk).await.map_err(AcngError::from)?;
                }
            }
            None => {
                if chunked {
                    stream.write_all(crate::http::chunked::FINAL_CHUNK).await.map_err(AcngError::from)?;
                }
                return Ok(());
            }
        }
    }
}

/// Reads bytes off `stream` until a full request head has arrived,
/// carrying any bytes read past the terminating blank line over to the
/// next call via `leftover` (pipelined keep-alive requests). Returns
/// `Ok(None)` on a clean EOF with no partial request in flight.
async fn read_request_head(
    stream: &mut TcpStream,
    leftover: &mut Vec<u8>,
) -> Result<Option<crate::http::RequestHead>> {
    let mut buf = std::mem::take(leftover);
    let mut tmp = vec![0u8; 4096];

    loop {
        if let Some(head) = parse_request(&buf)? {
            if let Some(consumed) = header_block_len(&buf) {
                *leftover = buf[consumed..].to_vec();
            }
            return Ok(Some(head));
        }

        if buf.len() > MAX_HEAD_SIZE {
            return Err(AcngError::MalformedHttp("request head exceeded size limit".into()));
        }

        let n = stream.read(&mut tmp).await.map_err(AcngError::from)?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(AcngError::MalformedHttp("connection closed mid-request".into()));
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

fn header_block_len(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4).or_else(|| {
        buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2)
    })
}
